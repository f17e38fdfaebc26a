//! downpour - a BitTorrent client engine
//!
//! One [`Engine`] drives one torrent: it discovers peers through its
//! trackers, negotiates plain or MSE-encrypted connections, fetches the
//! metadata when starting from a magnet link, downloads and verifies
//! every piece, persists them, and serves the swarm in return.
//!
//! All per-torrent state lives in a single event-loop task; peers,
//! handshakes, trackers and disk I/O run as independent tasks that talk
//! to it over channels.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`metainfo`] - torrent files, info dictionaries, magnet links
//! - [`peer`] - BEP-3/6/10 peer wire protocol and per-peer I/O
//! - [`mse`] - message stream encryption handshake
//! - [`handshake`] - BitTorrent handshake over plain or encrypted streams
//! - [`tracker`] - announce contract and HTTP transport
//! - [`storage`] - offset-addressed multi-file disk store
//! - [`resume`] - persisted info and bitfield across runs
//! - [`engine`] - the per-torrent event loop
//!
//! # Example
//!
//! ```no_run
//! use downpour::{Config, Engine, Metainfo};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metainfo = Metainfo::load("example.torrent")?;
//! let engine = Engine::from_metainfo(metainfo, "downloads", Config::default());
//! engine.start().await;
//!
//! let mut completion = engine.completion();
//! completion.wait_for(|done| *done).await?;
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

pub mod bencode;
pub mod config;
pub mod engine;
pub mod handshake;
pub mod metainfo;
pub mod mse;
pub mod peer;
pub mod resume;
pub mod storage;
pub mod tracker;

mod pool;

pub use config::Config;
pub use engine::{Engine, EngineError, Stats, Status};
pub use metainfo::{Info, InfoHash, MagnetLink, Metainfo, MetainfoError};
pub use mse::Cipher;
pub use peer::{Bitfield, Message, PeerId};
