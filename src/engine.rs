//! The per-torrent engine: one event-loop task owning all swarm state.
//!
//! Everything mutable about a torrent — pieces, peers, handshakes,
//! downloads, the choke schedule — lives inside a single task and is
//! mutated one event at a time, so no lock ever guards torrent state.
//! The [`Engine`] handle talks to that task over channels.

mod addr_list;
mod allocator;
mod announcer;
mod choker;
mod downloader;
mod info_downloader;
mod messages;
mod peers;
mod picker;
mod piece;
mod state;
mod verifier;
mod writer;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::metainfo::{InfoHash, MagnetLink, Metainfo, MetainfoError};
use crate::storage::StorageError;
use state::{Command, EngineState};

/// Errors fatal to a torrent, surfaced on the error channel.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("file allocation failed: {0}")]
    Allocator(#[source] StorageError),

    #[error("startup hash check failed: {0}")]
    Verifier(#[source] StorageError),

    #[error("storage failure: {0}")]
    Storage(#[source] StorageError),

    #[error("downloaded info dictionary is invalid: {0}")]
    InvalidInfo(#[source] MetainfoError),

    #[error("resume data failure: {0}")]
    Resume(#[source] std::io::Error),

    #[error("cannot listen for peers: {0}")]
    Listen(#[source] std::io::Error),

    /// The torrent was stopped by request.
    #[error("torrent stopped")]
    Stopped,
}

/// Where the torrent currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Downloading,
    Seeding,
}

/// A point-in-time snapshot of progress.
///
/// Byte counts are `None` until the info dictionary and bitfield are
/// both known; completion is an exact counter, never derived from the
/// popcount of the bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub status: Status,
    pub bytes_total: Option<u64>,
    pub bytes_complete: Option<u64>,
    pub bytes_incomplete: Option<u64>,
}

/// Handle to one torrent's engine task.
///
/// Construct with an info dictionary ([`Engine::from_metainfo`]) or
/// just an info hash ([`Engine::from_magnet`]), then [`start`].
/// Dropping the handle closes the engine.
///
/// [`start`]: Engine::start
pub struct Engine {
    cmd_tx: mpsc::Sender<Command>,
    error_rx: watch::Receiver<Option<Arc<EngineError>>>,
    completed_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl Engine {
    /// Creates an engine for a fully known torrent.
    pub fn from_metainfo(metainfo: Metainfo, dest: impl Into<PathBuf>, config: Config) -> Engine {
        let trackers = metainfo.trackers();
        let info_hash = metainfo.info.hash;
        Self::spawn(config, info_hash, Some(metainfo.info), trackers, dest.into())
    }

    /// Creates an engine from a magnet link; the info dictionary is
    /// fetched from peers after `start`.
    pub fn from_magnet(link: &MagnetLink, dest: impl Into<PathBuf>, config: Config) -> Engine {
        Self::spawn(
            config,
            link.info_hash,
            None,
            link.trackers.clone(),
            dest.into(),
        )
    }

    /// Creates an engine from a bare info hash plus tracker URLs.
    pub fn from_info_hash(
        info_hash: InfoHash,
        trackers: Vec<String>,
        dest: impl Into<PathBuf>,
        config: Config,
    ) -> Engine {
        Self::spawn(config, info_hash, None, trackers, dest.into())
    }

    fn spawn(
        config: Config,
        info_hash: InfoHash,
        info: Option<crate::metainfo::Info>,
        trackers: Vec<String>,
        dest: PathBuf,
    ) -> Engine {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (error_tx, error_rx) = watch::channel(None);
        let (completed_tx, completed_rx) = watch::channel(false);

        let state = EngineState::new(
            config,
            info_hash,
            info,
            trackers,
            dest,
            cmd_rx,
            error_tx,
            completed_tx,
        );
        let task = tokio::spawn(state.run());

        Engine {
            cmd_tx,
            error_rx,
            completed_rx,
            task,
        }
    }

    /// Begins (or resumes) downloading and seeding.
    pub async fn start(&self) {
        let _ = self.cmd_tx.send(Command::Start).await;
    }

    /// Stops all transfers and releases storage; the engine can be
    /// started again.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }

    /// Current progress snapshot.
    pub async fn stats(&self) -> Stats {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Stats(tx)).await;
        rx.await.unwrap_or(Stats {
            status: Status::Stopped,
            bytes_total: None,
            bytes_complete: None,
            bytes_incomplete: None,
        })
    }

    /// The bound peer listener address, once storage is ready.
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::ListenAddr(tx)).await;
        rx.await.ok().flatten()
    }

    /// Queues peer addresses as if a tracker had announced them.
    pub async fn add_peers(&self, peers: Vec<SocketAddr>) {
        let _ = self.cmd_tx.send(Command::AddPeers(peers)).await;
    }

    /// Watches for a fatal torrent error.
    pub fn notify_error(&self) -> watch::Receiver<Option<Arc<EngineError>>> {
        self.error_rx.clone()
    }

    /// Watches the one-time completion transition.
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.completed_rx.clone()
    }

    /// Shuts the engine down and waits for the event loop to exit.
    pub async fn close(self) {
        let _ = self.cmd_tx.send(Command::Close).await;
        let _ = self.task.await;
    }
}
