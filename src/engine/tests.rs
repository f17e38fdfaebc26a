use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use super::peers::Peer;
use super::state::{Command, EngineState};
use super::writer::WriteResponse;
use super::*;
use crate::bencode::{encode, Value};
use crate::peer::{Bitfield, Message, PeerCommand, PeerId, PeerKey};

const PIECE_LEN: usize = 16384;
const TOTAL_LEN: usize = 40000; // two full pieces plus a short third

fn make_torrent() -> (Metainfo, Vec<u8>) {
    let content: Vec<u8> = (0..TOTAL_LEN).map(|i| (i % 251) as u8).collect();
    let mut hashes = Vec::new();
    for chunk in content.chunks(PIECE_LEN) {
        hashes.extend_from_slice(&Sha1::digest(chunk));
    }

    let mut info = BTreeMap::new();
    info.insert(Bytes::from_static(b"length"), Value::Int(TOTAL_LEN as i64));
    info.insert(Bytes::from_static(b"name"), Value::str("payload.bin"));
    info.insert(
        Bytes::from_static(b"piece length"),
        Value::Int(PIECE_LEN as i64),
    );
    info.insert(Bytes::from_static(b"pieces"), Value::Bytes(Bytes::from(hashes)));
    let mut root = BTreeMap::new();
    root.insert(Bytes::from_static(b"info"), Value::Dict(info));

    let bytes = encode(&Value::Dict(root));
    (Metainfo::from_bytes(&bytes).unwrap(), content)
}

fn test_state(seed: u64) -> (EngineState, mpsc::Sender<Command>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let (error_tx, _error_rx) = watch::channel(None);
    let (completed_tx, _completed_rx) = watch::channel(false);
    let config = Config {
        rng_seed: Some(seed),
        ..Config::default()
    };
    let state = EngineState::new(
        config,
        InfoHash([7; 20]),
        None,
        Vec::new(),
        std::env::temp_dir(),
        cmd_rx,
        error_tx,
        completed_tx,
    );
    (state, cmd_tx)
}

fn add_fake_peer(state: &mut EngineState, n: u64) -> mpsc::Receiver<PeerCommand> {
    let (peer, rx) = Peer::fake(PeerKey(n), PeerId::from_bytes([n as u8 + 1; 20]));
    state.peer_ids.insert(peer.id, peer.key);
    state.peers.insert(peer.key, peer);
    rx
}

fn sent_messages(rx: &mut mpsc::Receiver<PeerCommand>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        if let PeerCommand::Send(message) = cmd {
            out.push(message);
        }
    }
    out
}

// ---- choker ------------------------------------------------------------

#[tokio::test]
async fn unchoke_tick_keeps_top_three_uploaders() {
    let (mut state, _cmd) = test_state(1);
    state.running = true;
    let mut rxs = Vec::new();
    for n in 0..6 {
        rxs.push(add_fake_peer(&mut state, n));
    }
    for n in 0..6u64 {
        state
            .peers
            .get_mut(&PeerKey(n))
            .unwrap()
            .bytes_in_choke_period = n * 1000;
    }

    state.tick_unchoke();

    let mut unchoked: Vec<u64> = state
        .peers
        .values()
        .filter(|p| !p.am_choking)
        .map(|p| p.key.0)
        .collect();
    unchoked.sort_unstable();
    assert_eq!(unchoked, vec![3, 4, 5]);
    assert!(state
        .peers
        .values()
        .all(|p| p.bytes_in_choke_period == 0));

    for (n, rx) in rxs.iter_mut().enumerate() {
        let messages = sent_messages(rx);
        if n >= 3 {
            assert_eq!(messages, vec![Message::Unchoke], "winner {n}");
        } else {
            // Already choked; no transition, no message.
            assert!(messages.is_empty(), "loser {n}");
        }
    }
}

#[tokio::test]
async fn unchoke_set_never_exceeds_eligible_peers() {
    let (mut state, _cmd) = test_state(2);
    state.running = true;
    let _rx_a = add_fake_peer(&mut state, 0);
    let _rx_b = add_fake_peer(&mut state, 1);

    state.tick_unchoke();

    let unchoked = state.peers.values().filter(|p| !p.am_choking).count();
    assert_eq!(unchoked, 2);
}

#[tokio::test]
async fn optimistic_tick_rotates_a_random_choked_peer() {
    let (mut state, _cmd) = test_state(42);
    state.running = true;
    let mut rxs = Vec::new();
    for n in 0..10 {
        rxs.push(add_fake_peer(&mut state, n));
    }

    state.tick_optimistic();
    let first = state.optimistic.expect("one peer picked");
    let flagged: Vec<u64> = state
        .peers
        .values()
        .filter(|p| p.optimistic_unchoked)
        .map(|p| p.key.0)
        .collect();
    assert_eq!(flagged, vec![first.0]);
    assert!(!state.peers[&first].am_choking);

    state.tick_optimistic();
    let second = state.optimistic.expect("another peer picked");
    assert_ne!(second, first, "previous pick is excluded from the pool");
    assert!(state.peers[&first].am_choking, "previous pick choked again");
    assert!(!state.peers[&first].optimistic_unchoked);
    assert!(state.peers[&second].optimistic_unchoked);
}

// ---- piece completion --------------------------------------------------

#[tokio::test]
async fn completed_piece_announces_have_to_every_peer_once() {
    let (meta, _content) = make_torrent();
    let (mut state, _cmd) = test_state(3);
    state.adopt_info(meta.info);
    state.bitfield = Some(Bitfield::new(3));
    state.running = true;

    let mut rx_a = add_fake_peer(&mut state, 0);
    let mut rx_b = add_fake_peer(&mut state, 1);

    state
        .on_write_response(WriteResponse {
            index: 0,
            source: PeerKey(0),
            hash_ok: true,
            result: Ok(()),
        })
        .await;

    assert!(state.bitfield.as_ref().unwrap().test(0));
    assert_eq!(state.bytes_complete, PIECE_LEN as u64);
    for rx in [&mut rx_a, &mut rx_b] {
        let haves: Vec<Message> = sent_messages(rx)
            .into_iter()
            .filter(|m| matches!(m, Message::Have { .. }))
            .collect();
        assert_eq!(haves, vec![Message::Have { index: 0 }]);
    }

    // A duplicate response for the same piece announces nothing.
    state
        .on_write_response(WriteResponse {
            index: 0,
            source: PeerKey(0),
            hash_ok: true,
            result: Ok(()),
        })
        .await;
    assert!(sent_messages(&mut rx_a).is_empty());
    assert_eq!(state.bytes_complete, PIECE_LEN as u64);
}

#[tokio::test]
async fn repeated_hash_mismatches_disconnect_the_peer() {
    let (meta, _content) = make_torrent();
    let (mut state, _cmd) = test_state(4);
    state.adopt_info(meta.info);
    state.bitfield = Some(Bitfield::new(3));
    state.running = true;
    let _rx = add_fake_peer(&mut state, 0);

    for round in 0..3 {
        assert!(
            state.peers.contains_key(&PeerKey(0)),
            "still connected before round {round}"
        );
        state
            .on_write_response(WriteResponse {
                index: 0,
                source: PeerKey(0),
                hash_ok: false,
                result: Ok(()),
            })
            .await;
    }

    assert!(
        state.peers.is_empty(),
        "three corrupt pieces get a peer dropped"
    );
    assert!(!state.bitfield.as_ref().unwrap().test(0));
}

// ---- pre-info message handling -----------------------------------------

#[tokio::test]
async fn early_inventory_messages_park_until_info_arrives() {
    let (meta, _content) = make_torrent();
    let (mut state, _cmd) = test_state(5);
    state.running = true;
    let _rx = add_fake_peer(&mut state, 0);

    state.handle_message(PeerKey(0), Message::Have { index: 1 }).await;
    state.handle_message(PeerKey(0), Message::HaveAll).await;
    assert_eq!(state.peers[&PeerKey(0)].parked.len(), 2);

    state.adopt_info(meta.info);
    state.bitfield = Some(Bitfield::new(3));
    state.process_parked().await;

    assert!(state.pieces[1].having.contains(&PeerKey(0)));
    assert!(state.pieces[2].having.contains(&PeerKey(0)));
    assert!(state.peers[&PeerKey(0)].parked.is_empty());
}

#[tokio::test]
async fn piece_before_info_is_a_protocol_violation() {
    let (mut state, _cmd) = test_state(6);
    state.running = true;
    let _rx = add_fake_peer(&mut state, 0);

    state
        .handle_message(
            PeerKey(0),
            Message::Piece {
                index: 0,
                begin: 0,
                data: Bytes::from_static(b"data"),
            },
        )
        .await;

    assert!(state.peers.is_empty(), "peer closed for piece before info");
}

// ---- duplicate identities ----------------------------------------------

#[tokio::test]
async fn duplicate_peer_ids_are_rejected() {
    use crate::handshake::Established;
    use crate::mse::{Cipher, SecureStream};
    use crate::peer::Extensions;

    let (mut state, _cmd) = test_state(7);
    state.running = true;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut established = Vec::new();
    for _ in 0..2 {
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let _server = listener.accept().await.unwrap();
        established.push(Established {
            stream: SecureStream::plain(client),
            peer_id: PeerId::from_bytes([9; 20]),
            extensions: Extensions::ours(),
            cipher: Cipher::Plain,
        });
    }

    let first_addr = "127.0.0.1:4001".parse().unwrap();
    let second_addr = "127.0.0.1:4002".parse().unwrap();
    state.start_peer(established.remove(0), first_addr, super::peers::PeerSource::Outgoing);
    state.start_peer(established.remove(0), second_addr, super::peers::PeerSource::Outgoing);

    assert_eq!(state.peers.len(), 1, "second identity refused");
    assert_eq!(state.peer_ids.len(), 1);
}

// ---- end-to-end --------------------------------------------------------

async fn wait_listen_addr(engine: &Engine) -> std::net::SocketAddr {
    timeout(Duration::from_secs(30), async {
        loop {
            if let Some(addr) = engine.listen_addr().await {
                return std::net::SocketAddr::new("127.0.0.1".parse().unwrap(), addr.port());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("listener comes up")
}

fn quiet_config() -> Config {
    Config {
        rng_seed: Some(99),
        ..Config::default()
    }
}

#[tokio::test]
async fn cold_start_download_reaches_seeding() {
    let (meta, content) = make_torrent();

    let seed_dir = TempDir::new().unwrap();
    std::fs::write(seed_dir.path().join("payload.bin"), &content).unwrap();
    let seeder = Engine::from_metainfo(meta.clone(), seed_dir.path(), quiet_config());
    seeder.start().await;
    let seeder_addr = wait_listen_addr(&seeder).await;

    // The seeder hash-checks its files and ends up seeding.
    timeout(Duration::from_secs(30), async {
        loop {
            if seeder.stats().await.status == Status::Seeding {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("seeder verifies existing data");

    let leech_dir = TempDir::new().unwrap();
    let leecher = Engine::from_metainfo(meta, leech_dir.path(), quiet_config());
    leecher.start().await;
    leecher.add_peers(vec![seeder_addr]).await;

    let mut completion = leecher.completion();
    timeout(Duration::from_secs(60), completion.wait_for(|done| *done))
        .await
        .expect("download finishes")
        .expect("engine alive");

    let stats = leecher.stats().await;
    assert_eq!(stats.status, Status::Seeding);
    assert_eq!(stats.bytes_total, Some(TOTAL_LEN as u64));
    assert_eq!(stats.bytes_complete, Some(TOTAL_LEN as u64));
    assert_eq!(stats.bytes_incomplete, Some(0));

    let downloaded = std::fs::read(leech_dir.path().join("payload.bin")).unwrap();
    assert_eq!(downloaded, content);

    leecher.close().await;
    seeder.close().await;
}

#[tokio::test]
async fn magnet_start_fetches_info_then_downloads() {
    let (meta, content) = make_torrent();
    let info_hash = meta.info.hash;

    let seed_dir = TempDir::new().unwrap();
    std::fs::write(seed_dir.path().join("payload.bin"), &content).unwrap();
    let seeder = Engine::from_metainfo(meta, seed_dir.path(), quiet_config());
    seeder.start().await;
    let seeder_addr = wait_listen_addr(&seeder).await;

    let leech_dir = TempDir::new().unwrap();
    let leecher = Engine::from_info_hash(info_hash, Vec::new(), leech_dir.path(), quiet_config());

    // Nothing is known yet, not even the size.
    let stats = leecher.stats().await;
    assert_eq!(stats.bytes_total, None);
    assert_eq!(stats.bytes_complete, None);

    leecher.start().await;
    leecher.add_peers(vec![seeder_addr]).await;

    let mut completion = leecher.completion();
    timeout(Duration::from_secs(60), completion.wait_for(|done| *done))
        .await
        .expect("metadata and data arrive")
        .expect("engine alive");

    let stats = leecher.stats().await;
    assert_eq!(stats.status, Status::Seeding);
    assert_eq!(stats.bytes_total, Some(TOTAL_LEN as u64));
    assert_eq!(
        std::fs::read(leech_dir.path().join("payload.bin")).unwrap(),
        content
    );

    leecher.close().await;
    seeder.close().await;
}

#[tokio::test]
async fn stop_halts_the_torrent() {
    let (meta, _content) = make_torrent();
    let dir = TempDir::new().unwrap();
    let engine = Engine::from_metainfo(meta, dir.path(), quiet_config());

    engine.start().await;
    timeout(Duration::from_secs(30), async {
        loop {
            if engine.stats().await.status != Status::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("engine starts");

    engine.stop().await;
    let stats = engine.stats().await;
    assert_eq!(stats.status, Status::Stopped);

    let error = engine.notify_error().borrow().clone();
    assert!(matches!(error.as_deref(), Some(EngineError::Stopped)));

    engine.close().await;
}
