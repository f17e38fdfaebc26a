use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tracing::{debug, trace, warn};

use super::addr_list::AddrList;
use super::allocator::{run_allocator, AllocatorResult};
use super::announcer::{run_announcer, AnnouncerRequest};
use super::downloader::{DownloadError, DownloadParams, PieceDownload, PieceOutcome};
use super::info_downloader::{InfoDownload, InfoOutcome};
use super::peers::{Peer, PeerSource};
use super::picker;
use super::piece::PieceState;
use super::verifier::{run_verifier, PieceSpec, VerifierResult};
use super::writer::{run_writer, WriteRequest, WriteResponse};
use super::{EngineError, Stats, Status};
use crate::config::Config;
use crate::handshake::{self, HandshakeConfig, IncomingResult, OutgoingResult};
use crate::metainfo::{Info, InfoHash};
use crate::peer::{Bitfield, PeerEvent, PeerId, PeerKey};
use crate::pool::BufferPool;
use crate::resume::Resume;
use crate::storage::FileStore;
use crate::tracker::Transfer;

/// Control-surface commands from the public handle.
pub(super) enum Command {
    Start,
    Stop,
    Stats(oneshot::Sender<Stats>),
    ListenAddr(oneshot::Sender<Option<SocketAddr>>),
    AddPeers(Vec<SocketAddr>),
    Close,
}

/// Every channel the engine selects over, plus the sender clones handed
/// to freshly spawned sub-tasks.
pub(super) struct Channels {
    pub cmd_rx: mpsc::Receiver<Command>,

    pub alloc_tx: mpsc::Sender<AllocatorResult>,
    pub alloc_rx: mpsc::Receiver<AllocatorResult>,
    pub alloc_progress_tx: mpsc::Sender<usize>,
    pub alloc_progress_rx: mpsc::Receiver<usize>,

    pub verify_tx: mpsc::Sender<VerifierResult>,
    pub verify_rx: mpsc::Receiver<VerifierResult>,
    pub verify_progress_tx: mpsc::Sender<u32>,
    pub verify_progress_rx: mpsc::Receiver<u32>,

    pub addrs_tx: mpsc::Sender<Vec<SocketAddr>>,
    pub addrs_rx: mpsc::Receiver<Vec<SocketAddr>>,
    pub announce_req_tx: mpsc::Sender<AnnouncerRequest>,
    pub announce_req_rx: mpsc::Receiver<AnnouncerRequest>,

    pub conn_tx: mpsc::Sender<TcpStream>,
    pub conn_rx: mpsc::Receiver<TcpStream>,
    pub in_hs_tx: mpsc::Sender<IncomingResult>,
    pub in_hs_rx: mpsc::Receiver<IncomingResult>,
    pub out_hs_tx: mpsc::Sender<OutgoingResult>,
    pub out_hs_rx: mpsc::Receiver<OutgoingResult>,

    pub piece_out_tx: mpsc::Sender<PieceOutcome>,
    pub piece_out_rx: mpsc::Receiver<PieceOutcome>,
    pub info_out_tx: mpsc::Sender<InfoOutcome>,
    pub info_out_rx: mpsc::Receiver<InfoOutcome>,

    pub write_resp_tx: mpsc::Sender<WriteResponse>,
    pub write_resp_rx: mpsc::Receiver<WriteResponse>,

    pub disconnect_tx: mpsc::Sender<PeerKey>,
    pub disconnect_rx: mpsc::Receiver<PeerKey>,
    pub events_tx: mpsc::Sender<PeerEvent>,
    pub events_rx: mpsc::Receiver<PeerEvent>,
}

impl Channels {
    pub fn new(cmd_rx: mpsc::Receiver<Command>) -> Self {
        let (alloc_tx, alloc_rx) = mpsc::channel(1);
        let (alloc_progress_tx, alloc_progress_rx) = mpsc::channel(16);
        let (verify_tx, verify_rx) = mpsc::channel(1);
        let (verify_progress_tx, verify_progress_rx) = mpsc::channel(64);
        let (addrs_tx, addrs_rx) = mpsc::channel(1);
        let (announce_req_tx, announce_req_rx) = mpsc::channel(8);
        let (conn_tx, conn_rx) = mpsc::channel(16);
        let (in_hs_tx, in_hs_rx) = mpsc::channel(16);
        let (out_hs_tx, out_hs_rx) = mpsc::channel(16);
        let (piece_out_tx, piece_out_rx) = mpsc::channel(16);
        let (info_out_tx, info_out_rx) = mpsc::channel(4);
        let (write_resp_tx, write_resp_rx) = mpsc::channel(8);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            cmd_rx,
            alloc_tx,
            alloc_rx,
            alloc_progress_tx,
            alloc_progress_rx,
            verify_tx,
            verify_rx,
            verify_progress_tx,
            verify_progress_rx,
            addrs_tx,
            addrs_rx,
            announce_req_tx,
            announce_req_rx,
            conn_tx,
            conn_rx,
            in_hs_tx,
            in_hs_rx,
            out_hs_tx,
            out_hs_rx,
            piece_out_tx,
            piece_out_rx,
            info_out_tx,
            info_out_rx,
            write_resp_tx,
            write_resp_rx,
            disconnect_tx,
            disconnect_rx,
            events_tx,
            events_rx,
        }
    }
}

/// All mutable state of one torrent, owned by its event-loop task.
///
/// Every mutation happens inside `run`, one event at a time; sub-tasks
/// only ever talk to this through the channels above.
pub(super) struct EngineState {
    pub(super) config: Config,
    pub(super) info_hash: InfoHash,
    pub(super) local_id: PeerId,
    pub(super) trackers: Vec<String>,
    pub(super) dest: PathBuf,
    pub(super) resume: Option<Arc<dyn Resume>>,

    pub(super) info: Option<Arc<Info>>,
    pub(super) bitfield: Option<Bitfield>,
    pub(super) pieces: Vec<PieceState>,
    pub(super) store: Option<Arc<FileStore>>,

    pub(super) running: bool,
    pub(super) completed: bool,
    pub(super) bytes_complete: u64,
    pub(super) bytes_uploaded: u64,
    pub(super) bytes_downloaded: u64,

    pub(super) next_key: u64,
    pub(super) peers: HashMap<PeerKey, Peer>,
    pub(super) peer_ids: HashMap<PeerId, PeerKey>,
    pub(super) connected_ips: HashSet<IpAddr>,
    pub(super) addr_list: AddrList,
    pub(super) incoming_handshakers: HashMap<SocketAddr, JoinHandle<()>>,
    pub(super) outgoing_handshakers: HashMap<SocketAddr, JoinHandle<()>>,
    pub(super) piece_downloads: HashMap<PeerKey, PieceDownload>,
    pub(super) info_downloads: HashMap<PeerKey, InfoDownload>,
    pub(super) optimistic: Option<PeerKey>,

    pub(super) listener_addr: Option<SocketAddr>,
    pub(super) acceptor: Option<JoinHandle<()>>,
    pub(super) allocator: Option<JoinHandle<()>>,
    pub(super) verifier: Option<JoinHandle<()>>,
    pub(super) announcers: Vec<JoinHandle<()>>,
    pub(super) writer: Option<JoinHandle<()>>,
    pub(super) write_tx: Option<mpsc::Sender<WriteRequest>>,

    pub(super) rng: StdRng,
    pub(super) error_tx: watch::Sender<Option<Arc<EngineError>>>,
    pub(super) completed_tx: watch::Sender<bool>,
    pub(super) announcer_stop: watch::Sender<bool>,
    pub(super) ch: Channels,
}

impl EngineState {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        config: Config,
        info_hash: InfoHash,
        info: Option<Info>,
        trackers: Vec<String>,
        dest: PathBuf,
        cmd_rx: mpsc::Receiver<Command>,
        error_tx: watch::Sender<Option<Arc<EngineError>>>,
        completed_tx: watch::Sender<bool>,
    ) -> Self {
        let resume: Option<Arc<dyn Resume>> = config
            .resume_dir
            .clone()
            .map(|dir| Arc::new(crate::resume::FileResume::new(dir)) as Arc<dyn Resume>);
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut state = Self {
            config,
            info_hash,
            local_id: PeerId::local(),
            trackers,
            dest,
            resume,
            info: None,
            bitfield: None,
            pieces: Vec::new(),
            store: None,
            running: false,
            completed: false,
            bytes_complete: 0,
            bytes_uploaded: 0,
            bytes_downloaded: 0,
            next_key: 0,
            peers: HashMap::new(),
            peer_ids: HashMap::new(),
            connected_ips: HashSet::new(),
            addr_list: AddrList::new(),
            incoming_handshakers: HashMap::new(),
            outgoing_handshakers: HashMap::new(),
            piece_downloads: HashMap::new(),
            info_downloads: HashMap::new(),
            optimistic: None,
            listener_addr: None,
            acceptor: None,
            allocator: None,
            verifier: None,
            announcers: Vec::new(),
            writer: None,
            write_tx: None,
            rng,
            error_tx,
            completed_tx,
            announcer_stop: watch::channel(false).0,
            ch: Channels::new(cmd_rx),
        };
        if let Some(info) = info {
            state.adopt_info(info);
        }
        state
    }

    /// The single-writer event loop. Returns only on `Close`.
    pub(super) async fn run(mut self) {
        let unchoke_period = self.config.unchoke_interval;
        let optimistic_period = self.config.optimistic_unchoke_interval;
        let mut unchoke = interval_at(
            tokio::time::Instant::now() + unchoke_period,
            unchoke_period,
        );
        let mut optimistic = interval_at(
            tokio::time::Instant::now() + optimistic_period,
            optimistic_period,
        );

        loop {
            tokio::select! {
                maybe = self.ch.cmd_rx.recv() => match maybe {
                    Some(Command::Start) => self.start().await,
                    Some(Command::Stop) => self.stop(Some(EngineError::Stopped)),
                    Some(Command::Stats(tx)) => {
                        let _ = tx.send(self.stats());
                    }
                    Some(Command::ListenAddr(tx)) => {
                        let _ = tx.send(self.listener_addr);
                    }
                    Some(Command::AddPeers(addrs)) => self.addr_list.push_all(addrs),
                    Some(Command::Close) | None => {
                        self.stop(None);
                        break;
                    }
                },
                Some(res) = self.ch.alloc_rx.recv() => self.on_allocator(res).await,
                Some(files) = self.ch.alloc_progress_rx.recv() => {
                    trace!("allocated {files} files");
                }
                Some(res) = self.ch.verify_rx.recv() => self.on_verifier(res).await,
                Some(checked) = self.ch.verify_progress_rx.recv() => {
                    trace!("verified {checked} pieces");
                }
                Some(addrs) = self.ch.addrs_rx.recv() => {
                    trace!("{} addresses from tracker", addrs.len());
                    self.addr_list.push_all(addrs);
                }
                Some(req) = self.ch.announce_req_rx.recv() => self.on_announce_request(req),
                Some(conn) = self.ch.conn_rx.recv() => self.on_incoming_conn(conn),
                Some(res) = self.ch.in_hs_rx.recv() => self.on_incoming_handshake(res),
                Some(res) = self.ch.out_hs_rx.recv() => self.on_outgoing_handshake(res),
                Some(out) = self.ch.piece_out_rx.recv() => self.on_piece_outcome(out).await,
                Some(out) = self.ch.info_out_rx.recv() => self.on_info_outcome(out).await,
                Some(resp) = self.ch.write_resp_rx.recv() => self.on_write_response(resp).await,
                Some(key) = self.ch.disconnect_rx.recv() => self.on_disconnect(key),
                Some(event) = self.ch.events_rx.recv() => {
                    self.handle_message(event.key, event.message).await;
                }
                _ = unchoke.tick() => self.tick_unchoke(),
                _ = optimistic.tick() => self.tick_optimistic(),
            }
            self.pump();
        }
    }

    // ---- lifecycle ----------------------------------------------------

    async fn start(&mut self) {
        if self.running {
            return;
        }
        debug!("starting torrent {}", self.info_hash);
        self.running = true;
        self.announcer_stop = watch::channel(false).0;
        self.start_announcers();

        // Magnet restart: the resume data may already hold the info.
        if self.info.is_none() {
            if let Some(resume) = self.resume.clone() {
                match resume.read_info().await {
                    Ok(Some(bytes)) => match Info::from_bytes(&bytes) {
                        Ok(info) if info.hash == self.info_hash => self.adopt_info(info),
                        Ok(_) => warn!("resume info does not match torrent, ignoring"),
                        Err(err) => warn!("resume info unreadable: {err}"),
                    },
                    Ok(None) => {}
                    Err(err) => warn!("resume read failed: {err}"),
                }
            }
        }

        if self.info.is_some() {
            self.spawn_allocator();
        }
    }

    /// Tears down every sub-task in a fixed order and releases storage
    /// last. The loop stays alive so the torrent can be restarted.
    pub(super) fn stop(&mut self, reason: Option<EngineError>) {
        if let Some(err) = reason {
            if self.running {
                warn!("stopping torrent: {err}");
            }
            self.error_tx.send_replace(Some(Arc::new(err)));
        }
        if !self.running {
            return;
        }
        self.running = false;

        // Announcers get to say goodbye; everything else is cancelled.
        let _ = self.announcer_stop.send(true);
        self.announcers.clear();

        for (_, handshaker) in self.outgoing_handshakers.drain() {
            handshaker.abort();
        }
        for (_, handshaker) in self.incoming_handshakers.drain() {
            handshaker.abort();
        }
        for (_, download) in self.info_downloads.drain() {
            download.abort();
        }
        for (_, download) in self.piece_downloads.drain() {
            download.abort();
        }
        let mut keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        keys.sort_by_key(|key| {
            let peer = &self.peers[key];
            (peer.source == PeerSource::Outgoing, key.0)
        });
        for key in keys {
            self.close_peer(key);
        }
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
        self.listener_addr = None;
        if let Some(verifier) = self.verifier.take() {
            verifier.abort();
        }
        if let Some(allocator) = self.allocator.take() {
            allocator.abort();
        }
        self.write_tx = None;
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        self.addr_list.clear();
        self.optimistic = None;
        self.store = None;
    }

    pub(super) fn stats(&self) -> Stats {
        let status = if !self.running {
            Status::Stopped
        } else if !self.completed {
            Status::Downloading
        } else {
            Status::Seeding
        };
        let (bytes_total, bytes_complete, bytes_incomplete) = match (&self.info, &self.bitfield) {
            (Some(info), Some(_)) => (
                Some(info.total_length),
                Some(self.bytes_complete),
                Some(info.total_length - self.bytes_complete),
            ),
            (Some(info), None) => (Some(info.total_length), None, None),
            _ => (None, None, None),
        };
        Stats {
            status,
            bytes_total,
            bytes_complete,
            bytes_incomplete,
        }
    }

    /// Makes the info dictionary known; called exactly once per torrent
    /// from the constructor, the resume data, or a metadata download.
    pub(super) fn adopt_info(&mut self, info: Info) {
        debug_assert!(self.info.is_none());
        self.pieces = PieceState::build(&info);
        self.info = Some(Arc::new(info));
    }

    fn spawn_allocator(&mut self) {
        let info = self.info.clone().expect("allocator needs info");
        self.allocator = Some(tokio::spawn(run_allocator(
            info,
            self.dest.clone(),
            self.ch.alloc_progress_tx.clone(),
            self.ch.alloc_tx.clone(),
        )));
    }

    async fn on_allocator(&mut self, res: AllocatorResult) {
        self.allocator = None;
        if !self.running {
            return;
        }
        let store = match res.store {
            Ok(store) => store,
            Err(err) => {
                self.stop(Some(EngineError::Allocator(err)));
                return;
            }
        };
        self.store = Some(store);

        if self.bitfield.is_some() {
            // Restart with progress still in memory.
            self.finish_setup().await;
            return;
        }

        if res.need_hash_check {
            if let Some(bitfield) = self.load_resume_bitfield().await {
                debug!("resume data is consistent, skipping hash check");
                self.bitfield = Some(bitfield);
                self.finish_setup().await;
            } else {
                self.spawn_verifier();
            }
        } else {
            let num_pieces = self.info.as_ref().expect("info set").num_pieces;
            self.bitfield = Some(Bitfield::new(num_pieces));
            self.finish_setup().await;
        }
    }

    async fn load_resume_bitfield(&mut self) -> Option<Bitfield> {
        let resume = self.resume.clone()?;
        let bytes = resume.read_bitfield().await.ok().flatten()?;
        let num_pieces = self.info.as_ref()?.num_pieces;
        Bitfield::from_bytes(&bytes, num_pieces)
    }

    fn spawn_verifier(&mut self) {
        let store = self.store.clone().expect("verifier needs storage");
        let specs: Vec<PieceSpec> = self
            .pieces
            .iter()
            .map(|p| PieceSpec {
                offset: p.offset,
                length: p.length,
                hash: p.hash,
            })
            .collect();
        debug!("hash-checking {} pieces", specs.len());
        self.verifier = Some(tokio::spawn(run_verifier(
            store,
            specs,
            self.ch.verify_progress_tx.clone(),
            self.ch.verify_tx.clone(),
        )));
    }

    async fn on_verifier(&mut self, res: VerifierResult) {
        self.verifier = None;
        if !self.running {
            return;
        }
        match res.result {
            Ok(bitfield) => {
                // Peers connected during the check learn what we hold.
                let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
                for index in 0..bitfield.len() {
                    if bitfield.test(index) {
                        for &key in &keys {
                            self.send_message(key, crate::peer::Message::Have { index });
                        }
                    }
                }
                self.bitfield = Some(bitfield);
                self.finish_setup().await;
            }
            Err(err) => self.stop(Some(EngineError::Verifier(err))),
        }
    }

    /// Runs once the bitfield exists: adopts progress, drains parked
    /// messages and opens the door to inbound peers.
    async fn finish_setup(&mut self) {
        let info = self.info.clone().expect("info set");
        let bitfield = self.bitfield.clone().expect("bitfield set");

        self.bytes_complete = (0..bitfield.len())
            .filter(|&i| bitfield.test(i))
            .map(|i| u64::from(info.piece_length_of(i)))
            .sum();

        if let Some(resume) = self.resume.clone() {
            if let Err(err) = resume.write_info(&info.raw).await {
                self.stop(Some(EngineError::Resume(err)));
                return;
            }
            if let Err(err) = resume.write_bitfield(bitfield.bytes()).await {
                self.stop(Some(EngineError::Resume(err)));
                return;
            }
        }

        self.spawn_writer();
        self.check_completion();
        self.process_parked().await;
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            self.update_interest(key);
        }
        self.start_acceptor().await;
    }

    fn spawn_writer(&mut self) {
        let store = self.store.clone().expect("writer needs storage");
        // At least one slot per concurrently completable piece, so the
        // engine never blocks handing work to the writer.
        let (tx, rx) = mpsc::channel(self.config.parallel_piece_downloads.max(8));
        self.write_tx = Some(tx);
        self.writer = Some(tokio::spawn(run_writer(
            store,
            rx,
            self.ch.write_resp_tx.clone(),
        )));
    }

    pub(super) fn check_completion(&mut self) {
        if self.completed {
            return;
        }
        if self.bitfield.as_ref().is_some_and(Bitfield::all) {
            debug!("torrent complete, switching to seeding");
            self.completed = true;
            self.completed_tx.send_replace(true);
        }
    }

    // ---- announcers and addresses -------------------------------------

    fn start_announcers(&mut self) {
        for url in self.trackers.clone() {
            match crate::tracker::from_url(&url) {
                Ok(tracker) => {
                    self.announcers.push(tokio::spawn(run_announcer(
                        tracker,
                        self.ch.announce_req_tx.clone(),
                        self.ch.addrs_tx.clone(),
                        self.completed_tx.subscribe(),
                        self.announcer_stop.subscribe(),
                    )));
                }
                Err(err) => warn!("skipping tracker {url}: {err}"),
            }
        }
    }

    fn on_announce_request(&mut self, req: AnnouncerRequest) {
        let bytes_left = match (&self.info, &self.bitfield) {
            (Some(info), Some(_)) => info.total_length - self.bytes_complete,
            (Some(info), None) => info.total_length,
            (None, _) => u64::MAX,
        };
        let port = self
            .listener_addr
            .map(|addr| addr.port())
            .unwrap_or(self.config.port);
        let _ = req.respond_to.send(Transfer {
            info_hash: self.info_hash,
            peer_id: self.local_id,
            port,
            uploaded: self.bytes_uploaded,
            downloaded: self.bytes_downloaded,
            bytes_left,
        });
    }

    // ---- inbound connections ------------------------------------------

    async fn start_acceptor(&mut self) {
        if self.acceptor.is_some() || !self.running {
            return;
        }
        let listener = match TcpListener::bind(("0.0.0.0", self.config.port)).await {
            Ok(listener) => listener,
            Err(err) => {
                self.stop(Some(EngineError::Listen(err)));
                return;
            }
        };
        self.listener_addr = listener.local_addr().ok();
        debug!("accepting peers on {:?}", self.listener_addr);

        let conn_tx = self.ch.conn_tx.clone();
        self.acceptor = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        if conn_tx.send(stream).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        // Transient accept failures must not kill the loop.
                        warn!("accept failed: {err}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }));
    }

    fn on_incoming_conn(&mut self, conn: TcpStream) {
        if !self.running {
            return;
        }
        let incoming_peers = self
            .peers
            .values()
            .filter(|p| p.source == PeerSource::Incoming)
            .count();
        if self.incoming_handshakers.len() + incoming_peers >= self.config.max_peer_accept {
            debug!("peer limit reached, refusing connection");
            return;
        }
        let Ok(addr) = conn.peer_addr() else { return };
        if !self.connected_ips.insert(addr.ip()) {
            trace!("already connected to {}, refusing", addr.ip());
            return;
        }
        let handle = tokio::spawn(handshake::run_incoming(
            conn,
            addr,
            self.handshake_config(),
            self.ch.in_hs_tx.clone(),
        ));
        self.incoming_handshakers.insert(addr, handle);
    }

    fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            local_id: self.local_id,
            info_hash: self.info_hash,
            extensions: crate::peer::Extensions::ours(),
            enable_encryption: self.config.enable_encryption,
            force_encryption: self.config.force_encryption,
            deadline: self.config.handshake_timeout,
        }
    }

    fn on_incoming_handshake(&mut self, res: IncomingResult) {
        self.incoming_handshakers.remove(&res.addr);
        match res.result {
            Ok(established) if self.running => {
                self.start_peer(established, res.addr, PeerSource::Incoming);
            }
            _ => {
                self.connected_ips.remove(&res.addr.ip());
            }
        }
    }

    fn on_outgoing_handshake(&mut self, res: OutgoingResult) {
        self.outgoing_handshakers.remove(&res.addr);
        match res.result {
            Ok(established) if self.running => {
                self.start_peer(established, res.addr, PeerSource::Outgoing);
            }
            _ => {
                // The dial pump runs after this event and tries the
                // next address.
                self.connected_ips.remove(&res.addr.ip());
            }
        }
    }

    fn on_disconnect(&mut self, key: PeerKey) {
        if self.peers.contains_key(&key) {
            debug!(peer = key.0, "peer disconnected");
            self.close_peer(key);
        }
    }

    // ---- downloads -----------------------------------------------------

    async fn on_piece_outcome(&mut self, out: PieceOutcome) {
        if self.piece_downloads.remove(&out.key).is_none() {
            // Raced a cancellation; whatever buffer existed died with
            // the task.
            if let Ok(buffer) = out.result {
                BufferPool::global().give_back(buffer);
            }
            return;
        }
        if let Some(piece) = self.pieces.get_mut(out.index as usize) {
            piece.requested.remove(&out.key);
        }

        match out.result {
            Ok(buffer) => {
                let (offset, hash) = {
                    let Some(piece) = self.pieces.get(out.index as usize) else {
                        BufferPool::global().give_back(buffer);
                        return;
                    };
                    (piece.offset, piece.hash)
                };
                let Some(write_tx) = self.write_tx.clone() else {
                    BufferPool::global().give_back(buffer);
                    return;
                };
                if let Some(piece) = self.pieces.get_mut(out.index as usize) {
                    piece.writing = true;
                }
                let request = WriteRequest {
                    index: out.index,
                    offset,
                    hash,
                    source: out.key,
                    buffer,
                };
                if write_tx.send(request).await.is_err() {
                    if let Some(piece) = self.pieces.get_mut(out.index as usize) {
                        piece.writing = false;
                    }
                }
            }
            Err(err) => {
                debug!(peer = out.key.0, "piece {} download failed: {err}", out.index);
                if matches!(err, DownloadError::Timeout) {
                    self.close_peer(out.key);
                }
            }
        }
    }

    async fn on_info_outcome(&mut self, out: InfoOutcome) {
        if self.info_downloads.remove(&out.key).is_none() {
            return;
        }
        let bytes = match out.result {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(peer = out.key.0, "info download failed: {err}");
                self.close_peer(out.key);
                return;
            }
        };
        if self.info.is_some() {
            return;
        }
        if InfoHash::of(&bytes) != self.info_hash {
            warn!(peer = out.key.0, "received info does not match info hash");
            self.close_peer(out.key);
            return;
        }
        let info = match Info::from_bytes(&bytes) {
            Ok(info) => info,
            Err(err) => {
                self.stop(Some(EngineError::InvalidInfo(err)));
                return;
            }
        };
        debug!("metadata complete: {} pieces", info.num_pieces);
        self.adopt_info(info);
        // The remaining metadata fetches are redundant now.
        for (_, download) in self.info_downloads.drain() {
            download.abort();
        }
        if let Some(resume) = self.resume.clone() {
            let raw = self.info.as_ref().expect("just adopted").raw.clone();
            if let Err(err) = resume.write_info(&raw).await {
                self.stop(Some(EngineError::Resume(err)));
                return;
            }
        }
        self.spawn_allocator();
    }

    pub(super) async fn on_write_response(&mut self, resp: WriteResponse) {
        if let Some(piece) = self.pieces.get_mut(resp.index as usize) {
            piece.writing = false;
        }
        if !self.running {
            return;
        }
        if let Err(err) = resp.result {
            self.stop(Some(EngineError::Storage(err)));
            return;
        }
        if !resp.hash_ok {
            warn!("piece {} failed its hash check", resp.index);
            if let Some(peer) = self.peers.get_mut(&resp.source) {
                peer.misbehaviour += 1;
                if peer.misbehaviour >= self.config.misbehaviour_limit {
                    debug!(peer = resp.source.0, "too many corrupt pieces");
                    self.close_peer(resp.source);
                }
            }
            // The piece stays unset and will be picked again.
            return;
        }

        let piece_len = {
            let Some(info) = &self.info else { return };
            u64::from(info.piece_length_of(resp.index))
        };
        let Some(bitfield) = &mut self.bitfield else {
            return;
        };
        if bitfield.test(resp.index) {
            return;
        }
        bitfield.set(resp.index);
        self.bytes_complete += piece_len;
        trace!("piece {} stored", resp.index);

        if let Some(resume) = self.resume.clone() {
            let bytes = self.bitfield.as_ref().expect("set above").to_bytes();
            if let Err(err) = resume.write_bitfield(&bytes).await {
                self.stop(Some(EngineError::Resume(err)));
                return;
            }
        }
        self.check_completion();

        // Every peer connected right now hears about the piece before
        // any other event is processed.
        let keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        for key in keys {
            self.send_message(key, crate::peer::Message::Have { index: resp.index });
            self.update_interest(key);
        }
    }

    // ---- slot pumps ----------------------------------------------------

    /// Fills every free slot after each event: outbound dials, metadata
    /// downloads and piece downloads.
    fn pump(&mut self) {
        if !self.running {
            return;
        }
        self.pump_dials();
        self.pump_info_downloads();
        self.pump_piece_downloads();
    }

    fn pump_dials(&mut self) {
        while self.outgoing_handshakers.len() < self.config.max_dials {
            let Some(addr) = self.addr_list.pop() else {
                return;
            };
            if Some(addr) == self.listener_addr {
                continue;
            }
            if !self.connected_ips.insert(addr.ip()) {
                continue;
            }
            trace!("dialing {addr}");
            let handle = tokio::spawn(handshake::run_outgoing(
                addr,
                self.handshake_config(),
                self.ch.out_hs_tx.clone(),
            ));
            self.outgoing_handshakers.insert(addr, handle);
        }
    }

    fn pump_info_downloads(&mut self) {
        if self.info.is_some() {
            return;
        }
        while self.info_downloads.len() < self.config.parallel_info_downloads {
            let candidate = self.peers.values().find(|peer| {
                !self.info_downloads.contains_key(&peer.key)
                    && peer
                        .ext_handshake
                        .as_ref()
                        .is_some_and(|hs| hs.metadata_size.is_some() && hs.metadata_id().is_some())
            });
            let Some(peer) = candidate else { return };
            let hs = peer.ext_handshake.as_ref().expect("checked above");
            let total_size = hs.metadata_size.expect("checked above");
            let remote_id = hs.metadata_id().expect("checked above");
            let key = peer.key;
            let peer_tx = peer.tx.clone();
            debug!(peer = key.0, "downloading metadata, {total_size} bytes");
            let download = InfoDownload::spawn(
                key,
                total_size,
                remote_id,
                peer_tx,
                self.ch.info_out_tx.clone(),
            );
            self.info_downloads.insert(key, download);
        }
    }

    fn pump_piece_downloads(&mut self) {
        let Some(bitfield) = self.bitfield.clone() else {
            return;
        };
        while self.piece_downloads.len() < self.config.parallel_piece_downloads {
            let peers = &self.peers;
            let downloads = &self.piece_downloads;
            let picked = picker::pick(
                &self.pieces,
                &bitfield,
                |key, piece| {
                    let Some(peer) = peers.get(&key) else {
                        return false;
                    };
                    if downloads.contains_key(&key) {
                        return false;
                    }
                    !peer.peer_choking || (peer.fast && piece.allowed_fast.contains(&key))
                },
                &mut self.rng,
            );
            let Some((index, key)) = picked else { return };
            let piece = &self.pieces[index as usize];
            let peer = &self.peers[&key];
            trace!(peer = key.0, "downloading piece {index}");
            let download = PieceDownload::spawn(
                key,
                piece,
                peer.tx.clone(),
                DownloadParams {
                    max_requests: self.config.max_requests_in,
                    read_timeout: self.config.piece_read_timeout,
                    allowed_fast: piece.allowed_fast.contains(&key),
                    fast_ext: peer.fast,
                    choked: peer.peer_choking,
                },
                self.ch.piece_out_tx.clone(),
            );
            self.piece_downloads.insert(key, download);
            self.pieces[index as usize].requested.insert(key);
        }
    }
}
