use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::piece::{Block, PieceState};
use crate::peer::{Message, PeerCommand, PeerKey};
use crate::pool::BufferPool;

/// Why a downloader gave up.
#[derive(Debug, Error)]
pub(crate) enum DownloadError {
    /// The peer's outbound queue is gone; it is disconnecting.
    #[error("peer went away")]
    PeerGone,

    /// No requested block arrived within the read deadline.
    #[error("block request timed out")]
    Timeout,

    /// The peer sent metadata that cannot be assembled.
    #[error("invalid data: {0}")]
    Invalid(&'static str),
}

/// A block delivered by the engine out of a `Piece` message.
pub(crate) struct BlockData {
    pub begin: u32,
    pub data: Bytes,
}

pub(crate) enum ChokeSignal {
    Choked,
    Unchoked,
}

/// Terminal message of a piece download: the assembled piece bytes in a
/// pooled buffer, or the reason it failed.
pub(crate) struct PieceOutcome {
    pub key: PeerKey,
    pub index: u32,
    pub result: Result<BytesMut, DownloadError>,
}

/// Engine-held handle to one (peer, piece) download task.
pub(crate) struct PieceDownload {
    pub index: u32,
    blocks_tx: mpsc::Sender<BlockData>,
    rejects_tx: mpsc::Sender<Block>,
    chokes_tx: mpsc::Sender<ChokeSignal>,
    handle: JoinHandle<()>,
}

/// Fixed knobs passed from the engine config.
pub(crate) struct DownloadParams {
    pub max_requests: usize,
    pub read_timeout: Duration,
    /// Peer granted allowed-fast for this piece: requests survive chokes.
    pub allowed_fast: bool,
    /// Both sides speak the fast extension.
    pub fast_ext: bool,
    /// The peer was already choking us when the download began.
    pub choked: bool,
}

impl PieceDownload {
    pub fn spawn(
        key: PeerKey,
        piece: &PieceState,
        peer_tx: mpsc::Sender<PeerCommand>,
        params: DownloadParams,
        results: mpsc::Sender<PieceOutcome>,
    ) -> PieceDownload {
        let blocks = piece.blocks();
        let (blocks_tx, blocks_rx) = mpsc::channel(blocks.len().max(1));
        let (rejects_tx, rejects_rx) = mpsc::channel(blocks.len().max(1));
        let (chokes_tx, chokes_rx) = mpsc::channel(8);

        let index = piece.index;
        let length = piece.length;
        let handle = tokio::spawn(run(
            key, index, length, blocks, peer_tx, blocks_rx, rejects_rx, chokes_rx, params, results,
        ));

        PieceDownload {
            index,
            blocks_tx,
            rejects_tx,
            chokes_tx,
            handle,
        }
    }

    /// Feeds a block that arrived for this download. Stale deliveries
    /// after the task finished are dropped.
    pub fn deliver_block(&self, begin: u32, data: Bytes) {
        let _ = self.blocks_tx.try_send(BlockData { begin, data });
    }

    pub fn deliver_reject(&self, block: Block) {
        let _ = self.rejects_tx.try_send(block);
    }

    pub fn deliver_choke(&self, choked: bool) {
        let signal = if choked {
            ChokeSignal::Choked
        } else {
            ChokeSignal::Unchoked
        };
        let _ = self.chokes_tx.try_send(signal);
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    key: PeerKey,
    index: u32,
    length: u32,
    blocks: Vec<Block>,
    peer_tx: mpsc::Sender<PeerCommand>,
    mut blocks_rx: mpsc::Receiver<BlockData>,
    mut rejects_rx: mpsc::Receiver<Block>,
    mut chokes_rx: mpsc::Receiver<ChokeSignal>,
    params: DownloadParams,
    results: mpsc::Sender<PieceOutcome>,
) {
    let mut buffer = BufferPool::global().lease(length as usize);
    let total = blocks.len();
    let mut queue: VecDeque<Block> = blocks.into();
    let mut outstanding: Vec<Block> = Vec::new();
    let mut choked = params.choked;
    let mut done = 0usize;

    let outcome = 'run: loop {
        // Keep the pipeline full whenever we are allowed to request.
        while (!choked || params.allowed_fast) && outstanding.len() < params.max_requests {
            let Some(block) = queue.pop_front() else { break };
            let request = Message::Request {
                index,
                begin: block.begin,
                length: block.length,
            };
            if peer_tx.send(PeerCommand::Send(request)).await.is_err() {
                break 'run Err(DownloadError::PeerGone);
            }
            outstanding.push(block);
        }

        if done == total {
            break Ok(());
        }

        tokio::select! {
            maybe = blocks_rx.recv() => {
                // A closed channel means the engine dropped this
                // download; exit without a terminal message.
                let Some(block) = maybe else { return };
                let matched = outstanding
                    .iter()
                    .position(|b| b.begin == block.begin && b.length as usize == block.data.len());
                if let Some(pos) = matched {
                    outstanding.swap_remove(pos);
                    let start = block.begin as usize;
                    buffer[start..start + block.data.len()].copy_from_slice(&block.data);
                    done += 1;
                }
            }
            maybe = rejects_rx.recv() => {
                let Some(block) = maybe else { return };
                if let Some(pos) = outstanding.iter().position(|b| *b == block) {
                    outstanding.swap_remove(pos);
                    requeue(&mut queue, block);
                }
            }
            maybe = chokes_rx.recv() => {
                let Some(signal) = maybe else { return };
                match signal {
                    ChokeSignal::Choked => {
                        choked = true;
                        // Without the fast extension a choke cancels
                        // every outstanding request.
                        if !params.fast_ext {
                            for block in outstanding.drain(..) {
                                requeue(&mut queue, block);
                            }
                        }
                    }
                    ChokeSignal::Unchoked => choked = false,
                }
            }
            _ = tokio::time::sleep(params.read_timeout), if !outstanding.is_empty() => {
                break Err(DownloadError::Timeout);
            }
        }
    };

    let result = match outcome {
        Ok(()) => Ok(buffer),
        Err(err) => {
            BufferPool::global().give_back(buffer);
            Err(err)
        }
    };
    let _ = results.send(PieceOutcome { key, index, result }).await;
}

/// Puts a block back, keeping the queue in ascending offset order.
fn requeue(queue: &mut VecDeque<Block>, block: Block) {
    let pos = queue
        .iter()
        .position(|b| b.begin > block.begin)
        .unwrap_or(queue.len());
    queue.insert(pos, block);
}
