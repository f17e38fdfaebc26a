use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::downloader::DownloadError;
use crate::peer::{
    MetadataMessage, Message, PeerCommand, PeerKey, METADATA_PIECE_SIZE,
};

/// A metadata chunk arrives well within this or the peer is useless.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Terminal message of an info download: the raw info dictionary bytes.
pub(crate) struct InfoOutcome {
    pub key: PeerKey,
    pub result: Result<Vec<u8>, DownloadError>,
}

/// A `ut_metadata` data chunk routed in by the engine.
pub(crate) struct MetadataChunk {
    pub piece: u32,
    pub data: Bytes,
}

/// Engine-held handle to one metadata download task.
pub(crate) struct InfoDownload {
    chunks_tx: mpsc::Sender<MetadataChunk>,
    handle: JoinHandle<()>,
}

impl InfoDownload {
    /// Starts fetching `total_size` bytes of metadata from one peer
    /// that advertised `remote_id` for `ut_metadata`.
    pub fn spawn(
        key: PeerKey,
        total_size: u32,
        remote_id: u8,
        peer_tx: mpsc::Sender<PeerCommand>,
        results: mpsc::Sender<InfoOutcome>,
    ) -> InfoDownload {
        let num_chunks = total_size.div_ceil(METADATA_PIECE_SIZE);
        let (chunks_tx, chunks_rx) = mpsc::channel(num_chunks.max(1) as usize);
        let handle = tokio::spawn(run(
            key, total_size, num_chunks, remote_id, peer_tx, chunks_rx, results,
        ));
        InfoDownload { chunks_tx, handle }
    }

    pub fn deliver_chunk(&self, piece: u32, data: Bytes) {
        let _ = self.chunks_tx.try_send(MetadataChunk { piece, data });
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn run(
    key: PeerKey,
    total_size: u32,
    num_chunks: u32,
    remote_id: u8,
    peer_tx: mpsc::Sender<PeerCommand>,
    mut chunks_rx: mpsc::Receiver<MetadataChunk>,
    results: mpsc::Sender<InfoOutcome>,
) {
    let result = fetch(
        total_size,
        num_chunks,
        remote_id,
        &peer_tx,
        &mut chunks_rx,
    )
    .await;
    let _ = results.send(InfoOutcome { key, result }).await;
}

async fn fetch(
    total_size: u32,
    num_chunks: u32,
    remote_id: u8,
    peer_tx: &mpsc::Sender<PeerCommand>,
    chunks_rx: &mut mpsc::Receiver<MetadataChunk>,
) -> Result<Vec<u8>, DownloadError> {
    if num_chunks == 0 {
        return Err(DownloadError::Invalid("empty metadata"));
    }

    let mut buffer = BytesMut::zeroed(total_size as usize);
    let mut received = vec![false; num_chunks as usize];
    let mut remaining = num_chunks;

    for piece in 0..num_chunks {
        let request = Message::Extended {
            id: remote_id,
            payload: MetadataMessage::request(piece).encode(),
        };
        if peer_tx.send(PeerCommand::Send(request)).await.is_err() {
            return Err(DownloadError::PeerGone);
        }
    }

    while remaining > 0 {
        let chunk = match timeout(CHUNK_TIMEOUT, chunks_rx.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Err(DownloadError::PeerGone),
            Err(_) => return Err(DownloadError::Timeout),
        };
        if chunk.piece >= num_chunks {
            return Err(DownloadError::Invalid("chunk index out of range"));
        }
        let start = chunk.piece * METADATA_PIECE_SIZE;
        let expected = (total_size - start).min(METADATA_PIECE_SIZE) as usize;
        if chunk.data.len() != expected {
            return Err(DownloadError::Invalid("chunk length mismatch"));
        }
        if !received[chunk.piece as usize] {
            received[chunk.piece as usize] = true;
            buffer[start as usize..start as usize + expected].copy_from_slice(&chunk.data);
            remaining -= 1;
        }
    }

    Ok(buffer.to_vec())
}
