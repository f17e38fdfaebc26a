use std::sync::Arc;

use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use crate::peer::PeerKey;
use crate::pool::BufferPool;
use crate::storage::{FileStore, StorageError};

/// A completed piece handed to the writer for verification and persistence.
pub(crate) struct WriteRequest {
    pub index: u32,
    pub offset: u64,
    pub hash: [u8; 20],
    /// The peer the piece came from, for misbehaviour accounting.
    pub source: PeerKey,
    pub buffer: BytesMut,
}

/// Outcome of one write request.
pub(crate) struct WriteResponse {
    pub index: u32,
    pub source: PeerKey,
    /// SHA-1 matched the expected piece hash. When false nothing was
    /// written and the buffer was dropped.
    pub hash_ok: bool,
    pub result: Result<(), StorageError>,
}

/// Serves write requests one at a time: hash, compare, persist.
///
/// The piece buffer goes back to the global pool either way.
pub(crate) async fn run_writer(
    store: Arc<FileStore>,
    mut requests: mpsc::Receiver<WriteRequest>,
    responses: mpsc::Sender<WriteResponse>,
) {
    while let Some(req) = requests.recv().await {
        let buffer = req.buffer;
        let Ok((buffer, digest)) = tokio::task::spawn_blocking(move || {
            let digest: [u8; 20] = Sha1::digest(&buffer).into();
            (buffer, digest)
        })
        .await
        else {
            return;
        };

        let hash_ok = digest == req.hash;
        let result = if hash_ok {
            store.write_at(req.offset, &buffer).await
        } else {
            Ok(())
        };
        BufferPool::global().give_back(buffer);

        let response = WriteResponse {
            index: req.index,
            source: req.source,
            hash_ok,
            result,
        };
        if responses.send(response).await.is_err() {
            return;
        }
    }
}
