use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tracing::debug;

use crate::peer::Bitfield;
use crate::storage::{FileStore, StorageError};

/// Location and expected hash of one piece, detached from engine state
/// so the verifier can own it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PieceSpec {
    pub offset: u64,
    pub length: u32,
    pub hash: [u8; 20],
}

/// Terminal message of the verifier task.
pub(crate) struct VerifierResult {
    pub result: Result<Bitfield, StorageError>,
}

/// Scans existing storage and reports which pieces already hash correctly.
pub(crate) async fn run_verifier(
    store: Arc<FileStore>,
    pieces: Vec<PieceSpec>,
    progress: mpsc::Sender<u32>,
    results: mpsc::Sender<VerifierResult>,
) {
    let num_pieces = pieces.len() as u32;
    let mut bitfield = Bitfield::new(num_pieces);

    for (index, piece) in pieces.into_iter().enumerate() {
        let index = index as u32;
        match store.read_at(piece.offset, piece.length as usize).await {
            Ok(data) => {
                let digest = tokio::task::spawn_blocking(move || {
                    let hash: [u8; 20] = Sha1::digest(&data).into();
                    hash
                })
                .await;
                match digest {
                    Ok(hash) if hash == piece.hash => bitfield.set(index),
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
            Err(err) => {
                let _ = results.send(VerifierResult { result: Err(err) }).await;
                return;
            }
        }
        let _ = progress.try_send(index + 1);
    }

    debug!(
        "hash check finished: {}/{} pieces present",
        bitfield.count(),
        num_pieces
    );
    let _ = results
        .send(VerifierResult {
            result: Ok(bitfield),
        })
        .await;
}
