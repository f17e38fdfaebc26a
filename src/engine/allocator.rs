use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::metainfo::Info;
use crate::storage::{FileStore, StorageError};

/// Terminal message of the allocator task.
pub(crate) struct AllocatorResult {
    pub store: Result<Arc<FileStore>, StorageError>,
    /// Existing on-disk content was found; the bitfield cannot be
    /// trusted without a hash check or consistent resume data.
    pub need_hash_check: bool,
}

/// Lays the torrent's files out under `dest` and hands the store back.
pub(crate) async fn run_allocator(
    info: Arc<Info>,
    dest: PathBuf,
    progress: mpsc::Sender<usize>,
    results: mpsc::Sender<AllocatorResult>,
) {
    let store = FileStore::new(&dest, &info.files);
    let mut need_hash_check = false;
    let mut error = None;

    for index in 0..store.num_files() {
        match store.allocate_file(index).await {
            Ok(existing) => {
                need_hash_check |= existing;
                let _ = progress.try_send(index + 1);
            }
            Err(err) => {
                error = Some(err);
                break;
            }
        }
    }

    let result = AllocatorResult {
        store: match error {
            Some(err) => Err(err),
            None => Ok(Arc::new(store)),
        },
        need_hash_check,
    };
    let _ = results.send(result).await;
}
