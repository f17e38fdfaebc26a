use super::*;
use tempfile::TempDir;

fn layout(lengths: &[u64]) -> Vec<FileItem> {
    let mut offset = 0;
    lengths
        .iter()
        .enumerate()
        .map(|(i, &length)| {
            let item = FileItem {
                path: PathBuf::from(format!("file{i}.dat")),
                length,
                offset,
            };
            offset += length;
            item
        })
        .collect()
}

#[tokio::test]
async fn allocate_sizes_files() {
    let tmp = TempDir::new().unwrap();
    let store = FileStore::new(tmp.path(), &layout(&[1000, 500]));

    let existing = store.allocate().await.unwrap();
    assert!(!existing);
    assert_eq!(store.total_length(), 1500);
    assert_eq!(
        tokio::fs::metadata(tmp.path().join("file0.dat"))
            .await
            .unwrap()
            .len(),
        1000
    );
}

#[tokio::test]
async fn allocate_detects_existing_content() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("file0.dat"), b"leftover").unwrap();

    let store = FileStore::new(tmp.path(), &layout(&[1000]));
    assert!(store.allocate().await.unwrap());
}

#[tokio::test]
async fn write_and_read_across_file_boundary() {
    let tmp = TempDir::new().unwrap();
    let store = FileStore::new(tmp.path(), &layout(&[100, 100]));
    store.allocate().await.unwrap();

    let data: Vec<u8> = (0..150).map(|i| i as u8).collect();
    store.write_at(30, &data).await.unwrap();

    let read = store.read_at(30, 150).await.unwrap();
    assert_eq!(read.as_ref(), data.as_slice());

    // The tail landed in the second file.
    let second = store.read_at(100, 80).await.unwrap();
    assert_eq!(second.as_ref(), &data[70..]);
}

#[tokio::test]
async fn reject_out_of_bounds() {
    let tmp = TempDir::new().unwrap();
    let store = FileStore::new(tmp.path(), &layout(&[100]));
    store.allocate().await.unwrap();

    assert!(matches!(
        store.read_at(90, 20).await,
        Err(StorageError::OutOfBounds { .. })
    ));
    assert!(matches!(
        store.write_at(101, b"x").await,
        Err(StorageError::OutOfBounds { .. })
    ));
}
