//! Resume data: the info dictionary and bitfield persisted across runs.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;

/// Persistence for a torrent's identity and progress.
///
/// The engine writes the info bytes once they are known and the
/// bitfield after every verified piece; on startup, consistent resume
/// data lets it skip the full hash check.
#[async_trait]
pub trait Resume: Send + Sync {
    async fn write_info(&self, bytes: &[u8]) -> io::Result<()>;
    async fn write_bitfield(&self, bytes: &[u8]) -> io::Result<()>;
    async fn read_info(&self) -> io::Result<Option<Vec<u8>>>;
    async fn read_bitfield(&self) -> io::Result<Option<Vec<u8>>>;
}

/// Resume data as two flat files in a directory.
pub struct FileResume {
    dir: PathBuf,
}

impl FileResume {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn info_path(&self) -> PathBuf {
        self.dir.join("info.ben")
    }

    fn bitfield_path(&self) -> PathBuf {
        self.dir.join("bitfield.bin")
    }
}

#[async_trait]
impl Resume for FileResume {
    async fn write_info(&self, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.info_path(), bytes).await
    }

    async fn write_bitfield(&self, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.bitfield_path(), bytes).await
    }

    async fn read_info(&self) -> io::Result<Option<Vec<u8>>> {
        read_optional(self.info_path()).await
    }

    async fn read_bitfield(&self) -> io::Result<Option<Vec<u8>>> {
        read_optional(self.bitfield_path()).await
    }
}

async fn read_optional(path: PathBuf) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
