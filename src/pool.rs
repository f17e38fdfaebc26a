//! Process-global buffer pool for in-flight pieces.
//!
//! A buffer is leased when a piece download starts and returned after
//! the piece writer is done with it, which bounds the memory spent on
//! partially assembled pieces across every torrent in the process.

use std::sync::OnceLock;

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

const POOL_SLOTS: usize = 64;

static GLOBAL: OnceLock<BufferPool> = OnceLock::new();

pub(crate) struct BufferPool {
    buffers: ArrayQueue<BytesMut>,
}

impl BufferPool {
    /// The single process-wide pool.
    pub fn global() -> &'static BufferPool {
        GLOBAL.get_or_init(|| BufferPool {
            buffers: ArrayQueue::new(POOL_SLOTS),
        })
    }

    /// Takes a buffer sized for `len` bytes, zero-filled.
    pub fn lease(&self, len: usize) -> BytesMut {
        let mut buf = self.buffers.pop().unwrap_or_default();
        buf.resize(len, 0);
        buf
    }

    /// Returns a buffer; dropped silently once the pool is full.
    pub fn give_back(&self, mut buf: BytesMut) {
        buf.clear();
        let _ = self.buffers.push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_sized_and_zeroed() {
        let pool = BufferPool::global();
        let mut buf = pool.lease(1024);
        assert_eq!(buf.len(), 1024);
        assert!(buf.iter().all(|&b| b == 0));

        buf[0] = 0xFF;
        pool.give_back(buf);

        // Reused buffers come back zeroed to the requested size.
        let buf = pool.lease(2048);
        assert_eq!(buf.len(), 2048);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
