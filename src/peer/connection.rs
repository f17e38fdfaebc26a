use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::error::PeerError;
use super::message::Message;
use super::PeerKey;
use crate::mse::{SecureReader, SecureWriter};
use crate::storage::FileStore;

/// Upper bound on a single frame; generous enough for any bitfield or
/// metadata chunk, far below anything a sane peer sends.
const MAX_FRAME: usize = 1024 * 1024;
/// A silent peer is dropped after this long without any frame.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Keep-alive cadence on an otherwise idle outbound queue.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// A decoded message tagged with its originating peer, as delivered on
/// the engine's shared message channel.
pub(crate) struct PeerEvent {
    pub key: PeerKey,
    pub message: Message,
}

/// Work queued on a peer's bounded outbound channel.
pub(crate) enum PeerCommand {
    Send(Message),
    /// Serve one block out of storage as a `Piece` message. The storage
    /// handle rides along so the writer task never touches engine state.
    SendBlock {
        index: u32,
        begin: u32,
        length: u32,
        offset: u64,
        store: Arc<FileStore>,
    },
}

/// Pumps decoded frames from one peer onto the engine's message channel.
///
/// Exactly one disconnect notification is emitted, from here and only
/// here, whatever ends the read side first.
pub(crate) async fn read_loop(
    mut reader: SecureReader,
    key: PeerKey,
    events: mpsc::Sender<PeerEvent>,
    disconnects: mpsc::Sender<PeerKey>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(message) => {
                trace!(peer = key.0, ?message, "received");
                if events.send(PeerEvent { key, message }).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(peer = key.0, "peer read ended: {err}");
                break;
            }
        }
    }
    let _ = disconnects.send(key).await;
}

async fn read_frame(reader: &mut SecureReader) -> Result<Message, PeerError> {
    let mut len = [0u8; 4];
    timeout(IDLE_TIMEOUT, reader.read_exact(&mut len))
        .await
        .map_err(|_| PeerError::Timeout)??;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(PeerError::MessageTooLarge(len));
    }
    let mut frame = BytesMut::zeroed(len);
    timeout(IDLE_TIMEOUT, reader.read_exact(&mut frame))
        .await
        .map_err(|_| PeerError::Timeout)??;
    Message::decode(frame.freeze())
}

/// Drains a peer's outbound queue onto the wire.
///
/// Ends when the engine drops the queue sender or a write fails; either
/// way the write half closes, which the read side observes as EOF.
pub(crate) async fn write_loop(mut writer: SecureWriter, mut commands: mpsc::Receiver<PeerCommand>) {
    let mut buf = BytesMut::with_capacity(32 * 1024);
    let start = tokio::time::Instant::now() + KEEPALIVE_INTERVAL;
    let mut keepalive = tokio::time::interval_at(start, KEEPALIVE_INTERVAL);

    loop {
        buf.clear();
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    PeerCommand::Send(message) => message.encode_into(&mut buf),
                    PeerCommand::SendBlock { index, begin, length, offset, store } => {
                        match store.read_at(offset, length as usize).await {
                            Ok(data) => Message::Piece { index, begin, data }.encode_into(&mut buf),
                            Err(err) => {
                                debug!("reading block for upload failed: {err}");
                                break;
                            }
                        }
                    }
                }
                if writer.write_all(&buf).await.is_err() {
                    break;
                }
            }
            _ = keepalive.tick() => {
                Message::KeepAlive.encode_into(&mut buf);
                if writer.write_all(&buf).await.is_err() {
                    break;
                }
            }
        }
    }
}
