//! The BitTorrent handshake, optionally tunneled through MSE.
//!
//! A handshaker is a one-shot task: it takes a socket (incoming) or an
//! address (outgoing), performs the optional encryption negotiation and
//! the plaintext protocol handshake, and posts exactly one result on
//! the engine's channel — a ready connection or an error. Failed
//! connections are closed here, not by the engine.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::metainfo::InfoHash;
use crate::mse::{self, Cipher, MseError, SecureStream};
use crate::peer::{Extensions, PeerId};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const PROTOCOL_LEN: u8 = 19;

/// Errors that end a handshake. All close the connection; only
/// `SelfConnection` is expected in normal operation.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encryption negotiation failed: {0}")]
    Mse(#[from] MseError),

    #[error("not a BitTorrent handshake")]
    InvalidProtocol,

    /// Outgoing: the peer answered for a different torrent.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Incoming: no active torrent has the offered info hash. Rejected
    /// before our peer ID is revealed.
    #[error("unknown info hash")]
    UnknownInfoHash,

    /// The remote presented our own peer ID.
    #[error("connected to ourselves")]
    SelfConnection,

    /// Plaintext connection while encryption is forced.
    #[error("plaintext refused")]
    PlaintextRefused,

    #[error("handshake timed out")]
    Timeout,
}

/// Per-torrent parameters shared by both handshake directions.
#[derive(Clone)]
pub(crate) struct HandshakeConfig {
    pub local_id: PeerId,
    pub info_hash: InfoHash,
    pub extensions: Extensions,
    pub enable_encryption: bool,
    pub force_encryption: bool,
    pub deadline: Duration,
}

/// A connection that finished both handshakes.
pub struct Established {
    pub stream: SecureStream,
    pub peer_id: PeerId,
    pub extensions: Extensions,
    pub cipher: Cipher,
}

/// Outcome of an outgoing handshaker task.
pub(crate) struct OutgoingResult {
    pub addr: SocketAddr,
    pub result: Result<Established, HandshakeError>,
}

/// Outcome of an incoming handshaker task.
pub(crate) struct IncomingResult {
    pub addr: SocketAddr,
    pub result: Result<Established, HandshakeError>,
}

/// Dials `addr` and runs the full outgoing handshake.
///
/// With encryption enabled but not forced, an MSE failure falls back to
/// one plaintext attempt on a fresh connection.
pub async fn dial(
    addr: SocketAddr,
    local_id: PeerId,
    info_hash: InfoHash,
    extensions: Extensions,
    enable_encryption: bool,
    force_encryption: bool,
) -> Result<Established, HandshakeError> {
    let mut secure = if enable_encryption {
        let stream = TcpStream::connect(addr).await?;
        match mse::handshake_outgoing(stream, info_hash.as_bytes(), force_encryption).await {
            Ok(secure) => secure,
            Err(err) if !force_encryption => {
                trace!("encryption failed ({err}), retrying plaintext");
                SecureStream::plain(TcpStream::connect(addr).await?)
            }
            Err(err) => return Err(err.into()),
        }
    } else {
        SecureStream::plain(TcpStream::connect(addr).await?)
    };

    send_handshake(&mut secure, info_hash, local_id, extensions).await?;
    let (remote_hash, remote_ext) = read_handshake_head(&mut secure).await?;
    if remote_hash != info_hash {
        return Err(HandshakeError::InfoHashMismatch);
    }
    let remote_id = read_peer_id(&mut secure).await?;
    if remote_id == local_id {
        return Err(HandshakeError::SelfConnection);
    }

    let cipher = secure.cipher();
    Ok(Established {
        stream: secure,
        peer_id: remote_id,
        extensions: remote_ext,
        cipher,
    })
}

/// Accepts a handshake on an inbound socket.
///
/// `lookup_skey` maps an MSE key hash to a stream key; `has_info_hash`
/// validates the offered info hash before our own handshake (and peer
/// ID) goes out. Returns the established connection and the info hash
/// the peer asked for.
pub async fn accept<S, H>(
    mut stream: TcpStream,
    local_id: PeerId,
    extensions: Extensions,
    enable_encryption: bool,
    force_encryption: bool,
    lookup_skey: S,
    has_info_hash: H,
) -> Result<(Established, InfoHash), HandshakeError>
where
    S: Fn(&[u8; 20]) -> Option<Vec<u8>>,
    H: Fn(&InfoHash) -> bool,
{
    // Probe the first 20 bytes: a plaintext handshake starts with the
    // protocol string, anything else is the start of an MSE exchange.
    let mut probe = [0u8; 20];
    stream.read_exact(&mut probe).await?;

    let plaintext = probe[0] == PROTOCOL_LEN && probe[1..] == PROTOCOL[..];
    let mut secure = if plaintext {
        if force_encryption {
            return Err(HandshakeError::PlaintextRefused);
        }
        SecureStream::plain_buffered(stream, BytesMut::from(&probe[..]))
    } else if enable_encryption {
        mse::handshake_incoming(stream, BytesMut::from(&probe[..]), lookup_skey, force_encryption)
            .await?
    } else {
        return Err(HandshakeError::InvalidProtocol);
    };

    let (info_hash, remote_ext) = read_handshake_head(&mut secure).await?;
    if !has_info_hash(&info_hash) {
        return Err(HandshakeError::UnknownInfoHash);
    }

    send_handshake(&mut secure, info_hash, local_id, extensions).await?;
    let remote_id = read_peer_id(&mut secure).await?;
    if remote_id == local_id {
        return Err(HandshakeError::SelfConnection);
    }

    let cipher = secure.cipher();
    Ok((
        Established {
            stream: secure,
            peer_id: remote_id,
            extensions: remote_ext,
            cipher,
        },
        info_hash,
    ))
}

async fn send_handshake(
    stream: &mut SecureStream,
    info_hash: InfoHash,
    local_id: PeerId,
    extensions: Extensions,
) -> Result<(), HandshakeError> {
    let mut msg = [0u8; 68];
    msg[0] = PROTOCOL_LEN;
    msg[1..20].copy_from_slice(PROTOCOL);
    msg[20..28].copy_from_slice(&extensions.0);
    msg[28..48].copy_from_slice(info_hash.as_bytes());
    msg[48..68].copy_from_slice(local_id.as_bytes());
    stream.write_all(&msg).await.map_err(into_io)?;
    Ok(())
}

/// Reads everything up to the peer ID: protocol string, reserved bits
/// and info hash.
async fn read_handshake_head(
    stream: &mut SecureStream,
) -> Result<(InfoHash, Extensions), HandshakeError> {
    let mut head = [0u8; 48];
    stream.read_exact(&mut head).await.map_err(into_io)?;
    if head[0] != PROTOCOL_LEN || head[1..20] != PROTOCOL[..] {
        return Err(HandshakeError::InvalidProtocol);
    }
    let mut ext = [0u8; 8];
    ext.copy_from_slice(&head[20..28]);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&head[28..48]);
    Ok((InfoHash(hash), Extensions(ext)))
}

async fn read_peer_id(stream: &mut SecureStream) -> Result<PeerId, HandshakeError> {
    let mut id = [0u8; 20];
    stream.read_exact(&mut id).await.map_err(into_io)?;
    Ok(PeerId::from_bytes(id))
}

fn into_io(err: MseError) -> HandshakeError {
    match err {
        MseError::Io(io) => HandshakeError::Io(io),
        other => HandshakeError::Mse(other),
    }
}

/// Outgoing handshaker task: dials, handshakes, posts one result.
pub(crate) async fn run_outgoing(
    addr: SocketAddr,
    config: HandshakeConfig,
    results: mpsc::Sender<OutgoingResult>,
) {
    let attempt = timeout(
        config.deadline,
        dial(
            addr,
            config.local_id,
            config.info_hash,
            config.extensions,
            config.enable_encryption,
            config.force_encryption,
        ),
    );
    let result = match attempt.await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout),
    };
    if let Err(err) = &result {
        debug!("outgoing handshake with {addr} failed: {err}");
    }
    let _ = results.send(OutgoingResult { addr, result }).await;
}

/// Incoming handshaker task for a single-torrent engine: the offered
/// info hash and the MSE stream key must both match `config.info_hash`.
pub(crate) async fn run_incoming(
    stream: TcpStream,
    addr: SocketAddr,
    config: HandshakeConfig,
    results: mpsc::Sender<IncomingResult>,
) {
    let info_hash = config.info_hash;
    let skey_hash = mse::hash_skey(info_hash.as_bytes());
    let attempt = timeout(
        config.deadline,
        accept(
            stream,
            config.local_id,
            config.extensions,
            config.enable_encryption,
            config.force_encryption,
            move |hash| (*hash == skey_hash).then(|| info_hash.as_bytes().to_vec()),
            move |offered| *offered == info_hash,
        ),
    );
    let result = match attempt.await {
        Ok(Ok((established, _))) => Ok(established),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(HandshakeError::Timeout),
    };
    if let Err(err) = &result {
        debug!("incoming handshake with {addr} failed: {err}");
    }
    let _ = results.send(IncomingResult { addr, result }).await;
}

#[cfg(test)]
mod tests;
