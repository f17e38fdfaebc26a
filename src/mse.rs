//! Message Stream Encryption (MSE / protocol encryption).
//!
//! MSE wraps a TCP connection in a Diffie-Hellman exchange followed by
//! an obfuscated negotiation, producing either a plaintext or an
//! RC4-encrypted stream. The outgoing side knows the stream key (the
//! info hash); the incoming side recovers it through a keyed hash
//! lookup, so a listener can serve many torrents without revealing
//! which ones it has.

use bytes::{Buf, BytesMut};
use num_bigint::BigUint;
use rand::RngCore;
use rc4::{consts::U20, KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// The 768-bit prime every MSE implementation agrees on; generator is 2.
const PRIME_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
                         020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
                         4FE1356D6D51C245E485B576625E7EC6F44C42E9A63A36210000000000090563";

const PUBLIC_KEY_LEN: usize = 96;
const PRIVATE_KEY_LEN: usize = 20;
const MAX_PAD: usize = 512;
const VC: [u8; 8] = [0; 8];

const CRYPTO_PLAIN: u32 = 0x01;
const CRYPTO_RC4: u32 = 0x02;

/// Errors during the encrypted-stream negotiation.
#[derive(Debug, Error)]
pub enum MseError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not find the synchronization marker in the peer's stream.
    #[error("handshake synchronization failed")]
    Sync,

    /// The incoming key hash matches no active torrent.
    #[error("unknown stream key")]
    UnknownSKey,

    /// Verification constant did not decrypt to zeros.
    #[error("verification constant mismatch")]
    BadVc,

    /// Peer offered or selected no cipher we accept.
    #[error("no acceptable cipher")]
    NoCipher,

    /// Declared padding or payload length out of range.
    #[error("invalid handshake length field")]
    BadLength,
}

/// The cipher a finished handshake settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Plain,
    Rc4,
}

/// Hashes the stream key the way incoming handshakes look it up:
/// `SHA1("req2" || skey)`.
pub fn hash_skey(skey: &[u8]) -> [u8; 20] {
    hash(&[b"req2", skey])
}

fn hash(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn xor20(a: [u8; 20], b: [u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

struct Rc4Stream(Rc4<U20>);

impl Rc4Stream {
    /// Keys the stream and discards the first 1024 bytes, which MSE
    /// requires on both directions.
    fn new(key: &[u8; 20]) -> Self {
        let mut rc4 = Rc4::<U20>::new(key.into());
        let mut burn = [0u8; 1024];
        rc4.apply_keystream(&mut burn);
        Self(rc4)
    }

    fn apply(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

fn prime() -> BigUint {
    BigUint::parse_bytes(PRIME_HEX.replace(' ', "").as_bytes(), 16)
        .expect("prime constant parses")
}

fn keypair() -> (BigUint, [u8; PUBLIC_KEY_LEN]) {
    let mut secret = [0u8; PRIVATE_KEY_LEN];
    rand::rng().fill_bytes(&mut secret);
    let x = BigUint::from_bytes_be(&secret);
    let y = BigUint::from(2u32).modpow(&x, &prime());
    (x, pad_be(&y))
}

fn shared_secret(x: &BigUint, remote_public: &[u8]) -> [u8; PUBLIC_KEY_LEN] {
    let remote = BigUint::from_bytes_be(remote_public);
    pad_be(&remote.modpow(x, &prime()))
}

fn pad_be(n: &BigUint) -> [u8; PUBLIC_KEY_LEN] {
    let bytes = n.to_bytes_be();
    let mut out = [0u8; PUBLIC_KEY_LEN];
    out[PUBLIC_KEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

fn random_pad() -> Vec<u8> {
    let mut rng = rand::rng();
    let len = rng.next_u32() as usize % (MAX_PAD + 1);
    let mut pad = vec![0u8; len];
    rng.fill_bytes(&mut pad);
    pad
}

/// A TCP stream with an optionally negotiated RC4 layer.
///
/// Bytes pushed back by the handshake (already decrypted) are served
/// before anything still sitting in the raw read-ahead buffer, which is
/// decrypted only as it is consumed.
pub struct SecureStream {
    stream: TcpStream,
    recv: Option<Rc4Stream>,
    send: Option<Rc4Stream>,
    pending: BytesMut,
    raw: BytesMut,
}

impl SecureStream {
    /// Wraps a stream with no encryption at all.
    pub fn plain(stream: TcpStream) -> Self {
        Self::assemble(stream, None, None, BytesMut::new(), BytesMut::new())
    }

    /// Plain stream with bytes the caller already read off the socket.
    pub(crate) fn plain_buffered(stream: TcpStream, pending: BytesMut) -> Self {
        Self::assemble(stream, None, None, pending, BytesMut::new())
    }

    fn assemble(
        stream: TcpStream,
        recv: Option<Rc4Stream>,
        send: Option<Rc4Stream>,
        pending: BytesMut,
        raw: BytesMut,
    ) -> Self {
        Self {
            stream,
            recv,
            send,
            pending,
            raw,
        }
    }

    pub fn cipher(&self) -> Cipher {
        if self.recv.is_some() {
            Cipher::Rc4
        } else {
            Cipher::Plain
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), MseError> {
        let mut filled = 0;
        while filled < buf.len() {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&self.pending.split_to(n));
                filled += n;
            } else if !self.raw.is_empty() {
                let n = self.raw.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&self.raw.split_to(n));
                if let Some(rc4) = &mut self.recv {
                    rc4.apply(&mut buf[filled..filled + n]);
                }
                filled += n;
            } else {
                let n = self.stream.read(&mut buf[filled..]).await?;
                if n == 0 {
                    return Err(MseError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
                if let Some(rc4) = &mut self.recv {
                    rc4.apply(&mut buf[filled..filled + n]);
                }
                filled += n;
            }
        }
        Ok(())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), MseError> {
        match &mut self.send {
            Some(rc4) => {
                let mut out = data.to_vec();
                rc4.apply(&mut out);
                self.stream.write_all(&out).await?;
            }
            None => self.stream.write_all(data).await?,
        }
        Ok(())
    }

    /// Splits into reader and writer halves for the per-peer tasks.
    pub(crate) fn into_split(self) -> (SecureReader, SecureWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            SecureReader {
                half: read_half,
                rc4: self.recv,
                pending: self.pending,
                raw: self.raw,
            },
            SecureWriter {
                half: write_half,
                rc4: self.send,
            },
        )
    }
}

/// Read half of a [`SecureStream`].
pub(crate) struct SecureReader {
    half: OwnedReadHalf,
    rc4: Option<Rc4Stream>,
    pending: BytesMut,
    raw: BytesMut,
}

impl SecureReader {
    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), std::io::Error> {
        let mut filled = 0;
        while filled < buf.len() {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&self.pending.split_to(n));
                filled += n;
            } else if !self.raw.is_empty() {
                let n = self.raw.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&self.raw.split_to(n));
                if let Some(rc4) = &mut self.rc4 {
                    rc4.apply(&mut buf[filled..filled + n]);
                }
                filled += n;
            } else {
                let n = self.half.read(&mut buf[filled..]).await?;
                if n == 0 {
                    return Err(std::io::ErrorKind::UnexpectedEof.into());
                }
                if let Some(rc4) = &mut self.rc4 {
                    rc4.apply(&mut buf[filled..filled + n]);
                }
                filled += n;
            }
        }
        Ok(())
    }
}

/// Write half of a [`SecureStream`].
pub(crate) struct SecureWriter {
    half: OwnedWriteHalf,
    rc4: Option<Rc4Stream>,
}

impl SecureWriter {
    pub(crate) async fn write_all(&mut self, data: &[u8]) -> Result<(), std::io::Error> {
        match &mut self.rc4 {
            Some(rc4) => {
                let mut out = data.to_vec();
                rc4.apply(&mut out);
                self.half.write_all(&out).await
            }
            None => self.half.write_all(data).await,
        }
    }
}

/// Runs the outgoing side of the MSE handshake.
///
/// `skey` is the stream key (the torrent's info hash). With `force` the
/// handshake only offers RC4 and fails if the peer selects plaintext.
pub async fn handshake_outgoing(
    mut stream: TcpStream,
    skey: &[u8],
    force: bool,
) -> Result<SecureStream, MseError> {
    let (x, public) = keypair();

    let mut first = Vec::with_capacity(PUBLIC_KEY_LEN + MAX_PAD);
    first.extend_from_slice(&public);
    first.extend_from_slice(&random_pad());
    stream.write_all(&first).await?;

    let mut remote_public = [0u8; PUBLIC_KEY_LEN];
    stream.read_exact(&mut remote_public).await?;
    let secret = shared_secret(&x, &remote_public);

    let mut send = Rc4Stream::new(&hash(&[b"keyA", &secret, skey]));
    let mut recv = Rc4Stream::new(&hash(&[b"keyB", &secret, skey]));

    let provide = if force {
        CRYPTO_RC4
    } else {
        CRYPTO_RC4 | CRYPTO_PLAIN
    };

    let mut negotiation = Vec::with_capacity(60);
    negotiation.extend_from_slice(&hash(&[b"req1", &secret]));
    negotiation.extend_from_slice(&xor20(hash_skey(skey), hash(&[b"req3", &secret])));
    let mut sealed = [0u8; 16];
    sealed[..8].copy_from_slice(&VC);
    sealed[8..12].copy_from_slice(&provide.to_be_bytes());
    // Zero-length PadC and IA; the BitTorrent handshake follows the
    // finished negotiation instead of riding inside it.
    send.apply(&mut sealed);
    negotiation.extend_from_slice(&sealed);
    stream.write_all(&negotiation).await?;

    // The peer's reply starts after PadB: sync on the encrypted VC.
    let mut needle = VC;
    recv.apply(&mut needle);
    let mut raw = BytesMut::with_capacity(MAX_PAD + 64);
    scan_for(&mut stream, &mut raw, &needle, MAX_PAD + needle.len()).await?;

    let mut tail = [0u8; 6];
    read_raw_exact(&mut stream, &mut raw, &mut tail).await?;
    recv.apply(&mut tail);
    let select = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let pad_len = u16::from_be_bytes([tail[4], tail[5]]) as usize;
    if pad_len > MAX_PAD {
        return Err(MseError::BadLength);
    }
    let mut pad = vec![0u8; pad_len];
    read_raw_exact(&mut stream, &mut raw, &mut pad).await?;
    recv.apply(&mut pad);

    match select {
        CRYPTO_RC4 => Ok(SecureStream::assemble(
            stream,
            Some(recv),
            Some(send),
            BytesMut::new(),
            raw,
        )),
        CRYPTO_PLAIN if !force => Ok(SecureStream::assemble(
            stream,
            None,
            None,
            BytesMut::new(),
            raw,
        )),
        _ => Err(MseError::NoCipher),
    }
}

/// Runs the incoming side of the MSE handshake.
///
/// `prefix` holds bytes the caller already consumed while probing for a
/// plaintext BitTorrent handshake; they are the start of the remote
/// public key. `lookup` maps a hashed stream key to the stream key of an
/// active torrent, or `None` to refuse the connection.
pub async fn handshake_incoming<F>(
    mut stream: TcpStream,
    prefix: BytesMut,
    lookup: F,
    force: bool,
) -> Result<SecureStream, MseError>
where
    F: Fn(&[u8; 20]) -> Option<Vec<u8>>,
{
    let mut raw = prefix;

    let mut remote_public = [0u8; PUBLIC_KEY_LEN];
    read_raw_exact(&mut stream, &mut raw, &mut remote_public).await?;
    let (x, public) = keypair();
    let secret = shared_secret(&x, &remote_public);

    let mut reply = Vec::with_capacity(PUBLIC_KEY_LEN + MAX_PAD);
    reply.extend_from_slice(&public);
    reply.extend_from_slice(&random_pad());
    stream.write_all(&reply).await?;

    // Sync on HASH("req1", S) after the peer's PadA.
    let needle = hash(&[b"req1", &secret]);
    scan_for(&mut stream, &mut raw, &needle, MAX_PAD + needle.len()).await?;

    let mut keyed = [0u8; 20];
    read_raw_exact(&mut stream, &mut raw, &mut keyed).await?;
    let skey_hash = xor20(keyed, hash(&[b"req3", &secret]));
    let skey = lookup(&skey_hash).ok_or(MseError::UnknownSKey)?;

    let mut recv = Rc4Stream::new(&hash(&[b"keyA", &secret, &skey]));
    let mut send = Rc4Stream::new(&hash(&[b"keyB", &secret, &skey]));

    let mut head = [0u8; 14];
    read_raw_exact(&mut stream, &mut raw, &mut head).await?;
    recv.apply(&mut head);
    if head[..8] != VC {
        return Err(MseError::BadVc);
    }
    let provide = u32::from_be_bytes([head[8], head[9], head[10], head[11]]);
    let pad_len = u16::from_be_bytes([head[12], head[13]]) as usize;
    if pad_len > MAX_PAD {
        return Err(MseError::BadLength);
    }
    let mut pad = vec![0u8; pad_len];
    read_raw_exact(&mut stream, &mut raw, &mut pad).await?;
    recv.apply(&mut pad);

    let mut ia_len = [0u8; 2];
    read_raw_exact(&mut stream, &mut raw, &mut ia_len).await?;
    recv.apply(&mut ia_len);
    let ia_len = u16::from_be_bytes(ia_len) as usize;
    let mut initial = BytesMut::zeroed(ia_len);
    read_raw_exact(&mut stream, &mut raw, &mut initial).await?;
    recv.apply(&mut initial);

    let select = if provide & CRYPTO_RC4 != 0 {
        CRYPTO_RC4
    } else if provide & CRYPTO_PLAIN != 0 && !force {
        CRYPTO_PLAIN
    } else {
        return Err(MseError::NoCipher);
    };

    let mut answer = [0u8; 14];
    answer[..8].copy_from_slice(&VC);
    answer[8..12].copy_from_slice(&select.to_be_bytes());
    send.apply(&mut answer);
    stream.write_all(&answer).await?;

    let (recv, send) = if select == CRYPTO_RC4 {
        (Some(recv), Some(send))
    } else {
        (None, None)
    };
    Ok(SecureStream::assemble(stream, recv, send, initial, raw))
}

/// Reads into `buf`, serving bytes already sitting in `raw` first.
async fn read_raw_exact(
    stream: &mut TcpStream,
    raw: &mut BytesMut,
    buf: &mut [u8],
) -> Result<(), MseError> {
    let n = raw.len().min(buf.len());
    buf[..n].copy_from_slice(&raw.split_to(n));
    if n < buf.len() {
        stream.read_exact(&mut buf[n..]).await?;
    }
    Ok(())
}

/// Buffers from the socket until `needle` appears within `max` bytes of
/// scanning, then consumes everything up to and including it.
async fn scan_for(
    stream: &mut TcpStream,
    raw: &mut BytesMut,
    needle: &[u8],
    max: usize,
) -> Result<(), MseError> {
    loop {
        if let Some(pos) = find(raw, needle) {
            raw.advance(pos + needle.len());
            return Ok(());
        }
        if raw.len() > max + needle.len() {
            return Err(MseError::Sync);
        }
        let n = stream.read_buf(raw).await?;
        if n == 0 {
            return Err(MseError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn rc4_round_trip_over_loopback() {
        let skey = b"twenty-byte-skey-xx!".to_vec();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let skey_clone = skey.clone();
        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let expected = hash_skey(&skey_clone);
            let mut stream = handshake_incoming(
                conn,
                BytesMut::new(),
                move |h| (h == &expected).then(|| skey_clone.clone()),
                true,
            )
            .await
            .unwrap();
            assert_eq!(stream.cipher(), Cipher::Rc4);

            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping!");
            stream.write_all(b"pong!").await.unwrap();
        });

        let conn = TcpStream::connect(addr).await.unwrap();
        let mut stream = handshake_outgoing(conn, &skey, true).await.unwrap();
        assert_eq!(stream.cipher(), Cipher::Rc4);

        stream.write_all(b"ping!").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_skey_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let err = handshake_incoming(conn, BytesMut::new(), |_| None, false)
                .await
                .err()
                .unwrap();
            assert!(matches!(err, MseError::UnknownSKey));
        });

        let conn = TcpStream::connect(addr).await.unwrap();
        // The dialer fails once the listener hangs up without answering.
        let _ = handshake_outgoing(conn, b"some-other-stream-key", true).await;
        server.await.unwrap();
    }
}
