use super::*;
use crate::mse::hash_skey;
use tokio::net::TcpListener;

const INFO_HASH: InfoHash = InfoHash([
    0x0E, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
]);

fn ext(first: u8) -> Extensions {
    let mut bits = [0u8; 8];
    bits[0] = first;
    Extensions(bits)
}

fn id(first: u8) -> PeerId {
    let mut bytes = [0u8; 20];
    bytes[0] = first;
    PeerId::from_bytes(bytes)
}

#[tokio::test]
async fn plaintext_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dialer = tokio::spawn(async move {
        dial(addr, id(0x0C), INFO_HASH, ext(0x0A), false, false)
            .await
            .unwrap()
    });

    let (conn, _) = listener.accept().await.unwrap();
    let (accepted, offered) = accept(
        conn,
        id(0x0D),
        ext(0x0B),
        false,
        false,
        |_| None,
        |hash| *hash == INFO_HASH,
    )
    .await
    .unwrap();

    assert_eq!(accepted.cipher, Cipher::Plain);
    assert_eq!(accepted.extensions, ext(0x0A));
    assert_eq!(accepted.peer_id, id(0x0C));
    assert_eq!(offered, INFO_HASH);

    let dialed = dialer.await.unwrap();
    assert_eq!(dialed.cipher, Cipher::Plain);
    assert_eq!(dialed.extensions, ext(0x0B));
    assert_eq!(dialed.peer_id, id(0x0D));
}

#[tokio::test]
async fn encrypted_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dialer = tokio::spawn(async move {
        let mut established = dial(addr, id(0x0C), INFO_HASH, ext(0x0A), true, false)
            .await
            .unwrap();
        assert_eq!(established.cipher, Cipher::Rc4);
        assert_eq!(established.extensions, ext(0x0B));
        assert_eq!(established.peer_id, id(0x0D));

        established.stream.write_all(b"hello out").await.unwrap();
        let mut buf = [0u8; 8];
        established.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello in");
    });

    let (conn, _) = listener.accept().await.unwrap();
    let skey_hash = hash_skey(INFO_HASH.as_bytes());
    let (mut accepted, offered) = accept(
        conn,
        id(0x0D),
        ext(0x0B),
        true,
        false,
        move |hash| (*hash == skey_hash).then(|| INFO_HASH.as_bytes().to_vec()),
        |hash| *hash == INFO_HASH,
    )
    .await
    .unwrap();

    assert_eq!(accepted.cipher, Cipher::Rc4);
    assert_eq!(accepted.extensions, ext(0x0A));
    assert_eq!(accepted.peer_id, id(0x0C));
    assert_eq!(offered, INFO_HASH);

    let mut buf = [0u8; 9];
    accepted.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello out");
    accepted.stream.write_all(b"hello in").await.unwrap();

    dialer.await.unwrap();
}

#[tokio::test]
async fn unknown_info_hash_rejected_before_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dialer = tokio::spawn(async move {
        dial(addr, id(0x0C), INFO_HASH, ext(0x0A), false, false).await
    });

    let (conn, _) = listener.accept().await.unwrap();
    let err = accept(
        conn,
        id(0x0D),
        ext(0x0B),
        false,
        false,
        |_| None,
        |_| false,
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, HandshakeError::UnknownInfoHash));

    // The dialer never saw a handshake back, let alone a peer ID.
    assert!(dialer.await.unwrap().is_err());
}

#[tokio::test]
async fn self_connection_detected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let same = id(0x0C);

    let dialer =
        tokio::spawn(async move { dial(addr, same, INFO_HASH, ext(0x0A), false, false).await });

    let (conn, _) = listener.accept().await.unwrap();
    let accept_result = accept(
        conn,
        same,
        ext(0x0A),
        false,
        false,
        |_| None,
        |hash| *hash == INFO_HASH,
    )
    .await;
    assert!(matches!(
        accept_result.err().unwrap(),
        HandshakeError::SelfConnection
    ));

    let dial_result = dialer.await.unwrap();
    assert!(matches!(
        dial_result.err().unwrap(),
        HandshakeError::SelfConnection
    ));
}

#[tokio::test]
async fn forced_encryption_refuses_plaintext() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dialer = tokio::spawn(async move {
        // Plaintext dialer against an acceptor that requires MSE.
        dial(addr, id(0x0C), INFO_HASH, ext(0x0A), false, false).await
    });

    let (conn, _) = listener.accept().await.unwrap();
    let err = accept(
        conn,
        id(0x0D),
        ext(0x0B),
        true,
        true,
        |_| Some(INFO_HASH.as_bytes().to_vec()),
        |hash| *hash == INFO_HASH,
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, HandshakeError::PlaintextRefused));

    assert!(dialer.await.unwrap().is_err());
}
