use super::*;
use bytes::Bytes;

fn round_trip(message: Message) {
    let encoded = message.encode();
    let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
    assert_eq!(encoded.len(), 4 + length);
    let decoded = Message::decode(encoded.slice(4..)).unwrap();
    assert_eq!(decoded, message);
}

#[test]
fn message_round_trips() {
    round_trip(Message::KeepAlive);
    round_trip(Message::Choke);
    round_trip(Message::Unchoke);
    round_trip(Message::Interested);
    round_trip(Message::NotInterested);
    round_trip(Message::Have { index: 42 });
    round_trip(Message::Bitfield(Bytes::from_static(&[0xF0, 0x0F])));
    round_trip(Message::Request {
        index: 1,
        begin: 16384,
        length: 16384,
    });
    round_trip(Message::Piece {
        index: 2,
        begin: 32768,
        data: Bytes::from_static(b"block data"),
    });
    round_trip(Message::Cancel {
        index: 1,
        begin: 0,
        length: 16384,
    });
    round_trip(Message::Suggest { index: 7 });
    round_trip(Message::HaveAll);
    round_trip(Message::HaveNone);
    round_trip(Message::Reject {
        index: 3,
        begin: 0,
        length: 16384,
    });
    round_trip(Message::AllowedFast { index: 9 });
    round_trip(Message::Extended {
        id: 1,
        payload: Bytes::from_static(b"d5:magic5:bytese"),
    });
}

#[test]
fn decode_rejects_garbage() {
    // Unknown message ID.
    assert!(Message::decode(Bytes::from_static(&[99])).is_err());
    // Have with a short payload.
    assert!(Message::decode(Bytes::from_static(&[4, 0, 0])).is_err());
    // Choke with a stray payload.
    assert!(Message::decode(Bytes::from_static(&[0, 1])).is_err());
    // Request with a truncated triple.
    assert!(Message::decode(Bytes::from_static(&[6, 0, 0, 0, 1])).is_err());
}

#[test]
fn extensions_flags() {
    let ours = Extensions::ours();
    assert!(ours.fast());
    assert!(ours.extension_protocol());

    let none = Extensions::none();
    assert!(!none.fast());
    assert_eq!(ours.intersect(&none).0, [0u8; 8]);
    assert_eq!(ours.intersect(&ours), ours);
}

#[test]
fn bitfield_round_trip_preserves_bits() {
    let mut bf = Bitfield::new(21);
    bf.set(0);
    bf.set(7);
    bf.set(8);
    bf.set(20);

    let reparsed = Bitfield::from_bytes(bf.bytes(), 21).unwrap();
    assert_eq!(reparsed, bf);
    assert_eq!(reparsed.count(), 4);
}

#[test]
fn bitfield_spare_bits_stay_zero() {
    // 21 pieces leave 3 spare bits in the last byte.
    let bf = Bitfield::from_bytes(&[0xFF, 0xFF, 0xFF], 21).unwrap();
    assert_eq!(bf.count(), 21);
    assert_eq!(bf.bytes()[2], 0b1111_1000);
    assert!(bf.all());

    let mut bf = Bitfield::new(21);
    bf.set(20);
    bf.set(21); // out of range, ignored
    bf.set(200);
    assert_eq!(bf.count(), 1);
    assert!(!bf.test(21));
}

#[test]
fn bitfield_rejects_wrong_length() {
    assert!(Bitfield::from_bytes(&[0xFF], 21).is_none());
    assert!(Bitfield::from_bytes(&[0, 0, 0, 0], 21).is_none());
}

#[test]
fn extension_handshake_round_trip() {
    let ours = ExtensionHandshake::ours(6881, Some(12345));
    let decoded = ExtensionHandshake::decode(&ours.encode()).unwrap();
    assert_eq!(decoded.metadata_id(), Some(LOCAL_METADATA_ID));
    assert_eq!(decoded.p, Some(6881));
    assert_eq!(decoded.metadata_size, Some(12345));
    assert!(decoded.v.unwrap().starts_with("downpour"));
}

#[test]
fn extension_handshake_without_metadata() {
    let hs = ExtensionHandshake::ours(6881, None);
    let decoded = ExtensionHandshake::decode(&hs.encode()).unwrap();
    assert_eq!(decoded.metadata_size, None);
}

#[test]
fn metadata_message_round_trips() {
    let request = MetadataMessage::request(3);
    assert_eq!(MetadataMessage::decode(&request.encode()).unwrap(), request);

    let data = MetadataMessage::data(0, 100, Bytes::from_static(b"the info bytes"));
    let decoded = MetadataMessage::decode(&data.encode()).unwrap();
    assert_eq!(decoded.kind, MetadataKind::Data);
    assert_eq!(decoded.total_size, Some(100));
    assert_eq!(decoded.data.as_deref(), Some(b"the info bytes".as_slice()));

    let reject = MetadataMessage::reject(9);
    assert_eq!(MetadataMessage::decode(&reject.encode()).unwrap(), reject);
}

#[test]
fn peer_id_has_client_prefix() {
    let id = PeerId::local();
    assert_eq!(id.client(), Some("RN0001"));
    // Stable for the process lifetime.
    assert_eq!(PeerId::local(), id);
    // Fresh ids differ in their random tail.
    assert_ne!(PeerId::generate(), PeerId::generate());
}

#[test]
fn allowed_fast_set_is_deterministic() {
    let info_hash = [0xAB; 20];
    let ip = "80.4.4.200".parse().unwrap();

    let a = allowed_fast_set(&info_hash, ip, 1000, 10);
    let b = allowed_fast_set(&info_hash, ip, 1000, 10);
    assert_eq!(a, b);
    assert_eq!(a.len(), 10);
    assert!(a.iter().all(|&index| index < 1000));

    // The low octet is masked out for IPv4.
    let sibling = allowed_fast_set(&info_hash, "80.4.4.7".parse().unwrap(), 1000, 10);
    assert_eq!(a, sibling);

    // Never more grants than pieces.
    let tiny = allowed_fast_set(&info_hash, ip, 3, 10);
    assert_eq!(tiny.len(), 3);
}
