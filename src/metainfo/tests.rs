use super::*;

fn single_file_torrent() -> Vec<u8> {
    // 40000 bytes in 16 KiB pieces: two full pieces and a short third.
    let mut data = Vec::new();
    data.extend_from_slice(b"d8:announce21:http://tracker.local/4:infod");
    data.extend_from_slice(b"6:lengthi40000e4:name8:test.bin12:piece lengthi16384e");
    data.extend_from_slice(b"6:pieces60:");
    data.extend_from_slice(&[0xAA; 60]);
    data.extend_from_slice(b"ee");
    data
}

#[test]
fn parse_single_file() {
    let meta = Metainfo::from_bytes(&single_file_torrent()).unwrap();
    assert_eq!(meta.announce.as_deref(), Some("http://tracker.local/"));
    assert_eq!(meta.info.name, "test.bin");
    assert_eq!(meta.info.piece_length, 16384);
    assert_eq!(meta.info.num_pieces, 3);
    assert_eq!(meta.info.total_length, 40000);
    assert_eq!(meta.info.files.len(), 1);
    assert_eq!(meta.info.files[0].length, 40000);
    assert_eq!(meta.info.piece_length_of(0), 16384);
    assert_eq!(meta.info.piece_length_of(2), 40000 - 2 * 16384);
}

#[test]
fn info_hash_covers_info_dict_only() {
    let meta = Metainfo::from_bytes(&single_file_torrent()).unwrap();
    // Hash of the raw info bytes must match what the parser computed.
    assert_eq!(InfoHash::of(&meta.info.raw), meta.info.hash);
    // And re-parsing the raw bytes alone yields the same hash.
    let info = Info::from_bytes(&meta.info.raw).unwrap();
    assert_eq!(info.hash, meta.info.hash);
}

#[test]
fn parse_multi_file() {
    let mut data = Vec::new();
    data.extend_from_slice(b"d4:infod");
    data.extend_from_slice(b"5:filesl");
    data.extend_from_slice(b"d6:lengthi16384e4:pathl5:a.bineed");
    data.extend_from_slice(b"6:lengthi100e4:pathl3:sub5:b.bineee");
    data.extend_from_slice(b"4:name3:dir12:piece lengthi16384e");
    data.extend_from_slice(b"6:pieces40:");
    data.extend_from_slice(&[0xBB; 40]);
    data.extend_from_slice(b"ee");

    let meta = Metainfo::from_bytes(&data).unwrap();
    assert_eq!(meta.info.files.len(), 2);
    assert_eq!(meta.info.files[0].offset, 0);
    assert_eq!(meta.info.files[1].offset, 16384);
    assert_eq!(
        meta.info.files[1].path,
        std::path::PathBuf::from("dir/sub/b.bin")
    );
    assert_eq!(meta.info.total_length, 16484);
}

#[test]
fn reject_path_escape() {
    let mut data = Vec::new();
    data.extend_from_slice(b"d4:infod");
    data.extend_from_slice(b"5:filesl");
    data.extend_from_slice(b"d6:lengthi10e4:pathl2:..7:pwn.bineee");
    data.extend_from_slice(b"4:name3:dir12:piece lengthi16384e");
    data.extend_from_slice(b"6:pieces20:");
    data.extend_from_slice(&[0xCC; 20]);
    data.extend_from_slice(b"ee");
    assert!(Metainfo::from_bytes(&data).is_err());
}

#[test]
fn reject_piece_count_mismatch() {
    // 40000 bytes needs 3 pieces, only 2 hashes given.
    let mut data = Vec::new();
    data.extend_from_slice(b"d4:infod");
    data.extend_from_slice(b"6:lengthi40000e4:name1:x12:piece lengthi16384e");
    data.extend_from_slice(b"6:pieces40:");
    data.extend_from_slice(&[0xAA; 40]);
    data.extend_from_slice(b"ee");
    assert!(Metainfo::from_bytes(&data).is_err());
}

#[test]
fn piece_hash_slicing() {
    let meta = Metainfo::from_bytes(&single_file_torrent()).unwrap();
    assert_eq!(meta.info.piece_hash(0), [0xAA; 20]);
    assert_eq!(meta.info.piece_hash(2), [0xAA; 20]);
}

#[test]
fn parse_magnet() {
    let link = MagnetLink::parse(
        "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a\
         &dn=some+file&tr=http%3A%2F%2Ftracker.local%2Fannounce",
    )
    .unwrap();
    assert_eq!(
        link.info_hash.to_hex(),
        "c12fe1c06bba254a9dc9f519b335aa7c1367a88a"
    );
    assert_eq!(link.name.as_deref(), Some("some file"));
    assert_eq!(link.trackers, vec!["http://tracker.local/announce"]);
}

#[test]
fn reject_magnet_without_hash() {
    assert!(MagnetLink::parse("magnet:?dn=nothing").is_err());
}
