use super::*;
use bytes::Bytes;
use std::collections::BTreeMap;

#[test]
fn decode_integers() {
    assert_eq!(decode(b"i42e").unwrap().as_int(), Some(42));
    assert_eq!(decode(b"i-7e").unwrap().as_int(), Some(-7));
    assert_eq!(decode(b"i0e").unwrap().as_int(), Some(0));
}

#[test]
fn reject_bad_integers() {
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"i007e").is_err());
    assert!(decode(b"i12").is_err());
}

#[test]
fn decode_strings() {
    assert_eq!(decode(b"4:spam").unwrap().as_str(), Some("spam"));
    assert_eq!(decode(b"0:").unwrap().as_bytes().unwrap().len(), 0);
    assert!(decode(b"5:spam").is_err());
    assert!(decode(b"4spam").is_err());
}

#[test]
fn decode_nested() {
    let v = decode(b"d4:spaml1:a1:bee").unwrap();
    let list = v.get(b"spam").and_then(|v| v.as_list()).unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].as_str(), Some("a"));
}

#[test]
fn reject_trailing_data() {
    assert!(decode(b"i1ei2e").is_err());
    assert_eq!(decode_prefix(b"i1ei2e").unwrap().1, 3);
}

#[test]
fn reject_non_string_keys() {
    assert!(decode(b"di1ei2ee").is_err());
}

#[test]
fn reject_deep_nesting() {
    let mut data = Vec::new();
    data.extend(std::iter::repeat_n(b'l', 100));
    data.extend(std::iter::repeat_n(b'e', 100));
    assert_eq!(decode(&data), Err(BencodeError::TooDeep));
}

#[test]
fn encode_sorts_dict_keys() {
    let mut map = BTreeMap::new();
    map.insert(Bytes::from_static(b"zz"), Value::Int(1));
    map.insert(Bytes::from_static(b"aa"), Value::Int(2));
    assert_eq!(encode(&Value::Dict(map)), b"d2:aai2e2:zzi1ee");
}

#[test]
fn round_trip() {
    let original = b"d3:bar4:spam3:fooi42e4:listl1:xi9eee";
    let value = decode(original).unwrap();
    assert_eq!(encode(&value), original);
}

#[test]
fn prefix_stops_at_value_end() {
    // A ut_metadata data message: dict followed by raw piece bytes.
    let payload = b"d8:msg_typei1e5:piecei0ee\x01\x02\x03";
    let (value, used) = decode_prefix(payload).unwrap();
    assert_eq!(value.get(b"msg_type").and_then(|v| v.as_int()), Some(1));
    assert_eq!(&payload[used..], &[1, 2, 3]);
}
