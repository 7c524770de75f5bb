//! Pure decoders for device payloads.
//!
//! Three wire formats meet here: BSON value documents on data topics, the
//! `;`-separated introspection string, and the zlib-compressed properties
//! list used by `/producer/properties`.

use byteorder::{BigEndian, ByteOrder};
use bson::spec::BinarySubtype;
use bson::{Bson, Document};
use dataplant_models::constants::SAFE_INFLATE_MAX;
use flate2::read::ZlibDecoder;
use std::collections::HashSet;
use std::io::Read;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PayloadError {
    #[error("undecodable BSON payload")]
    UndecodableBson,
    #[error("decompressed size exceeds {max} bytes", max = SAFE_INFLATE_MAX)]
    Oversize,
    #[error("corrupt zlib stream")]
    CorruptZlib,
    #[error("invalid introspection payload")]
    InvalidIntrospection,
    #[error("invalid properties payload")]
    InvalidProperties,
}

/// A decoded data payload.
///
/// `value == None` covers both the empty payload and the explicit unset
/// marker (`{v: <empty generic binary>}`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedPayload {
    pub value: Option<Bson>,
    pub timestamp_ms: Option<i64>,
    pub metadata: Option<Document>,
}

/// Decode a device data payload.
///
/// Accepted document shapes: `{v, t, m}`, `{v, m}`, `{v, t}`, `{v}`, and
/// the legacy bare map used by old aggregated-object publishers. An empty
/// payload decodes to all-`None`.
pub fn decode_bson_payload(payload: &[u8]) -> Result<DecodedPayload, PayloadError> {
    if payload.is_empty() {
        return Ok(DecodedPayload::default());
    }

    let doc = Document::from_reader(&mut std::io::Cursor::new(payload))
        .map_err(|_| PayloadError::UndecodableBson)?;

    if !doc.contains_key("v") {
        // Legacy aggregated object: the document itself is the value.
        return Ok(DecodedPayload {
            value: Some(Bson::Document(doc)),
            timestamp_ms: None,
            metadata: None,
        });
    }

    let timestamp_ms = match doc.get("t") {
        None => None,
        Some(Bson::DateTime(dt)) => Some(dt.timestamp_millis()),
        Some(_) => return Err(PayloadError::UndecodableBson),
    };

    let metadata = match doc.get("m") {
        None => None,
        Some(Bson::Document(m)) => Some(m.clone()),
        Some(_) => return Err(PayloadError::UndecodableBson),
    };

    let value = match doc.get("v") {
        Some(Bson::Binary(bin))
            if bin.subtype == BinarySubtype::Generic && bin.bytes.is_empty() =>
        {
            // Explicit unset marker.
            None
        }
        Some(value) => Some(value.clone()),
        None => unreachable!("checked contains_key above"),
    };

    Ok(DecodedPayload {
        value,
        timestamp_ms,
        metadata,
    })
}

/// Inflate a zlib stream, refusing anything above [`SAFE_INFLATE_MAX`].
pub fn safe_inflate(data: &[u8]) -> Result<Vec<u8>, PayloadError> {
    let mut out = Vec::new();
    let mut decoder = ZlibDecoder::new(data).take(SAFE_INFLATE_MAX as u64 + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| PayloadError::CorruptZlib)?;
    if out.len() > SAFE_INFLATE_MAX {
        return Err(PayloadError::Oversize);
    }
    Ok(out)
}

/// Decode a `/producer/properties` payload into the set of
/// `(interface, path)` pairs the device still holds.
///
/// The wire form is a 4-byte big-endian uncompressed-size prefix followed
/// by a zlib stream of `iface1/path1;iface2/path2;…`. The literal four zero
/// bytes mean the empty set.
pub fn decode_device_properties_payload(
    payload: &[u8],
) -> Result<HashSet<(String, String)>, PayloadError> {
    if payload == [0u8, 0, 0, 0] {
        return Ok(HashSet::new());
    }
    if payload.len() < 4 {
        return Err(PayloadError::InvalidProperties);
    }

    // The size prefix is advisory; the inflate cap is what actually bounds
    // the decompression.
    let _declared = BigEndian::read_u32(&payload[..4]);

    let inflated = safe_inflate(&payload[4..])?;
    let text =
        std::str::from_utf8(&inflated).map_err(|_| PayloadError::InvalidProperties)?;

    let mut entries = HashSet::new();
    for token in text.split(';').filter(|t| !t.is_empty()) {
        let slash = token
            .find('/')
            .ok_or(PayloadError::InvalidProperties)?;
        let (interface, path) = token.split_at(slash);
        if interface.is_empty() || path.len() < 2 {
            return Err(PayloadError::InvalidProperties);
        }
        entries.insert((interface.to_string(), path.to_string()));
    }
    Ok(entries)
}

/// Encode a value the way devices receive it: a `{v: <value>}` document,
/// with BSON null standing in for a missing value.
pub fn encode_bson_value(value: Option<&Bson>) -> Vec<u8> {
    let doc = bson::doc! { "v": value.cloned().unwrap_or(Bson::Null) };
    bson::to_vec(&doc).unwrap_or_default()
}

/// Encode a properties list for the control channel: 4-byte big-endian
/// uncompressed size followed by the zlib stream.
pub fn encode_properties_payload(text: &str) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut payload = vec![0u8; 4];
    BigEndian::write_u32(&mut payload[..4], text.len() as u32);
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    let compressed = encoder
        .write_all(text.as_bytes())
        .and_then(|_| encoder.finish())
        .unwrap_or_default();
    payload.extend_from_slice(&compressed);
    payload
}

/// One entry of a device-declared introspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntrospectionEntry {
    pub name: String,
    pub major: i32,
    pub minor: i32,
}

/// Parse an introspection string: `name:major:minor[;…]`.
///
/// Names must match `[a-zA-Z]+(\.[a-zA-Z0-9]+)*`; versions are
/// non-negative integers.
pub fn parse_introspection(payload: &[u8]) -> Result<Vec<IntrospectionEntry>, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::InvalidIntrospection)?;

    let mut entries = Vec::new();
    for token in text.split(';').filter(|t| !t.is_empty()) {
        let mut parts = token.split(':');
        let name = parts.next().ok_or(PayloadError::InvalidIntrospection)?;
        let major = parts.next().ok_or(PayloadError::InvalidIntrospection)?;
        let minor = parts.next().ok_or(PayloadError::InvalidIntrospection)?;
        if parts.next().is_some() || !is_valid_interface_name(name) {
            return Err(PayloadError::InvalidIntrospection);
        }
        entries.push(IntrospectionEntry {
            name: name.to_string(),
            major: parse_version(major)?,
            minor: parse_version(minor)?,
        });
    }
    Ok(entries)
}

fn parse_version(s: &str) -> Result<i32, PayloadError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PayloadError::InvalidIntrospection);
    }
    s.parse::<i32>()
        .map_err(|_| PayloadError::InvalidIntrospection)
}

/// `[a-zA-Z]+(\.[a-zA-Z0-9]+)*`
fn is_valid_interface_name(name: &str) -> bool {
    let mut parts = name.split('.');
    let Some(first) = parts.next() else {
        return false;
    };
    if first.is_empty() || !first.bytes().all(|b| b.is_ascii_alphabetic()) {
        return false;
    }
    parts.all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_alphanumeric()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn deflate(text: &str) -> Vec<u8> {
        let mut payload = vec![0u8; 4];
        BigEndian::write_u32(&mut payload[..4], text.len() as u32);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        payload.extend_from_slice(&encoder.finish().unwrap());
        payload
    }

    #[test]
    fn empty_payload_is_all_none() {
        assert_eq!(decode_bson_payload(b"").unwrap(), DecodedPayload::default());
    }

    #[test]
    fn value_with_timestamp() {
        let payload = bson::to_vec(&doc! {
            "v": 42i32,
            "t": bson::DateTime::from_millis(1_000),
        })
        .unwrap();
        let decoded = decode_bson_payload(&payload).unwrap();
        assert_eq!(decoded.value, Some(Bson::Int32(42)));
        assert_eq!(decoded.timestamp_ms, Some(1_000));
        assert_eq!(decoded.metadata, None);
    }

    #[test]
    fn empty_generic_binary_is_unset() {
        let payload = bson::to_vec(&doc! {
            "v": Bson::Binary(bson::Binary {
                subtype: BinarySubtype::Generic,
                bytes: vec![],
            }),
        })
        .unwrap();
        let decoded = decode_bson_payload(&payload).unwrap();
        assert_eq!(decoded.value, None);
    }

    #[test]
    fn bare_map_is_legacy_object() {
        let payload = bson::to_vec(&doc! { "temp": 21.5, "hum": 60i32 }).unwrap();
        let decoded = decode_bson_payload(&payload).unwrap();
        match decoded.value {
            Some(Bson::Document(d)) => assert_eq!(d.len(), 2),
            other => panic!("expected document, got {other:?}"),
        }
    }

    #[test]
    fn wrong_timestamp_type_is_undecodable() {
        let payload = bson::to_vec(&doc! { "v": 1i32, "t": "yesterday" }).unwrap();
        assert_eq!(
            decode_bson_payload(&payload),
            Err(PayloadError::UndecodableBson)
        );
    }

    #[test]
    fn garbage_is_undecodable() {
        assert_eq!(
            decode_bson_payload(&[1, 2, 3]),
            Err(PayloadError::UndecodableBson)
        );
    }

    #[test]
    fn round_trip_supported_shapes() {
        for value in [
            Bson::Int32(7),
            Bson::Int64(1 << 40),
            Bson::Double(2.5),
            Bson::String("x".to_string()),
            Bson::Boolean(true),
            Bson::Array(vec![Bson::Int32(1), Bson::Int32(2)]),
        ] {
            let payload = bson::to_vec(&doc! { "v": value.clone() }).unwrap();
            assert_eq!(decode_bson_payload(&payload).unwrap().value, Some(value));
        }
    }

    #[test]
    fn inflate_caps_output_size() {
        let huge = vec![b'a'; SAFE_INFLATE_MAX + 1];
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&huge).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(safe_inflate(&compressed), Err(PayloadError::Oversize));
    }

    #[test]
    fn properties_payload_decodes_pairs() {
        let payload = deflate("com.X/p;com.Y/a/b");
        let set = decode_device_properties_payload(&payload).unwrap();
        assert!(set.contains(&("com.X".to_string(), "/p".to_string())));
        assert!(set.contains(&("com.Y".to_string(), "/a/b".to_string())));
    }

    #[test]
    fn four_zero_bytes_is_the_empty_set() {
        let set = decode_device_properties_payload(&[0, 0, 0, 0]).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn properties_entry_without_slash_is_invalid() {
        let payload = deflate("no-slash-here");
        assert_eq!(
            decode_device_properties_payload(&payload),
            Err(PayloadError::InvalidProperties)
        );
    }

    #[test]
    fn properties_payload_encode_decode_round_trip() {
        let payload = encode_properties_payload("com.X/p;com.X/q");
        let set = decode_device_properties_payload(&payload).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn encoded_bson_value_decodes_back() {
        let encoded = encode_bson_value(Some(&Bson::Int32(5)));
        let decoded = decode_bson_payload(&encoded).unwrap();
        assert_eq!(decoded.value, Some(Bson::Int32(5)));
    }

    #[test]
    fn introspection_parses_versions() {
        let entries = parse_introspection(b"com.test.Iface:1:2;org.Other:0:1").unwrap();
        assert_eq!(
            entries[0],
            IntrospectionEntry {
                name: "com.test.Iface".to_string(),
                major: 1,
                minor: 2,
            }
        );
        assert_eq!(entries[1].major, 0);
    }

    #[test]
    fn introspection_rejects_bad_names() {
        assert!(parse_introspection(b"1numeric.start:1:0").is_err());
        assert!(parse_introspection(b"noversions").is_err());
        assert!(parse_introspection(b"com.test:1:-1").is_err());
        assert!(parse_introspection(b"com.test:1:+1").is_err());
        assert!(parse_introspection(&[0xff, 0xfe]).is_err());
    }
}
