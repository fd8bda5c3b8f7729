//! Binary encoding shared by every persisted record.
//!
//! Keys are byte-stuffed atoms: `0x01` is the escape byte and `0x00` the
//! terminator, so a literal `0x01` is written as `0x01 0x01` and a literal
//! `0x00` as `0x01 0x02`. A dict is a flat run of `(atom key, u32 LE length,
//! value bytes)`. An enum (homogeneous list) is `u32 LE count`, one `u32 LE`
//! length per element, then the element bytes back to back.

use crate::error::{Result, VaultError};
use crate::hash::{HASH_LEN, Hash};
use std::collections::HashMap;

const ESCAPE: u8 = 0x01;
const TERMINATOR: u8 = 0x00;
const ESCAPED_ESCAPE: u8 = 0x01;
const ESCAPED_TERMINATOR: u8 = 0x02;

/// Append `data` to `out` as a stuffed, terminated atom.
pub fn escape_atom(data: &[u8], out: &mut Vec<u8>) {
    out.reserve(data.len() + 1);
    for &byte in data {
        match byte {
            ESCAPE => out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            TERMINATOR => out.extend_from_slice(&[ESCAPE, ESCAPED_TERMINATOR]),
            other => out.push(other),
        }
    }
    out.push(TERMINATOR);
}

/// Decode one atom starting at `pos`. Returns the value and the position
/// just past its terminator.
pub fn unescape_atom(data: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut value = Vec::new();
    loop {
        let byte = *data
            .get(pos)
            .ok_or_else(|| corrupt("unterminated atom"))?;
        pos += 1;
        match byte {
            TERMINATOR => return Ok((value, pos)),
            ESCAPE => {
                let class = *data
                    .get(pos)
                    .ok_or_else(|| corrupt("dangling escape byte"))?;
                pos += 1;
                match class {
                    ESCAPED_ESCAPE => value.push(ESCAPE),
                    ESCAPED_TERMINATOR => value.push(TERMINATOR),
                    other => return Err(corrupt(&format!("unknown escape class {:#04x}", other))),
                }
            }
            other => value.push(other),
        }
    }
}

/// Builder for dict-encoded records.
#[derive(Debug, Default)]
pub struct DictWriter {
    buf: Vec<u8>,
}

impl DictWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&mut self, key: &str, value: &[u8]) -> &mut Self {
        escape_atom(key.as_bytes(), &mut self.buf);
        self.buf
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    pub fn str(&mut self, key: &str, value: &str) -> &mut Self {
        self.bytes(key, value.as_bytes())
    }

    pub fn u32(&mut self, key: &str, value: u32) -> &mut Self {
        self.bytes(key, &value.to_le_bytes())
    }

    pub fn u64(&mut self, key: &str, value: u64) -> &mut Self {
        self.bytes(key, &value.to_le_bytes())
    }

    pub fn i64(&mut self, key: &str, value: i64) -> &mut Self {
        self.bytes(key, &value.to_le_bytes())
    }

    pub fn bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.bytes(key, &[u8::from(value)])
    }

    pub fn hash(&mut self, key: &str, value: &Hash) -> &mut Self {
        self.bytes(key, value.as_bytes())
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Decoded dict record. Lookups of absent keys return `None` so readers can
/// tolerate fields added by newer writers.
#[derive(Debug, Default)]
pub struct DictReader {
    fields: HashMap<String, Vec<u8>>,
}

impl DictReader {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut fields = HashMap::new();
        let mut pos = 0;
        while pos < data.len() {
            let (key, next) = unescape_atom(data, pos)?;
            let key = String::from_utf8(key).map_err(|_| corrupt("dict key is not utf-8"))?;
            let len = read_u32(data, next)? as usize;
            let start = next + 4;
            let end = start
                .checked_add(len)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| corrupt(&format!("dict value for '{}' overruns record", key)))?;
            fields.insert(key, data[start..end].to_vec());
            pos = end;
        }
        Ok(Self { fields })
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.fields.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn require(&self, key: &str) -> Result<&[u8]> {
        self.get(key)
            .ok_or_else(|| corrupt(&format!("missing field '{}'", key)))
    }

    pub fn str(&self, key: &str) -> Result<Option<String>> {
        self.get(key)
            .map(|raw| {
                String::from_utf8(raw.to_vec())
                    .map_err(|_| corrupt(&format!("field '{}' is not utf-8", key)))
            })
            .transpose()
    }

    pub fn u32(&self, key: &str) -> Result<Option<u32>> {
        self.get(key).map(|raw| fixed::<4>(raw, key).map(u32::from_le_bytes)).transpose()
    }

    pub fn u64(&self, key: &str) -> Result<Option<u64>> {
        self.get(key).map(|raw| fixed::<8>(raw, key).map(u64::from_le_bytes)).transpose()
    }

    pub fn i64(&self, key: &str) -> Result<Option<i64>> {
        self.get(key).map(|raw| fixed::<8>(raw, key).map(i64::from_le_bytes)).transpose()
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>> {
        self.get(key)
            .map(|raw| match raw {
                [0] => Ok(false),
                [1] => Ok(true),
                _ => Err(corrupt(&format!("field '{}' is not a bool", key))),
            })
            .transpose()
    }

    pub fn hash(&self, key: &str) -> Result<Option<Hash>> {
        self.get(key).map(Hash::from_slice).transpose()
    }
}

/// Enum-encode a list of byte strings.
pub fn enum_encode<I, T>(items: I) -> Vec<u8>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let items: Vec<T> = items.into_iter().collect();
    let payload: usize = items.iter().map(|item| item.as_ref().len()).sum();
    let mut out = Vec::with_capacity(4 + items.len() * 4 + payload);
    out.extend_from_slice(&(items.len() as u32).to_le_bytes());
    for item in &items {
        out.extend_from_slice(&(item.as_ref().len() as u32).to_le_bytes());
    }
    for item in &items {
        out.extend_from_slice(item.as_ref());
    }
    out
}

/// Inverse of [`enum_encode`]; returns borrowed slices into `data`.
pub fn enum_decode(data: &[u8]) -> Result<Vec<&[u8]>> {
    let count = read_u32(data, 0)? as usize;
    let header_end = count
        .checked_mul(4)
        .and_then(|n| n.checked_add(4))
        .filter(|end| *end <= data.len())
        .ok_or_else(|| corrupt("enum header overruns record"))?;

    let mut items = Vec::with_capacity(count);
    let mut pos = header_end;
    for i in 0..count {
        let len = read_u32(data, 4 + i * 4)? as usize;
        let end = pos
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| corrupt("enum element overruns record"))?;
        items.push(&data[pos..end]);
        pos = end;
    }
    if pos != data.len() {
        return Err(corrupt("trailing bytes after enum elements"));
    }
    Ok(items)
}

/// Hash lists are stored as an enum of raw 20-byte hashes.
pub fn encode_hashes(hashes: &[Hash]) -> Vec<u8> {
    enum_encode(hashes.iter().map(|h| h.as_bytes().as_slice()))
}

pub fn decode_hashes(data: &[u8]) -> Result<Vec<Hash>> {
    enum_decode(data)?
        .into_iter()
        .map(|raw| {
            if raw.len() != HASH_LEN {
                return Err(corrupt("hash list element has wrong length"));
            }
            Hash::from_slice(raw)
        })
        .collect()
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .map(|raw| u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .ok_or_else(|| corrupt("truncated length prefix"))
}

fn fixed<const N: usize>(raw: &[u8], key: &str) -> Result<[u8; N]> {
    raw.try_into()
        .map_err(|_| corrupt(&format!("field '{}' should be {} bytes", key, N)))
}

fn corrupt(message: &str) -> VaultError {
    VaultError::CorruptIndex(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha1_digest;

    #[test]
    fn test_atom_stuffing() {
        let mut out = Vec::new();
        escape_atom(&[0x00, 0x05, 0x01, 0x00], &mut out);
        assert_eq!(out, vec![0x01, 0x02, 0x05, 0x01, 0x01, 0x01, 0x02, 0x00]);

        let (value, next) = unescape_atom(&out, 0).unwrap();
        assert_eq!(value, vec![0x00, 0x05, 0x01, 0x00]);
        assert_eq!(next, out.len());
    }

    #[test]
    fn test_atom_rejects_bad_escape() {
        assert!(unescape_atom(&[0x41, 0x01, 0x07, 0x00], 0).is_err());
        assert!(unescape_atom(&[0x41, 0x42], 0).is_err());
    }

    #[test]
    fn test_dict_fields_and_missing_keys() {
        let hash = sha1_digest(b"x");
        let encoded = DictWriter::new()
            .str("Name-v1", "photos\0raw")
            .u64("Size-v1", 1 << 40)
            .i64("Time-v1", -5)
            .bool("Flag-v1", true)
            .hash("Hash-v1", &hash)
            .finish();

        let dict = DictReader::decode(&encoded).unwrap();
        assert_eq!(dict.str("Name-v1").unwrap().as_deref(), Some("photos\0raw"));
        assert_eq!(dict.u64("Size-v1").unwrap(), Some(1 << 40));
        assert_eq!(dict.i64("Time-v1").unwrap(), Some(-5));
        assert_eq!(dict.bool("Flag-v1").unwrap(), Some(true));
        assert_eq!(dict.hash("Hash-v1").unwrap(), Some(hash));
        assert_eq!(dict.u64("Added-v2").unwrap(), None);
        assert!(dict.require("Added-v2").is_err());
    }

    #[test]
    fn test_dict_truncated_value() {
        let mut encoded = DictWriter::new().str("Name-v1", "abcdef").finish();
        encoded.truncate(encoded.len() - 2);
        assert!(matches!(
            DictReader::decode(&encoded),
            Err(VaultError::CorruptIndex(_))
        ));
    }

    #[test]
    fn test_enum_layout() {
        let encoded = enum_encode([b"ab".as_slice(), b"".as_slice(), b"xyz".as_slice()]);
        assert_eq!(&encoded[..4], &3u32.to_le_bytes());
        assert_eq!(&encoded[4..8], &2u32.to_le_bytes());
        assert_eq!(&encoded[8..12], &0u32.to_le_bytes());
        assert_eq!(&encoded[12..16], &3u32.to_le_bytes());
        assert_eq!(&encoded[16..], b"abxyz");

        let decoded = enum_decode(&encoded).unwrap();
        assert_eq!(decoded, vec![b"ab".as_slice(), b"".as_slice(), b"xyz".as_slice()]);
    }

    #[test]
    fn test_hash_list() {
        let hashes = vec![sha1_digest(b"a"), sha1_digest(b"b")];
        assert_eq!(decode_hashes(&encode_hashes(&hashes)).unwrap(), hashes);
        assert!(decode_hashes(&enum_encode([b"short".as_slice()])).is_err());
    }
}
