//! Tagged, length-prefixed binary record encoding.
//!
//! Every persisted record (ref entries, view records, governor records,
//! policy rules, the index header) starts with a one-byte tag and a
//! little-endian `u32` payload length. Integers inside payloads are
//! little-endian; strings and byte blobs are `u32`-length-prefixed;
//! digests are raw 32-byte values.

use crate::digest::{ContentDigest, DIGEST_LEN};
use crate::errors::{GeofsError, GeofsResult};

/// Header record at the top of `views/index`.
pub const TAG_INDEX_HEADER: u8 = 0x01;
/// One sealed view in `views/index`.
pub const TAG_VIEW_RECORD: u8 = 0x02;
/// One ref entry in a `refs/<view>/delta` file.
pub const TAG_REF_ENTRY: u8 = 0x03;
/// Serialized governor audit record.
pub const TAG_AUDIT_RECORD: u8 = 0x04;
/// One destructive-pattern rule in the policy asset.
pub const TAG_PATTERN_RULE: u8 = 0x05;

/// Append a tagged record to `out`.
pub fn write_record(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Incremental payload builder.
#[derive(Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn put_str(&mut self, v: &str) -> &mut Self {
        self.put_bytes(v.as_bytes())
    }

    pub fn put_digest(&mut self, v: &ContentDigest) -> &mut Self {
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a single record payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> GeofsResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(GeofsError::Corrupt(format!(
                "record payload truncated: wanted {n} bytes at offset {}, have {}",
                self.pos,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn take_u8(&mut self) -> GeofsResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn take_u32(&mut self) -> GeofsResult<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes(raw.try_into().unwrap()))
    }

    pub fn take_u64(&mut self) -> GeofsResult<u64> {
        let raw = self.take(8)?;
        Ok(u64::from_le_bytes(raw.try_into().unwrap()))
    }

    pub fn take_i64(&mut self) -> GeofsResult<i64> {
        let raw = self.take(8)?;
        Ok(i64::from_le_bytes(raw.try_into().unwrap()))
    }

    pub fn take_bytes(&mut self) -> GeofsResult<&'a [u8]> {
        let len = self.take_u32()? as usize;
        self.take(len)
    }

    pub fn take_str(&mut self) -> GeofsResult<&'a str> {
        let raw = self.take_bytes()?;
        std::str::from_utf8(raw)
            .map_err(|e| GeofsError::Corrupt(format!("record string is not utf-8: {e}")))
    }

    pub fn take_digest(&mut self) -> GeofsResult<ContentDigest> {
        ContentDigest::from_slice(self.take(DIGEST_LEN)?)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Iterator over the tagged records of a file.
pub struct RecordIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Next `(tag, payload)` pair, or `None` at a clean end of input.
    /// A partial trailing record is `Corrupt`, never silently dropped.
    pub fn next_record(&mut self) -> GeofsResult<Option<(u8, &'a [u8])>> {
        if self.pos == self.buf.len() {
            return Ok(None);
        }
        if self.pos + 5 > self.buf.len() {
            return Err(GeofsError::Corrupt(
                "truncated record header".to_string(),
            ));
        }
        let tag = self.buf[self.pos];
        let len =
            u32::from_le_bytes(self.buf[self.pos + 1..self.pos + 5].try_into().unwrap()) as usize;
        let start = self.pos + 5;
        if start + len > self.buf.len() {
            return Err(GeofsError::Corrupt(format!(
                "record payload overruns file: tag {tag:#04x}, len {len}"
            )));
        }
        self.pos = start + len;
        Ok(Some((tag, &self.buf[start..start + len])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let mut payload = PayloadWriter::new();
        payload
            .put_u64(42)
            .put_str("stratum")
            .put_i64(-7)
            .put_bytes(b"\x00\x01");
        let mut file = Vec::new();
        write_record(&mut file, TAG_VIEW_RECORD, &payload.finish());

        let mut iter = RecordIter::new(&file);
        let (tag, body) = iter.next_record().unwrap().unwrap();
        assert_eq!(tag, TAG_VIEW_RECORD);

        let mut r = PayloadReader::new(body);
        assert_eq!(r.take_u64().unwrap(), 42);
        assert_eq!(r.take_str().unwrap(), "stratum");
        assert_eq!(r.take_i64().unwrap(), -7);
        assert_eq!(r.take_bytes().unwrap(), b"\x00\x01");
        assert_eq!(r.remaining(), 0);
        assert!(iter.next_record().unwrap().is_none());
    }

    #[test]
    fn test_multiple_records() {
        let mut file = Vec::new();
        write_record(&mut file, TAG_REF_ENTRY, b"a");
        write_record(&mut file, TAG_REF_ENTRY, b"bc");
        let mut iter = RecordIter::new(&file);
        assert_eq!(iter.next_record().unwrap().unwrap().1, b"a");
        assert_eq!(iter.next_record().unwrap().unwrap().1, b"bc");
        assert!(iter.next_record().unwrap().is_none());
    }

    #[test]
    fn test_truncated_record_is_corrupt() {
        let mut file = Vec::new();
        write_record(&mut file, TAG_REF_ENTRY, b"payload");
        file.truncate(file.len() - 2);
        let mut iter = RecordIter::new(&file);
        assert!(matches!(
            iter.next_record(),
            Err(GeofsError::Corrupt(_))
        ));
    }

    #[test]
    fn test_digest_round_trip() {
        let d = ContentDigest::compute(b"digest");
        let mut payload = PayloadWriter::new();
        payload.put_digest(&d);
        let buf = payload.finish();
        let mut r = PayloadReader::new(&buf);
        assert_eq!(r.take_digest().unwrap(), d);
    }
}
