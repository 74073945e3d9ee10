//! The on-disk record format.
//!
//! A log is a flat sequence of records with no header or footer. Each
//! record starts with an 8-byte ASCII tag, followed by its fields. Every
//! variable-length field is preceded by a 4-byte little-endian length.
//!
//! ```text
//! AUTHAUTH  u32 name_len  name  u32 hash_len  hash  u32 content_len  content
//! KVKVKVKV  u32 key_len   key   u32 value_len value
//! AUTHDIFF  u32 name_len  name  u32 content_len  content
//! KVUPDATE  u32 key_len   key   u32 value_len value
//! KVDELETE  u32 key_len   key
//! ```
//!
//! A snapshot is a log that contains only `AUTHAUTH` and `KVKVKVKV`
//! records.

use std::io;

use fault_injection::annotate;

pub const TAG_LEN: usize = 8;

pub const AUTH_ENTRY: &[u8; TAG_LEN] = b"AUTHAUTH";
pub const KV_ENTRY: &[u8; TAG_LEN] = b"KVKVKVKV";
pub const AUTH_DIFF: &[u8; TAG_LEN] = b"AUTHDIFF";
pub const KV_UPDATE: &[u8; TAG_LEN] = b"KVUPDATE";
pub const KV_DELETE: &[u8; TAG_LEN] = b"KVDELETE";

const LEN_PREFIX: usize = std::mem::size_of::<u32>();

/// One entry of the log. Base records (`Auth`, `Kv`) carry an entry's
/// complete state; the rest are diffs against earlier records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Auth { username: String, pass_hash: Vec<u8>, content: Vec<u8> },
    Kv { key: String, value: Vec<u8> },
    AuthDiff { username: String, content: Vec<u8> },
    KvUpdate { key: String, value: Vec<u8> },
    KvDelete { key: String },
}

impl Record {
    pub fn tag(&self) -> &'static [u8; TAG_LEN] {
        match self {
            Record::Auth { .. } => AUTH_ENTRY,
            Record::Kv { .. } => KV_ENTRY,
            Record::AuthDiff { .. } => AUTH_DIFF,
            Record::KvUpdate { .. } => KV_UPDATE,
            Record::KvDelete { .. } => KV_DELETE,
        }
    }

    pub fn is_base(&self) -> bool {
        matches!(self, Record::Auth { .. } | Record::Kv { .. })
    }

    /// The variable-length fields of the record, in on-disk order.
    pub fn fields(&self) -> Vec<&[u8]> {
        match self {
            Record::Auth { username, pass_hash, content } => {
                vec![
                    username.as_bytes(),
                    pass_hash.as_slice(),
                    content.as_slice(),
                ]
            }
            Record::Kv { key, value } | Record::KvUpdate { key, value } => {
                vec![key.as_bytes(), value.as_slice()]
            }
            Record::AuthDiff { username, content } => {
                vec![username.as_bytes(), content.as_slice()]
            }
            Record::KvDelete { key } => vec![key.as_bytes()],
        }
    }

    /// Appends the encoded record to `buf`. Fails without touching `buf`
    /// if a field is too long for its length prefix.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        encode_fields(buf, self.tag(), &self.fields())
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    pub fn encoded_len(&self) -> usize {
        TAG_LEN
            + self
                .fields()
                .iter()
                .map(|field| LEN_PREFIX + field.len())
                .sum::<usize>()
    }
}

/// Appends a record built from a tag and borrowed fields to `buf`, so
/// callers holding the data behind a lock need not build a [`Record`].
pub fn encode_fields(
    buf: &mut Vec<u8>,
    tag: &[u8; TAG_LEN],
    fields: &[&[u8]],
) -> io::Result<()> {
    let mut prefixes = Vec::with_capacity(fields.len());
    for field in fields {
        let len = u32::try_from(field.len()).map_err(|_| {
            annotate!(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "field of {} bytes does not fit in a record length prefix",
                    field.len()
                ),
            ))
        })?;
        prefixes.push(len.to_le_bytes());
    }

    let encoded_len = TAG_LEN
        + fields.iter().map(|field| LEN_PREFIX + field.len()).sum::<usize>();

    buf.reserve(encoded_len);
    buf.extend_from_slice(tag);
    for (prefix, field) in prefixes.iter().zip(fields) {
        buf.extend_from_slice(prefix);
        buf.extend_from_slice(field);
    }

    Ok(())
}

/// Reads records out of a complete log image.
///
/// Every read is bounds checked. A truncated record, a length that runs
/// past the end of the buffer, an unknown tag, or a key that is not UTF-8
/// produces an `InvalidData` error naming the offset of the record that
/// could not be read; iteration stops after the first error.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Decoder<'a> {
        Decoder { buf, offset: 0, failed: false }
    }

    /// The offset of the next unread byte.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn corrupt(&self, record_start: usize, what: &str) -> io::Error {
        annotate!(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("corrupt log record at offset {record_start}: {what}"),
        ))
    }

    fn take(&mut self, n: usize, record_start: usize) -> io::Result<&'a [u8]> {
        let remaining = self.buf.len() - self.offset;
        if n > remaining {
            return Err(self.corrupt(
                record_start,
                &format!("needed {n} bytes but only {remaining} remain"),
            ));
        }
        let buf: &'a [u8] = self.buf;
        let ret = &buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(ret)
    }

    fn bytes(&mut self, record_start: usize) -> io::Result<&'a [u8]> {
        let prefix = self.take(LEN_PREFIX, record_start)?;
        let len =
            u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        self.take(len as usize, record_start)
    }

    fn string(&mut self, record_start: usize) -> io::Result<String> {
        let raw = self.bytes(record_start)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| self.corrupt(record_start, "key is not valid utf-8"))
    }

    fn read_record(&mut self) -> io::Result<Record> {
        let start = self.offset;
        let tag = self.take(TAG_LEN, start)?;

        let record = match tag {
            t if t == AUTH_ENTRY => Record::Auth {
                username: self.string(start)?,
                pass_hash: self.bytes(start)?.to_vec(),
                content: self.bytes(start)?.to_vec(),
            },
            t if t == KV_ENTRY => Record::Kv {
                key: self.string(start)?,
                value: self.bytes(start)?.to_vec(),
            },
            t if t == AUTH_DIFF => Record::AuthDiff {
                username: self.string(start)?,
                content: self.bytes(start)?.to_vec(),
            },
            t if t == KV_UPDATE => Record::KvUpdate {
                key: self.string(start)?,
                value: self.bytes(start)?.to_vec(),
            },
            t if t == KV_DELETE => {
                Record::KvDelete { key: self.string(start)? }
            }
            unknown => {
                return Err(self.corrupt(
                    start,
                    &format!(
                        "unknown tag {:?}",
                        String::from_utf8_lossy(unknown)
                    ),
                ));
            }
        };

        Ok(record)
    }
}

impl Iterator for Decoder<'_> {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<io::Result<Record>> {
        if self.failed || self.offset == self.buf.len() {
            return None;
        }

        let res = self.read_record();
        if res.is_err() {
            self.failed = true;
        }
        Some(res)
    }
}

#[cfg(test)]
mod test {
    use quickcheck::QuickCheck;

    use super::*;

    fn sample() -> Vec<Record> {
        vec![
            Record::Auth {
                username: "alice".into(),
                pass_hash: vec![7; 32],
                content: vec![],
            },
            Record::Kv { key: "k1".into(), value: b"v1".to_vec() },
            Record::AuthDiff {
                username: "alice".into(),
                content: b"hello".to_vec(),
            },
            Record::KvUpdate { key: "k1".into(), value: vec![] },
            Record::KvDelete { key: "k1".into() },
        ]
    }

    #[test]
    fn auth_entry_layout() {
        let record = Record::Auth {
            username: "bob".into(),
            pass_hash: vec![0xAB, 0xCD],
            content: vec![],
        };
        let bytes = record.encode().unwrap();

        let mut expected = b"AUTHAUTH".to_vec();
        expected.extend_from_slice(&[3, 0, 0, 0]);
        expected.extend_from_slice(b"bob");
        expected.extend_from_slice(&[2, 0, 0, 0, 0xAB, 0xCD]);
        expected.extend_from_slice(&[0, 0, 0, 0]);

        assert_eq!(bytes, expected);
        assert_eq!(bytes.len(), record.encoded_len());
    }

    #[test]
    fn kv_delete_has_no_value() {
        let bytes = Record::KvDelete { key: "xy".into() }.encode().unwrap();
        assert_eq!(bytes, b"KVDELETE\x02\x00\x00\x00xy");
    }

    #[test]
    fn decode_log_of_every_kind() {
        let mut log = vec![];
        for record in sample() {
            record.encode_into(&mut log).unwrap();
        }

        let decoded: Vec<Record> =
            Decoder::new(&log).collect::<io::Result<_>>().unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn empty_log_has_no_records() {
        assert_eq!(Decoder::new(&[]).count(), 0);
    }

    #[test]
    fn unknown_tag_is_fatal() {
        let mut log = Record::KvDelete { key: "a".into() }.encode().unwrap();
        let good_len = log.len();
        log.extend_from_slice(b"NOTATAG!\x00\x00\x00\x00");

        let mut decoder = Decoder::new(&log);
        assert!(decoder.next().unwrap().is_ok());

        let err = decoder.next().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(decoder.offset(), good_len + TAG_LEN);

        assert!(decoder.next().is_none());
    }

    #[test]
    fn truncation_is_detected_everywhere() {
        let mut log = vec![];
        for record in sample() {
            record.encode_into(&mut log).unwrap();
        }

        let boundaries: Vec<usize> = sample()
            .iter()
            .scan(0, |end, r| {
                *end += r.encoded_len();
                Some(*end)
            })
            .collect();

        for cut in 1..log.len() {
            let res: io::Result<Vec<Record>> =
                Decoder::new(&log[..cut]).collect();
            if boundaries.contains(&cut) {
                assert!(res.is_ok(), "cut at record boundary {cut} failed");
            } else {
                let err = res.unwrap_err();
                assert_eq!(err.kind(), io::ErrorKind::InvalidData, "cut {cut}");
            }
        }
    }

    #[test]
    fn non_utf8_key_is_corrupt() {
        let mut log = KV_DELETE.to_vec();
        log.extend_from_slice(&[2, 0, 0, 0, 0xFF, 0xFE]);
        let err = Decoder::new(&log).next().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    fn prop_decoder_never_panics(bytes: Vec<u8>) -> bool {
        // any outcome is fine as long as it ends
        let n = Decoder::new(&bytes).take(bytes.len() + 1).count();
        n <= bytes.len()
    }

    #[test]
    fn qc_decoder_never_panics() {
        QuickCheck::new()
            .tests(1000)
            .quickcheck(prop_decoder_never_panics as fn(Vec<u8>) -> bool);
    }

    #[test]
    fn qc_decoder_never_panics_on_tagged_garbage() {
        fn prop(tag: u8, body: Vec<u8>) -> bool {
            let tags = [AUTH_ENTRY, KV_ENTRY, AUTH_DIFF, KV_UPDATE, KV_DELETE];
            let mut bytes = tags[tag as usize % tags.len()].to_vec();
            bytes.extend(body);
            Decoder::new(&bytes).take(bytes.len()).count() <= bytes.len()
        }
        QuickCheck::new()
            .tests(1000)
            .quickcheck(prop as fn(u8, Vec<u8>) -> bool);
    }
}
