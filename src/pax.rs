use std::io;
use std::str;

use crate::other;

// Keywords for PAX extended header records.
pub const PAX_PATH: &str = "path";
pub const PAX_LINKPATH: &str = "linkpath";
pub const PAX_SIZE: &str = "size";
pub const PAX_UID: &str = "uid";
pub const PAX_GID: &str = "gid";
pub const PAX_UNAME: &str = "uname";
pub const PAX_GNAME: &str = "gname";
pub const PAX_MTIME: &str = "mtime";
pub const PAX_ATIME: &str = "atime";
pub const PAX_CTIME: &str = "ctime"; // Removed from later revision of PAX spec, but was valid
#[allow(dead_code)]
pub const PAX_CHARSET: &str = "charset"; // Currently unused
#[allow(dead_code)]
pub const PAX_COMMENT: &str = "comment"; // Currently unused
#[allow(dead_code)]
pub const PAX_HDRCHARSET: &str = "hdrcharset"; // Currently unused

pub const PAX_SCHILYXATTR: &str = "SCHILY.xattr.";

// Keywords for GNU sparse files in a PAX extended header.
pub const PAX_GNUSPARSEOFFSET: &str = "GNU.sparse.offset";
pub const PAX_GNUSPARSENUMBYTES: &str = "GNU.sparse.numbytes";
pub const PAX_GNUSPARSEMAP: &str = "GNU.sparse.map";
pub const PAX_GNUSPARSENAME: &str = "GNU.sparse.name";
pub const PAX_GNUSPARSEMAJOR: &str = "GNU.sparse.major";
pub const PAX_GNUSPARSEMINOR: &str = "GNU.sparse.minor";
pub const PAX_GNUSPARSESIZE: &str = "GNU.sparse.size";
pub const PAX_GNUSPARSEREALSIZE: &str = "GNU.sparse.realsize";
#[allow(dead_code)]
pub const PAX_GNUSPARSENUMBLOCKS: &str = "GNU.sparse.numblocks";

/// An iterator over the PAX extension records in an archive entry.
///
/// Each record has the wire shape `"<len> <key>=<value>\n"` where
/// `<len>` counts the entire record, its own digits included. The
/// iterator walks records by their declared lengths, so values are free
/// to contain newlines and NUL bytes (binary `SCHILY.xattr.*` payloads
/// do).
pub struct PaxExtensions<'entry> {
    data: &'entry [u8],
    pos: usize,
}

impl<'entry> PaxExtensions<'entry> {
    /// Create new pax extensions iterator from the given entry data.
    pub fn new(a: &'entry [u8]) -> PaxExtensions<'entry> {
        PaxExtensions { data: a, pos: 0 }
    }
}

/// A key/value pair corresponding to a pax extension.
pub struct PaxExtension<'entry> {
    key: &'entry [u8],
    value: &'entry [u8],
}

impl<'entry> Iterator for PaxExtensions<'entry> {
    type Item = io::Result<PaxExtension<'entry>>;

    fn next(&mut self) -> Option<io::Result<PaxExtension<'entry>>> {
        let rest = &self.data[self.pos..];
        if rest.is_empty() || rest.iter().all(|b| *b == 0) {
            return None;
        }

        let space = match rest.iter().position(|b| *b == b' ') {
            Some(i) => i,
            None => return Some(Err(other("malformed pax extension"))),
        };
        let len: usize = match str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
        {
            Some(n) if n > space + 1 && n <= rest.len() => n,
            _ => return Some(Err(other("malformed pax extension length"))),
        };
        let record = &rest[space + 1..len];
        self.pos += len;

        // The record proper is `key=value\n`.
        let record = match record.split_last() {
            Some((b'\n', record)) => record,
            _ => return Some(Err(other("pax extension record missing newline"))),
        };
        let equals = match record.iter().position(|b| *b == b'=') {
            Some(i) => i,
            None => return Some(Err(other("malformed pax extension record"))),
        };
        Some(Ok(PaxExtension {
            key: &record[..equals],
            value: &record[equals + 1..],
        }))
    }
}

impl<'entry> PaxExtension<'entry> {
    /// Returns the key for this key/value pair parsed as a string.
    ///
    /// May fail if the key isn't actually utf-8.
    pub fn key(&self) -> Result<&'entry str, str::Utf8Error> {
        str::from_utf8(self.key)
    }

    /// Returns the underlying raw bytes for the key of this key/value
    /// pair.
    pub fn key_bytes(&self) -> &'entry [u8] {
        self.key
    }

    /// Returns the value for this key/value pair parsed as a string.
    ///
    /// May fail if the value isn't actually utf-8.
    pub fn value(&self) -> Result<&'entry str, str::Utf8Error> {
        str::from_utf8(self.value)
    }

    /// Returns the underlying raw bytes for this value of this key/value
    /// pair.
    pub fn value_bytes(&self) -> &'entry [u8] {
        self.value
    }
}

/// An accumulator for PAX records to be written as the payload of an
/// `x` or `g` member.
///
/// Records are emitted in insertion order so that a parse/emit round
/// trip is byte-identical.
#[derive(Default)]
pub struct PaxBuilder {
    records: Vec<(String, Vec<u8>)>,
}

impl PaxBuilder {
    /// Creates an empty record set.
    pub fn new() -> PaxBuilder {
        PaxBuilder::default()
    }

    /// Appends a textual record.
    pub fn push(&mut self, key: &str, value: &str) {
        self.records.push((key.to_string(), value.as_bytes().to_vec()));
    }

    /// Appends a record whose value is raw bytes (binary xattrs).
    pub fn push_bytes(&mut self, key: &str, value: &[u8]) {
        self.records.push((key.to_string(), value.to_vec()));
    }

    /// Whether no records have been added.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encodes the records into their wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.records {
            // The length prefix counts its own digits, so compute it to
            // a fixed point.
            let suffix_len = 1 + key.len() + 1 + value.len() + 1;
            let mut total = suffix_len + 1;
            while total != decimal_digits(total) + suffix_len {
                total = decimal_digits(total) + suffix_len;
            }
            out.extend_from_slice(total.to_string().as_bytes());
            out.push(b' ');
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value);
            out.push(b'\n');
        }
        out
    }
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Parses a PAX time value: decimal seconds with optional fractional
/// part, returned at nanosecond precision.
pub fn parse_time(value: &str) -> Option<(u64, u32)> {
    let (secs, frac) = match value.split_once('.') {
        Some((s, f)) => (s, f),
        None => (value, ""),
    };
    let secs = secs.parse().ok()?;
    if frac.is_empty() {
        return Some((secs, 0));
    }
    let mut nanos: u64 = 0;
    let mut scale = 100_000_000;
    for c in frac.bytes() {
        if !c.is_ascii_digit() {
            return None;
        }
        nanos += (c - b'0') as u64 * scale;
        scale /= 10;
        if scale == 0 {
            break;
        }
    }
    Some((secs, nanos as u32))
}

/// Formats a time as PAX does: plain seconds, or seconds plus a
/// nine-digit fraction when sub-second precision exists.
pub fn format_time(secs: u64, nanos: u32) -> String {
    if nanos == 0 {
        secs.to_string()
    } else {
        format!("{}.{:09}", secs, nanos)
    }
}

/// The attribute overrides accumulated from the PAX pre-entries of one
/// logical entry.
///
/// Per-entry `x` records are merged over the sticky `g` globals;
/// whatever key appears later wins. Unrecognized keys are preserved in
/// `extras` verbatim.
#[derive(Default, Clone)]
pub struct PaxOverrides {
    /// `path`: the member name.
    pub path: Option<Vec<u8>>,
    /// `linkpath`: the link target.
    pub linkpath: Option<Vec<u8>>,
    /// `size`: the logical file length.
    pub size: Option<u64>,
    /// `uid`.
    pub uid: Option<u64>,
    /// `gid`.
    pub gid: Option<u64>,
    /// `uname`.
    pub uname: Option<String>,
    /// `gname`.
    pub gname: Option<String>,
    /// `mtime` at (seconds, nanoseconds).
    pub mtime: Option<(u64, u32)>,
    /// `atime` at (seconds, nanoseconds).
    pub atime: Option<(u64, u32)>,
    /// `ctime` at (seconds, nanoseconds).
    pub ctime: Option<(u64, u32)>,
    /// `GNU.sparse.major`.
    pub sparse_major: Option<u32>,
    /// `GNU.sparse.minor`.
    pub sparse_minor: Option<u32>,
    /// `GNU.sparse.name`: the real name of a sparse member.
    pub sparse_name: Option<Vec<u8>>,
    /// `GNU.sparse.realsize`/`GNU.sparse.size`: the logical length of a
    /// sparse member.
    pub sparse_realsize: Option<u64>,
    /// `GNU.sparse.map`: decoded (offset, numbytes) pairs.
    pub sparse_map: Option<Vec<(u64, u64)>>,
    /// In-order `GNU.sparse.offset`/`numbytes` values (sparse 0.0).
    pub sparse_pairs: Vec<u64>,
    /// `SCHILY.xattr.*` records as (attribute name, raw value).
    pub xattrs: Vec<(Vec<u8>, Vec<u8>)>,
    /// Unrecognized records, preserved verbatim.
    pub extras: Vec<(Vec<u8>, Vec<u8>)>,
}

impl PaxOverrides {
    /// Parses a full `x`/`g` payload into an override set.
    pub fn parse(data: &[u8]) -> io::Result<PaxOverrides> {
        let mut o = PaxOverrides::default();
        for ext in PaxExtensions::new(data) {
            let ext = ext?;
            o.apply(ext.key_bytes(), ext.value_bytes());
        }
        Ok(o)
    }

    fn apply(&mut self, key: &[u8], value: &[u8]) {
        let key_str = match str::from_utf8(key) {
            Ok(k) => k,
            Err(_) => {
                self.extras.push((key.to_vec(), value.to_vec()));
                return;
            }
        };
        if let Some(name) = key_str.strip_prefix(PAX_SCHILYXATTR) {
            self.xattrs.push((name.as_bytes().to_vec(), value.to_vec()));
            return;
        }
        let text = str::from_utf8(value).ok();
        match key_str {
            PAX_PATH => self.path = Some(value.to_vec()),
            PAX_LINKPATH => self.linkpath = Some(value.to_vec()),
            PAX_SIZE => self.size = text.and_then(|v| v.parse().ok()),
            PAX_UID => self.uid = text.and_then(|v| v.parse().ok()),
            PAX_GID => self.gid = text.and_then(|v| v.parse().ok()),
            PAX_UNAME => self.uname = text.map(|v| v.to_string()),
            PAX_GNAME => self.gname = text.map(|v| v.to_string()),
            PAX_MTIME => self.mtime = text.and_then(parse_time),
            PAX_ATIME => self.atime = text.and_then(parse_time),
            PAX_CTIME => self.ctime = text.and_then(parse_time),
            PAX_GNUSPARSEMAJOR => self.sparse_major = text.and_then(|v| v.parse().ok()),
            PAX_GNUSPARSEMINOR => self.sparse_minor = text.and_then(|v| v.parse().ok()),
            PAX_GNUSPARSENAME => self.sparse_name = Some(value.to_vec()),
            PAX_GNUSPARSEREALSIZE | PAX_GNUSPARSESIZE => {
                self.sparse_realsize = text.and_then(|v| v.parse().ok())
            }
            PAX_GNUSPARSEMAP => {
                self.sparse_map = text.and_then(parse_sparse_map);
            }
            PAX_GNUSPARSEOFFSET | PAX_GNUSPARSENUMBYTES => {
                if let Some(n) = text.and_then(|v| v.parse().ok()) {
                    self.sparse_pairs.push(n);
                }
            }
            _ => self.extras.push((key.to_vec(), value.to_vec())),
        }
    }

    /// Merges `newer` into `self`, with `newer`'s keys winning.
    pub fn merge_from(&mut self, newer: &PaxOverrides) {
        macro_rules! take {
            ($field:ident) => {
                if newer.$field.is_some() {
                    self.$field = newer.$field.clone();
                }
            };
        }
        take!(path);
        take!(linkpath);
        take!(size);
        take!(uid);
        take!(gid);
        take!(uname);
        take!(gname);
        take!(mtime);
        take!(atime);
        take!(ctime);
        take!(sparse_major);
        take!(sparse_minor);
        take!(sparse_name);
        take!(sparse_realsize);
        take!(sparse_map);
        if !newer.sparse_pairs.is_empty() {
            self.sparse_pairs = newer.sparse_pairs.clone();
        }
        self.xattrs.extend(newer.xattrs.iter().cloned());
        self.extras.extend(newer.extras.iter().cloned());
    }

    /// Whether any of the GNU sparse keys were present.
    pub fn has_sparse_info(&self) -> bool {
        self.sparse_major.is_some()
            || self.sparse_map.is_some()
            || !self.sparse_pairs.is_empty()
            || self.sparse_realsize.is_some()
    }

    /// The sparse region list carried in the records, if any: either the
    /// comma-separated `GNU.sparse.map` form or accumulated
    /// offset/numbytes pairs.
    pub fn sparse_regions(&self) -> Option<Vec<(u64, u64)>> {
        if let Some(map) = &self.sparse_map {
            return Some(map.clone());
        }
        if !self.sparse_pairs.is_empty() && self.sparse_pairs.len() % 2 == 0 {
            return Some(
                self.sparse_pairs
                    .chunks(2)
                    .map(|c| (c[0], c[1]))
                    .collect(),
            );
        }
        None
    }
}

fn parse_sparse_map(value: &str) -> Option<Vec<(u64, u64)>> {
    let mut numbers = Vec::new();
    for part in value.split(',') {
        numbers.push(part.parse().ok()?);
    }
    if numbers.len() % 2 != 0 {
        return None;
    }
    Some(numbers.chunks(2).map(|c| (c[0], c[1])).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_counts_its_own_length() {
        let mut b = PaxBuilder::new();
        b.push("path", "hello");
        let encoded = b.encode();
        assert_eq!(encoded, b"14 path=hello\n");
        assert_eq!(encoded.len(), 14);

        let o = PaxOverrides::parse(&encoded).unwrap();
        assert_eq!(o.path.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn emit_length_fixed_point() {
        // 97 bytes of suffix puts the total right at the two-to-three
        // digit boundary.
        let mut b = PaxBuilder::new();
        let value = "v".repeat(93);
        b.push("k", &value);
        let encoded = b.encode();
        let space = encoded.iter().position(|b| *b == b' ').unwrap();
        let len: usize = str::from_utf8(&encoded[..space]).unwrap().parse().unwrap();
        assert_eq!(len, encoded.len());
    }

    #[test]
    fn parse_round_trip() {
        let mut b = PaxBuilder::new();
        b.push("path", "some/long/path");
        b.push("mtime", "1234567890.5");
        b.push("comment", "has=equals");
        let encoded = b.encode();

        let mut it = PaxExtensions::new(&encoded);
        let first = it.next().unwrap().unwrap();
        assert_eq!(first.key().unwrap(), "path");
        assert_eq!(first.value().unwrap(), "some/long/path");
        let second = it.next().unwrap().unwrap();
        assert_eq!(second.key().unwrap(), "mtime");
        assert_eq!(second.value().unwrap(), "1234567890.5");
        let third = it.next().unwrap().unwrap();
        assert_eq!(third.value().unwrap(), "has=equals");
        assert!(it.next().is_none());
    }

    #[test]
    fn binary_values_survive() {
        let mut b = PaxBuilder::new();
        b.push_bytes("SCHILY.xattr.user.blob", b"a\0b\nc");
        let encoded = b.encode();
        let o = PaxOverrides::parse(&encoded).unwrap();
        assert_eq!(o.xattrs.len(), 1);
        assert_eq!(o.xattrs[0].0, b"user.blob");
        assert_eq!(o.xattrs[0].1, b"a\0b\nc");
    }

    #[test]
    fn times_parse_at_nanosecond_precision() {
        assert_eq!(parse_time("1234567890"), Some((1234567890, 0)));
        assert_eq!(parse_time("1.5"), Some((1, 500_000_000)));
        assert_eq!(parse_time("1.123456789"), Some((1, 123_456_789)));
        assert_eq!(parse_time("1.1234567891"), Some((1, 123_456_789)));
        assert_eq!(parse_time("nope"), None);
        assert_eq!(format_time(1, 500_000_000), "1.500000000");
        assert_eq!(format_time(7, 0), "7");
    }

    #[test]
    fn sparse_map_parses() {
        let o = PaxOverrides::parse(
            &{
                let mut b = PaxBuilder::new();
                b.push("GNU.sparse.major", "1");
                b.push("GNU.sparse.minor", "0");
                b.push("GNU.sparse.realsize", "1048576");
                b.push("GNU.sparse.map", "0,512,65536,512");
                b.encode()
            },
        )
        .unwrap();
        assert!(o.has_sparse_info());
        assert_eq!(o.sparse_realsize, Some(1048576));
        assert_eq!(o.sparse_regions().unwrap(), vec![(0, 512), (65536, 512)]);
    }

    #[test]
    fn global_merge_precedence() {
        let global = PaxOverrides::parse(b"20 uname=globaluser\n16 uid=12345678\n").unwrap();
        let mut merged = global.clone();
        let local = PaxOverrides::parse(b"19 uname=localuser\n").unwrap();
        merged.merge_from(&local);
        assert_eq!(merged.uname.as_deref(), Some("localuser"));
        assert_eq!(merged.uid, Some(12345678));
    }
}
