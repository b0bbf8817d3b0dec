use std::cell::{Cell, RefCell};
use std::cmp;
use std::io;
use std::io::prelude::*;
use std::marker;
use std::path::Path;

use crate::entry::{EntryFields, UnpackConfig};
use crate::error::TarError;
use crate::header::{GnuExtSparseHeader, Header};
use crate::other;
use crate::pax::PaxOverrides;
use crate::sparse::SparseMap;
use crate::Entry;

/// A top-level representation of an archive file.
///
/// This archive can be iterated over to yield its logical entries: GNU
/// long-name members, PAX extended headers and sparse continuation
/// blocks are accumulated internally and surface as attributes of the
/// real member they describe.
pub struct Archive<R: ?Sized + Read> {
    inner: ArchiveInner<R>,
}

pub struct ArchiveInner<R: ?Sized> {
    pos: Cell<u64>,
    ignore_zeros: Cell<bool>,
    obj: RefCell<R>,
}

/// An iterator over the entries of an archive.
pub struct Entries<'a, R: 'a + Read> {
    fields: EntriesFields<'a>,
    _ignored: marker::PhantomData<&'a Archive<R>>,
}

struct EntriesFields<'a> {
    archive: &'a Archive<dyn Read + 'a>,
    next: u64,
    done: bool,
    raw: bool,
    global_pax: Option<PaxOverrides>,
}

impl<R: Read> Archive<R> {
    /// Create a new archive with the underlying object as the reader.
    pub fn new(obj: R) -> Archive<R> {
        Archive {
            inner: ArchiveInner {
                obj: RefCell::new(obj),
                pos: Cell::new(0),
                ignore_zeros: Cell::new(false),
            },
        }
    }

    /// Unwrap this archive, returning the underlying object.
    pub fn into_inner(self) -> R {
        self.inner.obj.into_inner()
    }

    /// Construct an iterator over the entries in this archive.
    ///
    /// Note that care must be taken to consider each entry within an
    /// archive in sequence. If entries are processed out of sequence
    /// (from what the iterator returns), then the contents read for each
    /// entry may be corrupted.
    pub fn entries(&mut self) -> io::Result<Entries<'_, R>> {
        let me: &mut Archive<dyn Read> = self;
        me._entries().map(|fields| Entries {
            fields,
            _ignored: marker::PhantomData,
        })
    }

    /// Unpacks the contents tarball into the specified `dst`.
    ///
    /// This function will iterate over the entire contents of this
    /// tarball, extracting each file in turn to the location specified
    /// by the entry's path name.
    ///
    /// This operation is relatively sensitive in that it will not write
    /// files outside of the path specified by `dst`. Files in the
    /// archive which have a '..' in their path are skipped during the
    /// unpacking process.
    pub fn unpack<P: AsRef<Path>>(&mut self, dst: P) -> io::Result<()> {
        let me: &mut Archive<dyn Read> = self;
        me._unpack(dst.as_ref(), &UnpackConfig::default())
    }

    /// Like `unpack`, but with explicit extraction policy.
    pub fn unpack_with<P: AsRef<Path>>(&mut self, dst: P, config: &UnpackConfig) -> io::Result<()> {
        let me: &mut Archive<dyn Read> = self;
        me._unpack(dst.as_ref(), config)
    }

    /// Ignore lone zeroed blocks within the archive.
    ///
    /// The end of the archive is then observed only at EOF, which allows
    /// reading the concatenation of multiple archives in one pass.
    pub fn set_ignore_zeros(&mut self, ignore_zeros: bool) {
        self.inner.ignore_zeros.set(ignore_zeros);
    }

    /// The number of bytes consumed from the underlying reader so far.
    pub fn position(&self) -> u64 {
        self.inner.pos.get()
    }
}

impl<'a> Archive<dyn Read + 'a> {
    fn _entries(&mut self) -> io::Result<EntriesFields<'_>> {
        if self.inner.pos.get() != 0 {
            return Err(other(
                "cannot call entries unless archive is at \
                 position 0",
            ));
        }
        Ok(EntriesFields {
            archive: self,
            done: false,
            next: 0,
            raw: false,
            global_pax: None,
        })
    }

    fn _unpack(&mut self, dst: &Path, config: &UnpackConfig) -> io::Result<()> {
        for entry in self._entries()? {
            let mut fields =
                entry.map_err(|e| TarError::new("failed to iterate over archive", e))?;
            fields.unpack_in(dst, config)?;
        }
        Ok(())
    }

    fn skip(&self, mut amt: u64) -> io::Result<()> {
        let mut buf = [0u8; 4096 * 8];
        while amt > 0 {
            let n = cmp::min(amt, buf.len() as u64);
            let n = (&self.inner).read(&mut buf[..n as usize])?;
            if n == 0 {
                return Err(other("unexpected EOF during skip"));
            }
            amt -= n as u64;
        }
        Ok(())
    }
}

impl<'a, R: Read> Entries<'a, R> {
    /// Indicates whether this iterator will return raw entries or not.
    ///
    /// If the raw list of entries is returned, then no preprocessing
    /// happens on account of this library: GNU long-name members, PAX
    /// extended headers and sparse continuations come back as entries of
    /// their own. Raw iteration is disabled by default.
    pub fn raw(self, raw: bool) -> Entries<'a, R> {
        Entries {
            fields: EntriesFields {
                raw,
                ..self.fields
            },
            _ignored: marker::PhantomData,
        }
    }
}

impl<'a, R: Read> Iterator for Entries<'a, R> {
    type Item = io::Result<Entry<'a, R>>;

    fn next(&mut self) -> Option<io::Result<Entry<'a, R>>> {
        self.fields
            .next()
            .map(|result| result.map(|e| EntryFields::into_entry(e)))
    }
}

impl<'a> EntriesFields<'a> {
    fn next_entry_raw(&mut self) -> io::Result<Option<EntryFields<'a>>> {
        // Seek to the start of the next header in the archive
        let delta = self.next - self.archive.inner.pos.get();
        self.archive.skip(delta)?;

        let mut header = Header::new_old();
        let mut zero_blocks = 0;
        loop {
            if !try_read_block(&mut &self.archive.inner, header.as_mut_bytes())? {
                // Plain EOF where a header was expected: the terminator
                // under `ignore_zeros`, a truncation otherwise.
                if self.archive.inner.ignore_zeros.get() || zero_blocks > 0 {
                    return Ok(None);
                }
                return Err(other("archive ended before its zero-block terminator"));
            }
            self.next += 512;

            if !header.is_zero_block() {
                if zero_blocks > 0 && !self.archive.inner.ignore_zeros.get() {
                    return Err(other(
                        "found block of 0s not followed by a second \
                         block of 0s",
                    ));
                }
                return self.finish_header(header);
            }
            zero_blocks += 1;
            if zero_blocks == 2 && !self.archive.inner.ignore_zeros.get() {
                return Ok(None);
            }
        }
    }

    fn finish_header(&mut self, header: Header) -> io::Result<Option<EntryFields<'a>>> {
        // A corrupt checksum is reported but does not abort the scan.
        if !header.cksum_valid() {
            log::warn!(
                "{}: header checksum mismatch; continuing",
                String::from_utf8_lossy(&header.path_bytes())
            );
        }

        let size = header.entry_size()?;

        let ret = EntryFields {
            size,
            data: (&self.archive.inner).take(size),
            header,
            long_pathname: None,
            long_linkname: None,
            pax: None,
            sparse: None,
        };

        // Store where the next entry is, rounding up by 512 bytes (the
        // size of a header);
        let size = (size + 511) & !(512 - 1);
        self.next += size;

        Ok(Some(ret))
    }

    fn next_entry(&mut self) -> io::Result<Option<EntryFields<'a>>> {
        if self.raw {
            return self.next_entry_raw();
        }

        let mut gnu_longname = None;
        let mut gnu_longlink = None;
        let mut pax_local: Option<PaxOverrides> = None;
        let mut processed = 0;
        loop {
            processed += 1;
            let mut entry = match self.next_entry_raw()? {
                Some(entry) => entry,
                None if processed > 1 => {
                    return Err(other(
                        "members found describing a future member \
                         but no future member found",
                    ))
                }
                None => return Ok(None),
            };

            let kind = entry.header.entry_type();

            if kind.is_gnu_longname() {
                if gnu_longname.is_some() {
                    return Err(other(
                        "two long name entries describing \
                         the same member",
                    ));
                }
                gnu_longname = Some(trim_nuls(entry.read_all()?));
                continue;
            }

            if kind.is_gnu_longlink() {
                if gnu_longlink.is_some() {
                    return Err(other(
                        "two long name entries describing \
                         the same member",
                    ));
                }
                gnu_longlink = Some(trim_nuls(entry.read_all()?));
                continue;
            }

            if kind.is_pax_local_extensions() {
                if pax_local.is_some() {
                    return Err(other(
                        "two pax extensions entries describing \
                         the same member",
                    ));
                }
                pax_local = Some(PaxOverrides::parse(&entry.read_all()?)?);
                continue;
            }

            if kind.is_pax_global_extensions() {
                // Global extensions stick to every entry that follows
                // until overridden by a later global.
                let parsed = PaxOverrides::parse(&entry.read_all()?)?;
                match self.global_pax.as_mut() {
                    Some(global) => global.merge_from(&parsed),
                    None => self.global_pax = Some(parsed),
                }
                continue;
            }

            let mut fields = entry;
            fields.long_pathname = gnu_longname;
            fields.long_linkname = gnu_longlink;
            fields.pax = match (&self.global_pax, pax_local) {
                (Some(global), Some(local)) => {
                    let mut merged = global.clone();
                    merged.merge_from(&local);
                    Some(merged)
                }
                (Some(global), None) => Some(global.clone()),
                (None, local) => local,
            };
            self.parse_sparse_header(&mut fields)?;
            return Ok(Some(fields));
        }
    }

    fn parse_sparse_header(&mut self, entry: &mut EntryFields<'a>) -> io::Result<()> {
        if entry.header.entry_type().is_gnu_sparse() {
            return self.parse_old_gnu_sparse(entry);
        }
        let pax = match &entry.pax {
            Some(pax) if pax.has_sparse_info() => pax.clone(),
            _ => return Ok(()),
        };
        let logical = match pax.sparse_realsize.or(pax.size) {
            Some(n) => n,
            None => entry.header.entry_size()?,
        };
        let map = if let Some(regions) = pax.sparse_regions() {
            // Sparse 0.0/0.1: the region list came in the records.
            SparseMap::from_regions(regions, logical)
        } else if pax.sparse_major == Some(1) {
            // Sparse 1.0: the map is decimal text at the head of the
            // member's data, padded to a block boundary.
            self.parse_in_data_sparse_map(entry, logical)?
        } else {
            return Ok(());
        };
        map.validate()
            .map_err(|e| TarError::new("invalid sparse map", e))?;
        if map.data_size() > entry.size {
            return Err(other(
                "sparse file consumed more data than the header listed",
            ));
        }
        entry.sparse = Some(map);
        Ok(())
    }

    fn parse_old_gnu_sparse(&mut self, entry: &mut EntryFields<'a>) -> io::Result<()> {
        let (mut regions, logical, mut extended) = {
            let gnu = match entry.header.as_gnu() {
                Some(gnu) => gnu,
                None => return Err(other("sparse entry type listed but not GNU header")),
            };
            let mut regions = Vec::new();
            for block in gnu.sparse.iter() {
                if block.is_empty() {
                    break;
                }
                regions.push((block.offset()?, block.length()?));
            }
            (regions, gnu.real_size()?, gnu.is_extended())
        };

        // Continuation blocks sit between the header and the data.
        while extended {
            let mut ext = GnuExtSparseHeader::new();
            if !try_read_block(&mut &self.archive.inner, ext.as_mut_bytes())? {
                return Err(other("archive ended inside sparse continuation blocks"));
            }
            self.next += 512;
            for block in ext.sparse.iter() {
                if block.is_empty() {
                    break;
                }
                regions.push((block.offset()?, block.length()?));
            }
            extended = ext.is_extended();
        }

        // A trailing zero-length region only marks the file's end.
        while regions.last().map_or(false, |r| r.1 == 0) {
            regions.pop();
        }

        let map = SparseMap::from_regions(regions, logical);
        map.validate()
            .map_err(|e| TarError::new("invalid sparse map", e))?;
        if map.data_size() > entry.size {
            return Err(other(
                "sparse file consumed more data than the header listed",
            ));
        }
        entry.sparse = Some(map);
        Ok(())
    }

    fn parse_in_data_sparse_map(
        &mut self,
        entry: &mut EntryFields<'a>,
        logical: u64,
    ) -> io::Result<SparseMap> {
        let mut buf = Vec::new();
        let mut consumed = 0u64;
        loop {
            if consumed >= entry.size {
                return Err(other("sparse map runs past the member's data"));
            }
            let mut block = [0u8; 512];
            if !try_read_block(&mut &self.archive.inner, &mut block)? {
                return Err(other("archive ended inside a sparse map"));
            }
            consumed += 512;
            buf.extend_from_slice(&block);
            if let Some(regions) = parse_decimal_map(&buf) {
                entry.size -= consumed;
                entry.data = (&self.archive.inner).take(entry.size);
                return Ok(SparseMap::from_regions(regions, logical));
            }
        }
    }
}

impl<'a> Iterator for EntriesFields<'a> {
    type Item = io::Result<EntryFields<'a>>;

    fn next(&mut self) -> Option<io::Result<EntryFields<'a>>> {
        if self.done {
            None
        } else {
            match self.next_entry() {
                Ok(Some(e)) => Some(Ok(e)),
                Ok(None) => {
                    self.done = true;
                    None
                }
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            }
        }
    }
}

impl<'a, R: ?Sized + Read> Read for &'a ArchiveInner<R> {
    fn read(&mut self, into: &mut [u8]) -> io::Result<usize> {
        self.obj.borrow_mut().read(into).map(|i| {
            self.pos.set(self.pos.get() + i as u64);
            i
        })
    }
}

/// Reads one full 512-byte block; `Ok(false)` on clean EOF before any
/// byte, an error on a short block.
fn try_read_block<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..])? {
            0 if read == 0 => return Ok(false),
            0 => return Err(other("failed to read entire block")),
            n => read += n,
        }
    }
    Ok(true)
}

fn trim_nuls(mut bytes: Vec<u8>) -> Vec<u8> {
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes
}

/// Parses a GNU sparse 1.0 in-data map out of `buf` if all of its
/// newline-terminated decimal numbers have arrived.
fn parse_decimal_map(buf: &[u8]) -> Option<Vec<(u64, u64)>> {
    // Only lines already terminated by a newline count; a digit run cut
    // off at a block boundary must wait for the next block.
    let end = buf.iter().rposition(|b| *b == b'\n')?;
    let mut lines = buf[..end].split(|b| *b == b'\n');
    let count: u64 = parse_decimal_line(lines.next()?)?;
    let mut regions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset = parse_decimal_line(lines.next()?)?;
        let numbytes = parse_decimal_line(lines.next()?)?;
        regions.push((offset, numbytes));
    }
    Some(regions)
}

fn parse_decimal_line(line: &[u8]) -> Option<u64> {
    if line.is_empty() || !line.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    std::str::from_utf8(line).ok()?.parse().ok()
}
