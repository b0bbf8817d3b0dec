//! Sparse-file regions: detection on the way in, seek-based holes on the
//! way out.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::numeric;
use crate::other;
use crate::pax::{
    PaxBuilder, PAX_GNUSPARSEMAJOR, PAX_GNUSPARSEMAP, PAX_GNUSPARSEMINOR, PAX_GNUSPARSENAME,
    PAX_GNUSPARSEREALSIZE,
};

const DETECT_CHUNK: usize = 64 * 1024;

/// An ordered set of `(offset, numbytes)` data regions within a file;
/// the gaps between them are holes.
///
/// The logical size is the length the file reports; the physical size is
/// the number of data bytes actually stored in the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SparseMap {
    regions: Vec<(u64, u64)>,
    logical: u64,
}

impl SparseMap {
    /// Builds a map from raw regions.
    pub fn from_regions(regions: Vec<(u64, u64)>, logical: u64) -> SparseMap {
        SparseMap { regions, logical }
    }

    /// Scans `file` for runs of zero bytes, chunk by chunk.
    ///
    /// The detector is conservative: holes smaller than the scan chunk
    /// may be recorded as data, never the reverse.
    pub fn detect(file: &mut fs::File, logical: u64) -> io::Result<SparseMap> {
        file.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; DETECT_CHUNK];
        let mut regions = Vec::new();
        let mut offset: u64 = 0;
        let mut data_start: Option<u64> = None;

        while offset < logical {
            let want = std::cmp::min(DETECT_CHUNK as u64, logical - offset) as usize;
            let mut filled = 0;
            while filled < want {
                match file.read(&mut buf[filled..want])? {
                    0 => break,
                    n => filled += n,
                }
            }
            if filled == 0 {
                break;
            }
            let is_hole = buf[..filled].iter().all(|b| *b == 0);
            match (is_hole, data_start) {
                (true, Some(start)) => {
                    regions.push((start, offset - start));
                    data_start = None;
                }
                (false, None) => data_start = Some(offset),
                _ => {}
            }
            offset += filled as u64;
        }
        if let Some(start) = data_start {
            regions.push((start, offset - start));
        }
        file.seek(SeekFrom::Start(0))?;
        Ok(SparseMap {
            regions,
            logical,
        })
    }

    /// The data regions, in file order.
    pub fn regions(&self) -> &[(u64, u64)] {
        &self.regions
    }

    /// The represented file length.
    pub fn logical_size(&self) -> u64 {
        self.logical
    }

    /// Number of data bytes the archive will store for this file.
    pub fn data_size(&self) -> u64 {
        self.regions.iter().map(|r| r.1).sum()
    }

    /// Data bytes rounded up to the archive's block granularity; this is
    /// what the header's `size` field holds for a sparse member.
    pub fn stored_size(&self) -> u64 {
        numeric::blocks_needed(self.data_size()) * 512
    }

    /// Whether storing this file sparsely is worth the extra headers.
    pub fn is_worth_storing_sparse(&self) -> bool {
        self.data_size() < self.logical / 10 * 9 || self.regions.len() > 1
    }

    /// Renders the region list in the `GNU.sparse.map` wire form,
    /// comma-separated decimal offset/length pairs.
    pub fn encode_map(&self) -> String {
        let mut out = String::new();
        for (i, (off, len)) in self.regions.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&off.to_string());
            out.push(',');
            out.push_str(&len.to_string());
        }
        out
    }

    /// Adds the PAX sparse records describing this map to `pax`.
    pub fn add_pax_records(&self, original_name: &str, pax: &mut PaxBuilder) {
        pax.push(PAX_GNUSPARSEMAJOR, "1");
        pax.push(PAX_GNUSPARSEMINOR, "0");
        pax.push(PAX_GNUSPARSENAME, original_name);
        pax.push(PAX_GNUSPARSEREALSIZE, &self.logical.to_string());
        pax.push(PAX_GNUSPARSEMAP, &self.encode_map());
    }

    /// Streams the data regions of `file` into `dst`, returning the
    /// number of bytes written (unpadded).
    pub fn write_data<W: Write>(&self, dst: &mut W, file: &mut fs::File) -> io::Result<u64> {
        let mut written = 0;
        for &(offset, numbytes) in &self.regions {
            file.seek(SeekFrom::Start(offset))?;
            let copied = io::copy(&mut file.take(numbytes), dst)?;
            if copied != numbytes {
                return Err(other("file shrank while archiving sparse data"));
            }
            written += copied;
        }
        Ok(written)
    }

    /// Materializes a sparse member into `file`, reading the stored data
    /// regions from `r` in order and seeking across the holes.
    ///
    /// The file length is set up front so filesystems that support holes
    /// create them lazily; on those that don't the gaps read back as
    /// zeros all the same.
    pub fn extract<R: Read>(&self, r: &mut R, file: &mut fs::File) -> io::Result<()> {
        file.set_len(self.logical)?;
        for &(offset, numbytes) in &self.regions {
            if offset.checked_add(numbytes).map_or(true, |end| end > self.logical) {
                return Err(other("sparse region lies outside the file"));
            }
            file.seek(SeekFrom::Start(offset))?;
            let copied = io::copy(&mut r.take(numbytes), file)?;
            if copied != numbytes {
                return Err(other("archive ended inside a sparse region"));
            }
        }
        Ok(())
    }

    /// Validates region ordering: regions must be ascending and
    /// non-overlapping.
    pub fn validate(&self) -> io::Result<()> {
        let mut cursor = 0u64;
        for &(offset, numbytes) in &self.regions {
            if offset < cursor {
                return Err(other("out of order or overlapping sparse blocks"));
            }
            cursor = offset
                .checked_add(numbytes)
                .ok_or_else(|| other("more bytes listed in sparse file than u64 can hold"))?;
        }
        if cursor > self.logical {
            return Err(other("mismatch in sparse file chunks and size in header"));
        }
        Ok(())
    }
}

/// A reader that expands a sparse member's physical stream into its
/// logical byte sequence, yielding zeros across the holes.
///
/// Used when a sparse member must be consumed as a plain byte stream:
/// extraction to stdout and content comparison.
pub struct SparseReader<R> {
    inner: R,
    regions: Vec<(u64, u64)>,
    region: usize,
    position: u64,
    logical: u64,
}

impl<R: Read> SparseReader<R> {
    /// Wraps the physical data stream `inner`.
    pub fn new(inner: R, map: &SparseMap) -> SparseReader<R> {
        SparseReader {
            inner,
            regions: map.regions.clone(),
            region: 0,
            position: 0,
            logical: map.logical,
        }
    }
}

impl<R: Read> Read for SparseReader<R> {
    fn read(&mut self, into: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.logical || into.is_empty() {
            return Ok(0);
        }
        let remaining_logical = self.logical - self.position;
        let want = std::cmp::min(into.len() as u64, remaining_logical) as usize;
        let dest = &mut into[..want];

        match self.regions.get(self.region) {
            // Past the last region: the tail of the file is one hole.
            None => {
                for b in dest.iter_mut() {
                    *b = 0;
                }
                self.position += dest.len() as u64;
                Ok(dest.len())
            }
            Some(&(offset, numbytes)) => {
                if self.position < offset {
                    // Inside the hole before the next region.
                    let gap = std::cmp::min((offset - self.position) as usize, dest.len());
                    for b in dest[..gap].iter_mut() {
                        *b = 0;
                    }
                    self.position += gap as u64;
                    Ok(gap)
                } else {
                    let into_region = self.position - offset;
                    let left = numbytes - into_region;
                    let want = std::cmp::min(left, dest.len() as u64) as usize;
                    let n = self.inner.read(&mut dest[..want])?;
                    if n == 0 && want > 0 {
                        return Err(other("archive ended inside a sparse region"));
                    }
                    self.position += n as u64;
                    if self.position == offset + numbytes {
                        self.region += 1;
                    }
                    Ok(n)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn map(regions: &[(u64, u64)], logical: u64) -> SparseMap {
        SparseMap::from_regions(regions.to_vec(), logical)
    }

    #[test]
    fn worthiness() {
        // One region covering everything: dense.
        assert!(!map(&[(0, 1000)], 1000).is_worth_storing_sparse());
        // Mostly hole.
        assert!(map(&[(0, 10)], 1000).is_worth_storing_sparse());
        // Multiple regions are always worth it.
        assert!(map(&[(0, 500), (600, 400)], 1000).is_worth_storing_sparse());
        // Empty file.
        assert!(!map(&[], 0).is_worth_storing_sparse());
    }

    #[test]
    fn map_encoding() {
        let m = map(&[(0, 512), (65536, 1024)], 1 << 20);
        assert_eq!(m.encode_map(), "0,512,65536,1024");
        assert_eq!(m.data_size(), 1536);
        assert_eq!(m.stored_size(), 1536);
        let m = map(&[(0, 100)], 1000);
        assert_eq!(m.stored_size(), 512);
    }

    #[test]
    fn validation() {
        assert!(map(&[(0, 512), (512, 512)], 2048).validate().is_ok());
        assert!(map(&[(512, 512), (0, 512)], 2048).validate().is_err());
        assert!(map(&[(0, 1024), (512, 512)], 2048).validate().is_err());
        assert!(map(&[(0, 4096)], 2048).validate().is_err());
    }

    #[test]
    fn logical_expansion() {
        // Physical stream holds the two data regions back to back.
        let physical = [b"AAAA".to_vec(), b"BB".to_vec()].concat();
        let m = map(&[(2, 4), (8, 2)], 12);
        let mut r = SparseReader::new(Cursor::new(physical), &m);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"\0\0AAAA\0\0BB\0\0");
    }

    #[test]
    fn detect_finds_chunk_holes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holey");
        let mut f = fs::File::create(&path).unwrap();
        // data chunk, hole chunk, data chunk
        f.write_all(&vec![7u8; DETECT_CHUNK]).unwrap();
        f.write_all(&vec![0u8; DETECT_CHUNK]).unwrap();
        f.write_all(&vec![9u8; 100]).unwrap();
        f.sync_all().unwrap();

        let mut f = fs::File::open(&path).unwrap();
        let logical = f.metadata().unwrap().len();
        let m = SparseMap::detect(&mut f, logical).unwrap();
        assert_eq!(
            m.regions(),
            &[
                (0, DETECT_CHUNK as u64),
                (2 * DETECT_CHUNK as u64, 100)
            ]
        );
        assert!(m.is_worth_storing_sparse());
    }
}
