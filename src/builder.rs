use std::collections::HashMap;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::fsutil::UserDb;
use crate::header::{Format, GnuExtSparseHeader, Header, HeaderMode};
use crate::pax::{PaxBuilder, PAX_LINKPATH, PAX_MTIME, PAX_PATH, PAX_SIZE};
use crate::sparse::SparseMap;
use crate::{other, path2bytes, EntryType};

/// The largest value the 12-byte octal size field can carry; anything
/// bigger switches the field to base-256 and, under pax, gains a `size`
/// record.
const MAX_OCTAL_SIZE: u64 = 0o77777777777;

/// A structure for building archives
///
/// This structure has methods for building up an archive from scratch
/// into any arbitrary writer, in any of the supported dialects. Names
/// too long for a plain header are carried per the selected format: GNU
/// `L`/`K` members or PAX `x` records; v7 and plain ustar reject them.
pub struct Builder<W: Write> {
    mode: HeaderMode,
    format: Format,
    follow: bool,
    sparse: bool,
    numeric_owner: bool,
    xattrs: bool,
    blocking_factor: u32,
    finished: bool,
    written: u64,
    seen_links: HashMap<(u64, u64), PathBuf>,
    users: UserDb,
    obj: Option<W>,
}

impl<W: Write> Builder<W> {
    /// Create a new archive builder with the underlying object as the
    /// destination of all data written. The builder will use
    /// `HeaderMode::Complete` by default.
    pub fn new(obj: W) -> Builder<W> {
        Builder {
            mode: HeaderMode::Complete,
            format: Format::default(),
            follow: false,
            sparse: false,
            numeric_owner: false,
            xattrs: false,
            blocking_factor: 20,
            finished: false,
            written: 0,
            seen_links: HashMap::new(),
            users: UserDb::new(),
            obj: Some(obj),
        }
    }

    fn inner(&mut self) -> &mut W {
        self.obj.as_mut().unwrap()
    }

    /// Changes the HeaderMode that will be used when reading fs Metadata
    /// for methods that implicitly read metadata for an input Path.
    /// Notably, this does _not_ apply to `append(Header)`.
    pub fn mode(&mut self, mode: HeaderMode) {
        self.mode = mode;
    }

    /// Selects the archive dialect for headers built from paths.
    pub fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    /// Follow symlinks, archiving the target instead of the link.
    pub fn follow_symlinks(&mut self, follow: bool) {
        self.follow = follow;
    }

    /// Detect and store holes in regular files (gnu and pax formats
    /// only).
    pub fn set_sparse(&mut self, sparse: bool) {
        self.sparse = sparse;
    }

    /// Suppress owner/group names, leaving only the numeric ids.
    pub fn set_numeric_owner(&mut self, numeric: bool) {
        self.numeric_owner = numeric;
    }

    /// Carry extended attributes in `SCHILY.xattr.*` records (pax
    /// format only).
    pub fn set_xattrs(&mut self, xattrs: bool) {
        self.xattrs = xattrs;
    }

    /// Pads the finished archive to a multiple of `factor` 512-byte
    /// blocks (GNU's default record size is 20 blocks).
    pub fn set_blocking_factor(&mut self, factor: u32) {
        self.blocking_factor = factor.max(1);
    }

    /// Unwrap this archive, returning the underlying object.
    ///
    /// This function will finish writing the archive if the `finish`
    /// function hasn't yet been called, returning any I/O error which
    /// happens during that operation.
    pub fn into_inner(mut self) -> io::Result<W> {
        if !self.finished {
            self.finish()?;
        }
        Ok(self.obj.take().unwrap())
    }

    /// Adds a new entry to this archive.
    ///
    /// This function will append the header specified, followed by
    /// contents of the stream specified by `data`. To produce a valid
    /// archive the `size` field of `header` must be the same as the
    /// length of the stream that's being written. Additionally the
    /// checksum for the header should have been set via the `set_cksum`
    /// method.
    ///
    /// Note that this will not attempt to seek the archive to a valid
    /// position, so if the archive is in the middle of a read or some
    /// other similar operation then this may corrupt the archive.
    ///
    /// Also note that after all entries have been written to an archive
    /// the `finish` function needs to be called to finish writing the
    /// archive.
    ///
    /// # Examples
    ///
    /// ```
    /// use rustar::{Builder, Header};
    ///
    /// let mut header = Header::new_gnu();
    /// header.set_path("foo").unwrap();
    /// header.set_size(4);
    /// header.set_cksum();
    ///
    /// let data: &[u8] = &[1, 2, 3, 4];
    ///
    /// let mut ar = Builder::new(Vec::new());
    /// ar.append(&header, data).unwrap();
    /// let data = ar.into_inner().unwrap();
    /// # drop(data);
    /// ```
    pub fn append<R: Read>(&mut self, header: &Header, mut data: R) -> io::Result<()> {
        let expected = header.entry_size()?;
        let written = append(self.inner(), header, &mut data, expected)?;
        self.written += written;
        Ok(())
    }

    /// Adds a new entry to this archive with the specified path.
    ///
    /// This function will set the specified path in the given header,
    /// which may require appending a GNU long-name member or a PAX
    /// record to the archive first. The checksum for the header will be
    /// automatically updated via the `set_cksum` method after setting
    /// the path. No other metadata in the header will be modified.
    pub fn append_data<P: AsRef<Path>, R: Read>(
        &mut self,
        header: &mut Header,
        path: P,
        data: R,
    ) -> io::Result<()> {
        let name = path2bytes(path.as_ref())?.to_vec();
        self.append_member(header, &name, None, PaxBuilder::new(), data)
    }

    /// Adds a file on the local filesystem to this archive.
    ///
    /// This function will open the file specified by `path` and insert
    /// the file into the archive with the appropriate metadata set,
    /// returning any I/O error which occurs while writing. The path name
    /// for the file inside of this archive will be the same as `path`,
    /// and it is required that the path is a relative path.
    pub fn append_path<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let path = path.as_ref().to_path_buf();
        self.append_path_with_name(&path, &path)
    }

    /// Adds a file on the local filesystem to this archive under the
    /// given archive name.
    pub fn append_path_with_name(&mut self, src: &Path, name: &Path) -> io::Result<()> {
        let meta = if self.follow {
            fs::metadata(src)?
        } else {
            fs::symlink_metadata(src)?
        };
        self.append_fs(src, name, &meta)
    }

    /// Adds a file to this archive with the given path as the name of
    /// the file in the archive.
    ///
    /// This will use the metadata of `file` to populate a `Header`, and
    /// it will then append the file to the archive with the name `path`.
    pub fn append_file<P: AsRef<Path>>(&mut self, path: P, file: &mut fs::File) -> io::Result<()> {
        let meta = file.metadata()?;
        let mut header = Header::new(self.format);
        header.set_metadata_in_mode(&meta, self.mode);
        self.fill_owner_names(&mut header, &meta);
        let name = path2bytes(path.as_ref())?.to_vec();
        let pax = self.standard_pax_records(&meta);
        self.append_member(&mut header, &name, None, pax, file)
    }

    /// Adds a directory to this archive with the given path as the name
    /// of the directory in the archive.
    ///
    /// This will use `stat` to populate a `Header`, and it will then
    /// append the directory to the archive with the name `path`.
    pub fn append_dir<P, Q>(&mut self, path: P, src_path: Q) -> io::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let meta = fs::metadata(src_path.as_ref())?;
        self.append_fs(src_path.as_ref(), path.as_ref(), &meta)
    }

    /// Adds a directory and all of its contents (recursively) to this
    /// archive with the given path as the name of the directory in the
    /// archive.
    pub fn append_dir_all<P, Q>(&mut self, path: P, src_path: Q) -> io::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let path = path.as_ref();
        let src_path = src_path.as_ref();
        let mut stack = vec![(src_path.to_path_buf(), true)];
        while let Some((src, is_dir)) = stack.pop() {
            let dest = path.join(src.strip_prefix(src_path).map_err(|_| {
                other("walked path escaped its root")
            })?);
            if is_dir {
                for entry in fs::read_dir(&src)? {
                    let entry = entry?;
                    stack.push((entry.path(), entry.file_type()?.is_dir()));
                }
                if dest != Path::new("") {
                    self.append_path_with_name(&src, &dest)?;
                }
            } else {
                self.append_path_with_name(&src, &dest)?;
            }
        }
        Ok(())
    }

    /// Finish writing this archive, emitting the termination sections.
    ///
    /// This function should only be called when the archive has been
    /// written entirely and if an I/O error happens the underlying
    /// object still needs to be acquired.
    ///
    /// In most situations the `into_inner` method should be preferred.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.inner().write_all(&[0; 1024])?;
        self.written += 1024;
        // Pad the archive out to a full record.
        let record = self.blocking_factor as u64 * 512;
        let rem = self.written % record;
        if rem != 0 {
            let zeros = vec![0u8; (record - rem) as usize];
            self.inner().write_all(&zeros)?;
            self.written += zeros.len() as u64;
        }
        Ok(())
    }

    fn append_fs(&mut self, src: &Path, name: &Path, meta: &fs::Metadata) -> io::Result<()> {
        let mut header = Header::new(self.format);
        header.set_metadata_in_mode(meta, self.mode);
        self.fill_owner_names(&mut header, meta);
        let mut pax = self.standard_pax_records(meta);

        let mut name_bytes = path2bytes(name)?.to_vec();
        let ft = meta.file_type();

        if self.xattrs && self.format.uses_pax() && (ft.is_dir() || ft.is_file()) {
            self.collect_xattrs(src, &mut pax);
        }

        if ft.is_dir() {
            if name_bytes.last() != Some(&b'/') {
                name_bytes.push(b'/');
            }
            return self.append_member(&mut header, &name_bytes, None, pax, io::empty());
        }

        if ft.is_symlink() {
            let target = fs::read_link(src)?;
            let link_bytes = path2bytes(&target)?.to_vec();
            header.set_size(0);
            return self.append_member(
                &mut header,
                &name_bytes,
                Some(&link_bytes),
                pax,
                io::empty(),
            );
        }

        #[cfg(unix)]
        {
            use std::os::unix::prelude::*;
            if ft.is_char_device() || ft.is_block_device() {
                let (major, minor) = crate::fsutil::device_numbers(meta);
                header.set_device_major(major)?;
                header.set_device_minor(minor)?;
                header.set_size(0);
                return self.append_member(&mut header, &name_bytes, None, pax, io::empty());
            }
            if ft.is_fifo() {
                header.set_size(0);
                return self.append_member(&mut header, &name_bytes, None, pax, io::empty());
            }

            // A second sighting of the same inode becomes a hard link to
            // the first archived name.
            if meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(first) = self.seen_links.get(&key) {
                    let link_bytes = path2bytes(first)?.to_vec();
                    header.set_entry_type(EntryType::hard_link());
                    header.set_size(0);
                    return self.append_member(
                        &mut header,
                        &name_bytes,
                        Some(&link_bytes),
                        pax,
                        io::empty(),
                    );
                }
                let recorded = crate::bytes2path(std::borrow::Cow::Borrowed(&name_bytes[..]))?
                    .into_owned();
                self.seen_links.insert(key, recorded);
            }
        }

        let mut file = fs::File::open(src)?;

        if self.sparse && meta.len() > 0 && self.format != Format::V7 && self.format != Format::Ustar
        {
            let map = SparseMap::detect(&mut file, meta.len())?;
            if map.is_worth_storing_sparse() {
                return self.append_sparse(header, &name_bytes, pax, map, &mut file);
            }
        }

        if meta.len() > MAX_OCTAL_SIZE && self.format.uses_pax() {
            pax.push(PAX_SIZE, &meta.len().to_string());
        }
        self.append_member(&mut header, &name_bytes, None, pax, &mut file)
    }

    fn fill_owner_names(&mut self, header: &mut Header, meta: &fs::Metadata) {
        if self.numeric_owner || !self.format.has_magic() {
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::prelude::*;
            if let Some(name) = self.users.username(meta.uid()) {
                let _ = header.set_username(&name);
            }
            if let Some(name) = self.users.groupname(meta.gid()) {
                let _ = header.set_groupname(&name);
            }
        }
        #[cfg(not(unix))]
        let _ = (header, meta);
    }

    /// Records pax can carry that plain headers cannot: sub-second
    /// mtimes.
    fn standard_pax_records(&self, meta: &fs::Metadata) -> PaxBuilder {
        let mut pax = PaxBuilder::new();
        if !self.format.uses_pax() || self.mode == HeaderMode::Deterministic {
            return pax;
        }
        #[cfg(unix)]
        {
            use std::os::unix::prelude::*;
            let nsec = meta.mtime_nsec();
            if nsec > 0 {
                pax.push(
                    PAX_MTIME,
                    &crate::pax::format_time(meta.mtime().max(0) as u64, nsec as u32),
                );
            }
        }
        #[cfg(not(unix))]
        let _ = meta;
        pax
    }

    #[cfg(all(unix, feature = "xattr"))]
    fn collect_xattrs(&mut self, src: &Path, pax: &mut PaxBuilder) {
        use crate::pax::PAX_SCHILYXATTR;
        let attrs = match xattr::list(src) {
            Ok(attrs) => attrs,
            Err(e) => {
                log::warn!("cannot list xattrs of `{}`: {}", src.display(), e);
                return;
            }
        };
        for attr in attrs {
            let name = attr.to_string_lossy().into_owned();
            match xattr::get(src, &attr) {
                Ok(Some(value)) => {
                    pax.push_bytes(&format!("{}{}", PAX_SCHILYXATTR, name), &value);
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("cannot read xattr {} of `{}`: {}", name, src.display(), e);
                }
            }
        }
    }

    #[cfg(not(all(unix, feature = "xattr")))]
    fn collect_xattrs(&mut self, _src: &Path, _pax: &mut PaxBuilder) {}

    fn append_sparse(
        &mut self,
        mut header: Header,
        name: &[u8],
        mut pax: PaxBuilder,
        map: SparseMap,
        file: &mut fs::File,
    ) -> io::Result<()> {
        if self.format.uses_pax() {
            map.add_pax_records(&String::from_utf8_lossy(name), &mut pax);
            header.set_size(map.stored_size());
            self.append_member_with_writer(&mut header, name, None, pax, |dst| {
                let written = map.write_data(dst, file)?;
                pad_to_block(dst, written)?;
                Ok(map.stored_size())
            })
        } else {
            // Old GNU sparse: region slots in the header, continuation
            // blocks after it.
            header.set_entry_type(EntryType::gnu_sparse());
            header.set_size(map.stored_size());
            let regions = map.regions().to_vec();
            let logical = map.logical_size();
            {
                let gnu = header
                    .as_gnu_mut()
                    .ok_or_else(|| other("sparse members need a GNU header"))?;
                crate::numeric::encode(&mut gnu.realsize, logical);
                for (slot, region) in gnu.sparse.iter_mut().zip(regions.iter()) {
                    slot.set(region.0, region.1);
                }
                gnu.isextended[0] = if regions.len() > 4 { 1 } else { 0 };
            }
            self.append_member_with_writer(&mut header, name, None, pax, |dst| {
                let mut extra = 0;
                let mut rest = &regions[regions.len().min(4)..];
                while !rest.is_empty() {
                    let mut ext = GnuExtSparseHeader::new();
                    for (slot, region) in ext.sparse.iter_mut().zip(rest.iter()) {
                        slot.set(region.0, region.1);
                    }
                    let consumed = rest.len().min(21);
                    rest = &rest[consumed..];
                    ext.isextended[0] = if rest.is_empty() { 0 } else { 1 };
                    dst.write_all(ext.as_bytes())?;
                    extra += 512;
                }
                let written = map.write_data(dst, file)?;
                pad_to_block(dst, written)?;
                Ok(extra + map.stored_size())
            })
        }
    }

    /// The common tail of every append: name policy, optional pre-
    /// entries, checksum, header and data.
    fn append_member<R: Read>(
        &mut self,
        header: &mut Header,
        name: &[u8],
        link: Option<&[u8]>,
        pax: PaxBuilder,
        mut data: R,
    ) -> io::Result<()> {
        let size = header.entry_size()?;
        self.append_member_with_writer(header, name, link, pax, |dst| {
            let written = copy_exact(dst, &mut data, size)?;
            pad_to_block(dst, written)?;
            Ok(crate::numeric::blocks_needed(size) * 512)
        })
    }

    fn append_member_with_writer<F>(
        &mut self,
        header: &mut Header,
        name: &[u8],
        link: Option<&[u8]>,
        mut pax: PaxBuilder,
        write_data: F,
    ) -> io::Result<()>
    where
        F: FnOnce(&mut W) -> io::Result<u64>,
    {
        self.prepare_name(header, name, &mut pax)?;
        if let Some(link) = link {
            self.prepare_link(header, link, &mut pax)?;
        }

        if !pax.is_empty() {
            self.write_pax_member(header, name, &pax)?;
        }

        header.set_cksum();
        self.inner().write_all(header.as_bytes())?;
        self.written += 512;
        let data_written = write_data(self.inner())?;
        self.written += data_written;
        Ok(())
    }

    /// Encodes `name` into the header, falling back to the dialect's
    /// long-name mechanism when it does not fit.
    fn prepare_name(
        &mut self,
        header: &mut Header,
        name: &[u8],
        pax: &mut PaxBuilder,
    ) -> io::Result<()> {
        if self.format == Format::V7 && name.len() > 99 {
            return Err(name_too_long(name));
        }
        let path = crate::bytes2path(std::borrow::Cow::Borrowed(name))?.into_owned();
        if header.set_path(&path).is_ok() {
            return Ok(());
        }
        match self.format {
            Format::Gnu | Format::OldGnu => {
                self.write_gnu_long_member(EntryType::gnu_longname(), name)?;
                truncate_into(&mut header.as_old_mut().name, name);
                Ok(())
            }
            Format::Pax => {
                pax.push_bytes(PAX_PATH, name);
                truncate_into(&mut header.as_old_mut().name, name);
                Ok(())
            }
            Format::V7 | Format::Ustar => Err(name_too_long(name)),
        }
    }

    fn prepare_link(
        &mut self,
        header: &mut Header,
        link: &[u8],
        pax: &mut PaxBuilder,
    ) -> io::Result<()> {
        let path = crate::bytes2path(std::borrow::Cow::Borrowed(link))?.into_owned();
        if header.set_link_name(&path).is_ok() {
            return Ok(());
        }
        match self.format {
            Format::Gnu | Format::OldGnu => {
                self.write_gnu_long_member(EntryType::gnu_longlink(), link)?;
                truncate_into(&mut header.as_old_mut().linkname, link);
                Ok(())
            }
            Format::Pax => {
                pax.push_bytes(PAX_LINKPATH, link);
                truncate_into(&mut header.as_old_mut().linkname, link);
                Ok(())
            }
            Format::V7 | Format::Ustar => Err(name_too_long(link)),
        }
    }

    /// Emits a GNU `L`/`K` member carrying the NUL-terminated long name.
    fn write_gnu_long_member(&mut self, kind: EntryType, name: &[u8]) -> io::Result<()> {
        let mut header = Header::new_gnu();
        let gnu_name = b"././@LongLink";
        header.as_old_mut().name[..gnu_name.len()].copy_from_slice(gnu_name);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_size((name.len() + 1) as u64);
        header.set_entry_type(kind);
        header.set_cksum();

        self.inner().write_all(header.as_bytes())?;
        self.inner().write_all(name)?;
        self.inner().write_all(&[0])?;
        let payload = name.len() as u64 + 1;
        pad_to_block(self.inner(), payload)?;
        self.written += 512 + crate::numeric::blocks_needed(payload) * 512;
        Ok(())
    }

    /// Emits the `x` pre-entry carrying this member's PAX records.
    fn write_pax_member(
        &mut self,
        real_header: &Header,
        name: &[u8],
        pax: &PaxBuilder,
    ) -> io::Result<()> {
        let payload = pax.encode();
        let mut header = Header::new_ustar();
        let mut pax_name = b"PaxHeaders.0/".to_vec();
        pax_name.extend_from_slice(name);
        truncate_into(&mut header.as_old_mut().name, &pax_name);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(real_header.mtime().unwrap_or(0));
        header.set_size(payload.len() as u64);
        header.set_entry_type(EntryType::pax_extensions());
        header.set_cksum();

        self.inner().write_all(header.as_bytes())?;
        self.inner().write_all(&payload)?;
        pad_to_block(self.inner(), payload.len() as u64)?;
        self.written += 512 + crate::numeric::blocks_needed(payload.len() as u64) * 512;
        Ok(())
    }
}

fn append(
    dst: &mut dyn Write,
    header: &Header,
    data: &mut dyn Read,
    size: u64,
) -> io::Result<u64> {
    dst.write_all(header.as_bytes())?;
    let written = copy_exact(dst, data, size)?;
    pad_to_block(dst, written)?;
    Ok(512 + crate::numeric::blocks_needed(size) * 512)
}

/// Copies exactly `size` bytes, zero-filling if the source comes up
/// short (the file shrank while we were reading it).
fn copy_exact(dst: &mut dyn Write, data: &mut dyn Read, size: u64) -> io::Result<u64> {
    let copied = io::copy(&mut data.take(size), dst)?;
    if copied < size {
        log::warn!("file shrank while reading it; zero-filling {} bytes", size - copied);
        let mut remaining = size - copied;
        let zeros = [0u8; 4096];
        while remaining > 0 {
            let n = std::cmp::min(remaining, zeros.len() as u64) as usize;
            dst.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
    }
    Ok(size)
}

/// Pads `dst` with zeros to the next 512-byte boundary after `written`
/// payload bytes.
fn pad_to_block(dst: &mut dyn Write, written: u64) -> io::Result<()> {
    let buf = [0; 512];
    let remaining = 512 - (written % 512);
    if remaining < 512 {
        dst.write_all(&buf[..remaining as usize])?;
    }
    Ok(())
}

fn truncate_into(slot: &mut [u8], bytes: &[u8]) {
    let n = bytes.len().min(slot.len());
    slot[..n].copy_from_slice(&bytes[..n]);
}

fn name_too_long(name: &[u8]) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!(
            "{}: file name is too long for this format",
            String::from_utf8_lossy(name)
        ),
    )
}

impl<W: Write> Drop for Builder<W> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
