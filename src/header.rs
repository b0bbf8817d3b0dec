#[cfg(unix)]
use std::os::unix::prelude::*;

use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::io;
use std::mem;
use std::path::Path;
use std::str;

use crate::numeric;
use crate::EntryType;
use crate::{bytes2path, other, path2bytes};

/// Representation of the header of an entry in an archive.
#[repr(C)]
#[allow(missing_docs)]
pub struct Header {
    bytes: [u8; 512],
}

/// The archive format dialect a header (or a whole archive) is written
/// in.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Format {
    /// Pre-POSIX Unix V7: no magic, 99-byte names, no extensions.
    V7,
    /// POSIX.1-1988 ustar: `ustar\0` magic, prefix field for long names.
    Ustar,
    /// Old GNU: `ustar  ` magic, long names via `L`/`K` members, sparse
    /// slots in the header.
    OldGnu,
    /// GNU: the same wire dialect as old GNU; the default for created
    /// archives.
    #[default]
    Gnu,
    /// POSIX.1-2001 pax: ustar magic plus `x`/`g` extended records.
    Pax,
}

/// Declares the information that should be included when filling a
/// header from filesystem metadata.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[non_exhaustive]
pub enum HeaderMode {
    /// All supported metadata, including mod/access times and ownership,
    /// will be included.
    #[default]
    Complete,
    /// Only metadata that is directly relevant to the identity of a file
    /// will be included. In particular, ownership and mod/access times
    /// are excluded.
    Deterministic,
}

/// Representation of the header of an entry in an archive, the pre-POSIX
/// V7 subset common to every dialect.
#[repr(C)]
#[allow(missing_docs)]
pub struct OldHeader {
    pub name: [u8; 100],
    pub mode: [u8; 8],
    pub uid: [u8; 8],
    pub gid: [u8; 8],
    pub size: [u8; 12],
    pub mtime: [u8; 12],
    pub cksum: [u8; 8],
    pub linkflag: [u8; 1],
    pub linkname: [u8; 100],
    pub pad: [u8; 255],
}

/// Representation of the header of an entry in an archive, the POSIX
/// ustar layout.
#[repr(C)]
#[allow(missing_docs)]
pub struct UstarHeader {
    pub name: [u8; 100],
    pub mode: [u8; 8],
    pub uid: [u8; 8],
    pub gid: [u8; 8],
    pub size: [u8; 12],
    pub mtime: [u8; 12],
    pub cksum: [u8; 8],
    pub typeflag: [u8; 1],
    pub linkname: [u8; 100],

    // ustar format
    pub magic: [u8; 6],
    pub version: [u8; 2],
    pub uname: [u8; 32],
    pub gname: [u8; 32],
    pub dev_major: [u8; 8],
    pub dev_minor: [u8; 8],
    pub prefix: [u8; 155],
    pub pad: [u8; 12],
}

/// Representation of the header of an entry in an archive, the GNU
/// layout with sparse slots and extra timestamps.
#[repr(C)]
#[allow(missing_docs)]
pub struct GnuHeader {
    pub name: [u8; 100],
    pub mode: [u8; 8],
    pub uid: [u8; 8],
    pub gid: [u8; 8],
    pub size: [u8; 12],
    pub mtime: [u8; 12],
    pub cksum: [u8; 8],
    pub typeflag: [u8; 1],
    pub linkname: [u8; 100],

    // GNU format
    pub magic: [u8; 6],
    pub version: [u8; 2],
    pub uname: [u8; 32],
    pub gname: [u8; 32],
    pub dev_major: [u8; 8],
    pub dev_minor: [u8; 8],
    pub atime: [u8; 12],
    pub ctime: [u8; 12],
    pub offset: [u8; 12],
    pub longnames: [u8; 4],
    pub unused: [u8; 1],
    pub sparse: [GnuSparseHeader; 4],
    pub isextended: [u8; 1],
    pub realsize: [u8; 12],
    pub pad: [u8; 17],
}

/// Description of a spare entry inside a GNU header.
///
/// One of these entries describes a chunk of data with a location within
/// a sparse file along with how many bytes exist at that location.
#[repr(C)]
#[allow(missing_docs)]
pub struct GnuSparseHeader {
    pub offset: [u8; 12],
    pub numbytes: [u8; 12],
}

/// Representation of the entry found to represent extended sparse
/// information for a GNU sparse file, following a `typeflag` `S` header
/// whose `isextended` byte is set.
#[repr(C)]
#[allow(missing_docs)]
pub struct GnuExtSparseHeader {
    pub sparse: [GnuSparseHeader; 21],
    pub isextended: [u8; 1],
    pub padding: [u8; 7],
}

impl Format {
    /// Whether this dialect carries a `ustar`-family magic.
    pub fn has_magic(&self) -> bool {
        !matches!(self, Format::V7)
    }

    /// Whether long names are carried as GNU `L`/`K` pre-entries.
    pub fn uses_gnu_longnames(&self) -> bool {
        matches!(self, Format::OldGnu | Format::Gnu)
    }

    /// Whether long names and rich metadata are carried as PAX records.
    pub fn uses_pax(&self) -> bool {
        matches!(self, Format::Pax)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Format::V7 => "v7",
            Format::Ustar => "ustar",
            Format::OldGnu => "oldgnu",
            Format::Gnu => "gnu",
            Format::Pax => "pax",
        };
        f.write_str(name)
    }
}

impl Header {
    /// Creates a new blank header in the given dialect, ready to be
    /// filled in.
    pub fn new(format: Format) -> Header {
        match format {
            Format::V7 => Header::new_old(),
            Format::Ustar | Format::Pax => Header::new_ustar(),
            Format::OldGnu | Format::Gnu => Header::new_gnu(),
        }
    }

    /// Creates a new blank GNU header.
    ///
    /// The GNU style header is the default for this library and allows
    /// various extensions such as long path names, long link names, and
    /// setting the atime/ctime metadata attributes of files.
    pub fn new_gnu() -> Header {
        let mut header = Header { bytes: [0; 512] };
        {
            let gnu = header.cast_mut::<GnuHeader>();
            gnu.magic = *b"ustar ";
            gnu.version = *b" \0";
        }
        header
    }

    /// Creates a new blank ustar header.
    ///
    /// The ustar header format is an extension of the V7 format which
    /// enables slightly longer filenames (through the `prefix` field)
    /// and is also the base layout of the PAX dialect.
    pub fn new_ustar() -> Header {
        let mut header = Header { bytes: [0; 512] };
        {
            let ustar = header.cast_mut::<UstarHeader>();
            ustar.magic = *b"ustar\0";
            ustar.version = *b"00";
        }
        header
    }

    /// Creates a new blank V7 header.
    ///
    /// The old V7 format has no magic and supports only names up to 99
    /// bytes with no extensions.
    pub fn new_old() -> Header {
        Header { bytes: [0; 512] }
    }

    fn cast<T>(&self) -> &T {
        debug_assert_eq!(mem::size_of::<T>(), 512);
        unsafe { &*(self.bytes.as_ptr() as *const T) }
    }

    fn cast_mut<T>(&mut self) -> &mut T {
        debug_assert_eq!(mem::size_of::<T>(), 512);
        unsafe { &mut *(self.bytes.as_mut_ptr() as *mut T) }
    }

    /// View this header in its V7 layout.
    ///
    /// The V7 fields are a common subset of every dialect, so this view
    /// is always available.
    pub fn as_old(&self) -> &OldHeader {
        self.cast()
    }

    /// Same as `as_old`, but the mutable version.
    pub fn as_old_mut(&mut self) -> &mut OldHeader {
        self.cast_mut()
    }

    /// View this header in its ustar layout, if the magic declares it.
    pub fn as_ustar(&self) -> Option<&UstarHeader> {
        if self.is_ustar() {
            Some(self.cast())
        } else {
            None
        }
    }

    /// Same as `as_ustar`, but the mutable version.
    pub fn as_ustar_mut(&mut self) -> Option<&mut UstarHeader> {
        if self.is_ustar() {
            Some(self.cast_mut())
        } else {
            None
        }
    }

    /// View this header in its GNU layout, if the magic declares it.
    pub fn as_gnu(&self) -> Option<&GnuHeader> {
        if self.is_gnu() {
            Some(self.cast())
        } else {
            None
        }
    }

    /// Same as `as_gnu`, but the mutable version.
    pub fn as_gnu_mut(&mut self) -> Option<&mut GnuHeader> {
        if self.is_gnu() {
            Some(self.cast_mut())
        } else {
            None
        }
    }

    fn is_ustar(&self) -> bool {
        let u = self.cast::<UstarHeader>();
        u.magic == *b"ustar\0" && u.version == *b"00"
    }

    fn is_gnu(&self) -> bool {
        let u = self.cast::<UstarHeader>();
        u.magic == *b"ustar " && u.version[0] == b' '
    }

    /// Reports the dialect this header's magic/version pair declares.
    pub fn format(&self) -> Format {
        if self.is_gnu() {
            Format::Gnu
        } else if self.is_ustar() {
            Format::Ustar
        } else {
            Format::V7
        }
    }

    /// Returns a view into this header as a byte array.
    pub fn as_bytes(&self) -> &[u8; 512] {
        &self.bytes
    }

    /// Returns a view into this header as a mutable byte array.
    pub fn as_mut_bytes(&mut self) -> &mut [u8; 512] {
        &mut self.bytes
    }

    /// Whether every byte of this header is zero, i.e. it is (half of)
    /// an end-of-archive marker rather than a member header.
    pub fn is_zero_block(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// Blanket sets the metadata in this header from the metadata
    /// argument provided.
    pub fn set_metadata(&mut self, meta: &fs::Metadata) {
        self.fill_from(meta, HeaderMode::Complete);
    }

    /// Sets only the metadata relevant to the given [`HeaderMode`].
    pub fn set_metadata_in_mode(&mut self, meta: &fs::Metadata, mode: HeaderMode) {
        self.fill_from(meta, mode);
    }

    /// Returns the size of entry's data this header represents.
    ///
    /// This is the number of payload bytes that follow this header in
    /// the archive. For sparse members it is the physical (stored) size;
    /// the logical size lives in the GNU `realsize` field or the PAX
    /// `GNU.sparse.realsize` record.
    pub fn entry_size(&self) -> io::Result<u64> {
        numeric::decode(&self.as_old().size)
            .map_err(|_| io_err_fields(self, "numeric field did not have octal or base-256 digits", "size"))
    }

    /// Returns the file size this header represents, which for sparse
    /// entries is the represented (logical) size.
    pub fn size(&self) -> io::Result<u64> {
        if self.entry_type().is_gnu_sparse() {
            if let Some(gnu) = self.as_gnu() {
                return gnu.real_size();
            }
        }
        self.entry_size()
    }

    /// Encodes the `size` argument into the size field of this header.
    pub fn set_size(&mut self, size: u64) {
        numeric::encode(&mut self.as_old_mut().size, size);
    }

    /// Returns the raw path name stored in this header.
    ///
    /// May fail if the name is not valid unicode on a non-unix platform.
    /// Note that this function will convert any `\` characters to
    /// directory separators.
    pub fn path(&self) -> io::Result<Cow<'_, Path>> {
        bytes2path(self.path_bytes())
    }

    /// Returns the pathname stored in this header as a byte array.
    ///
    /// This function is guaranteed to succeed. The prefix field of ustar
    /// headers is joined in front of the name with a `/`.
    pub fn path_bytes(&self) -> Cow<'_, [u8]> {
        if let Some(ustar) = self.as_ustar() {
            if ustar.prefix[0] != 0 {
                let mut bytes = Vec::new();
                bytes.extend_from_slice(truncate(&ustar.prefix));
                bytes.push(b'/');
                bytes.extend_from_slice(truncate(&ustar.name));
                return Cow::Owned(deslash_owned(bytes));
            }
        }
        deslash(truncate(&self.as_old().name))
    }

    /// Sets the path name for this header, encoding it in the
    /// appropriate format.
    ///
    /// Fails with a name-too-long error if the path does not fit the
    /// header's dialect; the caller then falls back to a GNU long-name
    /// member or a PAX record.
    pub fn set_path<P: AsRef<Path>>(&mut self, p: P) -> io::Result<()> {
        self._set_path(p.as_ref())
    }

    fn _set_path(&mut self, path: &Path) -> io::Result<()> {
        let bytes = path2bytes(path)?;
        let namelen = self.as_old().name.len();
        if bytes.len() <= namelen {
            return copy_into(&mut self.as_old_mut().name, bytes, true);
        }
        // Only ustar has a prefix field to split into; for GNU those
        // bytes hold timestamps and sparse slots.
        if self.as_ustar().is_none() {
            return Err(other("path is too long to insert into archive header"));
        }
        let (prefix, name) = split_ustar_name(bytes)
            .ok_or_else(|| other("path cannot be split to be inserted into archive"))?;
        {
            let ustar = self.cast_mut::<UstarHeader>();
            copy_into(&mut ustar.name, name, true)?;
            copy_into(&mut ustar.prefix, prefix, true)?;
        }
        Ok(())
    }

    /// Returns the link name stored in this header, if any is found.
    pub fn link_name(&self) -> io::Result<Option<Cow<'_, Path>>> {
        match self.link_name_bytes() {
            Some(bytes) => bytes2path(bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the link name stored in this header as a byte array, if
    /// any.
    pub fn link_name_bytes(&self) -> Option<Cow<'_, [u8]>> {
        let old = self.as_old();
        if old.linkname[0] == 0 {
            None
        } else {
            Some(deslash(truncate(&old.linkname)))
        }
    }

    /// Sets the link name for this header.
    ///
    /// May fail if the name is over 100 bytes.
    pub fn set_link_name<P: AsRef<Path>>(&mut self, p: P) -> io::Result<()> {
        let bytes = path2bytes(p.as_ref())?;
        copy_into(&mut self.as_old_mut().linkname, bytes, true)
    }

    /// Returns the mode bits for this file.
    pub fn mode(&self) -> io::Result<u32> {
        numeric::decode(&self.as_old().mode)
            .map(|u| u as u32)
            .map_err(|_| io_err_fields(self, "numeric field did not have octal or base-256 digits", "mode"))
    }

    /// Encodes the `mode` provided into this header.
    pub fn set_mode(&mut self, mode: u32) {
        numeric::encode(&mut self.as_old_mut().mode, (mode & 0o7777) as u64);
    }

    /// Returns the value of the owner's user ID field.
    pub fn uid(&self) -> io::Result<u64> {
        numeric::decode(&self.as_old().uid)
            .map_err(|_| io_err_fields(self, "numeric field did not have octal or base-256 digits", "uid"))
    }

    /// Encodes the `uid` provided into this header.
    pub fn set_uid(&mut self, uid: u64) {
        numeric::encode(&mut self.as_old_mut().uid, uid);
    }

    /// Returns the value of the group's user ID field.
    pub fn gid(&self) -> io::Result<u64> {
        numeric::decode(&self.as_old().gid)
            .map_err(|_| io_err_fields(self, "numeric field did not have octal or base-256 digits", "gid"))
    }

    /// Encodes the `gid` provided into this header.
    pub fn set_gid(&mut self, gid: u64) {
        numeric::encode(&mut self.as_old_mut().gid, gid);
    }

    /// Returns the last modification time in Unix time format.
    pub fn mtime(&self) -> io::Result<u64> {
        numeric::decode(&self.as_old().mtime)
            .map_err(|_| io_err_fields(self, "numeric field did not have octal or base-256 digits", "mtime"))
    }

    /// Encodes the `mtime` provided into this header.
    ///
    /// Note that this time is typically a number of seconds passed since
    /// January 1, 1970.
    pub fn set_mtime(&mut self, mtime: u64) {
        numeric::encode(&mut self.as_old_mut().mtime, mtime);
    }

    /// Return the user name of the owner of this file, if present and if
    /// valid utf8.
    pub fn username(&self) -> Result<Option<&str>, str::Utf8Error> {
        match self.username_bytes() {
            Some(bytes) => str::from_utf8(bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the user name of the owner of this file, if present.
    pub fn username_bytes(&self) -> Option<&[u8]> {
        if self.is_ustar() || self.is_gnu() {
            Some(truncate(&self.cast::<UstarHeader>().uname))
        } else {
            None
        }
    }

    /// Sets the username inside this header.
    ///
    /// May return an error if the name provided is too long, or if the
    /// header dialect has no field to store it.
    pub fn set_username(&mut self, name: &str) -> io::Result<()> {
        if !self.is_ustar() && !self.is_gnu() {
            return Err(other("header format has no username field"));
        }
        copy_into(&mut self.cast_mut::<UstarHeader>().uname, name.as_bytes(), false)
    }

    /// Return the group name of the owner of this file, if present and
    /// if valid utf8.
    pub fn groupname(&self) -> Result<Option<&str>, str::Utf8Error> {
        match self.groupname_bytes() {
            Some(bytes) => str::from_utf8(bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the group name of the owner of this file, if present.
    pub fn groupname_bytes(&self) -> Option<&[u8]> {
        if self.is_ustar() || self.is_gnu() {
            Some(truncate(&self.cast::<UstarHeader>().gname))
        } else {
            None
        }
    }

    /// Sets the group name inside this header.
    ///
    /// May return an error if the name provided is too long, or if the
    /// header dialect has no field to store it.
    pub fn set_groupname(&mut self, name: &str) -> io::Result<()> {
        if !self.is_ustar() && !self.is_gnu() {
            return Err(other("header format has no groupname field"));
        }
        copy_into(&mut self.cast_mut::<UstarHeader>().gname, name.as_bytes(), false)
    }

    /// Returns the device major number, if present.
    ///
    /// `Ok(None)` is returned for dialects without the field.
    pub fn device_major(&self) -> io::Result<Option<u32>> {
        if !self.is_ustar() && !self.is_gnu() {
            return Ok(None);
        }
        let field = &self.cast::<UstarHeader>().dev_major;
        if field[0] == 0 {
            // Writers leave the field blank for non-device members.
            return Ok(Some(0));
        }
        numeric::decode(field)
            .map(|u| Some(u as u32))
            .map_err(|_| io_err_fields(self, "numeric field did not have octal or base-256 digits", "device_major"))
    }

    /// Encodes the value `major` into the dev_major field of this
    /// header.
    pub fn set_device_major(&mut self, major: u32) -> io::Result<()> {
        if !self.is_ustar() && !self.is_gnu() {
            return Err(other("header format has no device_major field"));
        }
        numeric::encode(&mut self.cast_mut::<UstarHeader>().dev_major, major as u64);
        Ok(())
    }

    /// Returns the device minor number, if present.
    ///
    /// `Ok(None)` is returned for dialects without the field.
    pub fn device_minor(&self) -> io::Result<Option<u32>> {
        if !self.is_ustar() && !self.is_gnu() {
            return Ok(None);
        }
        let field = &self.cast::<UstarHeader>().dev_minor;
        if field[0] == 0 {
            return Ok(Some(0));
        }
        numeric::decode(field)
            .map(|u| Some(u as u32))
            .map_err(|_| io_err_fields(self, "numeric field did not have octal or base-256 digits", "device_minor"))
    }

    /// Encodes the value `minor` into the dev_minor field of this
    /// header.
    pub fn set_device_minor(&mut self, minor: u32) -> io::Result<()> {
        if !self.is_ustar() && !self.is_gnu() {
            return Err(other("header format has no device_minor field"));
        }
        numeric::encode(&mut self.cast_mut::<UstarHeader>().dev_minor, minor as u64);
        Ok(())
    }

    /// Returns the type of file described by this header.
    pub fn entry_type(&self) -> EntryType {
        EntryType::new(self.as_old().linkflag[0])
    }

    /// Sets the type of file that will be described by this header.
    pub fn set_entry_type(&mut self, ty: EntryType) {
        self.as_old_mut().linkflag = [ty.as_byte()];
    }

    /// Returns the checksum field of this header.
    ///
    /// May return an error if the field is corrupted.
    pub fn cksum(&self) -> io::Result<u32> {
        numeric::decode(&self.as_old().cksum)
            .map(|u| u as u32)
            .map_err(|_| io_err_fields(self, "numeric field did not have octal or base-256 digits", "cksum"))
    }

    /// Sets the checksum field of this header based on the current
    /// fields in this header.
    pub fn set_cksum(&mut self) {
        let sum = self.calculate_cksum();
        let ck = &mut self.as_old_mut().cksum;
        // Stored as six octal digits, NUL, space.
        let mut v = sum;
        for slot in ck[..6].iter_mut().rev() {
            *slot = b'0' + (v & 7) as u8;
            v >>= 3;
        }
        ck[6] = 0;
        ck[7] = b' ';
    }

    /// Whether the stored checksum matches a recomputation over the
    /// header bytes.
    pub fn cksum_valid(&self) -> bool {
        match self.cksum() {
            Ok(stored) => self.calculate_cksum() == stored,
            Err(_) => false,
        }
    }

    fn calculate_cksum(&self) -> u32 {
        // The checksum field itself is summed as eight ASCII spaces.
        self.bytes[..148]
            .iter()
            .chain(&self.bytes[156..])
            .fold(0, |a, b| a + (*b as u32))
            + 8 * 32
    }

    #[cfg(unix)]
    fn fill_from(&mut self, meta: &fs::Metadata, mode: HeaderMode) {
        self.set_size(if meta.is_dir() || meta.file_type().is_symlink() {
            0
        } else {
            meta.len()
        });
        match mode {
            HeaderMode::Complete => {
                self.set_mtime(meta.mtime() as u64);
                self.set_uid(meta.uid() as u64);
                self.set_gid(meta.gid() as u64);
                self.set_mode(meta.mode());
            }
            HeaderMode::Deterministic => {
                self.set_mtime(0);
                self.set_uid(0);
                self.set_gid(0);
                let fs_mode = if meta.is_dir() || (0o100 & meta.mode() == 0o100) {
                    0o755
                } else {
                    0o644
                };
                self.set_mode(fs_mode);
            }
        }

        let ft = meta.file_type();
        self.set_entry_type(if ft.is_file() {
            EntryType::file()
        } else if ft.is_dir() {
            EntryType::dir()
        } else if ft.is_symlink() {
            EntryType::symlink()
        } else if ft.is_char_device() {
            EntryType::character_special()
        } else if ft.is_block_device() {
            EntryType::block_special()
        } else if ft.is_fifo() {
            EntryType::fifo()
        } else {
            EntryType::new(b' ')
        });
    }

    #[cfg(not(unix))]
    fn fill_from(&mut self, meta: &fs::Metadata, mode: HeaderMode) {
        self.set_size(if meta.is_dir() { 0 } else { meta.len() });
        match mode {
            HeaderMode::Complete => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                self.set_mtime(mtime);
            }
            HeaderMode::Deterministic => self.set_mtime(0),
        }
        self.set_uid(0);
        self.set_gid(0);
        self.set_mode(if meta.is_dir() { 0o755 } else { 0o644 });

        let ft = meta.file_type();
        self.set_entry_type(if ft.is_dir() {
            EntryType::dir()
        } else if ft.is_symlink() {
            EntryType::symlink()
        } else {
            EntryType::file()
        });
    }
}

impl Clone for Header {
    fn clone(&self) -> Header {
        Header { bytes: self.bytes }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Header")
            .field("path", &String::from_utf8_lossy(&self.path_bytes()))
            .field("format", &self.format())
            .field("entry_type", &self.entry_type())
            .finish()
    }
}

impl GnuHeader {
    /// Returns the last access time, if the field holds one.
    pub fn atime(&self) -> io::Result<u64> {
        numeric::decode(&self.atime)
    }

    /// Returns the creation time, if the field holds one.
    pub fn ctime(&self) -> io::Result<u64> {
        numeric::decode(&self.ctime)
    }

    /// Returns the "real size" of the file this header represents.
    ///
    /// This is applicable for sparse files where the returned size here
    /// is the logical size of the file, whereas the `size` field
    /// describes how much data is stored in the archive.
    pub fn real_size(&self) -> io::Result<u64> {
        numeric::decode(&self.realsize)
    }

    /// Indicates whether this header will be followed by additional
    /// sparse-header records.
    pub fn is_extended(&self) -> bool {
        self.isextended[0] == 1
    }
}

impl GnuSparseHeader {
    /// Returns true if block is empty.
    pub fn is_empty(&self) -> bool {
        self.offset[0] == 0 || self.numbytes[0] == 0
    }

    /// Offset of the block from the start of the file.
    pub fn offset(&self) -> io::Result<u64> {
        numeric::decode(&self.offset)
    }

    /// Length of the block.
    pub fn length(&self) -> io::Result<u64> {
        numeric::decode(&self.numbytes)
    }

    /// Fills the slot from an `(offset, numbytes)` region pair.
    pub fn set(&mut self, offset: u64, numbytes: u64) {
        numeric::encode(&mut self.offset, offset);
        numeric::encode(&mut self.numbytes, numbytes);
    }
}

impl GnuExtSparseHeader {
    /// Crates a new zero'd out sparse header entry.
    pub fn new() -> GnuExtSparseHeader {
        unsafe { mem::zeroed() }
    }

    /// Returns a view into this header as a byte array.
    pub fn as_bytes(&self) -> &[u8; 512] {
        debug_assert_eq!(mem::size_of_val(self), 512);
        unsafe { &*(self as *const _ as *const [u8; 512]) }
    }

    /// Returns a view into this header as a mutable byte array.
    pub fn as_mut_bytes(&mut self) -> &mut [u8; 512] {
        debug_assert_eq!(mem::size_of_val(self), 512);
        unsafe { &mut *(self as *mut _ as *mut [u8; 512]) }
    }

    /// Returns whether another sparse header record follows this one.
    pub fn is_extended(&self) -> bool {
        self.isextended[0] == 1
    }
}

impl Default for GnuExtSparseHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits an over-100-byte path at a `/` such that the prefix fits 155
/// bytes and the remainder fits 100.
fn split_ustar_name(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let max_prefix = std::cmp::min(bytes.len(), 156);
    let pos = bytes[..max_prefix]
        .iter()
        .rposition(|&b| b == b'/' || b == b'\\')?;
    // An empty name is legal: directory names keep their trailing slash
    // through the prefix join.
    let (prefix, name) = (&bytes[..pos], &bytes[pos + 1..]);
    if prefix.is_empty() || prefix.len() > 155 || name.len() > 100 {
        return None;
    }
    Some((prefix, name))
}

fn io_err_fields(h: &Header, desc: &str, field: &str) -> io::Error {
    other(&format!(
        "{} when getting {} for {}",
        desc,
        field,
        String::from_utf8_lossy(&h.path_bytes())
    ))
}

fn deslash(bytes: &[u8]) -> Cow<'_, [u8]> {
    if !bytes.contains(&b'\\') {
        Cow::Borrowed(bytes)
    } else {
        Cow::Owned(deslash_owned(bytes.to_vec()))
    }
}

fn deslash_owned(mut bytes: Vec<u8>) -> Vec<u8> {
    for b in bytes.iter_mut() {
        if *b == b'\\' {
            *b = b'/';
        }
    }
    bytes
}

fn truncate(slice: &[u8]) -> &[u8] {
    match slice.iter().position(|i| *i == 0) {
        Some(i) => &slice[..i],
        None => slice,
    }
}

/// Copies `bytes` into the `slot` provided, returning an error if the
/// `bytes` array is too long or if it contains any nul bytes.
///
/// Also provides the option to map '\' characters to '/' characters for
/// the names of paths in archives. The `tar` utility doesn't seem to
/// like windows backslashes when unpacking on Unix.
fn copy_into(slot: &mut [u8], bytes: &[u8], map_slashes: bool) -> io::Result<()> {
    if bytes.len() > slot.len() {
        Err(other("provided value is too long"))
    } else if bytes.iter().any(|b| *b == 0) {
        Err(other("provided value contains a nul byte"))
    } else {
        for slot in slot.iter_mut() {
            *slot = 0;
        }
        for (slot, val) in slot.iter_mut().zip(bytes) {
            if map_slashes && *val == b'\\' {
                *slot = b'/';
            } else {
                *slot = *val;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_512_bytes() {
        assert_eq!(mem::size_of::<OldHeader>(), 512);
        assert_eq!(mem::size_of::<UstarHeader>(), 512);
        assert_eq!(mem::size_of::<GnuHeader>(), 512);
        assert_eq!(mem::size_of::<GnuExtSparseHeader>(), 512);
    }

    #[test]
    fn cksum_discipline() {
        let mut h = Header::new_ustar();
        h.set_path("foo").unwrap();
        h.set_size(4);
        h.set_mode(0o644);
        h.set_cksum();
        assert!(h.cksum_valid());
        // Field layout: six octal digits, NUL, space.
        let ck = &h.as_old().cksum;
        assert_eq!(ck[6], 0);
        assert_eq!(ck[7], b' ');

        h.set_size(5);
        assert!(!h.cksum_valid());
        h.set_cksum();
        assert!(h.cksum_valid());
    }

    #[test]
    fn prefix_split_boundaries() {
        // 100-byte name fits the name field outright.
        let name100 = "a".repeat(100);
        let mut h = Header::new_ustar();
        h.set_path(&name100).unwrap();
        assert_eq!(h.path_bytes().len(), 100);
        assert_eq!(h.as_ustar().unwrap().prefix[0], 0);

        // 155-byte prefix + '/' + 100-byte name is the extreme split.
        let name = format!("{}/{}", "p".repeat(155), "n".repeat(100));
        let mut h = Header::new_ustar();
        h.set_path(&name).unwrap();
        assert_eq!(&*h.path_bytes(), name.as_bytes());

        // 156-byte prefix cannot be represented.
        let name = format!("{}/{}", "p".repeat(156), "n".repeat(100));
        let mut h = Header::new_ustar();
        assert!(h.set_path(&name).is_err());
    }

    #[test]
    fn gnu_header_has_no_prefix() {
        let long = format!("{}/{}", "d".repeat(60), "f".repeat(60));
        let mut h = Header::new_gnu();
        assert!(h.set_path(&long).is_err());
        let mut h = Header::new_ustar();
        h.set_path(&long).unwrap();
        assert_eq!(&*h.path_bytes(), long.as_bytes());
    }

    #[test]
    fn size_uses_base256_when_needed() {
        let mut h = Header::new_gnu();
        h.set_size(8_589_934_592);
        assert_ne!(h.as_old().size[0] & 0x80, 0);
        assert_eq!(h.entry_size().unwrap(), 8_589_934_592);

        h.set_size(8_589_934_591);
        assert_eq!(h.as_old().size[0] & 0x80, 0);
        assert_eq!(h.entry_size().unwrap(), 8_589_934_591);
    }
}
