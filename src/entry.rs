use std::borrow::Cow;
use std::cmp;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::marker;
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;

use crate::archive::ArchiveInner;
use crate::error::TarError;
use crate::header::Header;
use crate::other;
use crate::pax::PaxOverrides;
use crate::sparse::{SparseMap, SparseReader};
use crate::{bytes2path, Archive};

/// What to do when extraction runs into a file that already exists.
///
/// This is a decision table over (does the file exist?, how do the
/// mtimes compare?), evaluated per regular-file entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum OverwriteMode {
    /// Replace existing files (the default).
    #[default]
    Overwrite,
    /// Refuse to replace existing files, reporting each refusal.
    KeepOld,
    /// Replace only files older than the archived copy.
    KeepNewer,
    /// Silently leave existing files in place.
    SkipOld,
    /// Remove each existing file before writing its replacement.
    UnlinkFirst,
}

/// Extraction policy applied while materializing entries.
#[derive(Clone, Debug)]
pub struct UnpackConfig {
    /// Restore full permissions (including setuid/setgid) rather than
    /// the permission bits masked to 0o777.
    pub preserve_permissions: bool,
    /// Restore file modification times.
    pub preserve_mtime: bool,
    /// Attempt to restore ownership (normally only effective as root).
    pub preserve_ownership: bool,
    /// Restore extended attributes carried in PAX records.
    pub unpack_xattrs: bool,
    /// What to do about files that already exist.
    pub overwrite: OverwriteMode,
}

impl Default for UnpackConfig {
    fn default() -> UnpackConfig {
        UnpackConfig {
            preserve_permissions: false,
            preserve_mtime: true,
            preserve_ownership: false,
            unpack_xattrs: false,
            overwrite: OverwriteMode::Overwrite,
        }
    }
}

/// A read-only view into an entry of an archive.
///
/// This structure is a window into a portion of a borrowed archive which
/// can be inspected. It acts as a file handle by implementing the Read
/// trait. An entry cannot be rewritten once inserted into an archive.
pub struct Entry<'a, R: 'a + Read> {
    fields: EntryFields<'a>,
    _ignored: marker::PhantomData<&'a Archive<R>>,
}

// private implementation detail of `Entry`, but concrete (no type
// parameters) and also all-public to be constructed from other modules.
pub struct EntryFields<'a> {
    pub header: Header,
    pub size: u64,
    pub data: io::Take<&'a ArchiveInner<dyn Read + 'a>>,
    pub long_pathname: Option<Vec<u8>>,
    pub long_linkname: Option<Vec<u8>>,
    pub pax: Option<PaxOverrides>,
    pub sparse: Option<SparseMap>,
}

impl<'a, R: Read> Entry<'a, R> {
    /// Returns the path name for this entry.
    ///
    /// This method may fail if the pathname is not valid unicode and
    /// this is called on a non-unix platform.
    ///
    /// It is recommended to use this method instead of inspecting the
    /// `header` directly to ensure that long names and PAX path records
    /// are honored.
    pub fn path(&self) -> io::Result<Cow<'_, Path>> {
        self.fields.path()
    }

    /// Returns the raw bytes listed for this entry, with long-name
    /// members and PAX `path` records taken into account.
    pub fn path_bytes(&self) -> Cow<'_, [u8]> {
        self.fields.path_bytes()
    }

    /// Returns the link name for this entry, if any is found.
    pub fn link_name(&self) -> io::Result<Option<Cow<'_, Path>>> {
        self.fields.link_name()
    }

    /// Returns the link name for this entry, in bytes, if listed.
    pub fn link_name_bytes(&self) -> Option<Cow<'_, [u8]>> {
        self.fields.link_name_bytes()
    }

    /// Returns access to the header of this entry in the archive.
    pub fn header(&self) -> &Header {
        &self.fields.header
    }

    /// The logical size of the file this entry describes.
    ///
    /// For sparse members this is the represented length, not the number
    /// of data bytes stored in the archive; PAX `size` records override
    /// the header field.
    pub fn size(&self) -> u64 {
        self.fields.logical_size()
    }

    /// The number of payload bytes stored in the archive for this entry.
    pub fn stored_size(&self) -> u64 {
        self.fields.size
    }

    /// The modification time in seconds since the epoch, honoring PAX
    /// overrides.
    pub fn mtime(&self) -> u64 {
        self.fields.mtime().0
    }

    /// The owner uid, honoring PAX overrides.
    pub fn uid(&self) -> u64 {
        self.fields.uid()
    }

    /// The owner gid, honoring PAX overrides.
    pub fn gid(&self) -> u64 {
        self.fields.gid()
    }

    /// The owner user name, honoring PAX overrides.
    pub fn username(&self) -> Option<String> {
        self.fields.username()
    }

    /// The owner group name, honoring PAX overrides.
    pub fn groupname(&self) -> Option<String> {
        self.fields.groupname()
    }

    /// The sparse region map, when this member was stored sparsely.
    pub fn sparse_map(&self) -> Option<&SparseMap> {
        self.fields.sparse.as_ref()
    }

    /// The PAX attribute overrides accumulated for this entry, if any.
    pub fn pax_overrides(&self) -> Option<&PaxOverrides> {
        self.fields.pax.as_ref()
    }

    /// Writes this file to the specified location.
    pub fn unpack<P: AsRef<Path>>(&mut self, dst: P) -> io::Result<()> {
        self.fields
            .unpack(dst.as_ref(), None, &UnpackConfig::default())
    }

    /// Extracts this file under the specified path, avoiding security
    /// issues.
    ///
    /// This function will write the entire contents of this file into
    /// the location obtained by appending the path of this file in the
    /// archive to `dst`, creating any intermediate directories if
    /// needed. This function carefully avoids writing outside of `dst`:
    /// if the file has a '..' in its path, this function will skip it
    /// and return false.
    pub fn unpack_in<P: AsRef<Path>>(&mut self, dst: P) -> io::Result<bool> {
        self.fields.unpack_in(dst.as_ref(), &UnpackConfig::default())
    }

    /// Like `unpack_in`, with explicit extraction policy.
    pub fn unpack_in_with<P: AsRef<Path>>(
        &mut self,
        dst: P,
        config: &UnpackConfig,
    ) -> io::Result<bool> {
        self.fields.unpack_in(dst.as_ref(), config)
    }

    /// Copies this entry's logical contents to `dst`, expanding sparse
    /// holes to zeros.
    pub fn write_logical_to<W: Write>(&mut self, dst: &mut W) -> io::Result<u64> {
        self.fields.write_logical_to(dst)
    }
}

impl<'a, R: Read> Read for Entry<'a, R> {
    fn read(&mut self, into: &mut [u8]) -> io::Result<usize> {
        self.fields.read(into)
    }
}

impl<'a> EntryFields<'a> {
    pub fn from<R: Read>(entry: Entry<R>) -> EntryFields {
        entry.fields
    }

    pub fn into_entry<R: Read>(self) -> Entry<'a, R> {
        Entry {
            fields: self,
            _ignored: marker::PhantomData,
        }
    }

    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        // Preallocate some data but don't let ourselves get too crazy now.
        let cap = cmp::min(self.size, 128 * 1024);
        let mut v = Vec::with_capacity(cap as usize);
        self.read_to_end(&mut v).map(|_| v)
    }

    pub fn path(&self) -> io::Result<Cow<'_, Path>> {
        bytes2path(self.path_bytes())
    }

    pub fn path_bytes(&self) -> Cow<'_, [u8]> {
        if let Some(pax) = &self.pax {
            // A sparse member's real name travels in GNU.sparse.name;
            // the header (and the path record) may hold a mangled one.
            if let Some(name) = &pax.sparse_name {
                return Cow::Borrowed(name);
            }
            if let Some(path) = &pax.path {
                return Cow::Borrowed(path);
            }
        }
        match &self.long_pathname {
            Some(bytes) => Cow::Borrowed(bytes),
            None => self.header.path_bytes(),
        }
    }

    pub fn link_name(&self) -> io::Result<Option<Cow<'_, Path>>> {
        match self.link_name_bytes() {
            Some(bytes) => bytes2path(bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn link_name_bytes(&self) -> Option<Cow<'_, [u8]>> {
        if let Some(pax) = &self.pax {
            if let Some(link) = &pax.linkpath {
                return Some(Cow::Borrowed(link));
            }
        }
        match &self.long_linkname {
            Some(bytes) => Some(Cow::Borrowed(bytes)),
            None => self.header.link_name_bytes(),
        }
    }

    pub fn logical_size(&self) -> u64 {
        if let Some(map) = &self.sparse {
            return map.logical_size();
        }
        if let Some(pax) = &self.pax {
            if let Some(size) = pax.size {
                return size;
            }
        }
        self.header.size().unwrap_or(self.size)
    }

    pub fn mtime(&self) -> (u64, u32) {
        if let Some(pax) = &self.pax {
            if let Some(mtime) = pax.mtime {
                return mtime;
            }
        }
        (self.header.mtime().unwrap_or(0), 0)
    }

    pub fn uid(&self) -> u64 {
        self.pax
            .as_ref()
            .and_then(|p| p.uid)
            .or_else(|| self.header.uid().ok())
            .unwrap_or(0)
    }

    pub fn gid(&self) -> u64 {
        self.pax
            .as_ref()
            .and_then(|p| p.gid)
            .or_else(|| self.header.gid().ok())
            .unwrap_or(0)
    }

    pub fn username(&self) -> Option<String> {
        if let Some(pax) = &self.pax {
            if let Some(name) = &pax.uname {
                return Some(name.clone());
            }
        }
        self.header
            .username()
            .ok()
            .flatten()
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
    }

    pub fn groupname(&self) -> Option<String> {
        if let Some(pax) = &self.pax {
            if let Some(name) = &pax.gname {
                return Some(name.clone());
            }
        }
        self.header
            .groupname()
            .ok()
            .flatten()
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
    }

    pub fn write_logical_to<W: Write>(&mut self, dst: &mut W) -> io::Result<u64> {
        match self.sparse.take() {
            Some(map) => {
                let mut reader = SparseReader::new(&mut self.data, &map);
                let n = io::copy(&mut reader, dst)?;
                self.sparse = Some(map);
                Ok(n)
            }
            None => io::copy(&mut self.data, dst),
        }
    }

    pub fn unpack_in(&mut self, dst: &Path, config: &UnpackConfig) -> io::Result<bool> {
        let path = self.path().map_err(|e| {
            TarError::new("invalid path in entry header", e)
        })?;
        let file_dst = match join_entry_path(dst, &path) {
            Some(p) => p,
            None => return Ok(false),
        };

        // Skip cases where only slashes or '.' parts were seen, because
        // this is effectively an empty filename.
        if *dst == *file_dst {
            return Ok(true);
        }
        drop(path);

        if let Some(parent) = file_dst.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                TarError::new(&format!("failed to create `{}`", parent.display()), e)
            })?;
        }
        self.unpack(&file_dst, Some(dst), config).map_err(|e| {
            TarError::new(&format!("failed to unpack `{}`", file_dst.display()), e)
        })?;

        Ok(true)
    }

    /// Materializes this entry at `dst`. `root`, when given, bounds link
    /// targets so nothing escapes the extraction directory.
    pub fn unpack(
        &mut self,
        dst: &Path,
        root: Option<&Path>,
        config: &UnpackConfig,
    ) -> io::Result<()> {
        let kind = self.header.entry_type();

        if kind.is_dir() {
            // If the directory already exists just let it slide
            let prev = fs::metadata(dst);
            if !prev.map(|m| m.is_dir()).unwrap_or(false) {
                fs::create_dir_all(dst)?;
            }
            if config.preserve_permissions {
                if let Ok(mode) = self.header.mode() {
                    set_perms(dst, mode, true)?;
                }
            }
            if config.preserve_ownership {
                self.restore_ownership(dst);
            }
            return Ok(());
        } else if kind.is_symlink() {
            let src = match self.link_name()? {
                Some(name) => name.into_owned(),
                None => return Err(other("symlink listed but no link name found")),
            };
            if src.as_os_str().is_empty() {
                return Err(other("symlink destination is empty"));
            }
            check_link_target(dst, &src, root)?;
            let _ = fs::remove_file(dst);
            symlink(&src, dst)?;
            if config.preserve_ownership {
                self.restore_ownership(dst);
            }
            if config.preserve_mtime {
                let (secs, nanos) = self.mtime();
                let mtime = FileTime::from_unix_time(secs as i64, nanos);
                if let Err(e) = filetime::set_symlink_file_times(dst, mtime, mtime) {
                    log::warn!("failed to set mtime for `{}`: {}", dst.display(), e);
                }
            }
            return Ok(());
        } else if kind.is_hard_link() {
            let src = match self.link_name()? {
                Some(name) => name.into_owned(),
                None => return Err(other("hard link listed but no link name found")),
            };
            // Hard links are resolved against the extraction root, not
            // against the entry's own directory.
            let target = match root {
                Some(root) => match join_entry_path(root, &src) {
                    Some(p) => p,
                    None => {
                        return Err(other("hard link destination points outside destination"))
                    }
                },
                None => src.clone(),
            };
            let _ = fs::remove_file(dst);
            if let Err(e) = fs::hard_link(&target, dst) {
                // Cross-device or unsupported: degrade to a copy.
                log::warn!(
                    "cannot hard link `{}` to `{}` ({}); copying contents instead",
                    dst.display(),
                    target.display(),
                    e
                );
                fs::copy(&target, dst).map(|_| ()).map_err(|e| {
                    TarError::new(
                        &format!("failed to copy `{}` to `{}`", target.display(), dst.display()),
                        e,
                    )
                })?;
            }
            return Ok(());
        } else if kind.is_character_special() || kind.is_block_special() {
            return self.unpack_device(dst, kind.is_block_special());
        } else if kind.is_fifo() {
            return self.unpack_fifo(dst, config);
        } else if kind.is_pax_global_extensions()
            || kind.is_pax_local_extensions()
            || kind.is_gnu_longname()
            || kind.is_gnu_longlink()
            || kind.is_gnu_volume_label()
            || kind.is_gnu_multivolume()
        {
            return Ok(());
        }

        // Note the lack of `else` clause above. According to the FreeBSD
        // documentation:
        //
        // > A POSIX-compliant implementation must treat any unrecognized
        // > typeflag value as a regular file.
        //
        // As a result if we don't recognize the kind we just write out
        // the file as we would normally. GNU sparse members land here
        // too.

        match self.check_overwrite(dst, config)? {
            OverwriteDecision::Skip => return Ok(()),
            OverwriteDecision::Refuse => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{}: file exists", dst.display()),
                ))
            }
            OverwriteDecision::Write => {}
        }

        let mut f = fs::File::create(dst).map_err(|e| {
            TarError::new(
                &format!(
                    "failed to unpack `{}` into `{}`",
                    String::from_utf8_lossy(&self.path_bytes()),
                    dst.display()
                ),
                e,
            )
        })?;
        let sparse = self.sparse.clone();
        match sparse {
            Some(map) => map.extract(&mut self.data, &mut f)?,
            None => {
                let expected = self.data.limit();
                if io::copy(&mut self.data, &mut f)? != expected {
                    return Err(other("failed to write entire file"));
                }
            }
        }

        if config.preserve_mtime {
            let (secs, nanos) = self.mtime();
            let mtime = FileTime::from_unix_time(secs as i64, nanos);
            filetime::set_file_times(dst, mtime, mtime).map_err(|e| {
                TarError::new(&format!("failed to set mtime for `{}`", dst.display()), e)
            })?;
        }
        if let Ok(mode) = self.header.mode() {
            set_perms(dst, mode, config.preserve_permissions).map_err(|e| {
                TarError::new(
                    &format!(
                        "failed to set permissions to {:o} for `{}`",
                        mode,
                        dst.display()
                    ),
                    e,
                )
            })?;
        }
        if config.preserve_ownership {
            self.restore_ownership(dst);
        }
        if config.unpack_xattrs {
            self.restore_xattrs(dst);
        }
        Ok(())
    }

    fn check_overwrite(
        &self,
        dst: &Path,
        config: &UnpackConfig,
    ) -> io::Result<OverwriteDecision> {
        let existing = match fs::symlink_metadata(dst) {
            Ok(meta) => meta,
            Err(_) => return Ok(OverwriteDecision::Write),
        };
        match config.overwrite {
            OverwriteMode::Overwrite | OverwriteMode::UnlinkFirst => {
                let _ = fs::remove_file(dst);
                Ok(OverwriteDecision::Write)
            }
            OverwriteMode::KeepOld => Ok(OverwriteDecision::Refuse),
            OverwriteMode::SkipOld => Ok(OverwriteDecision::Skip),
            OverwriteMode::KeepNewer => {
                let disk_mtime = FileTime::from_last_modification_time(&existing);
                if disk_mtime.unix_seconds() >= self.mtime().0 as i64 {
                    Ok(OverwriteDecision::Skip)
                } else {
                    let _ = fs::remove_file(dst);
                    Ok(OverwriteDecision::Write)
                }
            }
        }
    }

    #[cfg(unix)]
    fn unpack_device(&mut self, dst: &Path, block: bool) -> io::Result<()> {
        let major = self.header.device_major()?.unwrap_or(0);
        let minor = self.header.device_minor()?.unwrap_or(0);
        let _ = fs::remove_file(dst);
        let mode = self.header.mode().unwrap_or(0o644);
        if let Err(e) = crate::fsutil::mknod(dst, block, major, minor, mode) {
            log::warn!("cannot create device `{}`: {}", dst.display(), e);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn unpack_device(&mut self, dst: &Path, _block: bool) -> io::Result<()> {
        log::warn!(
            "cannot create device `{}`: unsupported on this platform",
            dst.display()
        );
        Ok(())
    }

    #[cfg(unix)]
    fn unpack_fifo(&mut self, dst: &Path, config: &UnpackConfig) -> io::Result<()> {
        let _ = fs::remove_file(dst);
        let mode = self.header.mode().unwrap_or(0o644);
        crate::fsutil::mkfifo(dst, mode)?;
        if config.preserve_ownership {
            self.restore_ownership(dst);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn unpack_fifo(&mut self, dst: &Path, _config: &UnpackConfig) -> io::Result<()> {
        log::warn!(
            "cannot create fifo `{}`: unsupported on this platform",
            dst.display()
        );
        Ok(())
    }

    fn restore_ownership(&self, dst: &Path) {
        #[cfg(unix)]
        {
            let uid = self.uid();
            let gid = self.gid();
            if let Err(e) = crate::fsutil::lchown(dst, uid as u32, gid as u32) {
                log::warn!(
                    "failed to set ownership {}:{} for `{}`: {}",
                    uid,
                    gid,
                    dst.display(),
                    e
                );
            }
        }
        #[cfg(not(unix))]
        let _ = dst;
    }

    #[cfg(all(unix, feature = "xattr"))]
    fn restore_xattrs(&self, dst: &Path) {
        use std::ffi::OsStr;
        use std::os::unix::prelude::*;

        let pax = match &self.pax {
            Some(pax) => pax,
            None => return,
        };
        for (name, value) in &pax.xattrs {
            let key = OsStr::from_bytes(name);
            if let Err(e) = xattr::set(dst, key, value) {
                log::warn!(
                    "failed to set extended attribute {:?} on `{}`: {}",
                    key,
                    dst.display(),
                    e
                );
            }
        }
    }

    #[cfg(not(all(unix, feature = "xattr")))]
    fn restore_xattrs(&self, _dst: &Path) {}
}

enum OverwriteDecision {
    Write,
    Skip,
    Refuse,
}

impl<'a> Read for EntryFields<'a> {
    fn read(&mut self, into: &mut [u8]) -> io::Result<usize> {
        self.data.read(into)
    }
}

/// Appends the components of `path` onto `dst`, dropping root and
/// current-directory components. `None` means the path tried to escape
/// via `..`.
///
/// Notes regarding bsdtar 2.8.3 / libarchive 2.8.3:
/// * Leading '/'s are trimmed. For example, `///test` is treated as
///   `test`.
/// * If the filename contains '..', then the file is skipped when
///   extracting the tarball.
/// * '//' within a filename is effectively skipped. An error is logged,
///   but otherwise the effect is as if any two or more adjacent '/'s
///   within the filename were consolidated into one '/'.
pub(crate) fn join_entry_path(dst: &Path, path: &Path) -> Option<PathBuf> {
    let mut file_dst = dst.to_path_buf();
    for part in path.components() {
        match part {
            // Leading '/' characters, root paths, and '.' components
            // are just ignored and treated as "empty components"
            Component::Prefix(..) | Component::RootDir | Component::CurDir => continue,

            // If any part of the filename is '..', then skip over
            // unpacking the file to prevent directory traversal
            // security issues.  See, e.g.: CVE-2001-1267,
            // CVE-2002-0399, CVE-2005-1918, CVE-2007-4131
            Component::ParentDir => return None,

            Component::Normal(part) => file_dst.push(part),
        }
    }
    Some(file_dst)
}

/// Validates a symlink target: relative traversal may not climb out of
/// the extraction root.
fn check_link_target(dst: &Path, src: &Path, root: Option<&Path>) -> io::Result<()> {
    let mut target = dst.to_path_buf();
    target.pop();
    for part in src.components() {
        match part {
            Component::Prefix(..) | Component::RootDir | Component::CurDir => continue,
            Component::ParentDir => {
                if !target.pop() {
                    return Err(other(
                        "symlink destination points outside unpack destination",
                    ));
                }
                if let Some(root) = root {
                    if !target.starts_with(root) {
                        return Err(other(
                            "symlink destination points outside unpack destination",
                        ));
                    }
                }
            }
            Component::Normal(part) => target.push(part),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(src, dst)
}

#[cfg(unix)]
fn symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(all(not(unix), not(windows)))]
fn symlink(_src: &Path, _dst: &Path) -> io::Result<()> {
    Err(other("symlinks unsupported on this platform"))
}

#[cfg(unix)]
fn set_perms(dst: &Path, mode: u32, preserve: bool) -> io::Result<()> {
    use std::os::unix::prelude::*;

    let mode = if preserve { mode } else { mode & 0o777 };
    let perm = fs::Permissions::from_mode(mode);
    fs::set_permissions(dst, perm)
}

#[cfg(not(unix))]
fn set_perms(dst: &Path, mode: u32, _preserve: bool) -> io::Result<()> {
    let mut perm = fs::metadata(dst)?.permissions();
    perm.set_readonly(mode & 0o200 != 0o200);
    fs::set_permissions(dst, perm)
}
