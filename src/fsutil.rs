//! Thin adapters over the host filesystem interfaces the engine needs
//! beyond `std::fs`: ownership, device nodes, FIFOs and the
//! uid/gid-to-name lookups.

#![cfg_attr(not(unix), allow(dead_code))]

use std::collections::HashMap;
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::ffi::CString;

/// Per-operation cache of uid/gid name lookups.
///
/// Owned by the operation engine for the lifetime of one operation; no
/// process-wide state.
#[derive(Default)]
pub struct UserDb {
    users: HashMap<u32, Option<String>>,
    groups: HashMap<u32, Option<String>>,
}

impl UserDb {
    pub fn new() -> UserDb {
        UserDb::default()
    }

    /// The login name for `uid`, if the user database knows one.
    pub fn username(&mut self, uid: u32) -> Option<String> {
        self.users
            .entry(uid)
            .or_insert_with(|| uname_for_uid(uid))
            .clone()
    }

    /// The group name for `gid`, if the group database knows one.
    pub fn groupname(&mut self, gid: u32) -> Option<String> {
        self.groups
            .entry(gid)
            .or_insert_with(|| gname_for_gid(gid))
            .clone()
    }
}

#[cfg(unix)]
fn uname_for_uid(uid: u32) -> Option<String> {
    use std::ffi::CStr;
    use std::mem;
    use std::ptr;

    let mut pwd: libc::passwd = unsafe { mem::zeroed() };
    let mut buf = vec![0i8; 2048];
    let mut result: *mut libc::passwd = ptr::null_mut();
    loop {
        let rc = unsafe {
            libc::getpwuid_r(
                uid as libc::uid_t,
                &mut pwd,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            let len = buf.len() * 2;
            buf.resize(len, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return name.to_str().ok().map(str::to_string);
    }
}

#[cfg(not(unix))]
fn uname_for_uid(_uid: u32) -> Option<String> {
    None
}

#[cfg(unix)]
fn gname_for_gid(gid: u32) -> Option<String> {
    use std::ffi::CStr;
    use std::mem;
    use std::ptr;

    let mut grp: libc::group = unsafe { mem::zeroed() };
    let mut buf = vec![0i8; 2048];
    let mut result: *mut libc::group = ptr::null_mut();
    loop {
        let rc = unsafe {
            libc::getgrgid_r(
                gid as libc::gid_t,
                &mut grp,
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            let len = buf.len() * 2;
            buf.resize(len, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        let name = unsafe { CStr::from_ptr(grp.gr_name) };
        return name.to_str().ok().map(str::to_string);
    }
}

#[cfg(not(unix))]
fn gname_for_gid(_gid: u32) -> Option<String> {
    None
}

/// Changes ownership without following symlinks.
#[cfg(unix)]
pub fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let cpath = cstring(path)?;
    let rc = unsafe { libc::lchown(cpath.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Creates a character or block device node.
#[cfg(unix)]
pub fn mknod(path: &Path, block: bool, major: u32, minor: u32, mode: u32) -> io::Result<()> {
    let cpath = cstring(path)?;
    let kind = if block { libc::S_IFBLK } else { libc::S_IFCHR };
    let dev = libc::makedev(major, minor);
    let rc = unsafe { libc::mknod(cpath.as_ptr(), kind | mode as libc::mode_t, dev) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Creates a named pipe.
#[cfg(unix)]
pub fn mkfifo(path: &Path, mode: u32) -> io::Result<()> {
    let cpath = cstring(path)?;
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), mode as libc::mode_t) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// The device major/minor numbers of a special file.
#[cfg(unix)]
pub fn device_numbers(meta: &std::fs::Metadata) -> (u32, u32) {
    use std::os::unix::prelude::*;
    let rdev = meta.rdev();
    let (major, minor) = (libc::major(rdev), libc::minor(rdev));
    (major as u32, minor as u32)
}

/// Whether the process can expect ownership/device operations to work.
#[cfg(unix)]
pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn running_as_root() -> bool {
    false
}

#[cfg(unix)]
fn cstring(path: &Path) -> io::Result<CString> {
    use std::os::unix::prelude::*;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a nul byte"))
}
