//! A library for reading and writing GNU-tar-compatible archives
//!
//! This library provides the binary archive codec (the 512-byte header
//! record in its v7, ustar, oldgnu, gnu and pax dialects, PAX extended
//! records, GNU long names and sparse files) together with the archive
//! operation engine that composes the codec into the classic tar
//! workflows: create, list, extract, append, update, delete, diff and
//! concatenate. Great strides are taken to ensure that an archive is
//! never required to be fully resident in memory; all objects provide
//! largely a streaming interface to read bytes from.
//!
//! The codec layer (`Header`, `Archive`, `Builder`, `PaxExtensions`) can
//! be used on its own against any reader or writer. The operation engine
//! ([`ops`]) layers filesystem traversal, name policy, compression
//! filters and in-place archive editing on top of it.

#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

use std::borrow::Cow;
use std::io;
use std::path::Path;

pub use crate::archive::{Archive, Entries};
pub use crate::block::Compression;
pub use crate::builder::Builder;
pub use crate::entry::{Entry, OverwriteMode, UnpackConfig};
pub use crate::entry_type::EntryType;
pub use crate::error::OpError;
pub use crate::header::{
    Format, GnuExtSparseHeader, GnuHeader, GnuSparseHeader, Header, HeaderMode, OldHeader,
    UstarHeader,
};
pub use crate::ops::{Operation, Options, Outcome, Transform, Verbosity};
pub use crate::pax::{PaxBuilder, PaxExtension, PaxExtensions, PaxOverrides};
pub use crate::sparse::SparseMap;

mod archive;
mod block;
mod builder;
mod entry;
mod entry_type;
mod error;
mod fsutil;
mod header;
mod names;
mod numeric;
pub mod ops;
mod pax;
mod sparse;

/// 512-byte record size, the archive's unit of I/O.
pub const BLOCK_SIZE: u64 = 512;

fn bad_archive() -> io::Error {
    other("invalid tar archive")
}

fn other(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg)
}

#[cfg(unix)]
fn path2bytes(p: &Path) -> io::Result<&[u8]> {
    use std::os::unix::prelude::*;
    Ok(p.as_os_str().as_bytes())
}

#[cfg(not(unix))]
fn path2bytes(p: &Path) -> io::Result<&[u8]> {
    p.as_os_str()
        .to_str()
        .map(|s| s.as_bytes())
        .ok_or_else(|| other("path was not valid unicode"))
}

#[cfg(unix)]
fn bytes2path(bytes: Cow<[u8]>) -> io::Result<Cow<Path>> {
    use std::ffi::{OsStr, OsString};
    use std::os::unix::prelude::*;
    use std::path::PathBuf;

    Ok(match bytes {
        Cow::Borrowed(bytes) => Cow::Borrowed(Path::new(OsStr::from_bytes(bytes))),
        Cow::Owned(bytes) => Cow::Owned(PathBuf::from(OsString::from_vec(bytes))),
    })
}

#[cfg(not(unix))]
fn bytes2path(bytes: Cow<[u8]>) -> io::Result<Cow<Path>> {
    use std::path::PathBuf;
    use std::str;

    Ok(match bytes {
        Cow::Borrowed(bytes) => {
            let s = str::from_utf8(bytes).map_err(|_| other("path was not valid unicode"))?;
            Cow::Borrowed(Path::new(s))
        }
        Cow::Owned(bytes) => {
            let s =
                String::from_utf8(bytes).map_err(|_| other("path was not valid unicode"))?;
            Cow::Owned(PathBuf::from(s))
        }
    })
}
