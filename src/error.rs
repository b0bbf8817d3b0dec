use std::error;
use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A contextual error attached to an underlying I/O failure.
///
/// The codec layer reports plain `io::Error`s; paths and operation
/// context are layered on as the error propagates upward so that the
/// message names the offending file.
#[derive(Debug)]
pub struct TarError {
    desc: String,
    io: io::Error,
}

impl TarError {
    pub fn new(desc: &str, err: io::Error) -> TarError {
        TarError {
            desc: desc.to_string(),
            io: err,
        }
    }
}

impl error::Error for TarError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.io)
    }
}

impl fmt::Display for TarError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.desc, self.io)
    }
}

impl From<TarError> for io::Error {
    fn from(t: TarError) -> io::Error {
        io::Error::new(t.io.kind(), t)
    }
}

/// The error surface of the operation engine.
///
/// Fatal conditions abort the running operation and map to exit status 2.
/// Checksum mismatches, attribute-restore failures and other recoverable
/// conditions are reported through `log::warn!` and counted in the
/// operation's [`Outcome`](crate::Outcome) instead of appearing here.
#[derive(Debug, Error)]
pub enum OpError {
    /// No archive path was supplied for an operation that requires one.
    #[error("no archive file specified")]
    MissingArchive,

    /// An underlying read, write, open or stat failed.
    #[error("{}: {source}", path.display())]
    Io {
        /// The file the failure was observed on.
        path: PathBuf,
        /// The underlying failure.
        #[source]
        source: io::Error,
    },

    /// The archive stream is truncated or contains impossible fields.
    #[error("archive is damaged: {0}")]
    InvalidArchive(String),

    /// The compressor program is unavailable, exited nonzero, or the
    /// requested operation cannot work through a compressor at all.
    #[error("compression failure: {0}")]
    UnsupportedCompression(String),

    /// A member name cannot be represented in the selected format.
    #[error("{}: file name is too long for this format", path.display())]
    NameTooLong {
        /// The offending member path.
        path: PathBuf,
    },

    /// An existing file was left in place under `keep-old-files`.
    #[error("{}: file exists; not overwritten", path.display())]
    OverwriteRefused {
        /// The file that already existed.
        path: PathBuf,
    },

    /// The operation was cancelled between entries.
    #[error("operation cancelled")]
    Cancelled,
}

impl OpError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> OpError {
        OpError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<io::Error> for OpError {
    fn from(err: io::Error) -> OpError {
        OpError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}
