//! Block-aligned archive I/O and the external-compressor filter.
//!
//! Archives are read and written as 512-byte blocks over either a plain
//! file or a compressor subprocess (`gzip`, `bzip2`, `xz`, `zstd`). The
//! subprocess runs concurrently with the archiver: the writer pipes the
//! tar stream into the child's stdin while a background thread drains
//! its stdout into the output file, so neither side can deadlock on a
//! full pipe buffer.

use std::ffi::OsStr;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

use crate::other;

/// Selection of the compression filter applied around the tar stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Compression {
    /// No filter; the archive file holds the raw tar stream.
    None,
    /// Filter through `gzip`.
    Gzip,
    /// Filter through `bzip2`.
    Bzip2,
    /// Filter through `xz`.
    Xz,
    /// Filter through `zstd`.
    Zstd,
    /// Decide by archive file extension, falling back to magic-byte
    /// sniffing when reading.
    #[default]
    Auto,
}

impl Compression {
    /// Maps an archive path's extension onto a filter.
    pub fn from_extension(path: &Path) -> Compression {
        let ext = path
            .extension()
            .and_then(OsStr::to_str)
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "gz" | "tgz" | "taz" => Compression::Gzip,
            "bz2" | "tbz" | "tbz2" | "tz2" => Compression::Bzip2,
            "xz" | "txz" => Compression::Xz,
            "zst" | "tzst" => Compression::Zstd,
            _ => Compression::None,
        }
    }

    /// Identifies a filter from the first bytes of a file.
    pub fn from_magic(head: &[u8]) -> Compression {
        if head.starts_with(&[0x1f, 0x8b]) {
            Compression::Gzip
        } else if head.starts_with(b"BZh") {
            Compression::Bzip2
        } else if head.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
            Compression::Xz
        } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    /// The external program implementing this filter, if any.
    pub fn program(&self) -> Option<&'static str> {
        match self {
            Compression::None | Compression::Auto => None,
            Compression::Gzip => Some("gzip"),
            Compression::Bzip2 => Some("bzip2"),
            Compression::Xz => Some("xz"),
            Compression::Zstd => Some("zstd"),
        }
    }

    /// Resolves `Auto` against a path for writing.
    pub fn resolve_for_write(&self, path: &Path) -> Compression {
        match self {
            Compression::Auto => Compression::from_extension(path),
            other => *other,
        }
    }

    /// Resolves `Auto` against a path and its leading bytes for reading.
    pub fn resolve_for_read(&self, path: &Path, head: &[u8]) -> Compression {
        match self {
            Compression::Auto => match Compression::from_extension(path) {
                Compression::None => Compression::from_magic(head),
                by_ext => by_ext,
            },
            other => *other,
        }
    }
}

/// The read side of an archive: either the file itself or the stdout of
/// a decompressor child.
pub enum ArchiveSource {
    /// Uncompressed archive file.
    File(fs::File),
    /// Decompressor subprocess; we consume its stdout.
    Filtered {
        /// The running decompressor.
        child: Child,
        /// Its piped stdout.
        stdout: std::process::ChildStdout,
    },
}

impl ArchiveSource {
    /// Opens `path` for reading, resolving and applying the filter.
    pub fn open(path: &Path, compression: Compression) -> io::Result<ArchiveSource> {
        let mut file = fs::File::open(path)?;
        let compression = match compression {
            Compression::Auto => {
                let mut head = [0u8; 6];
                let n = read_head(&mut file, &mut head)?;
                use std::io::Seek;
                file.seek(io::SeekFrom::Start(0))?;
                compression.resolve_for_read(path, &head[..n])
            }
            c => c,
        };
        let program = match compression.program() {
            None => return Ok(ArchiveSource::File(file)),
            Some(p) => p,
        };
        let mut child = Command::new(program)
            .arg("-d")
            .arg("-c")
            .stdin(Stdio::from(file))
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| other("decompressor did not expose stdout"))?;
        Ok(ArchiveSource::Filtered { child, stdout })
    }

    /// Consumes the source, reaping the child if one is running.
    ///
    /// Remaining decompressor output is discarded; a nonzero exit is an
    /// error.
    pub fn finish(self) -> io::Result<()> {
        match self {
            ArchiveSource::File(_) => Ok(()),
            ArchiveSource::Filtered { mut child, mut stdout } => {
                io::copy(&mut stdout, &mut io::sink())?;
                drop(stdout);
                let status = child.wait()?;
                if status.success() {
                    Ok(())
                } else {
                    Err(other(&format!("decompressor exited with {}", status)))
                }
            }
        }
    }
}

impl Read for ArchiveSource {
    fn read(&mut self, into: &mut [u8]) -> io::Result<usize> {
        match self {
            ArchiveSource::File(f) => f.read(into),
            ArchiveSource::Filtered { stdout, .. } => stdout.read(into),
        }
    }
}

/// The write side of an archive: either the file itself or the stdin of
/// a compressor child whose stdout a background thread copies into the
/// file.
pub enum ArchiveSink {
    /// Uncompressed archive file.
    File(fs::File),
    /// Compressor subprocess; we feed its stdin.
    Filtered {
        /// The running compressor.
        child: Child,
        /// Its piped stdin, present until `finish`.
        stdin: Option<std::process::ChildStdin>,
        /// The stdout drain thread, joined by `finish`.
        drain: Option<thread::JoinHandle<io::Result<u64>>>,
    },
}

impl ArchiveSink {
    /// Creates `path`, resolving and applying the filter.
    pub fn create(path: &Path, compression: Compression) -> io::Result<ArchiveSink> {
        let file = fs::File::create(path)?;
        let compression = compression.resolve_for_write(path);
        ArchiveSink::over_file(file, compression)
    }

    /// Wraps an already-open output file.
    pub fn over_file(mut file: fs::File, compression: Compression) -> io::Result<ArchiveSink> {
        let program = match compression.program() {
            None => return Ok(ArchiveSink::File(file)),
            Some(p) => p,
        };
        let mut child = Command::new(program)
            .arg("-c")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| other("compressor did not expose stdin"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| other("compressor did not expose stdout"))?;
        let drain = thread::spawn(move || io::copy(&mut stdout, &mut file));
        Ok(ArchiveSink::Filtered {
            child,
            stdin: Some(stdin),
            drain: Some(drain),
        })
    }

    /// Closes the stream: flushes, closes the compressor's stdin, joins
    /// the drain thread and checks the child's exit status.
    pub fn finish(self) -> io::Result<()> {
        match self {
            ArchiveSink::File(mut f) => f.flush(),
            ArchiveSink::Filtered {
                mut child,
                mut stdin,
                mut drain,
            } => {
                if let Some(mut s) = stdin.take() {
                    s.flush()?;
                }
                // stdin dropped: the child sees EOF and finishes its
                // output, which the drain thread is still consuming.
                if let Some(handle) = drain.take() {
                    match handle.join() {
                        Ok(result) => {
                            result?;
                        }
                        Err(_) => return Err(other("compressor drain thread panicked")),
                    }
                }
                let status = child.wait()?;
                if status.success() {
                    Ok(())
                } else {
                    Err(other(&format!("compressor exited with {}", status)))
                }
            }
        }
    }
}

impl Write for ArchiveSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ArchiveSink::File(f) => f.write(buf),
            ArchiveSink::Filtered { stdin, .. } => match stdin {
                Some(s) => s.write(buf),
                None => Err(other("archive sink already finished")),
            },
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ArchiveSink::File(f) => f.flush(),
            ArchiveSink::Filtered { stdin, .. } => match stdin {
                Some(s) => s.flush(),
                None => Ok(()),
            },
        }
    }
}

fn read_head(file: &mut fs::File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn spawn_error(program: &str, e: io::Error) -> io::Error {
    io::Error::new(
        e.kind(),
        format!("cannot run {}: {}", program, e),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn extension_mapping() {
        let c = |p: &str| Compression::from_extension(&PathBuf::from(p));
        assert_eq!(c("a.tar"), Compression::None);
        assert_eq!(c("a.tar.gz"), Compression::Gzip);
        assert_eq!(c("a.tgz"), Compression::Gzip);
        assert_eq!(c("a.tar.bz2"), Compression::Bzip2);
        assert_eq!(c("a.tbz"), Compression::Bzip2);
        assert_eq!(c("a.tar.xz"), Compression::Xz);
        assert_eq!(c("a.txz"), Compression::Xz);
        assert_eq!(c("a.tar.zst"), Compression::Zstd);
        assert_eq!(c("a.tzst"), Compression::Zstd);
    }

    #[test]
    fn magic_mapping() {
        assert_eq!(Compression::from_magic(&[0x1f, 0x8b, 0x08]), Compression::Gzip);
        assert_eq!(Compression::from_magic(b"BZh9"), Compression::Bzip2);
        assert_eq!(
            Compression::from_magic(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]),
            Compression::Xz
        );
        assert_eq!(
            Compression::from_magic(&[0x28, 0xb5, 0x2f, 0xfd]),
            Compression::Zstd
        );
        assert_eq!(Compression::from_magic(b"ustar"), Compression::None);
    }
}
