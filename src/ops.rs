//! The archive operation engine.
//!
//! Composes the codec into the classic tar workflows: create, list,
//! extract, append, update, delete, diff and concatenate. Each
//! operation is a single streaming pass over the archive; `append`,
//! `update`, `delete` and `concatenate` additionally require a seekable,
//! uncompressed archive file.
//!
//! The engine is configured with an [`Options`] bundle and drives
//! everything through [`run`] (or [`run_with`] for a custom listing sink
//! and cancellation flag). Recoverable conditions are reported through
//! `log::warn!` and counted in the returned [`Outcome`]; the first fatal
//! condition aborts with an [`OpError`].

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Local, TimeZone};

use crate::block::{ArchiveSink, ArchiveSource, Compression};
use crate::builder::Builder;
use crate::entry::{join_entry_path, EntryFields, OverwriteMode, UnpackConfig};
use crate::error::OpError;
use crate::header::{Format, Header};
use crate::names;
pub use crate::names::Transform;
use crate::pax::PaxOverrides;
use crate::{fsutil, Archive, EntryType};

/// Which archive workflow to run.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Operation {
    /// Build a new archive from filesystem paths.
    Create,
    /// Print the member names (the default).
    #[default]
    List,
    /// Materialize members onto the filesystem.
    Extract,
    /// Add members to the end of an existing archive.
    Append,
    /// Add members that are new or newer than their archived copy.
    Update,
    /// Remove members matching the given patterns.
    Delete,
    /// Compare members against the filesystem.
    Diff,
    /// Splice other archives onto the end of this one.
    Concatenate,
}

/// How chatty the engine is on its listing sink.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum Verbosity {
    /// Nothing but errors.
    Quiet,
    /// Operation-dependent defaults (list prints names).
    #[default]
    Normal,
    /// Names everywhere; `ls -l`-style lines for list.
    Verbose,
    /// Long lines plus volume labels and other oddities.
    VeryVerbose,
}

/// The full configuration bundle of the operation engine.
#[derive(Clone, Debug)]
pub struct Options {
    /// The workflow to run.
    pub operation: Operation,
    /// The archive file; required by every operation.
    pub archive_path: Option<PathBuf>,
    /// Input paths (create/append/update), member names
    /// (list/extract/diff), patterns (delete) or source archives
    /// (concatenate).
    pub file_list: Vec<PathBuf>,
    /// Resolve filesystem paths relative to this directory.
    pub directory: Option<PathBuf>,
    /// Compression filter selection.
    pub compression: Compression,
    /// Dialect for created headers.
    pub format: Format,
    /// Listing verbosity.
    pub verbosity: Verbosity,
    /// Drop this many leading path components on extraction.
    pub strip_components: u32,
    /// Restore full permissions including setuid/setgid bits.
    pub preserve_permissions: bool,
    /// Follow symlinks when archiving.
    pub dereference: bool,
    /// Policy for extraction over existing files.
    pub overwrite_mode: OverwriteMode,
    /// Write extracted file contents to the listing sink instead of the
    /// filesystem.
    pub to_stdout: bool,
    /// Member-name patterns to exclude.
    pub exclude_patterns: Vec<String>,
    /// Read additional input paths from this file.
    pub files_from: Option<PathBuf>,
    /// Read additional exclude patterns from this file.
    pub exclude_from: Option<PathBuf>,
    /// `files_from`/`exclude_from` entries are NUL-terminated.
    pub null_terminated: bool,
    /// Keep leading `/` on member names.
    pub absolute_names: bool,
    /// Do not restore mtimes on extraction.
    pub touch: bool,
    /// Use numeric uid/gid everywhere, never names.
    pub numeric_owner: bool,
    /// Skip lone zero blocks; end of archive is end of file.
    pub ignore_zeros: bool,
    /// Detect holes and store regular files sparsely.
    pub sparse: bool,
    /// Pre-parsed member-name rewrite rules.
    pub transforms: Vec<Transform>,
    /// Record size in 512-byte blocks for created archives.
    pub blocking_factor: u32,
    /// Do not descend into directories on other filesystems.
    pub one_file_system: bool,
    /// Only archive files modified after this epoch-seconds threshold.
    pub newer_mtime: Option<i64>,
    /// Delete input files once archived.
    pub remove_files: bool,
    /// Re-read the finished archive and compare it to the filesystem.
    pub verify: bool,
    /// Emit a progress message every this many members.
    pub checkpoint: Option<u32>,
    /// Snapshot file for incremental creation.
    pub listed_incremental: Option<PathBuf>,
    /// Multivolume archives (recognized but unsupported).
    pub multi_volume: bool,
    /// Tape length for multivolume archives (unsupported).
    pub tape_length: Option<u64>,
    /// Carry extended attributes in PAX records.
    pub xattrs: bool,
    /// Carry POSIX ACLs (as xattrs).
    pub acls: bool,
    /// Carry SELinux contexts (as xattrs).
    pub selinux: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            operation: Operation::default(),
            archive_path: None,
            file_list: Vec::new(),
            directory: None,
            compression: Compression::Auto,
            format: Format::default(),
            verbosity: Verbosity::default(),
            strip_components: 0,
            preserve_permissions: false,
            dereference: false,
            overwrite_mode: OverwriteMode::default(),
            to_stdout: false,
            exclude_patterns: Vec::new(),
            files_from: None,
            exclude_from: None,
            null_terminated: false,
            absolute_names: false,
            touch: false,
            numeric_owner: false,
            ignore_zeros: false,
            sparse: false,
            transforms: Vec::new(),
            blocking_factor: 20,
            one_file_system: false,
            newer_mtime: None,
            remove_files: false,
            verify: false,
            checkpoint: None,
            listed_incremental: None,
            multi_volume: false,
            tape_length: None,
            xattrs: false,
            acls: false,
            selinux: false,
        }
    }
}

/// What a finished operation has to report.
#[derive(Clone, Copy, Debug, Default)]
pub struct Outcome {
    /// Differences found by `diff` (or `--verify`).
    pub differences: u64,
    /// Recoverable failures that were reported and skipped.
    pub warnings: u64,
    /// Members processed.
    pub members: u64,
}

impl Outcome {
    /// The conventional tar exit status: 0 clean, 1 for differences or
    /// partial failures. (Fatal errors surface as `Err` and map to 2.)
    pub fn exit_code(&self) -> i32 {
        if self.differences > 0 || self.warnings > 0 {
            1
        } else {
            0
        }
    }
}

/// Runs the configured operation, printing listings to stdout.
pub fn run(opts: &Options) -> Result<Outcome, OpError> {
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    run_with(opts, &mut lock, None)
}

/// Runs the configured operation against an explicit listing sink and
/// optional cancellation flag (checked between members).
pub fn run_with(
    opts: &Options,
    out: &mut dyn Write,
    cancel: Option<&AtomicBool>,
) -> Result<Outcome, OpError> {
    if opts.multi_volume || opts.tape_length.is_some() {
        return Err(OpError::UnsupportedCompression(
            "multivolume archives are not supported".into(),
        ));
    }
    let mut engine = Engine {
        opts,
        out,
        cancel,
        outcome: Outcome::default(),
        excludes: load_excludes(opts)?,
    };
    match opts.operation {
        Operation::Create => engine.create()?,
        Operation::List => engine.list()?,
        Operation::Extract => engine.extract()?,
        Operation::Append => engine.append(None)?,
        Operation::Update => engine.update()?,
        Operation::Delete => engine.delete()?,
        Operation::Diff => engine.diff()?,
        Operation::Concatenate => engine.concatenate()?,
    }
    Ok(engine.outcome)
}

struct Engine<'a> {
    opts: &'a Options,
    out: &'a mut dyn Write,
    cancel: Option<&'a AtomicBool>,
    outcome: Outcome,
    excludes: Vec<String>,
}

impl<'a> Engine<'a> {
    fn check_cancel(&self) -> Result<(), OpError> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(OpError::Cancelled),
            _ => Ok(()),
        }
    }

    fn archive_path(&self) -> Result<PathBuf, OpError> {
        self.opts
            .archive_path
            .clone()
            .ok_or(OpError::MissingArchive)
    }

    /// Filesystem paths are resolved against the `directory` option;
    /// absolute paths pass through.
    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.opts.directory {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn extraction_root(&self) -> PathBuf {
        self.opts
            .directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn input_paths(&self) -> Result<Vec<PathBuf>, OpError> {
        let mut inputs = self.opts.file_list.clone();
        if let Some(list) = &self.opts.files_from {
            for name in read_name_list(list, self.opts.null_terminated)
                .map_err(|e| OpError::io(list.clone(), e))?
            {
                inputs.push(PathBuf::from(name));
            }
        }
        Ok(inputs)
    }

    /// Whether a member name passes the exclude list and, when member
    /// arguments were given, matches one of them.
    fn selects(&self, name: &str) -> bool {
        if names::excluded(&self.excludes, name) {
            return false;
        }
        if self.opts.file_list.is_empty() {
            return true;
        }
        self.opts.file_list.iter().any(|wanted| {
            let wanted = wanted.to_string_lossy();
            name == wanted
                || name
                    .strip_prefix(wanted.as_ref())
                    .map_or(false, |rest| rest.starts_with('/'))
        })
    }

    // ----- create / append / update ------------------------------------

    fn create(&mut self) -> Result<(), OpError> {
        let archive_path = self.archive_path()?;
        let inputs = self.input_paths()?;
        if inputs.is_empty() {
            return Err(OpError::InvalidArchive(
                "cowardly refusing to create an empty archive".into(),
            ));
        }

        let sink = ArchiveSink::create(&archive_path, self.opts.compression)
            .map_err(|e| OpError::io(archive_path.clone(), e))?;
        let mut builder = self.configure_builder(Builder::new(sink));

        let mut ctx = WalkContext::new(self.opts)?;
        for input in &inputs {
            self.add_tree(&mut builder, &mut ctx, input)?;
        }

        builder.finish().map_err(|e| OpError::io(archive_path.clone(), e))?;
        let sink = builder
            .into_inner()
            .map_err(|e| OpError::io(archive_path.clone(), e))?;
        sink.finish()
            .map_err(|e| OpError::UnsupportedCompression(e.to_string()))?;

        ctx.finish(self)?;

        if self.opts.verify {
            self.verify_archive(&archive_path)?;
        }
        Ok(())
    }

    fn append(&mut self, update_map: Option<HashMap<String, u64>>) -> Result<(), OpError> {
        let archive_path = self.archive_path()?;
        self.require_uncompressed(&archive_path)?;
        let inputs = self.input_paths()?;

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&archive_path)
            .map_err(|e| OpError::io(archive_path.clone(), e))?;

        // Scan forward to the terminator; new members go right where the
        // first zero block sat.
        let append_offset = {
            let mut archive = Archive::new(&mut file);
            let mut entries = archive
                .entries()
                .map_err(|e| OpError::io(archive_path.clone(), e))?;
            for entry in entries.by_ref() {
                entry.map_err(|e| OpError::InvalidArchive(e.to_string()))?;
            }
            drop(entries);
            archive.position().saturating_sub(1024)
        };
        file.seek(SeekFrom::Start(append_offset))
            .map_err(|e| OpError::io(archive_path.clone(), e))?;

        let mut builder = self.configure_builder(Builder::new(CountingWriter::new(&mut file)));
        let mut ctx = WalkContext::new(self.opts)?;
        ctx.update_map = update_map;
        for input in &inputs {
            self.add_tree(&mut builder, &mut ctx, input)?;
        }
        builder.finish().map_err(|e| OpError::io(archive_path.clone(), e))?;
        let counter = builder
            .into_inner()
            .map_err(|e| OpError::io(archive_path.clone(), e))?;
        let new_len = append_offset + counter.written;
        drop(counter);
        file.set_len(new_len)
            .map_err(|e| OpError::io(archive_path.clone(), e))?;

        ctx.finish(self)?;
        Ok(())
    }

    fn update(&mut self) -> Result<(), OpError> {
        let archive_path = self.archive_path()?;
        self.require_uncompressed(&archive_path)?;

        // First pass: what does the archive already have, and how old is
        // it?
        let mut mtimes: HashMap<String, u64> = HashMap::new();
        {
            let file = fs::File::open(&archive_path)
                .map_err(|e| OpError::io(archive_path.clone(), e))?;
            let mut archive = Archive::new(file);
            archive.set_ignore_zeros(self.opts.ignore_zeros);
            let entries = archive
                .entries()
                .map_err(|e| OpError::io(archive_path.clone(), e))?;
            for entry in entries {
                let entry = entry.map_err(|e| OpError::InvalidArchive(e.to_string()))?;
                let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
                let name = name.trim_end_matches('/').to_string();
                let mtime = entry.mtime();
                mtimes
                    .entry(name)
                    .and_modify(|m| *m = (*m).max(mtime))
                    .or_insert(mtime);
            }
        }
        self.append(Some(mtimes))
    }

    fn configure_builder<W: Write>(&self, mut builder: Builder<W>) -> Builder<W> {
        builder.set_format(self.opts.format);
        builder.follow_symlinks(self.opts.dereference);
        builder.set_sparse(self.opts.sparse);
        builder.set_numeric_owner(self.opts.numeric_owner);
        builder.set_xattrs(self.opts.xattrs || self.opts.acls || self.opts.selinux);
        builder.set_blocking_factor(self.opts.blocking_factor);
        builder
    }

    /// Archives one input path, recursing into directories.
    fn add_tree<W: Write>(
        &mut self,
        builder: &mut Builder<W>,
        ctx: &mut WalkContext,
        input: &Path,
    ) -> Result<(), OpError> {
        let fs_path = self.resolve(input);
        let meta = stat_for(&fs_path, self.opts.dereference)
            .map_err(|e| OpError::io(fs_path.clone(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::prelude::*;
            ctx.root_dev = Some(meta.dev());
        }
        let name = input.to_string_lossy().into_owned();
        self.add_node(builder, ctx, &fs_path, &name, &meta)
    }

    fn add_node<W: Write>(
        &mut self,
        builder: &mut Builder<W>,
        ctx: &mut WalkContext,
        fs_path: &Path,
        name: &str,
        meta: &fs::Metadata,
    ) -> Result<(), OpError> {
        self.check_cancel()?;

        if names::excluded(&self.excludes, name) {
            return Ok(());
        }
        let is_dir = meta.is_dir();
        if !is_dir {
            if let Some(threshold) = self.opts.newer_mtime {
                if mtime_seconds(meta) <= threshold {
                    return Ok(());
                }
            }
        }

        // Name hygiene and rewrites happen on the archived name only;
        // the filesystem path stays as given.
        let mut archive_name = names::apply_transforms(name, &self.opts.transforms);
        if !self.opts.absolute_names {
            let relative = names::make_relative(&archive_name);
            if relative.len() != archive_name.len() && !ctx.warned_absolute {
                log::warn!("removing leading '/' from member names");
                ctx.warned_absolute = true;
            }
            archive_name = relative.to_string();
        }

        let skip_this = if is_dir {
            false
        } else if let Some(map) = &ctx.update_map {
            let recorded = map.get(archive_name.trim_end_matches('/'));
            recorded.map_or(false, |archived| mtime_seconds(meta).max(0) as u64 <= *archived)
        } else if let Some(snapshot) = &ctx.snapshot {
            snapshot
                .get(&archive_name)
                .map_or(false, |recorded| mtime_seconds(meta).max(0) as u64 <= *recorded)
        } else {
            false
        };

        if !skip_this && !archive_name.is_empty() {
            builder
                .append_path_with_name(fs_path, Path::new(&archive_name))
                .map_err(|e| OpError::io(fs_path.to_path_buf(), e))?;
            self.outcome.members += 1;
            ctx.record_member(&archive_name, meta);

            if self.opts.verbosity >= Verbosity::Verbose {
                let _ = writeln!(self.out, "{}", name);
            }
            if let Some(every) = self.opts.checkpoint {
                if every > 0 && self.outcome.members % every as u64 == 0 {
                    log::info!("checkpoint {}", self.outcome.members);
                }
            }
            if self.opts.remove_files && !is_dir {
                if let Err(e) = fs::remove_file(fs_path) {
                    log::warn!("cannot remove `{}`: {}", fs_path.display(), e);
                    self.outcome.warnings += 1;
                }
            }
        }

        if is_dir {
            #[cfg(unix)]
            if self.opts.one_file_system {
                use std::os::unix::prelude::*;
                if ctx.root_dev.map_or(false, |root| root != meta.dev()) {
                    log::warn!(
                        "`{}` is on a different filesystem; not dumped",
                        fs_path.display()
                    );
                    return Ok(());
                }
            }
            let mut children: Vec<_> = fs::read_dir(fs_path)
                .map_err(|e| OpError::io(fs_path.to_path_buf(), e))?
                .collect::<io::Result<_>>()
                .map_err(|e| OpError::io(fs_path.to_path_buf(), e))?;
            children.sort_by_key(|e| e.file_name());
            for child in children {
                let child_path = child.path();
                let child_meta = stat_for(&child_path, self.opts.dereference)
                    .map_err(|e| OpError::io(child_path.clone(), e))?;
                let child_name = format!(
                    "{}/{}",
                    name.trim_end_matches('/'),
                    child.file_name().to_string_lossy()
                );
                self.add_node(builder, ctx, &child_path, &child_name, &child_meta)?;
            }
            if self.opts.remove_files {
                ctx.removed_dirs.push(fs_path.to_path_buf());
            }
        }
        Ok(())
    }

    fn verify_archive(&mut self, archive_path: &Path) -> Result<(), OpError> {
        log::info!("verifying archive `{}`", archive_path.display());
        self.diff_against(archive_path)
    }

    // ----- list ---------------------------------------------------------

    fn list(&mut self) -> Result<(), OpError> {
        let archive_path = self.archive_path()?;
        let source = ArchiveSource::open(&archive_path, self.opts.compression)
            .map_err(|e| OpError::io(archive_path.clone(), e))?;
        let mut archive = Archive::new(source);
        archive.set_ignore_zeros(self.opts.ignore_zeros);

        {
            let entries = archive
                .entries()
                .map_err(|e| OpError::InvalidArchive(e.to_string()))?;
            for entry in entries {
                self.check_cancel()?;
                let entry = entry.map_err(|e| OpError::InvalidArchive(e.to_string()))?;
                let fields = EntryFields::from(entry);

                if fields.header.entry_type().is_gnu_volume_label() {
                    if self.opts.verbosity >= Verbosity::VeryVerbose {
                        let _ = writeln!(
                            self.out,
                            "V--------- {} Volume Header",
                            String::from_utf8_lossy(&fields.path_bytes())
                        );
                    }
                    continue;
                }

                let name = String::from_utf8_lossy(&fields.path_bytes()).into_owned();
                if !self.selects(&name) {
                    continue;
                }
                self.outcome.members += 1;
                if self.opts.verbosity >= Verbosity::Verbose {
                    let line = verbose_line(&fields, self.opts.numeric_owner);
                    let _ = writeln!(self.out, "{}", line);
                } else if self.opts.verbosity >= Verbosity::Normal {
                    let _ = writeln!(self.out, "{}", name);
                }
            }
        }
        archive
            .into_inner()
            .finish()
            .map_err(|e| OpError::UnsupportedCompression(e.to_string()))?;
        Ok(())
    }

    // ----- extract ------------------------------------------------------

    fn extract(&mut self) -> Result<(), OpError> {
        let archive_path = self.archive_path()?;
        let source = ArchiveSource::open(&archive_path, self.opts.compression)
            .map_err(|e| OpError::io(archive_path.clone(), e))?;
        let mut archive = Archive::new(source);
        archive.set_ignore_zeros(self.opts.ignore_zeros);

        let root = self.extraction_root();
        let config = UnpackConfig {
            preserve_permissions: self.opts.preserve_permissions,
            preserve_mtime: !self.opts.touch,
            preserve_ownership: self.opts.preserve_permissions && fsutil::running_as_root(),
            unpack_xattrs: self.opts.xattrs || self.opts.acls || self.opts.selinux,
            overwrite: self.opts.overwrite_mode,
        };
        let mut dir_times: Vec<(PathBuf, u64, u32)> = Vec::new();

        {
            let entries = archive
                .entries()
                .map_err(|e| OpError::InvalidArchive(e.to_string()))?;
            for entry in entries {
                self.check_cancel()?;
                let entry = entry.map_err(|e| OpError::InvalidArchive(e.to_string()))?;
                let mut fields = EntryFields::from(entry);

                let kind = fields.header.entry_type();
                if kind.is_gnu_volume_label() || kind.is_gnu_multivolume() {
                    continue;
                }

                let name = String::from_utf8_lossy(&fields.path_bytes()).into_owned();
                if !self.selects(&name) {
                    continue;
                }

                let stripped =
                    match names::strip_components(Path::new(&name), self.opts.strip_components) {
                        Some(p) => p,
                        None => continue,
                    };
                let renamed = names::apply_transforms(
                    &stripped.to_string_lossy(),
                    &self.opts.transforms,
                );
                if renamed.is_empty() {
                    continue;
                }

                if self.opts.verbosity >= Verbosity::Verbose {
                    let _ = writeln!(self.out, "{}", name);
                }

                if self.opts.to_stdout {
                    if kind.is_file() || kind.is_contiguous() || kind.is_gnu_sparse() {
                        fields
                            .write_logical_to(&mut self.out)
                            .map_err(|e| OpError::io(PathBuf::from(&name), e))?;
                    }
                    self.outcome.members += 1;
                    continue;
                }

                let dest = match join_entry_path(&root, Path::new(&renamed)) {
                    Some(p) if p != root => p,
                    _ => continue,
                };
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| OpError::io(parent.to_path_buf(), e))?;
                }

                match fields.unpack(&dest, Some(&root), &config) {
                    Ok(()) => {
                        self.outcome.members += 1;
                        if kind.is_dir() {
                            let (secs, nanos) = fields.mtime();
                            dir_times.push((dest, secs, nanos));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        log::warn!("{}", e);
                        self.outcome.warnings += 1;
                    }
                    Err(e) => return Err(OpError::io(dest, e)),
                }
            }
        }

        // Directory mtimes are restored last, deepest first, so that
        // populating a directory does not clobber its restored time.
        if !self.opts.touch {
            dir_times.sort_by(|a, b| b.0.cmp(&a.0));
            for (dir, secs, nanos) in dir_times {
                let t = filetime::FileTime::from_unix_time(secs as i64, nanos);
                if let Err(e) = filetime::set_file_times(&dir, t, t) {
                    log::warn!("failed to set mtime for `{}`: {}", dir.display(), e);
                    self.outcome.warnings += 1;
                }
            }
        }

        archive
            .into_inner()
            .finish()
            .map_err(|e| OpError::UnsupportedCompression(e.to_string()))?;
        Ok(())
    }

    // ----- diff ---------------------------------------------------------

    fn diff(&mut self) -> Result<(), OpError> {
        let archive_path = self.archive_path()?;
        self.diff_against(&archive_path)
    }

    fn diff_against(&mut self, archive_path: &Path) -> Result<(), OpError> {
        let source = ArchiveSource::open(archive_path, self.opts.compression)
            .map_err(|e| OpError::io(archive_path.to_path_buf(), e))?;
        let mut archive = Archive::new(source);
        archive.set_ignore_zeros(self.opts.ignore_zeros);

        {
            let entries = archive
                .entries()
                .map_err(|e| OpError::InvalidArchive(e.to_string()))?;
            for entry in entries {
                self.check_cancel()?;
                let entry = entry.map_err(|e| OpError::InvalidArchive(e.to_string()))?;
                let mut fields = EntryFields::from(entry);

                let kind = fields.header.entry_type();
                if kind.is_gnu_volume_label() || kind.is_gnu_multivolume() {
                    continue;
                }
                let name = String::from_utf8_lossy(&fields.path_bytes()).into_owned();
                if !self.selects(&name) {
                    continue;
                }
                self.outcome.members += 1;
                let relative = names::make_relative(name.trim_end_matches('/')).to_string();
                let fs_path = self.resolve(Path::new(&relative));
                self.diff_entry(&mut fields, &name, &fs_path)?;
            }
        }
        archive
            .into_inner()
            .finish()
            .map_err(|e| OpError::UnsupportedCompression(e.to_string()))?;
        Ok(())
    }

    fn diff_entry(
        &mut self,
        fields: &mut EntryFields,
        name: &str,
        fs_path: &Path,
    ) -> Result<(), OpError> {
        let kind = fields.header.entry_type();
        let meta = match fs::symlink_metadata(fs_path) {
            Ok(meta) => meta,
            Err(e) => {
                let _ = writeln!(self.out, "{}: {}", name, e);
                self.outcome.differences += 1;
                return Ok(());
            }
        };

        let ft = meta.file_type();
        let type_matches = if kind.is_dir() {
            ft.is_dir()
        } else if kind.is_symlink() {
            ft.is_symlink()
        } else if kind.is_fifo() {
            fifo_matches(&meta)
        } else if kind.is_character_special() || kind.is_block_special() {
            device_matches(&meta, kind.is_block_special())
        } else if kind.is_hard_link() {
            // A hard link compares like the file it names.
            !ft.is_dir()
        } else {
            ft.is_file()
        };
        if !type_matches {
            let _ = writeln!(self.out, "{}: File type differs", name);
            self.outcome.differences += 1;
            return Ok(());
        }

        if kind.is_symlink() {
            let archived = fields
                .link_name_bytes()
                .map(|b| b.into_owned())
                .unwrap_or_default();
            let on_disk = fs::read_link(fs_path)
                .ok()
                .map(|p| p.as_os_str().to_string_lossy().into_owned())
                .unwrap_or_default();
            if archived != on_disk.as_bytes() {
                let _ = writeln!(self.out, "{}: Symlink differs", name);
                self.outcome.differences += 1;
            }
            return Ok(());
        }

        // Mode is not meaningful on symlinks; everything else checks it.
        if let Ok(mode) = fields.header.mode() {
            if mode & 0o7777 != file_mode(&meta) & 0o7777 {
                let _ = writeln!(self.out, "{}: Mode differs", name);
                self.outcome.differences += 1;
            }
        }
        let (secs, _) = fields.mtime();
        if secs as i64 != mtime_seconds(&meta) {
            let _ = writeln!(self.out, "{}: Mod time differs", name);
            self.outcome.differences += 1;
        }

        if kind.is_file() || kind.is_contiguous() || kind.is_gnu_sparse() {
            let archived_size = fields.logical_size();
            if archived_size != meta.len() {
                let _ = writeln!(self.out, "{}: Size differs", name);
                self.outcome.differences += 1;
                return Ok(());
            }
            let file = fs::File::open(fs_path).map_err(|e| OpError::io(fs_path.to_path_buf(), e))?;
            let mut comparator = Comparator::new(file);
            fields
                .write_logical_to(&mut comparator)
                .map_err(|e| OpError::io(fs_path.to_path_buf(), e))?;
            if !comparator.matches() {
                let _ = writeln!(self.out, "{}: Contents differ", name);
                self.outcome.differences += 1;
            }
        }
        Ok(())
    }

    // ----- delete -------------------------------------------------------

    fn delete(&mut self) -> Result<(), OpError> {
        let archive_path = self.archive_path()?;
        self.require_uncompressed(&archive_path)?;
        let patterns: Vec<String> = self
            .opts
            .file_list
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        if patterns.is_empty() {
            return Ok(());
        }

        let mut src = fs::File::open(&archive_path)
            .map_err(|e| OpError::io(archive_path.clone(), e))?;
        let tmp_path = sibling_temp_path(&archive_path);
        let result = self.delete_into(&mut src, &tmp_path, &patterns);
        match result {
            Ok(()) => {
                fs::rename(&tmp_path, &archive_path)
                    .map_err(|e| OpError::io(archive_path.clone(), e))?;
                Ok(())
            }
            Err(e) => {
                // The original archive is untouched on any failure.
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn delete_into(
        &mut self,
        src: &mut fs::File,
        tmp_path: &Path,
        patterns: &[String],
    ) -> Result<(), OpError> {
        let mut dst = fs::File::create(tmp_path)
            .map_err(|e| OpError::io(tmp_path.to_path_buf(), e))?;
        let mut written: u64 = 0;

        // Pre-entries are buffered until their real member decides the
        // group's fate; `g` members pass through unconditionally.
        let mut pending: Vec<u8> = Vec::new();
        let mut pending_name: Option<String> = None;

        loop {
            self.check_cancel()?;
            let mut block = [0u8; 512];
            if !read_full_block(src, &mut block)
                .map_err(|e| OpError::InvalidArchive(e.to_string()))?
            {
                break;
            }
            let header = header_from_block(&block);
            if header.is_zero_block() {
                break;
            }
            let size = header
                .entry_size()
                .map_err(|e| OpError::InvalidArchive(e.to_string()))?;
            let data_blocks = crate::numeric::blocks_needed(size);
            let kind = header.entry_type();

            if kind.is_pax_global_extensions() {
                dst.write_all(&block)
                    .map_err(|e| OpError::io(tmp_path.to_path_buf(), e))?;
                written += 512 + copy_blocks(src, &mut dst, data_blocks)
                    .map_err(|e| OpError::io(tmp_path.to_path_buf(), e))?;
                continue;
            }

            if kind.is_gnu_longname() || kind.is_gnu_longlink() || kind.is_pax_local_extensions() {
                pending.extend_from_slice(&block);
                let payload = read_blocks_to_vec(src, data_blocks)
                    .map_err(|e| OpError::InvalidArchive(e.to_string()))?;
                if kind.is_gnu_longname() {
                    let name = payload[..size as usize].to_vec();
                    pending_name = Some(
                        String::from_utf8_lossy(trim_trailing_nuls(&name)).into_owned(),
                    );
                } else if kind.is_pax_local_extensions() {
                    if let Ok(overrides) = PaxOverrides::parse(&payload[..size as usize]) {
                        if let Some(path) = overrides.path {
                            pending_name = Some(String::from_utf8_lossy(&path).into_owned());
                        }
                    }
                }
                pending.extend_from_slice(&payload);
                continue;
            }

            // A real member: keep or drop it together with its group.
            let name = pending_name.take().unwrap_or_else(|| {
                String::from_utf8_lossy(&header.path_bytes()).into_owned()
            });
            let matched = delete_matches(patterns, &name);
            if matched {
                if self.opts.verbosity >= Verbosity::Verbose {
                    let _ = writeln!(self.out, "{}", name);
                }
                self.outcome.members += 1;
                pending.clear();
                skip_entry_blocks(src, &header, data_blocks)
                    .map_err(|e| OpError::InvalidArchive(e.to_string()))?;
            } else {
                if !pending.is_empty() {
                    dst.write_all(&pending)
                        .map_err(|e| OpError::io(tmp_path.to_path_buf(), e))?;
                    written += pending.len() as u64;
                    pending.clear();
                }
                dst.write_all(&block)
                    .map_err(|e| OpError::io(tmp_path.to_path_buf(), e))?;
                written += 512;
                written += copy_entry_blocks(src, &mut dst, &header, data_blocks)
                    .map_err(|e| OpError::io(tmp_path.to_path_buf(), e))?;
            }
        }

        write_terminator(&mut dst, written, self.opts.blocking_factor)
            .map_err(|e| OpError::io(tmp_path.to_path_buf(), e))?;
        dst.sync_all()
            .map_err(|e| OpError::io(tmp_path.to_path_buf(), e))?;
        Ok(())
    }

    // ----- concatenate --------------------------------------------------

    fn concatenate(&mut self) -> Result<(), OpError> {
        let archive_path = self.archive_path()?;
        self.require_uncompressed(&archive_path)?;

        let mut target = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&archive_path)
            .map_err(|e| OpError::io(archive_path.clone(), e))?;

        // Stream the tail rather than probing the final block; a
        // malformed tail then fails loudly instead of mispositioning the
        // write pointer.
        let append_offset = {
            let mut archive = Archive::new(&mut target);
            let mut entries = archive
                .entries()
                .map_err(|e| OpError::io(archive_path.clone(), e))?;
            for entry in entries.by_ref() {
                entry.map_err(|e| OpError::InvalidArchive(e.to_string()))?;
            }
            drop(entries);
            archive.position().saturating_sub(1024)
        };
        target
            .seek(SeekFrom::Start(append_offset))
            .map_err(|e| OpError::io(archive_path.clone(), e))?;

        let mut written = 0u64;
        let sources = self.opts.file_list.clone();
        for source_path in &sources {
            self.check_cancel()?;
            let mut source = fs::File::open(source_path)
                .map_err(|e| OpError::io(source_path.clone(), e))?;
            written += self
                .splice_archive(&mut source, &mut target)
                .map_err(|e| OpError::io(source_path.clone(), e))?;
        }

        write_terminator(&mut target, append_offset + written, self.opts.blocking_factor)
            .map_err(|e| OpError::io(archive_path.clone(), e))?;
        let end = target
            .stream_position()
            .map_err(|e| OpError::io(archive_path.clone(), e))?;
        target
            .set_len(end)
            .map_err(|e| OpError::io(archive_path.clone(), e))?;
        Ok(())
    }

    /// Copies every member of `source` verbatim: headers, continuation
    /// blocks and data, with no re-encoding.
    fn splice_archive(&mut self, source: &mut fs::File, dst: &mut fs::File) -> io::Result<u64> {
        let mut written = 0u64;
        loop {
            let mut block = [0u8; 512];
            if !read_full_block(source, &mut block)? {
                break;
            }
            let header = header_from_block(&block);
            if header.is_zero_block() {
                break;
            }
            let size = header.entry_size()?;
            let data_blocks = crate::numeric::blocks_needed(size);
            dst.write_all(&block)?;
            written += 512;
            written += copy_entry_blocks(source, dst, &header, data_blocks)?;
            self.outcome.members += 1;
        }
        Ok(written)
    }

    fn require_uncompressed(&self, archive_path: &Path) -> Result<(), OpError> {
        let resolved = self.opts.compression.resolve_for_write(archive_path);
        if resolved != Compression::None {
            return Err(OpError::UnsupportedCompression(
                "cannot update compressed archives".into(),
            ));
        }
        Ok(())
    }
}

/// Per-walk mutable state for create/append/update.
struct WalkContext {
    update_map: Option<HashMap<String, u64>>,
    snapshot: Option<HashMap<String, u64>>,
    snapshot_path: Option<PathBuf>,
    new_snapshot: HashMap<String, u64>,
    removed_dirs: Vec<PathBuf>,
    warned_absolute: bool,
    #[cfg(unix)]
    root_dev: Option<u64>,
}

impl WalkContext {
    fn new(opts: &Options) -> Result<WalkContext, OpError> {
        let snapshot_path = opts.listed_incremental.clone();
        let snapshot = match &snapshot_path {
            Some(path) if path.exists() => Some(
                load_snapshot(path).map_err(|e| OpError::io(path.clone(), e))?,
            ),
            Some(_) => Some(HashMap::new()),
            None => None,
        };
        Ok(WalkContext {
            update_map: None,
            snapshot,
            snapshot_path,
            new_snapshot: HashMap::new(),
            removed_dirs: Vec::new(),
            warned_absolute: false,
            #[cfg(unix)]
            root_dev: None,
        })
    }

    fn record_member(&mut self, name: &str, meta: &fs::Metadata) {
        if self.snapshot.is_some() {
            self.new_snapshot
                .insert(name.to_string(), mtime_seconds(meta).max(0) as u64);
        }
    }

    /// Post-walk bookkeeping: snapshot rewrite and deferred directory
    /// removal (children first).
    fn finish(mut self, engine: &mut Engine) -> Result<(), OpError> {
        if let (Some(path), Some(mut old)) = (self.snapshot_path.take(), self.snapshot.take()) {
            // Entries not revisited this run are carried forward.
            for (name, mtime) in old.drain() {
                self.new_snapshot.entry(name).or_insert(mtime);
            }
            save_snapshot(&path, &self.new_snapshot)
                .map_err(|e| OpError::io(path.clone(), e))?;
        }
        self.removed_dirs.sort_by(|a, b| b.cmp(a));
        for dir in &self.removed_dirs {
            if let Err(e) = fs::remove_dir(dir) {
                log::warn!("cannot remove `{}`: {}", dir.display(), e);
                engine.outcome.warnings += 1;
            }
        }
        Ok(())
    }
}

/// Counts bytes on their way into a writer; append needs to know where
/// the rewritten archive ends.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> CountingWriter<W> {
        CountingWriter { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming byte-compare against a reader; mismatches latch.
struct Comparator<R> {
    source: R,
    equal: bool,
    buf: Vec<u8>,
}

impl<R: Read> Comparator<R> {
    fn new(source: R) -> Comparator<R> {
        Comparator {
            source,
            equal: true,
            buf: vec![0; 64 * 1024],
        }
    }

    fn matches(&self) -> bool {
        self.equal
    }
}

impl<R: Read> Write for Comparator<R> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if !self.equal {
            return Ok(data.len());
        }
        let mut compared = 0;
        while compared < data.len() {
            let want = (data.len() - compared).min(self.buf.len());
            let mut filled = 0;
            while filled < want {
                match self.source.read(&mut self.buf[filled..want])? {
                    0 => break,
                    n => filled += n,
                }
            }
            if filled == 0 || self.buf[..filled] != data[compared..compared + filled] {
                self.equal = false;
                return Ok(data.len());
            }
            compared += filled;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ----- listing format ---------------------------------------------------

/// Builds the `ls -l`-style line of verbose listings.
fn verbose_line(fields: &EntryFields, numeric_owner: bool) -> String {
    let kind = fields.header.entry_type();
    let mode = fields.header.mode().unwrap_or(0);
    let mode_string = format_mode(kind, mode);

    let owner = if numeric_owner {
        format!("{}/{}", fields.uid(), fields.gid())
    } else {
        let user = fields
            .username()
            .unwrap_or_else(|| fields.uid().to_string());
        let group = fields
            .groupname()
            .unwrap_or_else(|| fields.gid().to_string());
        format!("{}/{}", user, group)
    };

    let size = if kind.is_character_special() || kind.is_block_special() {
        let major = fields.header.device_major().ok().flatten().unwrap_or(0);
        let minor = fields.header.device_minor().ok().flatten().unwrap_or(0);
        format!("{},{}", major, minor)
    } else {
        fields.logical_size().to_string()
    };

    let (secs, _) = fields.mtime();
    let when = match Local.timestamp_opt(secs as i64, 0) {
        chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M").to_string(),
        _ => String::from("????-??-?? ??:??"),
    };

    let name = String::from_utf8_lossy(&fields.path_bytes()).into_owned();
    let mut line = format!("{} {} {} {} {}", mode_string, owner, size, when, name);
    if kind.is_symlink() {
        if let Some(target) = fields.link_name_bytes() {
            line.push_str(" -> ");
            line.push_str(&String::from_utf8_lossy(&target));
        }
    } else if kind.is_hard_link() {
        if let Some(target) = fields.link_name_bytes() {
            line.push_str(" link to ");
            line.push_str(&String::from_utf8_lossy(&target));
        }
    }
    line
}

fn format_mode(kind: EntryType, mode: u32) -> String {
    let type_char = if kind.is_dir() {
        'd'
    } else if kind.is_symlink() {
        'l'
    } else if kind.is_block_special() {
        'b'
    } else if kind.is_character_special() {
        'c'
    } else if kind.is_fifo() {
        'p'
    } else if kind.is_hard_link() {
        'h'
    } else {
        '-'
    };
    let mut out = String::with_capacity(10);
    out.push(type_char);
    let sets = [(mode >> 6) & 7, (mode >> 3) & 7, mode & 7];
    let specials = [mode & 0o4000 != 0, mode & 0o2000 != 0, mode & 0o1000 != 0];
    for (i, bits) in sets.iter().enumerate() {
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        let execute = bits & 1 != 0;
        out.push(match (execute, specials[i], i) {
            (true, true, 2) => 't',
            (false, true, 2) => 'T',
            (true, true, _) => 's',
            (false, true, _) => 'S',
            (true, false, _) => 'x',
            (false, false, _) => '-',
        });
    }
    out
}

// ----- raw block plumbing (delete / concatenate) ------------------------

fn header_from_block(block: &[u8; 512]) -> Header {
    let mut header = Header::new_old();
    header.as_mut_bytes().copy_from_slice(block);
    header
}

fn read_full_block(r: &mut fs::File, buf: &mut [u8; 512]) -> io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..])? {
            0 if read == 0 => return Ok(false),
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated block in archive",
                ))
            }
            n => read += n,
        }
    }
    Ok(true)
}

fn read_blocks_to_vec(src: &mut fs::File, blocks: u64) -> io::Result<Vec<u8>> {
    let mut out = vec![0u8; (blocks * 512) as usize];
    let mut filled = 0;
    while filled < out.len() {
        match src.read(&mut out[filled..])? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated member in archive",
                ))
            }
            n => filled += n,
        }
    }
    Ok(out)
}

fn copy_blocks(src: &mut fs::File, dst: &mut fs::File, blocks: u64) -> io::Result<u64> {
    let want = blocks * 512;
    let copied = io::copy(&mut src.take(want), dst)?;
    if copied != want {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated member in archive",
        ));
    }
    Ok(copied)
}

/// Copies a member's post-header blocks: old-GNU sparse continuations
/// first if the header declares them, then the data blocks.
fn copy_entry_blocks(
    src: &mut fs::File,
    dst: &mut fs::File,
    header: &Header,
    data_blocks: u64,
) -> io::Result<u64> {
    let mut written = 0;
    written += copy_sparse_continuations(src, Some(dst), header)?;
    written += copy_blocks(src, dst, data_blocks)?;
    Ok(written)
}

fn skip_entry_blocks(src: &mut fs::File, header: &Header, data_blocks: u64) -> io::Result<()> {
    copy_sparse_continuations(src, None, header)?;
    src.seek(SeekFrom::Current((data_blocks * 512) as i64))?;
    Ok(())
}

fn copy_sparse_continuations(
    src: &mut fs::File,
    mut dst: Option<&mut fs::File>,
    header: &Header,
) -> io::Result<u64> {
    if !header.entry_type().is_gnu_sparse() {
        return Ok(0);
    }
    let mut extended = header.as_gnu().map_or(false, |gnu| gnu.is_extended());
    let mut written = 0;
    while extended {
        let mut block = [0u8; 512];
        if !read_full_block(src, &mut block)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated sparse member in archive",
            ));
        }
        if let Some(dst) = dst.as_deref_mut() {
            dst.write_all(&block)?;
            written += 512;
        }
        extended = block[21 * 24] == 1;
    }
    Ok(written)
}

fn write_terminator(dst: &mut fs::File, written: u64, blocking_factor: u32) -> io::Result<()> {
    dst.write_all(&[0u8; 1024])?;
    let record = blocking_factor.max(1) as u64 * 512;
    let total = written + 1024;
    let rem = total % record;
    if rem != 0 {
        let zeros = vec![0u8; (record - rem) as usize];
        dst.write_all(&zeros)?;
    }
    Ok(())
}

// ----- small shared helpers ---------------------------------------------

fn stat_for(path: &Path, dereference: bool) -> io::Result<fs::Metadata> {
    if dereference {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    }
}

#[cfg(unix)]
fn mtime_seconds(meta: &fs::Metadata) -> i64 {
    use std::os::unix::prelude::*;
    meta.mtime()
}

#[cfg(not(unix))]
fn mtime_seconds(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::prelude::*;
    meta.mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn fifo_matches(meta: &fs::Metadata) -> bool {
    use std::os::unix::prelude::*;
    meta.file_type().is_fifo()
}

#[cfg(not(unix))]
fn fifo_matches(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn device_matches(meta: &fs::Metadata, block: bool) -> bool {
    use std::os::unix::prelude::*;
    if block {
        meta.file_type().is_block_device()
    } else {
        meta.file_type().is_char_device()
    }
}

#[cfg(not(unix))]
fn device_matches(_meta: &fs::Metadata, _block: bool) -> bool {
    false
}

fn load_excludes(opts: &Options) -> Result<Vec<String>, OpError> {
    let mut patterns = opts.exclude_patterns.clone();
    if let Some(path) = &opts.exclude_from {
        patterns.extend(
            read_name_list(path, opts.null_terminated)
                .map_err(|e| OpError::io(path.clone(), e))?,
        );
    }
    Ok(patterns)
}

fn read_name_list(path: &Path, null_terminated: bool) -> io::Result<Vec<String>> {
    let data = fs::read(path)?;
    let sep = if null_terminated { 0u8 } else { b'\n' };
    Ok(data
        .split(|b| *b == sep)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect())
}

/// Matching for `delete` patterns: exact name, trailing-slash-blind
/// equality, or directory prefix.
fn delete_matches(patterns: &[String], name: &str) -> bool {
    let bare = name.trim_end_matches('/');
    patterns.iter().any(|pattern| {
        let p = pattern.trim_end_matches('/');
        bare == p || bare.strip_prefix(p).map_or(false, |rest| rest.starts_with('/'))
    })
}

fn trim_trailing_nuls(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && bytes[end - 1] == 0 {
        end -= 1;
    }
    &bytes[..end]
}

fn sibling_temp_path(archive_path: &Path) -> PathBuf {
    let name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    archive_path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

/// Snapshot files map member names to mtimes, one `mtime name` pair per
/// line.
fn load_snapshot(path: &Path) -> io::Result<HashMap<String, u64>> {
    let data = fs::read_to_string(path)?;
    let mut map = HashMap::new();
    for line in data.lines() {
        if let Some((mtime, name)) = line.split_once(' ') {
            if let Ok(mtime) = mtime.parse() {
                map.insert(name.to_string(), mtime);
            }
        }
    }
    Ok(map)
}

fn save_snapshot(path: &Path, map: &HashMap<String, u64>) -> io::Result<()> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort();
    let mut out = String::new();
    for (name, mtime) in entries {
        out.push_str(&format!("{} {}\n", mtime, name));
    }
    fs::write(path, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_pattern_semantics() {
        let pats = vec!["mid".to_string(), "dir/".to_string()];
        assert!(delete_matches(&pats, "mid"));
        assert!(delete_matches(&pats, "mid/"));
        assert!(delete_matches(&pats, "mid/inner.txt"));
        assert!(delete_matches(&pats, "dir"));
        assert!(delete_matches(&pats, "dir/file"));
        assert!(!delete_matches(&pats, "middle"));
        assert!(!delete_matches(&pats, "directory/file"));
    }

    #[test]
    fn mode_strings() {
        assert_eq!(format_mode(EntryType::file(), 0o644), "-rw-r--r--");
        assert_eq!(format_mode(EntryType::dir(), 0o755), "drwxr-xr-x");
        assert_eq!(format_mode(EntryType::symlink(), 0o777), "lrwxrwxrwx");
        assert_eq!(format_mode(EntryType::file(), 0o4755), "-rwsr-xr-x");
        assert_eq!(format_mode(EntryType::file(), 0o1777), "-rwxrwxrwt");
        assert_eq!(format_mode(EntryType::fifo(), 0o640), "prw-r-----");
    }

    #[test]
    fn outcome_exit_codes() {
        assert_eq!(Outcome::default().exit_code(), 0);
        let with_diffs = Outcome {
            differences: 2,
            ..Outcome::default()
        };
        assert_eq!(with_diffs.exit_code(), 1);
    }
}
