//! Member-name policy: exclude matching, path transforms and
//! strip-components.

use std::path::{Component, Path, PathBuf};

/// A pre-parsed path rewrite rule applied to member names before they
/// are written or matched.
///
/// The transform mini-language itself is parsed by the front-end; the
/// engine consumes these resolved rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transform {
    /// Remove a leading prefix when present.
    StripPrefix(String),
    /// Prepend a prefix to every name.
    AddPrefix(String),
    /// Replace the first occurrence of `find` with `replace`.
    Replace {
        /// Substring to search for.
        find: String,
        /// Its replacement.
        replace: String,
    },
}

/// Applies the transform list to `name`, in order.
pub fn apply_transforms(name: &str, rules: &[Transform]) -> String {
    let mut out = name.to_string();
    for rule in rules {
        out = match rule {
            Transform::StripPrefix(prefix) => out
                .strip_prefix(prefix)
                .map(str::to_string)
                .unwrap_or(out),
            Transform::AddPrefix(prefix) => format!("{}{}", prefix, out),
            Transform::Replace { find, replace } => out.replacen(find, replace, 1),
        };
    }
    out
}

/// Reports whether `name` matches any exclude pattern.
///
/// A pattern matches if it equals the full name, equals the basename,
/// is a directory prefix of the name (pattern plus `/`), or, with a
/// single `*`, if the prefix/suffix around the `*` bracket either the
/// full name or the basename.
pub fn excluded(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| matches_pattern(p, name))
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some((prefix, suffix)) = pattern.split_once('*') {
        return wildcard_match(prefix, suffix, name) || wildcard_match(prefix, suffix, basename);
    }
    if pattern == name || pattern == basename {
        return true;
    }
    // Directory patterns cover everything beneath them.
    name.strip_prefix(pattern)
        .map_or(false, |rest| rest.starts_with('/'))
}

fn wildcard_match(prefix: &str, suffix: &str, candidate: &str) -> bool {
    candidate.len() >= prefix.len() + suffix.len()
        && candidate.starts_with(prefix)
        && candidate.ends_with(suffix)
}

/// Drops the first `n` components of `name`; `None` when fewer exist
/// (the entry is then skipped entirely).
pub fn strip_components(name: &Path, n: u32) -> Option<PathBuf> {
    if n == 0 {
        return Some(name.to_path_buf());
    }
    let mut dropped = 0;
    let mut out = PathBuf::new();
    for part in name.components() {
        match part {
            Component::Normal(_) if dropped < n => dropped += 1,
            Component::Normal(part) => out.push(part),
            _ => continue,
        }
    }
    if dropped < n || out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Removes leading `/` (and drive/root components) from a member name,
/// as archives store relative names unless absolute names are allowed.
pub fn make_relative(name: &str) -> &str {
    let mut out = name;
    while let Some(rest) = out.strip_prefix('/') {
        out = rest;
    }
    out
}
