// src/error.rs

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Core error types for pkgutils
#[derive(Error, Debug)]
pub enum Error {
    /// Another process holds the database lock
    #[error("package database is currently locked by another process")]
    DatabaseBusy,

    /// A database file operation failed
    #[error("could not {op} {}: {source}", .path.display())]
    DatabaseIo {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    /// Filename cannot be parsed into name and version
    #[error("could not determine name and/or version of {0}: Invalid package name")]
    BadPackageName(String),

    /// Archive could not be opened
    #[error("could not open {}: {reason}", .path.display())]
    ArchiveOpen { path: PathBuf, reason: String },

    /// Archive could not be read past its headers
    #[error("could not read {}: {source}", .path.display())]
    ArchiveRead { path: PathBuf, source: io::Error },

    /// Archive contains no entries
    #[error("empty package {}", .0.display())]
    EmptyPackage(PathBuf),

    #[error("package {0} already installed (use -u to upgrade)")]
    AlreadyInstalled(String),

    #[error("package {0} not installed")]
    NotInstalled(String),

    /// Conflict detector result when install is not forced
    #[error("{}", conflict_listing(.0))]
    FileConflicts(BTreeSet<String>),

    /// Per-entry extraction failure, fatal only for fresh installs
    #[error("could not install {path}: {reason}")]
    ExtractError { path: String, reason: String },

    /// Rule configuration file rejected
    #[error("{}:{line}: {reason}", .file.display())]
    ConfigParse {
        file: PathBuf,
        line: usize,
        reason: String,
    },

    /// Caller lacks the privileges the verb requires
    #[error("only root can {0} packages")]
    PermissionDenied(&'static str),
}

/// Result type alias using the pkgutils Error type
pub type Result<T> = std::result::Result<T, Error>;

fn conflict_listing(files: &BTreeSet<String>) -> String {
    let mut out = String::new();
    for file in files {
        out.push_str(file);
        out.push('\n');
    }
    out.push_str("listed file(s) already installed (use -f to ignore and overwrite)");
    out
}
