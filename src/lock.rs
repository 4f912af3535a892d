// src/lock.rs

//! Advisory whole-directory lock for the package database.
//!
//! Construction acquires a non-blocking flock on `<root>/var/lib/pkg`;
//! mutators take it exclusive, readers shared. A held lock is released
//! when the guard is dropped, on every exit path.

use std::fs::File;
use std::io;
use std::path::PathBuf;

use fs2::FileExt;
use tracing::debug;

use crate::db::PKG_DIR;
use crate::fsutil;
use crate::{Error, Result};

/// RAII guard over the database directory lock.
///
/// At most one exclusive holder exists across processes; shared
/// holders may coexist with each other but exclude mutators.
#[derive(Debug)]
pub struct DbLock {
    dir: File,
    path: PathBuf,
}

impl DbLock {
    /// Acquire the exclusive (mutator) lock without blocking.
    ///
    /// Fails with [`Error::DatabaseBusy`] if any other process holds
    /// the lock in either mode.
    pub fn exclusive(root: &str) -> Result<Self> {
        Self::acquire(root, true)
    }

    /// Acquire a shared (reader) lock without blocking.
    pub fn shared(root: &str) -> Result<Self> {
        Self::acquire(root, false)
    }

    fn acquire(root: &str, exclusive: bool) -> Result<Self> {
        let path = PathBuf::from(fsutil::normalize(&format!("{}/{}", root, PKG_DIR)));

        let dir = File::open(&path).map_err(|source| Error::DatabaseIo {
            op: "open directory",
            path: path.clone(),
            source,
        })?;

        let locked = if exclusive {
            FileExt::try_lock_exclusive(&dir)
        } else {
            FileExt::try_lock_shared(&dir)
        };

        match locked {
            Ok(()) => {
                debug!(
                    "acquired {} lock on {}",
                    if exclusive { "exclusive" } else { "shared" },
                    path.display()
                );
                Ok(Self { dir, path })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::DatabaseBusy),
            Err(source) => Err(Error::DatabaseIo {
                op: "lock directory",
                path,
                source,
            }),
        }
    }
}

impl Drop for DbLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.dir);
        debug!("released lock on {}", self.path.display());
    }
}
