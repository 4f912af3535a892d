// src/db.rs

//! Flat-file package catalogue.
//!
//! The on-disk format is line oriented: per package one line of name,
//! one line of version, zero or more lines of file paths and a blank
//! terminator line. Paths are stored without a leading slash and
//! directory paths end with `/`.
//!
//! Commits are atomic across crashes: the new catalogue is written to
//! a temporary sibling, fsynced, the old catalogue is hard-linked to a
//! backup and the temporary is renamed into place.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use tracing::debug;

use crate::fsutil;
use crate::{Error, Result};

/// Lock directory, relative to the root.
pub const PKG_DIR: &str = "var/lib/pkg";
/// Catalogue file, relative to the root.
pub const PKG_DB: &str = "var/lib/pkg/db";
/// Rejection area for kept configs, relative to the root.
pub const PKG_REJECTED: &str = "var/lib/pkg/rejected";

/// One package's metadata: version and owned file list.
///
/// The file set is ordered byte-lexicographically; removal walks it in
/// reverse so files are visited before their parent directories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageMeta {
    pub version: String,
    pub files: BTreeSet<String>,
}

/// The installed state: package name to package entry.
pub type Catalogue = BTreeMap<String, PackageMeta>;

fn db_path(root: &str) -> PathBuf {
    PathBuf::from(fsutil::normalize(&format!("{}/{}", root, PKG_DB)))
}

/// Load the catalogue under `root` into memory.
///
/// Records with an empty file list are dropped. A trailing record
/// without its blank terminator is accepted if otherwise consistent.
pub fn load(root: &str) -> Result<Catalogue> {
    let path = db_path(root);
    let file = File::open(&path).map_err(|source| Error::DatabaseIo {
        op: "open",
        path: path.clone(),
        source,
    })?;

    let read_err = |source: io::Error| Error::DatabaseIo {
        op: "read",
        path: path.clone(),
        source,
    };

    let mut packages = Catalogue::new();
    let mut lines = BufReader::new(file).lines();

    loop {
        let name = match lines.next() {
            Some(line) => line.map_err(read_err)?,
            None => break,
        };
        let version = match lines.next() {
            Some(line) => line.map_err(read_err)?,
            None => String::new(),
        };

        let mut files = BTreeSet::new();
        for line in lines.by_ref() {
            let line = line.map_err(read_err)?;
            if line.is_empty() {
                break;
            }
            files.insert(line);
        }

        if !files.is_empty() {
            packages.insert(name, PackageMeta { version, files });
        }
    }

    debug!("{} packages found in database", packages.len());
    Ok(packages)
}

/// Write the catalogue under `root` atomically.
///
/// A crash at any point leaves a usable `db`; a stale
/// `db.incomplete_transaction` is cleaned up by the next commit.
pub fn commit(root: &str, packages: &Catalogue) -> Result<()> {
    let db = db_path(root);
    let db_new = db.with_extension("incomplete_transaction");
    let db_bak = db.with_extension("backup");

    // Remove a failed transaction, if one exists.
    if let Err(source) = fs::remove_file(&db_new) {
        if source.kind() != io::ErrorKind::NotFound {
            return Err(Error::DatabaseIo {
                op: "remove",
                path: db_new,
                source,
            });
        }
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o444)
        .open(&db_new)
        .map_err(|source| Error::DatabaseIo {
            op: "create",
            path: db_new.clone(),
            source,
        })?;

    let write_err = |source: io::Error| Error::DatabaseIo {
        op: "write",
        path: db_new.clone(),
        source,
    };

    let mut out = BufWriter::new(&file);
    for (name, meta) in packages {
        if meta.files.is_empty() {
            continue;
        }
        writeln!(out, "{}", name).map_err(write_err)?;
        writeln!(out, "{}", meta.version).map_err(write_err)?;
        for path in &meta.files {
            writeln!(out, "{}", path).map_err(write_err)?;
        }
        writeln!(out).map_err(write_err)?;
    }
    out.flush().map_err(write_err)?;
    drop(out);

    file.sync_all().map_err(|source| Error::DatabaseIo {
        op: "synchronize",
        path: db_new.clone(),
        source,
    })?;

    // Relink the database backup.
    if let Err(source) = fs::remove_file(&db_bak) {
        if source.kind() != io::ErrorKind::NotFound {
            return Err(Error::DatabaseIo {
                op: "remove",
                path: db_bak,
                source,
            });
        }
    }
    fs::hard_link(&db, &db_bak).map_err(|source| Error::DatabaseIo {
        op: "link",
        path: db_bak.clone(),
        source,
    })?;

    // Move the new database into place.
    fs::rename(&db_new, &db).map_err(|source| Error::DatabaseIo {
        op: "rename",
        path: db_new.clone(),
        source,
    })?;

    debug!("{} packages written to database", packages.len());
    Ok(())
}

/// Compute the set of file paths that would clash if `(name, info)`
/// were installed into the state described by `packages` under `root`.
///
/// Four ordered phases: paths owned by other packages, paths already
/// present on the filesystem, minus directories, minus anything a
/// previous incarnation of the same package already owns.
pub fn find_conflicts(
    packages: &Catalogue,
    root: &str,
    name: &str,
    info: &PackageMeta,
) -> BTreeSet<String> {
    let mut conflicts = BTreeSet::new();

    // Conflicting files in the database.
    for (other, meta) in packages {
        if other != name {
            conflicts.extend(info.files.intersection(&meta.files).cloned());
        }
    }

    // Conflicting files on the filesystem.
    for file in &info.files {
        if conflicts.contains(file) {
            continue;
        }
        let full = fsutil::normalize(&format!("{}/{}", root, file));
        if fsutil::exists(&full) {
            conflicts.insert(file.clone());
        }
    }

    // Directories never conflict.
    conflicts.retain(|file| !file.ends_with('/'));

    // On upgrade, ignore files this package already owns.
    if let Some(existing) = packages.get(name) {
        for file in &existing.files {
            conflicts.remove(file);
        }
    }

    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(version: &str, files: &[&str]) -> PackageMeta {
        PackageMeta {
            version: version.to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn seeded_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(PKG_DIR)).unwrap();
        fs::write(dir.path().join(PKG_DB), b"").unwrap();
        dir
    }

    #[test]
    fn load_missing_database_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(dir.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::DatabaseIo { op: "open", .. }));
    }

    #[test]
    fn commit_then_load_round_trips() {
        let dir = seeded_root();
        let root = dir.path().to_str().unwrap();

        let mut packages = Catalogue::new();
        packages.insert("foo".into(), meta("1.0", &["bin/foo", "share/foo/"]));
        packages.insert("bar".into(), meta("2.3", &["bin/bar"]));

        commit(root, &packages).unwrap();
        assert_eq!(load(root).unwrap(), packages);
    }

    #[test]
    fn commit_drops_empty_entries() {
        let dir = seeded_root();
        let root = dir.path().to_str().unwrap();

        let mut packages = Catalogue::new();
        packages.insert("ghost".into(), meta("1.0", &[]));
        packages.insert("real".into(), meta("1.0", &["bin/real"]));

        commit(root, &packages).unwrap();
        let reloaded = load(root).unwrap();
        assert!(!reloaded.contains_key("ghost"));
        assert!(reloaded.contains_key("real"));
    }

    #[test]
    fn database_file_is_bit_exact() {
        let dir = seeded_root();
        let root = dir.path().to_str().unwrap();

        let mut packages = Catalogue::new();
        packages.insert("foo".into(), meta("1.0", &["bin/foo", "etc/foo.conf"]));

        commit(root, &packages).unwrap();
        let bytes = fs::read(dir.path().join(PKG_DB)).unwrap();
        assert_eq!(bytes, b"foo\n1.0\nbin/foo\netc/foo.conf\n\n".to_vec());
    }

    #[test]
    fn load_accepts_missing_trailing_blank() {
        let dir = seeded_root();
        fs::write(dir.path().join(PKG_DB), b"foo\n1.0\nbin/foo").unwrap();

        let packages = load(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(packages["foo"], meta("1.0", &["bin/foo"]));
    }

    #[test]
    fn commit_cleans_transaction_and_keeps_backup() {
        let dir = seeded_root();
        let root = dir.path().to_str().unwrap();

        let mut packages = Catalogue::new();
        packages.insert("foo".into(), meta("1.0", &["bin/foo"]));
        commit(root, &packages).unwrap();
        let first = fs::read(dir.path().join(PKG_DB)).unwrap();

        packages.insert("bar".into(), meta("2.0", &["bin/bar"]));
        commit(root, &packages).unwrap();

        assert!(!dir
            .path()
            .join("var/lib/pkg/db.incomplete_transaction")
            .exists());
        let backup = fs::read(dir.path().join("var/lib/pkg/db.backup")).unwrap();
        assert_eq!(backup, first);
    }

    #[test]
    fn stale_transaction_file_is_replaced() {
        let dir = seeded_root();
        let root = dir.path().to_str().unwrap();
        fs::write(
            dir.path().join("var/lib/pkg/db.incomplete_transaction"),
            b"garbage",
        )
        .unwrap();

        let mut packages = Catalogue::new();
        packages.insert("foo".into(), meta("1.0", &["bin/foo"]));
        commit(root, &packages).unwrap();

        assert_eq!(load(root).unwrap(), packages);
    }

    #[test]
    fn conflicts_with_other_package() {
        let dir = seeded_root();
        let root = dir.path().to_str().unwrap();

        let mut packages = Catalogue::new();
        packages.insert("a".into(), meta("1", &["bin/x", "share/a/"]));

        let incoming = meta("1", &["bin/x", "bin/y", "share/a/"]);
        let conflicts = find_conflicts(&packages, root, "b", &incoming);

        // bin/x clashes; the shared directory does not.
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts.contains("bin/x"));
    }

    #[test]
    fn conflicts_with_filesystem() {
        let dir = seeded_root();
        let root = dir.path().to_str().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/stray"), b"unowned").unwrap();

        let incoming = meta("1", &["bin/stray", "bin/new"]);
        let conflicts = find_conflicts(&Catalogue::new(), root, "pkg", &incoming);

        assert_eq!(conflicts.len(), 1);
        assert!(conflicts.contains("bin/stray"));
    }

    #[test]
    fn upgrade_over_self_is_conflict_free() {
        let dir = seeded_root();
        let root = dir.path().to_str().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/foo"), b"v1").unwrap();

        let mut packages = Catalogue::new();
        packages.insert("foo".into(), meta("1.0", &["bin/foo"]));

        let incoming = meta("1.1", &["bin/foo"]);
        assert!(find_conflicts(&packages, root, "foo", &incoming).is_empty());
    }
}
