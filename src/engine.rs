// src/engine.rs

//! Install and removal engine.
//!
//! An [`Engine`] couples a root directory with the in-memory catalogue
//! loaded from it. Front-ends drive it through plain method calls and
//! decide when to [`Engine::commit`]; tests can hold several engines
//! against different roots in one process.
//!
//! The install ordering is deliberate: the catalogue is committed
//! before any file is materialised, so a crash mid-extraction leaves a
//! package that is recorded but incomplete - which the integrity
//! checker can find - rather than files on disk that no record claims.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::{error, info, warn};

use crate::archive;
use crate::db::{self, Catalogue, PackageMeta, PKG_REJECTED};
use crate::fsutil;
use crate::rules::{self, Rule};
use crate::{Error, Result};

/// Shared-library cache refresher invoked after mutations.
const LDCONFIG: &str = "/sbin/ldconfig";
/// Its configuration file, relative to the root.
const LDCONFIG_CONF: &str = "etc/ld.so.conf";

/// Package state engine for one root directory.
#[derive(Debug)]
pub struct Engine {
    root: String,
    packages: Catalogue,
}

impl Engine {
    /// Open the package database under `root`.
    ///
    /// The empty string means `/`. Fails if the catalogue file cannot
    /// be read.
    pub fn open(root: &str) -> Result<Self> {
        let root = fsutil::normalize(&format!("{}/", root));
        let packages = db::load(&root)?;
        Ok(Self { root, packages })
    }

    /// The root directory, slash-normalised with a trailing `/`.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// The in-memory catalogue.
    pub fn packages(&self) -> &Catalogue {
        &self.packages
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    pub fn files_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.packages.get(name).map(|meta| &meta.files)
    }

    /// Persist the in-memory catalogue (see [`db::commit`]).
    pub fn commit(&self) -> Result<()> {
        db::commit(&self.root, &self.packages)
    }

    /// Insert or replace a package entry in memory.
    pub fn add_package(&mut self, name: &str, meta: PackageMeta) {
        self.packages.insert(name.to_string(), meta);
    }

    /// Conflicting file paths between a candidate and the current state.
    pub fn conflicts(&self, name: &str, info: &PackageMeta) -> BTreeSet<String> {
        db::find_conflicts(&self.packages, &self.root, name, info)
    }

    fn full_path(&self, rel: &str) -> String {
        fsutil::normalize(&format!("{}{}", self.root, rel))
    }

    /// Install or upgrade the archive at `path`.
    ///
    /// Applies the INSTALL rules, detects conflicts, excises whatever
    /// the new package replaces, commits the catalogue and only then
    /// materialises files. With `upgrade`, files matching an UPGRADE
    /// rule with action NO are preserved on disk and the archive's
    /// version is diverted to the rejected area.
    pub fn install(
        &mut self,
        path: &Path,
        config_rules: &[Rule],
        upgrade: bool,
        force: bool,
    ) -> Result<()> {
        let (name, mut info) = archive::open_pkg(path)?;

        let installed = self.packages.contains_key(&name);
        if installed && !upgrade {
            return Err(Error::AlreadyInstalled(name));
        }
        if !installed && upgrade {
            return Err(Error::NotInstalled(name));
        }

        let (install_set, non_install_set) =
            rules::apply_install_rules(&info.files, config_rules);
        info.files = install_set;

        let conflicts = self.conflicts(&name, &info);
        if !conflicts.is_empty() {
            if !force {
                return Err(Error::FileConflicts(conflicts));
            }
            let keep = if upgrade {
                rules::make_keep_list(&conflicts, config_rules)
            } else {
                BTreeSet::new()
            };
            self.remove_files(conflicts, &keep);
        }

        let mut keep_list = BTreeSet::new();
        if upgrade {
            keep_list = rules::make_keep_list(&info.files, config_rules);
            self.db_rm_pkg(&name, &keep_list);
        }

        info!("{} {}", if upgrade { "upgrading" } else { "installing" }, name);

        self.packages.insert(name.clone(), info);
        self.commit()?;

        if let Err(e) = self.extract(path, &keep_list, &non_install_set, upgrade) {
            if !installed {
                // Fresh install: take the failed entry back out.
                self.packages.remove(&name);
                self.commit()?;
            }
            return Err(e);
        }

        self.ldconfig();
        Ok(())
    }

    /// Remove an installed package, deleting only files no other
    /// package references.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if !self.packages.contains_key(name) {
            return Err(Error::NotInstalled(name.to_string()));
        }

        info!("removing {}", name);

        self.db_rm_pkg(name, &BTreeSet::new());
        self.ldconfig();
        self.commit()
    }

    /// Erase a package from the catalogue and delete its files,
    /// sparing `keep` and anything another package still references.
    fn db_rm_pkg(&mut self, name: &str, keep: &BTreeSet<String>) {
        let mut files = self
            .packages
            .remove(name)
            .map(|meta| meta.files)
            .unwrap_or_default();

        for file in keep {
            files.remove(file);
        }

        // Don't delete files that still have references.
        for meta in self.packages.values() {
            for file in &meta.files {
                files.remove(file);
            }
        }

        self.delete_files(&files);
    }

    /// Erase `files` from every catalogue entry, then delete them from
    /// disk except for `keep`.
    pub fn remove_files(&mut self, files: BTreeSet<String>, keep: &BTreeSet<String>) {
        for meta in self.packages.values_mut() {
            for file in &files {
                meta.files.remove(file);
            }
        }

        let mut doomed = files;
        for file in keep {
            doomed.remove(file);
        }

        self.delete_files(&doomed);
    }

    /// Delete paths in reverse sorted order so directories are visited
    /// after their contents. A still-occupied directory is skipped
    /// silently; other failures are reported and absorbed.
    fn delete_files(&self, files: &BTreeSet<String>) {
        for file in files.iter().rev() {
            let full = self.full_path(file);
            let path = Path::new(&full);

            let meta = match fs::symlink_metadata(path) {
                Ok(meta) => meta,
                Err(_) => continue,
            };

            let result = if meta.is_dir() {
                fs::remove_dir(path)
            } else {
                fs::remove_file(path)
            };

            if let Err(e) = result {
                if e.kind() == io::ErrorKind::DirectoryNotEmpty {
                    continue;
                }
                error!("could not remove {}: {}", full, e);
            }
        }
    }

    fn extract(
        &self,
        path: &Path,
        keep_list: &BTreeSet<String>,
        non_install_set: &BTreeSet<String>,
        upgrade: bool,
    ) -> Result<()> {
        let read_err = |source: io::Error| Error::ArchiveRead {
            path: path.to_path_buf(),
            source,
        };

        let mut archive = archive::open_reader(path)?;
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_preserve_ownerships(true);
        archive.set_unpack_xattrs(cfg!(feature = "xattr"));

        let reject_dir = PathBuf::from(self.full_path(PKG_REJECTED));

        let mut count = 0usize;
        for entry in archive.entries().map_err(read_err)? {
            let mut entry = entry.map_err(read_err)?;
            count += 1;

            let pathname = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

            // Filtered out via INSTALL rules.
            if non_install_set.contains(&pathname) {
                info!("ignoring {}", pathname);
                continue;
            }

            let original = PathBuf::from(self.full_path(&pathname));

            // Keep-listed files that already exist are diverted to the
            // rejected area instead of overwriting the live copy.
            let rejected = keep_list.contains(&pathname) && fsutil::exists(&original);
            let target = if rejected {
                PathBuf::from(fsutil::normalize(&format!(
                    "{}/{}",
                    reject_dir.display(),
                    pathname
                )))
            } else {
                original.clone()
            };

            // Relative hardlink targets resolve against the root, not
            // the process working directory.
            let hard_src = if entry.header().entry_type().is_hard_link() {
                entry
                    .link_name_bytes()
                    .map(|bytes| self.full_path(&String::from_utf8_lossy(&bytes)))
                    .map(PathBuf::from)
            } else {
                None
            };

            if let Err(e) = unpack_entry(&mut entry, &target, hard_src.as_deref()) {
                error!("could not install {}: {}", pathname, e);
                if !upgrade {
                    return Err(Error::ExtractError {
                        path: pathname,
                        reason: e.to_string(),
                    });
                }
                continue;
            }

            if rejected {
                let is_dir = entry.header().entry_type().is_dir();
                self.review_rejection(is_dir, &target, &original, &reject_dir, &pathname);
            }
        }

        if count == 0 {
            return Err(Error::EmptyPackage(path.to_path_buf()));
        }

        Ok(())
    }

    /// Decide whether a freshly written rejection is worth keeping.
    ///
    /// A rejection identical to the live copy (matching permissions,
    /// and matching or empty content for non-directories) is deleted
    /// and its now-empty parents pruned.
    fn review_rejection(
        &self,
        is_dir: bool,
        rejected: &Path,
        original: &Path,
        reject_dir: &Path,
        pathname: &str,
    ) {
        let discard = if is_dir {
            fsutil::perms_equal(rejected, original)
        } else {
            fsutil::perms_equal(rejected, original)
                && (fsutil::is_empty_regular(rejected)
                    || fsutil::content_equal(rejected, original))
        };

        if discard {
            fsutil::prune_up(reject_dir, rejected);
        } else {
            warn!("rejecting {}, keeping existing version", pathname);
        }
    }

    /// Refresh the shared-library cache if the root carries an
    /// `ld.so.conf`. Failure is reported but never fatal.
    pub fn ldconfig(&self) {
        if !fsutil::exists(self.full_path(LDCONFIG_CONF)) {
            return;
        }

        match Command::new(LDCONFIG).arg("-r").arg(&self.root).status() {
            Ok(status) if !status.success() => {
                warn!("{} -r {} exited with {}", LDCONFIG, self.root, status);
            }
            Err(e) => warn!("could not execute {}: {}", LDCONFIG, e),
            Ok(_) => {}
        }
    }
}

/// Ignore the signals that could interrupt a mutation mid-extraction.
///
/// Installed for the remainder of the process lifetime; the atomic
/// commit protocol is only atomic if a rename cannot be interrupted
/// from the keyboard.
pub fn shield_signals() {
    for sig in [
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTERM,
    ] {
        // SAFETY: SigIgn installs no handler code.
        unsafe {
            let _ = signal(sig, SigHandler::SigIgn);
        }
    }
}

fn unpack_entry<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    target: &Path,
    hard_src: Option<&Path>,
) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    // Unlink before create, except a directory landing on a directory.
    let entry_is_dir = entry.header().entry_type().is_dir();
    if let Ok(meta) = fs::symlink_metadata(target) {
        if !(entry_is_dir && meta.is_dir()) {
            let _ = if meta.is_dir() {
                fs::remove_dir(target)
            } else {
                fs::remove_file(target)
            };
        }
    }

    match hard_src {
        Some(src) => fs::hard_link(src, target),
        None => entry.unpack(target).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PKG_DB, PKG_DIR};

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
    fn open_normalizes_root() {
        let dir = seeded_root();
        let messy = format!("{}//", dir.path().display());
        let engine = Engine::open(&messy).unwrap();
        assert!(engine.root().ends_with('/'));
        assert!(!engine.root().contains("//"));
    }

    #[test]
    fn remove_spares_files_referenced_by_others() {
        let dir = seeded_root();
        fs::create_dir_all(dir.path().join("share/lib")).unwrap();
        fs::write(dir.path().join("share/lib/a.dat"), b"a").unwrap();
        fs::write(dir.path().join("share/lib/shared.dat"), b"s").unwrap();

        let mut engine = Engine::open(dir.path().to_str().unwrap()).unwrap();
        engine.add_package(
            "a",
            meta("1", &["share/", "share/lib/", "share/lib/a.dat", "share/lib/shared.dat"]),
        );
        engine.add_package("b", meta("1", &["share/", "share/lib/", "share/lib/shared.dat"]));
        engine.commit().unwrap();

        engine.remove("a").unwrap();

        assert!(!dir.path().join("share/lib/a.dat").exists());
        assert!(dir.path().join("share/lib/shared.dat").exists());
        // still occupied, so the directory survives the reverse walk
        assert!(dir.path().join("share/lib").exists());
        assert!(!engine.is_installed("a"));
        assert!(engine.is_installed("b"));
    }

    #[test]
    fn remove_prunes_fully_owned_directories() {
        let dir = seeded_root();
        fs::create_dir_all(dir.path().join("opt/tool/bin")).unwrap();
        fs::write(dir.path().join("opt/tool/bin/run"), b"#!").unwrap();

        let mut engine = Engine::open(dir.path().to_str().unwrap()).unwrap();
        engine.add_package(
            "tool",
            meta("1", &["opt/", "opt/tool/", "opt/tool/bin/", "opt/tool/bin/run"]),
        );
        engine.commit().unwrap();

        engine.remove("tool").unwrap();

        assert!(!dir.path().join("opt").exists());
    }

    #[test]
    fn remove_unknown_package_fails() {
        let dir = seeded_root();
        let mut engine = Engine::open(dir.path().to_str().unwrap()).unwrap();
        assert!(matches!(
            engine.remove("ghost"),
            Err(Error::NotInstalled(_))
        ));
    }

    #[test]
    fn remove_files_erases_references_everywhere() {
        let dir = seeded_root();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/x"), b"x").unwrap();

        let mut engine = Engine::open(dir.path().to_str().unwrap()).unwrap();
        engine.add_package("a", meta("1", &["bin/x", "bin/a"]));

        let doomed: BTreeSet<String> = ["bin/x".to_string()].into_iter().collect();
        engine.remove_files(doomed, &BTreeSet::new());

        assert!(!dir.path().join("bin/x").exists());
        assert_eq!(engine.files_of("a").unwrap().len(), 1);
    }

    #[test]
    fn keep_list_shields_disk_but_not_catalogue() {
        let dir = seeded_root();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/foo.conf"), b"local").unwrap();

        let mut engine = Engine::open(dir.path().to_str().unwrap()).unwrap();
        engine.add_package("a", meta("1", &["etc/foo.conf"]));

        let doomed: BTreeSet<String> = ["etc/foo.conf".to_string()].into_iter().collect();
        let keep = doomed.clone();
        engine.remove_files(doomed, &keep);

        assert!(dir.path().join("etc/foo.conf").exists());
        assert!(engine.files_of("a").unwrap().is_empty());
    }
}
