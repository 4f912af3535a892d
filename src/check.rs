// src/check.rs

//! Integrity checker.
//!
//! Audits installed packages against the filesystem: symlinks whose
//! immediate target is gone, symlinks resolving into paths no package
//! (or only foreign packages) own, and files that disappeared from
//! under the root. The checker never mutates anything.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use regex::Regex;

use crate::db::Catalogue;
use crate::engine::Engine;
use crate::fsutil;

/// A symlink the audit flagged.
#[derive(Debug)]
pub struct LinkFinding {
    /// Resolved path of the symlink under the root.
    pub path: String,
    /// The raw link target.
    pub target: String,
    pub kind: LinkKind,
}

#[derive(Debug)]
pub enum LinkKind {
    /// The immediate target does not exist.
    Broken,
    /// The target exists but neither the immediate nor the fully
    /// resolved path belongs to the audited package.
    Foreign {
        immediate_owners: BTreeSet<String>,
        resolved_owners: BTreeSet<String>,
    },
}

/// A file the database claims but the filesystem lacks.
#[derive(Debug)]
pub struct MissingFinding {
    /// Resolved path under the root.
    pub path: String,
    /// Every package still claiming the database path.
    pub claimed_by: BTreeSet<String>,
}

/// Packages whose file list matches `pattern` (matched against the
/// absolute, `/`-rooted database path). An invalid pattern owns
/// nothing.
pub fn find_owners(packages: &Catalogue, pattern: &str) -> BTreeSet<String> {
    let regex = match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(_) => return BTreeSet::new(),
    };

    let mut owners = BTreeSet::new();
    for (name, meta) in packages {
        for file in &meta.files {
            if regex.is_match(&format!("/{}", file)) {
                owners.insert(name.clone());
                break;
            }
        }
    }
    owners
}

/// Audit every symlink the package owns.
pub fn check_links(engine: &Engine, name: &str) -> Vec<LinkFinding> {
    let mut findings = Vec::new();

    let Some(files) = engine.files_of(name) else {
        return findings;
    };

    for file in files {
        let full = fsutil::normalize(&format!("{}{}", engine.root(), file));

        let Ok(meta) = fs::symlink_metadata(&full) else {
            continue;
        };
        if !meta.file_type().is_symlink() {
            continue;
        }
        let Ok(target) = fs::read_link(&full) else {
            continue;
        };
        let target = target.to_string_lossy().into_owned();

        // Resolve one hop: absolute targets land under the root,
        // relative ones next to the link.
        let immediate = if target.starts_with('/') {
            fsutil::normalize(&format!("{}{}", engine.root(), target))
        } else {
            let parent = Path::new(&full)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            fsutil::normalize(&format!("{}/{}", parent, target))
        };

        if !fsutil::exists(&immediate) {
            findings.push(LinkFinding {
                path: full,
                target,
                kind: LinkKind::Broken,
            });
            continue;
        }

        let immediate_owners =
            find_owners(engine.packages(), &regex::escape(&db_path(engine, &immediate)));

        let resolved = fs::canonicalize(&immediate)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| immediate.clone());
        let resolved_owners =
            find_owners(engine.packages(), &regex::escape(&db_path(engine, &resolved)));

        if immediate_owners.contains(name) || resolved_owners.contains(name) {
            continue;
        }

        findings.push(LinkFinding {
            path: full,
            target,
            kind: LinkKind::Foreign {
                immediate_owners,
                resolved_owners,
            },
        });
    }

    findings
}

/// Report every file of the package that no longer exists under the
/// root, with the packages still claiming it.
pub fn check_disappeared(engine: &Engine, name: &str) -> Vec<MissingFinding> {
    let mut findings = Vec::new();

    let Some(files) = engine.files_of(name) else {
        return findings;
    };

    for file in files {
        let full = fsutil::normalize(&format!("{}{}", engine.root(), file));
        if fsutil::exists(&full) {
            continue;
        }

        let claimed_by = engine
            .packages()
            .iter()
            .filter(|(_, meta)| meta.files.contains(file))
            .map(|(owner, _)| owner.clone())
            .collect();

        findings.push(MissingFinding {
            path: full,
            claimed_by,
        });
    }

    findings
}

/// Map a filesystem path back to the absolute `/`-rooted form the
/// catalogue stores, stripping the engine's root prefix.
fn db_path(engine: &Engine, full: &str) -> String {
    match full.strip_prefix(engine.root()) {
        Some(rest) => format!("/{}", rest),
        None => full.to_string(),
    }
}

/// Join owner names for display; an empty set reads `none`.
pub fn join_owners(owners: &BTreeSet<String>) -> String {
    if owners.is_empty() {
        "none".to_string()
    } else {
        owners.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PackageMeta, PKG_DB, PKG_DIR};
    use std::os::unix::fs::symlink;

    fn meta(version: &str, files: &[&str]) -> PackageMeta {
        PackageMeta {
            version: version.to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn engine_with(
        dir: &tempfile::TempDir,
        packages: &[(&str, PackageMeta)],
    ) -> Engine {
        fs::create_dir_all(dir.path().join(PKG_DIR)).unwrap();
        fs::write(dir.path().join(PKG_DB), b"").unwrap();
        let mut engine = Engine::open(dir.path().to_str().unwrap()).unwrap();
        for (name, meta) in packages {
            engine.add_package(name, meta.clone());
        }
        engine
    }

    #[test]
    fn broken_symlink_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("usr/lib")).unwrap();
        symlink("libfoo.so.1", dir.path().join("usr/lib/libfoo.so")).unwrap();

        let engine = engine_with(
            &dir,
            &[("foo", meta("1", &["usr/", "usr/lib/", "usr/lib/libfoo.so"]))],
        );

        let findings = check_links(&engine, "foo");
        assert_eq!(findings.len(), 1);
        assert!(matches!(findings[0].kind, LinkKind::Broken));
        assert_eq!(findings[0].target, "libfoo.so.1");
    }

    #[test]
    fn self_owned_symlink_target_passes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("usr/lib")).unwrap();
        fs::write(dir.path().join("usr/lib/libfoo.so.1"), b"elf").unwrap();
        symlink("libfoo.so.1", dir.path().join("usr/lib/libfoo.so")).unwrap();

        let engine = engine_with(
            &dir,
            &[(
                "foo",
                meta("1", &["usr/lib/libfoo.so", "usr/lib/libfoo.so.1"]),
            )],
        );

        assert!(check_links(&engine, "foo").is_empty());
    }

    #[test]
    fn foreign_symlink_target_is_flagged_with_owners() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("usr/lib")).unwrap();
        fs::write(dir.path().join("usr/lib/libbar.so.1"), b"elf").unwrap();
        symlink("libbar.so.1", dir.path().join("usr/lib/libfoo.so")).unwrap();

        let engine = engine_with(
            &dir,
            &[
                ("foo", meta("1", &["usr/lib/libfoo.so"])),
                ("bar", meta("1", &["usr/lib/libbar.so.1"])),
            ],
        );

        let findings = check_links(&engine, "foo");
        assert_eq!(findings.len(), 1);
        match &findings[0].kind {
            LinkKind::Foreign {
                immediate_owners, ..
            } => assert!(immediate_owners.contains("bar")),
            other => panic!("unexpected finding: {:?}", other),
        }
    }

    #[test]
    fn disappeared_files_list_claimants() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/present"), b"ok").unwrap();

        let engine = engine_with(
            &dir,
            &[
                ("foo", meta("1", &["bin/present", "bin/gone"])),
                ("bar", meta("1", &["bin/gone"])),
            ],
        );

        let findings = check_disappeared(&engine, "foo");
        assert_eq!(findings.len(), 1);
        assert!(findings[0].path.ends_with("bin/gone"));
        assert_eq!(join_owners(&findings[0].claimed_by), "bar,foo");
    }

    #[test]
    fn owner_search_matches_literal_paths() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(&dir, &[("foo", meta("1", &["usr/bin/f+oo"]))]);

        let owners = find_owners(engine.packages(), &regex::escape("/usr/bin/f+oo"));
        assert!(owners.contains("foo"));

        assert!(find_owners(engine.packages(), "(unclosed").is_empty());
    }
}
