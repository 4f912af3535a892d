// src/footprint.rs

//! Deterministic textual manifest of an archive.
//!
//! Two passes: the first collects every entry's metadata without
//! reading file data, the second sorts by path and prints one line per
//! entry. Symlink permissions differ between filesystems, so symlinks
//! always print `lrwxrwxrwx`; the output is meant to be diffable
//! across builds of the same package.

use std::io::{self, Write};
use std::path::Path;

use nix::unistd::{Gid, Group, Uid, User};

use crate::archive;
use crate::fsutil;
use crate::{Error, Result};

#[derive(Debug)]
struct FootprintEntry {
    path: String,
    soft: Option<String>,
    hard: Option<String>,
    size: u64,
    devmajor: u32,
    devminor: u32,
    uid: u64,
    gid: u64,
    mode: u32,
    regular: bool,
}

/// Print the footprint of the archive at `path` to `out`.
pub fn footprint<W: Write>(path: &Path, out: &mut W) -> Result<()> {
    let read_err = |source: io::Error| Error::ArchiveRead {
        path: path.to_path_buf(),
        source,
    };

    let mut archive = archive::open_reader(path)?;
    let mut files = Vec::new();

    for entry in archive.entries().map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let header = entry.header();
        let entry_type = header.entry_type();

        let link = entry
            .link_name_bytes()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

        files.push(FootprintEntry {
            path: String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
            soft: if entry_type.is_symlink() { link.clone() } else { None },
            hard: if entry_type.is_hard_link() { link } else { None },
            size: header.size().map_err(read_err)?,
            devmajor: header.device_major().map_err(read_err)?.unwrap_or(0),
            devminor: header.device_minor().map_err(read_err)?.unwrap_or(0),
            uid: header.uid().map_err(read_err)?,
            gid: header.gid().map_err(read_err)?,
            mode: archive::entry_mode(header).map_err(read_err)?,
            regular: entry_type.is_file(),
        });
    }

    if files.is_empty() {
        return Err(Error::EmptyPackage(path.to_path_buf()));
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));

    let write_err = |source: io::Error| Error::ArchiveRead {
        path: path.to_path_buf(),
        source,
    };

    for file in &files {
        let perms = if file.soft.is_some() {
            "lrwxrwxrwx".to_string()
        } else if let Some(hard) = &file.hard {
            // hardlinks take the mode of their resolved target
            let mode = match files.binary_search_by(|probe| probe.path.as_str().cmp(hard)) {
                Ok(index) => files[index].mode,
                Err(_) => file.mode,
            };
            fsutil::mode_string(mode)
        } else {
            fsutil::mode_string(file.mode)
        };

        write!(out, "{}\t{}/{}\t{}", perms, user_name(file.uid), group_name(file.gid), file.path)
            .map_err(write_err)?;

        if let Some(soft) = &file.soft {
            write!(out, " -> {}", soft).map_err(write_err)?;
        } else if file.mode & 0o170000 == 0o020000 || file.mode & 0o170000 == 0o060000 {
            write!(out, " ({}, {})", file.devmajor, file.devminor).map_err(write_err)?;
        } else if file.regular && file.size == 0 {
            write!(out, " (EMPTY)").map_err(write_err)?;
        }

        writeln!(out).map_err(write_err)?;
    }

    Ok(())
}

fn user_name(uid: u64) -> String {
    match User::from_uid(Uid::from_raw(uid as u32)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

fn group_name(gid: u64) -> String {
    match Group::from_gid(Gid::from_raw(gid as u32)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}
