// src/archive.rs

//! Package archive reader.
//!
//! Packages are tar archives named `<name>#<version>.pkg.tar[.<comp>]`
//! with optional gzip, bzip2, xz, lzip or zstd compression. The reader
//! parses the filename into name and version, enumerates entries
//! without reading file data, and hands the install engine a tar
//! stream over the right decoder.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use tar::{Archive, EntryType, Header};
use tracing::debug;
use xz2::read::XzDecoder;

use crate::db::PackageMeta;
use crate::{Error, Result};

/// Package archive extension, before the optional compressor suffix.
pub const PKG_EXT: &str = ".pkg.tar";
/// Delimiter between name and version in a package filename.
pub const VERSION_DELIM: char = '#';

/// Package compression format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Lzip,
    Zstd,
}

fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Parse a package filename into `(name, version)`.
///
/// The name is everything before the first `#`, the version everything
/// after it up to the last `.pkg.tar` occurrence. Either being empty
/// is a [`Error::BadPackageName`].
pub fn parse_package_filename(path: &str) -> Result<(String, String)> {
    let base = basename(path);

    let bad = || Error::BadPackageName(base.to_string());

    let delim = base.find(VERSION_DELIM).ok_or_else(bad)?;
    let name = &base[..delim];

    let version = match base.rfind(PKG_EXT) {
        Some(ext) if ext > delim => &base[delim + 1..ext],
        Some(_) => "",
        None => &base[delim + 1..],
    };

    if name.is_empty() || version.is_empty() {
        return Err(bad());
    }

    Ok((name.to_string(), version.to_string()))
}

fn detect_compression(path: &Path) -> Result<Compression> {
    let base = basename(&path.to_string_lossy()).to_string();

    let ext = base.rfind(PKG_EXT).map(|pos| base[pos + PKG_EXT.len()..].to_string());
    match ext.as_deref() {
        Some("") => Ok(Compression::None),
        Some(".gz") => Ok(Compression::Gzip),
        Some(".bz2") => Ok(Compression::Bzip2),
        Some(".xz") => Ok(Compression::Xz),
        Some(".lz") => Ok(Compression::Lzip),
        Some(".zst") => Ok(Compression::Zstd),
        _ => Err(Error::ArchiveOpen {
            path: path.to_path_buf(),
            reason: format!(
                "unsupported package format, expected {}[.gz|.bz2|.xz|.lz|.zst]",
                PKG_EXT
            ),
        }),
    }
}

/// Open a package archive as a tar stream over the right decoder.
pub fn open_reader(path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let compression = detect_compression(path)?;

    let open_err = |reason: String| Error::ArchiveOpen {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|e| open_err(e.to_string()))?;

    let reader: Box<dyn Read> = match compression {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(GzDecoder::new(file)),
        Compression::Bzip2 => Box::new(BzDecoder::new(file)),
        Compression::Xz => Box::new(XzDecoder::new(file)),
        Compression::Zstd => {
            Box::new(zstd::Decoder::new(file).map_err(|e| open_err(e.to_string()))?)
        }
        Compression::Lzip => {
            return Err(open_err(
                "lzip-compressed archives are not supported by this build".to_string(),
            ))
        }
    };

    Ok(Archive::new(reader))
}

/// Open a package archive and collect its name, version and file list.
///
/// Walks the archive headers once, skipping file data. An archive with
/// zero entries is an [`Error::EmptyPackage`].
pub fn open_pkg(path: &Path) -> Result<(String, PackageMeta)> {
    let (name, version) = parse_package_filename(&path.to_string_lossy())?;

    let mut info = PackageMeta {
        version,
        files: Default::default(),
    };

    let read_err = |source: std::io::Error| Error::ArchiveRead {
        path: path.to_path_buf(),
        source,
    };

    let mut archive = open_reader(path)?;
    let mut count = 0usize;
    for entry in archive.entries().map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        info.files
            .insert(String::from_utf8_lossy(&entry.path_bytes()).into_owned());
        count += 1;
    }

    if count == 0 {
        return Err(Error::EmptyPackage(path.to_path_buf()));
    }

    debug!("opened {}: {} files", name, info.files.len());
    Ok((name, info))
}

/// Full mode value (file-type bits plus permission bits) for a tar
/// header. Tar stores only permission bits in the mode field; the
/// type lives in the entry-type byte.
pub fn entry_mode(header: &Header) -> std::io::Result<u32> {
    let perms = header.mode()? & 0o7777;
    let type_bits = match header.entry_type() {
        EntryType::Directory => 0o040000,
        EntryType::Symlink => 0o120000,
        EntryType::Char => 0o020000,
        EntryType::Block => 0o060000,
        EntryType::Fifo => 0o010000,
        // hard links and regular variants report as regular files
        _ => 0o100000,
    };
    Ok(type_bits | perms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_version() {
        let (name, version) = parse_package_filename("foo#1.0.pkg.tar.gz").unwrap();
        assert_eq!(name, "foo");
        assert_eq!(version, "1.0");
    }

    #[test]
    fn parses_with_leading_directories() {
        let (name, version) =
            parse_package_filename("/srv/pkgs/gcc-libs#12.2.0-1.pkg.tar.zst").unwrap();
        assert_eq!(name, "gcc-libs");
        assert_eq!(version, "12.2.0-1");
    }

    #[test]
    fn version_may_contain_hashes_and_dots() {
        let (name, version) = parse_package_filename("tool#1.0#rc1.pkg.tar.xz").unwrap();
        assert_eq!(name, "tool");
        assert_eq!(version, "1.0#rc1");
    }

    #[test]
    fn uncompressed_archives_parse() {
        let (name, version) = parse_package_filename("foo#1.0.pkg.tar").unwrap();
        assert_eq!(name, "foo");
        assert_eq!(version, "1.0");
    }

    #[test]
    fn missing_delimiter_is_rejected() {
        assert!(matches!(
            parse_package_filename("foo-1.0.pkg.tar.gz"),
            Err(Error::BadPackageName(_))
        ));
    }

    #[test]
    fn empty_name_or_version_is_rejected() {
        assert!(matches!(
            parse_package_filename("#1.0.pkg.tar.gz"),
            Err(Error::BadPackageName(_))
        ));
        assert!(matches!(
            parse_package_filename("foo#.pkg.tar.gz"),
            Err(Error::BadPackageName(_))
        ));
    }

    #[test]
    fn compression_detection() {
        assert_eq!(
            detect_compression(Path::new("a#1.pkg.tar.gz")).unwrap(),
            Compression::Gzip
        );
        assert_eq!(
            detect_compression(Path::new("a#1.pkg.tar.bz2")).unwrap(),
            Compression::Bzip2
        );
        assert_eq!(
            detect_compression(Path::new("a#1.pkg.tar.xz")).unwrap(),
            Compression::Xz
        );
        assert_eq!(
            detect_compression(Path::new("a#1.pkg.tar.zst")).unwrap(),
            Compression::Zstd
        );
        assert_eq!(
            detect_compression(Path::new("a#1.pkg.tar")).unwrap(),
            Compression::None
        );
        assert!(detect_compression(Path::new("a#1.tar.7z")).is_err());
    }

    #[test]
    fn entry_mode_synthesizes_type_bits() {
        let mut header = Header::new_gnu();
        header.set_mode(0o755);
        header.set_entry_type(EntryType::Directory);
        assert_eq!(entry_mode(&header).unwrap(), 0o040755);

        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        assert_eq!(entry_mode(&header).unwrap(), 0o100644);

        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        assert_eq!(entry_mode(&header).unwrap(), 0o120777);
    }
}
