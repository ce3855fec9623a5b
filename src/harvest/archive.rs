//! In-memory archive extraction with a cumulative size ceiling.
//!
//! Zip (wheels) and tar+gzip (npm tarballs, sdists) are enumerated behind one
//! interface. Nothing is written to disk. Every member is checked against the
//! remaining byte budget twice:
//! - before reading, using the size declared in the member header
//! - while reading, by capping the read at `remaining + 1` bytes, so a header
//!   that lies about its size still cannot push the total past the ceiling
//!
//! Member names that would escape the archive root (`..`, absolute paths)
//! are skipped with a warning.

use std::io::{Cursor, Read};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::{debug, warn};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Expanding the archive would exceed the configured ceiling
    #[error("Archive exceeds ceiling of {ceiling} bytes (reached {attempted})")]
    CeilingExceeded { ceiling: u64, attempted: u64 },

    /// Neither zip nor gzip magic bytes were found
    #[error("Unsupported archive format")]
    UnsupportedFormat,

    /// The container itself is damaged
    #[error("Corrupted archive: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        ArchiveError::Corrupt(e.to_string())
    }
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(e: zip::result::ZipError) -> Self {
        ArchiveError::Corrupt(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Detects the container format from magic bytes.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(ZIP_MAGIC) {
            Some(ArchiveFormat::Zip)
        } else if bytes.starts_with(GZIP_MAGIC) {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

/// One regular file read from an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    /// Normalized relative path (forward slashes, no leading `./`)
    pub path: String,
    pub data: Vec<u8>,
}

/// Regular-file members of an archive, in archive order.
#[derive(Debug, Default)]
pub struct ExtractedArchive {
    members: Vec<ArchiveMember>,
    total_bytes: u64,
    skipped: usize,
}

impl ExtractedArchive {
    pub fn find(&self, path: &str) -> Option<&ArchiveMember> {
        self.members.iter().find(|m| m.path == path)
    }

    /// First member whose path ends with `suffix` on a path-segment boundary.
    pub fn find_suffix(&self, suffix: &str) -> Option<&ArchiveMember> {
        self.members.iter().find(|m| {
            m.path == suffix
                || m.path
                    .strip_suffix(suffix)
                    .map(|prefix| prefix.ends_with('/'))
                    .unwrap_or(false)
        })
    }

    /// Member contents decoded as UTF-8.
    pub fn text(&self, path: &str) -> Option<&str> {
        self.find(path)
            .and_then(|m| std::str::from_utf8(&m.data).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArchiveMember> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Uncompressed bytes materialized.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Members dropped by the path guard.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn push(&mut self, path: String, data: Vec<u8>) {
        self.total_bytes += data.len() as u64;
        self.members.push(ArchiveMember { path, data });
    }
}

/// Normalizes a member name, rejecting any path that escapes the root.
///
/// Returns `None` for `..` components, absolute paths and empty names.
pub fn safe_member_path(raw: &str) -> Option<String> {
    let unified = raw.replace('\\', "/");
    let path = Path::new(&unified);
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Extractor bound to one byte ceiling.
#[derive(Debug, Clone, Copy)]
pub struct SafeArchiveExtractor {
    ceiling: u64,
}

impl SafeArchiveExtractor {
    pub fn new(ceiling: u64) -> Self {
        Self { ceiling }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Extracts every regular file of `bytes` into memory.
    ///
    /// # Errors
    ///
    /// - [`ArchiveError::UnsupportedFormat`] if the magic bytes are unknown
    /// - [`ArchiveError::CeilingExceeded`] as soon as the next member would
    ///   overflow the ceiling; members after it are never read
    /// - [`ArchiveError::Corrupt`] if the container cannot be decoded
    pub fn extract(&self, bytes: &[u8]) -> Result<ExtractedArchive, ArchiveError> {
        match ArchiveFormat::detect(bytes) {
            Some(ArchiveFormat::Zip) => self.extract_zip(bytes),
            Some(ArchiveFormat::TarGz) => self.extract_tar_gz(bytes),
            None => Err(ArchiveError::UnsupportedFormat),
        }
    }

    fn remaining(&self, out: &ExtractedArchive) -> u64 {
        self.ceiling.saturating_sub(out.total_bytes)
    }

    /// Reads one member under the remaining budget.
    fn read_bounded<R: Read>(
        &self,
        out: &ExtractedArchive,
        declared: u64,
        reader: R,
    ) -> Result<Vec<u8>, ArchiveError> {
        let remaining = self.remaining(out);
        if declared > remaining {
            return Err(ArchiveError::CeilingExceeded {
                ceiling: self.ceiling,
                attempted: out.total_bytes.saturating_add(declared),
            });
        }

        let mut data = Vec::with_capacity(declared.min(1 << 20) as usize);
        reader.take(remaining.saturating_add(1)).read_to_end(&mut data)?;
        if data.len() as u64 > remaining {
            return Err(ArchiveError::CeilingExceeded {
                ceiling: self.ceiling,
                attempted: out.total_bytes.saturating_add(data.len() as u64),
            });
        }
        Ok(data)
    }

    fn extract_zip(&self, bytes: &[u8]) -> Result<ExtractedArchive, ArchiveError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut out = ExtractedArchive::default();

        for index in 0..archive.len() {
            let file = archive.by_index(index)?;
            if !file.is_file() {
                continue;
            }
            let name = file.name().to_string();
            let Some(path) = safe_member_path(&name) else {
                warn!(member = %name, "Skipping archive member outside root");
                out.skipped += 1;
                continue;
            };
            let declared = file.size();
            let data = self.read_bounded(&out, declared, file)?;
            out.push(path, data);
        }

        debug!(
            members = out.len(),
            total_bytes = out.total_bytes,
            "Zip archive extracted"
        );
        Ok(out)
    }

    fn extract_tar_gz(&self, bytes: &[u8]) -> Result<ExtractedArchive, ArchiveError> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        let mut out = ExtractedArchive::default();

        for entry in archive.entries()? {
            let entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path()?.to_string_lossy().into_owned();
            let Some(path) = safe_member_path(&name) else {
                warn!(member = %name, "Skipping archive member outside root");
                out.skipped += 1;
                continue;
            };
            let declared = entry.header().size()?;
            let data = self.read_bounded(&out, declared, entry)?;
            out.push(path, data);
        }

        debug!(
            members = out.len(),
            total_bytes = out.total_bytes,
            "Tar archive extracted"
        );
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// Builds a `.tar.gz` from `(path, contents)` pairs.
    pub(crate) fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    /// Builds a `.zip` from `(path, contents)` pairs.
    pub(crate) fn zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (path, data) in files {
            writer.start_file(*path, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extract_tar_gz_members() {
        let bytes = tar_gz(&[
            ("package/package.json", br#"{"name":"demo"}"#),
            ("package/index.js", b"module.exports = 1;"),
        ]);
        let archive = SafeArchiveExtractor::new(1024).extract(&bytes).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.text("package/package.json"), Some(r#"{"name":"demo"}"#));
        assert!(archive.find_suffix("index.js").is_some());
        assert!(archive.find_suffix("dex.js").is_none());
    }

    #[test]
    fn test_extract_zip_members() {
        let bytes = zip(&[
            ("demo-1.0.dist-info/METADATA", b"Name: demo\n"),
            ("demo/__init__.py", b""),
        ]);
        let archive = SafeArchiveExtractor::new(1024).extract(&bytes).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.total_bytes(), 11);
    }

    #[test]
    fn test_ceiling_aborts_before_overflowing_member() {
        let big = vec![b'a'; 600];
        let bytes = tar_gz(&[
            ("package/a.txt", &big[..]),
            ("package/b.txt", &big[..]),
            ("package/c.txt", b"never read"),
        ]);
        let err = SafeArchiveExtractor::new(1000).extract(&bytes).unwrap_err();
        match err {
            ArchiveError::CeilingExceeded { ceiling, attempted } => {
                assert_eq!(ceiling, 1000);
                assert_eq!(attempted, 1200);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zip_bomb_is_rejected() {
        let zeros = vec![0u8; 64 * 1024];
        let bytes = zip(&[("bomb.bin", &zeros[..])]);
        assert!(bytes.len() < zeros.len() / 10);
        let err = SafeArchiveExtractor::new(4096).extract(&bytes).unwrap_err();
        assert!(matches!(err, ArchiveError::CeilingExceeded { .. }));
    }

    #[test]
    fn test_exact_ceiling_is_allowed() {
        let bytes = zip(&[("a", b"12345"), ("b", b"67890")]);
        let archive = SafeArchiveExtractor::new(10).extract(&bytes).unwrap();
        assert_eq!(archive.total_bytes(), 10);
    }

    #[test]
    fn test_traversal_members_are_skipped() {
        let bytes = zip(&[("../../etc/passwd", b"root"), ("ok/file.txt", b"fine")]);
        let archive = SafeArchiveExtractor::new(1024).extract(&bytes).unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.skipped(), 1);
        assert!(archive.find("ok/file.txt").is_some());
    }

    #[test]
    fn test_safe_member_path() {
        assert_eq!(safe_member_path("./package/a.js").as_deref(), Some("package/a.js"));
        assert_eq!(safe_member_path("a\\b.py").as_deref(), Some("a/b.py"));
        assert!(safe_member_path("/etc/passwd").is_none());
        assert!(safe_member_path("pkg/../../x").is_none());
        assert!(safe_member_path("").is_none());
    }

    #[test]
    fn test_unknown_format() {
        let err = SafeArchiveExtractor::new(10).extract(b"plain text").unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedFormat));
    }
}
