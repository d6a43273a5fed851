//! Streaming MD5 fingerprinting of file contents.
//!
//! # Overview
//!
//! A fingerprint is the lowercase hex MD5 digest of a file's entire
//! contents. Files are read in fixed-size chunks, so memory use is bounded
//! by the chunk size regardless of file size.
//!
//! Fingerprints identify duplicate *content*; two files with equal digests
//! are treated as duplicates. MD5 is not collision-resistant against an
//! adversary, but is adequate for accidental-duplicate detection and keeps
//! digests short enough to index comfortably.
//!
//! # Example
//!
//! ```no_run
//! use dupindex::fingerprint::fingerprint_file;
//! use std::path::Path;
//!
//! let digest = fingerprint_file(Path::new("/etc/hosts"))?;
//! println!("{digest}");
//! # Ok::<(), dupindex::fingerprint::FingerprintError>(())
//! ```

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

/// Chunk size for streaming reads.
pub const CHUNK_SIZE: usize = 8192;

/// Errors that can occur while fingerprinting a file.
#[derive(thiserror::Error, Debug)]
pub enum FingerprintError {
    /// The file was not found (it may have vanished after discovery).
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    /// Permission was denied when opening or reading the file.
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// Any other I/O error while reading the file.
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl FingerprintError {
    fn from_io(path: &Path, source: std::io::Error) -> Self {
        match source.kind() {
            ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => Self::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

/// Compute the fingerprint of a file's contents.
///
/// Reads the file in [`CHUNK_SIZE`] chunks and returns the lowercase hex
/// MD5 digest. Errors always propagate; a file that cannot be read is never
/// silently recorded as indexed.
pub fn fingerprint_file(path: &Path) -> Result<String, FingerprintError> {
    let file = File::open(path).map_err(|e| FingerprintError::from_io(path, e))?;
    fingerprint_reader(file).map_err(|e| FingerprintError::from_io(path, e))
}

/// Compute the fingerprint of an arbitrary byte stream.
///
/// Deterministic and side-effect-free: the same bytes always produce the
/// same digest, regardless of how the reader chunks them.
pub fn fingerprint_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Md5::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}
