//! Abstractions for filesystem access to enable testing and mocking.
//!
//! The `FileSystem` trait allows the parsers to work with both the real `/proc`
//! filesystem on Linux and the in-memory `MockFs` in tests or on other platforms.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Abstraction for filesystem operations.
///
/// Parsers only need whole-file reads into a caller-supplied buffer and
/// directory listings.
pub trait FileSystem: Send + Sync {
    /// Appends the contents of a file to `buf`.
    ///
    /// # Arguments
    /// * `path` - Path to the file to read
    /// * `buf` - Destination; existing content is kept and new bytes are appended
    /// * `limit` - Maximum number of bytes to read, `0` for no limit
    ///
    /// # Returns
    /// The number of bytes appended, or an I/O error if the file cannot be read.
    fn read_into(&self, path: &Path, buf: &mut Vec<u8>, limit: usize) -> io::Result<usize>;

    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let mut buf = Vec::new();
        self.read_into(path, &mut buf, 0)?;
        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Checks if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory.
    ///
    /// # Returns
    /// A vector of paths to entries in the directory, or an I/O error.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Real filesystem implementation that delegates to `std::fs`.
///
/// Use this in production to read from the actual `/proc` filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    /// Creates a new `RealFs` instance.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_into(&self, path: &Path, buf: &mut Vec<u8>, limit: usize) -> io::Result<usize> {
        let file = File::open(path)?;
        if limit > 0 {
            // procfs reports a zero length, so size the buffer from the limit.
            buf.reserve(limit);
            file.take(limit as u64).read_to_end(buf)
        } else {
            let mut file = file;
            file.read_to_end(buf)
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }
}
