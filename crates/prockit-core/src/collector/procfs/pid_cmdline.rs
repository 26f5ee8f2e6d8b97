//! Parser for `/proc/<pid>/cmdline` and `/proc/<pid>/task/<tid>/cmdline`.
//!
//! The result is meant to be used as a label value in a text exposition
//! format: arguments are joined by a space and `\`, `"` and newline are
//! escaped. A command line longer than the read limit ends in `...`.

use std::path::{Path, PathBuf};

use crate::collector::bufpool::{READ_BUF_POOL_64K, ReadBufPool};
use crate::collector::procfs::pid::{PID_ONLY_TID, pid_file_path};
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::{ProcfsError, Result};

static PID_CMDLINE_READ_BUF_POOL: &ReadBufPool = &READ_BUF_POOL_64K;

const fn cmdline_byte_convert() -> [Option<&'static [u8]>; 256] {
    let mut table: [Option<&'static [u8]>; 256] = [None; 256];
    table[0] = Some(b" ");
    table[b'\n' as usize] = Some(b"\\n");
    table[b'\\' as usize] = Some(b"\\\\");
    table[b'"' as usize] = Some(b"\\\"");
    table
}

static CMDLINE_BYTE_CONVERT: [Option<&[u8]>; 256] = cmdline_byte_convert();

#[derive(Debug)]
pub struct PidCmdline<F: FileSystem = RealFs> {
    fs: F,
    procfs_root: PathBuf,
    path: PathBuf,
    pool: &'static ReadBufPool,
    cmdline: Vec<u8>,
}

impl PidCmdline<RealFs> {
    pub fn new(procfs_root: impl AsRef<Path>) -> Self {
        Self::with_fs(RealFs::new(), procfs_root)
    }
}

impl<F: FileSystem + Clone> PidCmdline<F> {
    pub fn with_fs(fs: F, procfs_root: impl AsRef<Path>) -> Self {
        let procfs_root = procfs_root.as_ref().to_path_buf();
        Self {
            fs,
            path: pid_file_path(&procfs_root, 0, PID_ONLY_TID, "cmdline"),
            procfs_root,
            pool: PID_CMDLINE_READ_BUF_POOL,
            cmdline: Vec::new(),
        }
    }

    /// Reads through `pool` instead of the default 64 KiB one; its
    /// `max_read_size` sets the truncation threshold.
    pub fn with_pool(mut self, pool: &'static ReadBufPool) -> Self {
        self.pool = pool;
        self
    }

    /// Path of the last file read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The sanitized command line from the last successful parse.
    pub fn cmdline(&self) -> &[u8] {
        &self.cmdline
    }

    /// Reads the command line of `pid`, or of its thread `tid` unless
    /// `tid == PID_ONLY_TID`. Truncation is not an error.
    pub fn parse(&mut self, pid: i32, tid: i32) -> Result<()> {
        self.path = pid_file_path(&self.procfs_root, pid, tid, "cmdline");
        let mut buf = self
            .pool
            .read_file(&self.fs, &self.path)
            .map_err(|e| ProcfsError::io(&self.path, e))?;

        let mut l = buf.len();
        if buf.truncated() && l >= 3 {
            // Back up to the start of a UTF-8 sequence, continuation bytes
            // being 10xxxxxx, and no more than 3 bytes past the cut.
            let mut pos = l - 3;
            while pos > 0 && pos + 6 > l && buf[pos] & 0b1100_0000 == 0b1000_0000 {
                pos -= 1;
            }
            l = pos + 3;
            buf[pos..l].fill(b'.');
        }
        while l > 0 && buf[l - 1] == 0 {
            l -= 1;
        }

        self.cmdline.clear();
        let mut pos = 0;
        while pos < l {
            let stretch_start = pos;
            let mut convert = None;
            while pos < l {
                convert = CMDLINE_BYTE_CONVERT[buf[pos] as usize];
                if convert.is_some() {
                    break;
                }
                pos += 1;
            }
            self.cmdline.extend_from_slice(&buf[stretch_start..pos]);
            if let Some(convert) = convert {
                self.cmdline.extend_from_slice(convert);
                pos += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    static TINY_READ_BUF_POOL: ReadBufPool = ReadBufPool::new(4, 8);

    fn parse(content: &[u8]) -> Vec<u8> {
        let fs = MockFs::new();
        fs.add_file("/proc/42/cmdline", content);
        let mut pid_cmdline = PidCmdline::with_fs(fs, "/proc");
        pid_cmdline.parse(42, PID_ONLY_TID).unwrap();
        pid_cmdline.cmdline().to_vec()
    }

    fn parse_tiny(content: &[u8]) -> Vec<u8> {
        let fs = MockFs::new();
        fs.add_file("/proc/42/task/43/cmdline", content);
        let mut pid_cmdline = PidCmdline::with_fs(fs, "/proc").with_pool(&TINY_READ_BUF_POOL);
        pid_cmdline.parse(42, 43).unwrap();
        pid_cmdline.cmdline().to_vec()
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(parse(b"/bin/sh\0-c\0echo hi\0"), b"/bin/sh -c echo hi");
        assert_eq!(parse(b"a\\b\0\"q\"\0line\nbreak\0\0"), br#"a\\b \"q\" line\nbreak"#);
        assert_eq!(parse(b""), b"");
        assert_eq!(parse("dæmon\0".as_bytes()), "dæmon".as_bytes());
    }

    #[test]
    fn test_truncation_utf8_boundary() {
        assert_eq!(parse_tiny("Hello\0世界\0".as_bytes()), b"Hello...");
    }

    #[test]
    fn test_truncation_ascii() {
        assert_eq!(parse_tiny(b"abcdefghijkl"), b"abcde...");
        // Exactly at the threshold still counts as truncated.
        assert_eq!(parse_tiny(b"abcdefgh"), b"abcde...");
        assert_eq!(parse_tiny(b"abcdefg"), b"abcdefg");
    }

    #[test]
    fn test_missing_process() {
        let mut pid_cmdline = PidCmdline::with_fs(MockFs::new(), "/proc");
        let err = pid_cmdline.parse(7, PID_ONLY_TID).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(pid_cmdline.path(), Path::new("/proc/7/cmdline"));
    }
}
