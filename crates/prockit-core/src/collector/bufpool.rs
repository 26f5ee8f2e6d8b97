//! Size-bucketed pool of reusable read buffers.
//!
//! Every parser reads its file in one go into a buffer taken from a pool and
//! hands it back once the content is decoded. Buffers keep their capacity, so
//! after warm-up a scan does not allocate for file content at all.
//!
//! A pool is configured with `(max_pooled, max_read_size)`:
//! - `max_pooled` caps the number of idle buffers kept (`0` = no cap);
//! - `max_read_size` caps how much of a file is read (`0` = whole file). A read
//!   that fills the cap is reported as potentially truncated.

use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::collector::traits::FileSystem;
use crate::error::{ProcfsError, Result};

pub const READ_BUF_POOL_MAX_READ_SIZE_UNBOUND: usize = 0;

pub static READ_BUF_POOL_16K: ReadBufPool = ReadBufPool::new(32, 0x4000);
pub static READ_BUF_POOL_32K: ReadBufPool = ReadBufPool::new(32, 0x8000);
pub static READ_BUF_POOL_64K: ReadBufPool = ReadBufPool::new(32, 0x10000);
pub static READ_BUF_POOL_128K: ReadBufPool = ReadBufPool::new(16, 0x20000);
pub static READ_BUF_POOL_256K: ReadBufPool = ReadBufPool::new(8, 0x40000);
pub static READ_BUF_POOL_1M: ReadBufPool = ReadBufPool::new(4, 0x100000);
pub static READ_BUF_POOL_UNBOUND: ReadBufPool =
    ReadBufPool::new(4, READ_BUF_POOL_MAX_READ_SIZE_UNBOUND);

/// Bounded free-list of growable byte buffers.
pub struct ReadBufPool {
    max_pooled: usize,
    max_read_size: usize,
    pool: Mutex<Vec<Vec<u8>>>,
}

impl ReadBufPool {
    /// Creates an empty pool; usable in `static` items.
    pub const fn new(max_pooled: usize, max_read_size: usize) -> Self {
        Self {
            max_pooled,
            max_read_size,
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn max_pooled(&self) -> usize {
        self.max_pooled
    }

    pub fn max_read_size(&self) -> usize {
        self.max_read_size
    }

    /// Number of idle buffers currently held.
    pub fn pooled(&self) -> usize {
        self.lock().len()
    }

    // Buffers carry no invariant a panicking holder could break, so a
    // poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns an empty buffer, reusing the most recently returned one if any.
    pub fn get_buf(&self) -> Vec<u8> {
        self.lock().pop().unwrap_or_default()
    }

    /// Resets `buf` to zero length and keeps it for reuse, unless the pool
    /// already holds `max_pooled` buffers, in which case it is dropped.
    pub fn return_buf(&self, mut buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }
        buf.clear();
        let mut pool = self.lock();
        if self.max_pooled > 0 && pool.len() >= self.max_pooled {
            return;
        }
        pool.push(buf);
    }

    /// Reads a whole file into a pooled buffer.
    ///
    /// The buffer goes back to the pool when the returned guard is dropped,
    /// including on the error path.
    ///
    /// # Arguments
    /// * `fs` - Filesystem to read from
    /// * `path` - Path to the file
    ///
    /// # Returns
    /// A guard dereferencing to the file content. `truncated()` is set when
    /// `max_read_size > 0` and the read filled it.
    pub fn read_file<F: FileSystem + ?Sized>(
        &self,
        fs: &F,
        path: &Path,
    ) -> io::Result<PoolBuf<'_>> {
        let mut buf = PoolBuf {
            buf: self.get_buf(),
            pool: self,
            truncated: false,
        };
        let n = fs.read_into(path, &mut buf.buf, self.max_read_size)?;
        buf.truncated = self.max_read_size > 0 && n >= self.max_read_size;
        Ok(buf)
    }
}

impl ReadBufPool {
    /// Like [`read_file`](Self::read_file), for content that is only usable
    /// whole: a potentially truncated read is a [`ProcfsError::Truncated`].
    pub fn read_complete<F: FileSystem + ?Sized>(
        &self,
        fs: &F,
        path: &Path,
    ) -> Result<PoolBuf<'_>> {
        let buf = self
            .read_file(fs, path)
            .map_err(|e| ProcfsError::io(path, e))?;
        if buf.truncated() {
            return Err(ProcfsError::Truncated {
                path: path.to_path_buf(),
                max_read_size: self.max_read_size,
            });
        }
        Ok(buf)
    }
}

impl fmt::Debug for ReadBufPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadBufPool")
            .field("max_pooled", &self.max_pooled)
            .field("max_read_size", &self.max_read_size)
            .field("pooled", &self.pooled())
            .finish()
    }
}

/// A buffer on loan from a [`ReadBufPool`].
pub struct PoolBuf<'a> {
    buf: Vec<u8>,
    pool: &'a ReadBufPool,
    truncated: bool,
}

impl PoolBuf<'_> {
    /// `true` when the read stopped at the pool's `max_read_size`.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Detaches the buffer from the pool. The caller owns it from now on and
    /// may later hand it back with [`ReadBufPool::return_buf`].
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl fmt::Debug for PoolBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuf")
            .field("len", &self.buf.len())
            .field("truncated", &self.truncated)
            .finish()
    }
}

impl Deref for PoolBuf<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PoolBuf<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PoolBuf<'_> {
    fn drop(&mut self) {
        self.pool.return_buf(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    #[test]
    fn test_get_return_keeps_pool_size() {
        let pool = ReadBufPool::new(2, 0);
        let mut buf = pool.get_buf();
        buf.extend_from_slice(b"hello");
        pool.return_buf(buf);
        assert_eq!(pool.pooled(), 1);

        let buf = pool.get_buf();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 5);
        assert_eq!(pool.pooled(), 0);
        pool.return_buf(buf);
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_return_beyond_max_pooled_drops() {
        let pool = ReadBufPool::new(2, 0);
        for _ in 0..3 {
            pool.return_buf(Vec::with_capacity(16));
        }
        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    fn test_unbounded_idle_list() {
        let pool = ReadBufPool::new(0, 0);
        for _ in 0..10 {
            pool.return_buf(Vec::with_capacity(16));
        }
        assert_eq!(pool.pooled(), 10);
    }

    #[test]
    fn test_read_file_returns_buffer_on_drop() {
        let fs = MockFs::new();
        fs.add_file("/proc/stat", "ctxt 42\n");
        let pool = ReadBufPool::new(4, 0);

        {
            let buf = pool.read_file(&fs, Path::new("/proc/stat")).unwrap();
            assert_eq!(&buf[..], b"ctxt 42\n");
            assert!(!buf.truncated());
            assert_eq!(pool.pooled(), 0);
        }
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_read_file_error_keeps_pool_intact() {
        let fs = MockFs::new();
        let pool = ReadBufPool::new(4, 0);
        pool.return_buf(Vec::with_capacity(64));

        let err = pool.read_file(&fs, Path::new("/proc/missing")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_read_file_truncation() {
        let fs = MockFs::new();
        fs.add_file("/proc/1/cmdline", "0123456789");
        fs.add_file("/proc/2/cmdline", "01234567");
        fs.add_file("/proc/3/cmdline", "0123");
        let pool = ReadBufPool::new(4, 8);

        let buf = pool.read_file(&fs, Path::new("/proc/1/cmdline")).unwrap();
        assert_eq!(&buf[..], b"01234567");
        assert!(buf.truncated());
        drop(buf);

        // Exactly at the limit is indistinguishable from a longer file.
        let buf = pool.read_file(&fs, Path::new("/proc/2/cmdline")).unwrap();
        assert!(buf.truncated());
        drop(buf);

        let buf = pool.read_file(&fs, Path::new("/proc/3/cmdline")).unwrap();
        assert!(!buf.truncated());
    }

    #[test]
    fn test_read_complete() {
        let fs = MockFs::new();
        fs.add_file("/proc/diskstats", "0123456789");
        fs.add_file("/proc/stat", "0123");
        let pool = ReadBufPool::new(4, 8);

        let err = pool
            .read_complete(&fs, Path::new("/proc/diskstats"))
            .unwrap_err();
        assert!(
            matches!(err, ProcfsError::Truncated { max_read_size: 8, .. }),
            "{err}"
        );
        assert_eq!(pool.pooled(), 1);

        let buf = pool.read_complete(&fs, Path::new("/proc/stat")).unwrap();
        assert_eq!(&buf[..], b"0123");
        drop(buf);

        let err = pool
            .read_complete(&fs, Path::new("/proc/missing"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_into_vec_detaches() {
        let fs = MockFs::new();
        fs.add_file("/proc/self/mountinfo", "x");
        let pool = ReadBufPool::new(4, 0);
        let content = pool
            .read_file(&fs, Path::new("/proc/self/mountinfo"))
            .unwrap()
            .into_vec();
        assert_eq!(content, b"x");
        assert_eq!(pool.pooled(), 0);
        pool.return_buf(content);
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_predefined_pools() {
        assert_eq!(READ_BUF_POOL_16K.max_read_size(), 16 * 1024);
        assert_eq!(READ_BUF_POOL_256K.max_pooled(), 8);
        assert_eq!(READ_BUF_POOL_1M.max_read_size(), 1024 * 1024);
        assert_eq!(READ_BUF_POOL_UNBOUND.max_read_size(), 0);
    }
}
