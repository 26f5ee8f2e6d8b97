//! Parser for `/proc/net/dev`.
//!
//! ```text
//! Inter-|   Receive                                                |  Transmit
//!  face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
//!     lo:    6740      68    0    0    0     0          0         0     6740      68    0    0    0     0       0          0
//!   eth0: 1936365    7267    0    0    0     0          0         0 14322183    7122    0    0    0     0       0          0
//! ```
//!
//! The two header lines pin the column layout. They are matched against the
//! known headers on the first parse and then compared byte for byte on every
//! parse after that; the layout cannot change without a new kernel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::collector::bufpool::{READ_BUF_POOL_256K, ReadBufPool};
use crate::collector::procfs::parser::{FieldCursor, decode_u64, is_space, lines, skip_space};
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::{ProcfsError, Result};

pub const NET_DEV_RX_BYTES: usize = 0;
pub const NET_DEV_RX_PACKETS: usize = 1;
pub const NET_DEV_RX_ERRS: usize = 2;
pub const NET_DEV_RX_DROP: usize = 3;
pub const NET_DEV_RX_FIFO: usize = 4;
pub const NET_DEV_RX_FRAME: usize = 5;
pub const NET_DEV_RX_COMPRESSED: usize = 6;
pub const NET_DEV_RX_MULTICAST: usize = 7;
pub const NET_DEV_TX_BYTES: usize = 8;
pub const NET_DEV_TX_PACKETS: usize = 9;
pub const NET_DEV_TX_ERRS: usize = 10;
pub const NET_DEV_TX_DROP: usize = 11;
pub const NET_DEV_TX_FIFO: usize = 12;
pub const NET_DEV_TX_COLLS: usize = 13;
pub const NET_DEV_TX_CARRIER: usize = 14;
pub const NET_DEV_TX_COMPRESSED: usize = 15;

pub const NET_DEV_NUM_STATS: usize = 16;

/// Headers with the column layout above.
pub const NET_DEV_VALID_HEADERS: [&[u8]; 1] = [b"\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
"];

static NET_DEV_READ_BUF_POOL: &ReadBufPool = &READ_BUF_POOL_256K;

/// `dev_index` marker for devices not (yet) seen during the current parse.
const UNSEEN: usize = usize::MAX;

#[derive(Debug)]
pub struct NetDev<F: FileSystem = RealFs> {
    fs: F,
    path: PathBuf,
    pool: &'static ReadBufPool,
    dev_stats: Vec<[u64; NET_DEV_NUM_STATS]>,
    dev_index: HashMap<String, usize>,
    valid_header: Option<Vec<u8>>,
    num_header_lines: usize,
    changed: bool,
}

impl NetDev<RealFs> {
    pub fn new(procfs_root: impl AsRef<Path>) -> Self {
        Self::with_fs(RealFs::new(), procfs_root)
    }
}

impl<F: FileSystem + Clone> NetDev<F> {
    pub fn with_fs(fs: F, procfs_root: impl AsRef<Path>) -> Self {
        Self {
            fs,
            path: procfs_root.as_ref().join("net").join("dev"),
            pool: NET_DEV_READ_BUF_POOL,
            dev_stats: Vec::new(),
            dev_index: HashMap::new(),
            valid_header: None,
            num_header_lines: 0,
            changed: false,
        }
    }

    /// Creates an instance with the same configuration and validated header.
    /// With `full`, the current stats are copied too.
    pub fn sibling(&self, full: bool) -> Self {
        let dev_stats = if full {
            self.dev_stats.clone()
        } else {
            vec![[0; NET_DEV_NUM_STATS]; self.dev_stats.len()]
        };
        Self {
            fs: self.fs.clone(),
            path: self.path.clone(),
            pool: self.pool,
            dev_stats,
            dev_index: self.dev_index.clone(),
            valid_header: self.valid_header.clone(),
            num_header_lines: self.num_header_lines,
            changed: full && self.changed,
        }
    }

    /// Reads through `pool` instead of the default one.
    pub fn with_pool(mut self, pool: &'static ReadBufPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One row per device, in file order.
    pub fn dev_stats(&self) -> &[[u64; NET_DEV_NUM_STATS]] {
        &self.dev_stats
    }

    /// Device name to row in [`dev_stats`](Self::dev_stats).
    pub fn dev_index(&self) -> &HashMap<String, usize> {
        &self.dev_index
    }

    pub fn stats(&self, dev: &str) -> Option<&[u64; NET_DEV_NUM_STATS]> {
        self.dev_index.get(dev).and_then(|&i| self.dev_stats.get(i))
    }

    pub fn valid_header(&self) -> Option<&[u8]> {
        self.valid_header.as_deref()
    }

    pub fn num_header_lines(&self) -> usize {
        self.num_header_lines
    }

    /// `true` if devices appeared or disappeared at the last parse.
    pub fn changed(&self) -> bool {
        self.changed
    }

    fn validate_header(&mut self, buf: &[u8]) -> Result<usize> {
        if let Some(header) = &self.valid_header {
            if !buf.starts_with(header) {
                return Err(ProcfsError::schema(&self.path, "invalid/changed file header"));
            }
            return Ok(header.len());
        }
        let header = NET_DEV_VALID_HEADERS
            .iter()
            .find(|h| buf.starts_with(h))
            .ok_or_else(|| ProcfsError::schema(&self.path, "unsupported file header"))?;
        self.num_header_lines = header.iter().filter(|&&c| c == b'\n').count();
        self.valid_header = Some(header.to_vec());
        debug!(
            "{}: header validated ({} lines)",
            self.path.display(),
            self.num_header_lines
        );
        Ok(header.len())
    }

    pub fn parse(&mut self) -> Result<()> {
        let buf = self.pool.read_complete(&self.fs, &self.path)?;
        let stats_off = self.validate_header(&buf)?;

        for row in self.dev_index.values_mut() {
            *row = UNSEEN;
        }

        let path = &self.path;
        let mut changed = false;
        let mut row = 0;
        for (line_num, _, line) in lines(&buf[stats_off..]) {
            let line_num = line_num + self.num_header_lines;
            let syntax = |reason: String| ProcfsError::syntax(path, line_num, line, reason);

            let start = skip_space(line, 0);
            if start == line.len() {
                continue;
            }
            let name_end = line[start..]
                .iter()
                .position(|&c| c == b':' || is_space(c))
                .map(|i| start + i)
                .filter(|&i| i > start && line[i] == b':');
            let Some(name_end) = name_end else {
                return Err(syntax("missing `DEV:'".into()));
            };
            let dev = std::str::from_utf8(&line[start..name_end])
                .map_err(|_| syntax("missing `DEV:'".into()))?;

            match self.dev_index.get_mut(dev) {
                Some(index) => *index = row,
                None => {
                    self.dev_index.insert(dev.to_owned(), row);
                    changed = true;
                }
            }
            if row == self.dev_stats.len() {
                self.dev_stats.push([0; NET_DEV_NUM_STATS]);
            }
            let stats = &mut self.dev_stats[row];

            let mut fields = FieldCursor::at(line, name_end + 1);
            for (index, stat) in stats.iter_mut().enumerate() {
                let Some(field) = fields.next_field() else {
                    return Err(syntax(format!(
                        "not enough values: want: {}, got: {}",
                        NET_DEV_NUM_STATS, index
                    )));
                };
                *stat = decode_u64(field).ok_or_else(|| syntax("invalid value".into()))?;
            }
            if !fields.at_end() {
                return Err(syntax("unexpected content after dev counters".into()));
            }
            row += 1;
        }

        self.dev_stats.truncate(row);
        let before = self.dev_index.len();
        self.dev_index.retain(|_, row| *row != UNSEEN);
        if self.dev_index.len() != before {
            changed = true;
        }
        self.changed = changed;
        Ok(())
    }
}
