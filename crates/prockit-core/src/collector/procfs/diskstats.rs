//! Parser for `/proc/diskstats`.
//!
//! Reference: <https://www.kernel.org/doc/Documentation/admin-guide/iostats.rst>
//!
//! Each line is `major minor name` followed by 10 to 17 counters depending on
//! the kernel version. Devices are keyed by `"major:minor"`; the name is kept
//! alongside for display.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::collector::bufpool::{READ_BUF_POOL_256K, ReadBufPool};
use crate::collector::procfs::parser::{FieldCursor, decode_u32, lines};
use crate::collector::scan::{LastSeen, ScanCounter, evict_stale};
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::{ProcfsError, Result};
use crate::util::host_facts;

pub const DISKSTATS_NUM_READS_COMPLETED: usize = 0;
pub const DISKSTATS_NUM_READS_MERGED: usize = 1;
pub const DISKSTATS_NUM_READ_SECTORS: usize = 2;
pub const DISKSTATS_READ_MILLISEC: usize = 3;
pub const DISKSTATS_NUM_WRITES_COMPLETED: usize = 4;
pub const DISKSTATS_NUM_WRITES_MERGED: usize = 5;
pub const DISKSTATS_NUM_WRITE_SECTORS: usize = 6;
pub const DISKSTATS_WRITE_MILLISEC: usize = 7;
pub const DISKSTATS_NUM_IO_IN_PROGRESS: usize = 8;
pub const DISKSTATS_IO_MILLISEC: usize = 9;
pub const DISKSTATS_IO_WEIGHTED_MILLISEC: usize = 10;
pub const DISKSTATS_NUM_DISCARDS_COMPLETED: usize = 11;
pub const DISKSTATS_NUM_DISCARDS_MERGED: usize = 12;
pub const DISKSTATS_NUM_DISCARD_SECTORS: usize = 13;
pub const DISKSTATS_DISCARD_MILLISEC: usize = 14;
pub const DISKSTATS_NUM_FLUSH_REQUESTS: usize = 15;
pub const DISKSTATS_FLUSH_MILLISEC: usize = 16;

pub const NUM_DISKSTATS_VALUES: usize = 17;

/// Older kernels stop after the I/O counters.
pub const MIN_NUM_DISKSTATS_VALUES: usize = 10;

/// Counters reported in jiffies on 5.x and later kernels.
pub const DISKSTATS_FIELDS_IN_JIFFIES: [bool; NUM_DISKSTATS_VALUES] = {
    let mut fields = [false; NUM_DISKSTATS_VALUES];
    fields[DISKSTATS_IO_MILLISEC] = true;
    fields
};

static DISKSTATS_READ_BUF_POOL: &ReadBufPool = &READ_BUF_POOL_256K;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    pub name: String,
    pub stats: [u32; NUM_DISKSTATS_VALUES],
    last_seen_scan: u64,
}

impl LastSeen for DiskInfo {
    fn last_seen_scan(&self) -> u64 {
        self.last_seen_scan
    }
}

#[derive(Debug)]
pub struct Diskstats<F: FileSystem = RealFs> {
    fs: F,
    path: PathBuf,
    pool: &'static ReadBufPool,
    dev_info: HashMap<String, DiskInfo>,
    changed: bool,
    scan: ScanCounter,
    jiffies_to_ms: u32,
    fields_in_jiffies: [bool; NUM_DISKSTATS_VALUES],
    key_buf: String,
}

impl Diskstats<RealFs> {
    pub fn new(procfs_root: impl AsRef<Path>) -> Self {
        Self::with_fs(RealFs::new(), procfs_root)
    }
}

impl<F: FileSystem + Clone> Diskstats<F> {
    /// Creates a parser reading `<procfs_root>/diskstats` through `fs`.
    ///
    /// The jiffies conversion factor comes from the host facts.
    pub fn with_fs(fs: F, procfs_root: impl AsRef<Path>) -> Self {
        Self {
            fs,
            path: procfs_root.as_ref().join("diskstats"),
            pool: DISKSTATS_READ_BUF_POOL,
            dev_info: HashMap::new(),
            changed: false,
            scan: ScanCounter::new(),
            jiffies_to_ms: host_facts().jiffies_to_ms(),
            fields_in_jiffies: DISKSTATS_FIELDS_IN_JIFFIES,
            key_buf: String::new(),
        }
    }

    /// Overrides the jiffies to milliseconds factor; `0` disables conversion.
    pub fn with_jiffies_to_ms(mut self, jiffies_to_ms: u32) -> Self {
        self.jiffies_to_ms = jiffies_to_ms;
        self
    }

    /// Creates an instance with the same configuration. With `full`, the
    /// current values are copied too; otherwise only the device set is kept
    /// and counters start zeroed.
    pub fn sibling(&self, full: bool) -> Self {
        let dev_info = if full {
            self.dev_info.clone()
        } else {
            self.dev_info
                .iter()
                .map(|(key, info)| {
                    let info = DiskInfo {
                        name: info.name.clone(),
                        stats: [0; NUM_DISKSTATS_VALUES],
                        last_seen_scan: info.last_seen_scan,
                    };
                    (key.clone(), info)
                })
                .collect()
        };
        Self {
            fs: self.fs.clone(),
            path: self.path.clone(),
            pool: self.pool,
            dev_info,
            changed: full && self.changed,
            scan: self.scan,
            jiffies_to_ms: self.jiffies_to_ms,
            fields_in_jiffies: self.fields_in_jiffies,
            key_buf: String::new(),
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

    /// Devices keyed by `"major:minor"`.
    pub fn dev_info(&self) -> &HashMap<String, DiskInfo> {
        &self.dev_info
    }

    pub fn get(&self, major_minor: &str) -> Option<&DiskInfo> {
        self.dev_info.get(major_minor)
    }

    /// `true` if devices were added or removed, or a device was renamed,
    /// by the last parse.
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn jiffies_to_ms(&self) -> u32 {
        self.jiffies_to_ms
    }

    pub fn scan_number(&self) -> u64 {
        self.scan.current()
    }

    pub fn parse(&mut self) -> Result<()> {
        let buf = self.pool.read_complete(&self.fs, &self.path)?;

        let scan = self.scan.advance();
        let path = &self.path;
        let jiffies_to_ms = self.jiffies_to_ms;
        let mut changed = false;

        for (line_num, _, line) in lines(&buf) {
            let syntax = |reason: String| ProcfsError::syntax(path, line_num, line, reason);
            let mut fields = FieldCursor::new(line);

            let Some(major) = fields.next_field() else {
                // blank line
                continue;
            };
            let major = decode_u32(major).ok_or_else(|| syntax("invalid value".into()))?;
            let minor = fields
                .next_field()
                .ok_or_else(|| syntax("missing minor number".into()))
                .and_then(|f| decode_u32(f).ok_or_else(|| syntax("invalid value".into())))?;
            let name = fields
                .next_field()
                .ok_or_else(|| syntax("missing device name".into()))?;

            let mut stats = [0u32; NUM_DISKSTATS_VALUES];
            let mut num_values = 0;
            while let Some(field) = fields.next_field() {
                if num_values == NUM_DISKSTATS_VALUES {
                    return Err(syntax("invalid value".into()));
                }
                let mut value = decode_u32(field).ok_or_else(|| syntax("invalid value".into()))?;
                if jiffies_to_ms > 0 && self.fields_in_jiffies[num_values] {
                    value = value.wrapping_mul(jiffies_to_ms);
                }
                stats[num_values] = value;
                num_values += 1;
            }
            if num_values < MIN_NUM_DISKSTATS_VALUES {
                return Err(syntax(format!(
                    "missing fields (< {})",
                    MIN_NUM_DISKSTATS_VALUES
                )));
            }

            self.key_buf.clear();
            let _ = write!(self.key_buf, "{}:{}", major, minor);
            match self.dev_info.get_mut(self.key_buf.as_str()) {
                Some(info) => {
                    if info.name.as_bytes() != name {
                        info.name = String::from_utf8_lossy(name).into_owned();
                        changed = true;
                    }
                    info.stats = stats;
                    info.last_seen_scan = scan;
                }
                None => {
                    self.dev_info.insert(
                        self.key_buf.clone(),
                        DiskInfo {
                            name: String::from_utf8_lossy(name).into_owned(),
                            stats,
                            last_seen_scan: scan,
                        },
                    );
                    changed = true;
                }
            }
        }

        let evicted = evict_stale(&mut self.dev_info, scan);
        if evicted > 0 {
            debug!("{}: {} device(s) removed", self.path.display(), evicted);
            changed = true;
        }
        self.changed = changed;
        Ok(())
    }
}
