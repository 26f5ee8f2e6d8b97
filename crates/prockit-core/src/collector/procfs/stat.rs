//! Parser for `/proc/stat`.
//!
//! ```text
//! cpu  5736 0 4342 2298934 2154 0 345 0 0 0
//! cpu0 2864 0 2169 1149443 1063 0 172 0 0 0
//! intr 741734 9 0 0 ...
//! ctxt 1224213
//! btime 1700000000
//! ```
//!
//! `intr` and `softirq` are skipped, `/proc/interrupts` and `/proc/softirqs`
//! have the same counters broken down per CPU.

use std::path::{Path, PathBuf};

use crate::collector::bufpool::{READ_BUF_POOL_256K, ReadBufPool};
use crate::collector::procfs::parser::{FieldCursor, decode_u64, is_space, lines};
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::{ProcfsError, Result};

// Indexes into a CPU stats row, all in USER_HZ ticks:
pub const STAT_CPU_USER_TICKS: usize = 0;
pub const STAT_CPU_NICE_TICKS: usize = 1;
pub const STAT_CPU_SYSTEM_TICKS: usize = 2;
pub const STAT_CPU_IDLE_TICKS: usize = 3;
pub const STAT_CPU_IOWAIT_TICKS: usize = 4;
pub const STAT_CPU_IRQ_TICKS: usize = 5;
pub const STAT_CPU_SOFTIRQ_TICKS: usize = 6;
pub const STAT_CPU_STEAL_TICKS: usize = 7;
pub const STAT_CPU_GUEST_TICKS: usize = 8;
pub const STAT_CPU_GUEST_NICE_TICKS: usize = 9;

pub const STAT_CPU_NUM_STATS: usize = 10;
/// Older kernels stop after softirq.
pub const STAT_CPU_MIN_NUM_STATS: usize = STAT_CPU_SOFTIRQ_TICKS + 1;

// Indexes into the numeric fields:
pub const STAT_PAGE_IN: usize = 0;
pub const STAT_PAGE_OUT: usize = 1;
pub const STAT_SWAP_IN: usize = 2;
pub const STAT_SWAP_OUT: usize = 3;
pub const STAT_CTXT: usize = 4;
pub const STAT_BTIME: usize = 5;
pub const STAT_PROCESSES: usize = 6;
pub const STAT_PROCS_RUNNING: usize = 7;
pub const STAT_PROCS_BLOCKED: usize = 8;

pub const STAT_NUMERIC_FIELDS_COUNT: usize = 9;

pub type CpuStats = [u64; STAT_CPU_NUM_STATS];

static STAT_READ_BUF_POOL: &ReadBufPool = &READ_BUF_POOL_256K;

/// Numeric field indexes for a non-cpu prefix, in value order.
fn numeric_field_indexes(prefix: &[u8]) -> Option<&'static [usize]> {
    let indexes: &'static [usize] = match prefix {
        b"page" => &[STAT_PAGE_IN, STAT_PAGE_OUT],
        b"swap" => &[STAT_SWAP_IN, STAT_SWAP_OUT],
        b"ctxt" => &[STAT_CTXT],
        b"btime" => &[STAT_BTIME],
        b"processes" => &[STAT_PROCESSES],
        b"procs_running" => &[STAT_PROCS_RUNNING],
        b"procs_blocked" => &[STAT_PROCS_BLOCKED],
        _ => return None,
    };
    Some(indexes)
}

#[derive(Debug, Clone, Default)]
struct PerCpu {
    stats: Vec<Option<CpuStats>>,
    /// Bitmap of the CPU#s seen at the last parse.
    present: Vec<u64>,
    max_cpu_num: Option<usize>,
}

impl PerCpu {
    fn is_present(&self, n: usize) -> bool {
        self.present
            .get(n >> 6)
            .is_some_and(|chunk| chunk & (1 << (n & 63)) != 0)
    }

    /// Marks `n` present and returns its row.
    fn slot(&mut self, n: usize) -> &mut CpuStats {
        let chunk = n >> 6;
        if chunk >= self.present.len() {
            self.present.resize(chunk + 1, 0);
        }
        self.present[chunk] |= 1 << (n & 63);
        if self.max_cpu_num.is_none_or(|max| n > max) {
            self.max_cpu_num = Some(n);
        }
        if n >= self.stats.len() {
            self.stats.resize(n + 1, None);
        }
        self.stats[n].get_or_insert([0; STAT_CPU_NUM_STATS])
    }
}

#[derive(Debug)]
pub struct Stat<F: FileSystem = RealFs> {
    fs: F,
    path: PathBuf,
    pool: &'static ReadBufPool,
    cpu_all: CpuStats,
    cpus: PerCpu,
    numeric_fields: [u64; STAT_NUMERIC_FIELDS_COUNT],
}

impl Stat<RealFs> {
    pub fn new(procfs_root: impl AsRef<Path>) -> Self {
        Self::with_fs(RealFs::new(), procfs_root)
    }
}

impl<F: FileSystem + Clone> Stat<F> {
    pub fn with_fs(fs: F, procfs_root: impl AsRef<Path>) -> Self {
        Self {
            fs,
            path: procfs_root.as_ref().join("stat"),
            pool: STAT_READ_BUF_POOL,
            cpu_all: [0; STAT_CPU_NUM_STATS],
            cpus: PerCpu::default(),
            numeric_fields: [0; STAT_NUMERIC_FIELDS_COUNT],
        }
    }

    pub fn sibling(&self, full: bool) -> Self {
        let mut sibling = Self::with_fs(self.fs.clone(), "");
        sibling.path = self.path.clone();
        sibling.pool = self.pool;
        if full {
            sibling.cpu_all = self.cpu_all;
            sibling.cpus = self.cpus.clone();
            sibling.numeric_fields = self.numeric_fields;
        } else {
            sibling.cpus.stats = vec![None; self.cpus.stats.len()];
            sibling.cpus.present = vec![0; self.cpus.present.len()];
        }
        sibling
    }

    /// Reads through `pool` instead of the default one.
    pub fn with_pool(mut self, pool: &'static ReadBufPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The aggregate `cpu` line.
    pub fn cpu_all(&self) -> &CpuStats {
        &self.cpu_all
    }

    /// Stats for `cpu<n>`, if it was present at the last parse.
    pub fn cpu(&self, n: usize) -> Option<&CpuStats> {
        if !self.cpus.is_present(n) {
            return None;
        }
        self.cpus.stats.get(n).and_then(Option::as_ref)
    }

    pub fn cpu_present(&self, n: usize) -> bool {
        self.cpus.is_present(n)
    }

    /// Highest CPU# ever seen.
    pub fn max_cpu_num(&self) -> Option<usize> {
        self.cpus.max_cpu_num
    }

    pub fn numeric_fields(&self) -> &[u64; STAT_NUMERIC_FIELDS_COUNT] {
        &self.numeric_fields
    }

    pub fn parse(&mut self) -> Result<()> {
        let buf = self.pool.read_complete(&self.fs, &self.path)?;

        let path = &self.path;
        self.cpus.present.fill(0);
        for (line_num, _, line) in lines(&buf) {
            let syntax = |reason: String| ProcfsError::syntax(path, line_num, line, reason);

            let prefix_end = line
                .iter()
                .position(|&c| is_space(c) || c.is_ascii_digit())
                .unwrap_or(line.len());
            let prefix = &line[..prefix_end];
            let mut fields = FieldCursor::at(line, prefix_end);

            if prefix == b"cpu" {
                let cpu_num = fields.next_span().filter(|s| s.start == prefix_end);
                let stats = match cpu_num {
                    Some(span) => {
                        let n = decode_u64(&line[span])
                            .and_then(|n| usize::try_from(n).ok())
                            .ok_or_else(|| syntax("invalid cpu#".into()))?;
                        self.cpus.slot(n)
                    }
                    None => {
                        fields = FieldCursor::at(line, prefix_end);
                        &mut self.cpu_all
                    }
                };
                let mut num_stats = 0;
                while let Some(field) = fields.next_field() {
                    if num_stats == STAT_CPU_NUM_STATS {
                        return Err(syntax(format!(
                            "invalid value count (> {})",
                            STAT_CPU_NUM_STATS
                        )));
                    }
                    stats[num_stats] =
                        decode_u64(field).ok_or_else(|| syntax("invalid value".into()))?;
                    num_stats += 1;
                }
                if num_stats < STAT_CPU_MIN_NUM_STATS {
                    return Err(syntax(format!(
                        "invalid value count (< {})",
                        STAT_CPU_MIN_NUM_STATS
                    )));
                }
                continue;
            }

            let Some(indexes) = numeric_field_indexes(prefix) else {
                continue;
            };
            let mut num_values = 0;
            while let Some(field) = fields.next_field() {
                let Some(&index) = indexes.get(num_values) else {
                    num_values += 1;
                    break;
                };
                self.numeric_fields[index] =
                    decode_u64(field).ok_or_else(|| syntax("invalid value".into()))?;
                num_values += 1;
            }
            if num_values != indexes.len() {
                return Err(syntax(format!(
                    "invalid value count (!= {})",
                    indexes.len()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    const STAT: &str = "\
cpu  5736 1 4342 2298934 2154 0 345 7 8 9
cpu0 2864 0 2169 1149443 1063 0 172 3 4 5
cpu1 2872 1 2173 1149491 1091 0 173 4 4 4
intr 741734 9 0 0 0
ctxt 1224213
btime 1700000000
processes 8512
procs_running 2
procs_blocked 1
softirq 512834 0 119382 6 21394
";

    fn setup(content: &str) -> (MockFs, Stat<MockFs>) {
        let fs = MockFs::new();
        fs.add_file("/proc/stat", content);
        let stat = Stat::with_fs(fs.clone(), "/proc");
        (fs, stat)
    }

    #[test]
    fn test_parse_stat() {
        let (_fs, mut stat) = setup(STAT);
        stat.parse().unwrap();

        assert_eq!(stat.cpu_all(), &[5736, 1, 4342, 2298934, 2154, 0, 345, 7, 8, 9]);
        assert_eq!(
            stat.cpu(1),
            Some(&[2872, 1, 2173, 1149491, 1091, 0, 173, 4, 4, 4])
        );
        assert_eq!(stat.cpu(0).unwrap()[STAT_CPU_GUEST_NICE_TICKS], 5);
        assert_eq!(stat.cpu(2), None);
        assert_eq!(stat.max_cpu_num(), Some(1));
        assert_eq!(stat.numeric_fields()[STAT_CTXT], 1224213);
        assert_eq!(stat.numeric_fields()[STAT_BTIME], 1700000000);
        assert_eq!(stat.numeric_fields()[STAT_PROCESSES], 8512);
        assert_eq!(stat.numeric_fields()[STAT_PROCS_RUNNING], 2);
        assert_eq!(stat.numeric_fields()[STAT_PROCS_BLOCKED], 1);
        assert_eq!(stat.numeric_fields()[STAT_PAGE_IN], 0);
    }

    #[test]
    fn test_offline_cpu() {
        let (fs, mut stat) = setup(STAT);
        stat.parse().unwrap();

        fs.add_file("/proc/stat", STAT.replace("cpu0 ", "cpu4 "));
        stat.parse().unwrap();
        assert!(!stat.cpu_present(0));
        assert!(stat.cpu(0).is_none());
        assert!(stat.cpu_present(4));
        assert_eq!(stat.max_cpu_num(), Some(4));
    }

    #[test]
    fn test_old_kernel_cpu_line() {
        let (_fs, mut stat) = setup("cpu  1 2 3 4 5 6 7\ncpu0 1 2 3 4 5 6 7\npage 5 6\nswap 7 8\n");
        stat.parse().unwrap();
        assert_eq!(stat.cpu_all(), &[1, 2, 3, 4, 5, 6, 7, 0, 0, 0]);
        assert_eq!(stat.numeric_fields()[STAT_PAGE_OUT], 6);
        assert_eq!(stat.numeric_fields()[STAT_SWAP_IN], 7);
    }

    #[test]
    fn test_invalid_lines() {
        let (fs, mut stat) = setup("cpu  1 2 3 4 5 6\n");
        let err = stat.parse().unwrap_err();
        assert!(err.to_string().ends_with("invalid value count (< 7)"), "{err}");

        fs.add_file("/proc/stat", "cpu0 1 2 3 4 5 6 7 8 9 10 11\n");
        let err = stat.parse().unwrap_err();
        assert!(err.to_string().ends_with("invalid value count (> 10)"), "{err}");

        fs.add_file("/proc/stat", "cpu  1 2 3 4 5 6 7\nctxt 1 2\n");
        let err = stat.parse().unwrap_err();
        assert!(matches!(err, ProcfsError::Syntax { line_num: 2, .. }));
        assert!(err.to_string().ends_with("invalid value count (!= 1)"), "{err}");

        fs.add_file("/proc/stat", "btime 17x\n");
        let err = stat.parse().unwrap_err();
        assert!(err.to_string().ends_with("invalid value"), "{err}");
    }

    #[test]
    fn test_truncated_read() {
        static SMALL_READ_BUF_POOL: ReadBufPool = ReadBufPool::new(4, 64);

        let (_fs, stat) = setup(STAT);
        let mut stat = stat.with_pool(&SMALL_READ_BUF_POOL);
        let err = stat.parse().unwrap_err();
        assert!(
            matches!(err, ProcfsError::Truncated { max_read_size: 64, .. }),
            "{err}"
        );
    }
}
