//! Parser for `/proc/<pid>/status` and `/proc/<pid>/task/<tid>/status`.
//!
//! ```text
//! Name:	rs:main Q:Reg
//! Uid:	104	104	104	104
//! Groups:	4 111
//! VmPeak:	  222400 kB
//! voluntary_ctxt_switches:	2588
//! ```
//!
//! Only a known set of keys is retained. Values used as labels are copied
//! into an owned buffer, lists joined by `,`; memory sizes lose their unit,
//! which is stored apart since it does not change for the life of a kernel.

use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::collector::bufpool::{READ_BUF_POOL_16K, ReadBufPool};
use crate::collector::procfs::parser::{FieldCursor, decode_u64, lines, trim_space};
use crate::collector::procfs::pid::{PID_ONLY_TID, pid_file_path};
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::{ProcfsError, Result};

pub const PID_STATUS_UID: usize = 0;
pub const PID_STATUS_GID: usize = 1;
pub const PID_STATUS_GROUPS: usize = 2;
pub const PID_STATUS_VM_PEAK: usize = 3;
pub const PID_STATUS_VM_SIZE: usize = 4;
pub const PID_STATUS_VM_LCK: usize = 5;
pub const PID_STATUS_VM_PIN: usize = 6;
pub const PID_STATUS_VM_HWM: usize = 7;
pub const PID_STATUS_VM_RSS: usize = 8;
pub const PID_STATUS_RSS_ANON: usize = 9;
pub const PID_STATUS_RSS_FILE: usize = 10;
pub const PID_STATUS_RSS_SHMEM: usize = 11;
pub const PID_STATUS_VM_DATA: usize = 12;
pub const PID_STATUS_VM_STK: usize = 13;
pub const PID_STATUS_VM_EXE: usize = 14;
pub const PID_STATUS_VM_LIB: usize = 15;
pub const PID_STATUS_VM_PTE: usize = 16;
pub const PID_STATUS_VM_PMD: usize = 17;
pub const PID_STATUS_VM_SWAP: usize = 18;
pub const PID_STATUS_HUGETLB_PAGES: usize = 19;
pub const PID_STATUS_CPUS_ALLOWED_LIST: usize = 20;
pub const PID_STATUS_MEMS_ALLOWED_LIST: usize = 21;

pub const PID_STATUS_BYTE_SLICE_FIELD_COUNT: usize = 22;

pub const PID_STATUS_VOLUNTARY_CTXT_SWITCHES: usize = 0;
pub const PID_STATUS_NONVOLUNTARY_CTXT_SWITCHES: usize = 1;

pub const PID_STATUS_NUMERIC_FIELD_COUNT: usize = 2;

const PID_STATUS_LIST_SEP: u8 = b',';

static PID_STATUS_READ_BUF_POOL: &ReadBufPool = &READ_BUF_POOL_16K;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineHandling {
    /// `Key:	value`
    SingleValue(usize),
    /// `Key:	value unit`
    SingleValueUnit(usize),
    /// `Key:	v1	v2 ...`, joined by `,`; an empty list is accepted.
    List { index: usize, allow_empty: bool },
    Numeric(usize),
}

fn line_handling(prefix: &[u8]) -> Option<LineHandling> {
    use LineHandling::*;
    let handling = match prefix {
        b"Uid" => List { index: PID_STATUS_UID, allow_empty: false },
        b"Gid" => List { index: PID_STATUS_GID, allow_empty: false },
        b"Groups" => List { index: PID_STATUS_GROUPS, allow_empty: true },
        b"VmPeak" => SingleValueUnit(PID_STATUS_VM_PEAK),
        b"VmSize" => SingleValueUnit(PID_STATUS_VM_SIZE),
        b"VmLck" => SingleValueUnit(PID_STATUS_VM_LCK),
        b"VmPin" => SingleValueUnit(PID_STATUS_VM_PIN),
        b"VmHWM" => SingleValueUnit(PID_STATUS_VM_HWM),
        b"VmRSS" => SingleValueUnit(PID_STATUS_VM_RSS),
        b"RssAnon" => SingleValueUnit(PID_STATUS_RSS_ANON),
        b"RssFile" => SingleValueUnit(PID_STATUS_RSS_FILE),
        b"RssShmem" => SingleValueUnit(PID_STATUS_RSS_SHMEM),
        b"VmData" => SingleValueUnit(PID_STATUS_VM_DATA),
        b"VmStk" => SingleValueUnit(PID_STATUS_VM_STK),
        b"VmExe" => SingleValueUnit(PID_STATUS_VM_EXE),
        b"VmLib" => SingleValueUnit(PID_STATUS_VM_LIB),
        b"VmPTE" => SingleValueUnit(PID_STATUS_VM_PTE),
        b"VmPMD" => SingleValueUnit(PID_STATUS_VM_PMD),
        b"VmSwap" => SingleValueUnit(PID_STATUS_VM_SWAP),
        b"HugetlbPages" => SingleValueUnit(PID_STATUS_HUGETLB_PAGES),
        b"Cpus_allowed_list" => SingleValue(PID_STATUS_CPUS_ALLOWED_LIST),
        b"Mems_allowed_list" => SingleValue(PID_STATUS_MEMS_ALLOWED_LIST),
        b"voluntary_ctxt_switches" => Numeric(PID_STATUS_VOLUNTARY_CTXT_SWITCHES),
        b"nonvoluntary_ctxt_switches" => Numeric(PID_STATUS_NONVOLUNTARY_CTXT_SWITCHES),
        _ => return None,
    };
    Some(handling)
}

#[derive(Debug)]
pub struct PidStatus<F: FileSystem = RealFs> {
    fs: F,
    procfs_root: PathBuf,
    path: PathBuf,
    pool: &'static ReadBufPool,
    byte_slice_fields_buf: Vec<u8>,
    byte_slice_fields: [Range<usize>; PID_STATUS_BYTE_SLICE_FIELD_COUNT],
    unit: [Vec<u8>; PID_STATUS_BYTE_SLICE_FIELD_COUNT],
    numeric_fields: [u64; PID_STATUS_NUMERIC_FIELD_COUNT],
}

impl PidStatus<RealFs> {
    pub fn new(procfs_root: impl AsRef<Path>) -> Self {
        Self::with_fs(RealFs::new(), procfs_root)
    }
}

impl<F: FileSystem + Clone> PidStatus<F> {
    pub fn with_fs(fs: F, procfs_root: impl AsRef<Path>) -> Self {
        let procfs_root = procfs_root.as_ref().to_path_buf();
        Self {
            fs,
            path: pid_file_path(&procfs_root, 0, PID_ONLY_TID, "status"),
            pool: PID_STATUS_READ_BUF_POOL,
            procfs_root,
            byte_slice_fields_buf: Vec::new(),
            byte_slice_fields: Default::default(),
            unit: Default::default(),
            numeric_fields: [0; PID_STATUS_NUMERIC_FIELD_COUNT],
        }
    }

    /// Carries over the learned units; with `full`, the values as well.
    pub fn sibling(&self, full: bool) -> Self {
        let mut sibling = Self::with_fs(self.fs.clone(), &self.procfs_root);
        sibling.path = self.path.clone();
        sibling.pool = self.pool;
        sibling.unit = self.unit.clone();
        if full {
            sibling.byte_slice_fields_buf = self.byte_slice_fields_buf.clone();
            sibling.byte_slice_fields = self.byte_slice_fields.clone();
            sibling.numeric_fields = self.numeric_fields;
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

    /// Value of `PID_STATUS_*` field `index`; empty if absent from the file.
    pub fn field(&self, index: usize) -> &[u8] {
        self.byte_slice_fields
            .get(index)
            .and_then(|r| self.byte_slice_fields_buf.get(r.clone()))
            .unwrap_or_default()
    }

    /// Unit of field `index`, e.g. `kB`; empty for fields without one.
    pub fn unit(&self, index: usize) -> &[u8] {
        self.unit.get(index).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn numeric_fields(&self) -> &[u64; PID_STATUS_NUMERIC_FIELD_COUNT] {
        &self.numeric_fields
    }

    pub fn parse(&mut self, pid: i32, tid: i32) -> Result<()> {
        self.path = pid_file_path(&self.procfs_root, pid, tid, "status");
        let buf = self.pool.read_complete(&self.fs, &self.path)?;

        let path = &self.path;
        let out = &mut self.byte_slice_fields_buf;
        out.clear();
        self.byte_slice_fields.fill(0..0);
        self.numeric_fields = [0; PID_STATUS_NUMERIC_FIELD_COUNT];

        for (line_num, _, line) in lines(&buf) {
            let syntax = |reason: &str| ProcfsError::syntax(path, line_num, line, reason);

            if trim_space(line).is_empty() {
                continue;
            }
            let Some(colon) = line.iter().position(|&c| c == b':') else {
                return Err(syntax("missing `PREFIX:'"));
            };
            let prefix = trim_space(&line[..colon]);
            if prefix.is_empty() {
                return Err(syntax("missing `PREFIX:'"));
            }
            let Some(handling) = line_handling(prefix) else {
                continue;
            };

            let mut fields = FieldCursor::at(line, colon + 1);
            match handling {
                LineHandling::SingleValue(index) => {
                    let value = fields.next_field().ok_or_else(|| syntax("truncated line"))?;
                    let start = out.len();
                    out.extend_from_slice(value);
                    self.byte_slice_fields[index] = start..out.len();
                }
                LineHandling::SingleValueUnit(index) => {
                    let value = fields.next_field().ok_or_else(|| syntax("truncated line"))?;
                    let start = out.len();
                    out.extend_from_slice(value);
                    self.byte_slice_fields[index] = start..out.len();
                    if self.unit[index].is_empty() {
                        let unit = fields.next_field().ok_or_else(|| syntax("missing UNIT"))?;
                        self.unit[index].extend_from_slice(unit);
                    }
                }
                LineHandling::List { index, allow_empty } => {
                    let start = out.len();
                    while let Some(value) = fields.next_field() {
                        if out.len() > start {
                            out.push(PID_STATUS_LIST_SEP);
                        }
                        out.extend_from_slice(value);
                    }
                    if out.len() == start && !allow_empty {
                        return Err(syntax("truncated line"));
                    }
                    self.byte_slice_fields[index] = start..out.len();
                }
                LineHandling::Numeric(index) => {
                    let value = fields.next_field().ok_or_else(|| syntax("truncated line"))?;
                    self.numeric_fields[index] =
                        decode_u64(value).ok_or_else(|| syntax("invalid value"))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    const STATUS: &str = "\
Name:\trs:main Q:Reg
Umask:\t0022
State:\tS (sleeping)
Tgid:\t468
Pid:\t486
PPid:\t1
Uid:\t10400\t10401\t10402\t10403
Gid:\t111\t111\t111\t111
FDSize:\t128
Groups:\t4 111
VmPeak:\t 2224000 kB
VmSize:\t  222400 kB
VmLck:\t       0 kB
VmPin:\t       0 kB
VmHWM:\t    5348 kB
VmRSS:\t    5348 kB
RssAnon:\t    1408 kB
RssFile:\t    3940 kB
RssShmem:\t       0 kB
VmData:\t   41352 kB
VmStk:\t     132 kB
VmExe:\t     368 kB
VmLib:\t    4352 kB
VmPTE:\t      80 kB
VmSwap:\t       0 kB
HugetlbPages:\t       0 kB
Threads:\t4
Cpus_allowed:\tff
Cpus_allowed_list:\t0-7
Mems_allowed_list:\t0
voluntary_ctxt_switches:\t2588
nonvoluntary_ctxt_switches:\t12
";

    fn setup(content: &str) -> (MockFs, PidStatus<MockFs>) {
        let fs = MockFs::new();
        fs.add_file("/proc/486/status", content);
        let pid_status = PidStatus::with_fs(fs.clone(), "/proc");
        (fs, pid_status)
    }

    #[test]
    fn test_parse_pid_status() {
        let (_fs, mut pid_status) = setup(STATUS);
        pid_status.parse(486, PID_ONLY_TID).unwrap();

        assert_eq!(pid_status.field(PID_STATUS_UID), b"10400,10401,10402,10403");
        assert_eq!(pid_status.field(PID_STATUS_GID), b"111,111,111,111");
        assert_eq!(pid_status.field(PID_STATUS_GROUPS), b"4,111");
        assert_eq!(pid_status.field(PID_STATUS_VM_PEAK), b"2224000");
        assert_eq!(pid_status.unit(PID_STATUS_VM_PEAK), b"kB");
        assert_eq!(pid_status.field(PID_STATUS_RSS_FILE), b"3940");
        assert_eq!(pid_status.field(PID_STATUS_CPUS_ALLOWED_LIST), b"0-7");
        assert_eq!(pid_status.field(PID_STATUS_MEMS_ALLOWED_LIST), b"0");
        assert_eq!(pid_status.unit(PID_STATUS_CPUS_ALLOWED_LIST), b"");
        // VmPMD is not present in the file above.
        assert_eq!(pid_status.field(PID_STATUS_VM_PMD), b"");
        assert_eq!(
            pid_status.numeric_fields()[PID_STATUS_VOLUNTARY_CTXT_SWITCHES],
            2588
        );
        assert_eq!(
            pid_status.numeric_fields()[PID_STATUS_NONVOLUNTARY_CTXT_SWITCHES],
            12
        );
    }

    #[test]
    fn test_reparse_clears_missing_fields() {
        let (fs, mut pid_status) = setup(STATUS);
        pid_status.parse(486, PID_ONLY_TID).unwrap();

        let kernel_thread: String = STATUS
            .lines()
            .filter(|l| !l.starts_with("Vm") && !l.starts_with("Rss"))
            .map(|l| format!("{l}\n"))
            .collect();
        fs.add_file("/proc/486/status", kernel_thread);
        pid_status.parse(486, PID_ONLY_TID).unwrap();
        assert_eq!(pid_status.field(PID_STATUS_VM_PEAK), b"");
        assert_eq!(pid_status.unit(PID_STATUS_VM_PEAK), b"kB");
        assert_eq!(pid_status.field(PID_STATUS_UID), b"10400,10401,10402,10403");
    }

    #[test]
    fn test_empty_groups() {
        let (_fs, mut pid_status) = setup(&STATUS.replace("Groups:\t4 111", "Groups:\t"));
        pid_status.parse(486, PID_ONLY_TID).unwrap();
        assert_eq!(pid_status.field(PID_STATUS_GROUPS), b"");
        assert_eq!(pid_status.field(PID_STATUS_GID), b"111,111,111,111");
    }

    #[test]
    fn test_invalid_lines() {
        let (fs, mut pid_status) = setup("Uid:\t\n");
        let err = pid_status.parse(486, PID_ONLY_TID).unwrap_err();
        assert!(err.to_string().ends_with("truncated line"), "{err}");

        fs.add_file("/proc/486/status", "VmPeak:\t2224000\n");
        let err = pid_status.parse(486, PID_ONLY_TID).unwrap_err();
        assert!(err.to_string().ends_with("missing UNIT"), "{err}");

        fs.add_file("/proc/486/status", "Name:\tx\nno colon here\n");
        let err = pid_status.parse(486, PID_ONLY_TID).unwrap_err();
        assert!(matches!(err, ProcfsError::Syntax { line_num: 2, .. }));

        fs.add_file("/proc/486/status", "voluntary_ctxt_switches:\t25x\n");
        let err = pid_status.parse(486, PID_ONLY_TID).unwrap_err();
        assert!(err.to_string().ends_with("invalid value"), "{err}");
    }

    #[test]
    fn test_sibling_keeps_units() {
        let (_fs, mut pid_status) = setup(STATUS);
        pid_status.parse(486, PID_ONLY_TID).unwrap();

        let prev = pid_status.sibling(false);
        assert_eq!(prev.unit(PID_STATUS_VM_RSS), b"kB");
        assert_eq!(prev.field(PID_STATUS_VM_RSS), b"");
        let full = pid_status.sibling(true);
        assert_eq!(full.field(PID_STATUS_VM_RSS), b"5348");
        assert_eq!(full.numeric_fields(), pid_status.numeric_fields());
    }

    #[test]
    fn test_truncated_read() {
        static SMALL_READ_BUF_POOL: ReadBufPool = ReadBufPool::new(4, 64);

        let (_fs, pid_status) = setup(STATUS);
        let mut pid_status = pid_status.with_pool(&SMALL_READ_BUF_POOL);
        let err = pid_status.parse(486, PID_ONLY_TID).unwrap_err();
        assert!(
            matches!(err, ProcfsError::Truncated { max_read_size: 64, .. }),
            "{err}"
        );
    }
}
