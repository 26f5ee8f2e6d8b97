//! Parser for `/proc/<pid>/stat` and `/proc/<pid>/task/<tid>/stat`.
//!
//! ```text
//! 486 (rs:main Q:Reg) S 1 468 468 0 -1 1077936192 44 0 0 0 0 2 0 0 20 0 4 0 898 227737600 1340 ...
//! ```
//!
//! Fields that end up as label values are kept as spans into the read
//! buffer; the few used in arithmetic are decoded.

use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::collector::procfs::parser::{FieldCursor, decode_u64, line_end};
use crate::collector::procfs::pid::{PID_ONLY_TID, pid_file_path};
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::{ProcfsError, Result};

/// Max size of `comm`, from `include/linux/sched.h`.
pub const TASK_COMM_LEN: usize = 16;

// Byte slice fields:
pub const PID_STAT_COMM: usize = 0;
pub const PID_STAT_STATE: usize = 1;
pub const PID_STAT_PPID: usize = 2;
pub const PID_STAT_PGRP: usize = 3;
pub const PID_STAT_SESSION: usize = 4;
pub const PID_STAT_TTY_NR: usize = 5;
pub const PID_STAT_TPGID: usize = 6;
pub const PID_STAT_FLAGS: usize = 7;
pub const PID_STAT_PRIORITY: usize = 8;
pub const PID_STAT_NICE: usize = 9;
pub const PID_STAT_NUM_THREADS: usize = 10;
pub const PID_STAT_STARTTIME: usize = 11;
pub const PID_STAT_VSIZE: usize = 12;
pub const PID_STAT_RSS: usize = 13;
pub const PID_STAT_RSSLIM: usize = 14;
pub const PID_STAT_PROCESSOR: usize = 15;
pub const PID_STAT_RT_PRIORITY: usize = 16;
pub const PID_STAT_POLICY: usize = 17;

pub const PID_STAT_BYTE_SLICE_FIELD_COUNT: usize = 18;

// Numeric fields:
pub const PID_STAT_MINFLT: usize = 0;
pub const PID_STAT_MAJFLT: usize = 1;
pub const PID_STAT_UTIME: usize = 2;
pub const PID_STAT_STIME: usize = 3;

pub const PID_STAT_NUMERIC_FIELD_COUNT: usize = 4;

/// Field number, 1-based as in proc(5), of the last field of interest.
const PID_STAT_MAX_FIELD_NUM: usize = 41;
const PID_STAT_COMM_FIELD_NUM: usize = 2;

#[derive(Debug, Clone, Copy)]
enum FieldHandling {
    Skip,
    Bytes(usize),
    Numeric(usize),
}

const fn field_handling() -> [FieldHandling; PID_STAT_MAX_FIELD_NUM + 1] {
    use FieldHandling::*;
    let mut table = [Skip; PID_STAT_MAX_FIELD_NUM + 1];
    table[2] = Bytes(PID_STAT_COMM);
    table[3] = Bytes(PID_STAT_STATE);
    table[4] = Bytes(PID_STAT_PPID);
    table[5] = Bytes(PID_STAT_PGRP);
    table[6] = Bytes(PID_STAT_SESSION);
    table[7] = Bytes(PID_STAT_TTY_NR);
    table[8] = Bytes(PID_STAT_TPGID);
    table[9] = Bytes(PID_STAT_FLAGS);
    table[10] = Numeric(PID_STAT_MINFLT);
    table[12] = Numeric(PID_STAT_MAJFLT);
    table[14] = Numeric(PID_STAT_UTIME);
    table[15] = Numeric(PID_STAT_STIME);
    table[18] = Bytes(PID_STAT_PRIORITY);
    table[19] = Bytes(PID_STAT_NICE);
    table[20] = Bytes(PID_STAT_NUM_THREADS);
    table[22] = Bytes(PID_STAT_STARTTIME);
    table[23] = Bytes(PID_STAT_VSIZE);
    table[24] = Bytes(PID_STAT_RSS);
    table[25] = Bytes(PID_STAT_RSSLIM);
    table[39] = Bytes(PID_STAT_PROCESSOR);
    table[40] = Bytes(PID_STAT_RT_PRIORITY);
    table[41] = Bytes(PID_STAT_POLICY);
    table
}

static PID_STAT_FIELD_HANDLING: [FieldHandling; PID_STAT_MAX_FIELD_NUM + 1] = field_handling();

#[derive(Debug)]
pub struct PidStat<F: FileSystem = RealFs> {
    fs: F,
    procfs_root: PathBuf,
    path: PathBuf,
    buf: Vec<u8>,
    byte_slice_fields: [Range<usize>; PID_STAT_BYTE_SLICE_FIELD_COUNT],
    numeric_fields: [u64; PID_STAT_NUMERIC_FIELD_COUNT],
}

impl PidStat<RealFs> {
    pub fn new(procfs_root: impl AsRef<Path>) -> Self {
        Self::with_fs(RealFs::new(), procfs_root)
    }
}

impl<F: FileSystem> PidStat<F> {
    pub fn with_fs(fs: F, procfs_root: impl AsRef<Path>) -> Self {
        let procfs_root = procfs_root.as_ref().to_path_buf();
        Self {
            fs,
            path: pid_file_path(&procfs_root, 0, PID_ONLY_TID, "stat"),
            procfs_root,
            buf: Vec::new(),
            byte_slice_fields: Default::default(),
            numeric_fields: [0; PID_STAT_NUMERIC_FIELD_COUNT],
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte slice field `index`, one of the `PID_STAT_*` slots up to
    /// `PID_STAT_POLICY`.
    pub fn field(&self, index: usize) -> &[u8] {
        self.byte_slice_fields
            .get(index)
            .and_then(|r| self.buf.get(r.clone()))
            .unwrap_or_default()
    }

    pub fn byte_slice_fields(&self) -> &[Range<usize>; PID_STAT_BYTE_SLICE_FIELD_COUNT] {
        &self.byte_slice_fields
    }

    /// Indexed by `PID_STAT_MINFLT` .. `PID_STAT_STIME`.
    pub fn numeric_fields(&self) -> &[u64; PID_STAT_NUMERIC_FIELD_COUNT] {
        &self.numeric_fields
    }

    /// The raw content of the last file read.
    pub fn content(&self) -> &[u8] {
        &self.buf
    }

    pub fn parse(&mut self, pid: i32, tid: i32) -> Result<()> {
        self.path = pid_file_path(&self.procfs_root, pid, tid, "stat");
        self.buf.clear();
        self.fs
            .read_into(&self.path, &mut self.buf, 0)
            .map_err(|e| ProcfsError::io(&self.path, e))?;

        let buf = self.buf.as_slice();
        let path = &self.path;
        let syntax = |reason: String| ProcfsError::syntax(path, 1, buf, reason);

        let comm_start = buf
            .iter()
            .position(|&c| c == b'(')
            .map(|i| i + 1)
            .ok_or_else(|| syntax("cannot locate '('".into()))?;
        // comm may hold spaces and parens; its closing paren is the last one
        // within TASK_COMM_LEN, or failing that the last one overall.
        let search_end = (comm_start + TASK_COMM_LEN + 1).min(buf.len());
        let comm_end = buf[comm_start..search_end]
            .iter()
            .rposition(|&c| c == b')')
            .map(|i| comm_start + i)
            .or_else(|| {
                buf.iter()
                    .rposition(|&c| c == b')')
                    .filter(|&i| i >= comm_start)
            })
            .ok_or_else(|| syntax("cannot locate ')'".into()))?;
        self.byte_slice_fields[PID_STAT_COMM] = comm_start..comm_end;

        let line = &buf[..line_end(buf, comm_end)];
        let mut fields = FieldCursor::at(line, comm_end + 1);
        let mut field_num = PID_STAT_COMM_FIELD_NUM;
        while field_num < PID_STAT_MAX_FIELD_NUM {
            let Some(span) = fields.next_span() else {
                break;
            };
            field_num += 1;
            match PID_STAT_FIELD_HANDLING[field_num] {
                FieldHandling::Skip => {}
                FieldHandling::Bytes(index) => self.byte_slice_fields[index] = span,
                FieldHandling::Numeric(index) => {
                    self.numeric_fields[index] = decode_u64(&line[span]).ok_or_else(|| {
                        syntax(format!("field# {}: invalid number", field_num))
                    })?;
                }
            }
        }
        if field_num < PID_STAT_MAX_FIELD_NUM {
            return Err(syntax(format!(
                "not enough fields: want: {}, got: {}",
                PID_STAT_MAX_FIELD_NUM, field_num
            )));
        }
        Ok(())
    }
}
