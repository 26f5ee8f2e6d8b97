//! Parser for `/proc/<pid>/mountinfo`.
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
//! ```
//!
//! The table rarely changes, so the previous content is retained and the
//! file is only decomposed again when its bytes differ.

use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::collector::bufpool::{READ_BUF_POOL_256K, ReadBufPool};
use crate::collector::procfs::parser::{FieldCursor, lines};
use crate::collector::procfs::pid::{PID_ONLY_TID, pid_file_path};
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::{ProcfsError, Result};

pub const MOUNTINFO_MOUNT_ID: usize = 0;
pub const MOUNTINFO_PARENT_ID: usize = 1;
pub const MOUNTINFO_MAJOR_MINOR: usize = 2;
pub const MOUNTINFO_ROOT: usize = 3;
pub const MOUNTINFO_MOUNT_POINT: usize = 4;
pub const MOUNTINFO_MOUNT_OPTIONS: usize = 5;
/// Possibly empty run of `tag[:value]` words.
pub const MOUNTINFO_OPTIONAL_FIELDS: usize = 6;
pub const MOUNTINFO_OPTIONAL_FIELDS_SEPARATOR: usize = 7;
pub const MOUNTINFO_FS_TYPE: usize = 8;
pub const MOUNTINFO_MOUNT_SOURCE: usize = 9;
pub const MOUNTINFO_SUPER_OPTIONS: usize = 10;

pub const MOUNTINFO_NUM_FIELDS: usize = 11;

const OPTIONAL_FIELDS_TERMINATOR: &[u8] = b"-";

static MOUNTINFO_READ_BUF_POOL: &ReadBufPool = &READ_BUF_POOL_256K;

/// Field spans of one mount, as offsets into the retained content.
pub type MountinfoLine = [Range<usize>; MOUNTINFO_NUM_FIELDS];

#[derive(Debug)]
pub struct Mountinfo<F: FileSystem = RealFs> {
    fs: F,
    procfs_root: PathBuf,
    path: PathBuf,
    pool: &'static ReadBufPool,
    content: Vec<u8>,
    parsed_lines: Vec<MountinfoLine>,
    changed: bool,
    force_update: bool,
    parse_count: u64,
    change_count: u64,
}

impl Mountinfo<RealFs> {
    pub fn new(procfs_root: impl AsRef<Path>) -> Self {
        Self::with_fs(RealFs::new(), procfs_root)
    }
}

impl<F: FileSystem + Clone> Mountinfo<F> {
    pub fn with_fs(fs: F, procfs_root: impl AsRef<Path>) -> Self {
        let procfs_root = procfs_root.as_ref().to_path_buf();
        Self {
            fs,
            path: pid_file_path(&procfs_root, 0, PID_ONLY_TID, "mountinfo"),
            pool: MOUNTINFO_READ_BUF_POOL,
            procfs_root,
            content: Vec::new(),
            parsed_lines: Vec::new(),
            changed: false,
            force_update: false,
            parse_count: 0,
            change_count: 0,
        }
    }

    /// With `full`, the retained content and its decomposition are copied,
    /// so the sibling reports `changed = false` on identical content.
    pub fn sibling(&self, full: bool) -> Self {
        let mut sibling = Self::with_fs(self.fs.clone(), &self.procfs_root);
        sibling.path = self.path.clone();
        sibling.pool = self.pool;
        sibling.force_update = self.force_update;
        if full {
            sibling.content = self.content.clone();
            sibling.parsed_lines = self.parsed_lines.clone();
            sibling.changed = self.changed;
            sibling.parse_count = self.parse_count;
            sibling.change_count = self.change_count;
        }
        sibling
    }

    /// Path of the last file read.
    /// Reads through `pool` instead of the default one.
    pub fn with_pool(mut self, pool: &'static ReadBufPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decompose the content on every parse, even when unchanged.
    pub fn set_force_update(&mut self, force_update: bool) {
        self.force_update = force_update;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn parse_count(&self) -> u64 {
        self.parse_count
    }

    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn parsed_lines(&self) -> &[MountinfoLine] {
        &self.parsed_lines
    }

    pub fn num_mounts(&self) -> usize {
        self.parsed_lines.len()
    }

    /// Field `field` of mount `index`, e.g. `field(0, MOUNTINFO_FS_TYPE)`.
    pub fn field(&self, index: usize, field: usize) -> Option<&[u8]> {
        let span = self.parsed_lines.get(index)?.get(field)?;
        self.content.get(span.clone())
    }

    /// Index of the first mount of device `major:minor`.
    pub fn find_by_major_minor(&self, major_minor: &str) -> Option<usize> {
        let major_minor = major_minor.as_bytes();
        self.parsed_lines
            .iter()
            .position(|l| &self.content[l[MOUNTINFO_MAJOR_MINOR].clone()] == major_minor)
    }

    /// Reads `<root>/<pid>/mountinfo`, `pid <= 0` selecting `self`.
    pub fn parse(&mut self, pid: i32) -> Result<()> {
        self.path = pid_file_path(&self.procfs_root, pid, PID_ONLY_TID, "mountinfo");
        let buf = self.pool.read_complete(&self.fs, &self.path)?;

        self.parse_count += 1;
        if !self.force_update && buf.as_slice() == self.content.as_slice() {
            self.changed = false;
            return Ok(());
        }

        let previous = std::mem::replace(&mut self.content, buf.into_vec());
        self.pool.return_buf(previous);
        if let Err(err) = decompose(&self.path, &self.content, &mut self.parsed_lines) {
            // Retaining it would hide the error on the next, identical, read.
            self.content.clear();
            self.parsed_lines.clear();
            self.changed = false;
            return Err(err);
        }
        self.changed = true;
        self.change_count += 1;
        debug!(
            "{}: {} mount(s), change #{}",
            self.path.display(),
            self.parsed_lines.len(),
            self.change_count
        );
        Ok(())
    }
}

fn decompose(path: &Path, content: &[u8], parsed_lines: &mut Vec<MountinfoLine>) -> Result<()> {
    parsed_lines.clear();
    for (line_num, line_start, line) in lines(content) {
        let syntax = |reason: &str| ProcfsError::syntax(path, line_num, line, reason);
        let shift = |r: Range<usize>| line_start + r.start..line_start + r.end;

        let mut fields: MountinfoLine = Default::default();
        let mut index = 0;
        let mut optional: Option<Range<usize>> = None;
        let mut cursor = FieldCursor::new(line);
        while let Some(span) = cursor.next_span() {
            if index >= MOUNTINFO_NUM_FIELDS {
                return Err(syntax("too many fields"));
            }
            if index != MOUNTINFO_OPTIONAL_FIELDS {
                fields[index] = shift(span);
                index += 1;
            } else if &line[span.clone()] == OPTIONAL_FIELDS_TERMINATOR {
                let words = optional.take().unwrap_or(span.start..span.start);
                fields[MOUNTINFO_OPTIONAL_FIELDS] = shift(words);
                fields[MOUNTINFO_OPTIONAL_FIELDS_SEPARATOR] = shift(span);
                index += 2;
            } else {
                optional = Some(match optional {
                    Some(words) => words.start..span.end,
                    None => span,
                });
            }
        }
        if index == 0 {
            continue;
        }
        if index < MOUNTINFO_NUM_FIELDS {
            return Err(syntax("missing fields"));
        }
        parsed_lines.push(fields);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    const MOUNTINFO: &str = "\
21 26 0:20 / /sys rw,nosuid,nodev,noexec,relatime shared:7 - sysfs sysfs rw
26 1 8:1 / / rw,relatime shared:1 master:2 - ext4 /dev/sda1 rw,errors=remount-ro
28 26 0:5 / /dev rw,nosuid - devtmpfs udev rw,size=4027148k,mode=755
";

    fn setup(content: &str) -> (MockFs, Mountinfo<MockFs>) {
        let fs = MockFs::new();
        fs.add_file("/proc/1/mountinfo", content);
        fs.add_file("/proc/self/mountinfo", content);
        let mountinfo = Mountinfo::with_fs(fs.clone(), "/proc");
        (fs, mountinfo)
    }

    #[test]
    fn test_parse_mountinfo() {
        let (_fs, mut mountinfo) = setup(MOUNTINFO);
        mountinfo.parse(1).unwrap();

        assert_eq!(mountinfo.path(), Path::new("/proc/1/mountinfo"));
        assert_eq!(mountinfo.num_mounts(), 3);
        assert_eq!(mountinfo.field(0, MOUNTINFO_MOUNT_POINT), Some(&b"/sys"[..]));
        assert_eq!(mountinfo.field(0, MOUNTINFO_OPTIONAL_FIELDS), Some(&b"shared:7"[..]));
        assert_eq!(
            mountinfo.field(1, MOUNTINFO_OPTIONAL_FIELDS),
            Some(&b"shared:1 master:2"[..])
        );
        assert_eq!(
            mountinfo.field(1, MOUNTINFO_OPTIONAL_FIELDS_SEPARATOR),
            Some(&b"-"[..])
        );
        assert_eq!(mountinfo.field(1, MOUNTINFO_FS_TYPE), Some(&b"ext4"[..]));
        assert_eq!(mountinfo.field(1, MOUNTINFO_MOUNT_SOURCE), Some(&b"/dev/sda1"[..]));
        assert_eq!(mountinfo.field(2, MOUNTINFO_OPTIONAL_FIELDS), Some(&b""[..]));
        assert_eq!(
            mountinfo.field(2, MOUNTINFO_SUPER_OPTIONS),
            Some(&b"rw,size=4027148k,mode=755"[..])
        );
        assert_eq!(mountinfo.find_by_major_minor("8:1"), Some(1));
        assert_eq!(mountinfo.find_by_major_minor("9:9"), None);
    }

    #[test]
    fn test_unchanged_content() {
        let (fs, mut mountinfo) = setup(MOUNTINFO);
        mountinfo.parse(0).unwrap();
        assert!(mountinfo.changed());
        mountinfo.parse(0).unwrap();
        assert!(!mountinfo.changed());
        assert_eq!(mountinfo.parse_count(), 2);
        assert_eq!(mountinfo.change_count(), 1);

        mountinfo.set_force_update(true);
        mountinfo.parse(0).unwrap();
        assert!(mountinfo.changed());
        mountinfo.set_force_update(false);

        let fewer: String = MOUNTINFO.lines().take(2).map(|l| format!("{l}\n")).collect();
        fs.add_file("/proc/self/mountinfo", fewer);
        mountinfo.parse(0).unwrap();
        assert!(mountinfo.changed());
        assert_eq!(mountinfo.num_mounts(), 2);
        assert_eq!(mountinfo.change_count(), 3);
    }

    #[test]
    fn test_invalid_lines() {
        let (fs, mut mountinfo) = setup("21 26 0:20 / /sys rw shared:7 sysfs sysfs rw\n");
        let err = mountinfo.parse(1).unwrap_err();
        assert!(matches!(err, ProcfsError::Syntax { line_num: 1, .. }));
        assert!(err.to_string().ends_with("missing fields"), "{err}");
        assert!(mountinfo.content().is_empty());

        fs.add_file("/proc/1/mountinfo", "21 26 0:20 / /sys rw - sysfs sysfs rw extra\n");
        let err = mountinfo.parse(1).unwrap_err();
        assert!(err.to_string().ends_with("too many fields"), "{err}");

        // Same bad content again: still reported.
        assert!(mountinfo.parse(1).is_err());
    }

    #[test]
    fn test_sibling() {
        let (_fs, mut mountinfo) = setup(MOUNTINFO);
        mountinfo.parse(1).unwrap();

        let mut full = mountinfo.sibling(true);
        assert_eq!(full.num_mounts(), 3);
        full.parse(1).unwrap();
        assert!(!full.changed());

        let mut empty = mountinfo.sibling(false);
        assert_eq!(empty.num_mounts(), 0);
        empty.parse(1).unwrap();
        assert!(empty.changed());
    }

    #[test]
    fn test_truncated_read() {
        static SMALL_READ_BUF_POOL: ReadBufPool = ReadBufPool::new(4, 64);

        let (_fs, mountinfo) = setup(MOUNTINFO);
        let mut mountinfo = mountinfo.with_pool(&SMALL_READ_BUF_POOL);
        let err = mountinfo.parse(1).unwrap_err();
        assert!(
            matches!(err, ProcfsError::Truncated { max_read_size: 64, .. }),
            "{err}"
        );
    }
}
