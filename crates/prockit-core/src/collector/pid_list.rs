//! Partitioned, time-bounded cache of the PIDs and TIDs under `/proc`.
//!
//! Per-process parsing is spread over several workers. Rather than having
//! each of them list `/proc`, one listing is shared for `valid_for` and split
//! into `num_partitions` disjoint lists, worker `i` taking the identifiers
//! `id % num_partitions == i`.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::collector::procfs::parser::decode_u64;
use crate::collector::procfs::pid::PID_ONLY_TID;
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::{ProcfsError, Result};

/// A process, `tid == PID_ONLY_TID`, or one of its threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PidTid {
    pub pid: i32,
    pub tid: i32,
}

impl PidTid {
    pub fn is_pid_only(&self) -> bool {
        self.tid == PID_ONLY_TID
    }
}

/// What the cache enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PidTidSelection {
    #[default]
    Pid,
    Tid,
    Both,
}

impl PidTidSelection {
    fn pids(self) -> bool {
        matches!(self, Self::Pid | Self::Both)
    }

    fn tids(self) -> bool {
        matches!(self, Self::Tid | Self::Both)
    }
}

/// Source of per-partition PID/TID lists; lets workers be tested against a
/// canned list.
pub trait PidTidLister: Send + Sync {
    /// Replaces the content of `into` with the identifiers of `partition`.
    fn get_pid_tid_list(&self, partition: usize, into: &mut Vec<PidTid>) -> Result<()>;

    /// Forces a refresh at the next call to `get_pid_tid_list`.
    fn invalidate(&self);

    fn refresh_count(&self) -> u64;
}

#[derive(Debug, Default)]
struct ListState {
    partitions: Vec<Vec<PidTid>>,
    /// `None` until the first refresh and after an invalidation.
    retrieved: Option<Instant>,
    refresh_count: u64,
}

#[derive(Debug)]
pub struct PidTidListCache<F: FileSystem = RealFs> {
    fs: F,
    procfs_root: PathBuf,
    num_partitions: usize,
    /// Replaces the modulo when `num_partitions` is a power of 2.
    mask: Option<usize>,
    valid_for: Duration,
    selection: PidTidSelection,
    state: Mutex<ListState>,
}

impl PidTidListCache<RealFs> {
    pub fn new(
        procfs_root: impl AsRef<Path>,
        num_partitions: usize,
        valid_for: Duration,
        selection: PidTidSelection,
    ) -> Self {
        Self::with_fs(RealFs::new(), procfs_root, num_partitions, valid_for, selection)
    }
}

impl<F: FileSystem> PidTidListCache<F> {
    /// `num_partitions` below 1 is raised to 1.
    pub fn with_fs(
        fs: F,
        procfs_root: impl AsRef<Path>,
        num_partitions: usize,
        valid_for: Duration,
        selection: PidTidSelection,
    ) -> Self {
        let num_partitions = num_partitions.max(1);
        let mask = num_partitions
            .is_power_of_two()
            .then(|| num_partitions - 1);
        Self {
            fs,
            procfs_root: procfs_root.as_ref().to_path_buf(),
            num_partitions,
            mask,
            valid_for,
            selection,
            state: Mutex::new(ListState {
                partitions: vec![Vec::new(); num_partitions],
                ..Default::default()
            }),
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn selection(&self) -> PidTidSelection {
        self.selection
    }

    // The lists are rebuilt from scratch at each refresh, nothing a panic
    // could leave half-updated matters.
    fn lock(&self) -> MutexGuard<'_, ListState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn partition_of(&self, id: i32) -> usize {
        let id = id as usize;
        match self.mask {
            Some(mask) => id & mask,
            None => id % self.num_partitions,
        }
    }

    /// Lists `procfs_root` and rebuilds every partition.
    fn refresh(&self, state: &mut ListState) -> Result<()> {
        for partition in &mut state.partitions {
            partition.clear();
        }

        let entries = self
            .fs
            .read_dir(&self.procfs_root)
            .map_err(|e| ProcfsError::io(&self.procfs_root, e))?;
        let mut num_entries = 0;
        for entry in &entries {
            let Some(pid) = positive_id(entry) else {
                continue;
            };
            if self.selection.pids() {
                state.partitions[self.partition_of(pid)].push(PidTid {
                    pid,
                    tid: PID_ONLY_TID,
                });
                num_entries += 1;
            }
            if self.selection.tids() {
                // The process may be gone by now.
                let Ok(tasks) = self.fs.read_dir(&entry.join("task")) else {
                    continue;
                };
                for task in &tasks {
                    let Some(tid) = positive_id(task) else {
                        continue;
                    };
                    state.partitions[self.partition_of(tid)].push(PidTid { pid, tid });
                    num_entries += 1;
                }
            }
        }

        state.retrieved = Some(Instant::now());
        state.refresh_count += 1;
        debug!(
            "{}: {} pid/tid entries in {} partition(s)",
            self.procfs_root.display(),
            num_entries,
            self.num_partitions
        );
        Ok(())
    }
}

impl<F: FileSystem> PidTidLister for PidTidListCache<F> {
    fn get_pid_tid_list(&self, partition: usize, into: &mut Vec<PidTid>) -> Result<()> {
        if partition >= self.num_partitions {
            return Err(ProcfsError::InvalidPartition {
                partition,
                num_partitions: self.num_partitions,
            });
        }
        let mut state = self.lock();
        let expired = state
            .retrieved
            .is_none_or(|retrieved| retrieved.elapsed() > self.valid_for);
        if expired {
            self.refresh(&mut state)?;
        }
        into.clear();
        into.extend_from_slice(&state.partitions[partition]);
        Ok(())
    }

    fn invalidate(&self) {
        self.lock().retrieved = None;
    }

    fn refresh_count(&self) -> u64 {
        self.lock().refresh_count
    }
}

/// The entry name as a PID or TID, if it is a positive decimal.
fn positive_id(entry: &Path) -> Option<i32> {
    let name = entry.file_name()?.to_str()?;
    decode_u64(name.as_bytes())
        .and_then(|id| i32::try_from(id).ok())
        .filter(|&id| id > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    fn mock_procfs() -> MockFs {
        let fs = MockFs::new();
        fs.add_process("/proc", 1, &[1], "", "", b"");
        fs.add_process("/proc", 2, &[2, 3, 5], "", "", b"");
        fs.add_process("/proc", 10, &[10, 11], "", "", b"");
        fs.add_file("/proc/stat", "");
        fs.add_dir("/proc/self");
        fs.add_dir("/proc/sys");
        fs
    }

    fn collect_all(cache: &impl PidTidLister, num_partitions: usize) -> Vec<Vec<PidTid>> {
        let mut all = Vec::new();
        for partition in 0..num_partitions {
            let mut list = Vec::new();
            cache.get_pid_tid_list(partition, &mut list).unwrap();
            list.sort();
            all.push(list);
        }
        all
    }

    fn pid_tid(pid: i32, tid: i32) -> PidTid {
        PidTid { pid, tid }
    }

    #[test]
    fn test_pid_only() {
        let cache = PidTidListCache::with_fs(
            mock_procfs(),
            "/proc",
            1,
            Duration::from_secs(60),
            PidTidSelection::Pid,
        );
        let all = collect_all(&cache, 1);
        assert_eq!(all[0], vec![pid_tid(1, 0), pid_tid(2, 0), pid_tid(10, 0)]);
        assert!(all[0].iter().all(PidTid::is_pid_only));
    }

    #[test]
    fn test_partitions_power_of_two() {
        let cache = PidTidListCache::with_fs(
            mock_procfs(),
            "/proc",
            4,
            Duration::from_secs(60),
            PidTidSelection::Tid,
        );
        let all = collect_all(&cache, 4);
        assert!(all[0].is_empty());
        assert_eq!(all[1], vec![pid_tid(1, 1), pid_tid(2, 5)]);
        assert_eq!(all[2], vec![pid_tid(2, 2), pid_tid(10, 10)]);
        assert_eq!(all[3], vec![pid_tid(2, 3), pid_tid(10, 11)]);
        // All partitions came from one listing.
        assert_eq!(cache.refresh_count(), 1);
    }

    #[test]
    fn test_partitions_modulo() {
        let cache = PidTidListCache::with_fs(
            mock_procfs(),
            "/proc",
            3,
            Duration::from_secs(60),
            PidTidSelection::Both,
        );
        let all = collect_all(&cache, 3);
        let mut union: Vec<PidTid> = all.iter().flatten().copied().collect();
        union.sort();
        assert_eq!(union.len(), 9);
        for (partition, list) in all.iter().enumerate() {
            for entry in list {
                let id = if entry.is_pid_only() { entry.pid } else { entry.tid };
                assert_eq!(id as usize % 3, partition, "{entry:?}");
            }
        }
    }

    #[test]
    fn test_validity_and_invalidate() {
        let fs = mock_procfs();
        let cache = PidTidListCache::with_fs(
            fs.clone(),
            "/proc",
            1,
            Duration::from_secs(3600),
            PidTidSelection::Pid,
        );
        let mut list = Vec::new();
        cache.get_pid_tid_list(0, &mut list).unwrap();
        assert_eq!(list.len(), 3);

        fs.add_process("/proc", 42, &[42], "", "", b"");
        cache.get_pid_tid_list(0, &mut list).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(cache.refresh_count(), 1);

        cache.invalidate();
        cache.get_pid_tid_list(0, &mut list).unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(cache.refresh_count(), 2);
    }

    #[test]
    fn test_expired_listing() {
        let cache = PidTidListCache::with_fs(
            mock_procfs(),
            "/proc",
            1,
            Duration::ZERO,
            PidTidSelection::Pid,
        );
        let mut list = Vec::new();
        cache.get_pid_tid_list(0, &mut list).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        cache.get_pid_tid_list(0, &mut list).unwrap();
        assert_eq!(cache.refresh_count(), 2);
    }

    #[test]
    fn test_errors() {
        let cache = PidTidListCache::with_fs(
            MockFs::new(),
            "/proc",
            2,
            Duration::from_secs(60),
            PidTidSelection::Both,
        );
        let mut list = Vec::new();
        assert!(matches!(
            cache.get_pid_tid_list(2, &mut list),
            Err(ProcfsError::InvalidPartition {
                partition: 2,
                num_partitions: 2
            })
        ));
        let err = cache.get_pid_tid_list(0, &mut list).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_real_fs_listing() {
        let dir = tempfile::tempdir().unwrap();
        for (pid, tids) in [("7", &["7", "8"][..]), ("9", &["9"][..])] {
            for tid in tids {
                std::fs::create_dir_all(dir.path().join(pid).join("task").join(tid)).unwrap();
            }
        }
        std::fs::create_dir(dir.path().join("net")).unwrap();

        let cache =
            PidTidListCache::new(dir.path(), 1, Duration::from_secs(60), PidTidSelection::Both);
        let mut list = Vec::new();
        cache.get_pid_tid_list(0, &mut list).unwrap();
        list.sort();
        assert_eq!(
            list,
            vec![
                pid_tid(7, 0),
                pid_tid(7, 7),
                pid_tid(7, 8),
                pid_tid(9, 0),
                pid_tid(9, 9)
            ]
        );
    }
}
