//! In-memory mock filesystem for testing parsers without real `/proc`.
//!
//! `MockFs` simulates a filesystem in memory so tests can run on macOS and in
//! CI environments without Linux. Clones share the same contents, so a test
//! can hand one handle to a parser and rewrite files through another between
//! two scans.

use crate::collector::traits::FileSystem;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct MockFsState {
    /// Map from path to file contents.
    files: HashMap<PathBuf, Vec<u8>>,
    /// Set of directories (for read_dir support).
    directories: HashSet<PathBuf>,
}

impl MockFsState {
    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }
}

/// In-memory filesystem for testing.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    state: Arc<RwLock<MockFsState>>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, MockFsState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, MockFsState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds or replaces a file with the given content.
    ///
    /// Parent directories are automatically created.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl AsRef<[u8]>) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.write_state();
        state.add_parents(&path);
        state.files.insert(path, content.as_ref().to_vec());
    }

    /// Adds an empty directory and its parents.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.write_state();
        state.add_parents(&path);
        state.directories.insert(path);
    }

    /// Removes a file; returns `true` if it existed.
    pub fn remove_file(&self, path: impl AsRef<Path>) -> bool {
        self.write_state().files.remove(path.as_ref()).is_some()
    }

    /// Removes a directory together with everything below it.
    pub fn remove_dir_all(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut state = self.write_state();
        state.files.retain(|p, _| !p.starts_with(path));
        state.directories.retain(|p| !p.starts_with(path));
    }

    /// Adds a process with its `stat`, `status` and `cmdline` files under
    /// `<root>/<pid>/`, plus a `task/<tid>/` directory for every thread.
    ///
    /// # Arguments
    /// * `root` - procfs root, usually `/proc`
    /// * `pid` - Process ID
    /// * `tids` - Thread IDs; the main thread is not added implicitly
    /// * `stat` - Content of `stat`
    /// * `status` - Content of `status`
    /// * `cmdline` - Content of `cmdline` (NUL separated)
    pub fn add_process(
        &self,
        root: impl AsRef<Path>,
        pid: u32,
        tids: &[u32],
        stat: &str,
        status: &str,
        cmdline: &[u8],
    ) {
        let base = root.as_ref().join(pid.to_string());
        self.add_dir(base.join("task"));
        self.add_file(base.join("stat"), stat);
        self.add_file(base.join("status"), status);
        self.add_file(base.join("cmdline"), cmdline);
        for tid in tids {
            let task = base.join("task").join(tid.to_string());
            self.add_file(task.join("stat"), stat);
            self.add_file(task.join("status"), status);
            self.add_file(task.join("cmdline"), cmdline);
        }
    }

    /// Loads a mock filesystem from a directory snapshot, mounted at `/proc`.
    ///
    /// This is useful for regression tests with real `/proc` snapshots.
    pub fn from_snapshot(dir: &Path) -> io::Result<Self> {
        let fs = Self::new();
        load_directory_recursive(&fs, dir, Path::new("/proc"))?;
        Ok(fs)
    }
}

fn load_directory_recursive(fs: &MockFs, real_path: &Path, virtual_path: &Path) -> io::Result<()> {
    fs.add_dir(virtual_path);

    for entry in std::fs::read_dir(real_path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let real_child = entry.path();
        let virtual_child = virtual_path.join(entry.file_name());

        if file_type.is_dir() {
            load_directory_recursive(fs, &real_child, &virtual_child)?;
        } else if file_type.is_file() {
            fs.add_file(&virtual_child, std::fs::read(&real_child)?);
        }
    }
    Ok(())
}

impl FileSystem for MockFs {
    fn read_into(&self, path: &Path, buf: &mut Vec<u8>, limit: usize) -> io::Result<usize> {
        let state = self.read_state();
        let content = state.files.get(path).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })?;
        let n = if limit > 0 {
            content.len().min(limit)
        } else {
            content.len()
        };
        buf.extend_from_slice(&content[..n]);
        Ok(n)
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.read_state();
        state.files.contains_key(path) || state.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let state = self.read_state();
        if !state.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory not found: {:?}", path),
            ));
        }

        let mut entries = HashSet::new();

        // Direct children only
        for file_path in state.files.keys() {
            if file_path.parent().is_some_and(|parent| parent == path) {
                entries.insert(file_path.clone());
            }
        }

        for dir_path in &state.directories {
            if dir_path.parent().is_some_and(|parent| parent == path) && dir_path != path {
                entries.insert(dir_path.clone());
            }
        }

        Ok(entries.into_iter().collect())
    }
}
