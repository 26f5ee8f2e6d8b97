//! Path construction for per-process and per-thread files.

use std::path::{Path, PathBuf};

/// `tid` value selecting the process-level file instead of a thread's.
pub const PID_ONLY_TID: i32 = 0;

/// Builds `<root>/<pid>[/task/<tid>]/<name>`.
///
/// A `pid <= 0` renders as `self`; `tid == PID_ONLY_TID` omits the task part.
pub fn pid_file_path(root: &Path, pid: i32, tid: i32, name: &str) -> PathBuf {
    let mut path = if pid > 0 {
        root.join(pid.to_string())
    } else {
        root.join("self")
    };
    if tid != PID_ONLY_TID {
        path.push("task");
        path.push(tid.to_string());
    }
    path.push(name);
    path
}
