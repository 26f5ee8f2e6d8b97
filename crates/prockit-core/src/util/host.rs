//! Host facts: OS identity, kernel clock tick, boot time and os-release.
//!
//! Detected once per process and cached. Every probe is best effort: a fact
//! that cannot be obtained is logged at warn level and replaced by a default.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::collector::traits::{FileSystem, RealFs};

/// Clock tick used when `sysconf(_SC_CLK_TCK)` is unavailable.
pub const DEFAULT_CLKTCK: i64 = 100;

const OS_RELEASE_FILES: [&str; 2] = ["/etc/os-release", "/usr/lib/os-release"];

static HOST_FACTS: LazyLock<HostFacts> = LazyLock::new(HostFacts::detect);

/// Returns the host facts of the running system, detecting them on first use.
pub fn host_facts() -> &'static HostFacts {
    &HOST_FACTS
}

#[derive(Debug, Clone, Serialize)]
pub struct HostFacts {
    /// `uname` sysname, e.g. `Linux`.
    pub sysname: String,
    /// Lower-cased sysname, e.g. `linux`.
    pub os_name: String,
    /// `uname` release, e.g. `6.8.0-45-generic`.
    pub os_release: String,
    /// Numeric components of the release; a trailing component that does not
    /// start with a digit is `-1`.
    pub os_release_ver: Vec<i32>,
    pub machine: String,
    pub boot_time: DateTime<Utc>,
    /// Kernel clock tick in Hz.
    pub clktck: i64,
    /// Key/value pairs from the first readable os-release file.
    pub os_release_info: HashMap<String, String>,
}

impl HostFacts {
    /// Probes the running system.
    pub fn detect() -> Self {
        Self::detect_with(&RealFs::new())
    }

    /// Probes the running system, reading os-release through `fs`.
    pub fn detect_with<F: FileSystem + ?Sized>(fs: &F) -> Self {
        let (sysname, os_release, machine) = uname().unwrap_or_else(|| {
            warn!("uname() failed, falling back to compile-time OS name");
            (std::env::consts::OS.to_string(), String::new(), std::env::consts::ARCH.to_string())
        });

        let clktck = clock_tick().unwrap_or_else(|| {
            warn!("sysconf(_SC_CLK_TCK) unavailable, using {}", DEFAULT_CLKTCK);
            DEFAULT_CLKTCK
        });

        let now = Utc::now();
        let boot_time = match uptime_secs() {
            Some(secs) => now - chrono::Duration::seconds(secs),
            None => now,
        };

        let facts = Self {
            os_name: sysname.to_lowercase(),
            os_release_ver: parse_release_version(&os_release),
            sysname,
            os_release,
            machine,
            boot_time,
            clktck,
            os_release_info: read_os_release(fs),
        };
        debug!(
            "host facts: os={} release={} machine={} clktck={}",
            facts.os_name, facts.os_release, facts.machine, facts.clktck
        );
        facts
    }

    /// Major kernel version, if known.
    pub fn release_major(&self) -> Option<i32> {
        self.os_release_ver.first().copied().filter(|&v| v >= 0)
    }

    /// Factor converting jiffies to milliseconds for `/proc/diskstats` busy
    /// time. Non-zero only on Linux 5.x and later.
    pub fn jiffies_to_ms(&self) -> u32 {
        let modern_linux = self.os_name == "linux" && self.release_major().is_some_and(|v| v >= 5);
        if modern_linux && self.clktck > 0 {
            (1000 / self.clktck) as u32
        } else {
            0
        }
    }
}

/// Splits a kernel release on `.`.
///
/// The last component may carry a suffix (`0-91-generic`); its leading digits
/// are used, or `-1` when there are none.
pub fn parse_release_version(release: &str) -> Vec<i32> {
    if release.is_empty() {
        return Vec::new();
    }
    release
        .split('.')
        .map(|part| {
            let digits_end = part
                .bytes()
                .position(|c| !c.is_ascii_digit())
                .unwrap_or(part.len());
            part[..digits_end].parse().unwrap_or(-1)
        })
        .collect()
}

/// Parses os-release content: `KEY=value` lines, optional surrounding quotes.
/// Comments and empty values are skipped.
pub fn parse_os_release(content: &str) -> HashMap<String, String> {
    let mut info = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some((key, val)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut val = val.trim();
        for quote in ['"', '\''] {
            if val.len() >= 2 && val.starts_with(quote) && val.ends_with(quote) {
                val = &val[1..val.len() - 1];
            }
        }
        if key.is_empty() || val.is_empty() {
            continue;
        }
        info.insert(key.to_string(), val.to_string());
    }
    info
}

fn read_os_release<F: FileSystem + ?Sized>(fs: &F) -> HashMap<String, String> {
    for file in OS_RELEASE_FILES {
        match fs.read_to_string(Path::new(file)) {
            Ok(content) => return parse_os_release(&content),
            Err(e) => debug!("{}: {}", file, e),
        }
    }
    HashMap::new()
}

#[cfg(unix)]
fn uname() -> Option<(String, String, String)> {
    fn c_field(field: &[libc::c_char]) -> String {
        let bytes: Vec<u8> = field
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    // SAFETY: utsname is plain data; uname() fills it in and NUL-terminates
    // every field.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    Some((c_field(&uts.sysname), c_field(&uts.release), c_field(&uts.machine)))
}

#[cfg(not(unix))]
fn uname() -> Option<(String, String, String)> {
    None
}

#[cfg(unix)]
fn clock_tick() -> Option<i64> {
    // SAFETY: sysconf has no memory safety preconditions.
    let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    (v > 0).then_some(v as i64)
}

#[cfg(not(unix))]
fn clock_tick() -> Option<i64> {
    None
}

#[cfg(target_os = "linux")]
fn uptime_secs() -> Option<i64> {
    // SAFETY: sysinfo is plain data filled in by the syscall.
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return None;
    }
    Some(info.uptime as i64)
}

#[cfg(not(target_os = "linux"))]
fn uptime_secs() -> Option<i64> {
    None
}
