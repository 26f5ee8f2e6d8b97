//! Incremental `/proc` collection.
//!
//! ```text
//!   PidTidListCache ──► partitions ──► PidStat / PidStatus / PidCmdline
//!
//!   Stat, Diskstats, Interrupts, Softirqs, NetDev, NetSnmp, NetSnmp6, Mountinfo
//!         │
//!         ├── ReadBufPool  (bounded reads into recycled buffers)
//!         ├── ScanCounter  (eviction of entries gone from the file)
//!         └── FileSystem   (RealFs, MockFs)
//!
//!   QdiscStats ──► QdiscSource (netlink)
//! ```
//!
//! # Testing (with MockFs)
//!
//! ```
//! use prockit_core::collector::MockFs;
//! use prockit_core::collector::procfs::Stat;
//!
//! let fs = MockFs::typical_system();
//! let mut stat = Stat::with_fs(fs, "/proc");
//! stat.parse().unwrap();
//! assert_eq!(stat.max_cpu_num(), Some(3));
//! ```

pub mod bufpool;
pub mod mock;
pub mod pid_list;
pub mod procfs;
pub mod qdisc;
pub mod scan;
pub mod traits;

pub use bufpool::{PoolBuf, ReadBufPool};
pub use mock::MockFs;
pub use pid_list::{PidTid, PidTidListCache, PidTidLister, PidTidSelection};
pub use qdisc::{QdiscInfo, QdiscKey, QdiscSource, QdiscStats};
pub use scan::{LastSeen, ScanCounter};
pub use traits::{FileSystem, RealFs};
