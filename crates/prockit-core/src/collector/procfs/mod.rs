//! Parsers for Linux `/proc` files.
//!
//! Every parser owns its retained state and is driven by `parse()`, which
//! rereads the file and updates that state in place. Parsers for the same
//! file can share layout information through `sibling()`, e.g. to keep a
//! previous and a current snapshot for delta computation.

pub mod diskstats;
pub mod interrupts;
pub mod mountinfo;
pub mod net_dev;
pub mod net_snmp;
pub mod net_snmp6;
pub mod parser;
pub mod pid;
pub mod pid_cmdline;
pub mod pid_stat;
pub mod pid_status;
pub mod softirqs;
pub mod stat;

pub use diskstats::{DiskInfo, Diskstats};
pub use interrupts::{InterruptsInfo, Interrupts, IrqCounters, IrqInfo};
pub use mountinfo::{Mountinfo, MountinfoLine};
pub use net_dev::NetDev;
pub use net_snmp::{NetSnmp, NetSnmpLineInfo};
pub use net_snmp6::NetSnmp6;
pub use pid::{PID_ONLY_TID, pid_file_path};
pub use pid_cmdline::PidCmdline;
pub use pid_stat::PidStat;
pub use pid_status::PidStatus;
pub use softirqs::Softirqs;
pub use stat::{CpuStats, Stat};
