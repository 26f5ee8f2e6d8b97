//! Utility modules for prockit.

mod host;

pub use host::{HostFacts, host_facts, parse_os_release, parse_release_version};
