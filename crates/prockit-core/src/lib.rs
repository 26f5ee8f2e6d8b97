//! prockit-core: incremental, allocation-amortized parsers for Linux `/proc`.
//!
//! Provides:
//! - `collector` - buffer pool, scan reconciliation, per-file parsers,
//!   PID/TID list cache and the qdisc collector
//! - `error` - the shared error type
//! - `util` - host facts (clock tick, OS release, boot time)

pub mod collector;
pub mod error;
pub mod util;

pub use error::{ProcfsError, Result};
