//! Mock filesystem and canned `/proc` trees for tests and non-Linux hosts.

mod filesystem;
mod scenarios;

pub use filesystem::MockFs;
