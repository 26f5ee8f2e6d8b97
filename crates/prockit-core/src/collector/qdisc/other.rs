use std::collections::HashMap;

use super::QdiscSource;
use crate::error::{ProcfsError, Result};

/// Placeholder transport, qdisc statistics are only available on Linux.
#[derive(Debug, Default)]
pub struct NetlinkQdiscSource;

impl NetlinkQdiscSource {
    pub fn new() -> Self {
        Self
    }
}

impl QdiscSource for NetlinkQdiscSource {
    fn dump(&mut self, _f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        Err(ProcfsError::Unsupported("qdisc"))
    }

    fn interface_names(&mut self, _into: &mut HashMap<u32, String>) -> Result<()> {
        Err(ProcfsError::Unsupported("qdisc"))
    }
}
