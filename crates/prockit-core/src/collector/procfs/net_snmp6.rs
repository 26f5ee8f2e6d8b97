//! Parser for `/proc/net/snmp6`.
//!
//! ```text
//! Ip6InReceives                   	1202
//! Ip6InHdrErrors                  	0
//! Ip6InTooBigErrors               	0
//! ```
//!
//! One `Name Value` pair per line, all values `u64` (see `net/ipv6/proc.c`).
//! The names are collected on the first parse together with a signature,
//! `Name1 Name2 ... ` (space terminated). Later parses check the names
//! against that signature in one forward pass instead of storing them again.

use std::path::{Path, PathBuf};

use crate::collector::bufpool::{READ_BUF_POOL_32K, ReadBufPool};
use crate::collector::procfs::parser::{FieldCursor, decode_u64, lines};
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::{ProcfsError, Result};

const NAME_CHECK_SEP: u8 = b' ';

static NET_SNMP6_READ_BUF_POOL: &ReadBufPool = &READ_BUF_POOL_32K;

#[derive(Debug)]
pub struct NetSnmp6<F: FileSystem = RealFs> {
    fs: F,
    path: PathBuf,
    pool: &'static ReadBufPool,
    names: Vec<String>,
    values: Vec<u64>,
    name_check_ref: Option<Vec<u8>>,
}

impl NetSnmp6<RealFs> {
    pub fn new(procfs_root: impl AsRef<Path>) -> Self {
        Self::with_fs(RealFs::new(), procfs_root)
    }
}

impl<F: FileSystem + Clone> NetSnmp6<F> {
    pub fn with_fs(fs: F, procfs_root: impl AsRef<Path>) -> Self {
        Self {
            fs,
            path: procfs_root.as_ref().join("net").join("snmp6"),
            pool: NET_SNMP6_READ_BUF_POOL,
            names: Vec::new(),
            values: Vec::new(),
            name_check_ref: None,
        }
    }

    pub fn sibling(&self, full: bool) -> Self {
        Self {
            fs: self.fs.clone(),
            path: self.path.clone(),
            pool: self.pool,
            names: self.names.clone(),
            values: if full {
                self.values.clone()
            } else {
                vec![0; self.values.len()]
            },
            name_check_ref: self.name_check_ref.clone(),
        }
    }

    /// Reads through `pool` instead of the default one.
    pub fn with_pool(mut self, pool: &'static ReadBufPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[u64] {
        &self.values
    }

    /// The names signature, available after the first successful parse.
    pub fn name_check_ref(&self) -> Option<&[u8]> {
        self.name_check_ref.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i).copied())
    }

    pub fn parse(&mut self) -> Result<()> {
        let buf = self.pool.read_complete(&self.fs, &self.path)?;

        let path = &self.path;
        let first_pass = self.name_check_ref.is_none();
        let mut names = Vec::new();
        let mut values = Vec::new();
        let mut new_ref = Vec::new();
        let name_check_ref = self.name_check_ref.as_deref().unwrap_or_default();
        let mut name_check_pos = 0;
        let mut value_index = 0;

        for (line_num, _, line) in lines(&buf) {
            let syntax = |reason: &str| ProcfsError::syntax(path, line_num, line, reason);

            let mut fields = FieldCursor::new(line);
            let Some(name) = fields.next_field() else {
                continue;
            };
            if first_pass {
                names.push(String::from_utf8_lossy(name).into_owned());
                new_ref.extend_from_slice(name);
                new_ref.push(NAME_CHECK_SEP);
            } else {
                let end = name_check_pos + name.len();
                if name_check_ref.get(name_check_pos..end) != Some(name)
                    || name_check_ref.get(end) != Some(&NAME_CHECK_SEP)
                {
                    return Err(syntax("invalid name, not seen before at this line"));
                }
                name_check_pos = end + 1;
            }

            let value = fields.next_field().ok_or_else(|| syntax("missing value"))?;
            let value = decode_u64(value).ok_or_else(|| syntax("invalid value"))?;
            if !fields.at_end() {
                return Err(syntax("invalid value"));
            }
            if first_pass {
                values.push(value);
            } else {
                // The name matched, so the index is within the parallel lists.
                self.values[value_index] = value;
                value_index += 1;
            }
        }

        if first_pass {
            self.names = names;
            self.values = values;
            self.name_check_ref = Some(new_ref);
        } else if name_check_pos != name_check_ref.len() {
            return Err(ProcfsError::schema(
                path,
                format!(
                    "missing names: {:?}",
                    String::from_utf8_lossy(&name_check_ref[name_check_pos..])
                ),
            ));
        }
        Ok(())
    }
}
