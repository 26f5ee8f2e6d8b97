//! Parser for `/proc/net/snmp`.
//!
//! ```text
//! Tcp: RtoAlgorithm RtoMin RtoMax MaxConn ActiveOpens ...
//! Tcp: 1 200 120000 -1 98 ...
//! Udp: InDatagrams NoPorts InErrors OutDatagrams ...
//! Udp: 1006 16 0 1023 ...
//! ```
//!
//! Lines come in pairs: the odd one names the stats, the even one holds
//! their values. Names are only read on the first parse and become
//! `protoStat`, e.g. `tcpMaxConn`, matching the RFC 1213 object names.
//! Values are signed since `tcpMaxConn` may be `-1`.

use std::path::{Path, PathBuf};

use crate::collector::bufpool::{READ_BUF_POOL_256K, ReadBufPool};
use crate::collector::procfs::parser::{FieldCursor, decode_i64, lines};
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::{ProcfsError, Result};

static NET_SNMP_READ_BUF_POOL: &ReadBufPool = &READ_BUF_POOL_256K;

/// Expected shape of a value line, captured from the names line before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetSnmpLineInfo {
    /// `Proto:`, including the colon.
    pub prefix: Vec<u8>,
    pub num_vals: usize,
}

#[derive(Debug)]
pub struct NetSnmp<F: FileSystem = RealFs> {
    fs: F,
    path: PathBuf,
    pool: &'static ReadBufPool,
    names: Vec<String>,
    values: Vec<i64>,
    line_info: Vec<NetSnmpLineInfo>,
}

impl NetSnmp<RealFs> {
    pub fn new(procfs_root: impl AsRef<Path>) -> Self {
        Self::with_fs(RealFs::new(), procfs_root)
    }
}

impl<F: FileSystem + Clone> NetSnmp<F> {
    pub fn with_fs(fs: F, procfs_root: impl AsRef<Path>) -> Self {
        Self {
            fs,
            path: procfs_root.as_ref().join("net").join("snmp"),
            pool: NET_SNMP_READ_BUF_POOL,
            names: Vec::new(),
            values: Vec::new(),
            line_info: Vec::new(),
        }
    }

    /// Creates an instance with the same names and line info. With `full`,
    /// the values are copied too, otherwise they are zeroed.
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
            line_info: self.line_info.clone(),
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

    /// Parallel to [`values`](Self::values).
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }

    pub fn line_info(&self) -> &[NetSnmpLineInfo] {
        &self.line_info
    }

    /// Looks up a value by its `protoStat` name.
    pub fn get(&self, name: &str) -> Option<i64> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i).copied())
    }

    fn parse_names(&mut self, line_num: usize, line: &[u8]) -> Result<()> {
        let mut fields = FieldCursor::new(line);
        let prefix = fields
            .next_field()
            .filter(|p| p.len() >= 2 && p.ends_with(b":"))
            .filter(|_| !fields.at_end())
            .ok_or_else(|| {
                ProcfsError::syntax(
                    &self.path,
                    line_num,
                    line,
                    "invalid line, not PROTO: STAT STAT...",
                )
            })?;
        let proto = String::from_utf8_lossy(&prefix[..prefix.len() - 1]).to_lowercase();
        let mut num_vals = 0;
        while let Some(stat) = fields.next_field() {
            self.names
                .push(format!("{}{}", proto, String::from_utf8_lossy(stat)));
            num_vals += 1;
        }
        self.values.resize(self.names.len(), 0);
        self.line_info.push(NetSnmpLineInfo {
            prefix: prefix.to_vec(),
            num_vals,
        });
        Ok(())
    }

    pub fn parse(&mut self) -> Result<()> {
        let buf = self.pool.read_complete(&self.fs, &self.path)?;

        let parse_names = self.names.is_empty();
        let result = self.parse_content(&buf, parse_names);
        if result.is_err() && parse_names {
            // Only a complete set of names is pinned.
            self.names.clear();
            self.values.clear();
            self.line_info.clear();
        }
        result
    }

    fn parse_content(&mut self, buf: &[u8], parse_names: bool) -> Result<()> {
        let mut value_index = 0;
        let mut num_lines = 0;
        for (line_num, _, line) in lines(buf) {
            num_lines = line_num;
            if line_num & 1 == 1 {
                if parse_names {
                    self.parse_names(line_num, line)?;
                }
                continue;
            }

            let path = &self.path;
            let syntax = |reason: String| ProcfsError::syntax(path, line_num, line, reason);

            let Some(info) = self.line_info.get((line_num - 1) >> 1) else {
                return Err(syntax(format!(
                    "unexpected line# (> {})",
                    self.line_info.len() * 2
                )));
            };
            if !line.starts_with(&info.prefix) {
                return Err(syntax(format!(
                    "unexpected prefix, want {:?}",
                    String::from_utf8_lossy(&info.prefix)
                )));
            }

            let mut fields = FieldCursor::at(line, info.prefix.len());
            let mut num_vals = 0;
            while let Some(field) = fields.next_field() {
                num_vals += 1;
                if num_vals > info.num_vals || value_index >= self.values.len() {
                    return Err(syntax(format!("too many values (> {})", info.num_vals)));
                }
                self.values[value_index] =
                    decode_i64(field).ok_or_else(|| syntax("invalid value".into()))?;
                value_index += 1;
            }
            if num_vals < info.num_vals {
                return Err(syntax(format!("not enough values (< {})", info.num_vals)));
            }
        }
        if num_lines != self.line_info.len() * 2 {
            return Err(ProcfsError::schema(
                &self.path,
                format!(
                    "unexpected line count {} (!= {})",
                    num_lines,
                    self.line_info.len() * 2
                ),
            ));
        }
        Ok(())
    }
}
