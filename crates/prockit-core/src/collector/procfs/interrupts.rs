//! Parser for `/proc/interrupts`.
//!
//! ```text
//!            CPU0       CPU1
//!   0:         22          0  IR-IO-APIC   2-edge            timer
//! 123:      25164    5760490  IR-PCI-MSI   1048576-edge      enp2s0
//! NMI:          0          0  Non-maskable interrupts
//! ERR:          0
//! ```
//!
//! The first line names the CPU columns; hot-unplugged CPUs leave gaps, so
//! the column index to CPU number mapping is kept whenever it is not the
//! identity. Numeric IRQs carry an info part (controller, hardware IRQ and
//! devices) that rarely changes; it is cached and only split again when the
//! bytes differ.
//!
//! The info cache lives in an [`InterruptsInfo`] shared by the previous and
//! current instances of a delta pair, so that "changed" is always relative to
//! the scan right before, whichever instance parsed it.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::collector::bufpool::{READ_BUF_POOL_256K, ReadBufPool};
use crate::collector::procfs::parser::{
    FieldCursor, decode_u64, lines, skip_space, trim_space, trim_span,
};
use crate::collector::scan::{LastSeen, ScanCounter, evict_stale};
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::{ProcfsError, Result};

static INTERRUPTS_READ_BUF_POOL: &ReadBufPool = &READ_BUF_POOL_256K;

/// Labels allowed to have fewer columns than there are CPUs.
const SHORT_ROW_LABELS: [&[u8]; 2] = [b"ERR", b"MIS"];

/// Parses a `CPU0 CPU1 ... CPUn` header.
///
/// Returns the number of columns and the column to CPU number mapping, `None`
/// when column `i` is `CPUi` for every column.
pub(crate) fn parse_cpu_header(
    line: &[u8],
) -> std::result::Result<(usize, Option<Vec<usize>>), String> {
    let mut cpu_list = Vec::new();
    let mut identity = true;
    let mut fields = FieldCursor::new(line);
    while let Some(field) = fields.next_field() {
        let cpu = field
            .strip_prefix(b"CPU")
            .filter(|num| !num.is_empty())
            .and_then(decode_u64)
            .ok_or_else(|| format!("invalid cpu spec {:?}", String::from_utf8_lossy(field)))?
            as usize;
        if cpu != cpu_list.len() {
            identity = false;
        }
        cpu_list.push(cpu);
    }
    let num_counters = cpu_list.len();
    Ok((num_counters, (!identity).then_some(cpu_list)))
}

/// Per-CPU counters of one IRQ line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrqCounters {
    pub values: Vec<u64>,
    pub(crate) last_seen_scan: u64,
}

impl LastSeen for IrqCounters {
    fn last_seen_scan(&self) -> u64 {
        self.last_seen_scan
    }
}

/// Cached description of one IRQ. The spans are empty for symbolic labels.
#[derive(Debug, Clone, Default)]
pub struct IrqInfo {
    info_line: Vec<u8>,
    controller: Range<usize>,
    hw_interrupt: Range<usize>,
    devices: Range<usize>,
    changed: bool,
    last_seen_scan: u64,
}

impl IrqInfo {
    pub fn controller(&self) -> &[u8] {
        &self.info_line[self.controller.clone()]
    }

    pub fn hw_interrupt(&self) -> &[u8] {
        &self.info_line[self.hw_interrupt.clone()]
    }

    /// Comma separated device list, as printed by the kernel.
    pub fn devices(&self) -> &[u8] {
        &self.info_line[self.devices.clone()]
    }

    pub fn info_line(&self) -> &[u8] {
        &self.info_line
    }

    /// `true` if the info part differs from the previous scan.
    pub fn changed(&self) -> bool {
        self.changed
    }

    fn update(&mut self, info_line: &[u8]) {
        self.info_line.clear();
        self.info_line.extend_from_slice(info_line);
        let line = &self.info_line;
        let mut fields = FieldCursor::new(line);
        let end = line.len();
        self.controller = fields.next_span().unwrap_or(end..end);
        self.hw_interrupt = fields.next_span().unwrap_or(end..end);
        self.devices = trim_span(line, fields.pos()..end);
    }
}

impl LastSeen for IrqInfo {
    fn last_seen_scan(&self) -> u64 {
        self.last_seen_scan
    }
}

/// IRQ descriptions and CPU header cache shared by sibling parsers.
#[derive(Debug, Default)]
pub struct InterruptsInfo {
    irq_info: HashMap<String, IrqInfo>,
    irq_changed: bool,
    cpu_list_changed: bool,
    cached_cpu_header: Vec<u8>,
    cpu_list: Option<Vec<usize>>,
    num_counters: usize,
    scan: ScanCounter,
}

impl InterruptsInfo {
    pub fn irq_info(&self) -> &HashMap<String, IrqInfo> {
        &self.irq_info
    }

    pub fn get(&self, irq: &str) -> Option<&IrqInfo> {
        self.irq_info.get(irq)
    }

    /// `true` if an IRQ appeared, disappeared or changed its info part.
    pub fn irq_changed(&self) -> bool {
        self.irq_changed
    }

    /// `true` if the CPU header differs from the previous scan.
    pub fn cpu_list_changed(&self) -> bool {
        self.cpu_list_changed
    }

    pub fn scan_number(&self) -> u64 {
        self.scan.current()
    }
}

fn lock_info(info: &Mutex<InterruptsInfo>) -> MutexGuard<'_, InterruptsInfo> {
    info.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
pub struct Interrupts<F: FileSystem = RealFs> {
    fs: F,
    path: PathBuf,
    pool: &'static ReadBufPool,
    counters: HashMap<String, IrqCounters>,
    cpu_list: Option<Vec<usize>>,
    num_counters: usize,
    info: Arc<Mutex<InterruptsInfo>>,
}

impl Interrupts<RealFs> {
    pub fn new(procfs_root: impl AsRef<Path>) -> Self {
        Self::with_fs(RealFs::new(), procfs_root)
    }
}

impl<F: FileSystem + Clone> Interrupts<F> {
    pub fn with_fs(fs: F, procfs_root: impl AsRef<Path>) -> Self {
        Self {
            fs,
            path: procfs_root.as_ref().join("interrupts"),
            pool: INTERRUPTS_READ_BUF_POOL,
            counters: HashMap::new(),
            cpu_list: None,
            num_counters: 0,
            info: Arc::new(Mutex::new(InterruptsInfo::default())),
        }
    }

    /// Creates an instance sharing this one's info object. With `full`, the
    /// counters are copied too; otherwise only the IRQ set is kept, zeroed.
    pub fn sibling(&self, full: bool) -> Self {
        let counters = if full {
            self.counters.clone()
        } else {
            self.counters
                .iter()
                .map(|(irq, c)| {
                    let c = IrqCounters {
                        values: vec![0; c.values.len()],
                        last_seen_scan: c.last_seen_scan,
                    };
                    (irq.clone(), c)
                })
                .collect()
        };
        Self {
            fs: self.fs.clone(),
            path: self.path.clone(),
            pool: self.pool,
            counters,
            cpu_list: self.cpu_list.clone(),
            num_counters: self.num_counters,
            info: Arc::clone(&self.info),
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

    pub fn counters(&self) -> &HashMap<String, IrqCounters> {
        &self.counters
    }

    pub fn irq_counters(&self, irq: &str) -> Option<&[u64]> {
        self.counters.get(irq).map(|c| c.values.as_slice())
    }

    /// Column index to CPU number, `None` when the mapping is the identity.
    pub fn cpu_list(&self) -> Option<&[usize]> {
        self.cpu_list.as_deref()
    }

    pub fn num_counters(&self) -> usize {
        self.num_counters
    }

    /// Shared IRQ info. Do not hold the guard across a `parse` of a sibling.
    pub fn info(&self) -> MutexGuard<'_, InterruptsInfo> {
        lock_info(&self.info)
    }

    pub fn parse(&mut self) -> Result<()> {
        let buf = self.pool.read_complete(&self.fs, &self.path)?;

        let path = &self.path;
        let mut info = lock_info(&self.info);
        let info = &mut *info;
        let scan = info.scan.advance();
        info.irq_changed = false;

        let mut lines = lines(&buf);
        let Some((_, _, header)) = lines.next() else {
            return Err(ProcfsError::schema(path, "missing CPU header"));
        };
        if header != info.cached_cpu_header.as_slice() {
            let (num_counters, cpu_list) = parse_cpu_header(header)
                .map_err(|reason| ProcfsError::syntax(path, 1, header, reason))?;
            debug!(
                "{}: CPU header changed: {} column(s), cpu_list={:?}",
                path.display(),
                num_counters,
                cpu_list
            );
            info.cached_cpu_header.clear();
            info.cached_cpu_header.extend_from_slice(header);
            info.num_counters = num_counters;
            info.cpu_list = cpu_list;
            info.cpu_list_changed = true;
        } else {
            info.cpu_list_changed = false;
        }
        if self.cpu_list != info.cpu_list {
            self.cpu_list.clone_from(&info.cpu_list);
        }
        self.num_counters = info.num_counters;
        let num_counters = self.num_counters;

        for (line_num, _, line) in lines {
            let syntax = |reason: String| ProcfsError::syntax(path, line_num, line, reason);

            let start = skip_space(line, 0);
            if start == line.len() {
                continue;
            }
            let colon = line[start..]
                .iter()
                .position(|&c| c == b':')
                .map(|i| start + i);
            let label = colon.map_or(&b""[..], |colon| trim_space(&line[start..colon]));
            let (Some(colon), false) = (colon, label.is_empty()) else {
                return Err(syntax("missing `IRQ:'".into()));
            };
            let irq = std::str::from_utf8(label).map_err(|_| syntax("invalid IRQ label".into()))?;
            let irq_is_num = label.iter().all(u8::is_ascii_digit);

            if !self.counters.contains_key(irq) {
                let counters = IrqCounters {
                    values: Vec::with_capacity(num_counters),
                    last_seen_scan: 0,
                };
                self.counters.insert(irq.to_owned(), counters);
            }
            let Some(counters) = self.counters.get_mut(irq) else {
                continue;
            };
            counters.values.resize(num_counters, 0);
            counters.last_seen_scan = scan;

            let mut fields = FieldCursor::at(line, colon + 1);
            for index in 0..num_counters {
                match fields.next_field() {
                    Some(field) => {
                        counters.values[index] = decode_u64(field).ok_or_else(|| {
                            syntax(format!("invalid number for counter index {}", index))
                        })?;
                    }
                    None if SHORT_ROW_LABELS.contains(&label) => {
                        counters.values[index..].fill(0);
                        break;
                    }
                    None => {
                        return Err(syntax(format!(
                            "invalid number of counters {} (< {})",
                            index, num_counters
                        )));
                    }
                }
            }

            if !info.irq_info.contains_key(irq) {
                info.irq_info.insert(irq.to_owned(), IrqInfo::default());
                info.irq_changed = true;
            }
            let Some(irq_info) = info.irq_info.get_mut(irq) else {
                continue;
            };
            irq_info.last_seen_scan = scan;
            irq_info.changed = false;
            if irq_is_num {
                let info_line = trim_space(fields.rest());
                if info_line != irq_info.info_line.as_slice() {
                    irq_info.update(info_line);
                    irq_info.changed = true;
                    info.irq_changed = true;
                }
            }
        }

        if evict_stale(&mut info.irq_info, scan) > 0 {
            info.irq_changed = true;
        }
        evict_stale(&mut self.counters, scan);
        Ok(())
    }
}
