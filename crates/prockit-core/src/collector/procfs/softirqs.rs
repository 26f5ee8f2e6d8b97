//! Parser for `/proc/softirqs`.
//!
//! Same layout as `/proc/interrupts` without the info part: a CPU header,
//! then one `LABEL: N N ... N` line per softirq with a counter for every
//! column.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::collector::bufpool::{READ_BUF_POOL_256K, ReadBufPool};
use crate::collector::procfs::interrupts::{IrqCounters, parse_cpu_header};
use crate::collector::procfs::parser::{FieldCursor, decode_u64, lines, skip_space, trim_space};
use crate::collector::scan::{ScanCounter, evict_stale};
use crate::collector::traits::{FileSystem, RealFs};
use crate::error::{ProcfsError, Result};

static SOFTIRQS_READ_BUF_POOL: &ReadBufPool = &READ_BUF_POOL_256K;

#[derive(Debug)]
pub struct Softirqs<F: FileSystem = RealFs> {
    fs: F,
    path: PathBuf,
    pool: &'static ReadBufPool,
    counters: HashMap<String, IrqCounters>,
    cpu_list: Option<Vec<usize>>,
    num_counters: usize,
    cached_cpu_header: Vec<u8>,
    index_to_cpu_changed: bool,
    scan: ScanCounter,
}

impl Softirqs<RealFs> {
    pub fn new(procfs_root: impl AsRef<Path>) -> Self {
        Self::with_fs(RealFs::new(), procfs_root)
    }
}

impl<F: FileSystem + Clone> Softirqs<F> {
    pub fn with_fs(fs: F, procfs_root: impl AsRef<Path>) -> Self {
        Self {
            fs,
            path: procfs_root.as_ref().join("softirqs"),
            pool: SOFTIRQS_READ_BUF_POOL,
            counters: HashMap::new(),
            cpu_list: None,
            num_counters: 0,
            cached_cpu_header: Vec::new(),
            index_to_cpu_changed: false,
            scan: ScanCounter::new(),
        }
    }

    /// Creates an instance with the same configuration and header cache.
    /// With `full`, the counters are copied too.
    pub fn sibling(&self, full: bool) -> Self {
        let counters = if full {
            self.counters.clone()
        } else {
            self.counters
                .iter()
                .map(|(irq, c)| {
                    let mut c = c.clone();
                    c.values.fill(0);
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
            cached_cpu_header: self.cached_cpu_header.clone(),
            index_to_cpu_changed: full && self.index_to_cpu_changed,
            scan: self.scan,
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

    /// `true` if the CPU header changed at the last parse.
    pub fn index_to_cpu_changed(&self) -> bool {
        self.index_to_cpu_changed
    }

    pub fn scan_number(&self) -> u64 {
        self.scan.current()
    }

    pub fn parse(&mut self) -> Result<()> {
        let buf = self.pool.read_complete(&self.fs, &self.path)?;

        let path = &self.path;
        let scan = self.scan.advance();

        let mut lines = lines(&buf);
        let Some((_, _, header)) = lines.next() else {
            return Err(ProcfsError::schema(path, "missing CPU header"));
        };
        self.index_to_cpu_changed = header != self.cached_cpu_header.as_slice();
        if self.index_to_cpu_changed {
            let (num_counters, cpu_list) = parse_cpu_header(header)
                .map_err(|reason| ProcfsError::syntax(path, 1, header, reason))?;
            debug!(
                "{}: CPU header changed: {} column(s)",
                path.display(),
                num_counters
            );
            self.cached_cpu_header.clear();
            self.cached_cpu_header.extend_from_slice(header);
            self.num_counters = num_counters;
            self.cpu_list = cpu_list;
        }
        let num_counters = self.num_counters;

        for (line_num, _, line) in lines {
            let syntax = |reason: String| ProcfsError::syntax(path, line_num, line, reason);

            let start = skip_space(line, 0);
            if start == line.len() {
                continue;
            }
            let label = line[start..]
                .iter()
                .position(|&c| c == b':')
                .map(|i| (start + i, trim_space(&line[start..start + i])))
                .filter(|(_, label)| !label.is_empty());
            let Some((colon, label)) = label else {
                return Err(syntax("invalid `SOFTIRQ:'".into()));
            };
            let irq = std::str::from_utf8(label)
                .map_err(|_| syntax("invalid `SOFTIRQ:'".into()))?;

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
                let Some(field) = fields.next_field() else {
                    return Err(syntax(format!(
                        "missing IRQs: want: {}, got: {}",
                        num_counters, index
                    )));
                };
                counters.values[index] =
                    decode_u64(field).ok_or_else(|| syntax("not a valid number".into()))?;
            }
            if !fields.at_end() {
                return Err(syntax("unexpected content after counters".into()));
            }
        }

        evict_stale(&mut self.counters, scan);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    const SOFTIRQS: &str = "\
                    CPU0       CPU1
          HI:          1          2
       TIMER:     261344     210484
      NET_TX:          3          4
      NET_RX:       4000       4001
";

    fn setup(content: &str) -> (MockFs, Softirqs<MockFs>) {
        let fs = MockFs::new();
        fs.add_file("/proc/softirqs", content);
        let softirqs = Softirqs::with_fs(fs.clone(), "/proc");
        (fs, softirqs)
    }

    #[test]
    fn test_parse_softirqs() {
        let (_fs, mut softirqs) = setup(SOFTIRQS);
        softirqs.parse().unwrap();

        assert_eq!(softirqs.num_counters(), 2);
        assert_eq!(softirqs.cpu_list(), None);
        assert!(softirqs.index_to_cpu_changed());
        assert_eq!(softirqs.irq_counters("HI"), Some(&[1, 2][..]));
        assert_eq!(softirqs.irq_counters("TIMER"), Some(&[261344, 210484][..]));
        assert_eq!(softirqs.irq_counters("NET_RX"), Some(&[4000, 4001][..]));
        assert_eq!(softirqs.counters().len(), 4);

        softirqs.parse().unwrap();
        assert!(!softirqs.index_to_cpu_changed());
        assert_eq!(softirqs.irq_counters("NET_TX"), Some(&[3, 4][..]));
    }

    #[test]
    fn test_remove_irq_and_cpu() {
        let (fs, mut softirqs) = setup(SOFTIRQS);
        softirqs.parse().unwrap();

        fs.add_file(
            "/proc/softirqs",
            "        CPU1\n  HI:   2\n  TIMER:  210485\n",
        );
        softirqs.parse().unwrap();
        assert!(softirqs.index_to_cpu_changed());
        assert_eq!(softirqs.cpu_list(), Some(&[1][..]));
        assert_eq!(softirqs.irq_counters("TIMER"), Some(&[210485][..]));
        assert!(softirqs.irq_counters("NET_RX").is_none());
        assert_eq!(softirqs.counters().len(), 2);
    }

    #[test]
    fn test_missing_columns() {
        let (_fs, mut softirqs) = setup("   CPU0  CPU1\n  HI:   2\n");
        let err = softirqs.parse().unwrap_err();
        assert!(err.to_string().ends_with("missing IRQs: want: 2, got: 1"), "{err}");
    }

    #[test]
    fn test_invalid_lines() {
        let (fs, mut softirqs) = setup("   CPU0\n  HI   2\n");
        let err = softirqs.parse().unwrap_err();
        assert!(err.to_string().ends_with("invalid `SOFTIRQ:'"), "{err}");

        fs.add_file("/proc/softirqs", "   CPU0\n  HI:   2x\n");
        assert!(matches!(
            softirqs.parse(),
            Err(ProcfsError::Syntax { line_num: 2, .. })
        ));

        fs.add_file("/proc/softirqs", "   CPU0\n  HI:   2 3\n");
        assert!(softirqs.parse().is_err());
    }

    #[test]
    fn test_sibling() {
        let (_fs, mut softirqs) = setup(SOFTIRQS);
        softirqs.parse().unwrap();
        let mut prev = softirqs.sibling(false);
        assert_eq!(prev.irq_counters("HI"), Some(&[0, 0][..]));
        prev.parse().unwrap();
        // Header cache was copied.
        assert!(!prev.index_to_cpu_changed());
        assert_eq!(prev.irq_counters("HI"), Some(&[1, 2][..]));
    }

    #[test]
    fn test_truncated_read() {
        static SMALL_READ_BUF_POOL: ReadBufPool = ReadBufPool::new(4, 64);

        let (_fs, softirqs) = setup(SOFTIRQS);
        let mut softirqs = softirqs.with_pool(&SMALL_READ_BUF_POOL);
        let err = softirqs.parse().unwrap_err();
        assert!(
            matches!(err, ProcfsError::Truncated { max_read_size: 64, .. }),
            "{err}"
        );
    }
}
