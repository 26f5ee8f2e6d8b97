//! prockitd - procfs scan driver.
//!
//! Runs every prockit parser on an interval, alternating between a previous
//! and a current instance of each system-wide parser, and fans the per-process
//! parsers out over one worker thread per PID/TID partition. Each scan ends
//! with a one-line summary, optionally printed as JSON.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Releases unused memory back to the operating system.
fn release_memory_to_os() {
    // SAFETY: arena.0.purge takes no input or output, both pointers are null.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(not(target_os = "linux"))]
use prockit_core::collector::MockFs;
#[cfg(target_os = "linux")]
use prockit_core::collector::RealFs;
use prockit_core::collector::procfs::stat::STAT_CTXT;
use prockit_core::collector::procfs::{
    Diskstats, Interrupts, Mountinfo, NetDev, NetSnmp, NetSnmp6, PidCmdline, PidStat, PidStatus,
    Softirqs, Stat,
};
use prockit_core::collector::{
    FileSystem, PidTid, PidTidListCache, PidTidLister, PidTidSelection, QdiscStats,
};
use prockit_core::util::host_facts;

/// procfs scan driver.
#[derive(Parser)]
#[command(name = "prockitd", about = "procfs scan driver", version)]
struct Args {
    /// Root of the procfs mount.
    #[arg(long, env = "PROCKIT_PROCFS_ROOT", default_value = "/proc")]
    procfs_root: PathBuf,

    /// Scan interval in seconds.
    #[arg(short, long, env = "PROCKIT_INTERVAL", default_value = "5")]
    interval: u64,

    /// Number of scans to run, 0 for no limit.
    #[arg(short, long, env = "PROCKIT_COUNT", default_value = "0")]
    count: u64,

    /// Number of PID/TID partitions, one worker thread each.
    #[arg(short, long, env = "PROCKIT_PARTITIONS", default_value = "4")]
    partitions: usize,

    /// How long a `/proc` listing is reused, in milliseconds.
    #[arg(long, env = "PROCKIT_PID_LIST_VALID_FOR", default_value = "1000")]
    pid_list_valid_for: u64,

    /// What the per-process parsers are run for.
    #[arg(long, env = "PROCKIT_PID_LIST", value_enum, default_value_t = PidListArg::Pid)]
    pid_list: PidListArg,

    /// Print each scan summary as a JSON line on stdout.
    #[arg(long, env = "PROCKIT_JSON")]
    json: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PidListArg {
    Pid,
    Tid,
    Both,
}

impl From<PidListArg> for PidTidSelection {
    fn from(arg: PidListArg) -> Self {
        match arg {
            PidListArg::Pid => Self::Pid,
            PidListArg::Tid => Self::Tid,
            PidListArg::Both => Self::Both,
        }
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["prockitd", "prockit_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Two instances of a parser, parsed in turn, so the one parsed last is the
/// current snapshot and the other one the previous.
struct PrevCurr<T> {
    pair: [T; 2],
    curr: usize,
}

impl<T> PrevCurr<T> {
    fn new(first: T, second: T) -> Self {
        Self {
            pair: [first, second],
            curr: 1,
        }
    }

    /// Makes the previous instance current and returns it for parsing.
    fn advance(&mut self) -> &mut T {
        self.curr ^= 1;
        &mut self.pair[self.curr]
    }

    fn curr(&self) -> &T {
        &self.pair[self.curr]
    }

    fn prev(&self) -> &T {
        &self.pair[self.curr ^ 1]
    }
}

/// Per-process parsers owned by one worker thread.
struct PidWorker<F: FileSystem + Clone> {
    partition: usize,
    list: Vec<PidTid>,
    stat: PidStat<F>,
    status: PidStatus<F>,
    cmdline: PidCmdline<F>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
struct PidScanCounts {
    pids: usize,
    tids: usize,
    /// Exited between listing and parsing.
    gone: usize,
    errors: usize,
}

impl std::ops::AddAssign for PidScanCounts {
    fn add_assign(&mut self, other: Self) {
        self.pids += other.pids;
        self.tids += other.tids;
        self.gone += other.gone;
        self.errors += other.errors;
    }
}

impl<F: FileSystem + Clone> PidWorker<F> {
    fn new(fs: &F, procfs_root: &std::path::Path, partition: usize) -> Self {
        Self {
            partition,
            list: Vec::new(),
            stat: PidStat::with_fs(fs.clone(), procfs_root),
            status: PidStatus::with_fs(fs.clone(), procfs_root),
            cmdline: PidCmdline::with_fs(fs.clone(), procfs_root),
        }
    }

    fn scan(&mut self, lister: &dyn PidTidLister) -> PidScanCounts {
        let mut counts = PidScanCounts::default();
        if let Err(e) = lister.get_pid_tid_list(self.partition, &mut self.list) {
            error!("partition {}: {}", self.partition, e);
            counts.errors += 1;
            return counts;
        }
        for &entry in &self.list {
            let PidTid { pid, tid } = entry;
            let result = self
                .stat
                .parse(pid, tid)
                .and_then(|()| self.status.parse(pid, tid))
                .and_then(|()| self.cmdline.parse(pid, tid));
            match result {
                Ok(()) if entry.is_pid_only() => counts.pids += 1,
                Ok(()) => counts.tids += 1,
                Err(e) if e.is_not_found() => counts.gone += 1,
                Err(e) => {
                    warn!("{}", e);
                    counts.errors += 1;
                }
            }
        }
        counts
    }
}

/// What one scan found.
#[derive(Debug, Clone, Serialize)]
struct ScanSummary {
    scan: u64,
    timestamp: DateTime<Utc>,
    duration_ms: u64,
    cpus: usize,
    /// Context switches since the previous scan.
    ctxt_delta: Option<u64>,
    disks: usize,
    irqs: usize,
    softirqs: usize,
    net_devs: usize,
    snmp_values: usize,
    snmp6_values: usize,
    mounts: usize,
    qdiscs: Option<usize>,
    #[serde(flatten)]
    pid_counts: PidScanCounts,
    failed: Vec<String>,
}

/// Describes a scan summary for logging.
fn describe_summary(summary: &ScanSummary) -> String {
    let mut parts = vec![
        format!("{} cpus", summary.cpus),
        format!("{} disks", summary.disks),
        format!("{} irqs", summary.irqs),
        format!("{} net devs", summary.net_devs),
        format!("{} mounts", summary.mounts),
        format!("{} processes", summary.pid_counts.pids),
    ];
    if summary.pid_counts.tids > 0 {
        parts.push(format!("{} threads", summary.pid_counts.tids));
    }
    if let Some(qdiscs) = summary.qdiscs {
        parts.push(format!("{} qdiscs", qdiscs));
    }
    if let Some(ctxt) = summary.ctxt_delta {
        parts.push(format!("{} ctxt", ctxt));
    }
    if summary.pid_counts.gone > 0 {
        parts.push(format!("{} gone", summary.pid_counts.gone));
    }
    if !summary.failed.is_empty() {
        parts.push(format!("failed: {}", summary.failed.join(",")));
    }
    parts.join(", ")
}

struct Scanner<F: FileSystem + Clone> {
    stat: PrevCurr<Stat<F>>,
    diskstats: PrevCurr<Diskstats<F>>,
    interrupts: PrevCurr<Interrupts<F>>,
    softirqs: PrevCurr<Softirqs<F>>,
    net_dev: PrevCurr<NetDev<F>>,
    net_snmp: PrevCurr<NetSnmp<F>>,
    net_snmp6: PrevCurr<NetSnmp6<F>>,
    mountinfo: Mountinfo<F>,
    qdisc: Option<QdiscStats>,
    pid_list: PidTidListCache<F>,
    workers: Vec<PidWorker<F>>,
    scan: u64,
}

/// Parses one system-wide file, recording the parser name on failure.
fn parse_logged(name: &'static str, failed: &mut Vec<String>, result: prockit_core::Result<()>) {
    if let Err(e) = result {
        warn!("{}", e);
        failed.push(name.to_string());
    }
}

impl<F: FileSystem + Clone> Scanner<F> {
    fn new(fs: F, args: &Args) -> Self {
        let root = &args.procfs_root;
        let jiffies_to_ms = host_facts().jiffies_to_ms();

        let stat = Stat::with_fs(fs.clone(), root);
        let diskstats = Diskstats::with_fs(fs.clone(), root).with_jiffies_to_ms(jiffies_to_ms);
        let interrupts = Interrupts::with_fs(fs.clone(), root);
        let softirqs = Softirqs::with_fs(fs.clone(), root);
        let net_dev = NetDev::with_fs(fs.clone(), root);
        let net_snmp = NetSnmp::with_fs(fs.clone(), root);
        let net_snmp6 = NetSnmp6::with_fs(fs.clone(), root);

        let pid_list = PidTidListCache::with_fs(
            fs.clone(),
            root,
            args.partitions,
            Duration::from_millis(args.pid_list_valid_for),
            args.pid_list.into(),
        );
        let workers = (0..pid_list.num_partitions())
            .map(|partition| PidWorker::new(&fs, root, partition))
            .collect();

        Self {
            stat: PrevCurr::new(stat.sibling(false), stat),
            diskstats: PrevCurr::new(diskstats.sibling(false), diskstats),
            interrupts: PrevCurr::new(interrupts.sibling(false), interrupts),
            softirqs: PrevCurr::new(softirqs.sibling(false), softirqs),
            net_dev: PrevCurr::new(net_dev.sibling(false), net_dev),
            net_snmp: PrevCurr::new(net_snmp.sibling(false), net_snmp),
            net_snmp6: PrevCurr::new(net_snmp6.sibling(false), net_snmp6),
            mountinfo: Mountinfo::with_fs(fs, root),
            qdisc: cfg!(target_os = "linux").then(QdiscStats::new),
            pid_list,
            workers,
            scan: 0,
        }
    }

    fn scan(&mut self) -> ScanSummary {
        let start = Instant::now();
        self.scan += 1;
        let mut failed = Vec::new();

        parse_logged("stat", &mut failed, self.stat.advance().parse());
        parse_logged("diskstats", &mut failed, self.diskstats.advance().parse());
        parse_logged("interrupts", &mut failed, self.interrupts.advance().parse());
        parse_logged("softirqs", &mut failed, self.softirqs.advance().parse());
        parse_logged("net/dev", &mut failed, self.net_dev.advance().parse());
        parse_logged("net/snmp", &mut failed, self.net_snmp.advance().parse());
        parse_logged("net/snmp6", &mut failed, self.net_snmp6.advance().parse());
        parse_logged("mountinfo", &mut failed, self.mountinfo.parse(0));

        if let Some(qdisc) = &mut self.qdisc {
            if let Err(e) = qdisc.get() {
                warn!("qdisc collection disabled: {}", e);
                self.qdisc = None;
                failed.push("qdisc".to_string());
            }
        }

        let lister: &dyn PidTidLister = &self.pid_list;
        let mut pid_counts = PidScanCounts::default();
        std::thread::scope(|s| {
            let handles: Vec<_> = self
                .workers
                .iter_mut()
                .map(|worker| s.spawn(move || worker.scan(lister)))
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(counts) => pid_counts += counts,
                    Err(_) => {
                        error!("pid worker panicked");
                        pid_counts.errors += 1;
                    }
                }
            }
        });

        let stat = self.stat.curr();
        let cpus = stat
            .max_cpu_num()
            .map_or(0, |max| (0..=max).filter(|&n| stat.cpu_present(n)).count());
        let ctxt_delta = (self.scan > 1).then(|| {
            stat.numeric_fields()[STAT_CTXT]
                .saturating_sub(self.stat.prev().numeric_fields()[STAT_CTXT])
        });

        ScanSummary {
            scan: self.scan,
            timestamp: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
            cpus,
            ctxt_delta,
            disks: self.diskstats.curr().dev_info().len(),
            irqs: self.interrupts.curr().counters().len(),
            softirqs: self.softirqs.curr().counters().len(),
            net_devs: self.net_dev.curr().dev_index().len(),
            snmp_values: self.net_snmp.curr().values().len(),
            snmp6_values: self.net_snmp6.curr().values().len(),
            mounts: self.mountinfo.num_mounts(),
            qdiscs: self.qdisc.as_ref().map(|q| q.info().len()),
            pid_counts,
            failed,
        }
    }
}

fn run<F: FileSystem + Clone>(fs: F, args: &Args, running: &AtomicBool) {
    let mut scanner = Scanner::new(fs, args);
    let interval = Duration::from_secs(args.interval);

    info!("Starting scan loop");
    while running.load(Ordering::SeqCst) {
        let summary = scanner.scan();
        info!("Scan #{}: {}", summary.scan, describe_summary(&summary));
        if args.json {
            match serde_json::to_string(&summary) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to serialize summary: {}", e),
            }
        }

        // Pool buffers grown by an unusually large file are not kept for
        // long, give the pages back now and then.
        if summary.scan.is_multiple_of(60) {
            release_memory_to_os();
            debug!("Memory released after {} scans", summary.scan);
        }

        if args.count > 0 && summary.scan >= args.count {
            break;
        }

        // Sleep with periodic checks for shutdown signal
        let sleep_interval = Duration::from_millis(100);
        let mut remaining = interval;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let sleep_time = remaining.min(sleep_interval);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
    }
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    info!("prockitd {} ({}) starting", env!("CARGO_PKG_VERSION"), env!("GIT_SHA"));
    info!(
        "Config: interval={}s, procfs={}, partitions={}, pid_list={:?}",
        args.interval,
        args.procfs_root.display(),
        args.partitions,
        args.pid_list
    );

    let facts = host_facts();
    info!(
        "Host: {} {} {}, clktck={}, booted {}",
        facts.sysname, facts.os_release, facts.machine, facts.clktck, facts.boot_time
    );
    if args.json {
        match serde_json::to_string(facts) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to serialize host facts: {}", e),
        }
    }

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    #[cfg(target_os = "linux")]
    run(RealFs::new(), &args, &running);
    #[cfg(not(target_os = "linux"))]
    {
        warn!("Not on Linux, scanning a canned procfs tree");
        run(MockFs::typical_system(), &args, &running);
    }

    info!("Shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(target_os = "linux")]
    use prockit_core::collector::MockFs;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["prockitd"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn scan_typical_system() {
        let fs = MockFs::typical_system();
        let args = args(&["--partitions", "2", "--pid-list", "both", "--pid-list-valid-for", "0"]);
        let mut scanner = Scanner::new(fs.clone(), &args);
        scanner.qdisc = None;

        let summary = scanner.scan();
        assert_eq!(summary.cpus, 4);
        assert_eq!(summary.disks, 4);
        assert_eq!(summary.net_devs, 2);
        assert_eq!(summary.mounts, 5);
        assert_eq!(summary.ctxt_delta, None);
        assert_eq!(
            summary.pid_counts,
            PidScanCounts {
                pids: 3,
                tids: 4,
                gone: 0,
                errors: 0
            }
        );
        assert!(summary.failed.is_empty(), "{:?}", summary.failed);

        fs.churn();
        let summary = scanner.scan();
        assert_eq!(summary.cpus, 3);
        assert_eq!(summary.disks, 3);
        assert_eq!(summary.net_devs, 3);
        assert_eq!(summary.ctxt_delta, Some(100000));
        assert_eq!(summary.pid_counts.pids, 3);
        assert!(summary.failed.is_empty(), "{:?}", summary.failed);
    }

    #[test]
    fn missing_files_are_reported() {
        let fs = MockFs::typical_system();
        fs.remove_file("/proc/net/snmp6");
        let mut scanner = Scanner::new(fs, &args(&[]));
        scanner.qdisc = None;
        let summary = scanner.scan();
        assert_eq!(summary.failed, vec!["net/snmp6".to_string()]);
        assert!(describe_summary(&summary).contains("failed: net/snmp6"));
    }

    #[test]
    fn describe_summary_lists_counts() {
        let summary = ScanSummary {
            scan: 3,
            timestamp: Utc::now(),
            duration_ms: 1,
            cpus: 8,
            ctxt_delta: Some(1200),
            disks: 2,
            irqs: 40,
            softirqs: 10,
            net_devs: 3,
            snmp_values: 100,
            snmp6_values: 90,
            mounts: 30,
            qdiscs: Some(4),
            pid_counts: PidScanCounts {
                pids: 200,
                tids: 0,
                gone: 1,
                errors: 0,
            },
            failed: Vec::new(),
        };

        let desc = describe_summary(&summary);
        assert!(desc.contains("8 cpus"));
        assert!(desc.contains("200 processes"));
        assert!(desc.contains("4 qdiscs"));
        assert!(desc.contains("1200 ctxt"));
        assert!(desc.contains("1 gone"));
        assert!(!desc.contains("threads"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["pids"], 200);
        assert_eq!(json["qdiscs"], 4);
    }

    #[test]
    fn pid_list_arg_maps_to_selection() {
        assert_eq!(PidTidSelection::from(PidListArg::Tid), PidTidSelection::Tid);
        assert_eq!(args(&[]).pid_list, PidListArg::Pid);
    }
}
