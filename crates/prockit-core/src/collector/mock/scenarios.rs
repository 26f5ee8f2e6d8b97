//! Pre-built mock filesystem scenarios for testing.
//!
//! These scenarios provide realistic `/proc` filesystem states covering every
//! file the parsers of this crate read.

use super::filesystem::MockFs;

/// `/proc/<pid>/stat` content with 52 fields; everything past `starttime`
/// is filled with plausible constants.
fn pid_stat_line(pid: u32, comm: &str, state: char, ppid: u32, utime: u64, stime: u64) -> String {
    format!(
        "{pid} ({comm}) {state} {ppid} {pid} {pid} 0 -1 4194560 5000 100000 10 50 {utime} {stime} 200 100 20 0 1 0 {start} 170000000 3000 18446744073709551615 1 1 0 0 0 0 0 4096 1260 0 0 0 17 {cpu} 0 0 0 0 0 0 0 0 0 0 0 0 0",
        start = 100 + pid,
        cpu = pid % 4,
    )
}

fn pid_status(name: &str, pid: u32, ppid: u32, uid: u32, threads: usize, rss_kb: u64) -> String {
    format!(
        "\
Name:\t{name}
Umask:\t0022
State:\tS (sleeping)
Tgid:\t{pid}
Pid:\t{pid}
PPid:\t{ppid}
Uid:\t{uid}\t{uid}\t{uid}\t{uid}
Gid:\t{uid}\t{uid}\t{uid}\t{uid}
FDSize:\t64
Groups:\t{uid}
VmPeak:\t  200000 kB
VmSize:\t  170000 kB
VmLck:\t       0 kB
VmPin:\t       0 kB
VmHWM:\t {rss_kb:7} kB
VmRSS:\t {rss_kb:7} kB
RssAnon:\t    2000 kB
RssFile:\t    6000 kB
RssShmem:\t       0 kB
VmData:\t   10000 kB
VmStk:\t     136 kB
VmExe:\t     900 kB
VmLib:\t   10000 kB
VmPTE:\t      96 kB
VmSwap:\t       0 kB
HugetlbPages:\t       0 kB
Threads:\t{threads}
Cpus_allowed:\tf
Cpus_allowed_list:\t0-3
Mems_allowed_list:\t0
voluntary_ctxt_switches:\t{vcs}
nonvoluntary_ctxt_switches:\t{nvcs}
",
        vcs = 10 * pid,
        nvcs = pid,
    )
}

const MOUNTINFO: &str = "\
22 28 0:21 / /proc rw,nosuid,nodev,noexec,relatime shared:12 - proc proc rw
23 28 0:22 / /sys rw,nosuid,nodev,noexec,relatime shared:7 - sysfs sysfs rw
28 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw,errors=remount-ro
30 28 259:1 / /var/lib/data rw,noatime shared:20 master:3 - xfs /dev/nvme0n1p1 rw,attr2,inode64
31 23 0:26 / /sys/fs/cgroup rw,nosuid,nodev,noexec,relatime shared:9 - cgroup2 cgroup2 rw
";

impl MockFs {
    /// Creates a typical 4-CPU system: two disks, two network devices and
    /// three processes, one of them multi-threaded.
    ///
    /// | PID  | comm      | TIDs       |
    /// |------|-----------|------------|
    /// | 1    | systemd   | 1          |
    /// | 1000 | postgres  | 1000, 1003 |
    /// | 1001 | bash      | 1001       |
    pub fn typical_system() -> Self {
        let fs = Self::new();

        fs.add_file(
            "/etc/os-release",
            "\
NAME=\"Ubuntu\"
VERSION_ID=\"24.04\"
ID=ubuntu
PRETTY_NAME=\"Ubuntu 24.04.1 LTS\"
",
        );

        fs.add_file(
            "/proc/stat",
            "\
cpu  10000 500 3000 80000 1000 200 100 0 0 0
cpu0 2500 125 750 20000 250 50 25 0 0 0
cpu1 2500 125 750 20000 250 50 25 0 0 0
cpu2 2500 125 750 20000 250 50 25 0 0 0
cpu3 2500 125 750 20000 250 50 25 0 0 0
intr 1000000 50 0 0 0 0 0 0 0 1 0 0 0 100 0 0 1000
ctxt 500000
btime 1700000000
processes 10000
procs_running 2
procs_blocked 0
softirq 400000 10 200000 5 8000 1000 0 50 100000 0 90000
",
        );

        fs.add_file(
            "/proc/diskstats",
            "\
   8       0 sda 12345 100 987654 5000 6789 50 456789 3000 0 4000 8000 0 0 0 0 10 20
   8       1 sda1 10000 80 800000 4000 5000 40 400000 2500 0 3500 6500 0 0 0 0 0 0
 259       0 nvme0n1 50000 200 2000000 10000 30000 150 1500000 8000 5 15000 18000 0 0 0 0 100 50
 259       1 nvme0n1p1 49000 190 1900000 9500 29000 140 1400000 7500 5 14000 17000 0 0 0 0 0 0
",
        );

        fs.add_file(
            "/proc/interrupts",
            "\
           CPU0       CPU1       CPU2       CPU3
  0:         44          0          0          0   IO-APIC   2-edge      timer
  8:          0          0          1          0   IO-APIC   8-edge      rtc0
  9:          0          4          0          0   IO-APIC   9-fasteoi   acpi
 24:      18271          0       5120          0   PCI-MSI 524288-edge      nvme0q0
 25:        330       9133          0       1209   PCI-MSI 1572864-edge      eth0-TxRx-0
NMI:          2          2          2          2   Non-maskable interrupts
LOC:    1043210     988412    1011783     954321   Local timer interrupts
RES:      22145      19812      20333      18790   Rescheduling interrupts
ERR:          0
MIS:          0
",
        );

        fs.add_file(
            "/proc/softirqs",
            "\
                    CPU0       CPU1       CPU2       CPU3
          HI:          3          2          0          5
       TIMER:     261344     210484     230001     199876
      NET_TX:         12          8          9          3
      NET_RX:      40001      38012      20011      19870
       BLOCK:      30123      10234       8012       7001
    IRQ_POLL:          0          0          0          0
     TASKLET:        123         45          6          7
       SCHED:     150123     140234     139012     138001
     HRTIMER:          0          0          0          0
         RCU:     100123      98012      97034      96045
",
        );

        fs.add_file(
            "/proc/net/dev",
            "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 12345678     9876    0    0    0     0          0         0 12345678     9876    0    0    0     0       0          0
  eth0: 987654321   654321    5   10    0     0          0       100 123456789   456789    2    5    0     0       0          0
",
        );

        fs.add_file(
            "/proc/net/snmp",
            "\
Ip: Forwarding DefaultTTL InReceives InHdrErrors InAddrErrors ForwDatagrams InUnknownProtos InDiscards InDelivers OutRequests OutDiscards OutNoRoutes ReasmTimeout ReasmReqds ReasmOKs ReasmFails FragOKs FragFails FragCreates
Ip: 1 64 1000000 0 0 0 0 0 999900 800000 0 0 0 0 0 0 0 0 0
Icmp: InMsgs InErrors InCsumErrors InDestUnreachs OutMsgs OutErrors OutDestUnreachs
Icmp: 45 0 0 45 50 0 50
Tcp: RtoAlgorithm RtoMin RtoMax MaxConn ActiveOpens PassiveOpens AttemptFails EstabResets CurrEstab InSegs OutSegs RetransSegs InErrs OutRsts InCsumErrors
Tcp: 1 200 120000 -1 5000 3000 100 50 150 500000 450000 1000 10 200 0
Udp: InDatagrams NoPorts InErrors OutDatagrams RcvbufErrors SndbufErrors InCsumErrors IgnoredMulti MemErrors
Udp: 100000 500 5 80000 0 0 0 0 0
",
        );

        fs.add_file(
            "/proc/net/snmp6",
            "\
Ip6InReceives                   \t8810
Ip6InHdrErrors                  \t0
Ip6InDelivers                   \t8742
Ip6OutRequests                  \t8893
Ip6InOctets                     \t1214760
Ip6OutOctets                    \t1229460
Icmp6InMsgs                     \t32
Icmp6OutMsgs                    \t44
Udp6InDatagrams                 \t2011
Udp6OutDatagrams                \t2085
",
        );

        fs.add_process(
            "/proc",
            1,
            &[1],
            &pid_stat_line(1, "systemd", 'S', 0, 1000, 500),
            &pid_status("systemd", 1, 0, 0, 1, 12000),
            b"/sbin/init\0splash\0",
        );
        fs.add_process(
            "/proc",
            1000,
            &[1000, 1003],
            &pid_stat_line(1000, "postgres", 'S', 1, 40000, 9000),
            &pid_status("postgres", 1000, 1, 999, 2, 250000),
            b"/usr/lib/postgresql/16/bin/postgres\0-D\0/var/lib/data\0",
        );
        fs.add_process(
            "/proc",
            1001,
            &[1001],
            &pid_stat_line(1001, "bash", 'R', 1, 100, 50),
            &pid_status("bash", 1001, 1, 1000, 1, 8000),
            b"-bash\0",
        );
        fs.add_file("/proc/1/mountinfo", MOUNTINFO);
        fs.add_file("/proc/self/mountinfo", MOUNTINFO);

        fs
    }

    /// Applies the changes of a busy interval on top of
    /// [`MockFs::typical_system`]: PID 1001 exits, a new process shows up,
    /// CPU 3 goes offline, `sda1` is removed and `docker0` is created.
    pub fn churn(&self) {
        self.remove_dir_all("/proc/1001");
        self.add_process(
            "/proc",
            1002,
            &[1002],
            &pid_stat_line(1002, "sleep", 'S', 1, 0, 1),
            &pid_status("sleep", 1002, 1, 1000, 1, 900),
            b"sleep\x00600\0",
        );

        self.add_file(
            "/proc/stat",
            "\
cpu  12000 600 3500 90000 1100 220 110 0 0 0
cpu0 4000 200 1200 30000 400 80 40 0 0 0
cpu1 4000 200 1150 30000 350 70 35 0 0 0
cpu2 4000 200 1150 30000 350 70 35 0 0 0
intr 1200000 60 0 0 0 0 0 0 0 1 0 0 0 120 0 0 1200
ctxt 600000
btime 1700000000
processes 10001
procs_running 1
procs_blocked 1
",
        );

        self.add_file(
            "/proc/diskstats",
            "\
   8       0 sda 12400 100 990000 5020 6800 50 457000 3010 0 4010 8030 0 0 0 0 10 20
 259       0 nvme0n1 51000 200 2040000 10100 30500 150 1520000 8100 1 15200 18200 0 0 0 0 101 51
 259       1 nvme0n1p1 50000 190 1940000 9600 29500 140 1420000 7600 1 14200 17200 0 0 0 0 0 0
",
        );

        self.add_file(
            "/proc/net/dev",
            "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 12345999     9880    0    0    0     0          0         0 12345999     9880    0    0    0     0       0          0
  eth0: 987999999   654999    5   10    0     0          0       101 123999999   456999    2    5    0     0       0          0
docker0:       0        0    0    0    0     0          0         0        0        0    0    0    0     0       0          0
",
        );
    }
}
