//! Queueing discipline statistics, the way `tc -s qdisc show` reports them.
//!
//! The kernel is asked for a dump of all qdiscs over netlink and every reply
//! is decoded into fixed-width counter arrays, keyed by `(ifindex, handle)`
//! since an interface may carry a whole tree of qdiscs.
//!
//! The transport is hidden behind [`QdiscSource`]; on Linux it is a raw
//! `NETLINK_ROUTE` socket, elsewhere every call fails as unsupported.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::collector::scan::{LastSeen, ScanCounter, evict_stale};
use crate::error::{ProcfsError, Result};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::NetlinkQdiscSource;

#[cfg(not(target_os = "linux"))]
mod other;
#[cfg(not(target_os = "linux"))]
pub use other::NetlinkQdiscSource;

// u32 stats:
pub const QDISC_PARENT: usize = 0;
pub const QDISC_HANDLE: usize = 1;
pub const QDISC_PACKETS: usize = 2;
pub const QDISC_DROPS: usize = 3;
pub const QDISC_REQUEUES: usize = 4;
pub const QDISC_OVERLIMITS: usize = 5;
pub const QDISC_QLEN: usize = 6;
pub const QDISC_BACKLOG: usize = 7;

pub const QDISC_UINT32_NUM_STATS: usize = 8;

// u64 stats:
pub const QDISC_BYTES: usize = 0;
pub const QDISC_GCFLOWS: usize = 1;
pub const QDISC_THROTTLED: usize = 2;
pub const QDISC_FLOWS_PLIMIT: usize = 3;

pub const QDISC_UINT64_NUM_STATS: usize = 4;

/// How long the ifindex -> name table is trusted.
pub const IF_INDEX_TO_NAME_CACHE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// `struct tcmsg`: family, 3 pad bytes, ifindex, handle, parent, info.
pub const TCMSG_LEN: usize = 20;

const TC_H_ROOT: u32 = 0xffff_ffff;

// rtattr types, from include/uapi/linux/rtnetlink.h and gen_stats.h:
const TCA_KIND: u16 = 1;
const TCA_STATS: u16 = 3;
const TCA_XSTATS: u16 = 4;
const TCA_STATS2: u16 = 7;
const TCA_STATS_BASIC: u16 = 1;
const TCA_STATS_QUEUE: u16 = 3;

/// Strips NLA_F_NESTED and NLA_F_NET_BYTEORDER.
const NLA_TYPE_MASK: u16 = 0x3fff;
const RTA_HDR_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QdiscKey {
    pub if_index: u32,
    pub handle: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QdiscInfo {
    pub if_name: String,
    pub kind: String,
    pub uint32_stats: [u32; QDISC_UINT32_NUM_STATS],
    pub uint64_stats: [u64; QDISC_UINT64_NUM_STATS],
    last_seen_scan: u64,
}

impl LastSeen for QdiscInfo {
    fn last_seen_scan(&self) -> u64 {
        self.last_seen_scan
    }
}

/// Where qdisc dumps and interface names come from.
pub trait QdiscSource: Send {
    /// Requests a dump of all qdiscs and calls `f` with the payload of every
    /// reply, starting with the `struct tcmsg`.
    fn dump(&mut self, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()>;

    /// Fills `into` with ifindex -> interface name.
    fn interface_names(&mut self, into: &mut HashMap<u32, String>) -> Result<()>;
}

#[derive(Debug)]
pub struct QdiscStats<S: QdiscSource = NetlinkQdiscSource> {
    source: S,
    info: HashMap<QdiscKey, QdiscInfo>,
    scan: ScanCounter,
    if_names: HashMap<u32, String>,
    if_names_refreshed: Option<Instant>,
    changed: bool,
}

impl QdiscStats<NetlinkQdiscSource> {
    pub fn new() -> Self {
        Self::with_source(NetlinkQdiscSource::new())
    }
}

impl Default for QdiscStats<NetlinkQdiscSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: QdiscSource> QdiscStats<S> {
    pub fn with_source(source: S) -> Self {
        Self {
            source,
            info: HashMap::new(),
            scan: ScanCounter::new(),
            if_names: HashMap::new(),
            if_names_refreshed: None,
            changed: false,
        }
    }

    pub fn info(&self) -> &HashMap<QdiscKey, QdiscInfo> {
        &self.info
    }

    /// All qdiscs attached to interface `if_name`.
    pub fn by_interface<'a>(
        &'a self,
        if_name: &'a str,
    ) -> impl Iterator<Item = (&'a QdiscKey, &'a QdiscInfo)> + 'a {
        self.info.iter().filter(move |(_, qi)| qi.if_name == if_name)
    }

    /// `true` if qdiscs appeared or disappeared at the last `get`.
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn scan_number(&self) -> u64 {
        self.scan.current()
    }

    fn refresh_if_names(&mut self) -> Result<()> {
        self.if_names.clear();
        self.source.interface_names(&mut self.if_names)?;
        self.if_names_refreshed = Some(Instant::now());
        debug!("qdisc: {} interface name(s) cached", self.if_names.len());
        Ok(())
    }

    /// Takes a new snapshot of all qdiscs.
    pub fn get(&mut self) -> Result<()> {
        let scan = self.scan.advance();
        let mut added = false;
        {
            let Self { source, info, .. } = self;
            source.dump(&mut |msg| {
                let (key, parent) = decode_tcmsg(msg)?;
                let qi = info.entry(key).or_insert_with(|| {
                    added = true;
                    QdiscInfo::default()
                });
                qi.uint32_stats[QDISC_HANDLE] = key.handle;
                qi.uint32_stats[QDISC_PARENT] = parent;
                decode_attributes(qi, &msg[TCMSG_LEN..])?;
                qi.last_seen_scan = scan;
                Ok(())
            })?;
        }
        let evicted = evict_stale(&mut self.info, scan);
        self.changed = added || evicted > 0;

        let mut refreshed = false;
        if self
            .if_names_refreshed
            .is_none_or(|t| t.elapsed() >= IF_INDEX_TO_NAME_CACHE_REFRESH_INTERVAL)
        {
            self.refresh_if_names()?;
            refreshed = true;
        }
        let unresolved = self
            .info
            .iter()
            .any(|(key, qi)| qi.if_name.is_empty() && !self.if_names.contains_key(&key.if_index));
        if unresolved && !refreshed {
            self.refresh_if_names()?;
        }
        // Interfaces can be renamed; follow the cached table.
        for (key, qi) in &mut self.info {
            if let Some(name) = self.if_names.get(&key.if_index) {
                if qi.if_name != *name {
                    qi.if_name.clone_from(name);
                }
            }
        }
        Ok(())
    }
}

fn invalid_data(reason: String) -> ProcfsError {
    ProcfsError::Netlink {
        op: "decode",
        source: io::Error::new(io::ErrorKind::InvalidData, reason),
    }
}

fn ne_u32(data: &[u8], off: usize) -> Option<u32> {
    data.get(off..off + 4)?.try_into().ok().map(u32::from_ne_bytes)
}

fn ne_u64(data: &[u8], off: usize) -> Option<u64> {
    data.get(off..off + 8)?.try_into().ok().map(u64::from_ne_bytes)
}

/// Key and parent from the `struct tcmsg` at the start of a reply. A root
/// qdisc's parent is reported as 0.
fn decode_tcmsg(msg: &[u8]) -> Result<(QdiscKey, u32)> {
    if msg.len() < TCMSG_LEN {
        return Err(invalid_data(format!(
            "short message, len={} < {}",
            msg.len(),
            TCMSG_LEN
        )));
    }
    let field = |off| ne_u32(msg, off).unwrap_or_default();
    let key = QdiscKey {
        if_index: field(4),
        handle: field(8),
    };
    let parent = match field(12) {
        TC_H_ROOT => 0,
        parent => parent,
    };
    Ok((key, parent))
}

/// Walks a sequence of `struct rtattr`, each padded to 4 bytes.
struct Attributes<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for Attributes<'a> {
    type Item = Result<(u16, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < RTA_HDR_LEN {
            return None;
        }
        let len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
        let typ = u16::from_ne_bytes([self.buf[2], self.buf[3]]) & NLA_TYPE_MASK;
        if len < RTA_HDR_LEN || len > self.buf.len() {
            self.buf = &[];
            return Some(Err(invalid_data(format!("invalid attribute length {}", len))));
        }
        let data = &self.buf[RTA_HDR_LEN..len];
        let aligned = (len + 3) & !3;
        self.buf = self.buf.get(aligned..).unwrap_or_default();
        Some(Ok((typ, data)))
    }
}

fn attributes(buf: &[u8]) -> Attributes<'_> {
    Attributes { buf }
}

fn short_attribute(name: &str, len: usize) -> ProcfsError {
    invalid_data(format!("short {}, len={}", name, len))
}

fn decode_attributes(qi: &mut QdiscInfo, buf: &[u8]) -> Result<()> {
    let mut xstats = None;
    for attr in attributes(buf) {
        let (typ, data) = attr?;
        match typ {
            TCA_KIND => {
                let kind = data.split(|&c| c == 0).next().unwrap_or_default();
                if qi.kind.as_bytes() != kind {
                    qi.kind = String::from_utf8_lossy(kind).into_owned();
                }
            }
            TCA_STATS2 => decode_stats2(qi, data)?,
            TCA_STATS => decode_legacy_stats(qi, data)?,
            TCA_XSTATS => xstats = Some(data),
            _ => {}
        }
    }
    // Kind specific, so only decodable once the kind is known.
    if let Some(data) = xstats {
        decode_xstats(qi, data);
    }
    Ok(())
}

/// `struct tc_stats`.
fn decode_legacy_stats(qi: &mut QdiscInfo, data: &[u8]) -> Result<()> {
    let short = || short_attribute("TCA_STATS", data.len());
    qi.uint64_stats[QDISC_BYTES] = ne_u64(data, 0).ok_or_else(short)?;
    qi.uint32_stats[QDISC_PACKETS] = ne_u32(data, 8).ok_or_else(short)?;
    qi.uint32_stats[QDISC_DROPS] = ne_u32(data, 12).ok_or_else(short)?;
    qi.uint32_stats[QDISC_OVERLIMITS] = ne_u32(data, 16).ok_or_else(short)?;
    qi.uint32_stats[QDISC_QLEN] = ne_u32(data, 28).ok_or_else(short)?;
    qi.uint32_stats[QDISC_BACKLOG] = ne_u32(data, 32).ok_or_else(short)?;
    Ok(())
}

/// Nested `struct gnet_stats_basic` and `struct gnet_stats_queue`.
fn decode_stats2(qi: &mut QdiscInfo, data: &[u8]) -> Result<()> {
    for attr in attributes(data) {
        let (typ, data) = attr?;
        match typ {
            TCA_STATS_BASIC => {
                let short = || short_attribute("TCA_STATS_BASIC", data.len());
                qi.uint64_stats[QDISC_BYTES] = ne_u64(data, 0).ok_or_else(short)?;
                qi.uint32_stats[QDISC_PACKETS] = ne_u32(data, 8).ok_or_else(short)?;
            }
            TCA_STATS_QUEUE => {
                let short = || short_attribute("TCA_STATS_QUEUE", data.len());
                qi.uint32_stats[QDISC_QLEN] = ne_u32(data, 0).ok_or_else(short)?;
                qi.uint32_stats[QDISC_BACKLOG] = ne_u32(data, 4).ok_or_else(short)?;
                qi.uint32_stats[QDISC_DROPS] = ne_u32(data, 8).ok_or_else(short)?;
                qi.uint32_stats[QDISC_REQUEUES] = ne_u32(data, 12).ok_or_else(short)?;
                qi.uint32_stats[QDISC_OVERLIMITS] = ne_u32(data, 16).ok_or_else(short)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// `struct tc_fq_qd_stats` for `fq`; other kinds keep these at 0.
fn decode_xstats(qi: &mut QdiscInfo, data: &[u8]) {
    if qi.kind != "fq" {
        return;
    }
    qi.uint64_stats[QDISC_GCFLOWS] = ne_u64(data, 0).unwrap_or_default();
    qi.uint64_stats[QDISC_THROTTLED] = ne_u64(data, 24).unwrap_or_default();
    qi.uint64_stats[QDISC_FLOWS_PLIMIT] = ne_u64(data, 32).unwrap_or_default();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_attr(buf: &mut Vec<u8>, typ: u16, data: &[u8]) {
        let len = (RTA_HDR_LEN + data.len()) as u16;
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&typ.to_ne_bytes());
        buf.extend_from_slice(data);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }

    fn tcmsg(if_index: u32, handle: u32, parent: u32) -> Vec<u8> {
        let mut msg = vec![0u8; 4];
        msg.extend_from_slice(&if_index.to_ne_bytes());
        msg.extend_from_slice(&handle.to_ne_bytes());
        msg.extend_from_slice(&parent.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg
    }

    fn stats2(bytes: u64, packets: u32, queue: [u32; 5]) -> Vec<u8> {
        let mut basic = bytes.to_ne_bytes().to_vec();
        basic.extend_from_slice(&packets.to_ne_bytes());
        basic.extend_from_slice(&[0; 4]);
        let queue: Vec<u8> = queue.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut nested = Vec::new();
        push_attr(&mut nested, TCA_STATS_BASIC, &basic);
        push_attr(&mut nested, TCA_STATS_QUEUE, &queue);
        nested
    }

    fn qdisc_msg(if_index: u32, handle: u32, parent: u32, kind: &str, bytes: u64) -> Vec<u8> {
        let mut msg = tcmsg(if_index, handle, parent);
        push_attr(&mut msg, TCA_KIND, format!("{kind}\0").as_bytes());
        push_attr(&mut msg, TCA_STATS2, &stats2(bytes, 10, [1, 2, 3, 4, 5]));
        msg
    }

    #[derive(Default)]
    struct FakeSource {
        messages: Vec<Vec<u8>>,
        names: HashMap<u32, String>,
        name_lookups: usize,
    }

    impl QdiscSource for FakeSource {
        fn dump(&mut self, f: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
            for msg in &self.messages {
                f(msg)?;
            }
            Ok(())
        }

        fn interface_names(&mut self, into: &mut HashMap<u32, String>) -> Result<()> {
            self.name_lookups += 1;
            into.extend(self.names.iter().map(|(i, n)| (*i, n.clone())));
            Ok(())
        }
    }

    fn fake_source() -> FakeSource {
        FakeSource {
            messages: vec![
                qdisc_msg(1, 0, TC_H_ROOT, "noqueue", 0),
                qdisc_msg(2, 0x8001_0000, TC_H_ROOT, "mq", 5000),
                qdisc_msg(2, 0, 0x8001_0001, "fq_codel", 2500),
            ],
            names: HashMap::from([(1, "lo".to_string()), (2, "eth0".to_string())]),
            name_lookups: 0,
        }
    }

    #[test]
    fn test_get() {
        let mut qs = QdiscStats::with_source(fake_source());
        qs.get().unwrap();

        assert_eq!(qs.info().len(), 3);
        assert!(qs.changed());
        let mq = &qs.info()[&QdiscKey {
            if_index: 2,
            handle: 0x8001_0000,
        }];
        assert_eq!(mq.if_name, "eth0");
        assert_eq!(mq.kind, "mq");
        assert_eq!(mq.uint32_stats[QDISC_PARENT], 0);
        assert_eq!(mq.uint32_stats[QDISC_HANDLE], 0x8001_0000);
        assert_eq!(mq.uint32_stats[QDISC_PACKETS], 10);
        assert_eq!(mq.uint32_stats[QDISC_QLEN], 1);
        assert_eq!(mq.uint32_stats[QDISC_BACKLOG], 2);
        assert_eq!(mq.uint32_stats[QDISC_DROPS], 3);
        assert_eq!(mq.uint32_stats[QDISC_REQUEUES], 4);
        assert_eq!(mq.uint32_stats[QDISC_OVERLIMITS], 5);
        assert_eq!(mq.uint64_stats[QDISC_BYTES], 5000);

        let eth0: Vec<_> = qs.by_interface("eth0").collect();
        assert_eq!(eth0.len(), 2);
        assert!(
            eth0.iter()
                .any(|(_, qi)| qi.kind == "fq_codel" && qi.uint32_stats[QDISC_PARENT] == 0x8001_0001)
        );
    }

    #[test]
    fn test_eviction_and_name_cache() {
        let mut qs = QdiscStats::with_source(fake_source());
        qs.get().unwrap();
        assert_eq!(qs.source.name_lookups, 1);

        qs.source.messages.truncate(2);
        qs.get().unwrap();
        assert!(qs.changed());
        assert_eq!(qs.info().len(), 2);
        // Names still fresh and all known.
        assert_eq!(qs.source.name_lookups, 1);

        qs.get().unwrap();
        assert!(!qs.changed());

        qs.source.messages.push(qdisc_msg(3, 0, TC_H_ROOT, "pfifo_fast", 1));
        qs.source.names.insert(3, "wlan0".to_string());
        qs.get().unwrap();
        assert_eq!(qs.source.name_lookups, 2);
        assert_eq!(qs.by_interface("wlan0").count(), 1);
    }

    #[test]
    fn test_renamed_interface() {
        let mut qs = QdiscStats::with_source(fake_source());
        qs.get().unwrap();
        assert_eq!(qs.by_interface("eth0").count(), 2);

        qs.source.names.insert(2, "wan0".to_string());
        qs.get().unwrap();
        // Cached table not yet expired.
        assert_eq!(qs.by_interface("eth0").count(), 2);

        qs.if_names_refreshed = None;
        qs.get().unwrap();
        assert_eq!(qs.source.name_lookups, 2);
        assert_eq!(qs.by_interface("eth0").count(), 0);
        assert_eq!(qs.by_interface("wan0").count(), 2);
        assert_eq!(qs.by_interface("lo").count(), 1);
    }

    #[test]
    fn test_legacy_stats_and_fq_xstats() {
        let mut msg = tcmsg(2, 0x10000, TC_H_ROOT);
        push_attr(&mut msg, TCA_KIND, b"fq\0");
        let mut legacy = Vec::new();
        legacy.extend_from_slice(&777u64.to_ne_bytes());
        for v in [7u32, 8, 9, 0, 0, 11, 12] {
            legacy.extend_from_slice(&v.to_ne_bytes());
        }
        push_attr(&mut msg, TCA_STATS, &legacy);
        let xstats: Vec<u8> = [21u64, 0, 0, 24, 25, 0]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        push_attr(&mut msg, TCA_XSTATS, &xstats);

        let mut qi = QdiscInfo::default();
        decode_attributes(&mut qi, &msg[TCMSG_LEN..]).unwrap();
        assert_eq!(qi.kind, "fq");
        assert_eq!(qi.uint64_stats, [777, 21, 24, 25]);
        assert_eq!(qi.uint32_stats[QDISC_PACKETS], 7);
        assert_eq!(qi.uint32_stats[QDISC_DROPS], 8);
        assert_eq!(qi.uint32_stats[QDISC_OVERLIMITS], 9);
        assert_eq!(qi.uint32_stats[QDISC_QLEN], 11);
        assert_eq!(qi.uint32_stats[QDISC_BACKLOG], 12);
    }

    #[test]
    fn test_malformed_messages() {
        let mut qs = QdiscStats::with_source(FakeSource {
            messages: vec![vec![0; 12]],
            ..Default::default()
        });
        let err = qs.get().unwrap_err();
        assert!(err.to_string().contains("short message, len=12 < 20"), "{err}");

        let mut msg = tcmsg(1, 0, 0);
        msg.extend_from_slice(&64u16.to_ne_bytes());
        msg.extend_from_slice(&TCA_KIND.to_ne_bytes());
        let mut qi = QdiscInfo::default();
        let err = decode_attributes(&mut qi, &msg[TCMSG_LEN..]).unwrap_err();
        assert!(err.to_string().contains("invalid attribute length 64"), "{err}");

        let mut msg = tcmsg(1, 0, 0);
        push_attr(&mut msg, TCA_STATS, &[0; 8]);
        let err = decode_attributes(&mut qi, &msg[TCMSG_LEN..]).unwrap_err();
        assert!(err.to_string().contains("short TCA_STATS"), "{err}");
    }
}
