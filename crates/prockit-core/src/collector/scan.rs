//! Scan numbers and one-pass eviction of entities that disappeared.
//!
//! Each keyed parser bumps its scan number at the start of a parse and stamps
//! every entry it touches. Whatever is left with an older stamp afterwards was
//! not in the file and gets evicted.

use std::collections::HashMap;
use std::hash::Hash;

/// Per-parser monotonic scan counter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanCounter(u64);

impl ScanCounter {
    pub fn new() -> Self {
        Self(0)
    }

    /// Starts a new scan and returns its number.
    pub fn advance(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    pub fn current(&self) -> u64 {
        self.0
    }
}

/// A map value carrying the number of the last scan it was seen in.
pub trait LastSeen {
    fn last_seen_scan(&self) -> u64;
}

/// Removes every entry not stamped with `scan`; returns how many were removed.
pub fn evict_stale<K, V>(map: &mut HashMap<K, V>, scan: u64) -> usize
where
    K: Eq + Hash,
    V: LastSeen,
{
    let before = map.len();
    map.retain(|_, v| v.last_seen_scan() == scan);
    before - map.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Entry(u64);

    impl LastSeen for Entry {
        fn last_seen_scan(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn test_scan_counter_advances() {
        let mut scan = ScanCounter::new();
        assert_eq!(scan.current(), 0);
        assert_eq!(scan.advance(), 1);
        assert_eq!(scan.advance(), 2);
        assert_eq!(scan.current(), 2);
    }

    #[test]
    fn test_evict_stale() {
        let mut map = HashMap::new();
        map.insert("sda", Entry(3));
        map.insert("sdb", Entry(2));
        map.insert("sdc", Entry(3));

        assert_eq!(evict_stale(&mut map, 3), 1);
        assert!(map.contains_key("sda"));
        assert!(!map.contains_key("sdb"));
        assert_eq!(evict_stale(&mut map, 3), 0);
    }
}
