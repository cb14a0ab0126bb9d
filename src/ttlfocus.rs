//! Per-destination hop-count estimation
//!
//! A `TtlFocus` is written by the active hop tracer (outside of the hack
//! pipeline) and read by plugins, the option composer and the engine.
//! Status and estimate are packed into one atomic word so a reader always
//! sees a consistent pair; the value may still change between two packets
//! of the same flow.

use anyhow::anyhow;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

/// Progress of the hop-count search for a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtlStatus {
    Unknown,
    Bruteforce,
    Known,
}

impl TtlStatus {
    const fn to_bits(self) -> u16 {
        match self {
            TtlStatus::Unknown => 0,
            TtlStatus::Bruteforce => 1,
            TtlStatus::Known => 2,
        }
    }

    const fn from_bits(bits: u16) -> Self {
        match bits {
            2 => TtlStatus::Known,
            1 => TtlStatus::Bruteforce,
            _ => TtlStatus::Unknown,
        }
    }
}

/// Consistent view of a focus at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlSnapshot {
    pub status: TtlStatus,
    pub ttl_estimate: u8,
}

impl TtlSnapshot {
    /// The estimate, only when it can be trusted
    pub fn known_estimate(&self) -> Option<u8> {
        (self.status == TtlStatus::Known).then_some(self.ttl_estimate)
    }
}

fn pack(status: TtlStatus, ttl: u8) -> u16 {
    (status.to_bits() << 8) | ttl as u16
}

fn unpack(word: u16) -> TtlSnapshot {
    TtlSnapshot {
        status: TtlStatus::from_bits(word >> 8),
        ttl_estimate: (word & 0xFF) as u8,
    }
}

/// Hop-count estimation record for one destination
#[derive(Debug)]
pub struct TtlFocus {
    daddr: Ipv4Addr,
    state: AtomicU16,
    sent_traces: AtomicU32,
    received_traces: AtomicU32,
    access_timestamp: AtomicI64,
}

impl TtlFocus {
    pub fn new(daddr: Ipv4Addr) -> Self {
        Self {
            daddr,
            state: AtomicU16::new(pack(TtlStatus::Unknown, 0)),
            sent_traces: AtomicU32::new(0),
            received_traces: AtomicU32::new(0),
            access_timestamp: AtomicI64::new(Utc::now().timestamp()),
        }
    }

    /// A focus already resolved to `ttl_estimate` hops
    pub fn known(daddr: Ipv4Addr, ttl_estimate: u8) -> Self {
        let focus = Self::new(daddr);
        focus.state.store(pack(TtlStatus::Known, ttl_estimate), Ordering::Release);
        focus
    }

    pub fn daddr(&self) -> Ipv4Addr {
        self.daddr
    }

    pub fn snapshot(&self) -> TtlSnapshot {
        unpack(self.state.load(Ordering::Acquire))
    }

    pub fn status(&self) -> TtlStatus {
        self.snapshot().status
    }

    pub fn sent_traces(&self) -> u32 {
        self.sent_traces.load(Ordering::Relaxed)
    }

    pub fn received_traces(&self) -> u32 {
        self.received_traces.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.access_timestamp.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Begin active probing, keeping any previous estimate as a hint
    pub fn start_bruteforce(&self) {
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
            let snap = unpack(word);
            Some(pack(TtlStatus::Bruteforce, snap.ttl_estimate))
        });
        self.sent_traces.store(0, Ordering::Relaxed);
        self.received_traces.store(0, Ordering::Relaxed);
        debug!(daddr = %self.daddr, "TTL bruteforce started");
    }

    pub fn record_trace_sent(&self) {
        self.sent_traces.fetch_add(1, Ordering::Relaxed);
    }

    /// A trace packet sent with `ttl` reached the destination
    ///
    /// The estimate converges on the smallest TTL seen to reach the peer.
    pub fn record_trace_reply(&self, ttl: u8) {
        self.received_traces.fetch_add(1, Ordering::Relaxed);
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
            let snap = unpack(word);
            let estimate = match snap.status {
                TtlStatus::Known if snap.ttl_estimate <= ttl => snap.ttl_estimate,
                _ => ttl,
            };
            Some(pack(TtlStatus::Known, estimate))
        });
    }

    /// An anomaly was observed: the estimate is no longer trusted
    pub fn degrade(&self) {
        let res = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
            let snap = unpack(word);
            (snap.status == TtlStatus::Known).then(|| pack(TtlStatus::Bruteforce, snap.ttl_estimate))
        });
        if res.is_ok() {
            warn!(daddr = %self.daddr, "TTL estimate degraded, probing again");
        }
    }
}

/// Persisted form of a KNOWN focus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlRecord {
    pub daddr: Ipv4Addr,
    pub ttl_estimate: u8,
}

/// Destination-keyed table of hop estimates
#[derive(Debug, Default)]
pub struct TtlFocusMap {
    foci: DashMap<Ipv4Addr, Arc<TtlFocus>>,
}

impl TtlFocusMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Focus for `daddr`, created in UNKNOWN state on first use
    ///
    /// Entries are never dropped here; the owner of the map calls
    /// `expire` periodically.
    pub fn focus(&self, daddr: Ipv4Addr) -> Arc<TtlFocus> {
        let focus = self
            .foci
            .entry(daddr)
            .or_insert_with(|| Arc::new(TtlFocus::new(daddr)))
            .clone();
        focus.touch();
        focus
    }

    pub fn get(&self, daddr: &Ipv4Addr) -> Option<Arc<TtlFocus>> {
        self.foci.get(daddr).map(|f| f.clone())
    }

    pub fn insert(&self, focus: TtlFocus) -> Arc<TtlFocus> {
        let focus = Arc::new(focus);
        self.foci.insert(focus.daddr(), focus.clone());
        focus
    }

    pub fn len(&self) -> usize {
        self.foci.len()
    }

    pub fn is_empty(&self) -> bool {
        self.foci.is_empty()
    }

    /// Drop foci not accessed for longer than `idle`
    pub fn expire(&self, idle: Duration) -> usize {
        let cutoff = Utc::now().timestamp() - idle.as_secs() as i64;
        let before = self.foci.len();
        self.foci
            .retain(|_, f| f.access_timestamp.load(Ordering::Relaxed) >= cutoff);
        before.saturating_sub(self.foci.len())
    }

    /// KNOWN estimates, sorted by address
    pub fn records(&self) -> Vec<TtlRecord> {
        let mut records: Vec<TtlRecord> = self
            .foci
            .iter()
            .filter_map(|entry| {
                let snap = entry.value().snapshot();
                snap.known_estimate().map(|ttl_estimate| TtlRecord {
                    daddr: *entry.key(),
                    ttl_estimate,
                })
            })
            .collect();
        records.sort_by_key(|r| r.daddr);
        records
    }

    /// Save KNOWN estimates to a YAML cache file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let records = self.records();
        let yaml = serde_yaml::to_string(&records)?;
        fs::write(&path, yaml).await.map_err(|e| {
            anyhow!("Failed to write TTL cache '{}': {}", path.as_ref().display(), e)
        })?;
        info!("Saved {} TTL estimates to {}", records.len(), path.as_ref().display());
        Ok(())
    }

    /// Restore a map from a YAML cache file; a missing file yields an empty map
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let map = Self::new();
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                let records: Vec<TtlRecord> = serde_yaml::from_str(&contents)
                    .map_err(|e| anyhow!("Failed to parse TTL cache: {}", e))?;
                for record in records {
                    map.insert(TtlFocus::known(record.daddr, record.ttl_estimate));
                }
                info!("Restored {} TTL estimates from {}", map.len(), path.as_ref().display());
                Ok(map)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("TTL cache '{}' not found, starting empty", path.as_ref().display());
                Ok(map)
            }
            Err(e) => Err(anyhow!(
                "Failed to read TTL cache '{}': {}",
                path.as_ref().display(),
                e
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DST: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 7);

    #[test]
    fn test_new_focus_is_unknown() {
        let focus = TtlFocus::new(DST);
        let snap = focus.snapshot();
        assert_eq!(snap.status, TtlStatus::Unknown);
        assert_eq!(snap.known_estimate(), None);
    }

    #[test]
    fn test_trace_lifecycle() {
        let focus = TtlFocus::new(DST);
        focus.start_bruteforce();
        assert_eq!(focus.status(), TtlStatus::Bruteforce);
        focus.record_trace_sent();
        focus.record_trace_sent();
        focus.record_trace_reply(12);
        focus.record_trace_reply(9);
        focus.record_trace_reply(15);
        assert_eq!(focus.sent_traces(), 2);
        assert_eq!(focus.received_traces(), 3);
        assert_eq!(focus.snapshot().known_estimate(), Some(9));
    }

    #[test]
    fn test_degrade_only_from_known() {
        let focus = TtlFocus::new(DST);
        focus.degrade();
        assert_eq!(focus.status(), TtlStatus::Unknown);

        let focus = TtlFocus::known(DST, 7);
        focus.degrade();
        let snap = focus.snapshot();
        assert_eq!(snap.status, TtlStatus::Bruteforce);
        assert_eq!(snap.ttl_estimate, 7);
        assert_eq!(snap.known_estimate(), None);
    }

    #[test]
    fn test_map_shares_records() {
        let map = TtlFocusMap::new();
        let a = map.focus(DST);
        let b = map.focus(DST);
        assert!(Arc::ptr_eq(&a, &b));
        a.record_trace_reply(4);
        assert_eq!(map.get(&DST).unwrap().snapshot().known_estimate(), Some(4));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_concurrent_tracer_and_reader() {
        let map = Arc::new(TtlFocusMap::new());
        let focus = map.focus(DST);
        let tracer = {
            let focus = focus.clone();
            std::thread::spawn(move || {
                for ttl in (1..=64u8).rev() {
                    focus.record_trace_reply(ttl);
                }
            })
        };
        for _ in 0..1000 {
            let snap = focus.snapshot();
            if snap.status == TtlStatus::Known {
                assert!(snap.ttl_estimate >= 1 && snap.ttl_estimate <= 64);
            }
        }
        tracer.join().unwrap();
        assert_eq!(focus.snapshot().known_estimate(), Some(1));
    }

    #[test]
    fn test_expire_keeps_recent() {
        let map = TtlFocusMap::new();
        map.focus(DST);
        assert_eq!(map.expire(Duration::from_secs(3600)), 0);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_expire_drops_idle() {
        let map = TtlFocusMap::new();
        let stale = map.focus(DST);
        stale
            .access_timestamp
            .store(Utc::now().timestamp() - 7200, Ordering::Relaxed);
        map.focus(Ipv4Addr::new(198, 51, 100, 1));

        assert_eq!(map.expire(Duration::from_secs(3600)), 1);
        assert_eq!(map.len(), 1);
        assert!(map.get(&DST).is_none());

        // a lookup refreshes the idle clock
        let revived = map.focus(DST);
        revived
            .access_timestamp
            .store(Utc::now().timestamp() - 7200, Ordering::Relaxed);
        map.focus(DST);
        assert_eq!(map.expire(Duration::from_secs(3600)), 0);
    }

    #[tokio::test]
    async fn test_save_and_load_known_only() {
        let map = TtlFocusMap::new();
        map.insert(TtlFocus::known(DST, 11));
        map.focus(Ipv4Addr::new(198, 51, 100, 1));

        let path = std::env::temp_dir().join(format!("sj-ttl-{}.yml", std::process::id()));
        map.save(&path).await.unwrap();
        let restored = TtlFocusMap::load(&path).await.unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(restored.len(), 1);
        assert_eq!(
            restored.records(),
            vec![TtlRecord { daddr: DST, ttl_estimate: 11 }]
        );
    }

    #[tokio::test]
    async fn test_load_missing_cache() {
        let map = TtlFocusMap::load("/nonexistent/sj-ttl.yml").await.unwrap();
        assert!(map.is_empty());
    }
}
