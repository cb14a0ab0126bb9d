//! Session tracking view consumed by the hack pipeline
//!
//! Connection tracking itself lives with the network I/O layer; the
//! pipeline only reads the phase of a flow and the scramble classes its
//! policy currently permits.

use crate::packet::Packet;
use crate::scramble::Scramble;
use dashmap::DashMap;
use std::net::Ipv4Addr;

/// Phase of a TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Handshake,
    Established,
    Closing,
}

/// Flow key (saddr, sport, daddr, dport)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub saddr: Ipv4Addr,
    pub sport: u16,
    pub daddr: Ipv4Addr,
    pub dport: u16,
}

impl FlowKey {
    /// Key of a TCP packet, `None` for anything else
    pub fn of(pkt: &Packet) -> Option<Self> {
        let tcp = pkt.tcp()?;
        let ip = pkt.ip();
        Some(Self {
            saddr: ip.saddr,
            sport: tcp.sport,
            daddr: ip.daddr,
            dport: tcp.dport,
        })
    }
}

/// Read-only state of one tracked connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTrack {
    pub phase: ConnectionPhase,
    /// Scramble classes the policy currently permits for this flow
    pub scrambles: Scramble,
}

impl SessionTrack {
    pub fn new(phase: ConnectionPhase, scrambles: Scramble) -> Self {
        Self { phase, scrambles }
    }

    /// Whether hacks may run on this flow at all
    pub fn hackable(&self) -> bool {
        self.phase != ConnectionPhase::Handshake && !self.scrambles.is_empty()
    }
}

/// Concurrent table the tracker publishes sessions into
#[derive(Debug, Default)]
pub struct SessionTrackMap {
    sessions: DashMap<FlowKey, SessionTrack>,
}

impl SessionTrackMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, key: FlowKey, session: SessionTrack) {
        self.sessions.insert(key, session);
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<SessionTrack> {
        self.sessions.get(key).map(|s| *s)
    }

    pub fn remove(&self, key: &FlowKey) -> Option<SessionTrack> {
        self.sessions.remove(key).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
