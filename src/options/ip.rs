//! IPv4 option injectors
//!
//! References for the stack behaviours exploited here: RFC 781 (timestamp),
//! RFC 791 (security, source routes, record route), RFC 1812 §5.2.4.1
//! (multiple source routes), RFC 2113 (router alert) and the option
//! parser of Linux `net/ipv4/ip_options.c`.

use super::{
    descriptor_accessors, random_bytes, CorruptionPolicy, InjectorDescriptor, OptionBuilder,
    OptionInjector, OptionProto,
};
use crate::constants::*;
use crate::ttlfocus::TtlFocus;
use std::sync::Arc;

/// Timestamp slots used by the overflow injector (4 + 9 * 4 = 40 bytes)
pub const TIMESTOVERFLOW_SLOTS: u8 = 9;

/// Slots of a timestamp option are 4 bytes each after a 4 byte preamble
const TIMESTAMP_PREAMBLE: usize = 4;
const TIMESTAMP_SLOT: usize = 4;

/// Source/record route: code, length, pointer, then addresses
const ROUTE_PREAMBLE: usize = 3;
const ROUTE_SLOT: usize = 4;
const ROUTE_MAX_SLOTS: usize = 4;

/// Single byte filler
pub struct IpNoop {
    info: InjectorDescriptor,
}

impl IpNoop {
    pub fn new(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(index, "IP NOOP", OptionProto::Ip, IPOPT_NOOP, CorruptionPolicy::Never),
        }
    }
}

impl OptionInjector for IpNoop {
    descriptor_accessors!();

    fn apply(&self, ob: &OptionBuilder) -> Vec<u8> {
        if ob.available() < IPOPT_NOOP_SIZE {
            return Vec::new();
        }
        vec![IPOPT_NOOP]
    }
}

/// Empty timestamp option, legal but silently filtered by some networks
pub struct IpTimestamp {
    info: InjectorDescriptor,
}

impl IpTimestamp {
    pub fn new(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(
                index,
                "IP Timestamp",
                OptionProto::Ip,
                IPOPT_TIMESTAMP,
                CorruptionPolicy::Uncertain,
            ),
        }
    }
}

impl OptionInjector for IpTimestamp {
    descriptor_accessors!();

    fn apply(&self, ob: &OptionBuilder) -> Vec<u8> {
        let size = ob.rand_size(TIMESTAMP_PREAMBLE, 1, TIMESTOVERFLOW_SLOTS as usize, TIMESTAMP_SLOT);
        if size == 0 {
            return Vec::new();
        }
        // preallocated timestamp space must be zero
        let mut opt = vec![0u8; size];
        opt[0] = IPOPT_TIMESTAMP;
        opt[1] = size as u8;
        opt[2] = 5;
        opt[3] = IPOPT_TS_TSONLY;
        opt
    }
}

/// Slots filled and overflow counter of a full timestamp option so that it
/// overflows around hop `ttl_estimate`, or `None` when the 4 bit overflow
/// counter cannot cover that many hops
pub fn overflow_layout(slots: u8, ttl_estimate: u8) -> Option<(u8, u8)> {
    let covered_destinations = slots as u16 + 15;
    let ttl = ttl_estimate as u16;
    if ttl > covered_destinations {
        return None;
    }
    let mut filled = covered_destinations - ttl;
    let mut overflow = 0;
    if filled > slots as u16 {
        overflow = filled - slots as u16;
        filled = slots as u16;
    }
    Some((filled as u8, overflow as u8))
}

/// Full timestamp option whose overflow counter is tuned on the hop
/// estimate of the destination
pub struct IpTimestampOverflow {
    info: InjectorDescriptor,
    ttlfocus: Option<Arc<TtlFocus>>,
}

impl IpTimestampOverflow {
    pub fn new(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(
                index,
                "IP Timestamp overflow",
                OptionProto::Ip,
                IPOPT_TIMESTAMP,
                CorruptionPolicy::Always,
            ),
            ttlfocus: None,
        }
    }
}

impl OptionInjector for IpTimestampOverflow {
    descriptor_accessors!();

    fn apply(&self, ob: &OptionBuilder) -> Vec<u8> {
        let Some(estimate) = self
            .ttlfocus
            .as_ref()
            .and_then(|focus| focus.snapshot().known_estimate())
        else {
            return Vec::new();
        };
        let Some((filled, overflow)) = overflow_layout(TIMESTOVERFLOW_SLOTS, estimate) else {
            return Vec::new();
        };

        let slots = TIMESTOVERFLOW_SLOTS as usize;
        let size = ob.rand_size(TIMESTAMP_PREAMBLE, slots, slots, TIMESTAMP_SLOT);
        if size == 0 {
            return Vec::new();
        }

        let mut opt = vec![0u8; size];
        opt[0] = IPOPT_TIMESTAMP;
        opt[1] = size as u8;
        // pointer past the end: the option is full, the next hop overflows
        opt[2] = size as u8 + 1;
        opt[3] = IPOPT_TS_TSONLY | (overflow << 4);
        let stamps = filled as usize * TIMESTAMP_SLOT;
        opt[TIMESTAMP_PREAMBLE..TIMESTAMP_PREAMBLE + stamps].copy_from_slice(&random_bytes(stamps));
        opt
    }

    fn setup_ttlfocus(&mut self, focus: Arc<TtlFocus>) {
        self.ttlfocus = Some(focus);
    }
}

/// Loose or strict source route with random addresses
///
/// Two source route options in one datagram are an error for RFC 1812
/// compliant routers and for Linux, hence the repetition policy.
pub struct IpSourceRoute {
    info: InjectorDescriptor,
}

impl IpSourceRoute {
    pub fn loose(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(index, "IP LSRR", OptionProto::Ip, IPOPT_LSRR, CorruptionPolicy::IfRepeated),
        }
    }

    pub fn strict(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(index, "IP SSRR", OptionProto::Ip, IPOPT_SSRR, CorruptionPolicy::IfRepeated),
        }
    }
}

impl OptionInjector for IpSourceRoute {
    descriptor_accessors!();

    fn apply(&self, ob: &OptionBuilder) -> Vec<u8> {
        let size = ob.rand_size(ROUTE_PREAMBLE, 1, ROUTE_MAX_SLOTS, ROUTE_SLOT);
        if size == 0 {
            return Vec::new();
        }
        let mut opt = Vec::with_capacity(size);
        opt.extend_from_slice(&[self.info.opcode, size as u8, 4]);
        opt.extend_from_slice(&random_bytes(size - ROUTE_PREAMBLE));
        opt
    }
}

/// Record route with the pointer already past the end
///
/// Linux rejects a pointer that lands inside the option without room for
/// a full address, and the random fill leaves nothing coherent to record.
pub struct IpRecordRoute {
    info: InjectorDescriptor,
}

impl IpRecordRoute {
    pub fn new(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(index, "IP RR", OptionProto::Ip, IPOPT_RR, CorruptionPolicy::Always),
        }
    }
}

impl OptionInjector for IpRecordRoute {
    descriptor_accessors!();

    fn apply(&self, ob: &OptionBuilder) -> Vec<u8> {
        let size = ob.rand_size(ROUTE_PREAMBLE, 1, ROUTE_MAX_SLOTS, ROUTE_SLOT);
        if size == 0 {
            return Vec::new();
        }
        let mut opt = Vec::with_capacity(size);
        opt.extend_from_slice(&[IPOPT_RR, size as u8, size as u8 + 1]);
        opt.extend_from_slice(&random_bytes(size - ROUTE_PREAMBLE));
        opt
    }
}

/// Router alert with a random (reserved) value
pub struct IpRouterAlert {
    info: InjectorDescriptor,
}

impl IpRouterAlert {
    pub fn new(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(index, "IP RA", OptionProto::Ip, IPOPT_RA, CorruptionPolicy::Uncertain),
        }
    }
}

impl OptionInjector for IpRouterAlert {
    descriptor_accessors!();

    fn apply(&self, ob: &OptionBuilder) -> Vec<u8> {
        if ob.available() < IPOPT_RA_SIZE {
            return Vec::new();
        }
        // only 0 is defined; 1-65535 are reserved
        let mut opt = vec![IPOPT_RA, IPOPT_RA_SIZE as u8];
        opt.extend_from_slice(&random_bytes(2));
        opt
    }
}

/// Fixed-size security family option (CIPSO, SEC, SID) with random payload
///
/// Without CAP_NET_RAW on the originating socket Linux refuses these
/// options; a random payload also fails CIPSO validation.
pub struct IpSecurityLabel {
    info: InjectorDescriptor,
    size: usize,
}

impl IpSecurityLabel {
    pub fn cipso(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(index, "IP CIPSO", OptionProto::Ip, IPOPT_CIPSO, CorruptionPolicy::Always),
            size: IPOPT_CIPSO_SIZE,
        }
    }

    pub fn sec(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(index, "IP SEC", OptionProto::Ip, IPOPT_SEC, CorruptionPolicy::Always),
            size: IPOPT_SEC_SIZE,
        }
    }

    pub fn sid(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(index, "IP SID", OptionProto::Ip, IPOPT_SID, CorruptionPolicy::IfRepeated),
            size: IPOPT_SID_SIZE,
        }
    }
}

impl OptionInjector for IpSecurityLabel {
    descriptor_accessors!();

    fn apply(&self, ob: &OptionBuilder) -> Vec<u8> {
        if ob.available() < self.size {
            return Vec::new();
        }
        let mut opt = vec![self.info.opcode, self.size as u8];
        opt.extend_from_slice(&random_bytes(self.size - 2));
        opt
    }
}
