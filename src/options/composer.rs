//! Option header composition under a byte budget

use super::ip::{
    IpNoop, IpRecordRoute, IpRouterAlert, IpSecurityLabel, IpSourceRoute, IpTimestamp,
    IpTimestampOverflow,
};
use super::tcp::{TcpMd5Sig, TcpNop, TcpPawsCorrupt};
use super::{CorruptionPolicy, InjectorDescriptor, OptionBuilder, OptionError, OptionInjector, OptionProto};
use crate::constants::{IPOPT_LSRR, IPOPT_NOOP, IPOPT_SSRR, TCPOPT_NOP};
use crate::ttlfocus::TtlFocus;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What the composed header is meant to do to the receiving stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionIntent {
    /// Make the packet rejected by correct stacks
    Corrupt,
    /// Keep the packet acceptable
    Clean,
}

/// Result of one composition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composition {
    /// Option block, padded to a multiple of 4 bytes
    pub bytes: Vec<u8>,
    /// Whether a known-corrupting option (or repetition) was written
    pub corrupted: bool,
    /// Names of the injectors applied, in order
    pub applied: Vec<&'static str>,
}

/// Every injector known to the engine, in registration order
pub fn default_injectors() -> Vec<Box<dyn OptionInjector>> {
    vec![
        Box::new(IpNoop::new(0)),
        Box::new(IpTimestamp::new(1)),
        Box::new(IpTimestampOverflow::new(2)),
        Box::new(IpSourceRoute::loose(3)),
        Box::new(IpSourceRoute::strict(4)),
        Box::new(IpRecordRoute::new(5)),
        Box::new(IpRouterAlert::new(6)),
        Box::new(IpSecurityLabel::cipso(7)),
        Box::new(IpSecurityLabel::sec(8)),
        Box::new(IpSecurityLabel::sid(9)),
        Box::new(TcpNop::new(10)),
        Box::new(TcpMd5Sig::new(11)),
        Box::new(TcpPawsCorrupt::new(12)),
    ]
}

/// Both source route flavours count as the same option when repeated
fn repetition_key(opcode: u8) -> u8 {
    if opcode == IPOPT_SSRR {
        IPOPT_LSRR
    } else {
        opcode
    }
}

fn candidate_rank(policy: CorruptionPolicy) -> u8 {
    match policy {
        CorruptionPolicy::Always | CorruptionPolicy::IfRepeated => 0,
        CorruptionPolicy::Uncertain => 1,
        CorruptionPolicy::Never => 2,
    }
}

/// Fills an option header from the registered injectors
pub struct OptionComposer {
    injectors: Vec<Box<dyn OptionInjector>>,
}

impl Default for OptionComposer {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionComposer {
    pub fn new() -> Self {
        Self::with_injectors(default_injectors())
    }

    pub fn with_injectors(injectors: Vec<Box<dyn OptionInjector>>) -> Self {
        Self { injectors }
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &InjectorDescriptor> {
        self.injectors.iter().map(|i| i.descriptor())
    }

    /// Enable or disable an injector by name, false when the name is unknown
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self
            .injectors
            .iter_mut()
            .find(|i| i.descriptor().name.eq_ignore_ascii_case(name))
        {
            Some(inj) => {
                inj.descriptor_mut().enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn set_proto_enabled(&mut self, proto: OptionProto, enabled: bool) {
        for inj in self.injectors.iter_mut().filter(|i| i.descriptor().proto == proto) {
            inj.descriptor_mut().enabled = enabled;
        }
    }

    pub fn proto_enabled(&self, proto: OptionProto) -> bool {
        self.descriptors().any(|d| d.proto == proto && d.enabled)
    }

    /// Bind every TTL-dependent injector to the record of one destination
    pub fn bind_ttlfocus(&mut self, focus: &Arc<TtlFocus>) {
        for inj in self.injectors.iter_mut() {
            inj.setup_ttlfocus(focus.clone());
        }
    }

    /// Compose an option block for `proto` within `capacity` bytes
    ///
    /// Each eligible injector is offered the remaining budget once, in
    /// random order with the corrupting ones first; an injector that wrote
    /// a repeat-sensitive option is offered one immediate second chance.
    pub fn compose(
        &self,
        proto: OptionProto,
        intent: CompositionIntent,
        capacity: usize,
        clock: u32,
    ) -> Result<Composition, OptionError> {
        let mut ob = OptionBuilder::new(capacity, clock);
        let mut rng = rand::thread_rng();

        let mut candidates: Vec<&dyn OptionInjector> = self
            .injectors
            .iter()
            .map(|i| i.as_ref())
            .filter(|i| {
                let d = i.descriptor();
                d.enabled
                    && d.proto == proto
                    && match intent {
                        CompositionIntent::Clean => d.corruption.clean(),
                        CompositionIntent::Corrupt => d.corruption != CorruptionPolicy::Never,
                    }
            })
            .collect();
        candidates.shuffle(&mut rng);
        candidates.sort_by_key(|i| candidate_rank(i.descriptor().corruption));

        let mut applied = Vec::new();
        let mut corrupted = false;
        let mut repeats: HashMap<u8, usize> = HashMap::new();

        for inj in candidates {
            if ob.available() == 0 {
                break;
            }
            let d = inj.descriptor();
            let offers = if d.corruption == CorruptionPolicy::IfRepeated { 2 } else { 1 };
            for _ in 0..offers {
                let bytes = inj.apply(&ob);
                if bytes.is_empty() {
                    break;
                }
                Self::check_well_formed(d, &bytes)?;
                ob.commit(d.name, &bytes)?;
                applied.push(d.name);
                match d.corruption {
                    CorruptionPolicy::Always => corrupted = true,
                    CorruptionPolicy::IfRepeated => {
                        let seen = repeats.entry(repetition_key(d.opcode)).or_insert(0);
                        *seen += 1;
                        if *seen >= 2 {
                            corrupted = true;
                        }
                    }
                    CorruptionPolicy::Never | CorruptionPolicy::Uncertain => {}
                }
            }
        }

        let filler = match proto {
            OptionProto::Ip => IPOPT_NOOP,
            OptionProto::Tcp => TCPOPT_NOP,
        };
        while ob.written() % 4 != 0 {
            ob.commit("padding", &[filler])?;
        }

        debug!(
            %proto,
            size = ob.written(),
            capacity,
            corrupted,
            injectors = applied.len(),
            "option header composed"
        );

        Ok(Composition {
            bytes: ob.into_bytes(),
            corrupted,
            applied,
        })
    }

    /// Multi-byte options must carry their own length
    fn check_well_formed(d: &InjectorDescriptor, bytes: &[u8]) -> Result<(), OptionError> {
        if bytes.len() > 1 && (bytes[0] != d.opcode || bytes[1] as usize != bytes.len()) {
            return Err(OptionError::Malformed {
                injector: d.name,
                size: bytes.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::descriptor_accessors;
    use std::net::Ipv4Addr;

    /// Claims one byte of room but returns more
    struct Greedy {
        info: InjectorDescriptor,
    }

    impl OptionInjector for Greedy {
        descriptor_accessors!();

        fn apply(&self, ob: &OptionBuilder) -> Vec<u8> {
            let len = ob.available() + 2;
            let mut opt = vec![0u8; len];
            opt[0] = self.info.opcode;
            opt[1] = len as u8;
            opt
        }
    }

    #[test]
    fn test_corrupt_ip_fits_budget() {
        let composer = OptionComposer::new();
        for capacity in [0usize, 4, 8, 12, 20, 40] {
            for _ in 0..20 {
                let c = composer
                    .compose(OptionProto::Ip, CompositionIntent::Corrupt, capacity, 0)
                    .unwrap();
                assert!(c.bytes.len() <= capacity);
                assert_eq!(c.bytes.len() % 4, 0);
            }
        }
    }

    #[test]
    fn test_corrupt_ip_with_full_budget_corrupts() {
        let composer = OptionComposer::new();
        for _ in 0..50 {
            let c = composer
                .compose(OptionProto::Ip, CompositionIntent::Corrupt, 40, 0)
                .unwrap();
            assert!(c.corrupted, "applied: {:?}", c.applied);
        }
    }

    #[test]
    fn test_corrupt_tcp_uses_tcp_injectors_only() {
        let composer = OptionComposer::new();
        let c = composer
            .compose(OptionProto::Tcp, CompositionIntent::Corrupt, 40, 1000)
            .unwrap();
        assert!(c.corrupted);
        assert!(c.applied.iter().all(|n| n.starts_with("TCP") || *n == "padding"));
    }

    #[test]
    fn test_clean_never_corrupts() {
        let composer = OptionComposer::new();
        let c = composer
            .compose(OptionProto::Ip, CompositionIntent::Clean, 40, 0)
            .unwrap();
        assert!(!c.corrupted);
        assert!(c.bytes.iter().all(|b| *b == IPOPT_NOOP));
    }

    #[test]
    fn test_disabled_injectors_are_skipped() {
        let mut composer = OptionComposer::new();
        composer.set_proto_enabled(OptionProto::Tcp, false);
        assert!(!composer.proto_enabled(OptionProto::Tcp));
        let c = composer
            .compose(OptionProto::Tcp, CompositionIntent::Corrupt, 40, 0)
            .unwrap();
        assert!(c.bytes.is_empty());
        assert!(!c.corrupted);
        assert!(composer.set_enabled("tcp paws", true));
        assert!(!composer.set_enabled("no such option", true));
    }

    #[test]
    fn test_overflow_only_fires_when_bound_and_known() {
        let keep = |composer: &mut OptionComposer| {
            let names: Vec<&'static str> = composer.descriptors().map(|d| d.name).collect();
            for name in names {
                composer.set_enabled(name, name == "IP Timestamp overflow");
            }
        };
        let mut composer = OptionComposer::new();
        keep(&mut composer);
        let c = composer.compose(OptionProto::Ip, CompositionIntent::Corrupt, 40, 0).unwrap();
        assert!(c.bytes.is_empty());

        let focus = Arc::new(TtlFocus::new(Ipv4Addr::new(203, 0, 113, 9)));
        composer.bind_ttlfocus(&focus);
        let c = composer.compose(OptionProto::Ip, CompositionIntent::Corrupt, 40, 0).unwrap();
        assert!(c.bytes.is_empty());

        focus.record_trace_reply(5);
        let c = composer.compose(OptionProto::Ip, CompositionIntent::Corrupt, 40, 0).unwrap();
        assert_eq!(c.bytes.len(), 40);
        assert!(c.corrupted);
    }

    #[test]
    fn test_overrun_is_fatal() {
        let greedy = Greedy {
            info: InjectorDescriptor::new(0, "greedy", OptionProto::Ip, 0x99, CorruptionPolicy::Always),
        };
        let composer = OptionComposer::with_injectors(vec![Box::new(greedy)]);
        let err = composer
            .compose(OptionProto::Ip, CompositionIntent::Corrupt, 8, 0)
            .unwrap_err();
        assert_eq!(
            err,
            OptionError::BudgetOverrun { injector: "greedy", size: 10, available: 8 }
        );
    }

    #[test]
    fn test_repeat_sensitive_option_is_doubled() {
        let composer = OptionComposer::with_injectors(vec![Box::new(IpSecurityLabel::sid(0))]);
        let c = composer.compose(OptionProto::Ip, CompositionIntent::Corrupt, 8, 0).unwrap();
        assert_eq!(c.applied, vec!["IP SID", "IP SID"]);
        assert!(c.corrupted);

        let c = composer.compose(OptionProto::Ip, CompositionIntent::Corrupt, 4, 0).unwrap();
        assert_eq!(c.applied, vec!["IP SID"]);
        assert!(!c.corrupted);
    }
}
