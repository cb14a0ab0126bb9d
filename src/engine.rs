//! Per-packet hack pipeline
//!
//! Takes one captured frame, runs the plugin pass on it, realises the
//! scramble of every synthesized packet and returns the frames to inject
//! in order, each tagged with how the I/O layer should send it.

use crate::config::Config;
use crate::hack::{self, HackEnv, HackError, HackPool};
use crate::options::{CompositionIntent, OptionComposer, OptionProto};
use crate::packet::{Direction, Packet, Position, Source};
use crate::scramble::{Judge, Scramble};
use crate::session::SessionTrack;
use crate::ttlfocus::{TtlFocus, TtlFocusMap};
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How the I/O layer should inject an outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionHint {
    SendNow,
    SendAfterDelay,
    /// Sent on purpose to die before (or at) the peer
    SendExpectDrop,
}

/// One frame to inject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub bytes: Vec<u8>,
    pub hint: InjectionHint,
    pub source: Source,
    /// Trust level of a synthesized frame, `None` for the original
    pub wtf: Option<Judge>,
}

impl Outbound {
    fn original(bytes: Vec<u8>, source: Source) -> Self {
        Self {
            bytes,
            hint: InjectionHint::SendNow,
            source,
            wtf: None,
        }
    }

    fn synthesized(pkt: Packet, after_original: bool) -> Self {
        let hint = if pkt.wtf.expects_drop() {
            InjectionHint::SendExpectDrop
        } else if after_original {
            InjectionHint::SendAfterDelay
        } else {
            InjectionHint::SendNow
        };
        let wtf = Some(pkt.wtf);
        Self {
            bytes: pkt.into_bytes(),
            hint,
            source: Source::Plugin,
            wtf,
        }
    }
}

pub struct HackEngine {
    pool: HackPool,
    composer: OptionComposer,
    configured: Scramble,
}

impl HackEngine {
    pub fn new(pool: HackPool, composer: OptionComposer, configured: Scramble) -> Self {
        Self {
            pool,
            composer,
            configured,
        }
    }

    /// Engine with every registered plugin initialised against `config`
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let configured = config.configured_scrambles()?;
        let env = HackEnv {
            location: config.location.clone(),
        };
        let mut pool = HackPool::new(hack::registry());
        let enabled = pool.init(configured, &config.plugins, &env);
        if enabled == 0 {
            warn!("No plugin enabled with scrambles {}; traffic will pass untouched", configured);
        } else {
            info!("{} plugins enabled with scrambles {}", enabled, configured);
        }
        Ok(Self::new(pool, config.option_composer()?, configured))
    }

    pub fn pool(&self) -> &HackPool {
        &self.pool
    }

    pub fn composer(&self) -> &OptionComposer {
        &self.composer
    }

    pub fn configured(&self) -> Scramble {
        self.configured
    }

    /// Scramble classes usable for a packet of `session` towards `focus`
    ///
    /// TTL is only usable once the hop count of the destination is KNOWN.
    pub fn available_scrambles(&self, session: &SessionTrack, focus: &TtlFocus) -> Scramble {
        let mut available = self.configured & session.scrambles;
        if focus.snapshot().known_estimate().is_none() {
            available = available & !Scramble::TTL;
        }
        available
    }

    /// Run the pipeline on one captured frame
    ///
    /// Never fails: whatever goes wrong, the original frame is returned.
    pub fn process(
        &mut self,
        frame: Vec<u8>,
        direction: Direction,
        session: &SessionTrack,
        ttl_map: &TtlFocusMap,
    ) -> Vec<Outbound> {
        let source = match direction {
            Direction::Outgoing => Source::Tunnel,
            Direction::Incoming => Source::Network,
        };

        let origpkt = match Packet::from_frame(frame.clone(), source) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!("Passing through unparsable frame ({} bytes): {}", frame.len(), e);
                return vec![Outbound::original(frame, source)];
            }
        };

        if direction == Direction::Incoming || !session.hackable() {
            return vec![Outbound::original(origpkt.into_bytes(), source)];
        }

        let focus = ttl_map.focus(origpkt.daddr());
        let available = self.available_scrambles(session, &focus);

        let synthesized = match self.run_pass(&origpkt, available, &focus) {
            Ok(pkts) => pkts,
            Err(e) => {
                warn!(daddr = %origpkt.daddr(), "Hack pass aborted, forwarding original only: {}", e);
                Vec::new()
            }
        };

        Self::order(origpkt, synthesized)
    }

    fn run_pass(
        &mut self,
        origpkt: &Packet,
        available: Scramble,
        focus: &Arc<TtlFocus>,
    ) -> Result<Vec<Packet>, HackError> {
        let generated = self.pool.dispatch(origpkt, available)?;
        let mut finalized = Vec::with_capacity(generated.len());
        for pkt in generated {
            if let Some(pkt) = self.finalize(pkt, available, focus)? {
                finalized.push(pkt);
            }
        }
        Ok(finalized)
    }

    /// Realise the scramble of a synthesized packet
    ///
    /// Starts from the trust level the plugin chose and falls back to any
    /// other class it allows; `None` when nothing applies.
    fn finalize(
        &mut self,
        pkt: Packet,
        available: Scramble,
        focus: &Arc<TtlFocus>,
    ) -> Result<Option<Packet>, HackError> {
        let allowed = pkt.choosable_scramble & available;
        let mut fallbacks: Vec<Judge> = allowed
            .iter()
            .filter(|s| *s != pkt.wtf.scramble())
            .filter_map(Judge::from_scramble)
            .collect();
        fallbacks.shuffle(&mut rand::thread_rng());

        let mut attempts = Vec::with_capacity(fallbacks.len() + 1);
        if allowed.contains(pkt.wtf.scramble()) {
            attempts.push(pkt.wtf);
        }
        attempts.extend(fallbacks);

        for judge in attempts {
            let mut candidate = pkt.clone();
            if self.apply_judge(&mut candidate, judge, focus)? {
                if judge != pkt.wtf {
                    debug!("Scramble {:?} unavailable, fell back to {:?}", pkt.wtf, judge);
                }
                candidate.wtf = judge;
                return Ok(Some(candidate));
            }
        }

        debug!(
            choosable = %pkt.choosable_scramble,
            %available,
            "No scramble applicable, dropping synthesized packet"
        );
        Ok(None)
    }

    /// Apply one scramble technique, false when it cannot be applied
    fn apply_judge(
        &mut self,
        pkt: &mut Packet,
        judge: Judge,
        focus: &Arc<TtlFocus>,
    ) -> Result<bool, HackError> {
        match judge {
            Judge::Innocent => {
                pkt.fix_checksums();
                Ok(true)
            }
            Judge::Prescription => match focus.snapshot().known_estimate() {
                Some(estimate) if estimate > 1 => {
                    pkt.set_ttl(estimate - 1);
                    pkt.fix_checksums();
                    Ok(true)
                }
                _ => Ok(false),
            },
            Judge::Guilty => {
                if pkt.tcp().is_none() {
                    return Ok(false);
                }
                pkt.fix_checksums();
                pkt.corrupt_tcp_checksum()?;
                Ok(true)
            }
            Judge::Malformed => self.malform(pkt, focus),
        }
    }

    /// Inject a corrupting option header, IP first then TCP
    fn malform(&mut self, pkt: &mut Packet, focus: &Arc<TtlFocus>) -> Result<bool, HackError> {
        self.composer.bind_ttlfocus(focus);
        let clock = Utc::now().timestamp() as u32;

        if self.composer.proto_enabled(OptionProto::Ip) {
            let room = pkt.ip_options_room() & !3;
            let composition = self
                .composer
                .compose(OptionProto::Ip, CompositionIntent::Corrupt, room, clock)?;
            if composition.corrupted {
                pkt.inject_ip_options(&composition.bytes)?;
                pkt.fix_checksums();
                debug!(injectors = ?composition.applied, "IP options malformed");
                return Ok(true);
            }
        }

        if self.composer.proto_enabled(OptionProto::Tcp) && pkt.tcp().is_some() {
            let room = pkt.tcp_options_room() & !3;
            let composition = self
                .composer
                .compose(OptionProto::Tcp, CompositionIntent::Corrupt, room, clock)?;
            if composition.corrupted {
                pkt.inject_tcp_options(&composition.bytes)?;
                pkt.fix_checksums();
                debug!(injectors = ?composition.applied, "TCP options malformed");
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Anticipation packets, the original, then posticipation packets
    fn order(origpkt: Packet, synthesized: Vec<Packet>) -> Vec<Outbound> {
        let mut rng = rand::thread_rng();
        let mut before = Vec::new();
        let mut after = Vec::new();
        for pkt in synthesized {
            let position = match pkt.position {
                Position::Any if rng.gen_bool(0.5) => Position::Anticipation,
                Position::Any => Position::Posticipation,
                other => other,
            };
            if position == Position::Anticipation {
                before.push(Outbound::synthesized(pkt, false));
            } else {
                after.push(Outbound::synthesized(pkt, true));
            }
        }

        let source = origpkt.source;
        let mut out = before;
        out.push(Outbound::original(origpkt.into_bytes(), source));
        out.extend(after);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use crate::hack::{FakeData, ValidRstFakeSeq};
    use crate::packet::testutil::{tcp_frame, tcp_packet};
    use crate::packet::{ChainFlag, TcpFlags};
    use crate::session::ConnectionPhase;
    use std::net::Ipv4Addr;

    const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn engine(configured: Scramble) -> HackEngine {
        let mut pool = HackPool::new(vec![Box::new(ValidRstFakeSeq::new()), Box::new(FakeData::new())]);
        pool.init(configured, &[], &HackEnv::default());
        HackEngine::new(pool, OptionComposer::new(), configured)
    }

    fn established(scrambles: Scramble) -> SessionTrack {
        SessionTrack::new(ConnectionPhase::Established, scrambles)
    }

    #[test]
    fn test_unparsable_frame_passes_through() {
        let mut engine = engine(Scramble::INNOCENT);
        let map = TtlFocusMap::new();
        let out = engine.process(vec![0x60, 0, 0], Direction::Outgoing, &established(Scramble::ALL), &map);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, vec![0x60, 0, 0]);
        assert_eq!(out[0].hint, InjectionHint::SendNow);
        assert_eq!(out[0].wtf, None);
    }

    #[test]
    fn test_incoming_and_handshake_untouched() {
        let mut engine = engine(Scramble::INNOCENT);
        let map = TtlFocusMap::new();
        let frame = tcp_frame(TcpFlags::ACK, 7, b"hello");

        let out = engine.process(frame.clone(), Direction::Incoming, &established(Scramble::ALL), &map);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, frame);
        assert_eq!(out[0].source, Source::Network);

        let handshake = SessionTrack::new(ConnectionPhase::Handshake, Scramble::ALL);
        let out = engine.process(frame.clone(), Direction::Outgoing, &handshake, &map);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, frame);
    }

    #[test]
    fn test_innocent_reset_around_original() {
        let mut engine = engine(Scramble::INNOCENT);
        let map = TtlFocusMap::new();
        let frame = tcp_frame(TcpFlags::ACK | TcpFlags::PSH, 1000, b"payload");
        let out = engine.process(frame.clone(), Direction::Outgoing, &established(Scramble::ALL), &map);

        assert_eq!(out.len(), 2);
        let original = out.iter().position(|o| o.wtf.is_none()).unwrap();
        assert_eq!(out[original].bytes, frame);
        let forged = &out[1 - original];
        assert_eq!(forged.wtf, Some(Judge::Innocent));
        let expected = if original == 1 { InjectionHint::SendNow } else { InjectionHint::SendAfterDelay };
        assert_eq!(forged.hint, expected);

        let pkt = Packet::from_frame(forged.bytes.clone(), Source::Plugin).unwrap();
        let tcp = pkt.tcp().unwrap();
        assert!(!tcp.rst());
        assert_eq!(tcp.window, 0xFFFF);
        assert!(pkt.ip_checksum_valid());
        assert!(pkt.tcp_checksum_valid());
    }

    #[test]
    fn test_ttl_dropped_until_known() {
        let engine = engine(Scramble::ALL);
        let session = established(Scramble::ALL);
        let unknown = TtlFocus::new(DST);
        assert_eq!(engine.available_scrambles(&session, &unknown), !Scramble::TTL);
        let known = TtlFocus::known(DST, 9);
        assert_eq!(engine.available_scrambles(&session, &known), Scramble::ALL);
        let narrow = established(Scramble::CHECKSUM);
        assert_eq!(engine.available_scrambles(&narrow, &known), Scramble::CHECKSUM);
    }

    #[test]
    fn test_fake_data_expected_to_drop() {
        let mut engine = engine(Scramble::CHECKSUM);
        let map = TtlFocusMap::new();
        let frame = tcp_frame(TcpFlags::ACK | TcpFlags::PSH, 5000, b"real data");
        let out = engine.process(frame.clone(), Direction::Outgoing, &established(Scramble::ALL), &map);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].wtf, Some(Judge::Guilty));
        assert_eq!(out[0].hint, InjectionHint::SendExpectDrop);
        assert_eq!(out[1].bytes, frame);

        let fake = Packet::from_frame(out[0].bytes.clone(), Source::Plugin).unwrap();
        assert!(fake.ip_checksum_valid());
        assert!(!fake.tcp_checksum_valid());
        assert_eq!(fake.tcp().unwrap().seq, 5000);
    }

    #[test]
    fn test_prescription_sets_ttl_below_estimate() {
        let mut engine = engine(Scramble::TTL);
        let map = TtlFocusMap::new();
        map.insert(TtlFocus::known(DST, 7));
        let frame = tcp_frame(TcpFlags::ACK, 5000, b"real data");
        let out = engine.process(frame, Direction::Outgoing, &established(Scramble::ALL), &map);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].wtf, Some(Judge::Prescription));
        let fake = Packet::from_frame(out[0].bytes.clone(), Source::Plugin).unwrap();
        assert_eq!(fake.ip().ttl, 6);
        assert!(fake.tcp_checksum_valid());
    }

    #[test]
    fn test_prescription_without_estimate_is_dropped() {
        let mut engine = engine(Scramble::TTL);
        let map = TtlFocusMap::new();
        let frame = tcp_frame(TcpFlags::ACK, 5000, b"real data");
        let out = engine.process(frame.clone(), Direction::Outgoing, &established(Scramble::ALL), &map);
        // TTL is not available, so fake data does not even apply
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, frame);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_malformed_injects_ip_options() {
        let mut engine = engine(Scramble::MALFORMED);
        let focus = Arc::new(TtlFocus::new(DST));
        let mut pkt = tcp_packet(TcpFlags::ACK, 1, b"data");
        pkt.source = Source::Plugin;
        pkt.chainflag = ChainFlag::FinalHack;
        pkt.wtf = Judge::Malformed;
        pkt.choosable_scramble = Scramble::MALFORMED;

        let done = engine
            .finalize(pkt.clone(), Scramble::MALFORMED, &focus)
            .unwrap()
            .unwrap();
        assert!(!done.ip_options().is_empty());
        assert_eq!(done.ip_options().len() % 4, 0);
        assert!(done.ip_checksum_valid());
        assert_eq!(done.tcp_payload(), pkt.tcp_payload());
    }

    #[test]
    fn test_malformed_falls_back_to_tcp() {
        let mut engine = engine(Scramble::MALFORMED);
        engine.composer.set_proto_enabled(OptionProto::Ip, false);
        let focus = Arc::new(TtlFocus::new(DST));
        let mut pkt = tcp_packet(TcpFlags::ACK, 1, b"data");
        pkt.wtf = Judge::Malformed;
        pkt.choosable_scramble = Scramble::MALFORMED;

        let done = engine
            .finalize(pkt, Scramble::MALFORMED, &focus)
            .unwrap()
            .unwrap();
        assert!(done.ip_options().is_empty());
        assert!(!done.tcp_options().is_empty());
        assert!(done.tcp_checksum_valid());
    }

    #[test]
    fn test_finalize_falls_back_then_drops() {
        let mut engine = engine(Scramble::ALL);
        let focus = Arc::new(TtlFocus::new(DST));
        let mut pkt = tcp_packet(TcpFlags::ACK, 1, b"data");
        pkt.wtf = Judge::Prescription;
        pkt.choosable_scramble = Scramble::TTL | Scramble::CHECKSUM;

        let done = engine.finalize(pkt.clone(), Scramble::ALL, &focus).unwrap().unwrap();
        assert_eq!(done.wtf, Judge::Guilty);

        pkt.choosable_scramble = Scramble::TTL;
        assert!(engine.finalize(pkt, Scramble::ALL, &focus).unwrap().is_none());
    }

    /// Returns its input untouched, breaking the chain contract
    struct Untagged;

    impl hack::Hack for Untagged {
        fn name(&self) -> &'static str {
            "untagged"
        }

        fn supported_scrambles(&self) -> Scramble {
            Scramble::INNOCENT
        }

        fn init(&mut self, _: Scramble, _: Option<&str>, _: &HackEnv) -> Result<(), HackError> {
            Ok(())
        }

        fn condition(&self, _: &Packet, _: Scramble) -> bool {
            true
        }

        fn apply(&mut self, origpkt: &Packet, _: Scramble, out: &mut Vec<Packet>) -> Result<(), HackError> {
            out.push(origpkt.clone());
            Ok(())
        }
    }

    fn assert_original_only(out: &[Outbound], frame: &[u8]) {
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, frame);
        assert_eq!(out[0].wtf, None);
        assert_eq!(out[0].hint, InjectionHint::SendNow);
        assert_eq!(out[0].source, Source::Tunnel);
    }

    #[test]
    fn test_chain_violation_forwards_original_only() {
        let mut pool = HackPool::new(vec![Box::new(ValidRstFakeSeq::new()), Box::new(Untagged)]);
        assert_eq!(pool.init(Scramble::INNOCENT, &[], &HackEnv::default()), 2);
        let mut engine = HackEngine::new(pool, OptionComposer::new(), Scramble::INNOCENT);
        let map = TtlFocusMap::new();
        let frame = tcp_frame(TcpFlags::ACK | TcpFlags::PSH, 1000, b"payload");

        let out = engine.process(frame.clone(), Direction::Outgoing, &established(Scramble::ALL), &map);
        assert_original_only(&out, &frame);
    }

    #[test]
    fn test_oversized_malformed_forwards_original_only() {
        let mut engine = engine(Scramble::MALFORMED);
        let map = TtlFocusMap::new();
        let payload = vec![0x42; u16::MAX as usize - 40];
        let frame = tcp_frame(TcpFlags::ACK | TcpFlags::PSH, 1000, &payload);

        let out = engine.process(frame.clone(), Direction::Outgoing, &established(Scramble::ALL), &map);
        assert_original_only(&out, &frame);
    }

    #[test]
    fn test_from_config_disables_incompatible_plugins() {
        let mut config = Config::default();
        config.scrambles = vec!["innocent".to_string()];
        config.plugins = vec![PluginConfig {
            name: "fake data".to_string(),
            enabled: true,
            option: Some("fill=zero".to_string()),
        }];
        let engine = HackEngine::from_config(&config).unwrap();
        let status = engine.pool().status();
        assert!(status[0].enabled);
        assert!(!status[1].enabled);
        assert_eq!(engine.configured(), Scramble::INNOCENT);
    }
}
