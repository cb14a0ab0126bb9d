//! Valid RST with a fake sequence number
//!
//! Clones an acknowledgement, empties it and moves its sequence number far
//! outside the receive window. The peer discards a segment that lands out
//! of window, while an observer that does not track the window follows the
//! forged sequence and loses the real stream. The forged packet is
//! INNOCENT: it reaches the peer and is silently discarded there.

use super::{Hack, HackEnv, HackError};
use crate::constants::{SEQ_FORGE_BASE, SEQ_FORGE_SPREAD};
use crate::packet::{ChainFlag, Packet, Position, Proto, Source, TcpFlags};
use crate::scramble::{Judge, Scramble};
use rand::Rng;

const PLUGIN_NAME: &str = "valid RST / fake SEQ";

/// Sequence number jumped far beyond any plausible window, modulo 2^32
pub fn forge_seq(seq: u32, spread: u32) -> u32 {
    seq.wrapping_add(SEQ_FORGE_BASE).wrapping_add(spread)
}

#[derive(Debug, Default)]
pub struct ValidRstFakeSeq {
    supported: Scramble,
}

impl ValidRstFakeSeq {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Hack for ValidRstFakeSeq {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn supported_scrambles(&self) -> Scramble {
        self.supported
    }

    fn init(&mut self, configured: Scramble, _option: Option<&str>, _env: &HackEnv) -> Result<(), HackError> {
        if !configured.is_innocent_only() {
            return Err(HackError::Config {
                plugin: PLUGIN_NAME,
                reason: format!("supports only INNOCENT scramble type, configured {}", configured),
            });
        }
        self.supported = Scramble::INNOCENT;
        Ok(())
    }

    fn condition(&self, pkt: &Packet, _available: Scramble) -> bool {
        if pkt.chainflag != ChainFlag::HackUnassigned {
            return false;
        }
        if pkt.fragment || pkt.proto != Proto::Tcp {
            return false;
        }
        pkt.tcp()
            .is_some_and(|tcp| !tcp.syn() && !tcp.rst() && !tcp.fin() && tcp.ack())
    }

    fn apply(&mut self, origpkt: &Packet, _available: Scramble, out: &mut Vec<Packet>) -> Result<(), HackError> {
        let tcp = origpkt.tcp().ok_or_else(|| HackError::Protocol {
            plugin: PLUGIN_NAME,
            reason: "applied to a packet without TCP header".to_string(),
        })?;

        let mut pkt = origpkt.clone();
        pkt.randomize_id();

        let seq = forge_seq(tcp.seq, rand::thread_rng().gen_range(0..SEQ_FORGE_SPREAD));
        pkt.set_tcp_seq(seq)?;
        pkt.set_tcp_window(u16::MAX)?;
        pkt.set_tcp_ack_seq(seq.wrapping_add(1))?;
        pkt.set_tcp_flag(TcpFlags::PSH, false)?;
        pkt.tcp_payload_resize(0)?;

        pkt.source = Source::Plugin;
        pkt.position = Position::Any;
        pkt.wtf = Judge::Innocent;
        pkt.choosable_scramble = Scramble::INNOCENT;
        pkt.chainflag = ChainFlag::FinalHack;

        out.push(pkt);
        Ok(())
    }
}
