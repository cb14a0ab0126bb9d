//! Fake data segment
//!
//! Sends a segment with the same sequence number and length as a real
//! data segment but a forged payload, scrambled so the peer never accepts
//! it. An observer reassembling the stream on a first-come basis ends up
//! with the forged bytes.

use super::{Hack, HackEnv, HackError};
use crate::packet::{ChainFlag, Packet, Position, Proto, Source};
use crate::scramble::{Judge, Scramble};
use rand::seq::IteratorRandom;
use rand::Rng;

const PLUGIN_NAME: &str = "fake data";

/// Scramble classes a fake segment can be made harmless with
const FAKE_DATA_SCRAMBLES: Scramble = Scramble::from_bits(
    Scramble::TTL.bits() | Scramble::CHECKSUM.bits() | Scramble::MALFORMED.bits(),
);

#[derive(Debug, Default)]
pub struct FakeData {
    supported: Scramble,
    zero_fill: bool,
}

impl FakeData {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Hack for FakeData {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn supported_scrambles(&self) -> Scramble {
        self.supported
    }

    fn init(&mut self, configured: Scramble, option: Option<&str>, _env: &HackEnv) -> Result<(), HackError> {
        self.supported = configured & FAKE_DATA_SCRAMBLES;
        if self.supported.is_empty() {
            return Err(HackError::Config {
                plugin: PLUGIN_NAME,
                reason: format!("needs TTL, CHECKSUM or MALFORMED, configured {}", configured),
            });
        }
        self.zero_fill = match option.map(str::trim) {
            None | Some("") | Some("fill=random") => false,
            Some("fill=zero") => true,
            Some(other) => {
                return Err(HackError::Config {
                    plugin: PLUGIN_NAME,
                    reason: format!("unknown option '{}'", other),
                })
            }
        };
        Ok(())
    }

    fn condition(&self, pkt: &Packet, available: Scramble) -> bool {
        if pkt.chainflag != ChainFlag::HackUnassigned || pkt.fragment || pkt.proto != Proto::Tcp {
            return false;
        }
        if !self.supported.intersects(available) || pkt.tcp_payload().is_empty() {
            return false;
        }
        pkt.tcp()
            .is_some_and(|tcp| tcp.ack() && !tcp.syn() && !tcp.rst() && !tcp.fin())
    }

    fn apply(&mut self, origpkt: &Packet, available: Scramble, out: &mut Vec<Packet>) -> Result<(), HackError> {
        let choosable = self.supported & available;
        let mut rng = rand::thread_rng();
        let judge = choosable
            .iter()
            .choose(&mut rng)
            .and_then(Judge::from_scramble)
            .ok_or_else(|| HackError::Protocol {
                plugin: PLUGIN_NAME,
                reason: format!("no usable scramble in {}", available),
            })?;

        let mut pkt = origpkt.clone();
        pkt.randomize_id();
        let payload = pkt.tcp_payload_mut()?;
        if self.zero_fill {
            payload.fill(0);
        } else {
            rng.fill(payload);
        }

        pkt.source = Source::Plugin;
        pkt.position = Position::Anticipation;
        pkt.wtf = judge;
        pkt.choosable_scramble = choosable;
        pkt.chainflag = ChainFlag::FinalHack;

        out.push(pkt);
        Ok(())
    }
}
