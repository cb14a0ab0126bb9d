//! Hack plugins and the pool dispatching them
//!
//! A hack looks at a packet and its chain state, decides whether it
//! applies, and synthesizes new packets from a clone of it. The pool runs
//! the registered hacks in a fixed order, one pass per captured packet:
//! each hack is offered the original and any packet an earlier hack left
//! re-hackable, never the packets it generated itself.

pub mod fake_data;
pub mod valid_rst_fake_seq;

pub use fake_data::FakeData;
pub use valid_rst_fake_seq::ValidRstFakeSeq;

use crate::config::PluginConfig;
use crate::options::OptionError;
use crate::packet::{ChainFlag, Packet, PacketError, Source};
use crate::scramble::Scramble;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by hack plugins
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HackError {
    /// The run configuration is incompatible with the plugin
    #[error("{plugin}: {reason}")]
    Config { plugin: &'static str, reason: String },
    /// A plugin broke a chain invariant
    #[error("{plugin} violated the hack chain: {reason}")]
    Protocol { plugin: &'static str, reason: String },
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Option(#[from] OptionError),
}

/// Run-wide parameters handed to plugins at load time
#[derive(Debug, Clone, Default)]
pub struct HackEnv {
    /// Name of the network location profile in use
    pub location: String,
}

/// A packet-hacking strategy
pub trait Hack: Send {
    fn name(&self) -> &'static str;

    /// Scramble classes this plugin can produce, valid after `init`
    fn supported_scrambles(&self) -> Scramble;

    /// Validate the run configuration; an error disables the plugin
    fn init(
        &mut self,
        configured: Scramble,
        option: Option<&str>,
        env: &HackEnv,
    ) -> Result<(), HackError>;

    /// Whether the plugin applies to `pkt`; never mutates anything
    fn condition(&self, pkt: &Packet, available: Scramble) -> bool;

    /// Append the packets synthesized from `origpkt` to `out`
    fn apply(
        &mut self,
        origpkt: &Packet,
        available: Scramble,
        out: &mut Vec<Packet>,
    ) -> Result<(), HackError>;
}

/// Every plugin shipped with the engine, in dispatch order
pub fn registry() -> Vec<Box<dyn Hack>> {
    vec![Box::new(ValidRstFakeSeq::new()), Box::new(FakeData::new())]
}

struct HackEntry {
    hack: Box<dyn Hack>,
    enabled: bool,
    applications: u64,
}

/// Load state of a plugin, for status reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HackStatus {
    pub name: &'static str,
    pub enabled: bool,
    pub supported: Scramble,
    pub applications: u64,
}

/// Ordered set of plugins
pub struct HackPool {
    entries: Vec<HackEntry>,
}

impl HackPool {
    /// Pool over `hacks`; nothing is enabled before `init`
    pub fn new(hacks: Vec<Box<dyn Hack>>) -> Self {
        let entries = hacks
            .into_iter()
            .map(|hack| HackEntry {
                hack,
                enabled: false,
                applications: 0,
            })
            .collect();
        Self { entries }
    }

    /// Initialise every plugin against the run configuration
    ///
    /// Plugins missing from `settings` are loaded with no option. Returns
    /// the number of plugins enabled.
    pub fn init(&mut self, configured: Scramble, settings: &[PluginConfig], env: &HackEnv) -> usize {
        for entry in self.entries.iter_mut() {
            let name = entry.hack.name();
            let setting = settings.iter().find(|s| s.name.eq_ignore_ascii_case(name));
            if setting.is_some_and(|s| !s.enabled) {
                info!("Plugin '{}' disabled by configuration", name);
                entry.enabled = false;
                continue;
            }
            let option = setting.and_then(|s| s.option.as_deref());
            match entry.hack.init(configured, option, env) {
                Ok(()) => {
                    info!(
                        "Plugin '{}' loaded for location '{}' (supports {})",
                        name,
                        env.location,
                        entry.hack.supported_scrambles()
                    );
                    entry.enabled = true;
                }
                Err(e) => {
                    warn!("Plugin '{}' disabled: {}", name, e);
                    entry.enabled = false;
                }
            }
        }
        self.enabled_count()
    }

    pub fn enabled_count(&self) -> usize {
        self.entries.iter().filter(|e| e.enabled).count()
    }

    pub fn status(&self) -> Vec<HackStatus> {
        self.entries
            .iter()
            .map(|e| HackStatus {
                name: e.hack.name(),
                enabled: e.enabled,
                supported: e.hack.supported_scrambles(),
                applications: e.applications,
            })
            .collect()
    }

    /// Run one hack pass over `origpkt`, returning the synthesized packets
    ///
    /// Any plugin error aborts the pass; the caller then forwards the
    /// original alone.
    pub fn dispatch(&mut self, origpkt: &Packet, available: Scramble) -> Result<Vec<Packet>, HackError> {
        let mut generated: Vec<Packet> = Vec::new();

        for entry in self.entries.iter_mut().filter(|e| e.enabled) {
            let name = entry.hack.name();
            let mut produced = Vec::new();

            let candidates = std::iter::once(origpkt).chain(
                generated
                    .iter()
                    .filter(|p| p.chainflag == ChainFlag::Rehackable),
            );
            for candidate in candidates {
                if !entry.hack.condition(candidate, available) {
                    continue;
                }
                let before = produced.len();
                entry.hack.apply(candidate, available, &mut produced)?;
                for pkt in &produced[before..] {
                    Self::check_synthesized(name, pkt)?;
                }
            }

            if !produced.is_empty() {
                entry.applications += 1;
                debug!(plugin = name, generated = produced.len(), "hack applied");
            }
            generated.extend(produced);
        }

        Ok(generated)
    }

    fn check_synthesized(plugin: &'static str, pkt: &Packet) -> Result<(), HackError> {
        if pkt.chainflag == ChainFlag::HackUnassigned {
            return Err(HackError::Protocol {
                plugin,
                reason: "synthesized packet left unassigned".to_string(),
            });
        }
        if pkt.source != Source::Plugin {
            return Err(HackError::Protocol {
                plugin,
                reason: format!("synthesized packet tagged as {:?}", pkt.source),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::testutil::tcp_packet;
    use crate::packet::TcpFlags;
    use crate::scramble::Judge;

    /// Emits a re-hackable clone of unassigned packets
    struct Seeder;

    impl Hack for Seeder {
        fn name(&self) -> &'static str {
            "seeder"
        }

        fn supported_scrambles(&self) -> Scramble {
            Scramble::INNOCENT
        }

        fn init(&mut self, _: Scramble, _: Option<&str>, _: &HackEnv) -> Result<(), HackError> {
            Ok(())
        }

        fn condition(&self, pkt: &Packet, _: Scramble) -> bool {
            pkt.chainflag == ChainFlag::HackUnassigned
        }

        fn apply(&mut self, origpkt: &Packet, _: Scramble, out: &mut Vec<Packet>) -> Result<(), HackError> {
            let mut pkt = origpkt.clone();
            pkt.source = Source::Plugin;
            pkt.chainflag = ChainFlag::Rehackable;
            out.push(pkt);
            Ok(())
        }
    }

    /// Finalises re-hackable packets only
    struct Finisher;

    impl Hack for Finisher {
        fn name(&self) -> &'static str {
            "finisher"
        }

        fn supported_scrambles(&self) -> Scramble {
            Scramble::INNOCENT
        }

        fn init(&mut self, _: Scramble, _: Option<&str>, _: &HackEnv) -> Result<(), HackError> {
            Ok(())
        }

        fn condition(&self, pkt: &Packet, _: Scramble) -> bool {
            pkt.chainflag == ChainFlag::Rehackable
        }

        fn apply(&mut self, origpkt: &Packet, _: Scramble, out: &mut Vec<Packet>) -> Result<(), HackError> {
            let mut pkt = origpkt.clone();
            pkt.chainflag = ChainFlag::FinalHack;
            pkt.wtf = Judge::Innocent;
            out.push(pkt);
            Ok(())
        }
    }

    /// Forgets to tag its output
    struct Sloppy;

    impl Hack for Sloppy {
        fn name(&self) -> &'static str {
            "sloppy"
        }

        fn supported_scrambles(&self) -> Scramble {
            Scramble::INNOCENT
        }

        fn init(&mut self, configured: Scramble, _: Option<&str>, _: &HackEnv) -> Result<(), HackError> {
            if configured.contains(Scramble::TTL) {
                return Err(HackError::Config {
                    plugin: "sloppy",
                    reason: "TTL not supported".to_string(),
                });
            }
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

    fn env() -> HackEnv {
        HackEnv {
            location: "test".to_string(),
        }
    }

    #[test]
    fn test_chain_is_one_shot() {
        let mut pool = HackPool::new(vec![Box::new(Seeder), Box::new(Finisher), Box::new(Seeder)]);
        assert_eq!(pool.init(Scramble::INNOCENT, &[], &env()), 3);
        let pkt = tcp_packet(TcpFlags::ACK, 1, b"x");
        let out = pool.dispatch(&pkt, Scramble::INNOCENT).unwrap();
        // seeder -> 1 rehackable, finisher -> 1 final from it, second seeder -> 1 from original
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].chainflag, ChainFlag::Rehackable);
        assert_eq!(out[1].chainflag, ChainFlag::FinalHack);
        assert_eq!(out[2].chainflag, ChainFlag::Rehackable);
        assert_eq!(pkt.chainflag, ChainFlag::HackUnassigned);
    }

    #[test]
    fn test_init_failure_disables_only_that_plugin() {
        let mut pool = HackPool::new(vec![Box::new(Sloppy), Box::new(Seeder)]);
        assert_eq!(pool.init(Scramble::ALL, &[], &env()), 1);
        let status = pool.status();
        assert!(!status[0].enabled);
        assert!(status[1].enabled);
    }

    #[test]
    fn test_configuration_can_disable_plugin() {
        let mut pool = HackPool::new(vec![Box::new(Seeder)]);
        let settings = vec![PluginConfig {
            name: "SEEDER".to_string(),
            enabled: false,
            option: None,
        }];
        assert_eq!(pool.init(Scramble::ALL, &settings, &env()), 0);
        let pkt = tcp_packet(TcpFlags::ACK, 1, b"");
        assert!(pool.dispatch(&pkt, Scramble::ALL).unwrap().is_empty());
    }

    #[test]
    fn test_untagged_output_is_fatal_for_packet() {
        let mut pool = HackPool::new(vec![Box::new(Seeder), Box::new(Sloppy)]);
        pool.init(Scramble::INNOCENT, &[], &env());
        let pkt = tcp_packet(TcpFlags::ACK, 1, b"");
        let err = pool.dispatch(&pkt, Scramble::INNOCENT).unwrap_err();
        assert!(matches!(err, HackError::Protocol { plugin: "sloppy", .. }));
    }

    #[test]
    fn test_applications_counted() {
        let mut pool = HackPool::new(vec![Box::new(Seeder)]);
        pool.init(Scramble::INNOCENT, &[], &env());
        let pkt = tcp_packet(TcpFlags::ACK, 1, b"");
        pool.dispatch(&pkt, Scramble::INNOCENT).unwrap();
        pool.dispatch(&pkt, Scramble::INNOCENT).unwrap();
        assert_eq!(pool.status()[0].applications, 2);
    }

    #[test]
    fn test_registry_order() {
        let names: Vec<&str> = registry().iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["valid RST / fake SEQ", "fake data"]);
    }
}
