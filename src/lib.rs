//! SniffJoke packet hacking engine
//!
//! Sits between the local stack and the network and surrounds outgoing
//! TCP segments with forged packets that a passive observer digests but
//! the real peer discards or ignores.

pub mod config;
pub mod constants;
pub mod engine;
pub mod hack;
pub mod logging;
pub mod options;
pub mod packet;
pub mod scramble;
pub mod session;
pub mod ttlfocus;

pub use engine::{HackEngine, InjectionHint, Outbound};
