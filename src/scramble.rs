//! Scramble classes and trust levels
//!
//! A scramble is a class of technique that makes a forged packet harmless
//! for the real peer while still being digested by a passive observer.
//! The set of classes usable for a packet is carried around as a bitmask.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;
use thiserror::Error;

/// Unknown scramble name in configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown scramble class: {0}")]
pub struct UnknownScramble(pub String);

/// Bitmask of scramble classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scramble(u8);

impl Scramble {
    pub const NONE: Scramble = Scramble(0);
    /// Expire the packet in flight using the destination hop estimate
    pub const TTL: Scramble = Scramble(0x01);
    /// Break the transport checksum
    pub const CHECKSUM: Scramble = Scramble(0x02);
    /// Corrupt IP/TCP option headers
    pub const MALFORMED: Scramble = Scramble(0x04);
    /// Packet accepted by the peer but semantically harmless
    pub const INNOCENT: Scramble = Scramble(0x08);
    pub const ALL: Scramble = Scramble(0x0F);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Scramble(bits & Self::ALL.0)
    }

    pub const fn contains(self, other: Scramble) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Scramble) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when INNOCENT is configured and nothing else is
    pub const fn is_innocent_only(self) -> bool {
        self.0 == Self::INNOCENT.0
    }

    /// Iterate the single-bit classes contained in this mask
    pub fn iter(self) -> impl Iterator<Item = Scramble> {
        [Self::TTL, Self::CHECKSUM, Self::MALFORMED, Self::INNOCENT]
            .into_iter()
            .filter(move |s| self.contains(*s))
    }
}

impl BitOr for Scramble {
    type Output = Scramble;

    fn bitor(self, rhs: Scramble) -> Scramble {
        Scramble(self.0 | rhs.0)
    }
}

impl BitAnd for Scramble {
    type Output = Scramble;

    fn bitand(self, rhs: Scramble) -> Scramble {
        Scramble(self.0 & rhs.0)
    }
}

impl Not for Scramble {
    type Output = Scramble;

    fn not(self) -> Scramble {
        Scramble(!self.0 & Self::ALL.0)
    }
}

impl FromStr for Scramble {
    type Err = UnknownScramble;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ttl" => Ok(Scramble::TTL),
            "checksum" => Ok(Scramble::CHECKSUM),
            "malformed" => Ok(Scramble::MALFORMED),
            "innocent" => Ok(Scramble::INNOCENT),
            _ => Err(UnknownScramble(s.to_string())),
        }
    }
}

impl fmt::Display for Scramble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .iter()
            .map(|s| match s {
                Scramble::TTL => "ttl",
                Scramble::CHECKSUM => "checksum",
                Scramble::MALFORMED => "malformed",
                _ => "innocent",
            })
            .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Trust level of a synthesized packet: how it is meant to mislead the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Judge {
    /// Reaches the peer and is accepted without effect
    Innocent,
    /// Expires in flight before the peer (TTL scramble)
    Prescription,
    /// Reaches the peer with a broken checksum
    Guilty,
    /// Carries options that the peer stack rejects
    Malformed,
}

impl Judge {
    /// The scramble class realising this trust level
    pub const fn scramble(self) -> Scramble {
        match self {
            Judge::Innocent => Scramble::INNOCENT,
            Judge::Prescription => Scramble::TTL,
            Judge::Guilty => Scramble::CHECKSUM,
            Judge::Malformed => Scramble::MALFORMED,
        }
    }

    pub fn from_scramble(s: Scramble) -> Option<Judge> {
        match s {
            Scramble::INNOCENT => Some(Judge::Innocent),
            Scramble::TTL => Some(Judge::Prescription),
            Scramble::CHECKSUM => Some(Judge::Guilty),
            Scramble::MALFORMED => Some(Judge::Malformed),
            _ => None,
        }
    }

    /// Whether the packet is meant to die before being processed by the peer
    pub const fn expects_drop(self) -> bool {
        !matches!(self, Judge::Innocent)
    }
}
