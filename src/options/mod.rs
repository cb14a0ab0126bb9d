//! IP/TCP option injection
//!
//! Every injector encodes one ambiguity between what the RFCs say about an
//! option and what real stacks do with it. Injectors never touch the
//! option header themselves: they look at an `OptionBuilder`, return the
//! bytes of one well-formed option (or nothing), and the builder commits
//! them after checking the remaining budget.

pub mod composer;
pub mod ip;
pub mod tcp;

pub use composer::{default_injectors, Composition, CompositionIntent, OptionComposer};

use crate::ttlfocus::TtlFocus;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Errors raised while composing an option header
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    /// An injector produced more bytes than the budget had left
    #[error("{injector} wrote {size} bytes with only {available} available")]
    BudgetOverrun {
        injector: &'static str,
        size: usize,
        available: usize,
    },
    /// An injector produced an option whose code or length byte is wrong
    #[error("{injector} produced a malformed {size} byte option")]
    Malformed { injector: &'static str, size: usize },
}

/// Header an injector targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionProto {
    Ip,
    Tcp,
}

impl fmt::Display for OptionProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionProto::Ip => write!(f, "IP"),
            OptionProto::Tcp => write!(f, "TCP"),
        }
    }
}

/// Known effect of an option on the receiving stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionPolicy {
    /// A single occurrence makes the packet rejected
    Always,
    /// Rejected only when the option appears twice
    IfRepeated,
    /// Harmless everywhere
    Never,
    /// Effect not established; informational only, never relied upon
    Uncertain,
}

impl CorruptionPolicy {
    /// Usable when the composition must keep the packet valid
    pub const fn clean(self) -> bool {
        matches!(self, CorruptionPolicy::Never)
    }
}

/// Static description of an injector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectorDescriptor {
    pub enabled: bool,
    pub index: u8,
    pub name: &'static str,
    pub proto: OptionProto,
    pub opcode: u8,
    pub corruption: CorruptionPolicy,
}

impl InjectorDescriptor {
    pub const fn new(
        index: u8,
        name: &'static str,
        proto: OptionProto,
        opcode: u8,
        corruption: CorruptionPolicy,
    ) -> Self {
        Self {
            enabled: true,
            index,
            name,
            proto,
            opcode,
            corruption,
        }
    }
}

/// One option encoding
pub trait OptionInjector: Send {
    fn descriptor(&self) -> &InjectorDescriptor;

    fn descriptor_mut(&mut self) -> &mut InjectorDescriptor;

    /// Bytes of one option fitting `ob.available()`, empty when the
    /// precondition is unmet or there is not enough room
    fn apply(&self, ob: &OptionBuilder) -> Vec<u8>;

    /// Bind the destination record a TTL-dependent injector reads
    fn setup_ttlfocus(&mut self, _focus: Arc<TtlFocus>) {}
}

/// Implements the descriptor accessors for an injector holding an `info` field
macro_rules! descriptor_accessors {
    () => {
        fn descriptor(&self) -> &$crate::options::InjectorDescriptor {
            &self.info
        }

        fn descriptor_mut(&mut self) -> &mut $crate::options::InjectorDescriptor {
            &mut self.info
        }
    };
}
pub(crate) use descriptor_accessors;

/// Largest option size `fixed_len + n * block_size` with `n` in
/// `[min_blocks, max_blocks]` that fits `available`, or 0
pub fn best_rand_size(
    available: usize,
    fixed_len: usize,
    min_blocks: usize,
    max_blocks: usize,
    block_size: usize,
) -> usize {
    if min_blocks > max_blocks {
        return 0;
    }
    let smallest = fixed_len + min_blocks * block_size;
    if available < smallest {
        return 0;
    }
    if block_size == 0 {
        return fixed_len;
    }
    let blocks = ((available - fixed_len) / block_size).min(max_blocks);
    fixed_len + blocks * block_size
}

/// Bounded writer for one option header
///
/// `written() + available()` always equals the capacity it was created with.
#[derive(Debug, Clone)]
pub struct OptionBuilder {
    opts: Vec<u8>,
    capacity: usize,
    clock: u32,
}

impl OptionBuilder {
    /// Builder with `capacity` bytes of room; `clock` is the reference
    /// time (seconds) for time-based options
    pub fn new(capacity: usize, clock: u32) -> Self {
        Self {
            opts: Vec::with_capacity(capacity),
            capacity,
            clock,
        }
    }

    pub fn written(&self) -> usize {
        self.opts.len()
    }

    pub fn available(&self) -> usize {
        self.capacity - self.opts.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clock(&self) -> u32 {
        self.clock
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.opts
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.opts
    }

    /// Random option size between the minimum and the best fitting size
    pub fn rand_size(
        &self,
        fixed_len: usize,
        min_blocks: usize,
        max_blocks: usize,
        block_size: usize,
    ) -> usize {
        let best = best_rand_size(self.available(), fixed_len, min_blocks, max_blocks, block_size);
        if best == 0 || block_size == 0 {
            return best;
        }
        let top = (best - fixed_len) / block_size;
        let blocks = rand::thread_rng().gen_range(min_blocks..=top);
        fixed_len + blocks * block_size
    }

    /// Append the bytes produced by `injector`, returning how many were written
    pub fn commit(&mut self, injector: &'static str, bytes: &[u8]) -> Result<usize, OptionError> {
        let available = self.available();
        if bytes.len() > available {
            return Err(OptionError::BudgetOverrun {
                injector,
                size: bytes.len(),
                available,
            });
        }
        let index = self.opts.len();
        self.opts.extend_from_slice(bytes);
        trace!(
            target: "sniffjoke::packet",
            injector,
            index,
            size = bytes.len(),
            available,
            "option injected"
        );
        Ok(bytes.len())
    }
}

/// Fill `len` bytes with random data
pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(bytes.as_mut_slice());
    bytes
}
