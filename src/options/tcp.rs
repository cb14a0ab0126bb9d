//! TCP option injectors

use super::{
    descriptor_accessors, random_bytes, CorruptionPolicy, InjectorDescriptor, OptionBuilder,
    OptionInjector, OptionProto,
};
use crate::constants::*;

/// Single byte filler
pub struct TcpNop {
    info: InjectorDescriptor,
}

impl TcpNop {
    pub fn new(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(index, "TCP NOP", OptionProto::Tcp, TCPOPT_NOP, CorruptionPolicy::Never),
        }
    }
}

impl OptionInjector for TcpNop {
    descriptor_accessors!();

    fn apply(&self, ob: &OptionBuilder) -> Vec<u8> {
        if ob.available() < TCPOPT_NOP_SIZE {
            return Vec::new();
        }
        vec![TCPOPT_NOP]
    }
}

/// RFC 2385 signature with a random digest; rejected when repeated
pub struct TcpMd5Sig {
    info: InjectorDescriptor,
}

impl TcpMd5Sig {
    pub fn new(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(
                index,
                "TCP MD5SIG",
                OptionProto::Tcp,
                TCPOPT_MD5SIG,
                CorruptionPolicy::IfRepeated,
            ),
        }
    }
}

impl OptionInjector for TcpMd5Sig {
    descriptor_accessors!();

    fn apply(&self, ob: &OptionBuilder) -> Vec<u8> {
        if ob.available() < TCPOPT_MD5SIG_SIZE {
            return Vec::new();
        }
        let mut opt = vec![TCPOPT_MD5SIG, TCPOPT_MD5SIG_SIZE as u8];
        opt.extend_from_slice(&random_bytes(TCPOPT_MD5SIG_SIZE - 2));
        opt
    }
}

/// Timestamp option dated ten minutes back
///
/// A receiver with PAWS enabled sees TSval older than the last one it
/// accepted and drops the segment without a reply.
pub struct TcpPawsCorrupt {
    info: InjectorDescriptor,
}

impl TcpPawsCorrupt {
    pub fn new(index: u8) -> Self {
        Self {
            info: InjectorDescriptor::new(
                index,
                "TCP PAWS",
                OptionProto::Tcp,
                TCPOPT_TIMESTAMP,
                CorruptionPolicy::Always,
            ),
        }
    }
}

impl OptionInjector for TcpPawsCorrupt {
    descriptor_accessors!();

    fn apply(&self, ob: &OptionBuilder) -> Vec<u8> {
        if ob.available() < TCPOPT_TIMESTAMP_SIZE {
            return Vec::new();
        }
        let tsval = ob.clock().wrapping_sub(PAWS_BACKDATE_SECS);
        let mut opt = vec![TCPOPT_TIMESTAMP, TCPOPT_TIMESTAMP_SIZE as u8];
        opt.extend_from_slice(&tsval.to_be_bytes());
        opt.extend_from_slice(&random_bytes(4));
        opt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paws_backdates_tsval() {
        let paws = TcpPawsCorrupt::new(0);
        let opt = paws.apply(&OptionBuilder::new(40, 1_000_000));
        assert_eq!(opt.len(), TCPOPT_TIMESTAMP_SIZE);
        assert_eq!(&opt[..2], &[TCPOPT_TIMESTAMP, 10]);
        assert_eq!(u32::from_be_bytes([opt[2], opt[3], opt[4], opt[5]]), 1_000_000 - 600);
        assert!(paws.apply(&OptionBuilder::new(9, 0)).is_empty());
    }

    #[test]
    fn test_paws_clock_wraps() {
        let opt = TcpPawsCorrupt::new(0).apply(&OptionBuilder::new(10, 100));
        assert_eq!(
            u32::from_be_bytes([opt[2], opt[3], opt[4], opt[5]]),
            100u32.wrapping_sub(600)
        );
    }

    #[test]
    fn test_md5sig_size() {
        let md5 = TcpMd5Sig::new(0);
        assert!(md5.apply(&OptionBuilder::new(17, 0)).is_empty());
        let opt = md5.apply(&OptionBuilder::new(18, 0));
        assert_eq!(opt.len(), 18);
        assert_eq!(&opt[..2], &[TCPOPT_MD5SIG, 18]);
    }

    #[test]
    fn test_nop() {
        assert_eq!(TcpNop::new(0).apply(&OptionBuilder::new(1, 0)), vec![TCPOPT_NOP]);
        assert!(TcpNop::new(0).apply(&OptionBuilder::new(0, 0)).is_empty());
    }
}
