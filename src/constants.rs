//! Global constants for IPv4/TCP framing and header options

// ============================================================================
// IPV4 HEADER
// ============================================================================

/// Minimum IPv4 header size (IHL = 5)
pub const IPV4_MIN_HEADER_SIZE: usize = 20;

/// Maximum IPv4 header size (IHL = 15)
pub const IPV4_MAX_HEADER_SIZE: usize = 60;

pub const IPV4_TOTAL_LEN_OFFSET: usize = 2;
pub const IPV4_ID_OFFSET: usize = 4;
pub const IPV4_FRAG_OFFSET: usize = 6;
pub const IPV4_TTL_OFFSET: usize = 8;
pub const IPV4_PROTO_OFFSET: usize = 9;
pub const IPV4_CHECKSUM_OFFSET: usize = 10;
pub const IPV4_SADDR_OFFSET: usize = 12;
pub const IPV4_DADDR_OFFSET: usize = 16;

/// More-fragments flag and fragment offset mask
pub const IPV4_MF: u16 = 0x2000;
pub const IPV4_FRAG_MASK: u16 = 0x1FFF;

/// IP protocol numbers
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

// ============================================================================
// TCP HEADER
// ============================================================================

/// Minimum TCP header size (data offset = 5)
pub const TCP_MIN_HEADER_SIZE: usize = 20;

/// Maximum TCP header size (data offset = 15)
pub const TCP_MAX_HEADER_SIZE: usize = 60;

pub const TCP_SEQ_OFFSET: usize = 4;
pub const TCP_ACK_OFFSET: usize = 8;
pub const TCP_DOFF_OFFSET: usize = 12;
pub const TCP_FLAGS_OFFSET: usize = 13;
pub const TCP_WINDOW_OFFSET: usize = 14;
pub const TCP_CHECKSUM_OFFSET: usize = 16;

/// UDP header size
pub const UDP_HEADER_SIZE: usize = 8;
pub const UDP_CHECKSUM_OFFSET: usize = 6;

// ============================================================================
// IP OPTIONS
// ============================================================================

pub const IPOPT_NOOP: u8 = 1;
pub const IPOPT_RR: u8 = 7;
pub const IPOPT_TIMESTAMP: u8 = 68;
pub const IPOPT_SEC: u8 = 130;
pub const IPOPT_LSRR: u8 = 131;
pub const IPOPT_CIPSO: u8 = 134;
pub const IPOPT_SID: u8 = 136;
pub const IPOPT_SSRR: u8 = 137;
pub const IPOPT_RA: u8 = 148;

/// Timestamp option flag: timestamps only
pub const IPOPT_TS_TSONLY: u8 = 0;

pub const IPOPT_NOOP_SIZE: usize = 1;
pub const IPOPT_RA_SIZE: usize = 4;
pub const IPOPT_CIPSO_SIZE: usize = 10;
pub const IPOPT_SEC_SIZE: usize = 11;
pub const IPOPT_SID_SIZE: usize = 4;

// ============================================================================
// TCP OPTIONS
// ============================================================================

pub const TCPOPT_NOP: u8 = 1;
pub const TCPOPT_TIMESTAMP: u8 = 8;
pub const TCPOPT_MD5SIG: u8 = 19;

pub const TCPOPT_NOP_SIZE: usize = 1;
pub const TCPOPT_TIMESTAMP_SIZE: usize = 10;
pub const TCPOPT_MD5SIG_SIZE: usize = 18;

/// Seconds subtracted from the reference clock by the PAWS corruption
pub const PAWS_BACKDATE_SECS: u32 = 600;

// ============================================================================
// SEQUENCE FORGING
// ============================================================================

/// Fixed jump applied to a forged sequence number
pub const SEQ_FORGE_BASE: u32 = 65535;

/// Exclusive bound of the random part of a forged sequence jump
pub const SEQ_FORGE_SPREAD: u32 = 12345;

// ============================================================================
// END OF CONSTANTS
// ============================================================================
