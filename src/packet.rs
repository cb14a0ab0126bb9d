//! Packet representation for the hacking pipeline
//!
//! A `Packet` owns the raw IPv4 datagram and keeps the offsets of the
//! parsed headers next to the metadata used by the hack chain. Header
//! fields are read and written through bounds-checked accessors working
//! directly on the owned buffer in network byte order.

use crate::constants::*;
use crate::scramble::{Judge, Scramble};
use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors raised while parsing or rewriting a packet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than a header requires
    #[error("Truncated packet: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    /// Not an IPv4 datagram
    #[error("Unsupported IP version: {0}")]
    UnsupportedVersion(u8),
    /// Header length field out of range
    #[error("Invalid header length: {0}")]
    InvalidHeaderLength(usize),
    /// Operation requires a parsed TCP header
    #[error("Packet carries no parsed TCP header")]
    NotTcp,
    /// Option block does not fit the remaining header room
    #[error("Option block of {len} bytes does not fit {room} bytes of header room")]
    NoOptionRoom { len: usize, room: usize },
    /// Option blocks must keep the header 32-bit aligned
    #[error("Option block of {0} bytes is not 4-byte aligned")]
    Misaligned(usize),
    /// Resized datagram would not fit the IPv4 total length field
    #[error("Datagram too large: {0} bytes")]
    TooLarge(usize),
}

/// Transport protocol carried by the datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl From<u8> for Proto {
    fn from(value: u8) -> Self {
        match value {
            IPPROTO_TCP => Proto::Tcp,
            IPPROTO_UDP => Proto::Udp,
            IPPROTO_ICMP => Proto::Icmp,
            other => Proto::Other(other),
        }
    }
}

/// Whether and how a packet already went through the hack chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFlag {
    /// Never touched by a plugin in this pass
    HackUnassigned,
    /// Synthesized, may still be picked up by a later plugin
    Rehackable,
    /// Synthesized, no further hacking allowed
    FinalHack,
}

/// Where a packet came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Captured on the local side, heading to the network
    Tunnel,
    /// Captured from the network, heading to the local host
    Network,
    /// Synthesized by a plugin
    Plugin,
}

/// Placement of a synthesized packet relative to the original
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Any,
    Anticipation,
    Posticipation,
}

/// Direction of a captured frame as seen by the network I/O layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// TCP flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        TcpFlags(bits)
    }

    pub const fn contains(self, flag: TcpFlags) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

/// Parsed copy of the IPv4 header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_len: u16,
    pub id: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
}

/// Parsed copy of the TCP header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack_seq: u32,
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
}

impl TcpHeader {
    pub const fn syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    pub const fn rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    pub const fn fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    pub const fn ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    pub const fn psh(&self) -> bool {
        self.flags.contains(TcpFlags::PSH)
    }
}

/// An IPv4 datagram with its hack metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
    ip_hdr_len: usize,
    /// Transport header length, 0 when not parsed (fragments, unknown protocols)
    l4_hdr_len: usize,
    pub proto: Proto,
    pub fragment: bool,
    pub chainflag: ChainFlag,
    pub source: Source,
    pub position: Position,
    pub wtf: Judge,
    pub choosable_scramble: Scramble,
}

impl Packet {
    /// Parse a captured IPv4 datagram
    ///
    /// Trailing bytes beyond the IPv4 total length (link-layer padding)
    /// are discarded.
    pub fn from_frame(mut buf: Vec<u8>, source: Source) -> Result<Self, PacketError> {
        if buf.len() < IPV4_MIN_HEADER_SIZE {
            return Err(PacketError::Truncated {
                need: IPV4_MIN_HEADER_SIZE,
                have: buf.len(),
            });
        }

        let version = buf[0] >> 4;
        if version != 4 {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let ip_hdr_len = ((buf[0] & 0x0F) as usize) * 4;
        if ip_hdr_len < IPV4_MIN_HEADER_SIZE {
            return Err(PacketError::InvalidHeaderLength(ip_hdr_len));
        }

        let total_len = BigEndian::read_u16(&buf[IPV4_TOTAL_LEN_OFFSET..]) as usize;
        if total_len < ip_hdr_len {
            return Err(PacketError::InvalidHeaderLength(total_len));
        }
        if buf.len() < total_len {
            return Err(PacketError::Truncated {
                need: total_len,
                have: buf.len(),
            });
        }
        buf.truncate(total_len);

        let frag = BigEndian::read_u16(&buf[IPV4_FRAG_OFFSET..]);
        let fragment = frag & IPV4_MF != 0 || frag & IPV4_FRAG_MASK != 0;
        let proto = Proto::from(buf[IPV4_PROTO_OFFSET]);

        let l4_hdr_len = if fragment {
            0
        } else {
            match proto {
                Proto::Tcp => {
                    let need = ip_hdr_len + TCP_MIN_HEADER_SIZE;
                    if buf.len() < need {
                        return Err(PacketError::Truncated { need, have: buf.len() });
                    }
                    let doff = ((buf[ip_hdr_len + TCP_DOFF_OFFSET] >> 4) as usize) * 4;
                    if doff < TCP_MIN_HEADER_SIZE {
                        return Err(PacketError::InvalidHeaderLength(doff));
                    }
                    if buf.len() < ip_hdr_len + doff {
                        return Err(PacketError::Truncated {
                            need: ip_hdr_len + doff,
                            have: buf.len(),
                        });
                    }
                    doff
                }
                Proto::Udp => {
                    let need = ip_hdr_len + UDP_HEADER_SIZE;
                    if buf.len() < need {
                        return Err(PacketError::Truncated { need, have: buf.len() });
                    }
                    UDP_HEADER_SIZE
                }
                _ => 0,
            }
        };

        Ok(Self {
            buf,
            ip_hdr_len,
            l4_hdr_len,
            proto,
            fragment,
            chainflag: ChainFlag::HackUnassigned,
            source,
            position: Position::Any,
            wtf: Judge::Innocent,
            choosable_scramble: Scramble::NONE,
        })
    }

    /// Raw datagram bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn ip(&self) -> Ipv4Header {
        let b = &self.buf;
        Ipv4Header {
            header_len: self.ip_hdr_len,
            total_len: BigEndian::read_u16(&b[IPV4_TOTAL_LEN_OFFSET..]),
            id: BigEndian::read_u16(&b[IPV4_ID_OFFSET..]),
            ttl: b[IPV4_TTL_OFFSET],
            protocol: b[IPV4_PROTO_OFFSET],
            checksum: BigEndian::read_u16(&b[IPV4_CHECKSUM_OFFSET..]),
            saddr: Ipv4Addr::from(BigEndian::read_u32(&b[IPV4_SADDR_OFFSET..])),
            daddr: Ipv4Addr::from(BigEndian::read_u32(&b[IPV4_DADDR_OFFSET..])),
        }
    }

    pub fn daddr(&self) -> Ipv4Addr {
        Ipv4Addr::from(BigEndian::read_u32(&self.buf[IPV4_DADDR_OFFSET..]))
    }

    /// Parsed TCP header, `None` for non-TCP packets and fragments
    pub fn tcp(&self) -> Option<TcpHeader> {
        if !self.has_tcp() {
            return None;
        }
        let t = &self.buf[self.ip_hdr_len..];
        Some(TcpHeader {
            sport: BigEndian::read_u16(&t[0..]),
            dport: BigEndian::read_u16(&t[2..]),
            seq: BigEndian::read_u32(&t[TCP_SEQ_OFFSET..]),
            ack_seq: BigEndian::read_u32(&t[TCP_ACK_OFFSET..]),
            header_len: self.l4_hdr_len,
            flags: TcpFlags::from_bits(t[TCP_FLAGS_OFFSET] & 0x3F),
            window: BigEndian::read_u16(&t[TCP_WINDOW_OFFSET..]),
            checksum: BigEndian::read_u16(&t[TCP_CHECKSUM_OFFSET..]),
        })
    }

    fn has_tcp(&self) -> bool {
        self.proto == Proto::Tcp && self.l4_hdr_len >= TCP_MIN_HEADER_SIZE
    }

    fn tcp_offset(&self) -> Result<usize, PacketError> {
        if self.has_tcp() {
            Ok(self.ip_hdr_len)
        } else {
            Err(PacketError::NotTcp)
        }
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.buf[IPV4_TTL_OFFSET] = ttl;
    }

    pub fn set_ip_id(&mut self, id: u16) {
        BigEndian::write_u16(&mut self.buf[IPV4_ID_OFFSET..], id);
    }

    /// Give the datagram a fresh random identification
    pub fn randomize_id(&mut self) {
        let id = rand::thread_rng().gen::<u16>();
        self.set_ip_id(id);
    }

    pub fn set_tcp_seq(&mut self, seq: u32) -> Result<(), PacketError> {
        let off = self.tcp_offset()?;
        BigEndian::write_u32(&mut self.buf[off + TCP_SEQ_OFFSET..], seq);
        Ok(())
    }

    pub fn set_tcp_ack_seq(&mut self, ack_seq: u32) -> Result<(), PacketError> {
        let off = self.tcp_offset()?;
        BigEndian::write_u32(&mut self.buf[off + TCP_ACK_OFFSET..], ack_seq);
        Ok(())
    }

    pub fn set_tcp_window(&mut self, window: u16) -> Result<(), PacketError> {
        let off = self.tcp_offset()?;
        BigEndian::write_u16(&mut self.buf[off + TCP_WINDOW_OFFSET..], window);
        Ok(())
    }

    pub fn set_tcp_flag(&mut self, flag: TcpFlags, on: bool) -> Result<(), PacketError> {
        let off = self.tcp_offset()?;
        let byte = &mut self.buf[off + TCP_FLAGS_OFFSET];
        if on {
            *byte |= flag.bits();
        } else {
            *byte &= !flag.bits();
        }
        Ok(())
    }

    pub fn ip_options(&self) -> &[u8] {
        &self.buf[IPV4_MIN_HEADER_SIZE..self.ip_hdr_len]
    }

    pub fn tcp_options(&self) -> &[u8] {
        if !self.has_tcp() {
            return &[];
        }
        let start = self.ip_hdr_len + TCP_MIN_HEADER_SIZE;
        &self.buf[start..self.ip_hdr_len + self.l4_hdr_len]
    }

    /// Free bytes in the IPv4 options area
    pub fn ip_options_room(&self) -> usize {
        IPV4_MAX_HEADER_SIZE - self.ip_hdr_len
    }

    /// Free bytes in the TCP options area, 0 without a TCP header
    pub fn tcp_options_room(&self) -> usize {
        if self.has_tcp() {
            TCP_MAX_HEADER_SIZE - self.l4_hdr_len
        } else {
            0
        }
    }

    /// Transport payload (everything after the parsed transport header)
    pub fn l4_payload(&self) -> &[u8] {
        &self.buf[self.ip_hdr_len + self.l4_hdr_len..]
    }

    pub fn tcp_payload(&self) -> &[u8] {
        if self.has_tcp() {
            self.l4_payload()
        } else {
            &[]
        }
    }

    pub fn tcp_payload_mut(&mut self) -> Result<&mut [u8], PacketError> {
        let start = self.tcp_offset()? + self.l4_hdr_len;
        Ok(&mut self.buf[start..])
    }

    /// Truncate or zero-extend the TCP payload to `len` bytes
    pub fn tcp_payload_resize(&mut self, len: usize) -> Result<(), PacketError> {
        let start = self.tcp_offset()? + self.l4_hdr_len;
        let total = start + len;
        if total > u16::MAX as usize {
            return Err(PacketError::TooLarge(total));
        }
        self.buf.resize(total, 0);
        self.write_total_len();
        Ok(())
    }

    /// Append an option block to the IPv4 header
    pub fn inject_ip_options(&mut self, opts: &[u8]) -> Result<(), PacketError> {
        if opts.len() % 4 != 0 {
            return Err(PacketError::Misaligned(opts.len()));
        }
        let room = self.ip_options_room();
        if opts.len() > room {
            return Err(PacketError::NoOptionRoom { len: opts.len(), room });
        }
        self.check_grow(opts.len())?;
        let at = self.ip_hdr_len;
        self.buf.splice(at..at, opts.iter().copied());
        self.ip_hdr_len += opts.len();
        self.buf[0] = (self.buf[0] & 0xF0) | (self.ip_hdr_len / 4) as u8;
        self.write_total_len();
        Ok(())
    }

    /// Append an option block to the TCP header
    pub fn inject_tcp_options(&mut self, opts: &[u8]) -> Result<(), PacketError> {
        let off = self.tcp_offset()?;
        if opts.len() % 4 != 0 {
            return Err(PacketError::Misaligned(opts.len()));
        }
        let room = self.tcp_options_room();
        if opts.len() > room {
            return Err(PacketError::NoOptionRoom { len: opts.len(), room });
        }
        self.check_grow(opts.len())?;
        let at = off + self.l4_hdr_len;
        self.buf.splice(at..at, opts.iter().copied());
        self.l4_hdr_len += opts.len();
        let doff = &mut self.buf[off + TCP_DOFF_OFFSET];
        *doff = (*doff & 0x0F) | (((self.l4_hdr_len / 4) as u8) << 4);
        self.write_total_len();
        Ok(())
    }

    /// The datagram must stay addressable by the 16 bit total length
    fn check_grow(&self, extra: usize) -> Result<(), PacketError> {
        let total = self.buf.len() + extra;
        if total > u16::MAX as usize {
            return Err(PacketError::TooLarge(total));
        }
        Ok(())
    }

    fn write_total_len(&mut self) {
        let len = self.buf.len() as u16;
        BigEndian::write_u16(&mut self.buf[IPV4_TOTAL_LEN_OFFSET..], len);
    }

    /// Recompute the IPv4 header checksum and, when parsed, the transport checksum
    pub fn fix_checksums(&mut self) {
        BigEndian::write_u16(&mut self.buf[IPV4_CHECKSUM_OFFSET..], 0);
        let sum = checksum_finish(checksum_add(0, &self.buf[..self.ip_hdr_len]));
        BigEndian::write_u16(&mut self.buf[IPV4_CHECKSUM_OFFSET..], sum);

        let checksum_offset = match self.proto {
            Proto::Tcp if self.has_tcp() => TCP_CHECKSUM_OFFSET,
            Proto::Udp if self.l4_hdr_len == UDP_HEADER_SIZE => UDP_CHECKSUM_OFFSET,
            _ => return,
        };
        let at = self.ip_hdr_len + checksum_offset;
        BigEndian::write_u16(&mut self.buf[at..], 0);
        let sum = self.transport_checksum();
        BigEndian::write_u16(&mut self.buf[at..], sum);
    }

    /// Break the TCP checksum so the peer discards the segment
    pub fn corrupt_tcp_checksum(&mut self) -> Result<(), PacketError> {
        let at = self.tcp_offset()? + TCP_CHECKSUM_OFFSET;
        let sum = BigEndian::read_u16(&self.buf[at..]);
        BigEndian::write_u16(&mut self.buf[at..], sum ^ 0xD34D);
        Ok(())
    }

    /// Whether the IPv4 header checksum is consistent
    pub fn ip_checksum_valid(&self) -> bool {
        checksum_finish(checksum_add(0, &self.buf[..self.ip_hdr_len])) == 0
    }

    /// Whether the TCP checksum is consistent
    pub fn tcp_checksum_valid(&self) -> bool {
        self.has_tcp() && self.transport_checksum() == 0
    }

    fn transport_checksum(&self) -> u16 {
        let segment = &self.buf[self.ip_hdr_len..];
        let mut pseudo = [0u8; 12];
        pseudo[0..8].copy_from_slice(&self.buf[IPV4_SADDR_OFFSET..IPV4_SADDR_OFFSET + 8]);
        pseudo[9] = self.buf[IPV4_PROTO_OFFSET];
        BigEndian::write_u16(&mut pseudo[10..], segment.len() as u16);
        checksum_finish(checksum_add(checksum_add(0, &pseudo), segment))
    }
}

fn checksum_add(mut sum: u32, data: &[u8]) -> u32 {
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += BigEndian::read_u16(word) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn checksum_finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Builders for handcrafted frames used across the test suites
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// IPv4/TCP segment 10.0.0.1:40000 -> 10.0.0.2:80 with the given flags and payload
    pub fn tcp_frame(flags: TcpFlags, seq: u32, payload: &[u8]) -> Vec<u8> {
        let total = IPV4_MIN_HEADER_SIZE + TCP_MIN_HEADER_SIZE + payload.len();
        let mut buf = vec![0u8; total];
        buf[0] = 0x45;
        BigEndian::write_u16(&mut buf[IPV4_TOTAL_LEN_OFFSET..], total as u16);
        BigEndian::write_u16(&mut buf[IPV4_ID_OFFSET..], 0x1234);
        buf[IPV4_TTL_OFFSET] = 64;
        buf[IPV4_PROTO_OFFSET] = IPPROTO_TCP;
        buf[IPV4_SADDR_OFFSET..IPV4_SADDR_OFFSET + 4].copy_from_slice(&[10, 0, 0, 1]);
        buf[IPV4_DADDR_OFFSET..IPV4_DADDR_OFFSET + 4].copy_from_slice(&[10, 0, 0, 2]);
        let t = IPV4_MIN_HEADER_SIZE;
        BigEndian::write_u16(&mut buf[t..], 40000);
        BigEndian::write_u16(&mut buf[t + 2..], 80);
        BigEndian::write_u32(&mut buf[t + TCP_SEQ_OFFSET..], seq);
        BigEndian::write_u32(&mut buf[t + TCP_ACK_OFFSET..], 0xA0A0_0000);
        buf[t + TCP_DOFF_OFFSET] = 0x50;
        buf[t + TCP_FLAGS_OFFSET] = flags.bits();
        BigEndian::write_u16(&mut buf[t + TCP_WINDOW_OFFSET..], 29200);
        buf[t + TCP_MIN_HEADER_SIZE..].copy_from_slice(payload);
        buf
    }

    pub fn tcp_packet(flags: TcpFlags, seq: u32, payload: &[u8]) -> Packet {
        let mut pkt = Packet::from_frame(tcp_frame(flags, seq, payload), Source::Tunnel)
            .expect("valid test frame");
        pkt.fix_checksums();
        pkt
    }
}
