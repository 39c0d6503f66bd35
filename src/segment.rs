//! Bit-exact TCP segment format (§6 "Segment format").

use crate::checksum;
use crate::config::TCP_HEADER_LEN;
use std::net::Ipv4Addr;

/// Control-bit flags, bit-exact to RFC 793 (§6).
///
/// Grounded on the teacher's `Control(u8)` tuple-struct-with-accessors
/// idiom in `tcp_parsing.rs`, but with the bit positions the spec
/// actually requires rather than the teacher's own (different)
/// internal ordering.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn fin(self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn rst(self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn psh(self) -> bool {
        self.0 & Self::PSH != 0
    }

    pub fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn urg(self) -> bool {
        self.0 & Self::URG != 0
    }

    pub fn with(mut self, bit: u8, set: bool) -> Self {
        if set {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SegmentError {
    #[error("segment shorter than the TCP header")]
    TooShort,
    #[error("unexpected TCP options (data offset != 5 words)")]
    UnexpectedOptions,
    #[error("checksum mismatch: expected {expected:04x}, computed {actual:04x}")]
    InvalidChecksum { expected: u16, actual: u16 },
}

/// A parsed TCP-format header. Options are never emitted or accepted
/// (§1 Non-goals: "options"), so `data_offset` is always 5 words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: Flags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpHeader {
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_LEN] {
        let mut out = [0u8; TCP_HEADER_LEN];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.sequence.to_be_bytes());
        out[8..12].copy_from_slice(&self.acknowledgement.to_be_bytes());
        out[12] = 5 << 4; // data offset: 5 words, no options
        out[13] = self.flags.bits();
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent.to_be_bytes());
        out
    }

    /// Parses a header from the front of `bytes` without verifying the
    /// checksum; see [`Segment::from_bytes`] for the checksummed
    /// variant used on ingress.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SegmentError> {
        if bytes.len() < TCP_HEADER_LEN {
            return Err(SegmentError::TooShort);
        }
        let data_offset = bytes[12] >> 4;
        if data_offset != 5 {
            return Err(SegmentError::UnexpectedOptions);
        }
        Ok(Self {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            sequence: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            acknowledgement: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            flags: Flags::new(bytes[13]),
            window: u16::from_be_bytes([bytes[14], bytes[15]]),
            checksum: u16::from_be_bytes([bytes[16], bytes[17]]),
            urgent: u16::from_be_bytes([bytes[18], bytes[19]]),
        })
    }
}

/// A header plus its payload, as exchanged with the carrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Virtual length used by sequence-number bookkeeping in the
    /// transport layer: SYN and FIN each consume one sequence number.
    pub fn seg_len(&self) -> usize {
        self.payload.len() + self.header.flags.syn() as usize + self.header.flags.fin() as usize
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TCP_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses and checksum-verifies a segment received from `src`
    /// addressed to `dst`.
    pub fn from_bytes(bytes: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> Result<Self, SegmentError> {
        let header = TcpHeader::from_bytes(bytes)?;
        if !checksum::verify(src, dst, bytes) {
            return Err(SegmentError::InvalidChecksum {
                expected: header.checksum,
                actual: checksum::compute(src, dst, bytes),
            });
        }
        Ok(Self {
            header,
            payload: bytes[TCP_HEADER_LEN..].to_vec(),
        })
    }
}
