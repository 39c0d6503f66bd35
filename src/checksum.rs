//! The TCP-format one's-complement checksum (§4.1).

use std::net::Ipv4Addr;

/// Accumulates a one's-complement 16-bit sum.
///
/// Grounded on the teacher's `protocols::utility::Checksum`
/// accumulator; reused verbatim here since the fold-and-complement
/// algorithm is identical for any protocol built on a TCP-style
/// pseudo-header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
struct Checksum(u16);

impl Checksum {
    fn add_u16(&mut self, value: u16) {
        let (sum, carry) = self.0.overflowing_add(value);
        self.0 = sum + carry as u16;
    }

    fn add_u8_pair(&mut self, a: u8, b: u8) {
        self.add_u16(u16::from_be_bytes([a, b]));
    }

    fn add_u32(&mut self, value: [u8; 4]) {
        self.add_u8_pair(value[0], value[1]);
        self.add_u8_pair(value[2], value[3]);
    }

    fn add_bytes(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);
        for chunk in &mut chunks {
            self.add_u8_pair(chunk[0], chunk[1]);
        }
        if let [last] = chunks.remainder() {
            self.add_u8_pair(*last, 0);
        }
    }

    fn as_u16(&self) -> u16 {
        match self.0 {
            // There are two one's-complement representations of zero;
            // keep 0xffff distinguishable from an unused checksum.
            0xffff => 0xffff,
            sum => !sum,
        }
    }
}

const TCP_PROTOCOL_NUMBER: u8 = 6;
const CHECKSUM_FIELD_OFFSET: usize = 16;

/// Computes the checksum of `segment` (header + payload, with the
/// header's checksum field still containing whatever was there before
/// — it is zeroed internally) as it would appear travelling from
/// `src` to `dst`.
///
/// Panics only via the same preconditions §4.1 documents as the
/// caller's responsibility: `segment` must be at least
/// [`crate::config::TCP_HEADER_LEN`] bytes. Debug-checked; not a typed
/// error because a caller handing in a too-short "segment" has a bug,
/// not a recoverable failure.
pub fn compute(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    debug_assert!(segment.len() >= crate::config::TCP_HEADER_LEN);

    let mut sum = Checksum::default();
    sum.add_u32(src.octets());
    sum.add_u32(dst.octets());
    sum.add_u8_pair(0, TCP_PROTOCOL_NUMBER);
    sum.add_u16(segment.len() as u16);

    sum.add_bytes(&segment[..CHECKSUM_FIELD_OFFSET]);
    sum.add_u8_pair(0, 0); // checksum field itself, zeroed
    sum.add_bytes(&segment[CHECKSUM_FIELD_OFFSET + 2..]);

    sum.as_u16()
}

/// Recomputes the checksum of `segment` as received from `src` headed
/// to `dst` and compares it against the checksum field already present
/// in the segment.
pub fn verify(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
    if segment.len() < crate::config::TCP_HEADER_LEN + 2 {
        return false;
    }
    let expected = u16::from_be_bytes([
        segment[CHECKSUM_FIELD_OFFSET],
        segment[CHECKSUM_FIELD_OFFSET + 1],
    ]);
    compute(src, dst, segment) == expected
}
