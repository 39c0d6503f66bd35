//! Process-wide constants and the connection descriptor type.

use std::fmt;

/// Default size of the descriptor table if the caller never calls
/// [`crate::init_with_capacity`]. Must stay a power of two (§3,
/// §6: "process maximum, power-of-two, default 64").
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Length of a bit-exact TCP header, per §6.
pub const TCP_HEADER_LEN: usize = 20;

/// Maximum segment payload beyond the header, per §6.
pub const MAX_SEGMENT_PAYLOAD: usize = 536;

/// Fixed default seed for the unreliability emulator's per-connection
/// PRNG, matching the reference implementation's `0x632a` so that
/// unseeded test runs stay reproducible (§4.3, SPEC_FULL.md §B.4).
pub const DEFAULT_EMULATOR_SEED: u64 = 0x632a;

/// Opaque small integer identifying a live connection. Stable for the
/// lifetime of the connection (§3: "Connection descriptor").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor(u32);

impl Descriptor {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
