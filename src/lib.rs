//! A user-space "simple TCP" (STCP) substrate: a socket-like library
//! providing reliable-looking connections to applications on top of an
//! unreliable datagram carrier the library itself simulates.
//!
//! This crate is the core described in `SPEC_FULL.md` §1: the
//! per-connection context, the demultiplexing of incoming connections
//! on listening endpoints, the thread/queue machinery that decouples
//! application, transport and network I/O, the unreliability emulator,
//! the TCP-format checksum, and the framed carrier. The transport-layer
//! state machine proper — SYN/SYN-ACK, sequence numbers, sliding
//! window, retransmission, FIN handling — is a pluggable collaborator
//! implemented against the [`TransportLayer`] trait and the services in
//! [`CoreServices`]; this crate only defines the contract it consumes.
//!
//! # Organization
//!
//! - [`socket`] is the externally visible façade: `open`, `bind`,
//!   `listen`, `connect`, `accept`, `close`, `read`, `write`,
//!   `getsockname`, `getpeername`.
//! - [`TransportLayer`] and [`CoreServices`] are what a transport
//!   implementation is built against.
//! - [`checksum`] and [`segment`] implement the wire format.
//! - [`error::StcpError`] is the error type every fallible operation
//!   returns.

mod carrier;
pub mod checksum;
pub mod config;
mod connection;
mod demux;
mod descriptor_table;
pub mod error;
pub mod logging;
mod queue;
mod recv_pump;
pub mod segment;
pub mod socket;
pub mod transport;
mod unreliability;

pub use config::{Descriptor, DEFAULT_EMULATOR_SEED, DEFAULT_MAX_CONNECTIONS, MAX_SEGMENT_PAYLOAD, TCP_HEADER_LEN};
pub use connection::Role;
pub use descriptor_table::init_with_capacity;
pub use error::{StcpError, StcpResult};
pub use socket::{accept, bind, close, connect, getpeername, getsockname, listen, open, read, write};
pub use transport::{CoreServices, EventFlags, TransportLayer};
