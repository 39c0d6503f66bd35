//! Services exposed upward to the transport-layer state machine (§4.8),
//! plus the glue that spawns its thread and handles its terminal
//! behavior (§4.8 "Terminal transport-thread behavior").
//!
//! The transport state machine itself — SYN/SYN-ACK, sequence numbers,
//! sliding window, retransmission, FIN handling — is an external
//! collaborator (§1(b)); this module defines only the trait it
//! implements and the services it consumes.

use crate::checksum;
use crate::connection::{Connection, Role};
use crate::error::{StcpError, StcpResult};
use crate::segment::TcpHeader;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

/// Event bits for [`CoreServices::wait_for_event`] (§4.8).
///
/// Modeled the same way as [`crate::segment::Flags`]: a newtype over a
/// bitmask rather than a `bitflags` dependency the teacher doesn't
/// carry for this kind of thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFlags(u8);

impl EventFlags {
    pub const APP_DATA: u8 = 0x01;
    pub const NETWORK_DATA: u8 = 0x02;
    pub const APP_CLOSE_REQUESTED: u8 = 0x04;

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// The transport state machine's entry point. One instance is created
/// per connection (by the factory supplied to [`crate::socket::open`])
/// and run to completion on its own thread.
pub trait TransportLayer: Send {
    fn run(self: Box<Self>, services: CoreServices);
}

pub(crate) type TransportFactory =
    dyn Fn() -> Box<dyn TransportLayer> + Send + Sync;

/// The handle a [`TransportLayer`] uses to talk to the core (§4.8).
pub struct CoreServices {
    connection: Arc<Connection>,
}

impl CoreServices {
    pub(crate) fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub fn descriptor(&self) -> crate::config::Descriptor {
        self.connection.descriptor
    }

    pub fn role(&self) -> Role {
        *self.connection.role.lock().unwrap()
    }

    /// Stores an opaque, transport-owned value (§3 "transport-state:
    /// opaque value owned by the transport layer").
    pub fn set_state<T: std::any::Any + Send + Sync>(&self, value: T) {
        *self.connection.transport_state.lock().unwrap() = Some(Box::new(value));
    }

    /// Runs `f` against the stored transport-state value, if any and if
    /// it is of type `T`.
    pub fn with_state<T: std::any::Any + Send + Sync, R>(
        &self,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut state = self.connection.transport_state.lock().unwrap();
        state.as_mut()?.downcast_mut::<T>().map(f)
    }

    /// §4.8 `unblock-application`.
    pub fn unblock_application(&self, result: StcpResult<()>) {
        self.connection.unblock_application(result);
    }

    /// §4.8 `wait-for-event`. `deadline` is an absolute wall-clock time;
    /// `None` waits indefinitely. Returns the satisfied subset of
    /// `requested`, or an empty mask on timeout.
    pub fn wait_for_event(&self, requested: EventFlags, deadline: Option<SystemTime>) -> EventFlags {
        let mut state = self.connection.queues.lock().unwrap();
        loop {
            let mut satisfied = 0u8;
            if requested.contains(EventFlags::APP_DATA) && !state.app_recv.is_empty() {
                satisfied |= EventFlags::APP_DATA;
            }
            if requested.contains(EventFlags::NETWORK_DATA) && !state.network_recv.is_empty() {
                satisfied |= EventFlags::NETWORK_DATA;
            }
            if requested.contains(EventFlags::APP_CLOSE_REQUESTED)
                && state.close_requested
                && state.app_recv.is_empty()
                && !state.close_event_delivered
            {
                satisfied |= EventFlags::APP_CLOSE_REQUESTED;
            }
            if satisfied != 0 {
                if satisfied & EventFlags::APP_CLOSE_REQUESTED != 0 {
                    state.close_event_delivered = true;
                }
                return EventFlags::new(satisfied);
            }
            match deadline {
                None => state = self.connection.data_ready.wait(state).unwrap(),
                Some(deadline) => {
                    let remaining = deadline
                        .duration_since(SystemTime::now())
                        .unwrap_or(Duration::ZERO);
                    if remaining.is_zero() {
                        return EventFlags::new(0);
                    }
                    let (next, timeout) = self
                        .connection
                        .data_ready
                        .wait_timeout(state, remaining)
                        .unwrap();
                    state = next;
                    if timeout.timed_out() {
                        return EventFlags::new(0);
                    }
                }
            }
        }
    }

    /// §4.8 `network-send`: fills source/destination ports from the
    /// context, zeroes and recomputes the checksum, then hands the
    /// assembled segment to the carrier's unreliability emulator.
    pub fn network_send(&self, mut header: TcpHeader, payload_parts: &[&[u8]]) -> StcpResult<()> {
        let local = self
            .connection
            .carrier
            .local_addr()
            .ok_or(StcpError::Enotconn)?;
        let peer = self
            .connection
            .carrier
            .peer_addr()
            .ok_or(StcpError::Enotconn)?;
        header.src_port = local.port();
        header.dst_port = peer.port();
        header.checksum = 0;

        let mut bytes = header.to_bytes().to_vec();
        for part in payload_parts {
            bytes.extend_from_slice(part);
        }
        let sum = checksum::compute(*local.ip(), *peer.ip(), &bytes);
        bytes[16..18].copy_from_slice(&sum.to_be_bytes());

        self.connection
            .carrier
            .send_emulated(self.connection.reliable, &bytes)
            .map_err(StcpError::from)
    }

    /// §4.8 `network-recv`: whole-segment (non-partial) dequeue from
    /// network-recv. Blocks until one is available.
    pub fn network_recv(&self, buf: &mut [u8]) -> usize {
        let mut state = self.connection.queues.lock().unwrap();
        loop {
            if let Some(n) = state.network_recv.dequeue(buf, false) {
                if let (Some(local), Some(peer)) = (
                    self.connection.carrier.local_addr(),
                    self.connection.carrier.peer_addr(),
                ) {
                    debug_assert!(
                        checksum::verify(*peer.ip(), *local.ip(), &buf[..n]),
                        "network-recv: checksum mismatch on a segment already enqueued"
                    );
                }
                return n;
            }
            state = self.connection.data_ready.wait(state).unwrap();
        }
    }

    /// §4.8 `app-send`. An empty payload signals EOF to the application.
    pub fn app_send(&self, bytes: Vec<u8>) {
        self.connection.enqueue_app_send(bytes);
    }

    /// §4.8 `app-recv`: partial dequeue from app-recv. Blocks until at
    /// least one payload (possibly the empty EOF marker) is available.
    pub fn app_recv(&self, buf: &mut [u8]) -> usize {
        let mut state = self.connection.queues.lock().unwrap();
        loop {
            if let Some(n) = state.app_recv.dequeue(buf, true) {
                return n;
            }
            state = self.connection.data_ready.wait(state).unwrap();
        }
    }

    /// §4.8 `fin-received`.
    pub fn fin_received(&self) {
        self.connection.enqueue_app_send(Vec::new());
    }
}

/// Spawns `transport`'s thread against `connection` and installs the
/// terminal-behavior glue described in §4.8: if the transport state
/// machine returns without ever calling `unblock-application`, this
/// forces one with a synthesized error and wakes any pending reader.
pub(crate) fn spawn(connection: Arc<Connection>, transport: Box<dyn TransportLayer>) -> JoinHandle<()> {
    let role = *connection.role.lock().unwrap();
    thread::Builder::new()
        .name(format!("stcp-transport-{}", connection.descriptor))
        .spawn(move || {
            let services = CoreServices::new(connection.clone());
            transport.run(services);

            let still_blocking = connection.blocking.lock().unwrap().blocking;
            if still_blocking {
                let errno = match role {
                    Role::Active => StcpError::Econnrefused,
                    Role::Passive | Role::Child => StcpError::Econnaborted,
                };
                tracing::error!(
                    descriptor = %connection.descriptor,
                    ?errno,
                    "transport thread returned without completing the handshake"
                );
                connection.unblock_application(Err(errno));
            }
            connection.enqueue_app_send(Vec::new());
        })
        .expect("failed to spawn transport thread")
}
