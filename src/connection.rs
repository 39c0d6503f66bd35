//! Per-connection context: queues, condvars, carrier, flags (§3, §4.4,
//! §5).

use crate::carrier::Carrier;
use crate::config::Descriptor;
use crate::error::StcpError;
use crate::queue::ByteQueue;
use crate::transport::TransportFactory;

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// §3 "role: active (initiator) / passive (listener) / child-of-passive".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Passive,
    Child,
}

#[derive(Default)]
pub(crate) struct BlockingState {
    pub blocking: bool,
    pub errno: Option<StcpError>,
}

#[derive(Default)]
pub(crate) struct QueueState {
    pub app_recv: ByteQueue,
    pub app_send: ByteQueue,
    pub network_recv: ByteQueue,
    pub close_requested: bool,
    pub eof: bool,
    /// Consumed by `wait-for-event`'s `APP_CLOSE_REQUESTED` bit: "the
    /// close bit fires once per close; subsequent waits don't see it"
    /// (§4.8).
    pub close_event_delivered: bool,
}

#[derive(Default)]
pub(crate) struct ConnectionThreads {
    pub transport: Option<JoinHandle<()>>,
    pub recv_pump: Option<JoinHandle<()>>,
}

pub(crate) struct Connection {
    pub descriptor: Descriptor,
    pub role: Mutex<Role>,
    pub reliable: bool,
    pub listening: Mutex<bool>,
    pub parent: Mutex<Option<Descriptor>>,
    pub transport_state: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    pub blocking: Mutex<BlockingState>,
    pub blocking_cond: Condvar,
    pub queues: Mutex<QueueState>,
    pub data_ready: Condvar,
    pub carrier: Carrier,
    /// Produces this connection's `TransportLayer` instance; children
    /// created by the demultiplexer inherit their listener's factory
    /// (§4.6: "inheriting `reliable`" — and, by the same logic, the
    /// transport implementation to run).
    pub transport_factory: Arc<TransportFactory>,
    pub threads: Mutex<ConnectionThreads>,
}

impl Connection {
    pub fn new(
        descriptor: Descriptor,
        reliable: bool,
        role: Role,
        carrier: Carrier,
        transport_factory: Arc<TransportFactory>,
    ) -> Self {
        Self {
            descriptor,
            role: Mutex::new(role),
            reliable,
            listening: Mutex::new(false),
            parent: Mutex::new(None),
            transport_state: Mutex::new(None),
            blocking: Mutex::new(BlockingState {
                blocking: false,
                errno: None,
            }),
            blocking_cond: Condvar::new(),
            queues: Mutex::new(QueueState::default()),
            data_ready: Condvar::new(),
            carrier,
            transport_factory,
            threads: Mutex::new(ConnectionThreads::default()),
        }
    }

    /// Arms the blocking flag. Must be called before the transport
    /// thread that will eventually call `unblock_application` is
    /// spawned: otherwise a transport that fails synchronously (or
    /// whose terminal glue runs before the caller ever parks) would
    /// clear a flag that isn't set yet, and the later
    /// `park_until_unblocked` would then set it true with no one left
    /// to clear it (§3: the blocking-flag transitions true→false
    /// exactly once, by an unblock-application call).
    pub fn arm_blocking(&self) {
        self.blocking.lock().unwrap().blocking = true;
    }

    /// Parks the caller until [`Connection::unblock_application`] is
    /// called (§4.7 connect: "block until unblock-application fires").
    /// The caller must have already called [`Connection::arm_blocking`].
    pub fn park_until_unblocked(&self) -> Option<StcpError> {
        let mut state = self.blocking.lock().unwrap();
        while state.blocking {
            state = self.blocking_cond.wait(state).unwrap();
        }
        state.errno.clone()
    }

    /// §4.8 `unblock-application`: "called exactly once per connection
    /// when handshake completes or fails."
    pub fn unblock_application(self: &Arc<Self>, result: Result<(), StcpError>) {
        {
            let mut state = self.blocking.lock().unwrap();
            state.blocking = false;
            state.errno = result.clone().err();
        }
        self.blocking_cond.notify_all();

        let is_child = *self.parent.lock().unwrap();
        if let Some(parent) = is_child {
            crate::demux::on_handshake_complete(parent, self.clone());
        }
    }

    pub fn enqueue_app_send(&self, payload: Vec<u8>) {
        let mut state = self.queues.lock().unwrap();
        state.app_send.enqueue(payload);
        self.data_ready.notify_all();
    }

    pub fn enqueue_network_recv(&self, payload: Vec<u8>) {
        let mut state = self.queues.lock().unwrap();
        state.network_recv.enqueue(payload);
        self.data_ready.notify_all();
    }

    pub fn enqueue_app_recv(&self, payload: Vec<u8>) {
        let mut state = self.queues.lock().unwrap();
        state.app_recv.enqueue(payload);
        self.data_ready.notify_all();
    }

    pub fn request_close(&self) {
        let mut state = self.queues.lock().unwrap();
        state.close_requested = true;
        self.data_ready.notify_all();
    }
}
