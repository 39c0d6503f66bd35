//! The externally visible socket-like operations (§4.7).

use crate::carrier::Carrier;
use crate::config::{Descriptor, DEFAULT_EMULATOR_SEED};
use crate::connection::{Connection, Role};
use crate::demux;
use crate::descriptor_table::table;
use crate::error::{StcpError, StcpResult};
use crate::recv_pump;
use crate::transport::{self, TransportLayer};

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

fn as_v4(addr: SocketAddr) -> StcpResult<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(_) => Err(StcpError::Eaddrnotavail),
    }
}

/// §4.7 `open(reliable?) → descriptor`.
///
/// `factory` produces this connection's [`TransportLayer`]; a child
/// created later by the demultiplexer (on an incoming SYN to a
/// listening descriptor opened here) reuses the same factory (§4.6
/// "inheriting `reliable`"). This is the Rust rendering of "the
/// transport layer is a pluggable collaborator" (§1): the original's
/// single process-wide implementation becomes an explicit trait object
/// supplied by the caller instead of a compile-time link-time choice.
pub fn open<F>(reliable: bool, factory: F) -> StcpResult<Descriptor>
where
    F: Fn() -> Box<dyn TransportLayer> + Send + Sync + 'static,
{
    let carrier = Carrier::new_open(DEFAULT_EMULATOR_SEED).map_err(StcpError::from)?;
    let factory: Arc<transport::TransportFactory> = Arc::new(factory);
    let connection = table().allocate(|descriptor| {
        Ok(Connection::new(
            descriptor,
            reliable,
            Role::Active,
            carrier,
            factory,
        ))
    })?;
    tracing::info!(descriptor = %connection.descriptor, reliable, "opened");
    Ok(connection.descriptor)
}

/// §4.7 `bind(descriptor, local)`.
pub fn bind(descriptor: Descriptor, local: SocketAddr) -> StcpResult<()> {
    let connection = table().get(descriptor)?;
    let local = as_v4(local)?;
    connection.carrier.bind(local)?;
    tracing::info!(%descriptor, %local, "bound");
    Ok(())
}

/// §4.7 `listen(backlog)`.
pub fn listen(descriptor: Descriptor, backlog: usize) -> StcpResult<()> {
    let connection = table().get(descriptor)?;
    if connection.carrier.peer_addr().is_some() {
        return Err(StcpError::Eisconn);
    }
    if connection.carrier.local_addr().is_none() {
        return Err(StcpError::Einval);
    }
    let already_listening = {
        let mut listening = connection.listening.lock().unwrap();
        let was = *listening;
        *listening = true;
        was
    };

    demux::create_or_grow_backlog(descriptor, backlog);

    if already_listening {
        return Ok(());
    }

    connection.carrier.listen(backlog as i32 + 1)?;
    let pump = recv_pump::spawn(connection.clone());
    connection.threads.lock().unwrap().recv_pump = Some(pump);
    tracing::info!(%descriptor, backlog, "listening");
    Ok(())
}

/// §4.7 `connect(peer)`: records the peer, obtains an ephemeral local
/// port if unbound (SPEC_FULL.md §B.1), starts the transport thread in
/// the active role, and blocks until `unblock-application` fires.
pub fn connect(descriptor: Descriptor, peer: SocketAddr) -> StcpResult<()> {
    let connection = table().get(descriptor)?;
    if *connection.listening.lock().unwrap() {
        return Err(StcpError::Einval);
    }
    if connection.carrier.peer_addr().is_some() {
        return Err(StcpError::Eisconn);
    }
    let peer = as_v4(peer)?;

    if connection.carrier.local_addr().is_none() {
        connection
            .carrier
            .bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    }
    connection.carrier.set_peer(peer);

    // Arm the blocking flag before the transport thread (and the
    // terminal glue that can call `unblock_application` the moment it
    // returns) exists at all, so a synchronously-failing transport
    // can't race ahead of `park_until_unblocked` and strand the caller.
    connection.arm_blocking();

    let recv_pump = recv_pump::spawn(connection.clone());
    let transport_thread = transport::spawn(connection.clone(), (connection.transport_factory)());
    {
        let mut threads = connection.threads.lock().unwrap();
        threads.recv_pump = Some(recv_pump);
        threads.transport = Some(transport_thread);
    }

    tracing::info!(%descriptor, %peer, "connecting");
    match connection.park_until_unblocked() {
        None => Ok(()),
        Some(errno) => Err(errno),
    }
}

/// §4.7 `accept()`: blocks on the completed queue, returns the child
/// descriptor and its peer address.
///
/// SPEC_FULL.md §B.5: a completed request whose child failed its
/// handshake surfaces that failure here instead of a valid descriptor;
/// the failed child is torn down before returning.
pub fn accept(descriptor: Descriptor) -> StcpResult<(Descriptor, SocketAddr)> {
    let listener = table().get(descriptor)?;
    if !*listener.listening.lock().unwrap() {
        return Err(StcpError::Einval);
    }
    let child_descriptor = demux::accept(descriptor).ok_or(StcpError::Einval)?;
    let child = table().get(child_descriptor)?;

    let errno = child.blocking.lock().unwrap().errno.clone();
    if let Some(errno) = errno {
        tracing::warn!(%child_descriptor, ?errno, "accept: handshake failed, tearing down child");
        teardown(&child);
        table().free(child_descriptor);
        return Err(errno);
    }

    let peer = child.carrier.peer_addr().ok_or(StcpError::Enotconn)?;
    tracing::info!(%descriptor, %child_descriptor, %peer, "accepted");
    Ok((child_descriptor, SocketAddr::V4(peer)))
}

/// Requests close, joins the transport thread, wakes and joins the
/// receive pump. Does not free the descriptor — callers decide whether
/// the slot is reusable yet.
fn teardown(connection: &Arc<Connection>) {
    connection.request_close();
    let transport_thread = connection.threads.lock().unwrap().transport.take();
    if let Some(handle) = transport_thread {
        let _ = handle.join();
    }
    let _ = connection.carrier.wake();
    let pump_thread = connection.threads.lock().unwrap().recv_pump.take();
    if let Some(handle) = pump_thread {
        let _ = handle.join();
    }
}

/// §4.7 `close()`. For a listening descriptor, first closes every
/// pending and completed child (§4.6).
pub fn close(descriptor: Descriptor) -> StcpResult<()> {
    let connection = table().get(descriptor)?;
    if *connection.listening.lock().unwrap() {
        for child in demux::close_listener(descriptor) {
            let _ = close(child);
        }
    }
    teardown(&connection);
    table().free(descriptor);
    tracing::info!(%descriptor, "closed");
    Ok(())
}

/// §4.7 `read(buf)`.
pub fn read(descriptor: Descriptor, buf: &mut [u8]) -> StcpResult<usize> {
    let connection = table().get(descriptor)?;
    let mut state = connection.queues.lock().unwrap();
    if state.eof {
        return Ok(0);
    }
    loop {
        if let Some(n) = state.app_send.dequeue(buf, true) {
            if n == 0 {
                state.eof = true;
            }
            return Ok(n);
        }
        state = connection.data_ready.wait(state).unwrap();
    }
}

/// §4.7 `write(buf)`: enqueues on app-recv regardless of sender window
/// ("the transport layer is trusted to honor flow control").
pub fn write(descriptor: Descriptor, buf: &[u8]) -> StcpResult<usize> {
    let connection = table().get(descriptor)?;
    if *connection.listening.lock().unwrap() {
        return Err(StcpError::Einval);
    }
    connection.enqueue_app_recv(buf.to_vec());
    Ok(buf.len())
}

pub fn getsockname(descriptor: Descriptor) -> StcpResult<SocketAddr> {
    let connection = table().get(descriptor)?;
    connection
        .carrier
        .local_addr()
        .map(SocketAddr::V4)
        .ok_or(StcpError::Einval)
}

pub fn getpeername(descriptor: Descriptor) -> StcpResult<SocketAddr> {
    let connection = table().get(descriptor)?;
    connection
        .carrier
        .peer_addr()
        .map(SocketAddr::V4)
        .ok_or(StcpError::Enotconn)
}
