//! The per-connection receive pump thread (§4.5).

use crate::carrier::{PollResult, MAX_SEGMENT_BYTES};
use crate::connection::Connection;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Spawns the receive pump for `connection`. Runs until the wake pipe
/// fires (on `close()`) or the carrier reports the peer is gone.
pub(crate) fn spawn(connection: Arc<Connection>) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("stcp-recv-pump-{}", connection.descriptor))
        .spawn(move || run(connection))
        .expect("failed to spawn receive pump thread")
}

fn run(connection: Arc<Connection>) {
    loop {
        match connection.carrier.poll_readable() {
            Ok(PollResult::Woken) => {
                tracing::debug!(descriptor = %connection.descriptor, "receive pump woken, exiting");
                return;
            }
            Ok(PollResult::Readable) => {}
            Err(err) => {
                tracing::warn!(descriptor = %connection.descriptor, %err, "receive pump poll failed");
                return;
            }
        }

        let mut buf = [0u8; MAX_SEGMENT_BYTES];
        match connection.carrier.recv_packet(&mut buf) {
            Ok(0) => {
                tracing::debug!(descriptor = %connection.descriptor, "peer gone, receive pump exiting");
                return;
            }
            Ok(n) => {
                let is_listening = *connection.listening.lock().unwrap();
                if is_listening {
                    crate::demux::on_syn(&connection, &buf[..n]);
                } else {
                    connection.enqueue_network_recv(buf[..n].to_vec());
                }
            }
            Err(err) => {
                tracing::warn!(descriptor = %connection.descriptor, %err, "receive pump recv failed, exiting");
                return;
            }
        }
    }
}
