//! A minimal stop-and-wait `TransportLayer` double used by the
//! integration tests in this directory.
//!
//! SPEC_FULL.md §A.4: the real TCP-format handshake/retransmission
//! state machine is an out-of-scope collaborator (`spec.md` §1(b)); this
//! double only implements enough of one (three-way handshake, a single
//! outstanding unacknowledged segment, timeout-based retransmission, a
//! two-way FIN/ACK close) to exercise the core's contract with it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, SystemTime};

use stcp::segment::{Flags, TcpHeader};
use stcp::{CoreServices, EventFlags, Role, StcpResult, TransportLayer};

pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(20);
pub const MAX_RETRIES: u32 = 40;
pub const RECV_BUF_LEN: usize = stcp::TCP_HEADER_LEN + stcp::MAX_SEGMENT_PAYLOAD;

fn blank_header(seq: u32, ack: u32, flags: u8) -> TcpHeader {
    TcpHeader {
        src_port: 0,
        dst_port: 0,
        sequence: seq,
        acknowledgement: ack,
        flags: Flags::new(flags),
        window: 0xffff,
        checksum: 0,
        urgent: 0,
    }
}

/// A stop-and-wait echo transport: whatever the local application
/// writes is sent as one segment per `app_recv` chunk and must be
/// acknowledged before the next is sent; whatever arrives from the
/// network is handed straight to the application via `app_send`.
pub struct EchoTransport;

impl TransportLayer for EchoTransport {
    fn run(self: Box<Self>, services: CoreServices) {
        let role = services.role();
        let handshake = match role {
            Role::Active => active_handshake(&services),
            Role::Child => passive_handshake(&services),
            Role::Passive => {
                // A listening connection never gets its own transport
                // thread (socket::listen only starts the receive pump).
                unreachable!("listening connections don't run a transport layer")
            }
        };

        let (mut local_seq, mut peer_seq) = match handshake {
            Some(seqs) => seqs,
            None => return, // services.unblock_application already called with an error
        };

        data_phase(&services, &mut local_seq, &mut peer_seq);
    }
}

/// Returns `Some((local_seq, peer_seq))` with both advanced past the
/// SYN on success, after calling `unblock_application(Ok(()))`. Returns
/// `None` after calling `unblock_application(Err(_))` on failure.
fn active_handshake(services: &CoreServices) -> Option<(u32, u32)> {
    let mut local_seq: u32 = 1;
    let mut buf = [0u8; RECV_BUF_LEN];

    for _ in 0..MAX_RETRIES {
        let _ = services.network_send(blank_header(local_seq, 0, Flags::SYN), &[]);
        let deadline = SystemTime::now() + RETRANSMIT_TIMEOUT;
        let got = services.wait_for_event(EventFlags::new(EventFlags::NETWORK_DATA), Some(deadline));
        if got.is_empty() {
            continue; // timed out, resend the SYN
        }
        let n = services.network_recv(&mut buf);
        let Ok(header) = TcpHeader::from_bytes(&buf[..n]) else {
            continue;
        };
        if header.flags.syn() && header.flags.ack() && header.acknowledgement == local_seq + 1 {
            local_seq += 1;
            let peer_seq = header.sequence + 1;
            let _ = services.network_send(blank_header(local_seq, peer_seq, Flags::ACK), &[]);
            services.unblock_application(Ok(()));
            return Some((local_seq, peer_seq));
        }
        // anything else (e.g. a duplicate/stray segment): keep waiting
    }
    services.unblock_application(Err(stcp::StcpError::Econnrefused));
    None
}

fn passive_handshake(services: &CoreServices) -> Option<(u32, u32)> {
    let mut buf = [0u8; RECV_BUF_LEN];
    // The SYN that created this child is already queued on network-recv
    // (demux §4.6: "deliver the SYN to the child's network-recv queue").
    let n = services.network_recv(&mut buf);
    let Ok(syn) = TcpHeader::from_bytes(&buf[..n]) else {
        services.unblock_application(Err(stcp::StcpError::Econnaborted));
        return None;
    };
    let mut local_seq: u32 = 100;
    let peer_seq = syn.sequence + 1;

    for _ in 0..MAX_RETRIES {
        let _ = services.network_send(blank_header(local_seq, peer_seq, Flags::SYN | Flags::ACK), &[]);
        let deadline = SystemTime::now() + RETRANSMIT_TIMEOUT;
        let got = services.wait_for_event(EventFlags::new(EventFlags::NETWORK_DATA), Some(deadline));
        if got.is_empty() {
            continue;
        }
        let n = services.network_recv(&mut buf);
        let Ok(header) = TcpHeader::from_bytes(&buf[..n]) else {
            continue;
        };
        if header.flags.ack() && header.acknowledgement == local_seq + 1 {
            local_seq += 1;
            services.unblock_application(Ok(()));
            return Some((local_seq, peer_seq));
        }
    }
    services.unblock_application(Err(stcp::StcpError::Econnaborted));
    None
}

struct Outstanding {
    seq: u32,
    len: u32,
}

/// Runs the echo/ack loop until the local side's own FIN has been
/// acknowledged (or retransmission of it has been abandoned). Does not
/// wait for the peer's FIN in turn: `spec.md` names TIME_WAIT itself a
/// non-goal, and a transport thread that outlives its own `close()`
/// call would leave `socket::close`'s `join` stuck forever once the
/// peer's socket has also gone away.
fn data_phase(services: &CoreServices, local_seq: &mut u32, peer_seq: &mut u32) {
    let mut recv_buf = [0u8; RECV_BUF_LEN];
    let mut out_buf = [0u8; stcp::MAX_SEGMENT_PAYLOAD];
    let mut outstanding: Option<Outstanding> = None;
    let mut fin_sent = false;
    let mut fin_acked = false;
    // Retransmitting a live data segment always eventually succeeds (the
    // emulator only reorders/duplicates/delays, it never discards
    // forever) so that case retries without limit. Retransmitting a FIN
    // with nothing else outstanding is the one case that can retry
    // forever for a real reason: the peer already tore its socket down
    // after its own `close()` returned. Cap only that case.
    let mut fin_only_retries: u32 = 0;

    loop {
        if fin_acked {
            return;
        }
        if fin_only_retries >= MAX_RETRIES {
            return;
        }

        let waiting_on_ack = outstanding.is_some() || (fin_sent && !fin_acked);
        let mut bits = EventFlags::NETWORK_DATA;
        if !waiting_on_ack {
            bits |= EventFlags::APP_DATA;
            if !fin_sent {
                bits |= EventFlags::APP_CLOSE_REQUESTED;
            }
        }
        let deadline = if waiting_on_ack {
            Some(SystemTime::now() + RETRANSMIT_TIMEOUT)
        } else {
            None
        };
        let got = services.wait_for_event(EventFlags::new(bits), deadline);

        if got.is_empty() {
            // Retransmit whichever segment is outstanding.
            if let Some(o) = &outstanding {
                let payload = &out_buf[..o.len as usize];
                let _ = services.network_send(
                    blank_header(o.seq, *peer_seq, Flags::ACK | Flags::PSH),
                    &[payload],
                );
            } else if fin_sent && !fin_acked {
                fin_only_retries += 1;
                let _ = services.network_send(
                    blank_header(*local_seq - 1, *peer_seq, Flags::FIN | Flags::ACK),
                    &[],
                );
            }
            continue;
        }

        if got.contains(EventFlags::NETWORK_DATA) {
            let n = services.network_recv(&mut recv_buf);
            if let Ok(header) = TcpHeader::from_bytes(&recv_buf[..n]) {
                let payload = &recv_buf[stcp::TCP_HEADER_LEN..n];

                if header.flags.ack() {
                    if let Some(o) = &outstanding {
                        if header.acknowledgement == o.seq + o.len {
                            outstanding = None;
                        }
                    }
                    if fin_sent && !fin_acked && header.acknowledgement == *local_seq {
                        fin_acked = true;
                    }
                }

                if header.flags.fin() {
                    services.fin_received();
                    *peer_seq = header.sequence + 1;
                    let _ = services.network_send(blank_header(*local_seq, *peer_seq, Flags::ACK), &[]);
                } else if !payload.is_empty() && header.sequence == *peer_seq {
                    services.app_send(payload.to_vec());
                    *peer_seq += payload.len() as u32;
                    let _ = services.network_send(blank_header(*local_seq, *peer_seq, Flags::ACK), &[]);
                } else if !payload.is_empty() {
                    // Duplicate or out-of-order: re-ack what we already have.
                    let _ = services.network_send(blank_header(*local_seq, *peer_seq, Flags::ACK), &[]);
                }
            }
        }

        if got.contains(EventFlags::APP_DATA) && outstanding.is_none() {
            let n = services.app_recv(&mut out_buf);
            if n > 0 {
                let seq = *local_seq;
                let _ = services.network_send(
                    blank_header(seq, *peer_seq, Flags::ACK | Flags::PSH),
                    &[&out_buf[..n]],
                );
                *local_seq += n as u32;
                outstanding = Some(Outstanding { seq, len: n as u32 });
            }
        }

        if got.contains(EventFlags::APP_CLOSE_REQUESTED) && outstanding.is_none() && !fin_sent {
            let seq = *local_seq;
            let _ = services.network_send(blank_header(seq, *peer_seq, Flags::FIN | Flags::ACK), &[]);
            *local_seq += 1;
            fin_sent = true;
        }
    }
}

pub fn factory() -> Box<dyn TransportLayer> {
    Box::new(EchoTransport)
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

pub fn open_bound(reliable: bool) -> StcpResult<stcp::Descriptor> {
    let desc = stcp::open(reliable, factory)?;
    stcp::bind(desc, loopback(0))?;
    Ok(desc)
}
