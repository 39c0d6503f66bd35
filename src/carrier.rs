//! Framed datagram-over-reliable-stream carrier (§4.2).
//!
//! Each connection owns one raw AF_INET/SOCK_STREAM socket plus a
//! self-pipe used to interrupt a blocked receive pump on close (§5
//! "Cancellation"). Built directly on `libc`, the way
//! `dspeyrer-net`'s runtime builds its socket layer, since `std::net`
//! offers no way to create a socket, poll it, and connect it later on
//! the same file descriptor — which the lazy connect-once contract and
//! the accepted-socket handoff both require.

use crate::config::MAX_SEGMENT_PAYLOAD;
use crate::unreliability::{self, Action};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn retry_eintr<F: FnMut() -> io::Result<libc::c_int>>(mut f: F) -> io::Result<libc::c_int> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
        #[cfg(target_os = "macos")]
        sin_len: 0,
    }
}

fn from_sockaddr_in(raw: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());
    SocketAddrV4::new(ip, u16::from_be(raw.sin_port))
}

fn new_raw_tcp_socket() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn write_all(fd: RawFd, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        let n = retry_eintr(|| {
            cvt(unsafe {
                libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) as libc::c_int
            })
        })?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "peer closed"));
        }
        bytes = &bytes[n as usize..];
    }
    Ok(())
}

/// Reads exactly `dst.len()` bytes, or fewer at EOF (mirroring the
/// reference carrier's "partial reads are retried until satisfied or
/// the peer closes").
fn read_exact_or_eof(fd: RawFd, dst: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < dst.len() {
        let n = retry_eintr(|| {
            cvt(unsafe {
                libc::read(
                    fd,
                    dst[filled..].as_mut_ptr() as *mut libc::c_void,
                    dst.len() - filled,
                ) as libc::c_int
            })
        })?;
        if n == 0 {
            break;
        }
        filled += n as usize;
    }
    Ok(filled)
}

fn drain_and_discard(fd: RawFd, mut remaining: usize) -> io::Result<()> {
    let mut scratch = [0u8; 512];
    while remaining > 0 {
        let want = remaining.min(scratch.len());
        let n = read_exact_or_eof(fd, &mut scratch[..want])?;
        if n == 0 {
            break;
        }
        remaining -= n;
    }
    Ok(())
}

enum Socket {
    /// Active role, or a soon-to-be-listening socket: a real but
    /// unconnected fd, created eagerly at allocation time so the
    /// receive pump has something pollable from the start (§9 Open
    /// Question: the active-not-yet-connected case is ordinary).
    PendingConnect(OwnedFd),
    /// Passive child role: no fd at all until the listener's receive
    /// pump hands one off via [`Carrier::install_accepted`].
    PendingAccept,
    Listening(OwnedFd),
    Connected(OwnedFd),
}

impl Socket {
    fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Socket::PendingConnect(fd) | Socket::Listening(fd) | Socket::Connected(fd) => {
                Some(fd.as_raw_fd())
            }
            Socket::PendingAccept => None,
        }
    }
}

pub(crate) enum PollResult {
    Woken,
    Readable,
}

pub(crate) struct Carrier {
    socket: Mutex<Socket>,
    connect_once: Mutex<()>,
    peer: Mutex<Option<SocketAddrV4>>,
    local: Mutex<Option<SocketAddrV4>>,
    pending_accept: Mutex<Option<(OwnedFd, SocketAddrV4)>>,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    rng: Mutex<SmallRng>,
    held: Mutex<Option<Vec<u8>>>,
}

impl Carrier {
    fn wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds = [0 as RawFd; 2];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
    }

    /// Used for a connection that will actively connect, or for one
    /// that will become a listener (§4.2: the carrier lazily
    /// establishes the OS connection on first send).
    pub(crate) fn new_open(seed: u64) -> io::Result<Self> {
        let (wake_read, wake_write) = Self::wake_pipe()?;
        Ok(Self {
            socket: Mutex::new(Socket::PendingConnect(new_raw_tcp_socket()?)),
            connect_once: Mutex::new(()),
            peer: Mutex::new(None),
            local: Mutex::new(None),
            pending_accept: Mutex::new(None),
            wake_read,
            wake_write,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            held: Mutex::new(None),
        })
    }

    /// Used for a passive child allocated by the demultiplexer; its
    /// real socket arrives later via [`Carrier::install_accepted`].
    pub(crate) fn new_child(seed: u64) -> io::Result<Self> {
        let (wake_read, wake_write) = Self::wake_pipe()?;
        Ok(Self {
            socket: Mutex::new(Socket::PendingAccept),
            connect_once: Mutex::new(()),
            peer: Mutex::new(None),
            local: Mutex::new(None),
            pending_accept: Mutex::new(None),
            wake_read,
            wake_write,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            held: Mutex::new(None),
        })
    }

    pub(crate) fn bind(&self, addr: SocketAddrV4) -> io::Result<()> {
        let socket = self.socket.lock().unwrap();
        let fd = socket
            .raw_fd()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no socket to bind"))?;
        let raw = to_sockaddr_in(addr);
        cvt(unsafe {
            libc::bind(
                fd,
                &raw as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        })?;
        *self.local.lock().unwrap() = Some(self.query_local_addr(fd)?);
        Ok(())
    }

    pub(crate) fn listen(&self, backlog: i32) -> io::Result<()> {
        let mut socket = self.socket.lock().unwrap();
        let fd = match &*socket {
            Socket::PendingConnect(fd) => fd.as_raw_fd(),
            _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "wrong state for listen")),
        };
        cvt(unsafe { libc::listen(fd, backlog) })?;
        let Socket::PendingConnect(fd) = mem::replace(&mut *socket, Socket::PendingAccept) else {
            unreachable!()
        };
        *socket = Socket::Listening(fd);
        Ok(())
    }

    fn query_local_addr(&self, fd: RawFd) -> io::Result<SocketAddrV4> {
        let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockname(fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        Ok(from_sockaddr_in(&raw))
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddrV4> {
        *self.local.lock().unwrap()
    }

    pub(crate) fn set_peer(&self, addr: SocketAddrV4) {
        *self.peer.lock().unwrap() = Some(addr);
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddrV4> {
        *self.peer.lock().unwrap()
    }

    /// Lazily connects under the connect-once lock (§4.2, §5 "per-
    /// carrier connect-once mutex serializes lazy OS connect").
    fn ensure_connected(&self) -> io::Result<RawFd> {
        let _guard = self.connect_once.lock().unwrap();
        let mut socket = self.socket.lock().unwrap();
        match &*socket {
            Socket::Connected(fd) => Ok(fd.as_raw_fd()),
            Socket::PendingConnect(_) => {
                let peer = self.peer_addr().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotConnected, "connect() with no peer set")
                })?;
                let Socket::PendingConnect(fd) = mem::replace(&mut *socket, Socket::PendingAccept)
                else {
                    unreachable!()
                };
                let raw = to_sockaddr_in(peer);
                cvt(unsafe {
                    libc::connect(
                        fd.as_raw_fd(),
                        &raw as *const _ as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                })?;
                let fd_raw = fd.as_raw_fd();
                *socket = Socket::Connected(fd);
                Ok(fd_raw)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "carrier has no connectable socket",
            )),
        }
    }

    pub(crate) fn send_packet(&self, bytes: &[u8]) -> io::Result<()> {
        let fd = self.ensure_connected()?;
        let len: u16 = bytes
            .len()
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment too large"))?;
        write_all(fd, &len.to_be_bytes())?;
        write_all(fd, bytes)
    }

    /// Sends `bytes` through the unreliability emulator (§4.3) when
    /// `reliable` is false, or straight through when true. This is the
    /// entry point `network-send` (§4.8) hands every outbound segment
    /// to.
    pub(crate) fn send_emulated(&self, reliable: bool, bytes: &[u8]) -> io::Result<()> {
        if reliable {
            return self.send_packet(bytes);
        }
        let draw = self.rng.lock().unwrap().gen_range(0..32u8);
        match unreliability::decide(draw) {
            Action::Drop => {
                tracing::trace!(draw, "unreliability emulator: dropping segment");
                Ok(())
            }
            Action::Duplicate => {
                tracing::trace!(draw, "unreliability emulator: duplicating segment");
                self.send_packet(bytes)?;
                self.send_packet(bytes)
            }
            Action::Hold => {
                tracing::trace!(draw, "unreliability emulator: holding segment");
                *self.held.lock().unwrap() = Some(bytes.to_vec());
                Ok(())
            }
            Action::ReplayHeldOrDuplicate => {
                let held = self.held.lock().unwrap().take();
                match held {
                    Some(held) => {
                        tracing::trace!(draw, "unreliability emulator: replaying held segment");
                        self.send_packet(&held)
                    }
                    None => {
                        tracing::trace!(
                            draw,
                            "unreliability emulator: nothing held, duplicating instead"
                        );
                        self.send_packet(bytes)
                    }
                }
            }
            Action::PassThrough => self.send_packet(bytes),
        }
    }

    pub(crate) fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let is_listening = matches!(&*self.socket.lock().unwrap(), Socket::Listening(_));
        if is_listening {
            self.recv_via_accept(buf)
        } else {
            let fd = self.ensure_connected()?;
            self.recv_framed(fd, buf)
        }
    }

    fn recv_via_accept(&self, buf: &mut [u8]) -> io::Result<usize> {
        let listen_fd = match &*self.socket.lock().unwrap() {
            Socket::Listening(fd) => fd.as_raw_fd(),
            _ => unreachable!(),
        };
        let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let accepted = retry_eintr(|| {
            cvt(unsafe {
                libc::accept(
                    listen_fd,
                    &mut raw as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            })
        })?;
        let accepted_fd = unsafe { OwnedFd::from_raw_fd(accepted) };
        let peer = from_sockaddr_in(&raw);
        let n = self.recv_framed(accepted_fd.as_raw_fd(), buf)?;
        *self.pending_accept.lock().unwrap() = Some((accepted_fd, peer));
        Ok(n)
    }

    fn recv_framed(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let mut len_bytes = [0u8; 2];
        if read_exact_or_eof(fd, &mut len_bytes)? < 2 {
            return Ok(0);
        }
        let body_len = u16::from_be_bytes(len_bytes) as usize;
        let want = body_len.min(buf.len());
        let read = read_exact_or_eof(fd, &mut buf[..want])?;
        if body_len > want {
            drain_and_discard(fd, body_len - want)?;
        }
        Ok(read)
    }

    /// Retrieves the OS connection most recently accepted by this
    /// listening carrier's `recv_packet`, for the demultiplexer to
    /// hand off to a newly created child (§4.2 "update-passive-state").
    pub(crate) fn take_pending_accept(&self) -> Option<(OwnedFd, SocketAddrV4)> {
        self.pending_accept.lock().unwrap().take()
    }

    /// Installs an OS connection accepted by the listener in place of
    /// this (child) carrier's placeholder, and records the listener-side
    /// local address on the child (a passive child never calls `bind`
    /// itself, so this is the only place its `local_addr()` is ever
    /// populated).
    pub(crate) fn install_accepted(&self, fd: OwnedFd, peer: SocketAddrV4) -> io::Result<()> {
        let local = self.query_local_addr(fd.as_raw_fd())?;
        *self.socket.lock().unwrap() = Socket::Connected(fd);
        *self.peer.lock().unwrap() = Some(peer);
        *self.local.lock().unwrap() = Some(local);
        Ok(())
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        write_all(self.wake_write.as_raw_fd(), &[0u8])
    }

    /// Blocks until either the wake pipe or the carrier's socket is
    /// readable (§4.5: "it waits on two descriptors: the carrier and
    /// the wake-pipe").
    pub(crate) fn poll_readable(&self) -> io::Result<PollResult> {
        let carrier_fd = self
            .socket
            .lock()
            .unwrap()
            .raw_fd()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no socket to poll"))?;
        let mut fds = [
            libc::pollfd {
                fd: self.wake_read.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: carrier_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        retry_eintr(|| cvt(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) }))?;
        if fds[0].revents & libc::POLLIN != 0 {
            Ok(PollResult::Woken)
        } else {
            Ok(PollResult::Readable)
        }
    }
}

pub(crate) const MAX_SEGMENT_BYTES: usize = crate::config::TCP_HEADER_LEN + MAX_SEGMENT_PAYLOAD;
