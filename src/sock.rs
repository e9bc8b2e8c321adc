//! Socket driver
//!
//! Thin wrapper over mio: open/bind/listen/connect/accept/send/recv plus a
//! bounded readiness wait. The driver owns nothing but socket handles and
//! never calls handlers; the manager interprets readiness and drives the
//! connection state machines.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::trace;

/// A registered socket handle
#[derive(Debug)]
pub(crate) enum Socket {
    Tcp(TcpStream),
    Listener(TcpListener),
    Udp(UdpSocket),
}

impl Socket {
    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = Interest::READABLE | Interest::WRITABLE;
        match self {
            Socket::Tcp(s) => registry.register(s, token, interest),
            Socket::Listener(s) => registry.register(s, token, Interest::READABLE),
            Socket::Udp(s) => registry.register(s, token, interest),
        }
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        let _ = match self {
            Socket::Tcp(s) => registry.deregister(s),
            Socket::Listener(s) => registry.deregister(s),
            Socket::Udp(s) => registry.deregister(s),
        };
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Socket::Tcp(s) => s.local_addr(),
            Socket::Listener(s) => s.local_addr(),
            Socket::Udp(s) => s.local_addr(),
        }
    }

    /// Pending error left by a non-blocking connect
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Socket::Tcp(s) => s.take_error(),
            Socket::Listener(s) => s.take_error(),
            Socket::Udp(s) => s.take_error(),
        }
    }

    /// Read into `dst`. TCP returns `Ok(0)` on EOF; UDP reads one datagram
    /// and reports the sender.
    pub(crate) fn recv(&mut self, dst: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        match self {
            Socket::Tcp(s) => s.read(dst).map(|n| (n, None)),
            Socket::Udp(s) => s.recv_from(dst).map(|(n, from)| (n, Some(from))),
            Socket::Listener(_) => Err(io::Error::other("recv on listener")),
        }
    }

    pub(crate) fn send(&mut self, src: &[u8], peer: Option<SocketAddr>) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.write(src),
            Socket::Udp(s) => match peer {
                Some(to) => s.send_to(src, to),
                None => s.send(src),
            },
            Socket::Listener(_) => Err(io::Error::other("send on listener")),
        }
    }
}

/// Open a listening socket for `addr`
pub(crate) fn listen(addr: SocketAddr, udp: bool) -> io::Result<Socket> {
    if udp {
        UdpSocket::bind(addr).map(Socket::Udp)
    } else {
        TcpListener::bind(addr).map(Socket::Listener)
    }
}

/// Start a non-blocking connect; completion is signalled by writability
pub(crate) fn connect(addr: SocketAddr, udp: bool) -> io::Result<Socket> {
    if udp {
        let local: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let sock = UdpSocket::bind(local)?;
        sock.connect(addr)?;
        Ok(Socket::Udp(sock))
    } else {
        TcpStream::connect(addr).map(Socket::Tcp)
    }
}

pub(crate) fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

/// Readiness poller shared by every connection plus the DNS socket
pub(crate) struct Driver {
    pub(crate) poll: Poll,
    events: Events,
}

/// One readiness report: token with readable/writable edges
pub(crate) type Readiness = (Token, bool, bool);

impl Driver {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
        })
    }

    pub(crate) fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Wait up to `timeout` and collect readiness edges into `out`
    pub(crate) fn wait(&mut self, timeout: Duration, out: &mut Vec<Readiness>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        for ev in self.events.iter() {
            trace!(token = ev.token().0, readable = ev.is_readable(), writable = ev.is_writable(), "readiness");
            out.push((ev.token(), ev.is_readable(), ev.is_writable()));
        }
        Ok(())
    }
}
