//! The event manager: a single-threaded readiness-driven reactor
//!
//! One [`Manager::poll`] step advances timers, DNS, connect completion, TLS
//! handshakes, reads, writes and the close pass, delivering events to each
//! connection in list order. Everything runs on the owning thread; the only
//! thread-safe entry point is the [`Wakeup`] handle minted by
//! [`Manager::make_pipe`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::Token;
use tracing::{debug, error, trace, warn};

use crate::connection::{Connection, EventFn, Pending, Proto, Role};
use crate::dns::{self, DnsClient, Outcome};
use crate::event::Event;
use crate::sock::{self, Driver, Readiness, Socket};
use crate::timer::{self, Timer};
use crate::tls::HsStatus;
use crate::url::{Url, UrlError};
use crate::{http, mqtt, sntp, ws};

use thiserror::Error;

/// Failures surfaced by manager entry points; per-connection runtime errors
/// travel through [`Event::Error`] instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad url: {0}")]
    Url(#[from] UrlError),
    #[error("{0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Tuning knobs; every default preserves full functionality
#[derive(Debug, Clone)]
pub struct Config {
    /// Granularity of buffer growth and socket reads
    pub io_size: usize,
    /// Hard cap on a connection's receive buffer; exceeding it is an error
    pub max_recv_buf_size: usize,
    /// Resolver used for A queries
    pub dns_server: SocketAddr,
    /// Resolver used for AAAA queries when `enable_ipv6` is set
    pub dns_server6: SocketAddr,
    pub dns_timeout_ms: u64,
    /// Resolve hostnames to AAAA records instead of A
    pub enable_ipv6: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            io_size: 2048,
            max_recv_buf_size: 3 * 1024 * 1024,
            dns_server: "8.8.8.8:53".parse().unwrap(),
            dns_server6: "[2001:4860:4860::8888]:53".parse().unwrap(),
            dns_timeout_ms: 3000,
            enable_ipv6: false,
        }
    }
}

/// Thread-safe wakeup handle for a pipe connection
///
/// Cloneable and sendable; every other manager API must stay on the owning
/// thread. `wake` writes a single byte which the reactor turns into a
/// `Read` event on the pipe connection during its next poll.
#[derive(Clone, Debug)]
pub struct Wakeup {
    sock: Arc<std::net::UdpSocket>,
}

impl Wakeup {
    pub fn wake(&self) -> bool {
        self.sock.send(&[0u8]).is_ok()
    }
}

const FIRST_CONN_ID: u64 = 2; // 0 and 1 are the resolver tokens

pub struct Manager {
    pub(crate) cfg: Config,
    driver: Driver,
    conns: HashMap<u64, Connection>,
    /// Connection ids, head to tail; poll visits them in this order
    order: Vec<u64>,
    next_id: u64,
    epoch: Instant,
    dns: DnsClient,
    pub(crate) timers: Vec<Timer>,
    pub(crate) timer_graveyard: Vec<u64>,
    next_timer_id: u64,
    readiness: Vec<Readiness>,
}

impl Manager {
    pub fn new() -> io::Result<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(cfg: Config) -> io::Result<Self> {
        Ok(Self {
            cfg,
            driver: Driver::new()?,
            conns: HashMap::new(),
            order: Vec::new(),
            next_id: FIRST_CONN_ID,
            epoch: Instant::now(),
            dns: DnsClient::default(),
            timers: Vec::new(),
            timer_graveyard: Vec::new(),
            next_timer_id: 1,
            readiness: Vec::new(),
        })
    }

    /// Milliseconds since the manager was created
    pub fn uptime_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Open a listening connection on `url` (`tcp://host:port`,
    /// `udp://host:port`, or any protocol scheme). The host must be an
    /// address literal; port 0 binds an ephemeral port.
    pub fn listen(&mut self, url: &str, handler: EventFn) -> Result<u64, Error> {
        let u = Url::parse(url)?;
        let addr = u
            .literal_addr()
            .ok_or(Error::Unsupported("listen requires a literal address"))?;
        let udp = u.is_udp();
        let mut sock = sock::listen(addr, udp)?;
        let id = self.alloc_id();
        sock.register(self.driver.registry(), Token(id as usize))?;
        let mut c = Connection::new(id, Role::Listener, self.cfg.io_size);
        c.sock = Some(sock);
        c.is_udp = udp;
        c.handler = Some(handler);
        c.wants_tls = u.is_ssl();
        debug!(id, url, "listening");
        self.conns.insert(id, c);
        self.order.insert(0, id);
        Ok(id)
    }

    /// Open an outgoing connection to `url`. Hostnames resolve through the
    /// non-blocking DNS client; the connection reports progress via
    /// `Resolve`, `Connect` and `Error` events.
    pub fn connect(&mut self, url: &str, handler: EventFn) -> Result<u64, Error> {
        let u = Url::parse(url)?;
        if u.port == 0 {
            return Err(Error::Unsupported("connect requires a port"));
        }
        let id = self.alloc_id();
        let mut c = Connection::new(id, Role::Client, self.cfg.io_size);
        c.handler = Some(handler);
        c.is_udp = u.is_udp();
        c.wants_tls = u.is_ssl();
        if c.wants_tls {
            c.tls_name = Some(u.host.to_owned());
        }
        match u.literal_addr() {
            Some(addr) => {
                if let Err(e) = self.start_connect(&mut c, addr) {
                    return Err(e.into());
                }
            }
            None => {
                let (qtype, server) = if self.cfg.enable_ipv6 {
                    (dns::QTYPE_AAAA, self.cfg.dns_server6)
                } else {
                    (dns::QTYPE_A, self.cfg.dns_server)
                };
                self.dns.resolve(
                    self.driver.registry(),
                    id,
                    u.host,
                    qtype,
                    server,
                    Duration::from_millis(self.cfg.dns_timeout_ms),
                )?;
                c.is_resolving = true;
                c.pending = Some(Pending {
                    host: u.host.to_owned(),
                    port: u.port,
                });
                debug!(id, host = u.host, "resolving");
            }
        }
        self.conns.insert(id, c);
        self.order.insert(0, id);
        Ok(id)
    }

    /// Create a pipe connection plus its thread-safe [`Wakeup`] handle.
    /// The pipe's handler receives a `Read` event whenever any thread calls
    /// [`Wakeup::wake`].
    pub fn make_pipe(&mut self, handler: EventFn) -> Result<(u64, Wakeup), Error> {
        let inner = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let outer = std::net::UdpSocket::bind("127.0.0.1:0")?;
        inner.connect(outer.local_addr()?)?;
        outer.connect(inner.local_addr()?)?;
        inner.set_nonblocking(true)?;
        let mut sock = Socket::Udp(mio::net::UdpSocket::from_std(inner));
        let id = self.alloc_id();
        sock.register(self.driver.registry(), Token(id as usize))?;
        let mut c = Connection::new(id, Role::Client, self.cfg.io_size);
        c.sock = Some(sock);
        c.is_udp = true;
        c.handler = Some(handler);
        debug!(id, "pipe created");
        self.conns.insert(id, c);
        self.order.insert(0, id);
        Ok((id, Wakeup { sock: Arc::new(outer) }))
    }

    /// Queue bytes on any live connection; `false` if it is gone or closing
    pub fn send_to(&mut self, id: u64, data: &[u8]) -> bool {
        match self.conns.get_mut(&id) {
            Some(c) => c.send_bytes(data),
            None => false,
        }
    }

    /// Local address of a connection's socket (the bound port of a
    /// listener)
    pub fn local_addr(&self, id: u64) -> Option<SocketAddr> {
        self.conns.get(&id)?.local_addr()
    }

    pub fn is_open(&self, id: u64) -> bool {
        self.conns.contains_key(&id)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Arm a software timer; see [`crate::timer`] for the flags. Returns a
    /// timer id usable with [`Manager::clear_timer`].
    pub fn set_timer(
        &mut self,
        period_ms: u64,
        flags: u8,
        cb: impl FnMut(&mut Manager) + 'static,
    ) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers
            .push(Timer::new(id, period_ms, flags, Instant::now(), Box::new(cb)));
        id
    }

    pub fn clear_timer(&mut self, id: u64) {
        self.timers.retain(|t| t.id != id);
        self.timer_graveyard.push(id);
    }

    /// One poll step: fire due timers, advance DNS, wait up to `timeout_ms`
    /// for readiness, drive every connection in list order, then destroy
    /// connections marked closing (after their `Close` event).
    pub fn poll(&mut self, timeout_ms: u64) {
        let now = Instant::now();
        timer::fire(self, now);

        let mut outcomes = Vec::new();
        self.dns.tick(now, &mut outcomes);

        let mut ready = mem::take(&mut self.readiness);
        ready.clear();
        if let Err(e) = self
            .driver
            .wait(Duration::from_millis(timeout_ms), &mut ready)
        {
            error!("readiness wait failed: {e}");
        }
        for &(token, readable, writable) in &ready {
            if token == dns::TOKEN4 || token == dns::TOKEN6 {
                self.dns.drain(token, &mut outcomes);
            } else if let Some(c) = self.conns.get_mut(&(token.0 as u64)) {
                c.is_readable |= readable;
                c.is_writable |= writable;
            }
        }
        self.readiness = ready;
        self.apply_dns(outcomes);

        let ids = self.order.clone();
        for id in ids {
            if let Some(mut c) = self.conns.remove(&id) {
                self.drive(&mut c, now);
                self.conns.insert(id, c);
            }
        }

        // close pass: draining connections close once flushed; closing
        // connections are destroyed after their Close event
        let ids = self.order.clone();
        for id in ids {
            let Some(mut c) = self.conns.remove(&id) else { continue };
            // failures staged from outside this connection's own drive,
            // e.g. a timer callback or another handler using send_to
            if let Some(msg) = c.pending_error.take() {
                self.error(&mut c, msg);
            }
            if c.is_draining && c.send.len() == 0 {
                c.is_closing = true;
            }
            let closing = c.is_closing;
            self.conns.insert(id, c);
            if closing {
                self.close_conn(id);
            }
        }
    }

    /// Two-stage event dispatch: the protocol engine first, then the user
    /// handler. Protocol engines call back into this to synthesize
    /// higher-level events; applications may inject [`Event::User`].
    pub fn deliver(&mut self, c: &mut Connection, ev: &Event) {
        match c.proto {
            Proto::Raw => {}
            Proto::Http(_) => http::cb(self, c, ev),
            Proto::Ws(_) => ws::cb(self, c, ev),
            Proto::Mqtt(_) => mqtt::cb(self, c, ev),
            Proto::Sntp(_) => sntp::cb(self, c, ev),
        }
        if let Some(h) = c.handler.clone() {
            h(self, c, ev);
        }
    }

    /// Report a fatal per-connection error: marks the connection
    /// drain-and-close and delivers [`Event::Error`]; `Close` follows at
    /// the end of the poll step.
    pub fn error(&mut self, c: &mut Connection, msg: impl Into<String>) {
        let msg = msg.into();
        error!(id = c.id, "{msg}");
        c.is_draining = true;
        c.is_closing = true;
        self.deliver(c, &Event::Error(msg));
    }

    pub(crate) fn conn_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn start_connect(&mut self, c: &mut Connection, addr: SocketAddr) -> io::Result<()> {
        let mut sock = sock::connect(addr, c.is_udp)?;
        sock.register(self.driver.registry(), Token(c.id as usize))?;
        c.sock = Some(sock);
        c.peer = Some(addr);
        c.is_resolving = false;
        c.is_connecting = true;
        trace!(id = c.id, %addr, "connecting");
        Ok(())
    }

    fn apply_dns(&mut self, outcomes: Vec<Outcome>) {
        for outcome in outcomes {
            match outcome {
                Outcome::Resolved(id, ip) => {
                    let Some(mut c) = self.conns.remove(&id) else { continue };
                    if let Some(p) = c.pending.take() {
                        let addr = SocketAddr::new(ip, p.port);
                        debug!(id, host = %p.host, %addr, "resolved");
                        match self.start_connect(&mut c, addr) {
                            Ok(()) => self.deliver(&mut c, &Event::Resolve),
                            Err(e) => self.error(&mut c, format!("connect failed: {e}")),
                        }
                    }
                    self.conns.insert(id, c);
                }
                Outcome::Failed(id, msg) => {
                    let Some(mut c) = self.conns.remove(&id) else { continue };
                    c.is_resolving = false;
                    self.error(&mut c, msg);
                    self.conns.insert(id, c);
                }
            }
        }
    }

    /// Advance one connection through its state machine for this poll step
    fn drive(&mut self, c: &mut Connection, now: Instant) {
        if c.is_resolving || c.is_closing {
            self.deliver_poll(c, now);
            return;
        }

        if c.is_connecting && c.is_writable {
            let err = c.sock.as_ref().and_then(|s| s.take_error().ok().flatten());
            if let Some(e) = err {
                self.error(c, format!("connect failed: {e}"));
            } else {
                c.is_connecting = false;
                debug!(id = c.id, peer = ?c.peer, "connected");
                self.deliver(c, &Event::Connect);
                if c.wants_tls && c.tls.is_none() && !c.is_closing {
                    // TLS scheme but nobody initialised a driver in the
                    // Connect handler
                    self.error(c, "TLS requested but not initialised");
                }
            }
        }

        if c.is_tls_hs && !c.is_closing {
            self.tls_step(c);
        }
        if c.is_tls_hs || c.is_connecting || c.is_closing {
            self.deliver_poll(c, now);
            return;
        }

        if c.role == Role::Listener && !c.is_udp {
            if c.is_readable {
                self.accept_loop(c);
            }
        } else if c.is_readable && c.sock.is_some() {
            self.read_loop(c);
        }

        if !c.is_closing && c.send.len() > 0 && c.is_writable && c.sock.is_some() {
            self.write_loop(c);
        }

        self.deliver_poll(c, now);
    }

    fn deliver_poll(&mut self, c: &mut Connection, now: Instant) {
        // surface failures staged during this drive (allocation failures in
        // handlers and encoders) before the close pass runs
        if let Some(msg) = c.pending_error.take() {
            self.error(c, msg);
        }
        let ms = now.duration_since(self.epoch).as_millis() as u64;
        self.deliver(c, &Event::Poll(ms));
    }

    fn tls_step(&mut self, c: &mut Connection) {
        let result = {
            let (Some(sock), Some(tls)) = (c.sock.as_mut(), c.tls.as_mut()) else {
                return;
            };
            let Socket::Tcp(stream) = sock else { return };
            tls.handshake(stream)
        };
        match result {
            Ok(HsStatus::Done) => {
                c.is_tls_hs = false;
                debug!(id = c.id, "tls handshake complete");
            }
            Ok(_) => {}
            Err(e) => self.error(c, format!("TLS handshake failed: {e}")),
        }
    }

    fn accept_loop(&mut self, c: &mut Connection) {
        loop {
            let accepted = match c.sock.as_mut() {
                Some(Socket::Listener(l)) => l.accept(),
                _ => return,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(ref e) if sock::would_block(e) => {
                    c.is_readable = false;
                    return;
                }
                Err(e) => {
                    warn!(id = c.id, "accept failed: {e}");
                    return;
                }
            };
            let id = self.alloc_id();
            let mut sock = Socket::Tcp(stream);
            if let Err(e) = sock.register(self.driver.registry(), Token(id as usize)) {
                warn!("dropping accepted connection: {e}");
                continue;
            }
            let mut nc = Connection::new(id, Role::Accepted, self.cfg.io_size);
            nc.sock = Some(sock);
            nc.peer = Some(peer);
            nc.handler = c.handler.clone();
            nc.proto = c.proto.child();
            nc.wants_tls = c.wants_tls;
            if let Some(data) = c.userdata_clone() {
                nc.set_userdata(data);
            }
            debug!(id, %peer, listener = c.id, "accepted");
            self.deliver(&mut nc, &Event::Accept);
            self.conns.insert(id, nc);
            self.order.push(id);
        }
    }

    fn read_loop(&mut self, c: &mut Connection) {
        loop {
            if c.recv.len() >= self.cfg.max_recv_buf_size {
                self.error(c, "max_recv_buf_size reached");
                return;
            }
            let room = self.cfg.io_size;
            let result = {
                let spare = match c.recv.spare(room, room) {
                    Ok(spare) => spare,
                    Err(e) => {
                        self.error(c, e.to_string());
                        return;
                    }
                };
                match (c.sock.as_mut(), c.tls.as_mut()) {
                    (Some(Socket::Tcp(stream)), Some(tls)) => {
                        tls.read(stream, spare).map(|n| (n, None))
                    }
                    (Some(sock), _) => sock.recv(spare),
                    (None, _) => return,
                }
            };
            match result {
                Ok((0, None)) if !c.is_udp => {
                    // orderly shutdown by the peer: no Read event, one Close
                    trace!(id = c.id, "peer closed");
                    c.is_closing = true;
                    return;
                }
                Ok((n, from)) => {
                    c.recv.commit(n);
                    if let Some(peer) = from {
                        c.peer = Some(peer);
                    }
                    if c.is_hexdumping {
                        debug!(id = c.id, "recv {n}\n{}", hexdump(&c.recv.as_slice()[c.recv.len() - n..]));
                    }
                    self.deliver(c, &Event::Read(n));
                    if c.is_closing {
                        return;
                    }
                }
                Err(ref e) if sock::would_block(e) => {
                    c.is_readable = false;
                    return;
                }
                Err(e) => {
                    self.error(c, format!("read failed: {e}"));
                    return;
                }
            }
        }
    }

    fn write_loop(&mut self, c: &mut Connection) {
        while c.send.len() > 0 && c.is_writable && !c.is_closing {
            let result = {
                let data = c.send.as_slice();
                match (c.sock.as_mut(), c.tls.as_mut()) {
                    (Some(Socket::Tcp(stream)), Some(tls)) => tls.write(stream, data),
                    (Some(sock), _) => {
                        // only unconnected sockets (UDP listeners) need an
                        // explicit destination
                        let to = if c.is_udp && c.role == Role::Listener {
                            c.peer
                        } else {
                            None
                        };
                        sock.send(data, to)
                    }
                    (None, _) => return,
                }
            };
            match result {
                Ok(0) => return,
                Ok(n) => {
                    if c.is_hexdumping {
                        debug!(id = c.id, "sent {n}\n{}", hexdump(&c.send.as_slice()[..n]));
                    }
                    c.send.delete(0, n);
                    self.deliver(c, &Event::Write(n));
                }
                Err(ref e) if sock::would_block(e) => {
                    c.is_writable = false;
                    return;
                }
                Err(e) => {
                    self.error(c, format!("write failed: {e}"));
                    return;
                }
            }
        }
    }

    fn close_conn(&mut self, id: u64) {
        let Some(mut c) = self.conns.remove(&id) else { return };
        self.order.retain(|&x| x != id);
        if c.is_resolving {
            self.dns.cancel(id);
        }
        self.deliver(&mut c, &Event::Close);
        if let Some(mut sock) = c.sock.take() {
            sock.deregister(self.driver.registry());
        }
        debug!(id, "closed");
    }
}

impl Drop for Manager {
    /// Closing the manager closes every connection, delivering `Close`
    /// first
    fn drop(&mut self) {
        let ids = self.order.clone();
        for id in ids {
            self.close_conn(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::connection::handler;

    #[test]
    fn staged_failure_surfaces_error_then_close() {
        let mut mgr = Manager::new().unwrap();
        let events = Rc::new(RefCell::new(Vec::new()));
        let log = events.clone();
        let (id, _wakeup) = mgr
            .make_pipe(handler(move |_mgr, _c, ev| match ev {
                Event::Error(msg) => log.borrow_mut().push(msg.clone()),
                Event::Close => log.borrow_mut().push("close".into()),
                _ => {}
            }))
            .unwrap();
        mgr.conn_mut(id).unwrap().defer_error("send failed: buffer allocation failed");
        mgr.poll(10);
        assert_eq!(
            events.borrow().as_slice(),
            ["send failed: buffer allocation failed", "close"]
        );
        assert!(!mgr.is_open(id));
    }

    #[test]
    fn failed_connection_refuses_further_sends() {
        let mut mgr = Manager::new().unwrap();
        let (id, _wakeup) = mgr.make_pipe(handler(|_, _, _| {})).unwrap();
        let c = mgr.conn_mut(id).unwrap();
        assert!(c.send_bytes(b"ok"));
        c.defer_error("send failed: buffer allocation failed");
        assert!(!c.send_bytes(b"more"));
        assert_eq!(c.send_pending(), 2);
    }
}

/// Classic offset/hex/ascii dump used by `is_hexdumping` connections
fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, row) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:04x}   ", i * 16);
        for j in 0..16 {
            match row.get(j) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push(' ');
        for &b in row {
            out.push(if (0x20..0x7f).contains(&b) { b as char } else { '.' });
        }
        out.push('\n');
    }
    out
}
