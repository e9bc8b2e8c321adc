//! Non-blocking DNS client
//!
//! One UDP socket per address family, shared by every in-flight query. The
//! manager advances resolution as part of its poll step: responses move the
//! owning connection from `resolving` to `connecting`, a missed deadline
//! retransmits once and then fails the connection. Malformed responses are
//! ignored and fall under the same deadline.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut};
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use rand::Rng;
use tracing::{debug, trace, warn};

pub(crate) const TOKEN4: Token = Token(0);
pub(crate) const TOKEN6: Token = Token(1);

pub(crate) const QTYPE_A: u16 = 1;
pub(crate) const QTYPE_AAAA: u16 = 28;

const RCODE_NXDOMAIN: u8 = 3;

struct Query {
    conn_id: u64,
    server: SocketAddr,
    packet: Vec<u8>,
    deadline: Instant,
    retransmit_at: Instant,
    retried: bool,
}

/// Result of one resolution attempt, handed back to the manager
pub(crate) enum Outcome {
    Resolved(u64, IpAddr),
    Failed(u64, &'static str),
}

#[derive(Default)]
pub(crate) struct DnsClient {
    sock4: Option<UdpSocket>,
    sock6: Option<UdpSocket>,
    pending: HashMap<u16, Query>,
}

impl DnsClient {
    /// Send a query for `host` on behalf of connection `conn_id`
    pub(crate) fn resolve(
        &mut self,
        registry: &Registry,
        conn_id: u64,
        host: &str,
        qtype: u16,
        server: SocketAddr,
        timeout: Duration,
    ) -> io::Result<()> {
        let mut tx_id = rand::thread_rng().gen::<u16>();
        while self.pending.contains_key(&tx_id) {
            tx_id = tx_id.wrapping_add(1);
        }
        let packet = build_query(tx_id, host, qtype)?;
        let sock = self.socket_for(registry, &server)?;
        sock.send_to(&packet, server)?;
        let now = Instant::now();
        debug!(conn_id, host, tx_id, "dns query sent");
        self.pending.insert(
            tx_id,
            Query {
                conn_id,
                server,
                packet,
                deadline: now + timeout,
                retransmit_at: now + timeout / 2,
                retried: false,
            },
        );
        Ok(())
    }

    /// Drop state for a connection that went away while resolving
    pub(crate) fn cancel(&mut self, conn_id: u64) {
        self.pending.retain(|_, q| q.conn_id != conn_id);
    }

    /// Deadline bookkeeping: retransmit at the halfway mark, fail at the
    /// deadline
    pub(crate) fn tick(&mut self, now: Instant, out: &mut Vec<Outcome>) {
        let mut expired = Vec::new();
        for (&tx_id, q) in self.pending.iter_mut() {
            if now >= q.deadline {
                expired.push(tx_id);
            } else if !q.retried && now >= q.retransmit_at {
                q.retried = true;
                let sock = match q.server {
                    SocketAddr::V4(_) => self.sock4.as_ref(),
                    SocketAddr::V6(_) => self.sock6.as_ref(),
                };
                if let Some(sock) = sock {
                    trace!(tx_id, "dns retransmit");
                    let _ = sock.send_to(&q.packet, q.server);
                }
            }
        }
        for tx_id in expired {
            let q = self.pending.remove(&tx_id).unwrap();
            out.push(Outcome::Failed(q.conn_id, "DNS timeout"));
        }
    }

    /// Drain responses from one of the resolver sockets
    pub(crate) fn drain(&mut self, token: Token, out: &mut Vec<Outcome>) {
        let sock = match token {
            TOKEN4 => self.sock4.as_ref(),
            _ => self.sock6.as_ref(),
        };
        let Some(sock) = sock else { return };
        let mut buf = [0u8; 2048];
        loop {
            let n = match sock.recv_from(&mut buf) {
                Ok((n, _)) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("dns socket error: {e}");
                    break;
                }
            };
            let Some(reply) = parse_reply(&buf[..n]) else {
                trace!("ignoring malformed dns response");
                continue;
            };
            let Some(q) = self.pending.remove(&reply.tx_id) else {
                continue;
            };
            if reply.rcode == RCODE_NXDOMAIN {
                out.push(Outcome::Failed(q.conn_id, "DNS error"));
            } else if let Some(ip) = reply.ip {
                out.push(Outcome::Resolved(q.conn_id, ip));
            } else {
                // answerless reply; keep waiting for the deadline
                self.pending.insert(reply.tx_id, q);
            }
        }
    }

    fn socket_for(&mut self, registry: &Registry, server: &SocketAddr) -> io::Result<&UdpSocket> {
        match server {
            SocketAddr::V4(_) => {
                if self.sock4.is_none() {
                    let mut sock =
                        UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
                    registry.register(&mut sock, TOKEN4, Interest::READABLE)?;
                    self.sock4 = Some(sock);
                }
                Ok(self.sock4.as_ref().unwrap())
            }
            SocketAddr::V6(_) => {
                if self.sock6.is_none() {
                    let mut sock =
                        UdpSocket::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0))?;
                    registry.register(&mut sock, TOKEN6, Interest::READABLE)?;
                    self.sock6 = Some(sock);
                }
                Ok(self.sock6.as_ref().unwrap())
            }
        }
    }
}

/// Build a single-question query with recursion desired
pub(crate) fn build_query(tx_id: u16, host: &str, qtype: u16) -> io::Result<Vec<u8>> {
    let mut pkt = Vec::with_capacity(32 + host.len());
    pkt.put_u16(tx_id);
    pkt.put_u16(0x0100);
    pkt.put_u16(1); // questions
    pkt.put_u16(0);
    pkt.put_u16(0);
    pkt.put_u16(0);
    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad hostname: {host}"),
            ));
        }
        pkt.put_u8(label.len() as u8);
        pkt.put_slice(label.as_bytes());
    }
    pkt.put_u8(0);
    pkt.put_u16(qtype);
    pkt.put_u16(1); // IN
    Ok(pkt)
}

pub(crate) struct Reply {
    pub(crate) tx_id: u16,
    pub(crate) rcode: u8,
    pub(crate) ip: Option<IpAddr>,
}

/// Parse a response; `None` means malformed (ignored by the caller).
/// The first A or AAAA record of the answer section wins.
pub(crate) fn parse_reply(pkt: &[u8]) -> Option<Reply> {
    let mut buf = pkt;
    if buf.remaining() < 12 {
        return None;
    }
    let tx_id = buf.get_u16();
    let flags = buf.get_u16();
    if flags & 0x8000 == 0 {
        return None; // not a response
    }
    let questions = buf.get_u16();
    let answers = buf.get_u16();
    buf.advance(4); // authority + additional counts
    for _ in 0..questions {
        skip_name(&mut buf)?;
        if buf.remaining() < 4 {
            return None;
        }
        buf.advance(4);
    }
    let mut ip = None;
    for _ in 0..answers {
        skip_name(&mut buf)?;
        if buf.remaining() < 10 {
            return None;
        }
        let rtype = buf.get_u16();
        buf.advance(6); // class + ttl
        let rdlen = buf.get_u16() as usize;
        if buf.remaining() < rdlen {
            return None;
        }
        match (rtype, rdlen) {
            (QTYPE_A, 4) if ip.is_none() => {
                let mut v4 = [0u8; 4];
                buf.copy_to_slice(&mut v4);
                ip = Some(IpAddr::V4(Ipv4Addr::from(v4)));
            }
            (QTYPE_AAAA, 16) if ip.is_none() => {
                let mut v6 = [0u8; 16];
                buf.copy_to_slice(&mut v6);
                ip = Some(IpAddr::V6(Ipv6Addr::from(v6)));
            }
            _ => buf.advance(rdlen),
        }
    }
    Some(Reply {
        tx_id,
        rcode: (flags & 0x000F) as u8,
        ip,
    })
}

/// Skip a possibly-compressed name
fn skip_name(buf: &mut &[u8]) -> Option<()> {
    loop {
        if buf.remaining() < 1 {
            return None;
        }
        let len = buf.get_u8();
        if len == 0 {
            return Some(());
        }
        if len & 0xC0 == 0xC0 {
            // compression pointer: one more byte, then done
            if buf.remaining() < 1 {
                return None;
            }
            buf.advance(1);
            return Some(());
        }
        if buf.remaining() < len as usize {
            return None;
        }
        buf.advance(len as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn query_layout() {
        let q = build_query(0x1234, "a.io", QTYPE_A).unwrap();
        // header, qname "a.io", A IN
        assert_eq!(
            q,
            hex!("1234 0100 0001 0000 0000 0000 01 61 02 696f 00 0001 0001")
        );
        assert!(build_query(1, "bad..name", QTYPE_A).is_err());
    }

    #[test]
    fn reply_with_compressed_name() {
        // response to "a.io A?" with one A record via a name pointer
        let mut pkt = Vec::new();
        pkt.put_u16(0x1234);
        pkt.put_u16(0x8180);
        pkt.put_u16(1);
        pkt.put_u16(1);
        pkt.put_u32(0);
        pkt.extend_from_slice(&[1, b'a', 2, b'i', b'o', 0]);
        pkt.put_u16(QTYPE_A);
        pkt.put_u16(1);
        pkt.extend_from_slice(&[0xC0, 0x0C]); // pointer to offset 12
        pkt.put_u16(QTYPE_A);
        pkt.put_u16(1);
        pkt.put_u32(60);
        pkt.put_u16(4);
        pkt.extend_from_slice(&[127, 0, 0, 1]);

        let r = parse_reply(&pkt).unwrap();
        assert_eq!(r.tx_id, 0x1234);
        assert_eq!(r.rcode, 0);
        assert_eq!(r.ip, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn nxdomain_and_truncated() {
        let mut pkt = Vec::new();
        pkt.put_u16(7);
        pkt.put_u16(0x8183); // rcode 3
        pkt.put_u16(0);
        pkt.put_u16(0);
        pkt.put_u32(0);
        let r = parse_reply(&pkt).unwrap();
        assert_eq!(r.rcode, RCODE_NXDOMAIN);
        assert!(r.ip.is_none());

        assert!(parse_reply(&pkt[..7]).is_none());
        assert!(parse_reply(&[0x00, 0x01, 0x01, 0x00, 0, 0, 0, 0, 0, 0, 0, 0]).is_none());
    }
}
