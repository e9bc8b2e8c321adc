//! WebSocket engine (RFC 6455)
//!
//! Server upgrade, client handshake, frame codec with masking and
//! fragmentation. A completed fragmented message is compacted in the
//! receive buffer as fragments arrive: non-final frame headers are
//! stripped and the data bytes accumulate behind a single flags byte, so
//! the final continuation delivers one contiguous span.

use std::ops::Range;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::connection::{Connection, EventFn, Proto};
use crate::event::Event;
use crate::http::{self, HttpMessage};
use crate::manager::{Error, Manager};
use crate::url::Url;

pub const OP_CONTINUE: u8 = 0;
pub const OP_TEXT: u8 = 1;
pub const OP_BINARY: u8 = 2;
pub const OP_CLOSE: u8 = 8;
pub const OP_PING: u8 = 9;
pub const OP_PONG: u8 = 10;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// One delivered frame: a data span into `recv` plus the raw flags byte
/// (FIN bit and opcode as received)
#[derive(Debug, Clone, Default)]
pub struct WsMessage {
    pub data: Range<usize>,
    pub flags: u8,
}

impl WsMessage {
    pub fn fin(&self) -> bool {
        self.flags & 0x80 != 0
    }

    pub fn op(&self) -> u8 {
        self.flags & 0x0F
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WsState {
    /// End of the compacted fragment run in `recv`
    frag_ofs: usize,
    /// Expected `Sec-WebSocket-Accept` while a client handshake is in
    /// flight
    accept: Option<[u8; 28]>,
}

fn state(c: &Connection) -> WsState {
    match c.proto {
        Proto::Ws(s) => s,
        _ => WsState::default(),
    }
}

fn set_state(c: &mut Connection, st: WsState) {
    if let Proto::Ws(ref mut s) = c.proto {
        *s = st;
    }
}

pub(crate) struct Frame {
    flags: u8,
    header_len: usize,
    data_len: usize,
    mask: Option<[u8; 4]>,
}

/// Decode one frame header; `None` until the whole frame is buffered
pub(crate) fn parse_frame(buf: &[u8]) -> Option<Frame> {
    if buf.len() < 2 {
        return None;
    }
    let flags = buf[0];
    let mask_len = if buf[1] & 0x80 != 0 { 4 } else { 0 };
    let (header_len, data_len) = match (buf[1] & 0x7F) as usize {
        n @ 0..=125 => (2 + mask_len, n),
        126 => {
            if buf.len() < 4 + mask_len {
                return None;
            }
            (4 + mask_len, u16::from_be_bytes([buf[2], buf[3]]) as usize)
        }
        _ => {
            if buf.len() < 10 + mask_len {
                return None;
            }
            let n = u64::from_be_bytes(buf[2..10].try_into().unwrap());
            (10 + mask_len, n as usize)
        }
    };
    if buf.len() < header_len + data_len {
        return None;
    }
    let mask = (mask_len == 4).then(|| buf[header_len - 4..header_len].try_into().unwrap());
    Some(Frame {
        flags,
        header_len,
        data_len,
        mask,
    })
}

fn make_header(len: usize, op: u8, client: bool, out: &mut Vec<u8>) {
    out.push(op | 0x80);
    if len < 126 {
        out.push(len as u8);
    } else if len < 65536 {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    if client {
        out[1] |= 0x80;
        let mut mask = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut mask);
        out.extend_from_slice(&mask);
    }
}

/// XOR the trailing `len` bytes of the send queue with the mask key that
/// sits just before them
fn mask_tail(c: &mut Connection, len: usize) {
    let buf = c.send.as_mut_slice();
    let total = buf.len();
    if len > total || total - len < 4 {
        return;
    }
    let (head, data) = buf.split_at_mut(total - len);
    let mask: [u8; 4] = head[head.len() - 4..].try_into().unwrap();
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[i & 3];
    }
}

/// Queue one frame carrying `data`; client connections mask it. Returns
/// the framed length.
pub fn send(c: &mut Connection, data: &[u8], op: u8) -> usize {
    let client = c.is_client();
    let mut header = Vec::with_capacity(14);
    make_header(data.len(), op, client, &mut header);
    c.send_bytes(&header);
    c.send_bytes(data);
    if client {
        mask_tail(c, data.len());
    }
    header.len() + data.len()
}

/// Wrap the last `len` bytes already queued in `send` as one frame, in
/// place; used to tunnel other protocols over an established WebSocket.
/// Returns the new send-queue length. If the header cannot be inserted
/// the unframed payload is discarded and the connection fails with
/// `Event::Error`.
pub fn wrap(c: &mut Connection, len: usize, op: u8) -> usize {
    let len = len.min(c.send.len());
    let client = c.is_client();
    let mut header = Vec::with_capacity(14);
    make_header(len, op, client, &mut header);
    let pos = c.send.len() - len;
    let align = c.io_size;
    if let Err(e) = c.send.insert(pos, &header, align) {
        // never let headerless payload bytes reach the wire
        c.send.delete(pos, len);
        c.defer_error(format!("send failed: {e}"));
        return c.send.len();
    }
    if client {
        mask_tail(c, len);
    }
    c.send.len()
}

fn accept_key(key: &[u8]) -> [u8; 28] {
    let mut sha = Sha1::new();
    sha.update(key);
    sha.update(GUID);
    let digest = sha.finalize();
    let mut out = [0u8; 28];
    let n = BASE64
        .encode_slice(digest, &mut out)
        .expect("20-byte digest always encodes to 28");
    debug_assert_eq!(n, 28);
    out
}

/// Upgrade a server connection from inside its `HttpMsg` handler. Replies
/// `101` with the computed accept key plus `extra_headers`, switches the
/// connection to the WebSocket engine and emits `WsOpen`; requests without
/// `Sec-WebSocket-Key` get `426` and a drain.
pub fn upgrade(mgr: &mut Manager, c: &mut Connection, m: &HttpMessage, extra_headers: &str) {
    let key = m.header(c.recv.as_slice(), "Sec-WebSocket-Key").map(<[u8]>::to_vec);
    match key {
        None => {
            http::reply(c, 426, "", "WebSocket upgrade expected\n");
            c.drain();
        }
        Some(key) => {
            let accept = accept_key(&key);
            c.send_fmt(format_args!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\
                 {}\r\n",
                std::str::from_utf8(&accept).unwrap_or(""),
                extra_headers
            ));
            c.proto = Proto::Ws(WsState::default());
            c.is_websocket = true;
            mgr.deliver(c, &Event::WsOpen(m.clone()));
        }
    }
}

/// Connect a WebSocket client. The upgrade request is queued immediately
/// with a random key; `WsOpen` fires once the `101` response verifies.
pub fn connect(
    mgr: &mut Manager,
    url: &str,
    handler: EventFn,
    extra_headers: &str,
) -> Result<u64, Error> {
    let u = Url::parse(url)?;
    let (host, uri) = (u.host.to_owned(), u.uri.to_owned());
    let id = mgr.connect(url, handler)?;
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let key = BASE64.encode(nonce);
    let accept = accept_key(key.as_bytes());
    if let Some(c) = mgr.conn_mut(id) {
        c.send_fmt(format_args!(
            "GET {uri} HTTP/1.1\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Host: {host}\r\n\
             {extra_headers}\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {key}\r\n\r\n"
        ));
        c.proto = Proto::Ws(WsState {
            frag_ofs: 0,
            accept: Some(accept),
        });
    }
    Ok(id)
}

/// Protocol stage for WebSocket connections
pub(crate) fn cb(mgr: &mut Manager, c: &mut Connection, ev: &Event) {
    if !matches!(ev, Event::Read(_)) {
        return;
    }
    if !c.is_websocket {
        if c.is_client() {
            client_handshake(mgr, c);
        }
        if !c.is_websocket {
            return;
        }
    }
    frames(mgr, c);
}

fn client_handshake(mgr: &mut Manager, c: &mut Connection) {
    let head = match http::request_len(c.recv.as_slice()) {
        Ok(Some(n)) => n,
        Ok(None) => return,
        Err(_) => {
            mgr.error(c, "not an HTTP response");
            return;
        }
    };
    let m = match http::parse(c.recv.as_slice()) {
        Ok(Some(m)) => m,
        _ => {
            mgr.error(c, "bad handshake response");
            return;
        }
    };
    let st = state(c);
    let buf = c.recv.as_slice();
    let verified = m.status(buf) == 101
        && st
            .accept
            .is_some_and(|exp| m.header(buf, "Sec-WebSocket-Accept") == Some(&exp[..]));
    if !verified {
        mgr.error(c, "WebSocket handshake failed");
        return;
    }
    c.is_websocket = true;
    set_state(
        c,
        WsState {
            frag_ofs: 0,
            accept: None,
        },
    );
    mgr.deliver(c, &Event::WsOpen(m));
    c.recv.delete(0, head);
}

fn frames(mgr: &mut Manager, c: &mut Connection) {
    let mut ofs = state(c).frag_ofs;
    loop {
        let Some(f) = parse_frame(&c.recv.as_slice()[ofs..]) else {
            break;
        };
        if let Some(mask) = f.mask {
            let data =
                &mut c.recv.as_mut_slice()[ofs + f.header_len..ofs + f.header_len + f.data_len];
            for (i, b) in data.iter_mut().enumerate() {
                *b ^= mask[i & 3];
            }
        }
        let fin = f.flags & 0x80 != 0;
        let op = f.flags & 0x0F;
        let data_start = ofs + f.header_len;
        let msg = WsMessage {
            data: data_start..data_start + f.data_len,
            flags: f.flags,
        };
        let mut len = f.header_len + f.data_len;
        let mut header_len = f.header_len;
        match op {
            OP_CONTINUE => mgr.deliver(c, &Event::WsCtl(msg)),
            OP_PING => {
                debug!(id = c.id(), "ws ping, answering");
                let payload = c.recv.as_slice()[data_start..data_start + f.data_len].to_vec();
                send(c, &payload, OP_PONG);
                mgr.deliver(c, &Event::WsCtl(msg));
            }
            OP_PONG => mgr.deliver(c, &Event::WsCtl(msg)),
            OP_TEXT | OP_BINARY => {
                if fin {
                    mgr.deliver(c, &Event::WsMsg(msg));
                }
            }
            OP_CLOSE => {
                debug!(id = c.id(), "ws close received");
                let payload = c.recv.as_slice()[data_start..data_start + f.data_len].to_vec();
                mgr.deliver(c, &Event::WsCtl(msg));
                if !c.is_closing {
                    send(c, &payload, OP_CLOSE);
                }
                c.drain();
            }
            _ => {
                mgr.error(c, format!("unknown WS op {op}"));
                break;
            }
        }
        if c.is_closing || c.is_draining {
            break;
        }
        // fragment compaction: keep the first frame's flags byte, strip
        // headers, let the data run grow in place
        if !fin || op == OP_CONTINUE {
            if op != OP_CONTINUE {
                ofs += 1;
                len -= 1;
                header_len -= 1;
            }
            c.recv.delete(ofs, header_len);
            len -= header_len;
            ofs += len;
        }
        if fin && op != OP_CONTINUE {
            c.recv.delete(ofs, len);
        }
        if fin && op == OP_CONTINUE {
            let flags = c.recv.as_slice()[0];
            let whole = WsMessage {
                data: 1..ofs,
                flags,
            };
            mgr.deliver(c, &Event::WsMsg(whole));
            c.recv.delete(0, ofs);
            ofs = 0;
            if c.is_closing {
                break;
            }
        }
    }
    let mut st = state(c);
    st.frag_ofs = ofs;
    set_state(c, st);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Role;

    #[test]
    fn accept_key_rfc_vector() {
        let key = accept_key(b"dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(&key[..], b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    fn frame_bytes(data: &[u8], op: u8, client: bool) -> Vec<u8> {
        let mut out = Vec::new();
        make_header(data.len(), op, client, &mut out);
        let start = out.len();
        out.extend_from_slice(data);
        if client {
            let mask: [u8; 4] = out[start - 4..start].try_into().unwrap();
            for i in 0..data.len() {
                out[start + i] ^= mask[i & 3];
            }
        }
        out
    }

    #[test]
    fn unmasked_round_trip() {
        for len in [0usize, 1, 125, 126, 65535, 65536, 70_000] {
            let data = vec![0x5Au8; len];
            let wire = frame_bytes(&data, OP_BINARY, false);
            let f = parse_frame(&wire).unwrap();
            assert_eq!(f.flags, 0x80 | OP_BINARY);
            assert_eq!(f.data_len, len, "len {len}");
            assert!(f.mask.is_none());
            assert_eq!(&wire[f.header_len..f.header_len + f.data_len], &data[..]);
        }
    }

    #[test]
    fn masked_round_trip() {
        let data = b"hi there";
        let mut wire = frame_bytes(data, OP_TEXT, true);
        let f = parse_frame(&wire).unwrap();
        let mask = f.mask.expect("client frames are masked");
        for i in 0..f.data_len {
            wire[f.header_len + i] ^= mask[i & 3];
        }
        assert_eq!(&wire[f.header_len..f.header_len + f.data_len], data);
    }

    #[test]
    fn incomplete_frames() {
        let wire = frame_bytes(b"hello", OP_TEXT, false);
        for cut in 0..wire.len() {
            assert!(parse_frame(&wire[..cut]).is_none(), "cut {cut}");
        }
        assert!(parse_frame(&wire).is_some());
    }

    #[test]
    fn send_masks_client_frames() {
        let mut c = Connection::new(1, Role::Client, 2048);
        send(&mut c, b"abc", OP_TEXT);
        let wire = c.send.as_slice().to_vec();
        let f = parse_frame(&wire).unwrap();
        let mask = f.mask.unwrap();
        let recovered: Vec<u8> = wire[f.header_len..]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[i & 3])
            .collect();
        assert_eq!(recovered, b"abc");
    }

    #[test]
    fn wrap_frames_in_place() {
        let mut c = Connection::new(1, Role::Accepted, 2048);
        c.send_bytes(b"PING\r\n");
        let total = wrap(&mut c, 6, OP_BINARY);
        assert_eq!(total, 8);
        let wire = c.send.as_slice();
        let f = parse_frame(wire).unwrap();
        assert_eq!(f.data_len, 6);
        assert_eq!(&wire[f.header_len..], b"PING\r\n");
    }
}
