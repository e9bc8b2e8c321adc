//! MQTT 3.1.1 engine
//!
//! Packet codec (fixed header plus the 1–4 byte remaining-length integer),
//! client login/publish/subscribe helpers and QoS 1/2 acknowledgement
//! automation. Server-side use parses every packet and leaves the broker
//! logic to the application.

use std::ops::Range;

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::connection::{Connection, EventFn, Proto};
use crate::event::Event;
use crate::manager::{Error, Manager};
use crate::url::Url;

pub const CMD_CONNECT: u8 = 1;
pub const CMD_CONNACK: u8 = 2;
pub const CMD_PUBLISH: u8 = 3;
pub const CMD_PUBACK: u8 = 4;
pub const CMD_PUBREC: u8 = 5;
pub const CMD_PUBREL: u8 = 6;
pub const CMD_PUBCOMP: u8 = 7;
pub const CMD_SUBSCRIBE: u8 = 8;
pub const CMD_SUBACK: u8 = 9;
pub const CMD_UNSUBSCRIBE: u8 = 10;
pub const CMD_UNSUBACK: u8 = 11;
pub const CMD_PINGREQ: u8 = 12;
pub const CMD_PINGRESP: u8 = 13;
pub const CMD_DISCONNECT: u8 = 14;

/// Remaining-length ceiling: four 7-bit groups
pub const MAX_REMAINING_LEN: u32 = 268_435_455;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed MQTT packet")]
    Malformed,
}

/// One parsed packet; spans index into the buffer it was parsed from
#[derive(Debug, Clone, Default)]
pub struct MqttMessage {
    pub cmd: u8,
    /// Low nibble of the fixed header
    pub flags: u8,
    pub qos: u8,
    /// Packet id, 0 when the packet type carries none
    pub id: u16,
    pub topic: Range<usize>,
    pub payload: Range<usize>,
    /// CONNACK return code
    pub ack: u8,
    /// Total packet length, fixed header included
    pub len: usize,
}

/// Decode a remaining-length integer: `Ok(None)` while truncated, error on
/// a continuation bit in the fourth byte
pub fn decode_len(buf: &[u8]) -> Result<Option<(u32, usize)>, ParseError> {
    let mut value = 0u32;
    for i in 0..4 {
        let Some(&b) = buf.get(i) else {
            return Ok(None);
        };
        value |= ((b & 0x7F) as u32) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Err(ParseError::Malformed)
}

pub fn encode_len(mut n: u32, out: &mut Vec<u8>) {
    loop {
        let mut byte = (n % 128) as u8;
        n /= 128;
        if n > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if n == 0 {
            break;
        }
    }
}

/// Parse one packet out of `buf`; `Ok(None)` until it is fully buffered
pub fn parse(buf: &[u8]) -> Result<Option<MqttMessage>, ParseError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let cmd = buf[0] >> 4;
    let flags = buf[0] & 0x0F;
    if cmd == 0 {
        return Err(ParseError::Malformed);
    }
    let (remaining, len_size) = match decode_len(&buf[1..])? {
        Some(x) => x,
        None => return Ok(None),
    };
    let base = 1 + len_size;
    let total = base + remaining as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let body = &buf[base..total];
    let mut m = MqttMessage {
        cmd,
        flags,
        qos: (flags >> 1) & 3,
        len: total,
        topic: base..base,
        payload: base..base,
        ..Default::default()
    };
    match cmd {
        CMD_CONNACK => {
            if body.len() < 2 {
                return Err(ParseError::Malformed);
            }
            m.ack = body[1];
        }
        CMD_PUBLISH => {
            if body.len() < 2 {
                return Err(ParseError::Malformed);
            }
            let tlen = u16::from_be_bytes([body[0], body[1]]) as usize;
            let mut pos = 2 + tlen;
            if body.len() < pos {
                return Err(ParseError::Malformed);
            }
            m.topic = base + 2..base + 2 + tlen;
            if m.qos > 0 {
                if body.len() < pos + 2 {
                    return Err(ParseError::Malformed);
                }
                m.id = u16::from_be_bytes([body[pos], body[pos + 1]]);
                pos += 2;
            }
            m.payload = base + pos..total;
        }
        CMD_PUBACK | CMD_PUBREC | CMD_PUBREL | CMD_PUBCOMP | CMD_SUBACK | CMD_UNSUBACK
        | CMD_SUBSCRIBE | CMD_UNSUBSCRIBE => {
            if body.len() < 2 {
                return Err(ParseError::Malformed);
            }
            m.id = u16::from_be_bytes([body[0], body[1]]);
            m.payload = base + 2..total;
        }
        _ => {
            m.payload = base..total;
        }
    }
    Ok(Some(m))
}

/// Walk the topic list of a SUBSCRIBE packet. `pos` starts at 4 (fixed
/// header plus packet id); feed the returned position back in. Returns
/// `(next_pos, topic_span, qos)`.
pub fn next_sub(packet: &[u8], pos: usize) -> Option<(usize, Range<usize>, u8)> {
    let (next, topic) = read_topic(packet, pos)?;
    let qos = *packet.get(next)?;
    Some((next + 1, topic, qos & 3))
}

/// Walk the topic list of an UNSUBSCRIBE packet; same contract as
/// [`next_sub`] without the qos byte
pub fn next_unsub(packet: &[u8], pos: usize) -> Option<(usize, Range<usize>)> {
    read_topic(packet, pos)
}

fn read_topic(packet: &[u8], pos: usize) -> Option<(usize, Range<usize>)> {
    if packet.len() < pos + 2 {
        return None;
    }
    let len = u16::from_be_bytes([packet[pos], packet[pos + 1]]) as usize;
    let start = pos + 2;
    if packet.len() < start + len {
        return None;
    }
    Some((start + len, start..start + len))
}

/// CONNECT options; empty credentials fall back to the URL's userinfo
#[derive(Debug, Clone)]
pub struct MqttOpts {
    pub client_id: String,
    pub user: String,
    pub pass: String,
    pub clean: bool,
    pub keepalive: u16,
    pub will_topic: String,
    pub will_message: String,
    pub will_qos: u8,
    pub will_retain: bool,
}

impl Default for MqttOpts {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            user: String::new(),
            pass: String::new(),
            clean: true,
            keepalive: 60,
            will_topic: String::new(),
            will_message: String::new(),
            will_qos: 0,
            will_retain: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MqttState {
    next_id: u16,
}

/// Next packet id: monotonic per connection, wrapping past 0xFFFF to 1
fn alloc_id(c: &mut Connection) -> u16 {
    let mut st = match c.proto {
        Proto::Mqtt(s) => s,
        _ => MqttState::default(),
    };
    st.next_id = if st.next_id >= 0xFFFF { 1 } else { st.next_id + 1 };
    if let Proto::Mqtt(ref mut s) = c.proto {
        *s = st;
    }
    st.next_id
}

/// Queue one packet with the given fixed-header nibbles and body
pub fn send_packet(c: &mut Connection, cmd: u8, flags: u8, body: &[u8]) {
    let mut pkt = Vec::with_capacity(body.len() + 5);
    pkt.push(cmd << 4 | (flags & 0x0F));
    encode_len(body.len() as u32, &mut pkt);
    pkt.extend_from_slice(body);
    c.send_bytes(&pkt);
}

fn send_ack(c: &mut Connection, cmd: u8, flags: u8, id: u16) {
    send_packet(c, cmd, flags, &id.to_be_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Queue a CONNECT packet built from `opts`
pub fn login(c: &mut Connection, opts: &MqttOpts) {
    let has_will = !opts.will_topic.is_empty();
    let mut flags = 0u8;
    if opts.clean {
        flags |= 1 << 1;
    }
    if has_will {
        flags |= 1 << 2 | (opts.will_qos & 3) << 3;
        if opts.will_retain {
            flags |= 1 << 5;
        }
    }
    if !opts.pass.is_empty() {
        flags |= 1 << 6;
    }
    if !opts.user.is_empty() {
        flags |= 1 << 7;
    }
    let mut body = Vec::new();
    put_str(&mut body, "MQTT");
    body.push(4); // protocol level
    body.push(flags);
    body.extend_from_slice(&opts.keepalive.to_be_bytes());
    let generated;
    let client_id = if opts.client_id.is_empty() {
        generated = format!("stoat{:08x}", rand::thread_rng().gen::<u32>());
        &generated
    } else {
        &opts.client_id
    };
    put_str(&mut body, client_id);
    if has_will {
        put_str(&mut body, &opts.will_topic);
        put_str(&mut body, &opts.will_message);
    }
    if !opts.user.is_empty() {
        put_str(&mut body, &opts.user);
    }
    if !opts.pass.is_empty() {
        put_str(&mut body, &opts.pass);
    }
    debug!(id = c.id(), client_id = %client_id, "mqtt login");
    send_packet(c, CMD_CONNECT, 0, &body);
}

/// Queue a PUBLISH; returns the packet id (0 for QoS 0)
pub fn publish(c: &mut Connection, topic: &str, payload: &[u8], qos: u8, retain: bool) -> u16 {
    let id = if qos > 0 { alloc_id(c) } else { 0 };
    let mut body = Vec::with_capacity(topic.len() + payload.len() + 4);
    put_str(&mut body, topic);
    if qos > 0 {
        body.extend_from_slice(&id.to_be_bytes());
    }
    body.extend_from_slice(payload);
    send_packet(c, CMD_PUBLISH, (qos & 3) << 1 | retain as u8, &body);
    id
}

/// Queue a SUBSCRIBE for one topic; returns the packet id
pub fn subscribe(c: &mut Connection, topic: &str, qos: u8) -> u16 {
    let id = alloc_id(c);
    let mut body = Vec::with_capacity(topic.len() + 5);
    body.extend_from_slice(&id.to_be_bytes());
    put_str(&mut body, topic);
    body.push(qos & 3);
    send_packet(c, CMD_SUBSCRIBE, 2, &body);
    id
}

/// Queue an UNSUBSCRIBE for one topic; returns the packet id
pub fn unsubscribe(c: &mut Connection, topic: &str) -> u16 {
    let id = alloc_id(c);
    let mut body = Vec::with_capacity(topic.len() + 4);
    body.extend_from_slice(&id.to_be_bytes());
    put_str(&mut body, topic);
    send_packet(c, CMD_UNSUBSCRIBE, 2, &body);
    id
}

pub fn ping(c: &mut Connection) {
    send_packet(c, CMD_PINGREQ, 0, &[]);
}

pub fn pong(c: &mut Connection) {
    send_packet(c, CMD_PINGRESP, 0, &[]);
}

pub fn disconnect(c: &mut Connection) {
    send_packet(c, CMD_DISCONNECT, 0, &[]);
}

/// Connect an MQTT client; the CONNECT packet is queued immediately, with
/// credentials from `opts` or the URL userinfo
pub fn connect(mgr: &mut Manager, url: &str, opts: &MqttOpts, handler: EventFn) -> Result<u64, Error> {
    let u = Url::parse(url)?;
    let mut opts = opts.clone();
    if opts.user.is_empty() {
        opts.user = u.user.to_owned();
        opts.pass = u.pass.to_owned();
    }
    let id = mgr.connect(url, handler)?;
    if let Some(c) = mgr.conn_mut(id) {
        c.proto = Proto::Mqtt(MqttState::default());
        login(c, &opts);
    }
    Ok(id)
}

/// Listen for MQTT clients; the application implements the broker side on
/// top of `MqttCmd` events
pub fn listen(mgr: &mut Manager, url: &str, handler: EventFn) -> Result<u64, Error> {
    let id = mgr.listen(url, handler)?;
    if let Some(c) = mgr.conn_mut(id) {
        c.proto = Proto::Mqtt(MqttState::default());
    }
    Ok(id)
}

/// Protocol stage for MQTT connections
pub(crate) fn cb(mgr: &mut Manager, c: &mut Connection, ev: &Event) {
    if !matches!(ev, Event::Read(_)) {
        return;
    }
    loop {
        if c.is_closing {
            return;
        }
        let m = match parse(c.recv.as_slice()) {
            Ok(Some(m)) => m,
            Ok(None) => return,
            Err(e) => {
                mgr.error(c, e.to_string());
                return;
            }
        };
        mgr.deliver(c, &Event::MqttCmd(m.clone()));
        match m.cmd {
            CMD_CONNACK => mgr.deliver(c, &Event::MqttOpen(m.ack)),
            CMD_PUBLISH => {
                match m.qos {
                    1 => send_ack(c, CMD_PUBACK, 0, m.id),
                    2 => send_ack(c, CMD_PUBREC, 0, m.id),
                    _ => {}
                }
                mgr.deliver(c, &Event::MqttMsg(m.clone()));
            }
            CMD_PUBREC => send_ack(c, CMD_PUBREL, 2, m.id),
            CMD_PUBREL => send_ack(c, CMD_PUBCOMP, 0, m.id),
            CMD_PINGREQ => pong(c),
            _ => {}
        }
        c.recv.delete(0, m.len);
    }
}
