use crate::http::HttpMessage;
use crate::mqtt::MqttMessage;
use crate::sntp::SntpTime;
use crate::ws::WsMessage;

/// Events delivered to connection handlers
///
/// The protocol stage of a connection sees every event before the user
/// handler does, and may synthesize the higher-level variants
/// (`HttpMsg`, `WsMsg`, ...) re-entrantly through [`Manager::deliver`].
///
/// Message payloads are byte spans into the connection's `recv` buffer at
/// delivery time; they are consumed by the protocol stage once the user
/// handler returns, so copy anything that must outlive the callback.
///
/// [`Manager::deliver`]: crate::Manager::deliver
#[derive(Debug, Clone)]
pub enum Event {
    /// Something went wrong on this connection; a close follows
    Error(String),
    /// End of a poll step for this connection; carries manager uptime in ms
    Poll(u64),
    /// DNS resolution finished; connect is starting
    Resolve,
    /// Outgoing connection (and TLS handshake, if any) established
    Connect,
    /// A listener produced this connection
    Accept,
    /// Bytes were appended to `recv`; carries the byte count of this read
    Read(usize),
    /// Bytes were flushed from `send`; carries the byte count written
    Write(usize),
    /// Delivered exactly once, just before the connection is destroyed
    Close,
    /// A complete HTTP request or response
    HttpMsg(HttpMessage),
    /// One decoded chunk of a `Transfer-Encoding: chunked` body
    HttpChunk(HttpMessage),
    /// WebSocket handshake completed; carries the upgrade request/response
    WsOpen(HttpMessage),
    /// A final data frame (or completed fragmented message)
    WsMsg(WsMessage),
    /// A WebSocket control frame (close, ping, pong, continuation)
    WsCtl(WsMessage),
    /// Any parsed MQTT packet, delivered before the specific event
    MqttCmd(MqttMessage),
    /// An MQTT PUBLISH
    MqttMsg(MqttMessage),
    /// CONNACK received; carries the return code
    MqttOpen(u8),
    /// A valid SNTP server reply
    SntpTime(SntpTime),
    /// Application-defined event, injected via [`Manager::deliver`]
    ///
    /// [`Manager::deliver`]: crate::Manager::deliver
    User(u64),
}

impl Event {
    /// First code available for application-defined events
    pub const USER: u8 = 17;

    /// Stable numeric code of this event
    pub fn code(&self) -> u8 {
        match self {
            Event::Error(_) => 0,
            Event::Poll(_) => 1,
            Event::Resolve => 2,
            Event::Connect => 3,
            Event::Accept => 4,
            Event::Read(_) => 5,
            Event::Write(_) => 6,
            Event::Close => 7,
            Event::HttpMsg(_) => 8,
            Event::HttpChunk(_) => 9,
            Event::WsOpen(_) => 10,
            Event::WsMsg(_) => 11,
            Event::WsCtl(_) => 12,
            Event::MqttCmd(_) => 13,
            Event::MqttMsg(_) => 14,
            Event::MqttOpen(_) => 15,
            Event::SntpTime(_) => 16,
            Event::User(_) => Self::USER,
        }
    }
}
