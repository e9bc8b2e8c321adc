use std::any::Any;
use std::fmt::{self, Write as _};
use std::net::SocketAddr;
use std::rc::Rc;

use crate::buffer::IoBuffer;
use crate::event::Event;
use crate::manager::Manager;
use crate::sock::Socket;
use crate::tls::{TlsDriver, TlsError, TlsOpts};
use crate::{http, mqtt, sntp, ws};

/// Connection event callback
///
/// Runs after the protocol stage. The manager hands the connection out of
/// its table for the duration of the call, so the callback may freely use
/// the manager to open, close or write to other connections.
pub type EventFn = Rc<dyn Fn(&mut Manager, &mut Connection, &Event)>;

/// Wrap a closure as an [`EventFn`]
pub fn handler(f: impl Fn(&mut Manager, &mut Connection, &Event) + 'static) -> EventFn {
    Rc::new(f)
}

/// How this connection came to exist. Exactly one role per connection, for
/// its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Bound socket producing accepted connections (or receiving datagrams)
    Listener,
    /// Locally initiated
    Client,
    /// Produced by a listener
    Accepted,
}

/// Protocol engine attached to a connection, with its per-connection state
///
/// The engine sees every event before the user handler and synthesizes the
/// protocol-specific events.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) enum Proto {
    #[default]
    Raw,
    Http(http::HttpState),
    Ws(ws::WsState),
    Mqtt(mqtt::MqttState),
    Sntp(sntp::SntpState),
}

impl Proto {
    /// Same engine, fresh state; listeners stamp this onto accepted
    /// connections
    pub(crate) fn child(&self) -> Proto {
        match self {
            Proto::Raw => Proto::Raw,
            Proto::Http(_) => Proto::Http(Default::default()),
            Proto::Ws(_) => Proto::Ws(Default::default()),
            Proto::Mqtt(_) => Proto::Mqtt(Default::default()),
            Proto::Sntp(_) => Proto::Sntp(Default::default()),
        }
    }
}

/// Target of a connect that is still resolving
#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub(crate) host: String,
    pub(crate) port: u16,
}

/// One endpoint managed by the reactor
///
/// Bundles the socket handle, the `recv`/`send` buffers, the protocol
/// engine, TLS state and the lifecycle flags. Driver-managed flags are
/// readable through accessors; the user-settable ones (`drain`, `close`,
/// `hexdump`) have setters and take effect at the end of the current poll
/// step.
pub struct Connection {
    pub(crate) id: u64,
    pub(crate) role: Role,
    label: String,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) sock: Option<Socket>,
    pub(crate) recv: IoBuffer,
    pub(crate) send: IoBuffer,
    pub(crate) handler: Option<EventFn>,
    userdata: Option<Rc<dyn Any>>,
    pub(crate) proto: Proto,
    pub(crate) tls: Option<Box<dyn TlsDriver>>,
    pub(crate) pending: Option<Pending>,
    /// SNI / expected server name for TLS clients, from the connect URL
    pub(crate) tls_name: Option<String>,
    /// The connect URL had a TLS scheme; a TLS driver must be initialised
    /// before application data flows
    pub(crate) wants_tls: bool,
    pub(crate) io_size: usize,

    pub(crate) is_udp: bool,
    pub(crate) is_resolving: bool,
    pub(crate) is_connecting: bool,
    pub(crate) is_tls: bool,
    pub(crate) is_tls_hs: bool,
    pub(crate) is_websocket: bool,
    pub(crate) is_hexdumping: bool,
    pub(crate) is_draining: bool,
    pub(crate) is_closing: bool,
    pub(crate) is_readable: bool,
    pub(crate) is_writable: bool,
    /// Set by `http::delete_chunk` inside an `HttpChunk` callback
    pub(crate) delete_chunk: bool,
    /// Failure staged while the manager was not on the call stack; the
    /// next poll step turns it into `Event::Error` and a close
    pub(crate) pending_error: Option<String>,
}

impl Connection {
    pub(crate) fn new(id: u64, role: Role, io_size: usize) -> Self {
        Self {
            id,
            role,
            label: String::new(),
            peer: None,
            sock: None,
            recv: IoBuffer::new(),
            send: IoBuffer::new(),
            handler: None,
            userdata: None,
            proto: Proto::Raw,
            tls: None,
            pending: None,
            tls_name: None,
            wants_tls: false,
            io_size,
            is_udp: false,
            is_resolving: false,
            is_connecting: false,
            is_tls: false,
            is_tls_hs: false,
            is_websocket: false,
            is_hexdumping: false,
            is_draining: false,
            is_closing: false,
            is_readable: false,
            is_writable: false,
            delete_chunk: false,
            pending_error: None,
        }
    }

    /// Unique id, never reused within a manager
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    /// Peer address, once known
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Local address of the underlying socket; the actual port of a
    /// listener bound to port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.as_ref()?.local_addr().ok()
    }

    pub fn is_listening(&self) -> bool {
        self.role == Role::Listener
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    pub fn is_accepted(&self) -> bool {
        self.role == Role::Accepted
    }

    pub fn is_udp(&self) -> bool {
        self.is_udp
    }

    pub fn is_resolving(&self) -> bool {
        self.is_resolving
    }

    pub fn is_connecting(&self) -> bool {
        self.is_connecting
    }

    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    pub fn is_tls_handshaking(&self) -> bool {
        self.is_tls_hs
    }

    pub fn is_websocket(&self) -> bool {
        self.is_websocket
    }

    /// Readiness reported by the last poll, cleared on would-block
    pub fn is_readable(&self) -> bool {
        self.is_readable
    }

    pub fn is_writable(&self) -> bool {
        self.is_writable
    }

    pub fn is_draining(&self) -> bool {
        self.is_draining
    }

    pub fn is_closing(&self) -> bool {
        self.is_closing
    }

    /// Flush the send buffer, then close
    pub fn drain(&mut self) {
        self.is_draining = true;
    }

    /// Close at the end of the current poll step, discarding unsent data
    pub fn close(&mut self) {
        self.is_closing = true;
    }

    /// Log rx/tx traffic of this connection as hexdumps
    pub fn set_hexdump(&mut self, on: bool) {
        self.is_hexdumping = on;
    }

    /// Received bytes not yet consumed by a protocol engine
    pub fn recv_data(&self) -> &[u8] {
        self.recv.as_slice()
    }

    /// Direct access to the receive buffer. Mutating it invalidates any
    /// spans delivered in the current event.
    pub fn recv_buf(&mut self) -> &mut IoBuffer {
        &mut self.recv
    }

    /// Bytes queued for transmission
    pub fn send_pending(&self) -> usize {
        self.send.len()
    }

    /// Stage a failure for the manager to surface as `Event::Error` (and a
    /// close) during the current or next poll step. First failure wins.
    pub(crate) fn defer_error(&mut self, msg: impl Into<String>) {
        if self.pending_error.is_none() {
            self.pending_error = Some(msg.into());
        }
    }

    /// Queue bytes for transmission. Refused once the connection is
    /// closing or failed; an allocation failure fails the connection,
    /// surfacing `Event::Error` on it in the same poll step.
    pub fn send_bytes(&mut self, data: &[u8]) -> bool {
        if self.is_closing || self.pending_error.is_some() {
            return false;
        }
        match self.send.append(data, self.io_size) {
            Ok(_) => true,
            Err(e) => {
                self.defer_error(format!("send failed: {e}"));
                false
            }
        }
    }

    /// Queue formatted text for transmission
    pub fn send_fmt(&mut self, args: fmt::Arguments<'_>) -> bool {
        let mut s = String::new();
        if s.write_fmt(args).is_err() {
            return false;
        }
        self.send_bytes(s.as_bytes())
    }

    /// Opaque per-connection application state. Listeners seed accepted
    /// connections with a clone of their own value.
    pub fn userdata(&self) -> Option<&Rc<dyn Any>> {
        self.userdata.as_ref()
    }

    pub fn set_userdata(&mut self, data: Rc<dyn Any>) {
        self.userdata = Some(data);
    }

    pub(crate) fn userdata_clone(&self) -> Option<Rc<dyn Any>> {
        self.userdata.clone()
    }

    /// Attach a TLS engine to this connection and start the handshake.
    /// Typically called from the `Connect` (client) or `Accept` (server)
    /// event. The handshake is driven by subsequent polls.
    pub fn tls_init(&mut self, opts: &TlsOpts) -> Result<(), TlsError> {
        #[cfg(feature = "tls")]
        {
            let driver = match self.role {
                Role::Client => {
                    let host = opts
                        .server_name
                        .clone()
                        .or_else(|| self.tls_name.clone())
                        .unwrap_or_default();
                    crate::tls::RustlsDriver::client(opts, &host)?
                }
                _ => crate::tls::RustlsDriver::server(opts)?,
            };
            self.tls = Some(Box::new(driver));
            self.is_tls = true;
            self.is_tls_hs = true;
            Ok(())
        }
        #[cfg(not(feature = "tls"))]
        {
            let _ = opts;
            Err(TlsError::Disabled)
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("label", &self.label)
            .field("peer", &self.peer)
            .field("recv", &self.recv.len())
            .field("send", &self.send.len())
            .field("closing", &self.is_closing)
            .finish()
    }
}
