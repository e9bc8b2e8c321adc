//! Event-driven multi-protocol networking
//!
//! A single-threaded readiness-driven reactor multiplexing any number of
//! TCP and UDP connections, with protocol engines for HTTP/1.x, WebSocket,
//! MQTT 3.1.1 and SNTP, non-blocking DNS resolution, software timers, an
//! optional TLS driver and a cross-thread wakeup pipe.
//!
//! The [`Manager`] owns every connection and performs no I/O outside of
//! [`Manager::poll`]; handlers run inside the poll step and never suspend.
//! Protocol engines see bytes first and synthesize higher-level events
//! (`HttpMsg`, `WsMsg`, ...) before the user handler runs.
//!
//! ```no_run
//! use stoat::{handler, http, Event, Manager};
//!
//! let mut mgr = Manager::new().unwrap();
//! http::listen(&mut mgr, "http://0.0.0.0:8080", handler(|_mgr, c, ev| {
//!     if let Event::HttpMsg(m) = ev {
//!         let uri = c.recv_data()[m.uri.clone()].to_vec();
//!         http::reply(c, 200, "", &format!("you asked for {}\n", String::from_utf8_lossy(&uri)));
//!     }
//! }))
//! .unwrap();
//! loop {
//!     mgr.poll(100);
//! }
//! ```
//!
//! All APIs are single-thread only, except [`Wakeup::wake`].

pub mod buffer;
mod connection;
mod dns;
mod event;
pub mod fs;
pub mod http;
mod manager;
pub mod mqtt;
mod sock;
pub mod sntp;
pub mod timer;
pub mod tls;
pub mod url;
pub mod ws;

pub use buffer::IoBuffer;
pub use connection::{handler, Connection, EventFn, Role};
pub use event::Event;
pub use http::HttpMessage;
pub use manager::{Config, Error, Manager, Wakeup};
pub use mqtt::MqttMessage;
pub use sntp::SntpTime;
pub use timer::{TIMER_REPEAT, TIMER_RUN_NOW};
pub use tls::TlsOpts;
pub use url::Url;
pub use ws::WsMessage;
