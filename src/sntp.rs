//! SNTP client (RFC 4330)
//!
//! Builds the 48-byte NTPv4 client packet, parses server replies into UNIX
//! time, and enforces the one-request-per-hour courtesy lockout per
//! connection.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::connection::{Connection, EventFn, Proto};
use crate::event::Event;
use crate::manager::{Error, Manager};

/// Seconds between the NTP epoch (1900-01-01) and the UNIX epoch
const NTP_DELTA: i64 = 2_208_988_800;

const DEFAULT_URL: &str = "udp://time.google.com:123";

/// Minimum interval between requests on one connection
const MIN_INTERVAL: Duration = Duration::from_secs(3600);

/// A decoded server timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SntpTime {
    /// Seconds since the UNIX epoch
    pub seconds: i64,
    pub micros: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SntpState {
    last_request: Option<Instant>,
}

/// Open a UDP connection to an SNTP server (`time.google.com:123` when
/// `url` is `None`); the first request goes out on `Connect`
pub fn connect(mgr: &mut Manager, url: Option<&str>, handler: EventFn) -> Result<u64, Error> {
    let id = mgr.connect(url.unwrap_or(DEFAULT_URL), handler)?;
    if let Some(c) = mgr.conn_mut(id) {
        c.proto = Proto::Sntp(SntpState::default());
    }
    Ok(id)
}

/// Queue one request, unless the hourly lockout is still in effect.
/// Returns whether a packet was queued.
pub fn request(c: &mut Connection) -> bool {
    let mut st = match c.proto {
        Proto::Sntp(s) => s,
        _ => SntpState::default(),
    };
    let now = Instant::now();
    if let Some(last) = st.last_request {
        if now.duration_since(last) < MIN_INTERVAL {
            debug!(id = c.id(), "sntp request suppressed by rate limit");
            return false;
        }
    }
    st.last_request = Some(now);
    if let Proto::Sntp(ref mut s) = c.proto {
        *s = st;
    }
    let mut pkt = [0u8; 48];
    pkt[0] = (4 << 3) | 3; // LI 0, version 4, mode client
    c.send_bytes(&pkt)
}

/// Parse a server reply; `None` if it is not a valid server response
pub fn parse(buf: &[u8]) -> Option<SntpTime> {
    if buf.len() < 48 {
        return None;
    }
    let mode = buf[0] & 7;
    if mode != 4 && mode != 5 {
        return None;
    }
    if buf[1] == 0 {
        return None; // kiss-of-death / unsynchronized stratum
    }
    // transmit timestamp: 64-bit fixed point seconds since 1900
    let secs = u32::from_be_bytes(buf[40..44].try_into().unwrap());
    let frac = u32::from_be_bytes(buf[44..48].try_into().unwrap());
    Some(SntpTime {
        seconds: secs as i64 - NTP_DELTA,
        micros: ((frac as u64 * 1_000_000) >> 32) as u32,
    })
}

/// Protocol stage for SNTP connections
pub(crate) fn cb(mgr: &mut Manager, c: &mut Connection, ev: &Event) {
    match ev {
        Event::Connect => {
            request(c);
        }
        Event::Read(_) => {
            let parsed = parse(c.recv.as_slice());
            c.recv.clear();
            match parsed {
                Some(t) => {
                    debug!(id = c.id(), seconds = t.seconds, "sntp time");
                    mgr.deliver(c, &Event::SntpTime(t));
                }
                None => mgr.error(c, "bad SNTP packet"),
            }
        }
        _ => {}
    }
}
