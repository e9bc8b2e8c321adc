mod common;

use std::net::UdpSocket;

use common::{poll_until, shared};
use stoat::{handler, sntp, Event, Manager};

const NTP_DELTA: u64 = 2_208_988_800;

#[test]
fn sntp_reply_yields_unix_time() {
    let unix_secs: u64 = 1_700_000_000;

    // canned server: one request, one valid reply
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = sock.local_addr().unwrap();
    let server = std::thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (n, from) = sock.recv_from(&mut buf).unwrap();
        assert_eq!(n, 48, "client sends a 48-byte request");
        assert_eq!(buf[0], (4 << 3) | 3, "NTPv4 client mode");
        let mut reply = [0u8; 48];
        reply[0] = (4 << 3) | 4; // server mode
        reply[1] = 2; // stratum
        reply[40..44].copy_from_slice(&((unix_secs + NTP_DELTA) as u32).to_be_bytes());
        reply[44..48].copy_from_slice(&0x8000_0000u32.to_be_bytes()); // .5s
        sock.send_to(&reply, from).unwrap();
    });

    let mut mgr = Manager::new().unwrap();
    let times = shared::<Vec<(i64, u32)>>();
    let times_w = times.clone();
    sntp::connect(
        &mut mgr,
        Some(&format!("udp://{addr}")),
        handler(move |_mgr, _c, ev| {
            if let Event::SntpTime(t) = ev {
                times_w.borrow_mut().push((t.seconds, t.micros));
            }
        }),
    )
    .unwrap();

    poll_until(&mut mgr, 5, || !times.borrow().is_empty());
    assert_eq!(times.borrow().as_slice(), [(unix_secs as i64, 500_000u32)]);
    server.join().unwrap();
}
