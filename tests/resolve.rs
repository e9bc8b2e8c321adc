mod common;

use std::net::UdpSocket;

use common::{poll_until, shared};
use stoat::{handler, Config, Event, Manager};

/// A resolver on loopback answering every A query with 127.0.0.1
fn fake_resolver() -> (std::net::SocketAddr, std::thread::JoinHandle<()>) {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = sock.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let mut buf = [0u8; 512];
        if let Ok((n, from)) = sock.recv_from(&mut buf) {
            if n < 12 {
                return;
            }
            let question = &buf[12..n];
            let mut reply = Vec::with_capacity(n + 16);
            reply.extend_from_slice(&buf[0..2]); // transaction id
            reply.extend_from_slice(&[0x81, 0x80]); // standard response
            reply.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 0]);
            reply.extend_from_slice(question);
            // answer: pointer to the question name, A IN, ttl 60
            reply.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 127, 0, 0, 1]);
            let _ = sock.send_to(&reply, from);
        }
    });
    (addr, handle)
}

#[test]
fn hostname_resolves_and_connects() {
    let (resolver, thread) = fake_resolver();
    let mut mgr = Manager::with_config(Config {
        dns_server: resolver,
        dns_timeout_ms: 2000,
        ..Config::default()
    })
    .unwrap();

    let lid = mgr
        .listen("tcp://127.0.0.1:0", handler(|_, _, _| {}))
        .unwrap();
    let port = mgr.local_addr(lid).unwrap().port();

    let events = shared::<Vec<String>>();
    let events_w = events.clone();
    mgr.connect(
        &format!("tcp://some.test.host:{port}"),
        handler(move |_mgr, _c, ev| match ev {
            Event::Resolve => events_w.borrow_mut().push("resolve".into()),
            Event::Connect => events_w.borrow_mut().push("connect".into()),
            Event::Error(e) => events_w.borrow_mut().push(format!("error: {e}")),
            _ => {}
        }),
    )
    .unwrap();

    poll_until(&mut mgr, 5, || {
        events.borrow().iter().any(|e| e == "connect")
    });
    assert_eq!(events.borrow().as_slice(), ["resolve", "connect"]);
    thread.join().unwrap();
}

#[test]
fn dns_timeout_fails_the_connection() {
    // a resolver that swallows queries without answering
    let mute = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut mgr = Manager::with_config(Config {
        dns_server: mute.local_addr().unwrap(),
        dns_timeout_ms: 100,
        ..Config::default()
    })
    .unwrap();

    let events = shared::<Vec<String>>();
    let events_w = events.clone();
    mgr.connect(
        "tcp://never.resolves.test:80",
        handler(move |_mgr, _c, ev| match ev {
            Event::Error(e) => events_w.borrow_mut().push(e.clone()),
            Event::Close => events_w.borrow_mut().push("close".into()),
            _ => {}
        }),
    )
    .unwrap();

    poll_until(&mut mgr, 5, || {
        events.borrow().iter().any(|e| e == "close")
    });
    assert_eq!(events.borrow().as_slice(), ["DNS timeout", "close"]);
}
