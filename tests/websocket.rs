mod common;

use common::{poll_until, shared};
use stoat::{handler, http, ws, Event, Manager};

fn start_ws_echo_server(
    mgr: &mut Manager,
    msgs: common::Shared<Vec<(String, u8)>>,
    ctls: common::Shared<Vec<(u8, String)>>,
) -> u16 {
    let lid = http::listen(
        mgr,
        "http://127.0.0.1:0",
        handler(move |mgr, c, ev| match ev {
            Event::HttpMsg(m) => ws::upgrade(mgr, c, m, ""),
            Event::WsOpen(_) => {
                ws::send(c, b"ping!", ws::OP_PING);
            }
            Event::WsMsg(m) => {
                msgs.borrow_mut().push((
                    String::from_utf8_lossy(&c.recv_data()[m.data.clone()]).into_owned(),
                    m.flags,
                ));
            }
            Event::WsCtl(m) => {
                ctls.borrow_mut().push((
                    m.op(),
                    String::from_utf8_lossy(&c.recv_data()[m.data.clone()]).into_owned(),
                ));
            }
            _ => {}
        }),
    )
    .unwrap();
    mgr.local_addr(lid).unwrap().port()
}

#[test]
fn handshake_masked_frame_and_auto_pong() {
    let mut mgr = Manager::new().unwrap();
    let msgs = shared::<Vec<(String, u8)>>();
    let ctls = shared::<Vec<(u8, String)>>();
    let port = start_ws_echo_server(&mut mgr, msgs.clone(), ctls.clone());

    let opened = shared::<usize>();
    let opened_w = opened.clone();
    ws::connect(
        &mut mgr,
        &format!("ws://127.0.0.1:{port}/chat"),
        handler(move |_mgr, c, ev| {
            if matches!(ev, Event::WsOpen(_)) {
                *opened_w.borrow_mut() += 1;
                ws::send(c, b"hi", ws::OP_TEXT);
            }
        }),
        "",
    )
    .unwrap();

    poll_until(&mut mgr, 5, || !msgs.borrow().is_empty());
    assert_eq!(*opened.borrow(), 1);
    let (data, flags) = msgs.borrow()[0].clone();
    assert_eq!(data, "hi");
    assert_eq!(flags & 0x0F, ws::OP_TEXT);
    assert_ne!(flags & 0x80, 0, "FIN must be set");

    // the client engine answers the server's ping on its own
    poll_until(&mut mgr, 5, || {
        ctls.borrow().iter().any(|(op, _)| *op == ws::OP_PONG)
    });
    let pong = ctls
        .borrow()
        .iter()
        .find(|(op, _)| *op == ws::OP_PONG)
        .cloned()
        .unwrap();
    assert_eq!(pong.1, "ping!", "pong echoes the ping payload");
}

/// Build one masked client frame by hand
fn masked_frame(fin: bool, op: u8, data: &[u8]) -> Vec<u8> {
    assert!(data.len() < 126);
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let mut out = vec![
        if fin { 0x80 | op } else { op },
        0x80 | data.len() as u8,
    ];
    out.extend_from_slice(&mask);
    out.extend(data.iter().enumerate().map(|(i, b)| b ^ mask[i & 3]));
    out
}

#[test]
fn fragmented_message_reassembles() {
    let mut mgr = Manager::new().unwrap();
    let msgs = shared::<Vec<(String, u8)>>();
    let ctls = shared::<Vec<(u8, String)>>();
    let port = start_ws_echo_server(&mut mgr, msgs.clone(), ctls.clone());

    ws::connect(
        &mut mgr,
        &format!("ws://127.0.0.1:{port}/chat"),
        handler(move |_mgr, c, ev| {
            if matches!(ev, Event::WsOpen(_)) {
                // hand-rolled fragments: "he" + "ll" + "o"
                let mut wire = masked_frame(false, ws::OP_TEXT, b"he");
                wire.extend(masked_frame(false, ws::OP_CONTINUE, b"ll"));
                wire.extend(masked_frame(true, ws::OP_CONTINUE, b"o"));
                c.send_bytes(&wire);
            }
        }),
        "",
    )
    .unwrap();

    poll_until(&mut mgr, 5, || !msgs.borrow().is_empty());
    let (data, _flags) = msgs.borrow()[0].clone();
    assert_eq!(data, "hello");
}

#[test]
fn close_frame_gets_answered_and_drains() {
    let mut mgr = Manager::new().unwrap();
    let msgs = shared::<Vec<(String, u8)>>();
    let ctls = shared::<Vec<(u8, String)>>();
    let port = start_ws_echo_server(&mut mgr, msgs, ctls);

    let got_close_reply = shared::<usize>();
    let closed = shared::<usize>();
    let (reply_w, closed_w) = (got_close_reply.clone(), closed.clone());
    ws::connect(
        &mut mgr,
        &format!("ws://127.0.0.1:{port}/chat"),
        handler(move |_mgr, c, ev| match ev {
            Event::WsOpen(_) => {
                ws::send(c, b"", ws::OP_CLOSE);
            }
            Event::WsCtl(m) => {
                if m.op() == ws::OP_CLOSE {
                    *reply_w.borrow_mut() += 1;
                }
            }
            Event::Close => *closed_w.borrow_mut() += 1,
            _ => {}
        }),
        "",
    )
    .unwrap();

    poll_until(&mut mgr, 5, || *closed.borrow() == 1);
    assert_eq!(*got_close_reply.borrow(), 1, "server answers close with close");
}
