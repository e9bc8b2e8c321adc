mod common;

use common::{poll_until, shared};
use stoat::{handler, Event, Manager};

#[test]
fn foreign_thread_wakeup_reaches_a_connection() {
    let mut mgr = Manager::new().unwrap();

    // plain sink server recording whatever arrives
    let server_got = shared::<Vec<u8>>();
    let server_got_w = server_got.clone();
    let lid = mgr
        .listen(
            "tcp://127.0.0.1:0",
            handler(move |_mgr, c, ev| {
                if matches!(ev, Event::Read(_)) {
                    server_got_w.borrow_mut().extend_from_slice(c.recv_data());
                    c.recv_buf().clear();
                }
            }),
        )
        .unwrap();
    let port = mgr.local_addr(lid).unwrap().port();

    let client_id = mgr
        .connect(&format!("tcp://127.0.0.1:{port}"), handler(|_, _, _| {}))
        .unwrap();

    // the pipe handler runs on the manager thread and may touch any
    // connection
    let wakes = shared::<usize>();
    let wakes_w = wakes.clone();
    let (_pipe_id, wakeup) = mgr
        .make_pipe(handler(move |mgr, _c, ev| {
            if matches!(ev, Event::Read(_)) {
                *wakes_w.borrow_mut() += 1;
                mgr.send_to(client_id, b"computed-elsewhere");
            }
        }))
        .unwrap();

    let worker = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(wakeup.wake());
    });

    poll_until(&mut mgr, 5, || {
        server_got.borrow().as_slice() == b"computed-elsewhere"
    });
    assert_eq!(*wakes.borrow(), 1);
    worker.join().unwrap();
}

#[test]
fn wakeup_handle_is_cloneable_across_threads() {
    let mut mgr = Manager::new().unwrap();
    let wakes = shared::<usize>();
    let wakes_w = wakes.clone();
    let (_pipe_id, wakeup) = mgr
        .make_pipe(handler(move |_mgr, c, ev| {
            if let Event::Read(n) = ev {
                *wakes_w.borrow_mut() += n;
                c.recv_buf().clear();
            }
        }))
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let w = wakeup.clone();
            std::thread::spawn(move || w.wake())
        })
        .collect();
    for h in handles {
        assert!(h.join().unwrap());
    }

    // four one-byte datagrams, one Read each
    poll_until(&mut mgr, 5, || *wakes.borrow() >= 4);
    assert_eq!(*wakes.borrow(), 4);
}
