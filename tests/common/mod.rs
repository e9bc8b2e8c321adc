#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

use stoat::Manager;

static LOGS: Once = Once::new();

/// Route crate tracing into the test harness, once per process
pub fn trace_init() {
    LOGS.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Drive the manager until `pred` holds, failing the test after `secs`
pub fn poll_until(mgr: &mut Manager, secs: u64, mut pred: impl FnMut() -> bool) {
    trace_init();
    let deadline = Instant::now() + Duration::from_secs(secs);
    while !pred() {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for test condition"
        );
        mgr.poll(10);
    }
}

/// Keep polling for a little while after a condition settles, to catch
/// events that should NOT happen
pub fn poll_for(mgr: &mut Manager, millis: u64) {
    let deadline = Instant::now() + Duration::from_millis(millis);
    while Instant::now() < deadline {
        mgr.poll(5);
    }
}

pub type Shared<T> = Rc<RefCell<T>>;

pub fn shared<T: Default>() -> Shared<T> {
    Rc::new(RefCell::new(T::default()))
}
