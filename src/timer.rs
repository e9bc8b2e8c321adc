//! Software timers driven by the poll loop
//!
//! A flat list owned by the manager, walked at the top of every poll step.
//! Granularity is therefore the poll timeout. Each timer fires at most once
//! per poll step; an overdue repeating timer reschedules by a single period
//! rather than looping to catch up.

use std::mem;
use std::time::{Duration, Instant};

use crate::manager::Manager;

/// Reschedule after every fire instead of removing the timer
pub const TIMER_REPEAT: u8 = 1 << 0;
/// Arm the first fire immediately instead of one period from now
pub const TIMER_RUN_NOW: u8 = 1 << 1;

pub(crate) type TimerFn = Box<dyn FnMut(&mut Manager)>;

pub(crate) struct Timer {
    pub(crate) id: u64,
    period: Duration,
    flags: u8,
    next_fire: Instant,
    cb: Option<TimerFn>,
}

impl Timer {
    pub(crate) fn new(id: u64, period_ms: u64, flags: u8, now: Instant, cb: TimerFn) -> Self {
        let period = Duration::from_millis(period_ms);
        let next_fire = if flags & TIMER_RUN_NOW != 0 {
            now
        } else {
            now + period
        };
        Self {
            id,
            period,
            flags,
            next_fire,
            cb: Some(cb),
        }
    }
}

/// Fire every due timer once. Callbacks get the manager back, so the list is
/// detached while running; timers added or cleared inside a callback are
/// merged afterwards.
pub(crate) fn fire(mgr: &mut Manager, now: Instant) {
    if mgr.timers.is_empty() {
        mgr.timer_graveyard.clear();
        return;
    }
    let mut list = mem::take(&mut mgr.timers);
    for t in &mut list {
        if t.next_fire > now {
            continue;
        }
        let mut cb = match t.cb.take() {
            Some(cb) => cb,
            None => continue,
        };
        cb(mgr);
        if t.flags & TIMER_REPEAT != 0 {
            t.next_fire += t.period;
            t.cb = Some(cb);
        }
    }
    list.retain(|t| t.cb.is_some());
    // timers created during callbacks landed on the manager
    list.append(&mut mgr.timers);
    let dead = mem::take(&mut mgr.timer_graveyard);
    if !dead.is_empty() {
        list.retain(|t| !dead.contains(&t.id));
    }
    mgr.timers = list;
}
