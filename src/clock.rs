// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Time sources for the demand tracker.
//!
//! All accounting runs off a monotonic nanosecond clock. `WaltClock` layers
//! suspend handling on top of any [`Clock`]: while suspended it keeps
//! returning the value sampled at suspend entry, and after resume it accrues
//! real elapsed time on top of that value again, so no window ever advances
//! across a suspend interval.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use log::debug;

use crate::types::TimeNs;

pub trait Clock: Send + Sync {
    fn now_ns(&self) -> TimeNs;
}

/// CLOCK_MONOTONIC.
#[derive(Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> TimeNs {
        let mut time = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // clock_gettime() cannot fail for CLOCK_MONOTONIC with a valid pointer.
        let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut time) };
        assert!(ret == 0);
        time.tv_sec as u64 * 1_000_000_000 + time.tv_nsec as u64
    }
}

/// Clock driven explicitly by its owner. Used by the workload driver and
/// tests to make every accounting step deterministic.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: TimeNs) -> ManualClock {
        ManualClock {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: TimeNs) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: TimeNs) -> TimeNs {
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> TimeNs {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct SuspendState {
    suspended: bool,
    /// Raw clock value at suspend entry.
    suspend_raw: TimeNs,
    /// Total raw time spent suspended so far.
    offset: TimeNs,
}

pub struct WaltClock {
    source: Arc<dyn Clock>,
    tick_ns: AtomicU64,
    state: Mutex<SuspendState>,
}

impl WaltClock {
    pub fn new(source: Arc<dyn Clock>, tick_ns: TimeNs) -> WaltClock {
        WaltClock {
            source,
            tick_ns: AtomicU64::new(tick_ns.max(1)),
            state: Mutex::new(SuspendState::default()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SuspendState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current logical time.
    pub fn now(&self) -> TimeNs {
        let state = self.lock_state();
        if state.suspended {
            return state.suspend_raw.saturating_sub(state.offset);
        }
        self.source.now_ns().saturating_sub(state.offset)
    }

    /// Current time in ticks, the unit IRQ load decays in.
    pub fn jiffies(&self) -> u64 {
        self.now() / self.tick_ns.load(Ordering::Relaxed)
    }

    pub fn set_tick_ns(&self, tick_ns: TimeNs) {
        self.tick_ns.store(tick_ns.max(1), Ordering::Relaxed);
    }

    pub fn suspend(&self) {
        let mut state = self.lock_state();
        if state.suspended {
            return;
        }
        state.suspend_raw = self.source.now_ns();
        state.suspended = true;
        debug!(
            "clock frozen at {}",
            state.suspend_raw.saturating_sub(state.offset)
        );
    }

    pub fn resume(&self) {
        let mut state = self.lock_state();
        if !state.suspended {
            return;
        }
        let slept = self.source.now_ns().saturating_sub(state.suspend_raw);
        state.offset += slept;
        state.suspended = false;
        debug!("clock resumed after {slept}ns suspended");
    }

    pub fn is_suspended(&self) -> bool {
        self.lock_state().suspended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(5);
        assert_eq!(clock.advance(10), 15);
        clock.set(100);
        assert_eq!(clock.now_ns(), 100);
    }

    #[test]
    fn test_suspend_freezes_time() {
        let raw = Arc::new(ManualClock::new(1_000));
        let clock = WaltClock::new(raw.clone(), 100);

        raw.set(2_000);
        assert_eq!(clock.now(), 2_000);

        clock.suspend();
        raw.set(50_000);
        assert!(clock.is_suspended());
        assert_eq!(clock.now(), 2_000);

        clock.resume();
        assert_eq!(clock.now(), 2_000);

        raw.set(50_500);
        assert_eq!(clock.now(), 2_500);
        assert_eq!(clock.jiffies(), 25);
    }

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock;
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }
}
