// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Busy classification of a core with hysteresis. A core is promoted one
//! step per closed window whose busy time reaches the limit, and drops back
//! to `Clear` on the first window that does not.

use serde::Serialize;

use crate::types::TimeNs;
use crate::types::SCHED_CAPACITY_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyState {
    #[default]
    Clear,
    Prepare,
    Set,
}

impl BusyState {
    /// Next state after a window closed with `prev_runnable_sum` busy time.
    pub fn advance(self, prev_runnable_sum: u64, busy_limit: u64) -> BusyState {
        if prev_runnable_sum >= busy_limit {
            match self {
                BusyState::Clear => BusyState::Prepare,
                BusyState::Prepare | BusyState::Set => BusyState::Set,
            }
        } else {
            BusyState::Clear
        }
    }

    pub fn is_set(self) -> bool {
        self == BusyState::Set
    }
}

/// Busy time, scaled against the core's original capacity, a window must
/// reach to count as busy.
pub fn busy_limit(window_ns: TimeNs, threshold_pct: u32, capacity_orig: u64) -> u64 {
    let limit = window_ns * threshold_pct as u64 / 100;
    (limit * capacity_orig) >> SCHED_CAPACITY_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(seq: &[bool]) -> Vec<BusyState> {
        let limit = busy_limit(16_000_000, 50, 1024);
        let mut state = BusyState::Clear;
        seq.iter()
            .map(|over| {
                let sum = if *over { limit } else { limit - 1 };
                state = state.advance(sum, limit);
                state
            })
            .collect()
    }

    #[test]
    fn test_two_windows_to_set() {
        use BusyState::*;
        assert_eq!(run(&[true, true, true]), vec![Prepare, Set, Set]);
    }

    #[test]
    fn test_single_quiet_window_resets() {
        use BusyState::*;
        assert_eq!(
            run(&[true, false, true, true, false, true]),
            vec![Prepare, Clear, Prepare, Set, Clear, Prepare]
        );
    }

    #[test]
    fn test_limit_scales_with_capacity() {
        assert_eq!(busy_limit(16_000_000, 50, 1024), 8_000_000);
        assert_eq!(busy_limit(16_000_000, 50, 512), 4_000_000);
        assert_eq!(busy_limit(16_000_000, 0, 512), 0);
    }
}
