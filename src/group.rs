// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Task groups.
//!
//! A group biases both the tracker and the placement engine for its member
//! tasks: wait time on a runqueue may count as demand, new members may start
//! with a larger initial load, and a boost inflates the utilization used for
//! placement.

use serde::Deserialize;
use serde::Serialize;

use crate::types::GroupId;

/// Initial load percentage of the foreground application group.
pub const TOPAPP_INIT_LOAD_PCT: u32 = 40;
pub const TOPAPP_NAME: &str = "top-app";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: GroupId,
    pub name: String,
    /// Placement boost in percent of the remaining headroom.
    pub boost: u32,
    pub account_wait_time: bool,
    /// Initial load of new member tasks in percent of a window. Zero
    /// defers to the global default.
    pub init_task_load_pct: u32,
}

impl TaskGroup {
    /// Group as it comes online. Members account wait time; the foreground
    /// application group also starts new tasks with a larger load.
    pub fn new(id: GroupId, name: &str) -> TaskGroup {
        let init_task_load_pct = if name == TOPAPP_NAME {
            TOPAPP_INIT_LOAD_PCT
        } else {
            0
        };

        TaskGroup {
            id,
            name: name.to_string(),
            boost: 0,
            account_wait_time: true,
            init_task_load_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topapp_defaults() {
        let top = TaskGroup::new(GroupId(1), "top-app");
        assert_eq!(top.init_task_load_pct, TOPAPP_INIT_LOAD_PCT);
        assert!(top.account_wait_time);

        let bg = TaskGroup::new(GroupId(2), "background");
        assert_eq!(bg.init_task_load_pct, 0);
        assert_eq!(bg.boost, 0);
    }
}
