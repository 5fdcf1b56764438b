// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Runtime tunables.
//!
//! A configuration is given either inline as JSON or as a path prefixed with
//! "f:" or "file:". Every field is optional and falls back to its default:
//!
//! ```json
//! {
//!   "window_ns": 16000000,
//!   "window_stats_policy": "max",
//!   "busy_threshold_pct": 50,
//!   "cap_margin_up": [1280, 1280, 1280],
//!   "rotation_enable": true
//! }
//! ```
//!
//! The window size and history depth are fixed while the tracker is active.
//! Everything else may be changed at any time and takes effect on the next
//! event.

use std::fs;
use std::io::Read;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::types::TimeNs;
use crate::types::NSEC_PER_MSEC;
use crate::types::SCHED_CAPACITY_SCALE;

/// Upper bound of the per-task window history.
pub const RAVG_HIST_SIZE_MAX: usize = 6;

pub const MIN_WINDOW_NS: TimeNs = NSEC_PER_MSEC;
pub const MAX_WINDOW_NS: TimeNs = 1_000 * NSEC_PER_MSEC;

const DEFAULT_MARGIN_UP: u64 = 1280;
const DEFAULT_MARGIN_DOWN: u64 = 1205;

/// How a task's demand is derived from its window history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatsPolicy {
    /// The most recently completed window.
    Recent,
    /// The largest window in the history.
    #[default]
    Max,
    /// The larger of the history average and the most recent window.
    MaxRecentAvg,
    /// The history average.
    Avg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaltConfig {
    /// Accounting window size.
    pub window_ns: TimeNs,
    /// Scheduler tick period. IRQ load decays per tick.
    pub tick_ns: TimeNs,
    /// Number of completed windows kept per task.
    pub hist_size: usize,
    pub window_stats_policy: WindowStatsPolicy,
    /// Percentage of a window, scaled by core capacity, the previous window
    /// must reach for a core to count as busy.
    pub busy_threshold_pct: u32,
    /// Carry busy time that crosses an open window into the next window's sum.
    pub cross_window_util: bool,
    /// Count time spent waiting on a runqueue as task demand.
    pub account_wait_time: bool,
    /// Count I/O wait time on an idle core as busy.
    pub io_is_busy: bool,
    /// Charge IRQ time to the core's busy counters.
    pub account_irq_time: bool,
    /// Initial demand of new tasks, in percent of a window.
    pub init_task_load_pct: u32,
    /// Average IRQ load at which a core is flagged as IRQ-heavy.
    pub cpu_high_irqload_ns: TimeNs,
    /// Utilization below which uclamp-min boosts proportionally to the
    /// utilization itself rather than to the remaining headroom.
    pub uclamp_threshold: u64,
    /// Use the boost transform instead of a plain clamp for uclamp-min.
    pub uclamp_min_to_boost: bool,
    /// Per cluster up-migration margins, in 1/1024 units.
    pub cap_margin_up: Vec<u64>,
    /// Per cluster down-migration margins, in 1/1024 units.
    pub cap_margin_down: Vec<u64>,
    /// Margin used by the fair placement fitness check.
    pub fair_cap_margin: u64,
    pub rotation_enable: bool,
    /// How long a task must have run uncontested on a big core before it
    /// may be rotated out.
    pub rotation_threshold_ms: u64,
    /// Minimum number of cores running misfit tasks before rotating.
    pub rotation_misfit_threshold: usize,
    /// A candidate must save more than (prev_delta + base_energy) >> shift
    /// to displace prev_cpu.
    pub energy_hysteresis_shift: u32,
}

impl Default for WaltConfig {
    fn default() -> Self {
        Self {
            window_ns: 16 * NSEC_PER_MSEC,
            tick_ns: 4 * NSEC_PER_MSEC,
            hist_size: RAVG_HIST_SIZE_MAX,
            window_stats_policy: WindowStatsPolicy::Max,
            busy_threshold_pct: 50,
            cross_window_util: true,
            account_wait_time: false,
            io_is_busy: false,
            account_irq_time: true,
            init_task_load_pct: 10,
            cpu_high_irqload_ns: 10 * NSEC_PER_MSEC,
            uclamp_threshold: 100,
            uclamp_min_to_boost: true,
            cap_margin_up: vec![DEFAULT_MARGIN_UP; 3],
            cap_margin_down: vec![DEFAULT_MARGIN_DOWN; 3],
            fair_cap_margin: DEFAULT_MARGIN_UP,
            rotation_enable: false,
            rotation_threshold_ms: 16,
            rotation_misfit_threshold: 1,
            energy_hysteresis_shift: 4,
        }
    }
}

impl WaltConfig {
    /// Parse a configuration given inline as JSON or as "f:PATH"/"file:PATH".
    pub fn parse(input: &str) -> Result<Self> {
        let config: WaltConfig = if input.starts_with("f:") || input.starts_with("file:") {
            let path = input.split_once(':').map(|(_, path)| path).unwrap_or("");
            let mut f = fs::OpenOptions::new()
                .read(true)
                .open(path)
                .with_context(|| format!("Failed to open config file {path:?}"))?;
            let mut content = String::new();
            f.read_to_string(&mut content)?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file {path:?}"))?
        } else {
            serde_json::from_str(input).context("Failed to parse inline config")?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_ns == 0 {
            bail!("tick_ns must be non-zero");
        }
        if self.window_ns < MIN_WINDOW_NS || self.window_ns > MAX_WINDOW_NS {
            bail!(
                "window_ns {} out of range [{}, {}]",
                self.window_ns,
                MIN_WINDOW_NS,
                MAX_WINDOW_NS
            );
        }
        if self.window_ns % self.tick_ns != 0 {
            bail!(
                "window_ns {} must be a multiple of tick_ns {}",
                self.window_ns,
                self.tick_ns
            );
        }
        if self.hist_size == 0 || self.hist_size > RAVG_HIST_SIZE_MAX {
            bail!(
                "hist_size {} out of range [1, {}]",
                self.hist_size,
                RAVG_HIST_SIZE_MAX
            );
        }
        if self.busy_threshold_pct > 100 {
            bail!("busy_threshold_pct {} exceeds 100", self.busy_threshold_pct);
        }
        if self.init_task_load_pct > 100 {
            bail!("init_task_load_pct {} exceeds 100", self.init_task_load_pct);
        }
        if self.uclamp_threshold > 1000 {
            bail!("uclamp_threshold {} exceeds 1000", self.uclamp_threshold);
        }
        for (name, margins) in [
            ("cap_margin_up", &self.cap_margin_up),
            ("cap_margin_down", &self.cap_margin_down),
        ] {
            if let Some(m) = margins.iter().find(|m| **m < SCHED_CAPACITY_SCALE) {
                bail!("{name} value {m} is below {SCHED_CAPACITY_SCALE}");
            }
        }
        if self.fair_cap_margin < SCHED_CAPACITY_SCALE {
            bail!(
                "fair_cap_margin {} is below {}",
                self.fair_cap_margin,
                SCHED_CAPACITY_SCALE
            );
        }
        if self.energy_hysteresis_shift >= 64 {
            bail!(
                "energy_hysteresis_shift {} too large",
                self.energy_hysteresis_shift
            );
        }
        Ok(())
    }

    /// Up-migration margin of cluster `cluster_id`. Clusters beyond the
    /// configured list reuse the last entry.
    pub fn margin_up(&self, cluster_id: usize) -> u64 {
        Self::margin_of(&self.cap_margin_up, cluster_id, DEFAULT_MARGIN_UP)
    }

    pub fn margin_down(&self, cluster_id: usize) -> u64 {
        Self::margin_of(&self.cap_margin_down, cluster_id, DEFAULT_MARGIN_DOWN)
    }

    fn margin_of(margins: &[u64], cluster_id: usize, default: u64) -> u64 {
        margins
            .get(cluster_id)
            .or(margins.last())
            .copied()
            .unwrap_or(default)
    }

    /// Demand assigned to a task created with `pct` percent initial load.
    pub fn init_load_windows(&self, pct: u32) -> u64 {
        (pct as u64 * self.window_ns) / 100
    }

    pub fn rotation_threshold_ns(&self) -> TimeNs {
        self.rotation_threshold_ms * NSEC_PER_MSEC
    }

    /// True when switching from `self` to `other` needs a full reset of the
    /// accounting state.
    pub fn needs_reactivation(&self, other: &WaltConfig) -> bool {
        self.window_ns != other.window_ns
            || self.hist_size != other.hist_size
            || self.tick_ns != other.tick_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let cfg = WaltConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.window_ns, 16_000_000);
        assert_eq!(cfg.init_load_windows(cfg.init_task_load_pct), 1_600_000);
        assert_eq!(cfg.margin_up(7), 1280);
    }

    #[test]
    fn test_parse_inline() {
        let cfg = WaltConfig::parse(
            r#"{"window_stats_policy": "max_recent_avg", "busy_threshold_pct": 70}"#,
        )
        .unwrap();
        assert_eq!(cfg.window_stats_policy, WindowStatsPolicy::MaxRecentAvg);
        assert_eq!(cfg.busy_threshold_pct, 70);
        assert_eq!(cfg.hist_size, RAVG_HIST_SIZE_MAX);
    }

    #[test]
    fn test_parse_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"rotation_enable": true, "cap_margin_up": [1100, 1300]}}"#).unwrap();
        let input = format!("f:{}", file.path().display());
        let cfg = WaltConfig::parse(&input).unwrap();
        assert!(cfg.rotation_enable);
        assert_eq!(cfg.margin_up(0), 1100);
        assert_eq!(cfg.margin_up(2), 1300);
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(WaltConfig::parse(r#"{"hist_size": 7}"#).is_err());
        assert!(WaltConfig::parse(r#"{"busy_threshold_pct": 101}"#).is_err());
        assert!(WaltConfig::parse(r#"{"window_ns": 15000000}"#).is_err());
        assert!(WaltConfig::parse(r#"{"uclamp_threshold": 2000}"#).is_err());
        assert!(WaltConfig::parse(r#"{"cap_margin_down": [900]}"#).is_err());
        assert!(WaltConfig::parse(r#"{"no_such_knob": 1}"#).is_err());
        assert!(WaltConfig::parse("file:/nonexistent/walt.json").is_err());
    }
}
