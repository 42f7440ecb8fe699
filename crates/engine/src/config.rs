// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Immutable configuration snapshot read once at engine construction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Line topology: one combined trigger/diverter device, or a trigger
/// device plus an ordered row of diverter devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    Single,
    Multi,
}

/// Acceptable age range for correlating a timestamp with a signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeWindow {
    pub lower_ms: u64,
    pub upper_ms: u64,
}

impl TimeWindow {
    pub fn lower(&self) -> Duration {
        Duration::from_millis(self.lower_ms)
    }

    pub fn upper(&self) -> Duration {
        Duration::from_millis(self.upper_ms)
    }

    /// Whether `delay` falls inside the window widened by `slack` on both ends.
    pub fn contains(&self, delay: Duration, slack: Duration) -> bool {
        delay >= self.lower().saturating_sub(slack) && delay <= self.upper() + slack
    }
}

/// The trigger photoelectric upstream of all diverters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerPeConfig {
    pub address: String,
    pub port: u16,
    pub window: TimeWindow,
}

/// One sort photoelectric / pendulum diverter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortPeConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Acceptable trigger-to-sort-signal delay for parcels on this diverter.
    pub window: TimeWindow,
    /// Wait after the sort signal before swinging, letting the parcel
    /// reach the arm.
    pub sorting_delay_ms: u64,
    /// Wait after a swing before returning the arm to neutral.
    pub reset_delay_ms: u64,
}

impl SortPeConfig {
    pub fn sorting_delay(&self) -> Duration {
        Duration::from_millis(self.sorting_delay_ms)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }
}

/// Full engine configuration. Immutable for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortConfig {
    pub mode: SortMode,
    pub trigger: TriggerPeConfig,
    pub sort_pes: Vec<SortPeConfig>,
    /// Minimum gap between rising edges on one photoelectric channel.
    #[serde(default = "default_debounce_ms")]
    pub global_debounce_ms: u64,
    /// Lifetime of a parcel whose chute no diverter owns.
    #[serde(default = "default_straight_through_ms")]
    pub straight_through_timeout_ms: u64,
    /// Largest trigger-time gap for the consecutive same-chute optimization.
    #[serde(default = "default_continuous_ms")]
    pub continuous_sort_max_interval_ms: u64,
}

fn default_debounce_ms() -> u64 {
    30
}

fn default_straight_through_ms() -> u64 {
    5_000
}

fn default_continuous_ms() -> u64 {
    2_000
}

impl SortConfig {
    /// Validate the configuration after construction or deserialization.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sort_pes.is_empty() {
            anyhow::bail!("at least one sort photoelectric must be configured");
        }
        if self.mode == SortMode::Single && self.sort_pes.len() != 1 {
            anyhow::bail!(
                "single mode requires exactly one sort photoelectric, got {}",
                self.sort_pes.len()
            );
        }

        let mut names: Vec<&str> = self.sort_pes.iter().map(|pe| pe.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.sort_pes.len() {
            anyhow::bail!("sort photoelectric names must be unique");
        }

        if self.trigger.window.lower_ms > self.trigger.window.upper_ms {
            anyhow::bail!("trigger window lower bound exceeds upper bound");
        }
        for pe in &self.sort_pes {
            if pe.name.is_empty() {
                anyhow::bail!("sort photoelectric name must not be empty");
            }
            if pe.window.lower_ms > pe.window.upper_ms {
                anyhow::bail!("window lower bound exceeds upper bound for {}", pe.name);
            }
        }

        Ok(())
    }

    /// Look up a sort PE by name.
    pub fn sort_pe(&self, name: &str) -> Option<&SortPeConfig> {
        self.sort_pes.iter().find(|pe| pe.name == name)
    }

    pub fn global_debounce(&self) -> Duration {
        Duration::from_millis(self.global_debounce_ms)
    }

    pub fn straight_through_timeout(&self) -> Duration {
        Duration::from_millis(self.straight_through_timeout_ms)
    }

    pub fn continuous_sort_max_interval(&self) -> Duration {
        Duration::from_millis(self.continuous_sort_max_interval_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
