//! Fixed time windows for quota accounting.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Length of a fixed quota window.
///
/// Windows are aligned to the Unix epoch: a window starts at
/// `now - (now mod size)`, so every process computes the same boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second windows
    Second,
    /// Per-minute windows
    #[default]
    Minute,
    /// Per-hour windows
    Hour,
    /// Per-day windows
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    /// Window length in whole seconds.
    pub fn as_secs(&self) -> u64 {
        match self {
            TimeWindow::Second => 1,
            TimeWindow::Minute => 60,
            TimeWindow::Hour => 3600,
            TimeWindow::Day => 86400,
        }
    }

    /// Start of the window containing `now_secs` (epoch seconds).
    pub fn start_of(&self, now_secs: u64) -> u64 {
        now_secs - (now_secs % self.as_secs())
    }

    /// Time left until the window containing `now_secs` rolls over.
    pub fn reset_after(&self, now_secs: u64) -> Duration {
        let end = self.start_of(now_secs) + self.as_secs();
        Duration::from_secs(end - now_secs)
    }
}
