//! Cloud service reachability tracking.
//!
//! A single HTTP failure doesn't mean the service is down — it means the
//! last request failed. "Down" is a debounced notion: only once we've been
//! failing continuously for an hour do we tell the field that the gateway
//! is isolated, and only after two hours do we give up and restart the
//! radio on the assumption that a stuck transceiver, not the cloud, is the
//! real cause.

use std::time::{Duration, Instant};

use tracing::info;

/// Minutes of continuous failure before `should_notify_down` starts firing.
pub const DEBOUNCE_MINUTES: u64 = 60;

/// Default minutes of continuous failure before an extended-outage restart
/// is warranted, taken from the original gateway's
/// `restartWhenUnreachableMinutes` default.
pub const DEFAULT_RESTART_MINUTES: u64 = 120;

#[derive(Debug)]
pub struct ReachabilityState {
    reachable: bool,
    first_unreachable_at: Option<Instant>,
    /// Set the first time this process ever observes a failed request;
    /// never cleared by a later recovery. A process-lifetime marker, not
    /// a per-outage one — `first_unreachable_at` already tracks the
    /// current outage's onset.
    ever_unreachable: bool,
}

impl ReachabilityState {
    pub fn new() -> Self {
        Self {
            reachable: true,
            first_unreachable_at: None,
            ever_unreachable: false,
        }
    }

    /// Record the outcome of the most recent request.
    pub fn record(&mut self, ok: bool) {
        if ok {
            if !self.reachable {
                let elapsed = self.outage_duration().unwrap_or_default();
                info!(elapsed_minutes = elapsed.as_secs() / 60, "service reachable again");
            }
            self.reachable = true;
            self.first_unreachable_at = None;
        } else if self.reachable {
            self.reachable = false;
            self.first_unreachable_at = Some(Instant::now());
            self.ever_unreachable = true;
        }
        // Already unreachable and still failing: keep the original
        // first_unreachable_at timestamp so the outage duration accrues.
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Whether the service has ever failed a request during this
    /// process's lifetime, even if it has since recovered.
    pub fn ever_unreachable(&self) -> bool {
        self.ever_unreachable
    }

    fn outage_duration(&self) -> Option<Duration> {
        self.first_unreachable_at.map(|t| t.elapsed())
    }

    /// True once the outage has persisted past the debounce threshold —
    /// the point at which we start synthesizing "down" notifications.
    pub fn should_notify_down(&self) -> bool {
        self.outage_duration()
            .is_some_and(|d| d >= Duration::from_secs(DEBOUNCE_MINUTES * 60))
    }

    /// True once the outage has persisted past `restart_minutes` — the
    /// point at which the gateway should reboot the radio rather than
    /// keep waiting.
    pub fn should_restart(&self, restart_minutes: u64) -> bool {
        self.outage_duration()
            .is_some_and(|d| d >= Duration::from_secs(restart_minutes * 60))
    }
}

impl Default for ReachabilityState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_reachable() {
        let state = ReachabilityState::new();
        assert!(state.is_reachable());
        assert!(!state.should_notify_down());
    }

    #[test]
    fn single_failure_does_not_notify() {
        let mut state = ReachabilityState::new();
        state.record(false);
        assert!(!state.is_reachable());
        assert!(!state.should_notify_down());
    }

    #[test]
    fn recovery_clears_outage_timer() {
        let mut state = ReachabilityState::new();
        state.record(false);
        state.record(true);
        assert!(state.is_reachable());
        assert!(!state.should_notify_down());
    }

    #[test]
    fn repeated_failure_keeps_original_onset() {
        let mut state = ReachabilityState::new();
        state.record(false);
        let first_onset = state.first_unreachable_at;
        state.record(false);
        assert_eq!(state.first_unreachable_at, first_onset);
    }

    #[test]
    fn restart_threshold_is_configurable() {
        let state = ReachabilityState::new();
        // Never been unreachable: never restarts regardless of threshold.
        assert!(!state.should_restart(0));
    }

    #[test]
    fn ever_unreachable_survives_recovery() {
        let mut state = ReachabilityState::new();
        assert!(!state.ever_unreachable());
        state.record(false);
        assert!(state.ever_unreachable());
        state.record(true);
        assert!(state.is_reachable());
        assert!(state.ever_unreachable());
    }
}
