use std::time::{Duration, Instant};

/// Cadence at which the inbound loop hands control back to the scheduler
/// while dispatching callbacks. With no limits set the loop never yields
/// mid-batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct YieldPolicy {
    pub max_frames: Option<usize>,
    pub max_time: Option<Duration>,
}

impl YieldPolicy {
    #[must_use]
    pub fn never() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn every_frames(frames: usize) -> Self {
        Self {
            max_frames: Some(frames.max(1)),
            max_time: None,
        }
    }

    #[must_use]
    pub fn every_duration(time: Duration) -> Self {
        Self {
            max_frames: None,
            max_time: Some(time),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max_frames.is_some() || self.max_time.is_some()
    }
}

/// Tracks the current batch against a [`YieldPolicy`].
#[derive(Debug, Clone)]
pub struct YieldBudget {
    policy: YieldPolicy,
    frames: usize,
    started: Instant,
}

impl YieldBudget {
    #[must_use]
    pub fn new(policy: YieldPolicy) -> Self {
        Self {
            policy,
            frames: 0,
            started: Instant::now(),
        }
    }

    /// Counts one processed frame and reports whether the batch is spent.
    /// A spent budget resets itself.
    pub fn record_frame(&mut self) -> bool {
        self.record_frame_at(Instant::now())
    }

    pub fn record_frame_at(&mut self, now: Instant) -> bool {
        self.frames += 1;
        let frames_spent = self.policy.max_frames.is_some_and(|max| self.frames >= max);
        let time_spent = self
            .policy
            .max_time
            .is_some_and(|max| now.duration_since(self.started) >= max);
        if frames_spent || time_spent {
            self.reset_at(now);
            true
        } else {
            false
        }
    }

    /// Starts a fresh batch, for callers that yielded on their own.
    pub fn reset(&mut self) {
        self.reset_at(Instant::now());
    }

    fn reset_at(&mut self, now: Instant) {
        self.frames = 0;
        self.started = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_yields_by_default() {
        let mut budget = YieldBudget::new(YieldPolicy::never());
        assert!(!YieldPolicy::never().is_enabled());
        assert!((0..10_000).all(|_| !budget.record_frame()));
    }

    #[test]
    fn test_frame_budget() {
        let mut budget = YieldBudget::new(YieldPolicy::every_frames(3));
        assert!(!budget.record_frame());
        assert!(!budget.record_frame());
        assert!(budget.record_frame());
        assert!(!budget.record_frame());
    }

    #[test]
    fn test_reset_starts_new_batch() {
        let mut budget = YieldBudget::new(YieldPolicy::every_frames(3));
        assert!(!budget.record_frame());
        assert!(!budget.record_frame());
        budget.reset();
        assert!(!budget.record_frame());
        assert!(!budget.record_frame());
        assert!(budget.record_frame());
    }

    #[test]
    fn test_time_budget() {
        let start = Instant::now();
        let mut budget = YieldBudget {
            policy: YieldPolicy::every_duration(Duration::from_millis(5)),
            frames: 0,
            started: start,
        };
        assert!(!budget.record_frame_at(start + Duration::from_millis(1)));
        assert!(budget.record_frame_at(start + Duration::from_millis(6)));
        assert!(!budget.record_frame_at(start + Duration::from_millis(7)));
        assert!(budget.record_frame_at(start + Duration::from_millis(12)));
    }

    #[test]
    fn test_zero_frame_policy_clamped() {
        assert_eq!(YieldPolicy::every_frames(0).max_frames, Some(1));
    }
}
