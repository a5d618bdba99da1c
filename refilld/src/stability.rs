//! Meter Stability Filter (spec §4.2, I2, P5, R2).
//!
//! A meter reading is only trusted once `meter_stability_count`
//! consecutive samples report the same value **and** at least
//! `meter_stability_duration` has elapsed since the first of that
//! matching run -- that's what tells the supervisor the nozzle has
//! actually stopped counting rather than paused between ticks. The
//! run is tracked independently of the sample buffer: `window` only
//! bounds how long a reading stays visible to `current()`/
//! `needs_persist()`, so pruning it never erases how long the
//! current run has been going. Pure and synchronous: the caller
//! supplies the timestamp of each sample so this can be driven by a
//! real clock in production and a fake one in tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct StabilityFilter {
    required: usize,
    window: Duration,
    stability_duration: Duration,
    samples: VecDeque<(Instant, f64)>,
    run_value: Option<f64>,
    run_start: Option<Instant>,
    run_count: usize,
    last_stable: Option<f64>,
    last_saved: Option<f64>,
}

impl StabilityFilter {
    pub fn new(required: usize, window: Duration, stability_duration: Duration) -> Self {
        StabilityFilter {
            required: required.max(1),
            window,
            stability_duration,
            samples: VecDeque::new(),
            run_value: None,
            run_start: None,
            run_count: 0,
            last_stable: None,
            last_saved: None,
        }
    }

    /// Records a new reading. A value that matches the run in
    /// progress extends it; anything else starts a new run at `now`.
    /// Separately, drops samples older than the freshness window and
    /// caps the buffer at twice the required count -- there's never
    /// a reason to remember more than that for `current()`.
    pub fn push(&mut self, now: Instant, value: f64) {
        match self.run_value {
            Some(v) if (v - value).abs() < f64::EPSILON => {
                self.run_count += 1;
            }
            _ => {
                self.run_value = Some(value);
                self.run_start = Some(now);
                self.run_count = 1;
            }
        }

        self.samples.push_back((now, value));

        while let Some(&(t, _)) = self.samples.front() {
            if now.saturating_duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        while self.samples.len() > self.required * 2 {
            self.samples.pop_front();
        }
    }

    pub fn current(&self) -> Option<f64> {
        self.samples.back().map(|(_, v)| *v)
    }

    pub fn last_stable(&self) -> Option<f64> {
        self.last_stable
    }

    /// True once the current run has seen `required` matching
    /// samples and spans at least `stability_duration` from the
    /// first of that run to the most recent push.
    pub fn is_stable(&self) -> bool {
        if self.run_count < self.required {
            return false;
        }

        let Some(run_start) = self.run_start else {
            return false;
        };

        let Some(&(latest, _)) = self.samples.back() else {
            return false;
        };

        latest.saturating_duration_since(run_start) >= self.stability_duration
    }

    /// If stable, records and returns the agreed value; otherwise
    /// leaves `last_stable` unchanged and returns `None`.
    pub fn stable_value(&mut self) -> Option<f64> {
        if self.is_stable() {
            let v = self.current();
            self.last_stable = v;
            v
        } else {
            None
        }
    }

    pub fn mark_saved(&mut self, value: f64) {
        self.last_saved = Some(value);
    }

    /// Returns the current value if it has drifted from the last
    /// saved value by at least `step` liters -- the
    /// `persist_step_liters` throttle on how often the supervisor
    /// writes to the transaction store mid-dispense.
    pub fn needs_persist(&self, step: f64) -> Option<f64> {
        let cur = self.current()?;

        match self.last_saved {
            None => Some(cur),
            Some(saved) if (cur - saved).abs() >= step => Some(cur),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.run_value = None;
        self.run_start = None;
        self.run_count = 0;
        self.last_stable = None;
        self.last_saved = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_n_matching_samples_before_declaring_stable() {
        let mut f = StabilityFilter::new(2, Duration::from_secs(5), Duration::from_secs(5));
        let t0 = Instant::now();

        f.push(t0, 10.0);
        assert!(!f.is_stable());

        // Matching, but the run hasn't spanned the required duration yet.
        f.push(t0 + Duration::from_millis(100), 10.0);
        assert!(!f.is_stable());

        f.push(t0 + Duration::from_secs(5), 10.0);
        assert!(f.is_stable());
        assert_eq!(f.stable_value(), Some(10.0));
    }

    #[test]
    fn a_changing_value_never_reads_stable() {
        let mut f = StabilityFilter::new(2, Duration::from_secs(5), Duration::from_secs(5));
        let t0 = Instant::now();

        f.push(t0, 10.0);
        f.push(t0 + Duration::from_secs(5), 10.2);
        assert!(!f.is_stable());
        assert_eq!(f.stable_value(), None);
    }

    #[test]
    fn a_value_change_restarts_the_run_clock() {
        let mut f = StabilityFilter::new(2, Duration::from_secs(30), Duration::from_secs(5));
        let t0 = Instant::now();

        f.push(t0, 10.0);
        f.push(t0 + Duration::from_secs(3), 10.0);
        // Matches in count, but only 3s into the run -- not yet stable.
        assert!(!f.is_stable());

        // A different reading resets the run, even though it's still
        // within the freshness window.
        f.push(t0 + Duration::from_secs(4), 11.0);
        assert!(!f.is_stable());

        f.push(t0 + Duration::from_secs(9), 11.0);
        assert!(f.is_stable());
        assert_eq!(f.current(), Some(11.0));
    }

    #[test]
    fn samples_outside_the_freshness_window_are_dropped_from_current() {
        let mut f = StabilityFilter::new(2, Duration::from_secs(5), Duration::from_secs(5));
        let t0 = Instant::now();

        f.push(t0, 10.0);
        f.push(t0 + Duration::from_secs(10), 10.0);

        // The run still spans the required duration even though the
        // first sample aged out of the freshness buffer.
        assert!(f.is_stable());
    }

    #[test]
    fn persist_throttles_on_step_size() {
        let mut f = StabilityFilter::new(2, Duration::from_secs(5), Duration::from_secs(5));
        let t0 = Instant::now();

        f.push(t0, 0.4);
        assert_eq!(f.needs_persist(1.0), Some(0.4));
        f.mark_saved(0.4);

        f.push(t0 + Duration::from_millis(50), 0.9);
        assert_eq!(f.needs_persist(1.0), None);

        f.push(t0 + Duration::from_millis(100), 1.5);
        assert_eq!(f.needs_persist(1.0), Some(1.5));
    }

    #[test]
    fn reset_clears_history_and_saved_marker() {
        let mut f = StabilityFilter::new(2, Duration::from_secs(5), Duration::from_secs(5));
        let t0 = Instant::now();

        f.push(t0, 10.0);
        f.push(t0 + Duration::from_secs(5), 10.0);
        f.stable_value();
        f.mark_saved(10.0);

        f.reset();

        assert_eq!(f.current(), None);
        assert_eq!(f.last_stable(), None);
        assert_eq!(f.needs_persist(1.0), None);
        assert!(!f.is_stable());
    }
}
