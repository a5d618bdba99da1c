//! Health Monitor (spec §4.3). Three independent last-seen/budget
//! pairs, polled synchronously by the supervisor on every tick --
//! there's no channel here, just plain fields the supervisor owns.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Watch {
    last_seen: Instant,
    budget: Option<Duration>,
}

impl Watch {
    fn new(now: Instant, budget: Option<Duration>) -> Self {
        Watch { last_seen: now, budget }
    }

    fn refresh(&mut self, now: Instant) {
        self.last_seen = now;
    }

    fn expired(&self, now: Instant) -> bool {
        match self.budget {
            None => false,
            Some(budget) => now.saturating_duration_since(self.last_seen) > budget,
        }
    }
}

/// The set of watches that have exceeded their budget as of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthFlags {
    pub board: bool,
    pub nozzle: bool,
    pub operator: bool,
}

impl HealthFlags {
    pub fn any(&self) -> bool {
        self.board || self.nozzle || self.operator
    }
}

pub struct HealthMonitor {
    board: Watch,
    nozzle: Watch,
    operator: Watch,
    operator_active_budget: Duration,
}

impl HealthMonitor {
    pub fn new(now: Instant, board_budget: Duration, nozzle_budget: Duration, operator_active_budget: Duration) -> Self {
        HealthMonitor {
            board: Watch::new(now, Some(board_budget)),
            nozzle: Watch::new(now, Some(nozzle_budget)),
            operator: Watch::new(now, None),
            operator_active_budget,
        }
    }

    pub fn refresh_board(&mut self, now: Instant) {
        self.board.refresh(now);
    }

    pub fn refresh_nozzle(&mut self, now: Instant) {
        self.nozzle.refresh(now);
    }

    pub fn refresh_operator(&mut self, now: Instant) {
        self.operator.refresh(now);
    }

    /// Idle has no operator-contact budget; every other state bounds
    /// it to `operator_active_budget`.
    pub fn set_operator_active(&mut self, now: Instant, active: bool) {
        self.operator.budget = if active {
            Some(self.operator_active_budget)
        } else {
            None
        };
        self.operator.refresh(now);
    }

    pub fn expired(&self, now: Instant) -> HealthFlags {
        HealthFlags {
            board: self.board.expired(now),
            nozzle: self.nozzle.expired(now),
            operator: self.operator.expired(now),
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.board.refresh(now);
        self.nozzle.refresh(now);
        self.operator = Watch::new(now, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_expires_after_budget() {
        let t0 = Instant::now();
        let mut m = HealthMonitor::new(t0, Duration::from_secs(40), Duration::from_secs(40), Duration::from_secs(600));

        assert!(!m.expired(t0).any());
        assert!(m.expired(t0 + Duration::from_secs(41)).board);

        m.refresh_board(t0 + Duration::from_secs(41));
        assert!(!m.expired(t0 + Duration::from_secs(41)).board);
    }

    #[test]
    fn operator_is_unbounded_until_marked_active() {
        let t0 = Instant::now();
        let mut m = HealthMonitor::new(t0, Duration::from_secs(40), Duration::from_secs(40), Duration::from_secs(600));

        assert!(!m.expired(t0 + Duration::from_secs(10_000)).operator);

        m.set_operator_active(t0, true);
        assert!(m.expired(t0 + Duration::from_secs(601)).operator);

        m.set_operator_active(t0 + Duration::from_secs(601), false);
        assert!(!m.expired(t0 + Duration::from_secs(100_000)).operator);
    }
}
