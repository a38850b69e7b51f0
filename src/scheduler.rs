//! Poll scheduler
//!
//! Decides when a poll cycle is due. It owns no thread: the controller asks
//! for the next deadline, sleeps until then, and calls [`PollScheduler::take_due`].
//!
//! Every cycle is handed a [`PollTicket`]. Stopping (or restarting) bumps the
//! generation, so results of cycles started before the stop are refused by
//! [`PollScheduler::accept`]. Within a generation, a result older than one
//! already applied is refused too, which makes slow overlapping fetches safe.

use log::debug;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Identifies one poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTicket {
    pub generation: u64,
    pub sequence: u64,
}

#[derive(Debug)]
pub struct PollScheduler {
    interval: Duration,
    state: SchedulerState,
    generation: u64,
    sequence: u64,
    last_applied: u64,
    next_tick: Option<Instant>,
    /// Extra cycle at the predicted end of the current item
    wake_at: Option<Instant>,
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: SchedulerState::Stopped,
            generation: 0,
            sequence: 0,
            last_applied: 0,
            next_tick: None,
            wake_at: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SchedulerState::Running
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Takes effect from the next start.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Start polling, the first cycle due immediately.
    ///
    /// Returns false (and changes nothing) if already running.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.is_running() {
            debug!("Poll scheduler already running");
            return false;
        }
        self.state = SchedulerState::Running;
        self.generation += 1;
        self.last_applied = 0;
        self.next_tick = Some(now);
        self.wake_at = None;
        debug!("Poll scheduler started (every {:?})", self.interval);
        true
    }

    /// Stop polling and cancel every pending timer.
    ///
    /// Returns false if already stopped.
    pub fn stop(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.state = SchedulerState::Stopped;
        self.generation += 1;
        self.next_tick = None;
        self.wake_at = None;
        debug!("Poll scheduler stopped");
        true
    }

    /// Earliest moment something is due
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.next_tick, self.wake_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Hand out a ticket if a cycle is due at `now`.
    ///
    /// A due regular tick moves to the following interval; a missed tick is
    /// not replayed. A due wake-up is consumed.
    pub fn take_due(&mut self, now: Instant) -> Option<PollTicket> {
        if !self.is_running() {
            return None;
        }

        let mut due = false;

        if let Some(tick) = self.next_tick {
            if tick <= now {
                let mut next = tick + self.interval;
                if next <= now {
                    next = now + self.interval;
                }
                self.next_tick = Some(next);
                due = true;
            }
        }

        if let Some(wake) = self.wake_at {
            if wake <= now {
                self.wake_at = None;
                due = true;
            }
        }

        if !due {
            return None;
        }

        self.sequence += 1;
        Some(PollTicket {
            generation: self.generation,
            sequence: self.sequence,
        })
    }

    /// Whether a result for `ticket` would still be accepted.
    pub fn is_current(&self, ticket: PollTicket) -> bool {
        self.is_running() && ticket.generation == self.generation
    }

    /// Accept the result of `ticket`, refusing stale or out-of-order results.
    pub fn accept(&mut self, ticket: PollTicket) -> bool {
        if !self.is_current(ticket) || ticket.sequence <= self.last_applied {
            return false;
        }
        self.last_applied = ticket.sequence;
        true
    }

    /// Poll once more when the current item is predicted to end.
    ///
    /// Only kept if it comes before the next regular tick; replaces any
    /// earlier wake-up.
    pub fn wake_at_item_end(&mut self, now: Instant, remaining: Duration) {
        if !self.is_running() {
            return;
        }
        let at = now + remaining;
        self.wake_at = match self.next_tick {
            Some(tick) if at < tick => Some(at),
            _ => None,
        };
    }

    /// Make the next regular tick due immediately.
    pub fn poll_now(&mut self, now: Instant) {
        if self.is_running() {
            self.next_tick = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(15);

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_stopped_never_due() {
        let now = Instant::now();
        let mut scheduler = PollScheduler::new(INTERVAL);
        assert_eq!(scheduler.next_deadline(), None);
        assert!(scheduler.take_due(now + secs(100)).is_none());
    }

    #[test]
    fn test_start_polls_immediately_then_every_interval() {
        let now = Instant::now();
        let mut scheduler = PollScheduler::new(INTERVAL);
        assert!(scheduler.start(now));

        assert!(scheduler.take_due(now).is_some());
        assert!(scheduler.take_due(now + secs(14)).is_none());
        assert_eq!(scheduler.next_deadline(), Some(now + INTERVAL));
        assert!(scheduler.take_due(now + INTERVAL).is_some());
        assert_eq!(scheduler.next_deadline(), Some(now + secs(30)));
    }

    #[test]
    fn test_start_twice_is_noop() {
        let now = Instant::now();
        let mut scheduler = PollScheduler::new(INTERVAL);
        assert!(scheduler.start(now));
        let ticket = scheduler.take_due(now).unwrap();

        assert!(!scheduler.start(now + secs(1)));
        // Same generation, same single timer
        assert!(scheduler.is_current(ticket));
        assert_eq!(scheduler.next_deadline(), Some(now + INTERVAL));
    }

    #[test]
    fn test_missed_ticks_are_not_replayed() {
        let now = Instant::now();
        let mut scheduler = PollScheduler::new(INTERVAL);
        scheduler.start(now);
        scheduler.take_due(now);

        assert!(scheduler.take_due(now + secs(100)).is_some());
        assert!(scheduler.take_due(now + secs(100)).is_none());
        assert_eq!(scheduler.next_deadline(), Some(now + secs(115)));
    }

    #[test]
    fn test_stop_discards_in_flight_results() {
        let now = Instant::now();
        let mut scheduler = PollScheduler::new(INTERVAL);
        scheduler.start(now);
        let ticket = scheduler.take_due(now).unwrap();

        assert!(scheduler.stop());
        assert!(!scheduler.stop());
        assert!(!scheduler.accept(ticket));
        assert_eq!(scheduler.next_deadline(), None);

        // Restarting does not revive the old ticket either
        scheduler.start(now + secs(1));
        assert!(!scheduler.accept(ticket));
    }

    #[test]
    fn test_out_of_order_results_refused() {
        let now = Instant::now();
        let mut scheduler = PollScheduler::new(INTERVAL);
        scheduler.start(now);
        let slow = scheduler.take_due(now).unwrap();
        let fast = scheduler.take_due(now + INTERVAL).unwrap();

        assert!(scheduler.accept(fast));
        assert!(!scheduler.accept(slow));
        assert!(!scheduler.accept(fast));
    }

    #[test]
    fn test_wake_at_item_end() {
        let now = Instant::now();
        let mut scheduler = PollScheduler::new(INTERVAL);
        scheduler.start(now);
        scheduler.take_due(now);

        scheduler.wake_at_item_end(now, secs(4));
        assert_eq!(scheduler.next_deadline(), Some(now + secs(4)));
        assert!(scheduler.take_due(now + secs(4)).is_some());
        // The regular tick is untouched
        assert_eq!(scheduler.next_deadline(), Some(now + INTERVAL));
    }

    #[test]
    fn test_wake_after_next_tick_is_dropped() {
        let now = Instant::now();
        let mut scheduler = PollScheduler::new(INTERVAL);
        scheduler.start(now);
        scheduler.take_due(now);

        scheduler.wake_at_item_end(now, secs(4));
        scheduler.wake_at_item_end(now, secs(600));
        assert_eq!(scheduler.next_deadline(), Some(now + INTERVAL));
    }

    #[test]
    fn test_poll_now() {
        let now = Instant::now();
        let mut scheduler = PollScheduler::new(INTERVAL);
        scheduler.poll_now(now);
        assert_eq!(scheduler.next_deadline(), None);

        scheduler.start(now);
        scheduler.take_due(now);
        scheduler.poll_now(now + secs(3));
        assert!(scheduler.take_due(now + secs(3)).is_some());
    }
}
