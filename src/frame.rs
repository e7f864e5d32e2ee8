//! Frame scheduler (§4.4): coalesces per-PTY "state changed" pokes into
//! rate-limited render ticks, at most one render per soft frame budget `F`
//! per PTY.
//!
//! The deadline-ordered heap and its "create the wakeup marker before
//! checking state" shape are carried over from the teacher's `MessageQueue`
//! in `queue.rs`, whose `wait_and_dequeue` creates the `Notify::notified()`
//! future before checking the queue so a concurrent enqueue can't be missed
//! between the check and the await. Here the same hazard exists between
//! checking `last_render_time` and arming a timer, so timers are pushed onto
//! an ordered heap immediately rather than after a gap where a second poke
//! could race the first.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

pub const DEFAULT_FRAME_BUDGET: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RenderNow,
    TimerArmed,
    AlreadyCovered,
}

struct FrameState {
    last_render_time: Instant,
    timer_pending: bool,
}

/// A pending one-shot timer, ordered by deadline and then by registration
/// sequence (ties break by registration order, per §4.3).
struct TimerEntry {
    deadline: Instant,
    sequence: u64,
    pty_id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline first, so
        // reverse the comparison (mirrors queue.rs's PriorityMessage wrapper).
        Reverse((self.deadline, self.sequence)).cmp(&Reverse((other.deadline, other.sequence)))
    }
}

pub struct FrameScheduler {
    budget: Duration,
    states: HashMap<u64, FrameState>,
    timers: BinaryHeap<TimerEntry>,
    sequence: u64,
}

impl FrameScheduler {
    pub fn new(budget: Duration) -> Self {
        FrameScheduler {
            budget,
            states: HashMap::new(),
            timers: BinaryHeap::new(),
            sequence: 0,
        }
    }

    fn state_mut(&mut self, pty_id: u64, now: Instant) -> &mut FrameState {
        self.states.entry(pty_id).or_insert_with(|| FrameState {
            // A PTY seen for the first time renders immediately on its first
            // poke: treat it as if its last render happened one budget ago.
            last_render_time: now - self.budget,
            timer_pending: false,
        })
    }

    /// Called when a PTY's notify pipe becomes readable (all pending bytes
    /// already drained by the caller). Implements §4.4 steps 2-3.
    pub fn on_notify(&mut self, pty_id: u64, now: Instant) -> Decision {
        let budget = self.budget;
        let state = self.state_mut(pty_id, now);
        let dt = now.saturating_duration_since(state.last_render_time);
        if dt >= budget {
            state.last_render_time = now;
            state.timer_pending = false;
            Decision::RenderNow
        } else if !state.timer_pending {
            state.timer_pending = true;
            let deadline = now + (budget - dt);
            self.sequence += 1;
            self.timers.push(TimerEntry {
                deadline,
                sequence: self.sequence,
                pty_id,
            });
            Decision::TimerArmed
        } else {
            Decision::AlreadyCovered
        }
    }

    /// Earliest pending timer deadline, if any, for the event loop to await.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|t| t.deadline)
    }

    /// Pop and render every timer due at or before `now`, clearing their
    /// pending flags. Returns the set of PTYs that should be re-rendered.
    pub fn fire_due(&mut self, now: Instant) -> Vec<u64> {
        let mut fired = Vec::new();
        while let Some(top) = self.timers.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.timers.pop().unwrap();
            if let Some(state) = self.states.get_mut(&entry.pty_id) {
                if !state.timer_pending {
                    // Superseded by a render that already happened; skip.
                    continue;
                }
                state.last_render_time = now;
                state.timer_pending = false;
            }
            fired.push(entry.pty_id);
        }
        fired
    }

    /// Cancel a PTY's pending timer before releasing its memory (§4.4).
    pub fn cancel(&mut self, pty_id: u64) {
        self.states.remove(&pty_id);
        // Entries left in `timers` for this pty_id become no-ops in
        // `fire_due` because `states` no longer has an entry for them.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_poke_renders_immediately() {
        let mut sched = FrameScheduler::new(Duration::from_millis(16));
        let now = Instant::now();
        assert_eq!(sched.on_notify(1, now), Decision::RenderNow);
    }

    #[test]
    fn burst_within_budget_arms_one_timer() {
        let mut sched = FrameScheduler::new(Duration::from_millis(16));
        let t0 = Instant::now();
        assert_eq!(sched.on_notify(1, t0), Decision::RenderNow);
        // Ten more pokes within the budget window.
        for i in 1..=10 {
            let t = t0 + Duration::from_millis(i);
            let decision = sched.on_notify(1, t);
            if i == 1 {
                assert_eq!(decision, Decision::TimerArmed);
            } else {
                assert_eq!(decision, Decision::AlreadyCovered);
            }
        }
        let fired = sched.fire_due(t0 + Duration::from_millis(20));
        assert_eq!(fired, vec![1]);
    }

    #[test]
    fn poke_after_budget_elapses_renders_again() {
        let mut sched = FrameScheduler::new(Duration::from_millis(16));
        let t0 = Instant::now();
        sched.on_notify(1, t0);
        let decision = sched.on_notify(1, t0 + Duration::from_millis(17));
        assert_eq!(decision, Decision::RenderNow);
    }

    #[test]
    fn cancel_drops_future_fires() {
        let mut sched = FrameScheduler::new(Duration::from_millis(16));
        let t0 = Instant::now();
        sched.on_notify(1, t0);
        sched.on_notify(1, t0 + Duration::from_millis(1));
        sched.cancel(1);
        let fired = sched.fire_due(t0 + Duration::from_millis(20));
        assert!(fired.is_empty());
    }

    #[test]
    fn independent_ptys_track_separately() {
        let mut sched = FrameScheduler::new(Duration::from_millis(16));
        let t0 = Instant::now();
        assert_eq!(sched.on_notify(1, t0), Decision::RenderNow);
        assert_eq!(sched.on_notify(2, t0), Decision::RenderNow);
    }
}
