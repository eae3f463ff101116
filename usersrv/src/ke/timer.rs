//! Deadline Timer Queue
//!
//! One-shot deadlines on a virtual millisecond tick clock. Each deadline
//! carries a small target value telling the owner what to do when it
//! expires (restart a window timer, time out a sent message, fail an
//! asynchronous read).
//!
//! The clock never runs on its own: the owner advances it with
//! [`DeadlineQueue::advance_to`] and then drains expired entries with
//! [`DeadlineQueue::pop_expired`], which hands them back in due-time order
//! with the clock set to each deadline's due time. This keeps every expiry
//! inside the same serialized context as request handling.
//!
//! # Usage
//! ```
//! use usersrv::ke::timer::DeadlineQueue;
//!
//! let mut deadlines: DeadlineQueue<&str> = DeadlineQueue::new();
//! let id = deadlines.arm_after(100, "reply timeout");
//! deadlines.advance_to(250);
//! assert_eq!(deadlines.pop_expired(), Some((id, "reply timeout")));
//! assert_eq!(deadlines.now(), 100);
//! ```

use std::collections::{BTreeMap, HashMap};

/// Milliseconds on the server tick clock
pub type Ticks = u64;

/// Identifies one armed deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeadlineId(u64);

/// Sorted set of armed one-shot deadlines
#[derive(Debug)]
pub struct DeadlineQueue<T> {
    /// Current tick count
    now: Ticks,
    /// Time the owner asked to advance to
    target: Ticks,
    /// Next id to hand out (never reused)
    next_id: u64,
    /// Armed deadlines ordered by (due time, arm order)
    armed: BTreeMap<(Ticks, u64), T>,
    /// Due time of each armed id, for cancellation
    due: HashMap<u64, Ticks>,
}

impl<T> Default for DeadlineQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeadlineQueue<T> {
    pub fn new() -> Self {
        Self {
            now: 0,
            target: 0,
            next_id: 1,
            armed: BTreeMap::new(),
            due: HashMap::new(),
        }
    }

    /// Current tick count in milliseconds
    pub fn now(&self) -> Ticks {
        self.now
    }

    /// Arm a deadline at an absolute tick
    ///
    /// A deadline in the past expires on the next drain.
    pub fn arm_at(&mut self, when: Ticks, target: T) -> DeadlineId {
        let id = self.next_id;
        self.next_id += 1;
        self.armed.insert((when, id), target);
        self.due.insert(id, when);
        DeadlineId(id)
    }

    /// Arm a deadline `delay_ms` from now
    pub fn arm_after(&mut self, delay_ms: u64, target: T) -> DeadlineId {
        let when = self.now.saturating_add(delay_ms);
        self.arm_at(when, target)
    }

    /// Disarm a deadline
    ///
    /// Returns the target if the deadline was still armed.
    pub fn cancel(&mut self, id: DeadlineId) -> Option<T> {
        let when = self.due.remove(&id.0)?;
        self.armed.remove(&(when, id.0))
    }

    /// Check whether a deadline is still armed
    pub fn is_armed(&self, id: DeadlineId) -> bool {
        self.due.contains_key(&id.0)
    }

    /// Due time of an armed deadline
    pub fn due_time(&self, id: DeadlineId) -> Option<Ticks> {
        self.due.get(&id.0).copied()
    }

    /// Earliest armed due time
    pub fn next_due(&self) -> Option<Ticks> {
        self.armed.keys().next().map(|&(when, _)| when)
    }

    /// Number of armed deadlines
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Move the advance target forward; the clock itself moves while
    /// draining. Moving backwards is ignored.
    pub fn advance_to(&mut self, when: Ticks) {
        if when > self.target {
            self.target = when;
        }
        if self.next_due().map_or(true, |due| due > self.target) {
            self.now = self.now.max(self.target);
        }
    }

    /// Advance the target by `delta_ms`
    pub fn advance_by(&mut self, delta_ms: u64) {
        let target = self.target.max(self.now).saturating_add(delta_ms);
        self.advance_to(target);
    }

    /// Take the earliest deadline due at or before the advance target
    ///
    /// The clock is set to the deadline's due time (never backwards). Once
    /// nothing more is due, the clock catches up with the target.
    pub fn pop_expired(&mut self) -> Option<(DeadlineId, T)> {
        let target = self.target.max(self.now);
        match self.armed.keys().next().copied() {
            Some((when, id)) if when <= target => {
                let entry = self.armed.remove(&(when, id))?;
                self.due.remove(&id);
                self.now = self.now.max(when);
                Some((DeadlineId(id), entry))
            }
            _ => {
                self.now = target;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_order_and_clock() {
        let mut q = DeadlineQueue::new();
        let late = q.arm_at(300, 'c');
        let early = q.arm_at(100, 'a');
        let mid = q.arm_at(200, 'b');

        q.advance_to(250);
        assert_eq!(q.pop_expired(), Some((early, 'a')));
        assert_eq!(q.now(), 100);
        assert_eq!(q.pop_expired(), Some((mid, 'b')));
        assert_eq!(q.now(), 200);
        assert_eq!(q.pop_expired(), None);
        assert_eq!(q.now(), 250);
        assert!(q.is_armed(late));
    }

    #[test]
    fn test_cancel() {
        let mut q = DeadlineQueue::new();
        let id = q.arm_after(10, 1u32);
        assert_eq!(q.cancel(id), Some(1));
        assert_eq!(q.cancel(id), None);
        q.advance_to(100);
        assert_eq!(q.pop_expired(), None);
        assert_eq!(q.now(), 100);
    }

    #[test]
    fn test_rearm_during_drain() {
        let mut q = DeadlineQueue::new();
        q.arm_at(100, 0u32);
        q.advance_to(1000);
        let mut fired = 0;
        while let Some((_, n)) = q.pop_expired() {
            fired += 1;
            if n < 3 {
                q.arm_after(100, n + 1);
            }
        }
        assert_eq!(fired, 4);
        assert_eq!(q.now(), 1000);
    }
}
