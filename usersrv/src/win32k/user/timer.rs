//! USER Timer Lists
//!
//! Window timers owned by one message queue. Each queue keeps two lists:
//!
//! - **pending**: armed timers sorted by next expiry, earliest first
//! - **expired**: timers that fired and wait for `get_message` to collect
//!
//! The queue arms a single deadline for the head of the pending list. When
//! it fires, exactly that timer moves to the expired list and the deadline
//! is rearmed for the new head.
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `windows/core/ntuser/kernel/timers.c`

use std::collections::VecDeque;

use super::super::{ThreadId, HWND};
use super::message::{check_msg_filter, GetMessageReply, QueueStatus};
use super::window::WindowManager;
use super::{Deadline, UserServer};
use crate::ke::{DeadlineId, Ticks};
use crate::status::{NtResult, NtStatus};

/// Minimum timer interval in milliseconds
pub const USER_TIMER_MINIMUM: u32 = 1;

/// Window timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer {
    /// Next expiration time (tick count)
    pub when: Ticks,
    /// Repeat interval in milliseconds
    pub rate: u32,
    pub win: HWND,
    /// Message code to post (WM_TIMER or WM_SYSTIMER)
    pub msg: u32,
    /// Timer id (unique per window and message)
    pub id: usize,
    /// Parameter (usually the timer procedure)
    pub lparam: isize,
}

impl Timer {
    pub fn new(win: HWND, msg: u32, id: usize, rate: u32, lparam: isize) -> Self {
        Self {
            when: 0,
            rate: rate.max(USER_TIMER_MINIMUM),
            win,
            msg,
            id,
            lparam,
        }
    }

    fn matches(&self, win: HWND, msg: u32, id: usize) -> bool {
        self.win == win && self.msg == msg && self.id == id
    }

    /// Advance by whole periods until the next expiry is at least one
    /// period after `now`
    fn restart(&mut self, now: Ticks) {
        let rate = Ticks::from(self.rate);
        let target = now + rate;
        if self.when < target {
            let periods = (target - self.when).div_ceil(rate);
            self.when += periods * rate;
        }
    }
}

/// Where a timer currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSlot {
    Pending(usize),
    Expired(usize),
}

/// Per-queue timer lists
#[derive(Debug, Default)]
pub struct TimerList {
    /// Armed timers, ascending by `when`
    pending: Vec<Timer>,
    /// Fired timers, in expiry order
    expired: VecDeque<Timer>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a timer into the pending list keeping it sorted
    ///
    /// Returns true if the timer became the new head.
    pub fn link(&mut self, timer: Timer) -> bool {
        let pos = self.pending.partition_point(|t| t.when <= timer.when);
        self.pending.insert(pos, timer);
        pos == 0
    }

    /// Find a timer in either list
    pub fn find(&self, win: HWND, msg: u32, id: usize) -> Option<TimerSlot> {
        if let Some(i) = self.pending.iter().position(|t| t.matches(win, msg, id)) {
            return Some(TimerSlot::Pending(i));
        }
        self.expired
            .iter()
            .position(|t| t.matches(win, msg, id))
            .map(TimerSlot::Expired)
    }

    /// Unlink a timer
    pub fn remove(&mut self, slot: TimerSlot) -> Option<Timer> {
        match slot {
            TimerSlot::Pending(i) if i < self.pending.len() => Some(self.pending.remove(i)),
            TimerSlot::Expired(i) => self.expired.remove(i),
            TimerSlot::Pending(_) => None,
        }
    }

    /// Move the earliest pending timer to the expired list
    pub fn expire_head(&mut self) -> Option<&Timer> {
        if self.pending.is_empty() {
            return None;
        }
        let timer = self.pending.remove(0);
        self.expired.push_back(timer);
        self.expired.back()
    }

    /// Expiry of the earliest pending timer
    pub fn next_due(&self) -> Option<Ticks> {
        self.pending.first().map(|t| t.when)
    }

    /// First expired timer matching a window and message range
    ///
    /// A null `win` matches every window.
    pub fn find_expired(&self, win: HWND, first: u32, last: u32) -> Option<usize> {
        self.expired
            .iter()
            .position(|t| (!win.is_valid() || t.win == win) && check_msg_filter(t.msg, first, last))
    }

    pub fn expired_at(&self, index: usize) -> Option<&Timer> {
        self.expired.get(index)
    }

    /// Rearm an expired timer relative to `now`
    ///
    /// Returns true if it became the new pending head.
    pub fn restart(&mut self, index: usize, now: Ticks) -> Option<bool> {
        let mut timer = self.expired.remove(index)?;
        timer.restart(now);
        Some(self.link(timer))
    }

    /// Drop every timer owned by `win`, returning how many were freed
    pub fn remove_window(&mut self, win: HWND) -> usize {
        let before = self.len();
        self.pending.retain(|t| t.win != win);
        self.expired.retain(|t| t.win != win);
        before - self.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.expired.clear();
    }

    pub fn has_expired(&self) -> bool {
        !self.expired.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.expired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending list is sorted ascending
    pub fn is_sorted(&self) -> bool {
        self.pending.windows(2).all(|w| w[0].when <= w[1].when)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Timer> {
        self.pending.iter()
    }
}

// ============================================================================
// Timer Requests
// ============================================================================

impl<W: WindowManager> UserServer<W> {
    /// Queue that owns the timers of `win`
    ///
    /// Window timers live in the queue of the window's thread, which must
    /// belong to the caller's process. Window-less timers live in the
    /// caller's own queue.
    fn timer_owner(&mut self, tid: ThreadId, win: HWND) -> NtResult<(ThreadId, HWND)> {
        let process = self.threads.get(&tid).ok_or(NtStatus::InvalidCid)?.process;
        if !win.is_valid() {
            self.ensure_queue(tid)?;
            return Ok((tid, win));
        }
        let win = self.windows.full_handle(win);
        let owner = self.windows.window_thread(win).ok_or(NtStatus::InvalidHandle)?;
        if self.threads.get(&owner).map(|t| t.process) != Some(process) {
            return Err(NtStatus::AccessDenied);
        }
        self.ensure_queue(owner)?;
        Ok((owner, win))
    }

    /// Rearm the queue deadline for the pending head and sync QS_TIMER
    pub(crate) fn set_next_timer(&mut self, tid: ThreadId) {
        let Some(queue) = self.queues.get_mut(&tid) else {
            return;
        };
        if let Some(deadline) = queue.timeout.take() {
            self.deadlines.cancel(deadline);
        }
        if let Some(when) = queue.timers.next_due() {
            queue.timeout = Some(self.deadlines.arm_at(when, Deadline::QueueTimer(tid)));
        }

        if queue.timers.has_expired() {
            queue.set_bits(QueueStatus::TIMER);
        } else {
            queue.clear_bits(QueueStatus::TIMER);
        }
    }

    /// The queue deadline fired: expire the earliest pending timer
    pub(crate) fn timer_expired(&mut self, tid: ThreadId, deadline: DeadlineId) {
        let Some(queue) = self.queues.get_mut(&tid) else {
            return;
        };
        if queue.timeout != Some(deadline) {
            return;
        }
        queue.timeout = None;
        if let Some(timer) = queue.timers.expire_head() {
            log::trace!("[USER/Timer] Timer {} of {:#x} expired", timer.id, timer.win.raw());
        }
        self.set_next_timer(tid);
    }

    /// Take the first expired timer matching a filter as a message
    ///
    /// With `remove` the timer is restarted.
    pub(crate) fn collect_timer(
        &mut self,
        tid: ThreadId,
        get_win: HWND,
        first: u32,
        last: u32,
        remove: bool,
    ) -> Option<GetMessageReply> {
        let now = self.now();
        let time = self.now_ticks();
        let queue = self.queues.get_mut(&tid)?;
        let index = queue.timers.find_expired(get_win, first, last)?;
        let timer = queue.timers.expired_at(index)?;
        let reply = GetMessageReply::synthesized(timer.win, timer.msg, timer.id, timer.lparam, time);
        if remove {
            queue.timers.restart(index, now);
            self.set_next_timer(tid);
        }
        Some(reply)
    }

    /// Create or replace a timer, returning its id
    ///
    /// A window-less timer given id 0 (or an id not in use) gets a fresh
    /// id from the queue's descending cursor.
    pub fn set_window_timer(
        &mut self,
        tid: ThreadId,
        win: HWND,
        msg: u32,
        id: usize,
        rate: u32,
        lparam: isize,
    ) -> NtResult<usize> {
        let (owner, win) = self.timer_owner(tid, win)?;
        let now = self.now();
        let first_id = self.config.thread_timer_id_first;
        let last_id = self.config.thread_timer_id_last;
        let queue = self.queues.get_mut(&owner).ok_or(NtStatus::InvalidCid)?;

        let mut id = id;
        if win.is_valid() {
            if let Some(slot) = queue.timers.find(win, msg, id) {
                queue.timers.remove(slot);
            }
        } else if let Some(slot) = queue.timers.find(HWND::NULL, msg, id).filter(|_| id != 0) {
            // Free and reuse the id
            queue.timers.remove(slot);
        } else {
            let mut free = None;
            for _ in 0..=first_id.saturating_sub(last_id) {
                let candidate = queue.next_timer_id;
                queue.next_timer_id = queue.next_timer_id.saturating_sub(1);
                if queue.next_timer_id <= last_id {
                    queue.next_timer_id = first_id;
                }
                if queue.timers.find(HWND::NULL, msg, candidate).is_none() {
                    free = Some(candidate);
                    break;
                }
            }
            id = free.ok_or(NtStatus::NoMemory)?;
        }

        let mut timer = Timer::new(win, msg, id, rate, lparam);
        timer.when = now + Ticks::from(timer.rate);
        log::trace!("[USER/Timer] Set timer {} of {:#x} every {}ms", id, win.raw(), timer.rate);
        queue.timers.link(timer);
        self.set_next_timer(owner);
        Ok(id)
    }

    pub fn kill_window_timer(&mut self, tid: ThreadId, win: HWND, msg: u32, id: usize) -> NtResult<()> {
        let (owner, win) = self.timer_owner(tid, win)?;
        let queue = self.queues.get_mut(&owner).ok_or(NtStatus::InvalidCid)?;
        let slot = queue.timers.find(win, msg, id).ok_or(NtStatus::InvalidParameter)?;
        queue.timers.remove(slot);
        self.set_next_timer(owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::win32k::UserObjectType;
    use crate::win32k::user::message::WM_TIMER;

    fn win(n: u16) -> HWND {
        HWND::new(n, UserObjectType::Window)
    }

    fn timer_at(id: usize, when: Ticks) -> Timer {
        let mut t = Timer::new(win(1), WM_TIMER, id, 100, 0);
        t.when = when;
        t
    }

    #[test]
    fn test_link_keeps_order() {
        let mut list = TimerList::new();
        assert!(list.link(timer_at(1, 300)));
        assert!(list.link(timer_at(2, 100)));
        assert!(!list.link(timer_at(3, 200)));
        assert!(!list.link(timer_at(4, 100)));
        assert!(list.is_sorted());
        let ids: Vec<_> = list.pending().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_expire_and_restart_catches_up() {
        let mut list = TimerList::new();
        list.link(timer_at(1, 100));
        assert_eq!(list.expire_head().map(|t| t.id), Some(1));
        assert!(list.has_expired());

        let idx = list.find_expired(HWND::NULL, 0, u32::MAX).unwrap();
        assert_eq!(list.restart(idx, 350), Some(true));
        assert_eq!(list.next_due(), Some(500));
        assert!(!list.has_expired());
    }

    #[test]
    fn test_rate_clamped() {
        let t = Timer::new(win(1), WM_TIMER, 1, 0, 0);
        assert_eq!(t.rate, USER_TIMER_MINIMUM);
    }

    #[test]
    fn test_remove_window() {
        let mut list = TimerList::new();
        list.link(timer_at(1, 100));
        let mut other = timer_at(2, 50);
        other.win = win(2);
        list.link(other);
        list.expire_head();
        assert_eq!(list.remove_window(win(1)), 1);
        assert_eq!(list.find(win(2), WM_TIMER, 2), Some(TimerSlot::Expired(0)));
        assert_eq!(list.find(win(1), WM_TIMER, 1), None);
    }
}
