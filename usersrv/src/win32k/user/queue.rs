//! Message Queue
//!
//! Per-thread message queue. Holds the sent and posted message lists, the
//! result stacks of synchronous sends, the window timers and the wake bits
//! that make the queue signaled.
//!
//! # Wake Bits
//!
//! Readiness is level triggered and derived from two pairs of fields:
//!
//! - `wake_bits` / `wake_mask`: categories currently present / wanted
//! - `changed_bits` / `changed_mask`: categories that arrived since the
//!   last check / wanted
//!
//! The queue is signaled when `(wake_bits & wake_mask) != 0` or
//! `(changed_bits & changed_mask) != 0`.
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `windows/core/ntuser/kernel/queue.c`
//! - `windows/core/ntuser/kernel/input.c`

use std::collections::VecDeque;

use super::super::{ProcessId, ThreadId};
use super::hooks::SharedHookTable;
use super::input::InputId;
use super::message::{Message, QueueStatus};
use super::result::ResultId;
use super::timer::TimerList;
use crate::ke::{DeadlineId, Ticks};
use crate::ob::{Object, ObjectKind, PollDescriptor, PollEvents, Pollable};

/// Message list a queued message lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Sent messages, delivered before anything else
    Send,
    /// Posted messages, FIFO
    Post,
}

/// Per-thread message queue
#[derive(Debug)]
pub struct MsgQueue {
    /// Owning thread
    owner: ThreadId,
    process: ProcessId,

    /// Poll descriptor mirroring the signaled state (set once)
    pub(crate) fd: Option<PollDescriptor>,

    /// Categories currently present
    wake_bits: QueueStatus,
    /// Categories the waiter wants to be woken for
    wake_mask: QueueStatus,
    /// Categories that arrived since the last check
    changed_bits: QueueStatus,
    changed_mask: QueueStatus,
    /// Object signal flag
    signal_state: bool,
    /// Owner thread has something to look at
    wake_up: bool,
    /// Number of times waiters were woken
    wakeups: u64,
    /// Threads currently waiting on the queue
    waiters: usize,

    /// Pending WM_PAINT count
    pub(crate) paint_count: u32,
    /// A WM_QUIT is pending
    pub(crate) quit_message: bool,
    pub(crate) exit_code: usize,

    pub(crate) sent: VecDeque<Message>,
    pub(crate) posted: VecDeque<Message>,

    /// Results of our synchronous sends, most recent first
    pub(crate) send_result: VecDeque<ResultId>,
    /// Results of our callback sends, most recent first
    pub(crate) callback_result: VecDeque<ResultId>,
    /// Results of messages we received and must reply to (top is last)
    pub(crate) recv_result: Vec<ResultId>,

    pub(crate) timers: TimerList,
    /// Cursor for window-less timer ids
    pub(crate) next_timer_id: usize,
    /// Deadline armed for the head of the pending timer list
    pub(crate) timeout: Option<DeadlineId>,

    /// Thread input shared with attached threads
    pub(crate) input: InputId,
    pub(crate) hooks: Option<SharedHookTable>,
    /// Last time the owner called `get_message`
    pub(crate) last_get_msg: Ticks,
}

impl MsgQueue {
    pub(crate) fn new(owner: ThreadId, process: ProcessId, input: InputId, first_timer_id: usize, now: Ticks) -> Self {
        Self {
            owner,
            process,
            fd: None,
            wake_bits: QueueStatus::empty(),
            wake_mask: QueueStatus::empty(),
            changed_bits: QueueStatus::empty(),
            changed_mask: QueueStatus::empty(),
            signal_state: false,
            wake_up: false,
            wakeups: 0,
            waiters: 0,
            paint_count: 0,
            quit_message: false,
            exit_code: 0,
            sent: VecDeque::new(),
            posted: VecDeque::new(),
            send_result: VecDeque::new(),
            callback_result: VecDeque::new(),
            recv_result: Vec::new(),
            timers: TimerList::new(),
            next_timer_id: first_timer_id,
            timeout: None,
            input,
            hooks: None,
            last_get_msg: now,
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn input(&self) -> InputId {
        self.input
    }

    pub fn wake_bits(&self) -> QueueStatus {
        self.wake_bits
    }

    pub fn changed_bits(&self) -> QueueStatus {
        self.changed_bits
    }

    pub fn wake_mask(&self) -> QueueStatus {
        self.wake_mask
    }

    pub fn changed_mask(&self) -> QueueStatus {
        self.changed_mask
    }

    pub fn signal_state(&self) -> bool {
        self.signal_state
    }

    /// Number of times a waiter was woken
    pub fn wakeups(&self) -> u64 {
        self.wakeups
    }

    /// Consume the owner's wake-up flag
    pub fn take_wake_up(&mut self) -> bool {
        std::mem::take(&mut self.wake_up)
    }

    pub fn waiters(&self) -> usize {
        self.waiters
    }

    // ========================================================================
    // Wake Bits
    // ========================================================================

    /// Check the queue status
    pub fn satisfied(&self) -> bool {
        self.wake_bits.intersects(self.wake_mask) || self.changed_bits.intersects(self.changed_mask)
    }

    /// Set some queue bits, waking waiters if that signals the queue
    pub fn set_bits(&mut self, bits: QueueStatus) {
        self.wake_bits |= bits;
        self.changed_bits |= bits;
        self.signal_state = true;
        self.wake_up = true;
        if self.satisfied() {
            self.wakeups += 1;
        }
    }

    /// Clear some queue bits
    pub fn clear_bits(&mut self, bits: QueueStatus) {
        self.wake_bits &= !bits;
        self.changed_bits &= !bits;
        self.signal_state = false;
    }

    pub(crate) fn clear_changed(&mut self, bits: QueueStatus) {
        self.changed_bits &= !bits;
    }

    pub(crate) fn set_masks(&mut self, wake_mask: QueueStatus, changed_mask: QueueStatus) {
        self.wake_mask = wake_mask;
        self.changed_mask = changed_mask;
    }

    /// A wait on the queue completed: the masks are consumed
    pub fn wait_satisfied(&mut self) {
        self.wake_mask = QueueStatus::empty();
        self.changed_mask = QueueStatus::empty();
        self.signal_state = false;
    }

    /// Wake waiters without changing any bits
    pub(crate) fn wake_waiters(&mut self) {
        self.wakeups += 1;
    }

    // ========================================================================
    // Waiters and Polling
    // ========================================================================

    /// First waiter arms POLLIN on the descriptor
    pub fn add_waiter(&mut self) {
        if self.waiters == 0 {
            if let Some(fd) = self.fd.as_mut() {
                fd.set_events(PollEvents::POLLIN);
            }
        }
        self.waiters += 1;
    }

    /// Last waiter leaving disarms the descriptor
    pub fn remove_waiter(&mut self) {
        self.waiters = self.waiters.saturating_sub(1);
        if self.waiters == 0 {
            if let Some(fd) = self.fd.as_mut() {
                fd.set_events(PollEvents::empty());
            }
        }
    }

    /// Signaled check as done by a waiter
    ///
    /// Stops polling the descriptor once it reports input and re-arms it
    /// while waiters remain.
    pub fn check_signaled(&mut self) -> bool {
        let waiters = self.waiters;
        let fd_ready = match self.fd.as_mut() {
            Some(fd) => {
                let ready = !fd.check_events(PollEvents::POLLIN).is_empty();
                if ready {
                    fd.set_events(PollEvents::empty());
                } else if waiters > 0 {
                    fd.set_events(PollEvents::POLLIN);
                }
                ready
            }
            None => false,
        };
        fd_ready || self.satisfied()
    }

    /// The poll loop saw `events` on the descriptor
    pub fn poll_event(&mut self, events: PollEvents) {
        if let Some(fd) = self.fd.as_mut() {
            if events.intersects(PollEvents::POLLERR | PollEvents::POLLHUP) {
                fd.disable();
            } else {
                fd.report(events);
            }
        }
        self.wake_waiters();
    }

    /// Owner stopped pumping messages and nobody waits on the queue
    pub fn is_hung(&self, now: Ticks, hung_timeout: Ticks) -> bool {
        now.saturating_sub(self.last_get_msg) > hung_timeout && self.waiters == 0
    }

    // ========================================================================
    // Message Lists
    // ========================================================================

    pub fn list(&self, kind: MessageKind) -> &VecDeque<Message> {
        match kind {
            MessageKind::Send => &self.sent,
            MessageKind::Post => &self.posted,
        }
    }

    pub(crate) fn list_mut(&mut self, kind: MessageKind) -> &mut VecDeque<Message> {
        match kind {
            MessageKind::Send => &mut self.sent,
            MessageKind::Post => &mut self.posted,
        }
    }

    /// Posted plus sent messages
    pub fn message_count(&self) -> usize {
        self.sent.len() + self.posted.len()
    }

    /// Remove a message from a list, clearing the list's bits when it
    /// empties
    ///
    /// The caller frees the message.
    pub(crate) fn unlink_message(&mut self, kind: MessageKind, index: usize) -> Option<Message> {
        let msg = self.list_mut(kind).remove(index)?;
        match kind {
            MessageKind::Send => {
                if self.sent.is_empty() {
                    self.clear_bits(QueueStatus::SENDMESSAGE);
                }
            }
            MessageKind::Post => {
                if self.posted.is_empty() && !self.quit_message {
                    self.clear_bits(QueueStatus::POSTMESSAGE | QueueStatus::ALLPOSTMESSAGE);
                }
            }
        }
        Some(msg)
    }

    pub fn timers(&self) -> &TimerList {
        &self.timers
    }

    /// Results of sends this queue is waiting on, most recent first
    pub fn pending_sends(&self) -> impl Iterator<Item = ResultId> + '_ {
        self.send_result.iter().copied()
    }

    /// Depth of the received-message stack
    pub fn receive_depth(&self) -> usize {
        self.recv_result.len()
    }
}

impl Object for MsgQueue {
    fn kind(&self) -> ObjectKind {
        ObjectKind::MsgQueue
    }

    fn dump(&self) -> String {
        format!(
            "MsgQueue tid={} wake={:?}/{:?} changed={:?}/{:?} sent={} posted={}",
            self.owner.0,
            self.wake_bits,
            self.wake_mask,
            self.changed_bits,
            self.changed_mask,
            self.sent.len(),
            self.posted.len()
        )
    }
}

impl Pollable for MsgQueue {
    fn poll_events(&self) -> PollEvents {
        if self.satisfied() {
            PollEvents::POLLIN
        } else {
            PollEvents::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> MsgQueue {
        MsgQueue::new(ThreadId(1), ProcessId(1), InputId::from_raw(1), 0x7fff, 0)
    }

    #[test]
    fn test_signaled_needs_mask() {
        let mut q = queue();
        q.set_bits(QueueStatus::POSTMESSAGE);
        assert!(q.signal_state());
        assert!(!q.satisfied());
        assert_eq!(q.wakeups(), 0);

        q.set_masks(QueueStatus::POSTMESSAGE, QueueStatus::empty());
        assert!(q.satisfied());
        assert!(q.is_signaled());

        q.set_bits(QueueStatus::POSTMESSAGE);
        assert_eq!(q.wakeups(), 1);

        q.wait_satisfied();
        assert!(!q.satisfied());
        assert_eq!(q.wake_bits(), QueueStatus::POSTMESSAGE);
    }

    #[test]
    fn test_changed_bits() {
        let mut q = queue();
        q.set_bits(QueueStatus::KEY);
        q.clear_changed(QueueStatus::KEY);
        q.set_masks(QueueStatus::empty(), QueueStatus::KEY);
        assert!(!q.satisfied());
        q.set_bits(QueueStatus::KEY);
        assert!(q.satisfied());
        q.clear_bits(QueueStatus::KEY);
        assert!(!q.satisfied());
        assert!(!q.signal_state());
    }

    #[test]
    fn test_fd_follows_waiters() {
        let mut q = queue();
        q.fd = Some(PollDescriptor::new(9));
        q.add_waiter();
        assert_eq!(q.fd.as_ref().map(|fd| fd.interest()), Some(PollEvents::POLLIN));
        q.add_waiter();
        q.remove_waiter();
        assert_eq!(q.fd.as_ref().map(|fd| fd.interest()), Some(PollEvents::POLLIN));
        q.remove_waiter();
        assert_eq!(q.fd.as_ref().map(|fd| fd.interest()), Some(PollEvents::empty()));
    }

    #[test]
    fn test_poll_event_error_disables_fd() {
        let mut q = queue();
        q.fd = Some(PollDescriptor::new(9));
        q.add_waiter();
        q.poll_event(PollEvents::POLLIN);
        assert!(q.check_signaled());
        q.poll_event(PollEvents::POLLHUP);
        assert!(q.fd.as_ref().is_some_and(|fd| fd.is_disabled()));
        assert!(!q.check_signaled());
    }

    #[test]
    fn test_hung() {
        let mut q = queue();
        assert!(!q.is_hung(5000, 5000));
        assert!(q.is_hung(5001, 5000));
        q.add_waiter();
        assert!(!q.is_hung(5001, 5000));
    }
}
