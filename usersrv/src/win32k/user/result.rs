//! Send Results
//!
//! A result tracks one synchronous send. It is held from two sides:
//!
//! - **Sender**: on the sender queue's result list until the sender
//!   collects the reply or cancels
//! - **Receiver**: through the queued message, then on the receiver's
//!   received-message stack until the receiver replies and removes it
//!
//! The result is freed exactly once, when both sides have let go.
//!
//! # Callback Sends
//!
//! A callback send does not block. Its payload moves into a completion
//! message that is queued back to the sender once the reply arrives.
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `windows/core/ntuser/kernel/sendmsg.c`

use std::collections::HashMap;

use super::super::ThreadId;
use super::message::{Message, MessageType, QueueStatus, SendReply, INFINITE};
use super::queue::MessageKind;
use super::window::WindowManager;
use super::{Deadline, UserServer};
use crate::ke::DeadlineId;
use crate::status::{NtResult, NtStatus};

/// Identifies a result in the [`ResultTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultId(u64);

/// What happens when the reply is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The sender collects the reply itself
    Immediate,
    /// Queue this message back to the sender
    Callback(Message),
    /// Callback message already delivered
    Delivered,
}

/// Bookkeeping for one synchronous send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResult {
    /// Sender queue, until it collects or cancels
    pub sender: Option<ThreadId>,
    /// Receiver queue, until it replies and removes the result
    pub receiver: Option<ThreadId>,
    /// The message is still queued on the receiver
    pub in_flight: bool,
    pub replied: bool,
    pub error: Option<NtStatus>,
    pub result: isize,
    pub data: Vec<u8>,
    pub completion: Completion,
    /// Reply timeout
    pub timeout: Option<DeadlineId>,
}

/// Arena of live results
#[derive(Debug, Default)]
pub struct ResultTable {
    entries: HashMap<ResultId, MessageResult>,
    next_id: u64,
    freed: u64,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, result: MessageResult) -> ResultId {
        self.next_id += 1;
        let id = ResultId(self.next_id);
        self.entries.insert(id, result);
        id
    }

    fn remove(&mut self, id: ResultId) -> Option<MessageResult> {
        let result = self.entries.remove(&id);
        debug_assert!(result.is_some(), "result {:?} freed twice", id);
        if result.is_some() {
            self.freed += 1;
        }
        result
    }

    pub fn get(&self, id: ResultId) -> Option<&MessageResult> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ResultId) -> Option<&mut MessageResult> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: ResultId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Live results
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Results allocated so far
    pub fn allocated(&self) -> u64 {
        self.next_id
    }

    /// Results freed so far
    pub fn freed(&self) -> u64 {
        self.freed
    }
}

impl<W: WindowManager> UserServer<W> {
    /// Allocate a result for a message sent from `sender` to `receiver`
    pub(crate) fn alloc_message_result(
        &mut self,
        sender: ThreadId,
        receiver: ThreadId,
        msg: &mut Message,
        timeout: u32,
    ) -> ResultId {
        let completion = if msg.msg_type == MessageType::Callback {
            let mut callback = Message::new(MessageType::CallbackResult, msg.win, msg.msg, 0, 0);
            callback.time = self.now_ticks();
            // Steal the payload from the original message
            callback.data = std::mem::take(&mut msg.data);
            Completion::Callback(callback)
        } else {
            Completion::Immediate
        };
        let is_callback = matches!(completion, Completion::Callback(_));

        let id = self.results.insert(MessageResult {
            sender: Some(sender),
            receiver: Some(receiver),
            in_flight: true,
            replied: false,
            error: None,
            result: 0,
            data: Vec::new(),
            completion,
            timeout: None,
        });

        if let Some(queue) = self.queues.get_mut(&sender) {
            if is_callback {
                queue.callback_result.push_front(id);
            } else {
                queue.send_result.push_front(id);
            }
        }

        if timeout != INFINITE {
            let deadline = self.deadlines.arm_after(u64::from(timeout), Deadline::ReplyTimeout(id));
            if let Some(res) = self.results.get_mut(id) {
                res.timeout = Some(deadline);
            }
        }

        msg.result = Some(id);
        log::trace!("[USER/Result] Result {:?} for {} -> {}", id, sender.0, receiver.0);
        id
    }

    /// Free a result whose sides are both gone
    fn free_result(&mut self, id: ResultId) {
        if let Some(res) = self.results.remove(id) {
            if let Some(deadline) = res.timeout {
                self.deadlines.cancel(deadline);
            }
            log::trace!("[USER/Result] Freed result {:?}", id);
        }
    }

    /// Detach the sender side of a result
    pub(crate) fn remove_result_from_sender(&mut self, id: ResultId) {
        let Some(res) = self.results.get_mut(id) else {
            return;
        };
        if let Some(sender) = res.sender.take() {
            if let Some(queue) = self.queues.get_mut(&sender) {
                queue.send_result.retain(|&r| r != id);
                queue.callback_result.retain(|&r| r != id);
            }
        }
        if res.receiver.is_none() {
            self.free_result(id);
        }
    }

    /// Store the reply and complete the result
    pub(crate) fn store_message_result(&mut self, id: ResultId, result: isize, error: Option<NtStatus>) {
        let Some(res) = self.results.get_mut(id) else {
            return;
        };
        res.result = result;
        res.error = error;
        res.replied = true;
        let timeout = res.timeout.take();
        let sender = res.sender;
        let callback = match std::mem::replace(&mut res.completion, Completion::Delivered) {
            Completion::Callback(msg) => Some(msg),
            other => {
                res.completion = other;
                None
            }
        };
        if let Some(deadline) = timeout {
            self.deadlines.cancel(deadline);
        }

        let Some(sender) = sender else {
            return;
        };
        let Some(queue) = self.queues.get_mut(&sender) else {
            return;
        };

        match callback {
            Some(mut msg) => {
                // Queue the completion in the sender queue
                msg.lparam = result;
                queue.sent.push_back(msg);
                queue.set_bits(QueueStatus::SENDMESSAGE);
                self.remove_result_from_sender(id);
            }
            None => {
                // Wake the sender if it waits on this result
                if queue.send_result.front() == Some(&id) {
                    queue.set_bits(QueueStatus::SMRESULT);
                }
            }
        }
    }

    /// Free a message removed from a queue (or a thread input)
    pub(crate) fn free_message(&mut self, msg: Message) {
        let Some(id) = msg.result else {
            return;
        };
        let Some(res) = self.results.get_mut(id) else {
            return;
        };
        res.in_flight = false;
        if res.sender.is_some() {
            res.receiver = None;
            self.store_message_result(id, 0, Some(NtStatus::AccessDenied));
        } else {
            self.free_result(id);
        }
    }

    /// Remove and free a message from one of a queue's lists
    pub(crate) fn remove_queue_message(&mut self, tid: ThreadId, kind: MessageKind, index: usize) {
        let msg = self
            .queues
            .get_mut(&tid)
            .and_then(|queue| queue.unlink_message(kind, index));
        if let Some(msg) = msg {
            self.free_message(msg);
        }
    }

    /// Reply timeout fired
    pub(crate) fn result_timeout(&mut self, id: ResultId) {
        let Some(res) = self.results.get_mut(id) else {
            return;
        };
        res.timeout = None;

        if res.in_flight {
            // Never received: pull the message back out
            res.in_flight = false;
            let receiver = res.receiver.take();
            let sender = res.sender;
            if let Some(queue) = receiver.and_then(|tid| self.queues.get_mut(&tid)) {
                // The message goes away without touching the result again
                if let Some(index) = queue.sent.iter().position(|m| m.result == Some(id)) {
                    if let Some(msg) = queue.unlink_message(MessageKind::Send, index) {
                        log::trace!("[USER/Result] Dropped unreceived message {:#x}", msg.msg);
                    }
                }
            }
            if sender.is_none() {
                self.free_result(id);
                return;
            }
        }

        log::debug!("[USER/Result] Result {:?} timed out", id);
        self.store_message_result(id, 0, Some(NtStatus::Timeout));
    }

    /// Reply to the message on top of a queue's received stack
    ///
    /// With `remove` the result is popped and the receiver side released.
    /// A result that already has a reply keeps it.
    pub(crate) fn reply_message(
        &mut self,
        tid: ThreadId,
        result: isize,
        error: Option<NtStatus>,
        remove: bool,
        data: &[u8],
    ) -> NtResult<()> {
        let queue = self.queues.get_mut(&tid).ok_or(NtStatus::AccessDenied)?;
        let id = *queue.recv_result.last().ok_or(NtStatus::AccessDenied)?;

        if remove {
            queue.recv_result.pop();
            let Some(res) = self.results.get_mut(id) else {
                return Ok(());
            };
            res.receiver = None;
            if res.sender.is_none() {
                self.free_result(id);
                return Ok(());
            }
        }

        let Some(res) = self.results.get_mut(id) else {
            return Ok(());
        };
        if !res.replied {
            res.data = data.to_vec();
            self.store_message_result(id, result, error);
        }
        Ok(())
    }

    /// Release every result a dying queue holds
    pub(crate) fn cleanup_results(&mut self, tid: ThreadId) {
        loop {
            let next = self
                .queues
                .get(&tid)
                .and_then(|q| q.send_result.front().or_else(|| q.callback_result.front()).copied());
            match next {
                Some(id) => self.remove_result_from_sender(id),
                None => break,
            }
        }
        while self.queues.get(&tid).is_some_and(|q| !q.recv_result.is_empty()) {
            if self.reply_message(tid, 0, Some(NtStatus::AccessDenied), true, &[]).is_err() {
                break;
            }
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Reply to the message currently being processed by `tid`
    ///
    /// `error` is reported to the sender in place of a result.
    pub fn reply_to_current_message(
        &mut self,
        tid: ThreadId,
        result: isize,
        error: Option<NtStatus>,
        remove: bool,
        data: &[u8],
    ) -> NtResult<()> {
        log::trace!("[USER/Result] Thread {} replies {} (remove={})", tid.0, result, remove);
        self.reply_message(tid, result, error, remove, data)
    }

    /// Collect the reply to the latest send of `tid`
    ///
    /// Returns `Pending` until the reply is stored. With `cancel` an
    /// unreplied send is abandoned and reported as `Cancelled`. A reply
    /// payload larger than `max_size` fails with `BufferOverflow` and stays
    /// available.
    pub fn collect_send_reply(&mut self, tid: ThreadId, cancel: bool, max_size: usize) -> NtResult<SendReply> {
        self.ensure_queue(tid)?;
        let queue = self.queues.get(&tid).ok_or(NtStatus::AccessDenied)?;
        let id = *queue.send_result.front().ok_or(NtStatus::Pending)?;
        let res = self.results.get_mut(id).ok_or(NtStatus::Pending)?;

        if !res.replied && !cancel {
            return Err(NtStatus::Pending);
        }
        let outcome = if res.replied {
            if res.data.len() > max_size {
                return Err(NtStatus::BufferOverflow);
            }
            match res.error {
                Some(error) => Err(error),
                None => Ok(SendReply {
                    result: res.result,
                    data: std::mem::take(&mut res.data),
                }),
            }
        } else {
            Err(NtStatus::Cancelled)
        };
        self.remove_result_from_sender(id);

        // The new head decides whether a reply is still ready
        let head_replied = self
            .queues
            .get(&tid)
            .and_then(|q| q.send_result.front())
            .and_then(|&next| self.results.get(next))
            .is_some_and(|r| r.replied);
        if let Some(queue) = self.queues.get_mut(&tid) {
            if head_replied {
                queue.set_bits(QueueStatus::SMRESULT);
            } else {
                queue.clear_bits(QueueStatus::SMRESULT);
            }
        }
        outcome
    }

    /// Result table, for inspection
    pub fn results(&self) -> &ResultTable {
        &self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> MessageResult {
        MessageResult {
            sender: None,
            receiver: None,
            in_flight: false,
            replied: false,
            error: None,
            result: 0,
            data: Vec::new(),
            completion: Completion::Immediate,
            timeout: None,
        }
    }

    #[test]
    fn test_table_counts() {
        let mut table = ResultTable::new();
        let a = table.insert(result());
        let b = table.insert(result());
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert!(table.remove(a).is_some());
        assert!(!table.contains(a));
        assert_eq!(table.allocated(), 2);
        assert_eq!(table.freed(), 1);
    }
}
