//! USER Message Server
//!
//! Per-thread message queues and the requests that drive them. A
//! [`UserServer`] owns every queue, thread input, send result and window
//! timer, and handles one request at a time:
//!
//! - **Post**: append to the receiver's posted list
//! - **Send**: append to the receiver's sent list with a result the sender
//!   collects later (notify sends carry no result)
//! - **Get**: sent messages first, then posted, quit, hardware, paint and
//!   timer messages
//!
//! Requests never block. When nothing is ready the request fails with
//! `Pending` and the caller waits on the queue's wake bits.
//!
//! Time is the server tick clock; [`UserServer::advance_time`] fires
//! window timers and reply timeouts that fall due.
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `windows/core/ntuser/kernel/queue.c`
//! - `windows/core/ntuser/kernel/sendmsg.c`
//! - `windows/core/ntuser/kernel/ntinput.c`

pub mod hooks;
pub mod input;
pub mod message;
pub mod queue;
pub mod result;
pub mod timer;
pub mod window;

mod tests_prop;

use std::collections::HashMap;

pub use hooks::{HookTable, SharedHookTable};
pub use input::{InputId, InputTable, ThreadInput};
pub use message::{
    GetMessageReply, GetMessageRequest, HardwareInput, Message, MessageType, QueueStatus, SendMessageRequest,
    SendReply, WinEventData,
};
pub use queue::{MessageKind, MsgQueue};
pub use result::{ResultId, ResultTable};
pub use timer::{Timer, TimerList};
pub use window::{WindowManager, WindowTable};

use super::{DesktopId, ProcessId, ThreadId, HWND};
use crate::config::UserConfig;
use crate::ke::{DeadlineQueue, Ticks};
use crate::ob::PollDescriptor;
use crate::ob::PollEvents;
use crate::status::{NtResult, NtStatus};
use message::{check_msg_filter, filter_contains_hw_range, SEND_MSG_ABORT_IF_HUNG, WM_PAINT, WM_QUIT};

/// What a server deadline does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deadline {
    /// Expire the earliest pending timer of a queue
    QueueTimer(ThreadId),
    /// A sent message was not replied to in time
    ReplyTimeout(ResultId),
}

/// Registered client thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub process: ProcessId,
    pub desktop: DesktopId,
}

/// Wake and changed bits of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueBits {
    pub wake_bits: QueueStatus,
    pub changed_bits: QueueStatus,
}

// ============================================================================
// User Server
// ============================================================================

/// Message queues of every client thread
#[derive(Debug)]
pub struct UserServer<W: WindowManager = WindowTable> {
    pub(crate) config: UserConfig,
    pub(crate) windows: W,
    pub(crate) threads: HashMap<ThreadId, ThreadInfo>,
    pub(crate) queues: HashMap<ThreadId, MsgQueue>,
    pub(crate) inputs: InputTable,
    pub(crate) results: ResultTable,
    pub(crate) deadlines: DeadlineQueue<Deadline>,
    /// Input of the foreground window's thread
    pub(crate) foreground_input: Option<InputId>,
    /// Tick count of the last hardware message
    pub(crate) last_input_time: u32,
    /// Last hardware message id handed out (never 0)
    pub(crate) unique_id: u32,
}

impl UserServer<WindowTable> {
    /// Server with the built-in window table
    pub fn new(config: UserConfig) -> Self {
        Self::with_window_manager(config, WindowTable::new())
    }
}

impl<W: WindowManager> UserServer<W> {
    pub fn with_window_manager(config: UserConfig, windows: W) -> Self {
        Self {
            config,
            windows,
            threads: HashMap::new(),
            queues: HashMap::new(),
            inputs: InputTable::new(),
            results: ResultTable::new(),
            deadlines: DeadlineQueue::new(),
            foreground_input: None,
            last_input_time: 0,
            unique_id: 0,
        }
    }

    pub fn config(&self) -> &UserConfig {
        &self.config
    }

    pub fn windows(&self) -> &W {
        &self.windows
    }

    pub fn windows_mut(&mut self) -> &mut W {
        &mut self.windows
    }

    /// Current server time
    pub fn now(&self) -> Ticks {
        self.deadlines.now()
    }

    /// Message time stamp; wraps like a 32-bit tick count
    pub(crate) fn now_ticks(&self) -> u32 {
        self.now() as u32
    }

    pub(crate) fn next_unique_id(&mut self) -> u32 {
        self.unique_id = self.unique_id.wrapping_add(1);
        if self.unique_id == 0 {
            self.unique_id = 1;
        }
        self.unique_id
    }

    pub fn queue(&self, tid: ThreadId) -> Option<&MsgQueue> {
        self.queues.get(&tid)
    }

    /// Thread input currently used by a thread's queue
    pub fn thread_input(&self, tid: ThreadId) -> Option<&ThreadInput> {
        self.queue_input(tid).and_then(|id| self.inputs.get(id))
    }

    pub fn inputs(&self) -> &InputTable {
        &self.inputs
    }

    fn queue_mut(&mut self, tid: ThreadId) -> NtResult<&mut MsgQueue> {
        if !self.threads.contains_key(&tid) {
            return Err(NtStatus::InvalidCid);
        }
        self.queues.get_mut(&tid).ok_or(NtStatus::InvalidHandle)
    }

    // ========================================================================
    // Thread and Queue Lifetime
    // ========================================================================

    /// Make a client thread known to the server
    pub fn register_thread(&mut self, tid: ThreadId, process: ProcessId, desktop: DesktopId) -> NtResult<()> {
        if self.threads.contains_key(&tid) {
            return Err(NtStatus::InvalidParameter);
        }
        self.threads.insert(tid, ThreadInfo { process, desktop });
        log::trace!("[USER/Queue] Registered thread {} of process {}", tid.0, process.0);
        Ok(())
    }

    pub fn thread_info(&self, tid: ThreadId) -> Option<&ThreadInfo> {
        self.threads.get(&tid)
    }

    /// Create the queue of a thread
    ///
    /// `input` is an input reference owned by the caller; without one a
    /// private input is created. An existing queue is kept and the passed
    /// reference released.
    pub fn create_message_queue(&mut self, tid: ThreadId, input: Option<InputId>) -> NtResult<()> {
        let Some(&ThreadInfo { process, desktop }) = self.threads.get(&tid) else {
            if let Some(id) = input {
                self.release_input(id);
            }
            return Err(NtStatus::InvalidCid);
        };
        if self.queues.contains_key(&tid) {
            if let Some(id) = input {
                self.release_input(id);
            }
            return Ok(());
        }

        let input = match input {
            Some(id) => id,
            None => self.inputs.create(desktop),
        };
        let queue = MsgQueue::new(tid, process, input, self.config.thread_timer_id_first, self.now());
        self.queues.insert(tid, queue);
        log::debug!("[USER/Queue] Created queue for thread {} (input {})", tid.0, input.raw());
        Ok(())
    }

    /// Create the queue on first use
    pub(crate) fn ensure_queue(&mut self, tid: ThreadId) -> NtResult<()> {
        if self.queues.contains_key(&tid) {
            return Ok(());
        }
        self.create_message_queue(tid, None)
    }

    /// Tear down a thread's queue and forget the thread
    ///
    /// Senders waiting on this thread get `AccessDenied`; everything the
    /// queue owns is freed.
    pub fn destroy_queue_on_thread_exit(&mut self, tid: ThreadId) {
        match self.queues.get_mut(&tid) {
            Some(queue) => queue.hooks = None,
            None => {
                self.threads.remove(&tid);
                return;
            }
        }

        self.cleanup_results(tid);

        let lists = self
            .queues
            .get_mut(&tid)
            .map(|q| (std::mem::take(&mut q.sent), std::mem::take(&mut q.posted)));
        if let Some((sent, posted)) = lists {
            for msg in sent.into_iter().chain(posted) {
                self.free_message(msg);
            }
        }

        if let Some(mut queue) = self.queues.remove(&tid) {
            queue.timers.clear();
            if let Some(deadline) = queue.timeout.take() {
                self.deadlines.cancel(deadline);
            }
            self.release_input(queue.input);
        }
        self.threads.remove(&tid);
        log::debug!("[USER/Queue] Destroyed queue of thread {}", tid.0);
    }

    // ========================================================================
    // Posting and Sending
    // ========================================================================

    fn check_quota(&self, tid: ThreadId) -> NtResult<()> {
        match self.queues.get(&tid) {
            Some(queue) if queue.message_count() >= self.config.max_queue_messages => {
                log::warn!("[USER/Queue] Queue of thread {} is full", tid.0);
                Err(NtStatus::QuotaExceeded)
            }
            _ => Ok(()),
        }
    }

    /// Post a message to the thread that owns `win`
    pub fn post_message(&mut self, win: HWND, msg: u32, wparam: usize, lparam: isize) -> NtResult<()> {
        let win = self.windows.full_handle(win);
        let owner = self.windows.window_thread(win).ok_or(NtStatus::InvalidHandle)?;
        if !self.queues.contains_key(&owner) {
            return Err(NtStatus::InvalidHandle);
        }
        self.check_quota(owner)?;

        let mut message = Message::new(MessageType::Posted, win, msg, wparam, lparam);
        message.time = self.now_ticks();
        self.queue_posted(owner, message);
        Ok(())
    }

    fn queue_posted(&mut self, tid: ThreadId, msg: Message) {
        if let Some(queue) = self.queues.get_mut(&tid) {
            log::trace!("[USER/Queue] Post {:#x} to thread {}", msg.msg, tid.0);
            queue.posted.push_back(msg);
            queue.set_bits(QueueStatus::POSTMESSAGE | QueueStatus::ALLPOSTMESSAGE);
        }
    }

    fn queue_sent(&mut self, tid: ThreadId, msg: Message) {
        if let Some(queue) = self.queues.get_mut(&tid) {
            log::trace!("[USER/Queue] Send {:#x} to thread {}", msg.msg, tid.0);
            queue.sent.push_back(msg);
            queue.set_bits(QueueStatus::SENDMESSAGE);
        }
    }

    /// Send or post a message to another thread
    ///
    /// Synchronous and callback sends allocate a result; the sender picks
    /// the reply up with [`UserServer::collect_send_reply`] (synchronous)
    /// or as a callback-result message (callback).
    pub fn send_message(&mut self, sender: ThreadId, req: SendMessageRequest) -> NtResult<()> {
        if matches!(
            req.msg_type,
            MessageType::Hardware | MessageType::CallbackResult | MessageType::WinEvent
        ) {
            return Err(NtStatus::InvalidParameter);
        }
        if !self.threads.contains_key(&sender) || !self.threads.contains_key(&req.dest) {
            return Err(NtStatus::InvalidCid);
        }
        if req.msg_type.needs_result() {
            self.ensure_queue(sender)?;
        }
        let Some(recv) = self.queues.get(&req.dest) else {
            return Err(NtStatus::InvalidParameter);
        };
        if req.flags & SEND_MSG_ABORT_IF_HUNG != 0 && recv.is_hung(self.now(), self.config.hung_timeout_ms) {
            log::warn!("[USER/Queue] Thread {} is hung", req.dest.0);
            return Err(NtStatus::Timeout);
        }
        self.check_quota(req.dest)?;

        let win = self.windows.full_handle(req.win);
        let mut msg = Message::new(req.msg_type, win, req.msg, req.wparam, req.lparam);
        msg.time = self.now_ticks();
        msg.data = req.data;

        match req.msg_type {
            MessageType::Posted => self.queue_posted(req.dest, msg),
            MessageType::Notify => self.queue_sent(req.dest, msg),
            _ => {
                self.alloc_message_result(sender, req.dest, &mut msg, req.timeout);
                self.queue_sent(req.dest, msg);
            }
        }
        Ok(())
    }

    /// Queue WM_QUIT for a thread
    ///
    /// The quit message is retrieved after every posted message and is not
    /// subject to window or range filters.
    pub fn post_quit_message(&mut self, tid: ThreadId, exit_code: usize) -> NtResult<()> {
        self.ensure_queue(tid)?;
        let queue = self.queue_mut(tid)?;
        queue.quit_message = true;
        queue.exit_code = exit_code;
        queue.set_bits(QueueStatus::POSTMESSAGE | QueueStatus::ALLPOSTMESSAGE);
        Ok(())
    }

    /// Queue a win event for an out-of-context event hook
    pub fn post_win_event(
        &mut self,
        dest: ThreadId,
        event: u32,
        win: HWND,
        object_id: usize,
        child_id: isize,
        hook: &WinEventData,
    ) -> NtResult<()> {
        if !self.threads.contains_key(&dest) {
            return Err(NtStatus::InvalidCid);
        }
        if !self.queues.contains_key(&dest) {
            return Err(NtStatus::InvalidParameter);
        }
        let win = self.windows.full_handle(win);
        let mut msg = Message::new(MessageType::WinEvent, win, event, object_id, child_id);
        msg.time = self.now_ticks();
        msg.data = hook.to_bytes();
        self.queue_sent(dest, msg);
        Ok(())
    }

    // ========================================================================
    // Retrieval
    // ========================================================================

    /// Check whether `win` passes a window filter
    fn match_window(&self, filter: HWND, win: HWND) -> bool {
        !filter.is_valid() || win == filter || self.windows.is_child_window(filter, win)
    }

    /// Take the first sent message; its result moves to the receive stack
    fn receive_message(&mut self, tid: ThreadId, max_size: usize) -> NtResult<Option<GetMessageReply>> {
        let Some(queue) = self.queues.get_mut(&tid) else {
            return Ok(None);
        };
        match queue.sent.front() {
            Some(msg) if msg.data.len() > max_size => return Err(NtStatus::BufferOverflow),
            Some(_) => {}
            None => return Ok(None),
        }
        let Some(mut msg) = queue.unlink_message(MessageKind::Send, 0) else {
            return Ok(None);
        };

        let data = std::mem::take(&mut msg.data);
        let reply = GetMessageReply::from_message(&msg, data);
        if let Some(id) = msg.result {
            queue.recv_result.push(id);
            if let Some(res) = self.results.get_mut(id) {
                res.in_flight = false;
            }
        }
        log::trace!("[USER/Queue] Thread {} received {:#x}", tid.0, reply.msg);
        Ok(Some(reply))
    }

    fn get_posted_message(
        &mut self,
        tid: ThreadId,
        get_win: HWND,
        first: u32,
        last: u32,
        remove: bool,
        max_size: usize,
    ) -> NtResult<Option<GetMessageReply>> {
        let Some(queue) = self.queues.get(&tid) else {
            return Ok(None);
        };
        let Some(index) = queue
            .posted
            .iter()
            .position(|m| self.match_window(get_win, m.win) && check_msg_filter(m.msg, first, last))
        else {
            return Ok(None);
        };

        let msg = &queue.posted[index];
        if msg.data.len() > max_size {
            return Err(NtStatus::BufferOverflow);
        }
        let reply = GetMessageReply::from_message(msg, msg.data.clone());
        if remove {
            self.remove_queue_message(tid, MessageKind::Post, index);
        }
        Ok(Some(reply))
    }

    fn get_quit_message(&mut self, tid: ThreadId, remove: bool) -> Option<GetMessageReply> {
        let time = self.now_ticks();
        let queue = self.queues.get_mut(&tid)?;
        if !queue.quit_message {
            return None;
        }
        let reply = GetMessageReply::synthesized(HWND::NULL, WM_QUIT, queue.exit_code, 0, time);
        if remove {
            queue.quit_message = false;
            if queue.posted.is_empty() {
                queue.clear_bits(QueueStatus::POSTMESSAGE | QueueStatus::ALLPOSTMESSAGE);
            }
        }
        Some(reply)
    }

    /// Retrieve the next message for a thread
    ///
    /// Sent messages are always returned first and ignore every filter.
    /// Otherwise posted messages, the quit message, hardware input, paint
    /// and timers are tried in that order. When nothing matches, the
    /// request's masks are stored on the queue and `Pending` is returned.
    pub fn get_message(&mut self, tid: ThreadId, req: &GetMessageRequest) -> NtResult<GetMessageReply> {
        self.ensure_queue(tid)?;
        let now = self.now();
        let get_win = self.windows.full_handle(req.get_win);
        let filter = req.status_filter();
        let (first, last) = (req.get_first, req.get_last);
        let remove = req.removes();

        let queue = self.queue_mut(tid)?;
        queue.last_get_msg = now;
        let active_hooks = queue.hooks.as_ref().map_or(0, |hooks| hooks.lock().active_mask());
        let with_hooks = move |mut reply: GetMessageReply| {
            reply.active_hooks = active_hooks;
            reply
        };

        if let Some(reply) = self.receive_message(tid, req.max_size)? {
            return Ok(with_hooks(reply));
        }

        // Clear changed bits so we can wait on them if nothing is found
        let mut changed = QueueStatus::empty();
        if filter.contains(QueueStatus::POSTMESSAGE) {
            changed |= QueueStatus::POSTMESSAGE | QueueStatus::HOTKEY | QueueStatus::TIMER;
            if first == 0 && last == u32::MAX {
                changed |= QueueStatus::ALLPOSTMESSAGE;
            }
        }
        if filter.intersects(QueueStatus::INPUT) {
            changed |= QueueStatus::INPUT;
        }
        if filter.contains(QueueStatus::PAINT) {
            changed |= QueueStatus::PAINT;
        }
        self.queue_mut(tid)?.clear_changed(changed);

        if filter.contains(QueueStatus::POSTMESSAGE) {
            if let Some(reply) = self.get_posted_message(tid, get_win, first, last, remove, req.max_size)? {
                return Ok(with_hooks(reply));
            }
        }

        // The quit message ignores every filter
        if let Some(reply) = self.get_quit_message(tid, remove) {
            return Ok(with_hooks(reply));
        }

        if filter.intersects(QueueStatus::INPUT) && filter_contains_hw_range(first, last) {
            if let Some(reply) = self.get_hardware_message(tid, req.hw_id, get_win, first, last) {
                return Ok(with_hooks(reply));
            }
        }

        if filter.contains(QueueStatus::PAINT)
            && check_msg_filter(WM_PAINT, first, last)
            && self.queues.get(&tid).is_some_and(|q| q.paint_count > 0)
        {
            let win = self.windows.find_window_to_repaint(get_win, tid);
            if win.is_valid() {
                let reply = GetMessageReply::synthesized(win, WM_PAINT, 0, 0, self.now_ticks());
                return Ok(with_hooks(reply));
            }
        }

        if filter.contains(QueueStatus::TIMER) {
            if let Some(reply) = self.collect_timer(tid, get_win, first, last, remove) {
                return Ok(with_hooks(reply));
            }
        }

        self.queue_mut(tid)?.set_masks(req.wake_mask, req.changed_mask);
        Err(NtStatus::Pending)
    }

    // ========================================================================
    // Queue State
    // ========================================================================

    /// Set the wake and changed masks and report the current bits
    ///
    /// If the queue is already signaled, `skip_wait` consumes the masks as
    /// the wait would have; otherwise waiters are woken.
    pub fn set_wakeup_mask(
        &mut self,
        tid: ThreadId,
        wake_mask: QueueStatus,
        changed_mask: QueueStatus,
        skip_wait: bool,
    ) -> NtResult<QueueBits> {
        self.ensure_queue(tid)?;
        let queue = self.queue_mut(tid)?;
        queue.set_masks(wake_mask, changed_mask);
        let bits = QueueBits {
            wake_bits: queue.wake_bits(),
            changed_bits: queue.changed_bits(),
        };
        if queue.satisfied() {
            if skip_wait {
                queue.wait_satisfied();
            } else {
                queue.wake_waiters();
            }
        }
        Ok(bits)
    }

    /// Current queue bits; `clear` resets the changed bits
    pub fn get_queue_status(&mut self, tid: ThreadId, clear: bool) -> NtResult<QueueBits> {
        self.ensure_queue(tid)?;
        let queue = self.queue_mut(tid)?;
        let bits = QueueBits {
            wake_bits: queue.wake_bits(),
            changed_bits: queue.changed_bits(),
        };
        if clear {
            queue.clear_changed(QueueStatus::all());
        }
        Ok(bits)
    }

    /// Adjust the pending paint count, keeping QS_PAINT in sync
    pub fn increment_paint_count(&mut self, tid: ThreadId, incr: i32) -> NtResult<()> {
        if !self.threads.contains_key(&tid) {
            return Err(NtStatus::InvalidCid);
        }
        let Some(queue) = self.queues.get_mut(&tid) else {
            return Ok(());
        };
        let count = (i64::from(queue.paint_count) + i64::from(incr)).max(0);
        queue.paint_count = u32::try_from(count).unwrap_or(u32::MAX);
        if queue.paint_count > 0 {
            queue.set_bits(QueueStatus::PAINT);
        } else {
            queue.clear_bits(QueueStatus::PAINT);
        }
        Ok(())
    }

    /// Forget everything a queue holds for a destroyed window
    pub fn cleanup_window(&mut self, tid: ThreadId, win: HWND) {
        let Some(queue) = self.queues.get_mut(&tid) else {
            return;
        };
        if queue.timers.remove_window(win) > 0 {
            self.set_next_timer(tid);
        }

        for kind in [MessageKind::Send, MessageKind::Post] {
            while let Some(index) = self
                .queues
                .get(&tid)
                .and_then(|q| q.list(kind).iter().position(|m| m.win == win))
            {
                self.remove_queue_message(tid, kind, index);
            }
        }

        if let Some(input) = self.queue_input(tid).and_then(|id| self.inputs.get_mut(id)) {
            input.cleanup_window(win);
        }
        log::trace!("[USER/Queue] Cleaned up window {:#x} on thread {}", win.raw(), tid.0);
    }

    /// The thread owning `win` stopped processing messages
    pub fn is_window_hung(&self, win: HWND) -> bool {
        let win = self.windows.full_handle(win);
        self.windows
            .window_thread(win)
            .and_then(|tid| self.queues.get(&tid))
            .is_some_and(|q| q.is_hung(self.now(), self.config.hung_timeout_ms))
    }

    pub fn set_queue_hooks(&mut self, tid: ThreadId, hooks: Option<SharedHookTable>) -> NtResult<()> {
        self.ensure_queue(tid)?;
        self.queue_mut(tid)?.hooks = hooks;
        Ok(())
    }

    pub fn get_queue_hooks(&self, tid: ThreadId) -> Option<SharedHookTable> {
        self.queues.get(&tid).and_then(|q| q.hooks.clone())
    }

    // ========================================================================
    // Waiting and Polling
    // ========================================================================

    /// Attach a client descriptor to the queue (only once)
    pub fn set_queue_fd(&mut self, tid: ThreadId, fd: i32) -> NtResult<()> {
        self.ensure_queue(tid)?;
        let queue = self.queue_mut(tid)?;
        if queue.fd.is_some() {
            return Err(NtStatus::AccessDenied);
        }
        if fd < 0 {
            return Err(NtStatus::InvalidHandle);
        }
        let mut descriptor = PollDescriptor::new(fd);
        if queue.waiters() > 0 {
            descriptor.set_events(PollEvents::POLLIN);
        }
        queue.fd = Some(descriptor);
        Ok(())
    }

    pub fn queue_poll_event(&mut self, tid: ThreadId, events: PollEvents) -> NtResult<()> {
        self.queue_mut(tid)?.poll_event(events);
        Ok(())
    }

    pub fn add_queue_waiter(&mut self, tid: ThreadId) -> NtResult<()> {
        self.queue_mut(tid)?.add_waiter();
        Ok(())
    }

    pub fn remove_queue_waiter(&mut self, tid: ThreadId) -> NtResult<()> {
        self.queue_mut(tid)?.remove_waiter();
        Ok(())
    }

    pub fn is_queue_signaled(&mut self, tid: ThreadId) -> NtResult<bool> {
        Ok(self.queue_mut(tid)?.check_signaled())
    }

    /// A wait on the queue completed
    pub fn queue_wait_satisfied(&mut self, tid: ThreadId) -> NtResult<()> {
        self.queue_mut(tid)?.wait_satisfied();
        Ok(())
    }

    // ========================================================================
    // Time
    // ========================================================================

    /// Advance the clock, firing every deadline that falls due
    pub fn advance_time(&mut self, ms: u64) {
        self.deadlines.advance_by(ms);
        while let Some((id, target)) = self.deadlines.pop_expired() {
            match target {
                Deadline::QueueTimer(tid) => self.timer_expired(tid, id),
                Deadline::ReplyTimeout(result) => self.result_timeout(result),
            }
        }
    }
}

// ============================================================================
// Shared Server
// ============================================================================

/// [`UserServer`] behind a lock shared by request handlers and the timer
/// thread
#[derive(Debug)]
pub struct SharedUserServer<W: WindowManager = WindowTable> {
    inner: spin::Mutex<UserServer<W>>,
}

impl<W: WindowManager> SharedUserServer<W> {
    pub fn new(server: UserServer<W>) -> Self {
        Self {
            inner: spin::Mutex::new(server),
        }
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, UserServer<W>> {
        self.inner.lock()
    }

    /// Timer thread entry: advance the clock under the lock
    pub fn tick(&self, ms: u64) {
        self.inner.lock().advance_time(ms);
    }

    pub fn into_inner(self) -> UserServer<W> {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::win32k::user::message::{WM_LBUTTONDOWN, WM_LBUTTONUP, WM_TIMER, WM_USER};
    use crate::win32k::Rect;

    const T1: ThreadId = ThreadId(1);
    const T2: ThreadId = ThreadId(2);
    const P1: ProcessId = ProcessId(1);
    const DESK: DesktopId = DesktopId(0);

    fn server() -> UserServer {
        let mut server = UserServer::new(UserConfig::default());
        server.register_thread(T1, P1, DESK).unwrap();
        server.register_thread(T2, P1, DESK).unwrap();
        server
    }

    #[test]
    fn test_sent_before_posted() {
        let mut server = server();
        let win = server.windows_mut().create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        server.create_message_queue(T1, None).unwrap();

        server.post_message(win, WM_USER, 1, 0).unwrap();
        let req = SendMessageRequest::new(T1, MessageType::Notify, win, WM_USER + 1);
        server.send_message(T2, req).unwrap();

        let first = server.get_message(T1, &GetMessageRequest::new()).unwrap();
        assert_eq!(first.msg, WM_USER + 1);
        assert_eq!(first.msg_type, MessageType::Notify);
        let second = server.get_message(T1, &GetMessageRequest::new()).unwrap();
        assert_eq!(second.msg, WM_USER);
        assert_eq!(server.get_message(T1, &GetMessageRequest::new()), Err(NtStatus::Pending));
    }

    #[test]
    fn test_pending_stores_masks() {
        let mut server = server();
        let req = GetMessageRequest::new().masks(QueueStatus::POSTMESSAGE, QueueStatus::empty());
        assert_eq!(server.get_message(T1, &req), Err(NtStatus::Pending));
        let queue = server.queue(T1).unwrap();
        assert_eq!(queue.wake_mask(), QueueStatus::POSTMESSAGE);
        assert!(!queue.satisfied());

        server.post_quit_message(T1, 3).unwrap();
        assert!(server.queue(T1).unwrap().satisfied());
    }

    #[test]
    fn test_quit_after_posted() {
        let mut server = server();
        let win = server.windows_mut().create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        server.create_message_queue(T1, None).unwrap();
        server.post_quit_message(T1, 7).unwrap();
        server.post_message(win, WM_USER, 0, 0).unwrap();

        // A range filter skips the posted message but not the quit
        let req = GetMessageRequest::new().range(WM_TIMER, WM_TIMER);
        let reply = server.get_message(T1, &req).unwrap();
        assert_eq!((reply.msg, reply.wparam), (WM_QUIT, 7));

        let reply = server.get_message(T1, &GetMessageRequest::new()).unwrap();
        assert_eq!(reply.msg, WM_USER);
        assert!(!server.queue(T1).unwrap().wake_bits().contains(QueueStatus::POSTMESSAGE));
    }

    #[test]
    fn test_quit_ignores_status_filter() {
        let mut server = server();
        server.create_message_queue(T1, None).unwrap();
        server.post_quit_message(T1, 9).unwrap();

        let req = GetMessageRequest::new().filter(QueueStatus::TIMER);
        let reply = server.get_message(T1, &req).unwrap();
        assert_eq!((reply.msg, reply.wparam), (WM_QUIT, 9));
        assert_eq!(server.get_message(T1, &req), Err(NtStatus::Pending));
    }

    #[test]
    fn test_repeat_events_set_changed_bits() {
        let mut server = server();
        let win = server.windows_mut().create_window(T1, DESK, HWND::NULL, Rect::new(0, 0, 100, 100)).unwrap();
        server.windows_mut().set_visible(win, true);
        server.create_message_queue(T1, None).unwrap();

        // Posted
        server.post_message(win, WM_USER, 0, 0).unwrap();
        server.get_queue_status(T1, true).unwrap();
        server.post_message(win, WM_USER + 1, 0, 0).unwrap();
        let bits = server.get_queue_status(T1, true).unwrap();
        assert!(bits.wake_bits.contains(QueueStatus::POSTMESSAGE));
        assert!(bits.changed_bits.contains(QueueStatus::POSTMESSAGE));

        // Hardware
        for msg in [WM_LBUTTONDOWN, WM_LBUTTONUP] {
            server.send_hardware_message(Some(T1), HardwareInput::new(win, msg, 0, 0).at(5, 5)).unwrap();
            let bits = server.get_queue_status(T1, true).unwrap();
            assert!(bits.wake_bits.contains(QueueStatus::MOUSEBUTTON));
            assert!(bits.changed_bits.contains(QueueStatus::MOUSEBUTTON));
        }

        // Timer
        server.set_window_timer(T1, HWND::NULL, WM_TIMER, 0, 10, 0).unwrap();
        server.set_window_timer(T1, HWND::NULL, WM_TIMER, 0, 20, 0).unwrap();
        for _ in 0..2 {
            server.advance_time(10);
            let bits = server.get_queue_status(T1, true).unwrap();
            assert!(bits.wake_bits.contains(QueueStatus::TIMER));
            assert!(bits.changed_bits.contains(QueueStatus::TIMER));
        }
    }

    #[test]
    fn test_rejected_send_types() {
        let mut server = server();
        server.create_message_queue(T1, None).unwrap();
        for msg_type in [MessageType::Hardware, MessageType::CallbackResult, MessageType::WinEvent] {
            let req = SendMessageRequest::new(T1, msg_type, HWND::NULL, WM_USER);
            assert_eq!(server.send_message(T2, req), Err(NtStatus::InvalidParameter));
        }
        assert_eq!(server.queue(T1).unwrap().message_count(), 0);
    }

    #[test]
    fn test_send_to_thread_without_queue() {
        let mut server = server();
        let req = SendMessageRequest::new(T1, MessageType::Unicode, HWND::NULL, WM_USER);
        assert_eq!(server.send_message(T2, req), Err(NtStatus::InvalidParameter));
        let req = SendMessageRequest::new(ThreadId(99), MessageType::Notify, HWND::NULL, WM_USER);
        assert_eq!(server.send_message(T2, req), Err(NtStatus::InvalidCid));
        assert!(server.results().is_empty());
    }

    #[test]
    fn test_queue_quota() {
        let mut server = UserServer::new(UserConfig {
            max_queue_messages: 2,
            ..UserConfig::default()
        });
        server.register_thread(T1, P1, DESK).unwrap();
        let win = server.windows_mut().create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        server.create_message_queue(T1, None).unwrap();
        server.post_message(win, WM_USER, 0, 0).unwrap();
        server.post_message(win, WM_USER, 1, 0).unwrap();
        assert_eq!(server.post_message(win, WM_USER, 2, 0), Err(NtStatus::QuotaExceeded));
        assert_eq!(server.queue(T1).unwrap().message_count(), 2);
    }

    #[test]
    fn test_abort_if_hung() {
        let mut server = server();
        server.create_message_queue(T1, None).unwrap();
        server.advance_time(5001);
        let req = SendMessageRequest::new(T1, MessageType::Unicode, HWND::NULL, WM_USER).flags(SEND_MSG_ABORT_IF_HUNG);
        assert_eq!(server.send_message(T2, req.clone()), Err(NtStatus::Timeout));

        assert_eq!(server.get_message(T1, &GetMessageRequest::new()), Err(NtStatus::Pending));
        assert_eq!(server.send_message(T2, req), Ok(()));
    }

    #[test]
    fn test_paint_count() {
        let mut server = server();
        let win = server.windows_mut().create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        server.create_message_queue(T1, None).unwrap();
        server.increment_paint_count(T1, 1).unwrap();
        assert!(server.queue(T1).unwrap().wake_bits().contains(QueueStatus::PAINT));

        // Nothing to repaint yet
        assert_eq!(server.get_message(T1, &GetMessageRequest::new()), Err(NtStatus::Pending));
        server.windows_mut().invalidate(win, true);
        let reply = server.get_message(T1, &GetMessageRequest::new()).unwrap();
        assert_eq!((reply.msg, reply.win), (WM_PAINT, win));

        server.increment_paint_count(T1, -5).unwrap();
        assert_eq!(server.queue(T1).unwrap().paint_count, 0);
        assert!(!server.queue(T1).unwrap().wake_bits().contains(QueueStatus::PAINT));
    }

    #[test]
    fn test_wakeup_mask_skip_wait() {
        let mut server = server();
        server.post_quit_message(T1, 0).unwrap();
        let bits = server
            .set_wakeup_mask(T1, QueueStatus::POSTMESSAGE, QueueStatus::empty(), true)
            .unwrap();
        assert!(bits.wake_bits.contains(QueueStatus::POSTMESSAGE));
        assert!(server.queue(T1).unwrap().wake_mask().is_empty());

        let status = server.get_queue_status(T1, true).unwrap();
        assert!(status.changed_bits.contains(QueueStatus::POSTMESSAGE));
        assert!(server.get_queue_status(T1, false).unwrap().changed_bits.is_empty());
    }

    #[test]
    fn test_queue_fd_set_once() {
        let mut server = server();
        server.add_queue_waiter(T1).unwrap_err();
        assert_eq!(server.set_queue_fd(T1, -1), Err(NtStatus::InvalidHandle));
        server.set_queue_fd(T1, 12).unwrap();
        assert_eq!(server.set_queue_fd(T1, 13), Err(NtStatus::AccessDenied));
    }

    #[test]
    fn test_window_timers() {
        let mut server = server();
        let win = server.windows_mut().create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        assert_eq!(server.set_window_timer(T2, win, WM_TIMER, 5, 10, 0), Ok(5));
        // Lives in the window owner's queue
        assert_eq!(server.queue(T1).map(|q| q.timers().len()), Some(1));

        server.advance_time(10);
        assert!(server.queue(T1).unwrap().wake_bits().contains(QueueStatus::TIMER));
        assert_eq!(server.kill_window_timer(T1, win, WM_TIMER, 5), Ok(()));
        assert!(!server.queue(T1).unwrap().wake_bits().contains(QueueStatus::TIMER));
        assert_eq!(server.kill_window_timer(T1, win, WM_TIMER, 5), Err(NtStatus::InvalidParameter));
    }

    #[test]
    fn test_new_timer_wakes_filtered_waiter() {
        let mut server = server();
        let w1 = server.windows_mut().create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        let w2 = server.windows_mut().create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        server.set_window_timer(T1, w1, WM_TIMER, 1, 10, 0).unwrap();
        server.set_window_timer(T1, w2, WM_TIMER, 2, 50, 0).unwrap();

        server.advance_time(10);
        assert!(server.queue(T1).unwrap().wake_bits().contains(QueueStatus::TIMER));

        // Only w2's timer is wanted, so w1's expired one does not satisfy the wait
        let req = GetMessageRequest::new().window(w2).masks(QueueStatus::empty(), QueueStatus::TIMER);
        assert_eq!(server.get_message(T1, &req), Err(NtStatus::Pending));
        assert!(!server.queue(T1).unwrap().satisfied());

        server.advance_time(40);
        let queue = server.queue(T1).unwrap();
        assert!(queue.changed_bits().contains(QueueStatus::TIMER));
        assert!(queue.satisfied());

        let reply = server.get_message(T1, &req).unwrap();
        assert_eq!((reply.win, reply.msg, reply.wparam), (w2, WM_TIMER, 2));
    }

    #[test]
    fn test_timer_other_process() {
        let mut server = server();
        server.register_thread(ThreadId(3), ProcessId(2), DESK).unwrap();
        let win = server.windows_mut().create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        assert_eq!(
            server.set_window_timer(ThreadId(3), win, WM_TIMER, 1, 10, 0),
            Err(NtStatus::AccessDenied)
        );
    }

    #[test]
    fn test_thread_timer_ids() {
        let mut server = server();
        let a = server.set_window_timer(T1, HWND::NULL, WM_TIMER, 0, 10, 0).unwrap();
        let b = server.set_window_timer(T1, HWND::NULL, WM_TIMER, 0, 10, 0).unwrap();
        assert_eq!(a, 0x7fff);
        assert_eq!(b, 0x7ffe);
        // Reusing an id replaces the timer
        assert_eq!(server.set_window_timer(T1, HWND::NULL, WM_TIMER, a, 20, 0), Ok(a));
        assert_eq!(server.queue(T1).unwrap().timers().len(), 2);
    }

    #[test]
    fn test_cleanup_window() {
        let mut server = server();
        let win = server.windows_mut().create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        let other = server.windows_mut().create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        server.create_message_queue(T1, None).unwrap();
        server.set_focus_window(T1, win).unwrap();
        server.set_window_timer(T1, win, WM_TIMER, 1, 10, 0).unwrap();
        server.post_message(win, WM_USER, 0, 0).unwrap();
        server.post_message(other, WM_USER, 1, 0).unwrap();

        server.cleanup_window(T1, win);
        let queue = server.queue(T1).unwrap();
        assert!(queue.timers().is_empty());
        assert_eq!(queue.message_count(), 1);
        assert!(queue.timeout.is_none());
        assert_eq!(server.thread_input(T1).map(|i| i.focus), Some(HWND::NULL));
    }

    #[test]
    fn test_destroy_queue_releases_everything() {
        let mut server = server();
        server.create_message_queue(T1, None).unwrap();
        server.set_window_timer(T1, HWND::NULL, WM_TIMER, 0, 10, 0).unwrap();
        let req = SendMessageRequest::new(T1, MessageType::Unicode, HWND::NULL, WM_USER).timeout(100);
        server.send_message(T2, req).unwrap();
        assert_eq!(server.inputs().len(), 2);

        server.destroy_queue_on_thread_exit(T1);
        assert!(server.queue(T1).is_none());
        assert!(server.thread_info(T1).is_none());
        assert_eq!(server.inputs().len(), 1);
        assert_eq!(server.collect_send_reply(T2, false, 0), Err(NtStatus::AccessDenied));
        assert!(server.results().is_empty());
        assert!(server.deadlines.is_empty());
    }

    #[test]
    fn test_shared_server_tick() {
        let shared = SharedUserServer::new(server());
        shared.lock().set_window_timer(T1, HWND::NULL, WM_TIMER, 0, 50, 0).unwrap();
        shared.tick(50);
        let server = shared.into_inner();
        assert_eq!(server.now(), 50);
        assert!(server.queue(T1).unwrap().timers().has_expired());
    }
}
