//! Thread Input
//!
//! Focus, capture, active window, caret and key state shared by a group of
//! attached threads, together with the raw hardware messages waiting for
//! that group.
//!
//! # Routing
//!
//! Hardware messages are queued on the thread input of the window that
//! will receive them, but the final target is only decided when a thread
//! retrieves them:
//!
//! - **Keyboard**: focus window, else the active window as a WM_SYS* key
//! - **Mouse**: capture window, else the message window if visible, else
//!   the window under the cursor
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `windows/core/ntuser/kernel/input.c`
//! - `windows/core/ntuser/kernel/focusact.c`

use std::collections::{HashMap, VecDeque};

use super::super::{DesktopId, Point, Rect, ThreadId, HWND};
use super::message::{
    check_msg_filter, hardware_msg_bit, is_keyboard_msg, GetMessageReply, HardwareInput, Message, MessageType,
    QueueStatus, WM_KEYDOWN, WM_KEYUP, WM_LBUTTONDBLCLK, WM_LBUTTONDOWN, WM_LBUTTONUP, WM_MBUTTONDOWN,
    WM_MBUTTONUP, WM_MOUSEFIRST, WM_MOUSEMOVE, WM_MOUSEWHEEL, WM_NCLBUTTONDBLCLK, WM_NCMOUSEFIRST,
    WM_RBUTTONDOWN, WM_RBUTTONUP, WM_SYSKEYDOWN, WM_SYSKEYUP, WM_XBUTTONDOWN, WM_XBUTTONUP, XBUTTON1, XBUTTON2,
};
use super::window::WindowManager;
use super::UserServer;
use crate::ob::{Object, ObjectKind};
use crate::status::{NtResult, NtStatus};

// ============================================================================
// Virtual Key Codes
// ============================================================================

/// Virtual key codes (VK_*)
pub mod vk {
    pub const LBUTTON: u8 = 0x01;
    pub const RBUTTON: u8 = 0x02;
    pub const MBUTTON: u8 = 0x04;
    pub const XBUTTON1: u8 = 0x05;
    pub const XBUTTON2: u8 = 0x06;
    pub const SHIFT: u8 = 0x10;
    pub const CONTROL: u8 = 0x11;
    pub const MENU: u8 = 0x12; // Alt
    pub const LSHIFT: u8 = 0xA0;
    pub const RSHIFT: u8 = 0xA1;
    pub const LCONTROL: u8 = 0xA2;
    pub const RCONTROL: u8 = 0xA3;
    pub const LMENU: u8 = 0xA4;
    pub const RMENU: u8 = 0xA5;
}

/// Key is down
pub const KEY_DOWN: u8 = 0x80;
/// Key toggle state (caps lock style)
pub const KEY_TOGGLED: u8 = 0x01;

// set_caret_info flags
pub const SET_CARET_POS: u32 = 0x0001;
pub const SET_CARET_HIDE: u32 = 0x0002;
pub const SET_CARET_STATE: u32 = 0x0004;

// set_capture_window flags
pub const CAPTURE_MENU: u32 = 0x0001;
pub const CAPTURE_MOVESIZE: u32 = 0x0002;

// ============================================================================
// Thread Input
// ============================================================================

/// Identifies a thread input in the [`InputTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputId(u32);

impl InputId {
    pub const fn from_raw(raw: u32) -> Self {
        InputId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Input state shared by attached threads
#[derive(Debug, Clone)]
pub struct ThreadInput {
    pub desktop: DesktopId,
    pub focus: HWND,
    pub capture: HWND,
    pub active: HWND,
    pub menu_owner: HWND,
    pub move_size: HWND,
    pub caret: HWND,
    pub caret_rect: Rect,
    /// Caret hide count
    pub caret_hide: i32,
    /// Caret blink state
    pub caret_state: bool,
    /// Hardware messages waiting for a thread of this group
    pub(crate) msg_list: VecDeque<Message>,
    pub keystate: [u8; 256],
}

impl ThreadInput {
    pub fn new(desktop: DesktopId) -> Self {
        let mut input = Self {
            desktop,
            focus: HWND::NULL,
            capture: HWND::NULL,
            active: HWND::NULL,
            menu_owner: HWND::NULL,
            move_size: HWND::NULL,
            caret: HWND::NULL,
            caret_rect: Rect::EMPTY,
            caret_hide: 0,
            caret_state: false,
            msg_list: VecDeque::new(),
            keystate: [0; 256],
        };
        input.set_caret_window(HWND::NULL);
        input
    }

    /// Set the caret window
    ///
    /// The caret rectangle is reset unless the window stays the same.
    pub fn set_caret_window(&mut self, win: HWND) {
        if !win.is_valid() || win != self.caret {
            self.caret_rect = Rect::EMPTY;
        }
        self.caret = win;
        self.caret_hide = 1;
        self.caret_state = false;
    }

    /// Change the state of one key
    pub fn set_key_state(&mut self, key: u8, down: bool) {
        let state = &mut self.keystate[usize::from(key)];
        if down {
            if *state & KEY_DOWN == 0 {
                *state ^= KEY_TOGGLED;
            }
            *state |= KEY_DOWN;
        } else {
            *state &= !KEY_DOWN;
        }
    }

    fn is_down(&self, key: u8) -> bool {
        self.keystate[usize::from(key)] & KEY_DOWN != 0
    }

    /// Update the key state for a keyboard or mouse button message
    pub fn update_key_state(&mut self, msg: &Message) {
        match msg.msg {
            WM_LBUTTONDOWN | WM_LBUTTONUP => self.set_key_state(vk::LBUTTON, msg.msg == WM_LBUTTONDOWN),
            WM_MBUTTONDOWN | WM_MBUTTONUP => self.set_key_state(vk::MBUTTON, msg.msg == WM_MBUTTONDOWN),
            WM_RBUTTONDOWN | WM_RBUTTONUP => self.set_key_state(vk::RBUTTON, msg.msg == WM_RBUTTONDOWN),
            WM_XBUTTONDOWN | WM_XBUTTONUP => {
                let down = msg.msg == WM_XBUTTONDOWN;
                match msg.wparam {
                    XBUTTON1 => self.set_key_state(vk::XBUTTON1, down),
                    XBUTTON2 => self.set_key_state(vk::XBUTTON2, down),
                    _ => {}
                }
            }
            WM_KEYDOWN | WM_SYSKEYDOWN | WM_KEYUP | WM_SYSKEYUP => {
                let down = msg.msg == WM_KEYDOWN || msg.msg == WM_SYSKEYDOWN;
                let key = (msg.wparam & 0xFF) as u8;
                self.set_key_state(key, down);

                // Generic modifier follows its left/right pair
                let (generic, left, right) = match key {
                    vk::LCONTROL | vk::RCONTROL => (vk::CONTROL, vk::LCONTROL, vk::RCONTROL),
                    vk::LMENU | vk::RMENU => (vk::MENU, vk::LMENU, vk::RMENU),
                    vk::LSHIFT | vk::RSHIFT => (vk::SHIFT, vk::LSHIFT, vk::RSHIFT),
                    _ => return,
                };
                let down = self.is_down(left) || self.is_down(right);
                self.set_key_state(generic, down);
            }
            _ => {}
        }
    }

    /// Clear every reference to a destroyed window
    pub fn cleanup_window(&mut self, win: HWND) {
        if win == self.focus {
            self.focus = HWND::NULL;
        }
        if win == self.capture {
            self.capture = HWND::NULL;
        }
        if win == self.active {
            self.active = HWND::NULL;
        }
        if win == self.menu_owner {
            self.menu_owner = HWND::NULL;
        }
        if win == self.move_size {
            self.move_size = HWND::NULL;
        }
        if win == self.caret {
            self.set_caret_window(HWND::NULL);
        }
    }

    /// Try to merge a message into the last queued one
    pub fn merge_message(&mut self, msg: &Message) -> bool {
        let Some(prev) = self.msg_list.back_mut() else {
            return false;
        };
        if prev.result.is_some() {
            return false;
        }
        if prev.win.is_valid() && msg.win.is_valid() && prev.win != msg.win {
            return false;
        }
        if prev.msg != msg.msg || prev.msg_type != msg.msg_type {
            return false;
        }
        prev.wparam = msg.wparam;
        prev.lparam = msg.lparam;
        prev.pt = msg.pt;
        prev.time = msg.time;
        prev.info = msg.info;
        true
    }

    /// Hardware messages waiting for this group
    pub fn hardware_messages(&self) -> impl Iterator<Item = &Message> {
        self.msg_list.iter()
    }
}

impl Object for ThreadInput {
    fn kind(&self) -> ObjectKind {
        ObjectKind::ThreadInput
    }

    fn dump(&self) -> String {
        format!(
            "ThreadInput focus={:#x} capture={:#x} active={:#x} messages={}",
            self.focus.raw(),
            self.capture.raw(),
            self.active.raw(),
            self.msg_list.len()
        )
    }
}

// ============================================================================
// Input Table
// ============================================================================

#[derive(Debug)]
struct InputEntry {
    input: ThreadInput,
    /// Queues (and callers) holding this input
    refs: usize,
}

/// Reference-counted thread inputs
#[derive(Debug, Default)]
pub struct InputTable {
    entries: HashMap<InputId, InputEntry>,
    next_id: u32,
}

impl InputTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an input holding one reference
    pub fn create(&mut self, desktop: DesktopId) -> InputId {
        loop {
            self.next_id = self.next_id.wrapping_add(1).max(1);
            let id = InputId(self.next_id);
            if !self.entries.contains_key(&id) {
                self.entries.insert(
                    id,
                    InputEntry {
                        input: ThreadInput::new(desktop),
                        refs: 1,
                    },
                );
                log::debug!("[USER/Input] Created thread input {}", id.0);
                return id;
            }
        }
    }

    /// Add a reference
    pub fn grab(&mut self, id: InputId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Drop a reference, returning the input if it was the last one
    pub fn release(&mut self, id: InputId) -> Option<ThreadInput> {
        let entry = self.entries.get_mut(&id)?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return None;
        }
        log::debug!("[USER/Input] Destroyed thread input {}", id.0);
        self.entries.remove(&id).map(|e| e.input)
    }

    pub fn get(&self, id: InputId) -> Option<&ThreadInput> {
        self.entries.get(&id).map(|e| &e.input)
    }

    pub fn get_mut(&mut self, id: InputId) -> Option<&mut ThreadInput> {
        self.entries.get_mut(&id).map(|e| &mut e.input)
    }

    pub fn ref_count(&self, id: InputId) -> usize {
        self.entries.get(&id).map_or(0, |e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Hardware Message Filtering
// ============================================================================

/// Check a hardware message against a filter
///
/// The target of a mouse message still depends on hit-testing, so every
/// code the message could end up with is tried.
pub fn check_hw_message_filter<W: WindowManager>(
    windows: &W,
    win: HWND,
    msg_code: u32,
    filter_win: HWND,
    first: u32,
    last: u32,
) -> bool {
    if is_keyboard_msg(msg_code) {
        if filter_win.is_valid() && win != filter_win && !windows.is_child_window(filter_win, win) {
            return false;
        }
        return check_msg_filter(msg_code, first, last);
    }

    if check_msg_filter(msg_code, first, last) {
        return true;
    }
    if msg_code == WM_MOUSEWHEEL {
        return false;
    }
    // Any mouse message can become a non-client one
    if check_msg_filter(msg_code.wrapping_sub(WM_MOUSEFIRST - WM_NCMOUSEFIRST), first, last) {
        return true;
    }
    // Clicks can become double-clicks
    if matches!(msg_code, WM_LBUTTONDOWN | WM_MBUTTONDOWN | WM_RBUTTONDOWN | WM_XBUTTONDOWN) {
        if check_msg_filter(msg_code + (WM_LBUTTONDBLCLK - WM_LBUTTONDOWN), first, last) {
            return true;
        }
        if check_msg_filter(msg_code - (WM_LBUTTONDOWN - WM_NCLBUTTONDBLCLK), first, last) {
            return true;
        }
    }
    false
}

// ============================================================================
// Replies
// ============================================================================

/// Previous caret state returned by caret requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaretReply {
    /// Previous (or current) caret window
    pub previous: HWND,
    pub old_rect: Rect,
    pub old_hide: i32,
    pub old_state: bool,
}

/// Previous and new capture window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureReply {
    pub previous: HWND,
    pub full_handle: HWND,
}

/// Snapshot of a thread input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadInputInfo {
    pub focus: HWND,
    pub capture: HWND,
    pub active: HWND,
    /// Active window of the foreground input
    pub foreground: HWND,
    pub menu_owner: HWND,
    pub move_size: HWND,
    pub caret: HWND,
    pub caret_rect: Rect,
}

/// Result of a foreground change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForegroundReply {
    pub previous: HWND,
    /// The old foreground input must be told it lost activation
    pub send_msg_old: bool,
    /// The new foreground input must be told it gained activation
    pub send_msg_new: bool,
}

/// Key state of a thread input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStateReply {
    /// State of the requested key
    pub state: u8,
    pub keystate: [u8; 256],
}

// ============================================================================
// Routing and Input Requests
// ============================================================================

impl<W: WindowManager> UserServer<W> {
    /// Input of a thread's queue
    pub(crate) fn queue_input(&self, tid: ThreadId) -> Option<InputId> {
        self.queues.get(&tid).map(|q| q.input)
    }

    /// Window a hardware message goes to, and its final message code
    fn find_hardware_message_window(&self, input: Option<&ThreadInput>, msg: &Message) -> (HWND, u32) {
        let mut msg_code = msg.msg;
        let mut win = HWND::NULL;

        if msg.is_keyboard() {
            if let Some(input) = input {
                win = input.focus;
                if !win.is_valid() {
                    win = input.active;
                    if msg_code < WM_SYSKEYDOWN {
                        msg_code += WM_SYSKEYDOWN - WM_KEYDOWN;
                    }
                }
            }
        } else {
            win = input.map_or(HWND::NULL, |i| i.capture);
            if !win.is_valid() {
                win = msg.win;
                if !win.is_valid() || !self.windows.is_window_visible(win) {
                    if let Some(input) = input {
                        win = self.windows.window_from_point(input.desktop, msg.pt);
                    }
                }
            }
        }
        (win, msg_code)
    }

    /// Thread owning a window, if it has a queue
    pub(crate) fn window_queue_thread(&self, win: HWND) -> Option<ThreadId> {
        if !win.is_valid() {
            return None;
        }
        self.windows
            .window_thread(win)
            .filter(|tid| self.queues.contains_key(tid))
    }

    /// Queue a hardware message on the input of its target window
    fn queue_hardware_message(&mut self, recv: Option<ThreadId>, mut msg: Message) {
        let input_id = match recv {
            Some(tid) => self.queue_input(tid),
            None => self.foreground_input,
        };
        self.last_input_time = self.now_ticks();

        let input = input_id.and_then(|id| self.inputs.get(id));
        let (win, _) = self.find_hardware_message_window(input, &msg);
        let Some(thread) = self.window_queue_thread(win) else {
            log::trace!("[USER/Input] No target for hardware message {:#x}", msg.msg);
            if let Some(input) = input_id.and_then(|id| self.inputs.get_mut(id)) {
                input.update_key_state(&msg);
            }
            return;
        };
        let Some(target) = self.queue_input(thread) else {
            return;
        };
        let Some(target_input) = self.inputs.get_mut(target) else {
            return;
        };

        if msg.msg == WM_MOUSEMOVE && target_input.merge_message(&msg) {
            return;
        }
        // Tagged once handed to a consumer
        msg.unique_id = 0;
        let bit = hardware_msg_bit(msg.msg);
        target_input.msg_list.push_back(msg);
        if let Some(queue) = self.queues.get_mut(&thread) {
            queue.set_bits(bit);
        }
    }

    /// Find the next hardware message for a thread
    pub(crate) fn get_hardware_message(
        &mut self,
        tid: ThreadId,
        hw_id: u32,
        filter_win: HWND,
        first: u32,
        last: u32,
    ) -> Option<GetMessageReply> {
        let input_id = self.queue_input(tid)?;

        let mut index = 0;
        if hw_id != 0 {
            let list = &self.inputs.get(input_id)?.msg_list;
            if let Some(pos) = list.iter().position(|m| m.unique_id == hw_id) {
                index = pos + 1;
            }
        }

        // Only clear the bits if the whole list is scanned
        let mut clear_bits = if index == 0 {
            QueueStatus::KEY | QueueStatus::MOUSEMOVE | QueueStatus::MOUSEBUTTON
        } else {
            QueueStatus::empty()
        };
        let mut got_one = false;

        loop {
            let input = self.inputs.get(input_id)?;
            let Some(msg) = input.msg_list.get(index) else {
                break;
            };
            let (win, msg_code) = self.find_hardware_message_window(Some(input), msg);
            let msg_bit = hardware_msg_bit(msg.msg);
            let existing_id = msg.unique_id;

            let win_thread = self.window_queue_thread(win);
            let keep = match win_thread {
                Some(owner) if owner == tid => true,
                Some(owner) if self.queue_input(owner) == Some(input_id) => {
                    // Wake the thread it belongs to
                    if let Some(queue) = self.queues.get_mut(&owner) {
                        queue.set_bits(msg_bit);
                    }
                    got_one = true;
                    index += 1;
                    continue;
                }
                _ => false,
            };

            if !keep {
                // No window, or a window of another input: drop it
                if let Some(input) = self.inputs.get_mut(input_id) {
                    if let Some(msg) = input.msg_list.remove(index) {
                        input.update_key_state(&msg);
                        log::trace!("[USER/Input] Dropped hardware message {:#x}", msg.msg);
                    }
                }
                continue;
            }

            if got_one || !check_hw_message_filter(&self.windows, win, msg_code, filter_win, first, last) {
                clear_bits.remove(msg_bit);
                index += 1;
                continue;
            }

            let unique_id = if existing_id == 0 { self.next_unique_id() } else { existing_id };
            let msg = self.inputs.get_mut(input_id)?.msg_list.get_mut(index)?;
            msg.unique_id = unique_id;

            let mut reply = GetMessageReply::from_message(msg, Vec::new());
            reply.msg_type = MessageType::Hardware;
            reply.win = win;
            reply.msg = msg_code;
            reply.hw_id = unique_id;
            return Some(reply);
        }

        if let Some(queue) = self.queues.get_mut(&tid) {
            queue.clear_bits(clear_bits);
        }
        None
    }

    /// Release the hardware message a thread is processing
    fn release_hardware_message(&mut self, tid: ThreadId, hw_id: u32, mut remove: bool, new_win: HWND) {
        let Some(input_id) = self.queue_input(tid) else {
            return;
        };
        let Some(input) = self.inputs.get(input_id) else {
            return;
        };
        let Some(index) = input.msg_list.iter().position(|m| m.unique_id == hw_id) else {
            return;
        };

        if remove || new_win.is_valid() {
            let clr_bit = hardware_msg_bit(input.msg_list[index].msg);
            let shared = input
                .msg_list
                .iter()
                .enumerate()
                .any(|(i, m)| i != index && hardware_msg_bit(m.msg) == clr_bit);
            if !shared {
                if let Some(queue) = self.queues.get_mut(&tid) {
                    queue.clear_bits(clr_bit);
                }
            }
        }

        if new_win.is_valid() {
            if let Some(owner) = self.window_queue_thread(new_win) {
                let owner_input = self.queue_input(owner);
                let Some(input) = self.inputs.get_mut(input_id) else {
                    return;
                };
                let bit = hardware_msg_bit(input.msg_list[index].msg);
                input.msg_list[index].win = new_win;

                if owner_input != Some(input_id) {
                    let Some(msg) = input.msg_list.remove(index) else {
                        return;
                    };
                    let Some(target) = owner_input.and_then(|id| self.inputs.get_mut(id)) else {
                        return;
                    };
                    if msg.msg == WM_MOUSEMOVE && target.merge_message(&msg) {
                        return;
                    }
                    target.msg_list.push_back(msg);
                }
                if let Some(queue) = self.queues.get_mut(&owner) {
                    queue.set_bits(bit);
                }
                remove = false;
            }
        }

        if remove {
            if let Some(input) = self.inputs.get_mut(input_id) {
                if let Some(msg) = input.msg_list.remove(index) {
                    input.update_key_state(&msg);
                }
            }
        }
    }

    /// Check that a window may be stored in a queue's thread input
    fn check_queue_input_window(&self, tid: ThreadId, win: HWND) -> NtResult<()> {
        if !win.is_valid() {
            return Ok(());
        }
        let owner = self.windows.window_thread(win).ok_or(NtStatus::InvalidHandle)?;
        let mine = self.queue_input(tid);
        if mine.is_some() && self.queue_input(owner) == mine {
            Ok(())
        } else {
            Err(NtStatus::AccessDenied)
        }
    }

    fn current_input_mut(&mut self, tid: ThreadId) -> NtResult<&mut ThreadInput> {
        self.ensure_queue(tid)?;
        let id = self.queue_input(tid).ok_or(NtStatus::InvalidCid)?;
        self.inputs.get_mut(id).ok_or(NtStatus::InvalidHandle)
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Queue a raw input event
    ///
    /// With a `dest` thread the event is routed through that thread's
    /// input, otherwise through the foreground input.
    pub fn send_hardware_message(&mut self, dest: Option<ThreadId>, input: HardwareInput) -> NtResult<()> {
        if let Some(tid) = dest {
            if !self.threads.contains_key(&tid) {
                return Err(NtStatus::InvalidCid);
            }
            if !self.queues.contains_key(&tid) {
                return Err(NtStatus::InvalidParameter);
            }
        }
        let mut msg = input.into_message();
        msg.win = self.windows.full_handle(msg.win);
        log::trace!("[USER/Input] Hardware message {:#x} at ({}, {})", msg.msg, msg.pt.x, msg.pt.y);
        self.queue_hardware_message(dest, msg);
        Ok(())
    }

    /// Accept (remove or redirect) the hardware message being processed
    pub fn accept_hardware_message(&mut self, tid: ThreadId, hw_id: u32, remove: bool, new_win: HWND) -> NtResult<()> {
        if !self.queues.contains_key(&tid) {
            return Err(NtStatus::AccessDenied);
        }
        let new_win = self.windows.full_handle(new_win);
        self.release_hardware_message(tid, hw_id, remove, new_win);
        Ok(())
    }

    /// Create a private thread input for a thread
    ///
    /// The caller owns the returned reference; handing it to
    /// [`UserServer::create_message_queue`] transfers it to the queue.
    pub fn create_thread_input(&mut self, tid: ThreadId) -> NtResult<InputId> {
        let desktop = self.threads.get(&tid).ok_or(NtStatus::InvalidCid)?.desktop;
        Ok(self.inputs.create(desktop))
    }

    /// Attach the input of `from` to the input of `to`
    pub fn attach_thread_input(&mut self, from: ThreadId, to: ThreadId) -> NtResult<()> {
        if from == to {
            return Err(NtStatus::AccessDenied);
        }
        let desktop = self.threads.get(&from).ok_or(NtStatus::InvalidCid)?.desktop;
        if !self.threads.contains_key(&to) {
            return Err(NtStatus::InvalidCid);
        }
        self.ensure_queue(to)?;
        let input_id = self.queue_input(to).ok_or(NtStatus::InvalidCid)?;
        if self.inputs.get(input_id).map(|i| i.desktop) != Some(desktop) {
            log::warn!("[USER/Input] Attach {} -> {} across desktops", from.0, to.0);
            return Err(NtStatus::AccessDenied);
        }

        self.inputs.grab(input_id);
        match self.queues.get_mut(&from) {
            Some(queue) => {
                let old = std::mem::replace(&mut queue.input, input_id);
                self.release_input(old);
            }
            None => self.create_message_queue(from, Some(input_id))?,
        }
        if let Some(input) = self.inputs.get_mut(input_id) {
            input.keystate = [0; 256];
        }
        log::debug!("[USER/Input] Attached thread {} to input of thread {}", from.0, to.0);
        Ok(())
    }

    /// Give `from` a private input again
    ///
    /// Both threads must currently share the same input.
    pub fn detach_thread_input(&mut self, from: ThreadId, to: ThreadId) -> NtResult<()> {
        if !self.threads.contains_key(&from) || !self.threads.contains_key(&to) {
            return Err(NtStatus::InvalidCid);
        }
        let shared = self.queue_input(from);
        if from == to || shared.is_none() || shared != self.queue_input(to) {
            return Err(NtStatus::AccessDenied);
        }

        let input_id = self.create_thread_input(from)?;
        if let Some(queue) = self.queues.get_mut(&from) {
            let old = std::mem::replace(&mut queue.input, input_id);
            self.release_input(old);
        }
        log::debug!("[USER/Input] Detached thread {} from input of thread {}", from.0, to.0);
        Ok(())
    }

    /// Drop a queue's reference on an input, destroying it if unused
    pub(crate) fn release_input(&mut self, id: InputId) {
        if self.inputs.release(id).is_some() && self.foreground_input == Some(id) {
            self.foreground_input = None;
        }
    }

    pub fn set_focus_window(&mut self, tid: ThreadId, win: HWND) -> NtResult<HWND> {
        self.ensure_queue(tid)?;
        self.check_queue_input_window(tid, win)?;
        let win = self.windows.full_handle(win);
        let input = self.current_input_mut(tid)?;
        Ok(std::mem::replace(&mut input.focus, win))
    }

    pub fn set_active_window(&mut self, tid: ThreadId, win: HWND) -> NtResult<HWND> {
        self.ensure_queue(tid)?;
        self.check_queue_input_window(tid, win)?;
        if win.is_valid() && !self.windows.make_window_active(win) {
            return Err(NtStatus::InvalidHandle);
        }
        let win = self.windows.full_handle(win);
        let input = self.current_input_mut(tid)?;
        Ok(std::mem::replace(&mut input.active, win))
    }

    /// Set the capture window; `flags` are CAPTURE_* values
    pub fn set_capture_window(&mut self, tid: ThreadId, win: HWND, flags: u32) -> NtResult<CaptureReply> {
        self.ensure_queue(tid)?;
        self.check_queue_input_window(tid, win)?;
        let win = self.windows.full_handle(win);
        let input = self.current_input_mut(tid)?;

        let previous = std::mem::replace(&mut input.capture, win);
        input.menu_owner = if flags & CAPTURE_MENU != 0 { win } else { HWND::NULL };
        input.move_size = if flags & CAPTURE_MOVESIZE != 0 { win } else { HWND::NULL };
        Ok(CaptureReply {
            previous,
            full_handle: win,
        })
    }

    /// Move the caret to a window with a new size
    pub fn set_caret_window(&mut self, tid: ThreadId, win: HWND, width: i32, height: i32) -> NtResult<CaretReply> {
        self.ensure_queue(tid)?;
        self.check_queue_input_window(tid, win)?;
        let win = self.windows.full_handle(win);
        let input = self.current_input_mut(tid)?;

        let reply = CaretReply {
            previous: input.caret,
            old_rect: input.caret_rect,
            old_hide: input.caret_hide,
            old_state: input.caret_state,
        };
        input.set_caret_window(win);
        input.caret_rect.right = input.caret_rect.left + width;
        input.caret_rect.bottom = input.caret_rect.top + height;
        Ok(reply)
    }

    /// Update caret position, hide count or blink state
    ///
    /// `flags` are SET_CARET_* values. A `state` of -1 toggles the blink
    /// state. The hide count never drops below zero.
    pub fn set_caret_info(
        &mut self,
        tid: ThreadId,
        flags: u32,
        win: HWND,
        pt: Point,
        hide: i32,
        state: i32,
    ) -> NtResult<CaretReply> {
        let win = self.windows.full_handle(win);
        let input = self.current_input_mut(tid)?;
        let reply = CaretReply {
            previous: input.caret,
            old_rect: input.caret_rect,
            old_hide: input.caret_hide,
            old_state: input.caret_state,
        };

        if win.is_valid() && win != input.caret {
            return Err(NtStatus::AccessDenied);
        }
        if flags & SET_CARET_POS != 0 {
            input.caret_rect.move_to(pt);
        }
        if flags & SET_CARET_HIDE != 0 {
            input.caret_hide = (input.caret_hide + hide).max(0);
        }
        if flags & SET_CARET_STATE != 0 {
            input.caret_state = if state == -1 { !input.caret_state } else { state != 0 };
        }
        Ok(reply)
    }

    /// Snapshot of a thread's input, or of the foreground input
    pub fn get_thread_input_state(&self, tid: Option<ThreadId>) -> NtResult<ThreadInputInfo> {
        let input_id = match tid {
            Some(tid) => {
                if !self.threads.contains_key(&tid) {
                    return Err(NtStatus::InvalidCid);
                }
                self.queue_input(tid)
            }
            None => self.foreground_input,
        };

        let foreground = self
            .foreground_input
            .and_then(|id| self.inputs.get(id))
            .map_or(HWND::NULL, |i| i.active);

        let info = match input_id.and_then(|id| self.inputs.get(id)) {
            Some(input) => ThreadInputInfo {
                focus: input.focus,
                capture: input.capture,
                active: input.active,
                foreground,
                menu_owner: input.menu_owner,
                move_size: input.move_size,
                caret: input.caret,
                caret_rect: input.caret_rect,
            },
            None => ThreadInputInfo {
                foreground,
                ..ThreadInputInfo::default()
            },
        };
        Ok(info)
    }

    /// Key state of a thread's input
    pub fn get_key_state(&self, tid: ThreadId, key: Option<u8>) -> NtResult<KeyStateReply> {
        if !self.threads.contains_key(&tid) {
            return Err(NtStatus::InvalidCid);
        }
        let keystate = self
            .queue_input(tid)
            .and_then(|id| self.inputs.get(id))
            .map_or([0; 256], |i| i.keystate);
        Ok(KeyStateReply {
            state: key.map_or(0, |k| keystate[usize::from(k)]),
            keystate,
        })
    }

    /// Overwrite the start of a thread's key state table
    pub fn set_key_state(&mut self, tid: ThreadId, keystate: &[u8]) -> NtResult<()> {
        if !self.threads.contains_key(&tid) {
            return Err(NtStatus::InvalidCid);
        }
        if let Some(input) = self.queue_input(tid).and_then(|id| self.inputs.get_mut(id)) {
            let len = keystate.len().min(input.keystate.len());
            input.keystate[..len].copy_from_slice(&keystate[..len]);
        }
        Ok(())
    }

    /// Make the input of a top-level window's thread the foreground input
    pub fn set_foreground_window(&mut self, tid: ThreadId, win: HWND) -> NtResult<ForegroundReply> {
        self.ensure_queue(tid)?;
        let mine = self.queue_input(tid);
        let previous = self
            .foreground_input
            .and_then(|id| self.inputs.get(id))
            .map_or(HWND::NULL, |i| i.active);

        let mut reply = ForegroundReply {
            previous,
            send_msg_old: previous.is_valid() && self.foreground_input != mine,
            send_msg_new: false,
        };

        let owner = if self.windows.is_top_level_window(win) {
            self.window_queue_thread(win)
        } else {
            None
        };
        let owner_input = owner.and_then(|t| self.queue_input(t)).ok_or(NtStatus::InvalidWindowHandle)?;
        self.foreground_input = Some(owner_input);
        reply.send_msg_new = Some(owner_input) != mine;
        Ok(reply)
    }

    /// Tick count of the last hardware message
    pub fn get_last_input_time(&self) -> u32 {
        self.last_input_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::win32k::user::message::{WM_CHAR, WM_MOUSEMOVE, WM_NCLBUTTONDOWN};
    use crate::win32k::user::window::WindowTable;
    use crate::win32k::UserObjectType;

    fn key_msg(code: u32, key: u8) -> Message {
        Message::new(MessageType::Hardware, HWND::NULL, code, usize::from(key), 0)
    }

    #[test]
    fn test_caret_reset() {
        let win = HWND::new(3, UserObjectType::Window);
        let mut input = ThreadInput::new(DesktopId(0));
        assert_eq!(input.caret_hide, 1);

        input.set_caret_window(win);
        input.caret_rect = Rect::new(1, 1, 3, 10);
        input.caret_state = true;
        input.set_caret_window(win);
        assert_eq!(input.caret_rect, Rect::new(1, 1, 3, 10));
        assert!(!input.caret_state);

        input.cleanup_window(win);
        assert_eq!(input.caret, HWND::NULL);
        assert_eq!(input.caret_rect, Rect::EMPTY);
    }

    #[test]
    fn test_key_toggle() {
        let mut input = ThreadInput::new(DesktopId(0));
        input.update_key_state(&key_msg(WM_KEYDOWN, 0x41));
        assert_eq!(input.keystate[0x41], KEY_DOWN | KEY_TOGGLED);
        // Autorepeat does not toggle again
        input.update_key_state(&key_msg(WM_KEYDOWN, 0x41));
        assert_eq!(input.keystate[0x41], KEY_DOWN | KEY_TOGGLED);
        input.update_key_state(&key_msg(WM_KEYUP, 0x41));
        assert_eq!(input.keystate[0x41], KEY_TOGGLED);
        // WM_CHAR does not touch the key state
        input.update_key_state(&key_msg(WM_CHAR, 0x42));
        assert_eq!(input.keystate[0x42], 0);
    }

    #[test]
    fn test_generic_modifiers() {
        let mut input = ThreadInput::new(DesktopId(0));
        input.update_key_state(&key_msg(WM_KEYDOWN, vk::LCONTROL));
        input.update_key_state(&key_msg(WM_SYSKEYDOWN, vk::RCONTROL));
        assert!(input.is_down(vk::CONTROL));
        input.update_key_state(&key_msg(WM_KEYUP, vk::LCONTROL));
        assert!(input.is_down(vk::CONTROL));
        input.update_key_state(&key_msg(WM_SYSKEYUP, vk::RCONTROL));
        assert!(!input.is_down(vk::CONTROL));

        let mut xbutton = Message::new(MessageType::Hardware, HWND::NULL, WM_XBUTTONDOWN, XBUTTON2, 0);
        input.update_key_state(&xbutton);
        assert!(input.is_down(vk::XBUTTON2));
        xbutton.msg = WM_XBUTTONUP;
        input.update_key_state(&xbutton);
        assert!(!input.is_down(vk::XBUTTON2));
    }

    #[test]
    fn test_merge_requires_same_window() {
        let a = HWND::new(1, UserObjectType::Window);
        let b = HWND::new(2, UserObjectType::Window);
        let mut input = ThreadInput::new(DesktopId(0));
        let first = Message::new(MessageType::Hardware, a, WM_MOUSEMOVE, 0, 0);
        assert!(!input.merge_message(&first));
        input.msg_list.push_back(first);

        let mut second = Message::new(MessageType::Hardware, a, WM_MOUSEMOVE, 0, 7);
        second.pt = Point::new(5, 6);
        assert!(input.merge_message(&second));
        assert_eq!(input.msg_list.len(), 1);
        assert_eq!(input.msg_list[0].pt, Point::new(5, 6));
        assert_eq!(input.msg_list[0].lparam, 7);

        let other = Message::new(MessageType::Hardware, b, WM_MOUSEMOVE, 0, 0);
        assert!(!input.merge_message(&other));
    }

    #[test]
    fn test_input_refcount() {
        let mut table = InputTable::new();
        let id = table.create(DesktopId(1));
        assert!(table.grab(id));
        assert_eq!(table.ref_count(id), 2);
        assert!(table.release(id).is_none());
        assert!(table.release(id).is_some());
        assert!(table.get(id).is_none());
    }

    #[test]
    fn test_hw_filter_variants() {
        let windows = WindowTable::new();
        let win = HWND::new(1, UserObjectType::Window);
        // A button press may still become a non-client press or a double-click
        assert!(check_hw_message_filter(&windows, win, WM_LBUTTONDOWN, HWND::NULL, WM_NCLBUTTONDOWN, WM_NCLBUTTONDOWN));
        assert!(check_hw_message_filter(&windows, win, WM_LBUTTONDOWN, HWND::NULL, WM_LBUTTONDBLCLK, WM_LBUTTONDBLCLK));
        assert!(check_hw_message_filter(&windows, win, WM_LBUTTONDOWN, HWND::NULL, WM_NCLBUTTONDBLCLK, WM_NCLBUTTONDBLCLK));
        assert!(!check_hw_message_filter(&windows, win, WM_MOUSEWHEEL, HWND::NULL, WM_NCMOUSEFIRST, WM_NCLBUTTONDBLCLK));
        // Keyboard messages honor the window filter
        let other = HWND::new(2, UserObjectType::Window);
        assert!(!check_hw_message_filter(&windows, win, WM_KEYDOWN, other, 0, u32::MAX));
        assert!(check_hw_message_filter(&windows, win, WM_KEYDOWN, win, 0, u32::MAX));
    }
}
