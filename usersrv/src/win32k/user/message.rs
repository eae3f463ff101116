//! Messages and Queue Status Bits
//!
//! Message codes, the queued message record, the QS_* readiness bits and
//! the request/reply shapes of the message requests.
//!
//! # Message Types
//!
//! - **Posted**: Queued asynchronously, FIFO, no reply
//! - **Sent**: Synchronous, the sender collects a reply later
//! - **Hardware**: Raw input, routed when it is retrieved
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `windows/core/ntuser/kernel/sendmsg.c`
//! - `windows/core/ntuser/inc/messages.h`

use super::super::{Point, ThreadId, HHOOK, HWND};
use super::result::ResultId;

// ============================================================================
// Window Messages
// ============================================================================

/// Window message constants
pub const WM_NULL: u32 = 0x0000;
pub const WM_PAINT: u32 = 0x000F;
pub const WM_QUIT: u32 = 0x0012;

// Non-client mouse messages
pub const WM_NCMOUSEFIRST: u32 = 0x00A0;
pub const WM_NCMOUSEMOVE: u32 = 0x00A0;
pub const WM_NCLBUTTONDOWN: u32 = 0x00A1;
pub const WM_NCLBUTTONUP: u32 = 0x00A2;
pub const WM_NCLBUTTONDBLCLK: u32 = 0x00A3;
pub const WM_NCXBUTTONDBLCLK: u32 = 0x00AD;
pub const WM_NCMOUSELAST: u32 = 0x00AD;

// Keyboard messages
pub const WM_KEYFIRST: u32 = 0x0100;
pub const WM_KEYDOWN: u32 = 0x0100;
pub const WM_KEYUP: u32 = 0x0101;
pub const WM_CHAR: u32 = 0x0102;
pub const WM_SYSKEYDOWN: u32 = 0x0104;
pub const WM_SYSKEYUP: u32 = 0x0105;
pub const WM_KEYLAST: u32 = 0x0109;

// Timer
pub const WM_TIMER: u32 = 0x0113;
pub const WM_SYSTIMER: u32 = 0x0118;

// Mouse messages
pub const WM_MOUSEFIRST: u32 = 0x0200;
pub const WM_MOUSEMOVE: u32 = 0x0200;
pub const WM_LBUTTONDOWN: u32 = 0x0201;
pub const WM_LBUTTONUP: u32 = 0x0202;
pub const WM_LBUTTONDBLCLK: u32 = 0x0203;
pub const WM_RBUTTONDOWN: u32 = 0x0204;
pub const WM_RBUTTONUP: u32 = 0x0205;
pub const WM_RBUTTONDBLCLK: u32 = 0x0206;
pub const WM_MBUTTONDOWN: u32 = 0x0207;
pub const WM_MBUTTONUP: u32 = 0x0208;
pub const WM_MBUTTONDBLCLK: u32 = 0x0209;
pub const WM_MOUSEWHEEL: u32 = 0x020A;
pub const WM_XBUTTONDOWN: u32 = 0x020B;
pub const WM_XBUTTONUP: u32 = 0x020C;
pub const WM_XBUTTONDBLCLK: u32 = 0x020D;
pub const WM_MOUSELAST: u32 = 0x020E;

// User-defined messages
pub const WM_USER: u32 = 0x0400;
pub const WM_APP: u32 = 0x8000;

/// X button identifiers carried in wparam
pub const XBUTTON1: usize = 0x0001;
pub const XBUTTON2: usize = 0x0002;

// ============================================================================
// Request Flags
// ============================================================================

/// Leave the message in the queue
pub const PM_NOREMOVE: u32 = 0x0000;
/// Remove the message from the queue
pub const PM_REMOVE: u32 = 0x0001;
pub const PM_NOYIELD: u32 = 0x0002;

/// Fail a send right away if the receiving thread is hung
pub const SEND_MSG_ABORT_IF_HUNG: u32 = 0x0001;

/// Wait forever
pub const INFINITE: u32 = 0xFFFF_FFFF;

// ============================================================================
// Queue Status Bits
// ============================================================================

bitflags::bitflags! {
    /// Queue wake bits (QS_*)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueueStatus: u32 {
        const KEY = 0x0001;
        const MOUSEMOVE = 0x0002;
        const MOUSEBUTTON = 0x0004;
        const POSTMESSAGE = 0x0008;
        const TIMER = 0x0010;
        const PAINT = 0x0020;
        const SENDMESSAGE = 0x0040;
        const HOTKEY = 0x0080;
        const ALLPOSTMESSAGE = 0x0100;
        /// A reply to the sender's latest send is ready
        const SMRESULT = 0x8000;

        const MOUSE = Self::MOUSEMOVE.bits() | Self::MOUSEBUTTON.bits();
        const INPUT = Self::MOUSE.bits() | Self::KEY.bits();
        const ALLEVENTS = Self::INPUT.bits() | Self::POSTMESSAGE.bits() | Self::TIMER.bits()
            | Self::PAINT.bits() | Self::HOTKEY.bits();
        const ALLINPUT = Self::ALLEVENTS.bits() | Self::SENDMESSAGE.bits();
    }
}

// ============================================================================
// Message Record
// ============================================================================

/// How a message was queued
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Sent, ANSI window procedure
    Ascii = 0,
    /// Sent, Unicode window procedure
    Unicode = 1,
    /// Sent without waiting for a reply
    Notify = 2,
    /// Sent with an asynchronous completion message
    Callback = 3,
    /// Completion of a callback send, queued back to the sender
    CallbackResult = 4,
    /// Sent across processes
    OtherProcess = 5,
    Posted = 6,
    Hardware = 7,
    /// Accessibility event for an out-of-context hook
    WinEvent = 8,
}

impl MessageType {
    /// Whether a send of this type waits for a reply
    pub const fn needs_result(self) -> bool {
        matches!(
            self,
            MessageType::OtherProcess | MessageType::Ascii | MessageType::Unicode | MessageType::Callback
        )
    }
}

/// A queued message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    /// Destination window
    pub win: HWND,
    /// Message code
    pub msg: u32,
    pub wparam: usize,
    pub lparam: isize,
    /// Extra info
    pub info: usize,
    /// Cursor position
    pub pt: Point,
    /// Tick count when queued
    pub time: u32,
    /// Variable-length payload
    pub data: Vec<u8>,
    /// Tag for nested hardware message waits (0 until handed out)
    pub unique_id: u32,
    /// Pending result of a synchronous send
    pub(crate) result: Option<ResultId>,
}

impl Message {
    pub fn new(msg_type: MessageType, win: HWND, msg: u32, wparam: usize, lparam: isize) -> Self {
        Self {
            msg_type,
            win,
            msg,
            wparam,
            lparam,
            info: 0,
            pt: Point::default(),
            time: 0,
            data: Vec::new(),
            unique_id: 0,
            result: None,
        }
    }

    pub fn is_keyboard(&self) -> bool {
        is_keyboard_msg(self.msg)
    }

    /// Result this message is waiting on, if it is a synchronous send
    pub fn result(&self) -> Option<ResultId> {
        self.result
    }
}

/// Check whether a code is a keyboard message
pub const fn is_keyboard_msg(msg: u32) -> bool {
    msg >= WM_KEYFIRST && msg <= WM_KEYLAST
}

/// Check if message is matched by the filter range
pub const fn check_msg_filter(msg: u32, first: u32, last: u32) -> bool {
    msg >= first && msg <= last
}

/// Check whether a filter range contains at least one hardware message
pub const fn filter_contains_hw_range(first: u32, last: u32) -> bool {
    // In numerical order: NC mouse, keyboard, mouse
    if last < WM_NCMOUSEFIRST {
        return false;
    }
    if first > WM_NCMOUSELAST && last < WM_KEYFIRST {
        return false;
    }
    if first > WM_KEYLAST && last < WM_MOUSEFIRST {
        return false;
    }
    first <= WM_MOUSELAST
}

/// QS_* bit a hardware message wakes its queue with
pub const fn hardware_msg_bit(msg: u32) -> QueueStatus {
    if msg == WM_MOUSEMOVE || msg == WM_NCMOUSEMOVE {
        QueueStatus::MOUSEMOVE
    } else if is_keyboard_msg(msg) {
        QueueStatus::KEY
    } else {
        QueueStatus::MOUSEBUTTON
    }
}

// ============================================================================
// Win Event Payload
// ============================================================================

/// Payload of a [`MessageType::WinEvent`] message
///
/// Encoded little-endian as hook handle, thread id, hook procedure address
/// and the UTF-16 module name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinEventData {
    pub hook: HHOOK,
    /// Thread that raised the event
    pub tid: ThreadId,
    pub hook_proc: u64,
    pub module: String,
}

impl WinEventData {
    const HEADER_SIZE: usize = 16;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_SIZE + self.module.len() * 2);
        out.extend_from_slice(&self.hook.raw().to_le_bytes());
        out.extend_from_slice(&self.tid.0.to_le_bytes());
        out.extend_from_slice(&self.hook_proc.to_le_bytes());
        for unit in self.module.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::HEADER_SIZE || (bytes.len() - Self::HEADER_SIZE) % 2 != 0 {
            return None;
        }
        let hook = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let tid = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        let hook_proc = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
        let units: Vec<u16> = bytes[Self::HEADER_SIZE..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();

        Some(Self {
            hook: HHOOK::from_raw(hook),
            tid: ThreadId(tid),
            hook_proc,
            module: String::from_utf16(&units).ok()?,
        })
    }
}

// ============================================================================
// Requests and Replies
// ============================================================================

/// Parameters of a `send_message` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageRequest {
    /// Receiving thread
    pub dest: ThreadId,
    pub msg_type: MessageType,
    /// SEND_MSG_* flags
    pub flags: u32,
    pub win: HWND,
    pub msg: u32,
    pub wparam: usize,
    pub lparam: isize,
    /// Reply timeout in ms, [`INFINITE`] for none
    pub timeout: u32,
    pub data: Vec<u8>,
}

impl SendMessageRequest {
    pub fn new(dest: ThreadId, msg_type: MessageType, win: HWND, msg: u32) -> Self {
        Self {
            dest,
            msg_type,
            flags: 0,
            win,
            msg,
            wparam: 0,
            lparam: 0,
            timeout: INFINITE,
            data: Vec::new(),
        }
    }

    pub fn params(mut self, wparam: usize, lparam: isize) -> Self {
        self.wparam = wparam;
        self.lparam = lparam;
        self
    }

    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn timeout(mut self, ms: u32) -> Self {
        self.timeout = ms;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }
}

/// A raw input event for `send_hardware_message`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareInput {
    pub win: HWND,
    pub msg: u32,
    pub wparam: usize,
    pub lparam: isize,
    pub pt: Point,
    pub time: u32,
    pub info: usize,
}

impl HardwareInput {
    pub fn new(win: HWND, msg: u32, wparam: usize, lparam: isize) -> Self {
        Self {
            win,
            msg,
            wparam,
            lparam,
            ..Self::default()
        }
    }

    pub fn at(mut self, x: i32, y: i32) -> Self {
        self.pt = Point::new(x, y);
        self
    }

    pub fn time(mut self, time: u32) -> Self {
        self.time = time;
        self
    }

    pub(crate) fn into_message(self) -> Message {
        let mut msg = Message::new(MessageType::Hardware, self.win, self.msg, self.wparam, self.lparam);
        msg.pt = self.pt;
        msg.time = self.time;
        msg.info = self.info;
        msg
    }
}

/// Parameters of a `get_message` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMessageRequest {
    /// PM_* flags; the high word is a QS_* filter (0 means all input)
    pub flags: u32,
    /// Only messages for this window (and its children)
    pub get_win: HWND,
    pub get_first: u32,
    pub get_last: u32,
    /// Hardware message the caller is currently processing
    pub hw_id: u32,
    /// Masks stored on the queue when nothing is found
    pub wake_mask: QueueStatus,
    pub changed_mask: QueueStatus,
    /// Largest payload the caller can take
    pub max_size: usize,
}

impl Default for GetMessageRequest {
    fn default() -> Self {
        Self {
            flags: PM_REMOVE,
            get_win: HWND::NULL,
            get_first: 0,
            get_last: u32::MAX,
            hw_id: 0,
            wake_mask: QueueStatus::empty(),
            changed_mask: QueueStatus::empty(),
            max_size: crate::config::DEFAULT_MAX_REPLY_SIZE,
        }
    }
}

impl GetMessageRequest {
    /// Remove the first message of any kind
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_remove(mut self) -> Self {
        self.flags &= !PM_REMOVE;
        self
    }

    /// Only look at the given QS_* categories
    pub fn filter(mut self, filter: QueueStatus) -> Self {
        self.flags = (self.flags & 0xFFFF) | (filter.bits() << 16);
        self
    }

    pub fn window(mut self, win: HWND) -> Self {
        self.get_win = win;
        self
    }

    pub fn range(mut self, first: u32, last: u32) -> Self {
        self.get_first = first;
        self.get_last = last;
        self
    }

    pub fn hw_id(mut self, hw_id: u32) -> Self {
        self.hw_id = hw_id;
        self
    }

    pub fn masks(mut self, wake_mask: QueueStatus, changed_mask: QueueStatus) -> Self {
        self.wake_mask = wake_mask;
        self.changed_mask = changed_mask;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub(crate) fn removes(&self) -> bool {
        self.flags & PM_REMOVE != 0
    }

    /// QS_* categories the caller asked for
    pub(crate) fn status_filter(&self) -> QueueStatus {
        let filter = QueueStatus::from_bits_truncate(self.flags >> 16);
        if filter.is_empty() {
            QueueStatus::ALLINPUT
        } else {
            filter
        }
    }
}

/// Message handed back by `get_message`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMessageReply {
    pub msg_type: MessageType,
    pub win: HWND,
    pub msg: u32,
    pub wparam: usize,
    pub lparam: isize,
    pub info: usize,
    pub pt: Point,
    pub time: u32,
    /// Id to pass to `accept_hardware_message` (hardware messages only)
    pub hw_id: u32,
    /// WH_* hooks active for the calling thread, one bit per hook id
    pub active_hooks: u32,
    pub data: Vec<u8>,
}

impl GetMessageReply {
    pub(crate) fn from_message(msg: &Message, data: Vec<u8>) -> Self {
        Self {
            msg_type: msg.msg_type,
            win: msg.win,
            msg: msg.msg,
            wparam: msg.wparam,
            lparam: msg.lparam,
            info: msg.info,
            pt: msg.pt,
            time: msg.time,
            hw_id: 0,
            active_hooks: 0,
            data,
        }
    }

    /// A message synthesized by the server (quit, paint, timer)
    pub(crate) fn synthesized(win: HWND, msg: u32, wparam: usize, lparam: isize, time: u32) -> Self {
        let mut reply = Self::from_message(&Message::new(MessageType::Posted, win, msg, wparam, lparam), Vec::new());
        reply.time = time;
        reply
    }
}

/// Reply collected by the sender of a synchronous message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendReply {
    pub result: isize,
    pub data: Vec<u8>,
}
