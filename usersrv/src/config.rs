//! Server Configuration
//!
//! Tunables for the USER server and the mailslot file system. The defaults
//! match the limits Windows applies to the same objects.

/// Time without a `get_message` call after which a queue may be hung (ms)
pub const HUNG_TIMEOUT_MS: u64 = 5000;

/// Maximum posted + sent messages held by one queue
pub const MAX_QUEUE_MESSAGES: usize = 10_000;

/// Reply buffer size assumed when a caller does not give one
pub const DEFAULT_MAX_REPLY_SIZE: usize = 65_536;

/// First id handed out to a window-less timer
pub const THREAD_TIMER_ID_FIRST: usize = 0x7fff;

/// Id at which the window-less timer cursor wraps back to the first id
pub const THREAD_TIMER_ID_LAST: usize = 0x100;

/// Namespace root for mailslots
pub const MAILSLOT_DEVICE_PATH: &str = "\\Device\\MailSlot";

/// Largest datagram accepted when a mailslot has no size limit
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// USER server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserConfig {
    /// See [`HUNG_TIMEOUT_MS`]
    pub hung_timeout_ms: u64,
    /// See [`MAX_QUEUE_MESSAGES`]
    pub max_queue_messages: usize,
    /// See [`DEFAULT_MAX_REPLY_SIZE`]
    pub max_reply_size: usize,
    pub thread_timer_id_first: usize,
    pub thread_timer_id_last: usize,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            hung_timeout_ms: HUNG_TIMEOUT_MS,
            max_queue_messages: MAX_QUEUE_MESSAGES,
            max_reply_size: DEFAULT_MAX_REPLY_SIZE,
            thread_timer_id_first: THREAD_TIMER_ID_FIRST,
            thread_timer_id_last: THREAD_TIMER_ID_LAST,
        }
    }
}

/// Mailslot file system configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsfsConfig {
    /// Path the mailslot device is registered under
    pub device_path: String,
    /// See [`MAX_DATAGRAM_SIZE`]
    pub max_datagram_size: usize,
}

impl Default for MsfsConfig {
    fn default() -> Self {
        Self {
            device_path: String::from(MAILSLOT_DEVICE_PATH),
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}
