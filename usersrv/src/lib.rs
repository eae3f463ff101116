//! USER Message Server
//!
//! Server-side state for window message delivery and mailslot IPC. Client
//! threads issue discrete requests (post, send, get, reply, timers, focus,
//! mailslot create/open) and every request completes synchronously: work
//! that cannot finish yet reports `Pending` and the caller waits on the
//! queue or mailslot readiness before retrying.
//!
//! # Layout
//!
//! - **ke**: virtual tick clock and one-shot deadlines
//! - **ob**: object kinds, capability traits, handle tables, namespaces
//! - **win32k**: USER message queues, thread input, timers, send/reply
//! - **fs**: the mailslot file system (MSFS)
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `windows/core/ntuser/kernel/queue.c`
//! - `windows/core/ntuser/kernel/sendmsg.c`
//! - `base/fs/msfs/`

pub mod config;
pub mod fs;
pub mod ke;
pub mod ob;
pub mod status;
pub mod win32k;

pub use config::{MsfsConfig, UserConfig};
pub use fs::msfs::MailslotFs;
pub use status::{NtResult, NtStatus};
pub use win32k::user::{SharedUserServer, UserServer};
