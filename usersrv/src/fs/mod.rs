//! File System Drivers
//!
//! Only the mailslot file system is served here. Mailslot payloads travel
//! over local datagram socket pairs; the server tracks naming, sharing and
//! read timeouts.
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `base/fs/msfs/`

pub mod msfs;
