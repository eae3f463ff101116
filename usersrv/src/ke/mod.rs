//! Kernel Executive Services
//!
//! Only the timer facility is needed here: message reply timeouts, window
//! timers and mailslot read timeouts all run off one deadline queue per
//! server.

pub mod timer;

pub use timer::{DeadlineId, DeadlineQueue, Ticks};
