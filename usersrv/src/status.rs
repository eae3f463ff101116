//! NT Status Codes
//!
//! Every request handled by the USER server and the mailslot file system
//! reports failure through one of these codes. Informational and warning
//! values (`Pending`, `Timeout`, `BufferOverflow`) are surfaced the same way
//! as errors: the request did not complete and the caller must act on it.

use thiserror::Error;

/// Status codes returned by USER and MSFS requests
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum NtStatus {
    /// The wait timed out (send without reply, hung receiver)
    #[error("timeout")]
    Timeout = 0x0000_0102,
    /// Nothing to return yet; wait on the object and retry
    #[error("operation pending")]
    Pending = 0x0000_0103,
    /// Named object already exists (open-if on a mailslot)
    #[error("object name exists")]
    ObjectNameExists = 0x4000_0000,
    /// Reply data does not fit the caller's buffer; retry with a larger one
    #[error("buffer overflow")]
    BufferOverflow = 0x8000_0005,
    #[error("unsuccessful")]
    Unsuccessful = 0xC000_0001,
    #[error("invalid handle")]
    InvalidHandle = 0xC000_0008,
    /// Thread id does not name a live thread
    #[error("invalid client id")]
    InvalidCid = 0xC000_000B,
    #[error("invalid parameter")]
    InvalidParameter = 0xC000_000D,
    #[error("no memory")]
    NoMemory = 0xC000_0017,
    #[error("access denied")]
    AccessDenied = 0xC000_0022,
    /// Read buffer cannot hold the next datagram; the datagram stays queued
    #[error("buffer too small")]
    BufferTooSmall = 0xC000_0023,
    #[error("object type mismatch")]
    ObjectTypeMismatch = 0xC000_0024,
    #[error("object name invalid")]
    ObjectNameInvalid = 0xC000_0033,
    #[error("object name not found")]
    ObjectNameNotFound = 0xC000_0034,
    #[error("object name collision")]
    ObjectNameCollision = 0xC000_0035,
    #[error("sharing violation")]
    SharingViolation = 0xC000_0043,
    #[error("quota exceeded")]
    QuotaExceeded = 0xC000_0044,
    /// An asynchronous read expired before data arrived
    #[error("i/o timeout")]
    IoTimeout = 0xC000_00B5,
    /// The sender gave up on a send before it was replied to
    #[error("cancelled")]
    Cancelled = 0xC000_0120,
    /// The other end of a datagram channel is gone
    #[error("pipe broken")]
    PipeBroken = 0xC000_014B,
    /// Win32 ERROR_INVALID_WINDOW_HANDLE wrapped as a status
    #[error("invalid window handle")]
    InvalidWindowHandle = 0xC001_0578,
}

impl NtStatus {
    /// Raw 32-bit status value
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Error severity (top two bits set)
    pub const fn is_error(self) -> bool {
        (self as u32) >> 30 == 3
    }
}

/// Result type used by every request handler
pub type NtResult<T> = Result<T, NtStatus>;

impl From<std::io::Error> for NtStatus {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::WouldBlock => NtStatus::Pending,
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::NotConnected => NtStatus::PipeBroken,
            ErrorKind::OutOfMemory => NtStatus::NoMemory,
            ErrorKind::PermissionDenied => NtStatus::AccessDenied,
            ErrorKind::InvalidInput => NtStatus::InvalidParameter,
            _ => NtStatus::Unsuccessful,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity() {
        assert!(NtStatus::AccessDenied.is_error());
        assert!(NtStatus::SharingViolation.is_error());
        assert!(!NtStatus::Pending.is_error());
        assert!(!NtStatus::BufferOverflow.is_error());
        assert_eq!(NtStatus::Timeout.code(), 0x102);
    }

    #[test]
    fn test_io_error_mapping() {
        let err = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        assert_eq!(NtStatus::from(err), NtStatus::Pending);
        let err = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert_eq!(NtStatus::from(err), NtStatus::PipeBroken);
    }

    #[test]
    fn test_display() {
        assert_eq!(NtStatus::SharingViolation.to_string(), "sharing violation");
    }
}
