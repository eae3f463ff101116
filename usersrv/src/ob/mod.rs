//! Object Manager
//!
//! The small part of the object substrate the USER and MSFS servers rely
//! on: the closed set of object kinds they create, the capability traits
//! those kinds implement, per-process handle tables, access masks and the
//! case-insensitive namespace used for named objects.
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `base/ntos/ob/obhandle.c`
//! - `base/ntos/ob/obdir.c`

pub mod access;
pub mod handle;
pub mod namespace;
pub mod poll;

pub use access::AccessMask;
pub use handle::{Handle, HandleTable};
pub use namespace::Namespace;
pub use poll::{PollDescriptor, PollEvents};

// ============================================================================
// Object Kinds
// ============================================================================

/// Object kinds created by this server
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    MsgQueue = 1,
    ThreadInput = 2,
    Mailslot = 3,
    MailWriter = 4,
    MailslotDevice = 5,
}

impl ObjectKind {
    /// Object type name as registered with the object manager
    pub const fn type_name(self) -> &'static str {
        match self {
            ObjectKind::MsgQueue => "MsgQueue",
            ObjectKind::ThreadInput => "ThreadInput",
            ObjectKind::Mailslot => "Mailslot",
            ObjectKind::MailWriter => "Mailslot_Writer",
            ObjectKind::MailslotDevice => "Mailslot_Device",
        }
    }
}

/// Object attribute flags
pub mod obj_attributes {
    /// Handle is inherited by child processes
    pub const OBJ_INHERIT: u32 = 0x0000_0002;
    /// Name lookups ignore case
    pub const OBJ_CASE_INSENSITIVE: u32 = 0x0000_0040;
    /// Open the object if it already exists
    pub const OBJ_OPENIF: u32 = 0x0000_0080;
}

// ============================================================================
// Capability Traits
// ============================================================================

/// Every server object reports its kind
pub trait Object {
    fn kind(&self) -> ObjectKind;

    /// One-line description for debug output
    fn dump(&self) -> String {
        String::from(self.kind().type_name())
    }
}

/// Objects that can be waited on
pub trait Pollable: Object {
    /// Readiness as poll(2) would report it
    fn poll_events(&self) -> PollEvents;

    fn is_signaled(&self) -> bool {
        self.poll_events().contains(PollEvents::POLLIN)
    }
}

/// Objects that live in a namespace
pub trait Nameable: Object {
    /// Name relative to the containing directory, if any
    fn object_name(&self) -> Option<&str>;
}

/// Objects that translate requested access into granted access
pub trait AccessMappable: Object {
    fn map_access(&self, access: AccessMask) -> AccessMask;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(ObjectKind::MailWriter.type_name(), "Mailslot_Writer");
        assert_eq!(ObjectKind::MsgQueue.type_name(), "MsgQueue");
    }
}
