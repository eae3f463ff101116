//! Hook Table Storage
//!
//! The hook subsystem itself lives elsewhere; a message queue only holds a
//! reference to the hook table of its thread so that `get_message` can
//! report which hooks are active and win events can name their hook.
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `windows/core/ntuser/kernel/hooks.c`

use std::sync::Arc;

use super::super::{UserHandle, UserObjectType, HHOOK};
use crate::status::{NtResult, NtStatus};

// ============================================================================
// Hook Types (WH_*)
// ============================================================================

/// Minimum hook ID
pub const WH_MIN: i32 = -1;
/// Message filter hook (dialogs, menus, scrollbars)
pub const WH_MSGFILTER: i32 = -1;
pub const WH_JOURNALRECORD: i32 = 0;
pub const WH_JOURNALPLAYBACK: i32 = 1;
pub const WH_KEYBOARD: i32 = 2;
pub const WH_GETMESSAGE: i32 = 3;
pub const WH_CALLWNDPROC: i32 = 4;
pub const WH_CBT: i32 = 5;
pub const WH_SYSMSGFILTER: i32 = 6;
pub const WH_MOUSE: i32 = 7;
pub const WH_DEBUG: i32 = 9;
pub const WH_SHELL: i32 = 10;
pub const WH_FOREGROUNDIDLE: i32 = 11;
pub const WH_CALLWNDPROCRET: i32 = 12;
pub const WH_KEYBOARD_LL: i32 = 13;
pub const WH_MOUSE_LL: i32 = 14;
/// Maximum hook ID
pub const WH_MAX: i32 = 14;

/// Bit for a hook id in the active-hooks mask
pub const fn hook_bit(id: i32) -> u32 {
    1 << (id - WH_MIN)
}

/// An installed hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hook {
    pub handle: HHOOK,
    /// WH_* type
    pub id: i32,
    /// Hook procedure address in the client
    pub proc_addr: u64,
    /// Module that contains the procedure
    pub module: String,
}

/// Hooks installed for one thread
#[derive(Debug, Default)]
pub struct HookTable {
    hooks: Vec<Hook>,
    next_index: u16,
}

/// Hook table shared by the queue and the hook subsystem
pub type SharedHookTable = Arc<spin::Mutex<HookTable>>;

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedHookTable {
        Arc::new(spin::Mutex::new(self))
    }

    /// Install a hook, most recent first
    pub fn add_hook(&mut self, id: i32, proc_addr: u64, module: &str) -> NtResult<HHOOK> {
        if !(WH_MIN..=WH_MAX).contains(&id) {
            return Err(NtStatus::InvalidParameter);
        }
        self.next_index = self.next_index.wrapping_add(1).max(1);
        let handle = UserHandle::new(self.next_index, UserObjectType::Hook);
        self.hooks.insert(
            0,
            Hook {
                handle,
                id,
                proc_addr,
                module: String::from(module),
            },
        );
        Ok(handle)
    }

    pub fn remove_hook(&mut self, handle: HHOOK) -> Option<Hook> {
        let pos = self.hooks.iter().position(|h| h.handle == handle)?;
        Some(self.hooks.remove(pos))
    }

    pub fn get(&self, handle: HHOOK) -> Option<&Hook> {
        self.hooks.iter().find(|h| h.handle == handle)
    }

    /// One bit per hook type that has at least one hook installed
    pub fn active_mask(&self) -> u32 {
        self.hooks.iter().fold(0, |mask, h| mask | hook_bit(h.id))
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_mask() {
        let mut table = HookTable::new();
        let kb = table.add_hook(WH_KEYBOARD, 0x1000, "kbd.dll").unwrap();
        table.add_hook(WH_MSGFILTER, 0x2000, "menu.dll").unwrap();
        assert_eq!(table.active_mask(), hook_bit(WH_KEYBOARD) | 1);

        assert_eq!(table.remove_hook(kb).map(|h| h.id), Some(WH_KEYBOARD));
        assert_eq!(table.active_mask(), 1);
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut table = HookTable::new();
        assert_eq!(table.add_hook(WH_MAX + 1, 0, ""), Err(NtStatus::InvalidParameter));
        assert!(table.is_empty());
    }
}
