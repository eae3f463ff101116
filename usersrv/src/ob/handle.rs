//! Handle Table Implementation
//!
//! Each process has a handle table that maps handles (small integers)
//! to server objects together with the access granted when the handle
//! was created.
//!
//! # Handle Format
//! Handles are multiples of 4 (so bits 0-1 are always 0). Handle 0 is
//! never handed out.

use super::access::AccessMask;
use crate::status::{NtResult, NtStatus};

/// Handle type (unsigned 32-bit, like Windows HANDLE)
pub type Handle = u32;

/// Invalid handle value
pub const INVALID_HANDLE_VALUE: Handle = 0xFFFF_FFFF;

/// Null handle
pub const NULL_HANDLE: Handle = 0;

/// Handle increment (handles are multiples of 4)
pub const HANDLE_INCREMENT: Handle = 4;

/// Maximum handles per process
pub const MAX_HANDLES: usize = 1024;

/// Handle table entry
#[derive(Debug)]
struct HandleTableEntry<T> {
    object: T,
    /// Granted access mask
    access_mask: AccessMask,
    /// Handle attributes (inherit, ...)
    attributes: u32,
}

/// Handle table for a process
#[derive(Debug)]
pub struct HandleTable<T> {
    /// Slot 0 stays empty so no handle is ever 0
    entries: Vec<Option<HandleTableEntry<T>>>,
    /// Number of handles in use
    handle_count: usize,
    /// Slot to start searching from
    next_hint: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            handle_count: 0,
            next_hint: 1,
        }
    }

    /// Convert handle to entry index
    #[inline]
    fn handle_to_index(handle: Handle) -> Option<usize> {
        if handle == NULL_HANDLE || handle == INVALID_HANDLE_VALUE || handle % HANDLE_INCREMENT != 0 {
            return None;
        }
        let index = (handle / HANDLE_INCREMENT) as usize;
        (index < MAX_HANDLES).then_some(index)
    }

    /// Convert entry index to handle
    #[inline]
    fn index_to_handle(index: usize) -> Handle {
        (index as Handle) * HANDLE_INCREMENT
    }

    /// Allocate a new handle for an object
    ///
    /// Fails with `NoMemory` once every slot is taken.
    pub fn create_handle(&mut self, object: T, access_mask: AccessMask, attributes: u32) -> NtResult<Handle> {
        if self.entries.is_empty() {
            self.entries.push(None);
        }

        // Search from hint to end, then from the start to the hint
        let free = (self.next_hint..self.entries.len())
            .chain(1..self.next_hint.min(self.entries.len()))
            .find(|&i| self.entries[i].is_none());

        let index = match free {
            Some(i) => i,
            None if self.entries.len() < MAX_HANDLES => {
                self.entries.push(None);
                self.entries.len() - 1
            }
            None => {
                log::warn!("[OB] Handle table full");
                return Err(NtStatus::NoMemory);
            }
        };

        self.entries[index] = Some(HandleTableEntry {
            object,
            access_mask,
            attributes,
        });
        self.handle_count += 1;
        self.next_hint = index + 1;

        Ok(Self::index_to_handle(index))
    }

    fn entry(&self, handle: Handle) -> NtResult<&HandleTableEntry<T>> {
        Self::handle_to_index(handle)
            .and_then(|i| self.entries.get(i))
            .and_then(Option::as_ref)
            .ok_or(NtStatus::InvalidHandle)
    }

    /// Look up an object, checking that `desired_access` was granted
    pub fn reference(&self, handle: Handle, desired_access: AccessMask) -> NtResult<&T> {
        let entry = self.entry(handle)?;
        if desired_access & !entry.access_mask != 0 {
            return Err(NtStatus::AccessDenied);
        }
        Ok(&entry.object)
    }

    /// Access granted to a handle
    pub fn granted_access(&self, handle: Handle) -> NtResult<AccessMask> {
        self.entry(handle).map(|e| e.access_mask)
    }

    /// Attributes a handle was created with
    pub fn attributes(&self, handle: Handle) -> NtResult<u32> {
        self.entry(handle).map(|e| e.attributes)
    }

    /// Close a handle, returning the object it referenced
    pub fn close_handle(&mut self, handle: Handle) -> NtResult<T> {
        let index = Self::handle_to_index(handle).ok_or(NtStatus::InvalidHandle)?;
        let entry = self
            .entries
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(NtStatus::InvalidHandle)?;

        self.handle_count -= 1;
        if index < self.next_hint {
            self.next_hint = index;
        }
        Ok(entry.object)
    }

    /// Number of open handles
    pub fn count(&self) -> usize {
        self.handle_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_multiples_of_four() {
        let mut table = HandleTable::new();
        let a = table.create_handle("a", 1, 0).unwrap();
        let b = table.create_handle("b", 1, 0).unwrap();
        assert_eq!(a, 4);
        assert_eq!(b, 8);
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn test_access_check() {
        let mut table = HandleTable::new();
        let h = table.create_handle(7u32, 0x1, 0).unwrap();
        assert_eq!(table.reference(h, 0x1), Ok(&7));
        assert_eq!(table.reference(h, 0x2), Err(NtStatus::AccessDenied));
        assert_eq!(table.reference(h + 1, 0), Err(NtStatus::InvalidHandle));
    }

    #[test]
    fn test_close_reuses_slot() {
        let mut table = HandleTable::new();
        let a = table.create_handle(1u8, 0, 0).unwrap();
        let _b = table.create_handle(2u8, 0, 0).unwrap();
        assert_eq!(table.close_handle(a), Ok(1));
        assert_eq!(table.close_handle(a), Err(NtStatus::InvalidHandle));
        assert_eq!(table.create_handle(3u8, 0, 0), Ok(a));
    }
}
