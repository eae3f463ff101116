//! Window Manager Interface
//!
//! Message routing needs a handful of answers from the window manager:
//! which thread owns a window, whether it is visible, which window lies
//! under a point, and which window of a thread needs repainting. The
//! [`WindowManager`] trait is that seam. [`WindowTable`] is a small
//! in-memory window manager that tracks just enough state to answer it.
//!
//! # References
//!
//! Based on Windows Server 2003:
//! - `windows/core/ntuser/kernel/winmgr.c`
//! - `windows/core/ntuser/kernel/winwhere.c`

use std::collections::BTreeMap;

use super::super::{DesktopId, Point, Rect, ThreadId, UserHandle, UserObjectType, HWND};
use crate::status::{NtResult, NtStatus};

/// Maximum number of windows
pub const MAX_WINDOWS: usize = 0xFFFF;

/// Window queries used by the message server
pub trait WindowManager {
    /// Thread that created the window
    fn window_thread(&self, win: HWND) -> Option<ThreadId>;

    fn is_window_visible(&self, win: HWND) -> bool;

    /// Check whether `child` is a descendant of `parent`
    fn is_child_window(&self, parent: HWND, child: HWND) -> bool;

    /// Topmost visible window containing `pt` on a desktop
    fn window_from_point(&self, desktop: DesktopId, pt: Point) -> HWND;

    fn is_top_level_window(&self, win: HWND) -> bool;

    /// Activate a window; false if it cannot be activated
    fn make_window_active(&mut self, win: HWND) -> bool;

    /// A window owned by `thread` (and matching `filter` unless null) that
    /// needs painting
    fn find_window_to_repaint(&self, filter: HWND, thread: ThreadId) -> HWND;

    /// Expand a possibly truncated handle to its full value
    fn full_handle(&self, win: HWND) -> HWND {
        win
    }
}

// ============================================================================
// In-Memory Window Table
// ============================================================================

/// Window state tracked by [`WindowTable`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntry {
    pub hwnd: HWND,
    /// Owning thread
    pub thread: ThreadId,
    pub desktop: DesktopId,
    /// Parent window (null for top-level)
    pub parent: HWND,
    /// Window rectangle (screen coordinates)
    pub rect: Rect,
    pub visible: bool,
    /// Z-order, higher is on top
    pub z_order: u32,
    /// Window needs repainting
    pub needs_paint: bool,
}

/// Simple window manager
#[derive(Debug, Default)]
pub struct WindowTable {
    windows: BTreeMap<u16, WindowEntry>,
    next_index: u16,
    next_z_order: u32,
    active: HWND,
}

impl WindowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a hidden window owned by `thread`
    pub fn create_window(&mut self, thread: ThreadId, desktop: DesktopId, parent: HWND, rect: Rect) -> NtResult<HWND> {
        if self.windows.len() >= MAX_WINDOWS {
            return Err(NtStatus::NoMemory);
        }
        if parent.is_valid() && self.get(parent).is_none() {
            return Err(NtStatus::InvalidHandle);
        }

        let mut index = self.next_index;
        loop {
            index = index.wrapping_add(1).max(1);
            if !self.windows.contains_key(&index) {
                break;
            }
        }
        self.next_index = index;
        self.next_z_order += 1;

        let hwnd = UserHandle::new(index, UserObjectType::Window);
        self.windows.insert(
            index,
            WindowEntry {
                hwnd,
                thread,
                desktop,
                parent,
                rect,
                visible: false,
                z_order: self.next_z_order,
                needs_paint: false,
            },
        );
        log::trace!("[USER/Window] Created {:#x} for thread {}", hwnd.raw(), thread.0);
        Ok(hwnd)
    }

    /// Destroy a window and its children
    ///
    /// Returns every handle that went away, children first.
    pub fn destroy_window(&mut self, hwnd: HWND) -> Vec<HWND> {
        let mut destroyed = Vec::new();
        if self.get(hwnd).is_none() {
            return destroyed;
        }
        let children: Vec<HWND> = self
            .windows
            .values()
            .filter(|w| w.parent == hwnd)
            .map(|w| w.hwnd)
            .collect();
        for child in children {
            destroyed.extend(self.destroy_window(child));
        }
        self.windows.remove(&hwnd.index());
        if self.active == hwnd {
            self.active = HWND::NULL;
        }
        destroyed.push(hwnd);
        destroyed
    }

    pub fn get(&self, hwnd: HWND) -> Option<&WindowEntry> {
        self.windows.get(&hwnd.index()).filter(|w| w.hwnd == hwnd)
    }

    fn get_mut(&mut self, hwnd: HWND) -> Option<&mut WindowEntry> {
        self.windows.get_mut(&hwnd.index()).filter(|w| w.hwnd == hwnd)
    }

    pub fn set_visible(&mut self, hwnd: HWND, visible: bool) -> bool {
        self.get_mut(hwnd).map(|w| w.visible = visible).is_some()
    }

    /// Mark a window as needing (or no longer needing) a repaint
    pub fn invalidate(&mut self, hwnd: HWND, needs_paint: bool) -> bool {
        self.get_mut(hwnd).map(|w| w.needs_paint = needs_paint).is_some()
    }

    pub fn active_window(&self) -> HWND {
        self.active
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl WindowManager for WindowTable {
    fn window_thread(&self, win: HWND) -> Option<ThreadId> {
        self.get(win).map(|w| w.thread)
    }

    fn is_window_visible(&self, win: HWND) -> bool {
        // A window is only visible if all its ancestors are
        let mut current = self.get(win);
        while let Some(w) = current {
            if !w.visible {
                return false;
            }
            if !w.parent.is_valid() {
                return true;
            }
            current = self.get(w.parent);
        }
        false
    }

    fn is_child_window(&self, parent: HWND, child: HWND) -> bool {
        let mut current = self.get(child).map(|w| w.parent);
        while let Some(p) = current.filter(|p| p.is_valid()) {
            if p == parent {
                return true;
            }
            current = self.get(p).map(|w| w.parent);
        }
        false
    }

    fn window_from_point(&self, desktop: DesktopId, pt: Point) -> HWND {
        self.windows
            .values()
            .filter(|w| w.desktop == desktop && w.rect.contains_point(pt) && self.is_window_visible(w.hwnd))
            .max_by_key(|w| w.z_order)
            .map_or(HWND::NULL, |w| w.hwnd)
    }

    fn is_top_level_window(&self, win: HWND) -> bool {
        self.get(win).is_some_and(|w| !w.parent.is_valid())
    }

    fn make_window_active(&mut self, win: HWND) -> bool {
        if self.get(win).is_none() {
            return false;
        }
        self.next_z_order += 1;
        let z = self.next_z_order;
        if let Some(w) = self.get_mut(win) {
            w.z_order = z;
        }
        self.active = win;
        true
    }

    fn find_window_to_repaint(&self, filter: HWND, thread: ThreadId) -> HWND {
        self.windows
            .values()
            .find(|w| {
                w.thread == thread
                    && w.needs_paint
                    && (!filter.is_valid() || w.hwnd == filter || self.is_child_window(filter, w.hwnd))
            })
            .map_or(HWND::NULL, |w| w.hwnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: ThreadId = ThreadId(1);
    const DESK: DesktopId = DesktopId(0);

    #[test]
    fn test_window_from_point_uses_z_order() {
        let mut table = WindowTable::new();
        let back = table.create_window(T1, DESK, HWND::NULL, Rect::new(0, 0, 100, 100)).unwrap();
        let front = table.create_window(T1, DESK, HWND::NULL, Rect::new(50, 50, 150, 150)).unwrap();
        table.set_visible(back, true);
        table.set_visible(front, true);

        assert_eq!(table.window_from_point(DESK, Point::new(60, 60)), front);
        assert_eq!(table.window_from_point(DESK, Point::new(10, 10)), back);
        assert_eq!(table.window_from_point(DESK, Point::new(500, 500)), HWND::NULL);

        assert!(table.make_window_active(back));
        assert_eq!(table.window_from_point(DESK, Point::new(60, 60)), back);
    }

    #[test]
    fn test_children() {
        let mut table = WindowTable::new();
        let top = table.create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        let child = table.create_window(T1, DESK, top, Rect::EMPTY).unwrap();
        let grandchild = table.create_window(T1, DESK, child, Rect::EMPTY).unwrap();

        assert!(table.is_child_window(top, grandchild));
        assert!(!table.is_child_window(grandchild, top));
        assert!(table.is_top_level_window(top));
        assert!(!table.is_top_level_window(child));

        table.set_visible(child, true);
        assert!(!table.is_window_visible(child));
        table.set_visible(top, true);
        assert!(table.is_window_visible(child));

        assert_eq!(table.destroy_window(top), vec![grandchild, child, top]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_repaint_filter() {
        let mut table = WindowTable::new();
        let a = table.create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        let b = table.create_window(T1, DESK, HWND::NULL, Rect::EMPTY).unwrap();
        table.invalidate(b, true);
        assert_eq!(table.find_window_to_repaint(HWND::NULL, T1), b);
        assert_eq!(table.find_window_to_repaint(a, T1), HWND::NULL);
        assert_eq!(table.find_window_to_repaint(HWND::NULL, ThreadId(2)), HWND::NULL);
    }
}
