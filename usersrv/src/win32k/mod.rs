//! Win32k Subsystem
//!
//! Server-side USER state: message queues, thread input, window timers and
//! the synchronous send/reply machinery. Window geometry, painting and
//! hit-testing belong to the window manager and are reached through the
//! [`user::window::WindowManager`] trait.
//!
//! # References
//!
//! Based on Windows Server 2003 win32k.sys implementation:
//! - `windows/core/ntuser/` - USER implementation

pub mod user;

// ============================================================================
// Client Identity
// ============================================================================

/// Client thread id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

/// Client process id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

/// Desktop a thread (and its input) belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DesktopId(pub u32);

// ============================================================================
// Object Types
// ============================================================================

/// USER object types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserObjectType {
    None = 0,
    Window = 1,
    Hook = 5,
}

// ============================================================================
// Handle Types
// ============================================================================

/// USER handle (HWND, HHOOK)
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct UserHandle(u32);

impl UserHandle {
    pub const NULL: UserHandle = UserHandle(0);

    /// Create a new handle from index and type
    pub const fn new(index: u16, obj_type: UserObjectType) -> Self {
        // type (8 bits) | reserved (8 bits) | index (16 bits)
        UserHandle(((obj_type as u32) << 24) | (index as u32))
    }

    /// Wrap a raw handle value received from a client
    pub const fn from_raw(raw: u32) -> Self {
        UserHandle(raw)
    }

    /// Get the object type from handle
    pub const fn object_type(self) -> UserObjectType {
        match (self.0 >> 24) as u8 {
            1 => UserObjectType::Window,
            5 => UserObjectType::Hook,
            _ => UserObjectType::None,
        }
    }

    /// Get the index from handle
    pub const fn index(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Check if handle is non-null
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Get raw handle value
    pub const fn raw(self) -> u32 {
        self.0
    }
}

pub type HWND = UserHandle;
pub type HHOOK = UserHandle;

// ============================================================================
// Common Structures
// ============================================================================

/// Point structure
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Point { x, y }
    }
}

/// Rectangle structure
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const EMPTY: Rect = Rect::new(0, 0, 0, 0);

    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Rect { left, top, right, bottom }
    }

    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub const fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    pub fn contains_point(&self, pt: Point) -> bool {
        pt.x >= self.left && pt.x < self.right &&
        pt.y >= self.top && pt.y < self.bottom
    }

    /// Move the rectangle so its top-left corner is at `pt`, keeping its size
    pub fn move_to(&mut self, pt: Point) {
        self.right += pt.x - self.left;
        self.bottom += pt.y - self.top;
        self.left = pt.x;
        self.top = pt.y;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_layout() {
        let hwnd = UserHandle::new(7, UserObjectType::Window);
        assert_eq!(hwnd.index(), 7);
        assert_eq!(hwnd.object_type(), UserObjectType::Window);
        assert!(hwnd.is_valid());
        assert!(!HWND::NULL.is_valid());
    }

    #[test]
    fn test_rect_move_to() {
        let mut rect = Rect::new(10, 10, 12, 30);
        rect.move_to(Point::new(100, 5));
        assert_eq!(rect, Rect::new(100, 5, 102, 25));
        assert!(Rect::EMPTY.is_empty());
        assert!(rect.contains_point(Point::new(101, 5)));
    }
}
