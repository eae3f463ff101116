//! Access Masks
//!
//! Generic, standard and file-specific access rights, plus the generic
//! mapping used to turn GENERIC_* requests into specific rights.

/// Access mask (ACCESS_MASK)
pub type AccessMask = u32;

/// Generic access rights
pub mod generic_rights {
    pub const GENERIC_READ: u32 = 0x8000_0000;
    pub const GENERIC_WRITE: u32 = 0x4000_0000;
    pub const GENERIC_EXECUTE: u32 = 0x2000_0000;
    pub const GENERIC_ALL: u32 = 0x1000_0000;

    /// All four generic bits
    pub const GENERIC_MASK: u32 = GENERIC_READ | GENERIC_WRITE | GENERIC_EXECUTE | GENERIC_ALL;
}

/// Standard access rights
pub mod standard_rights {
    pub const DELETE: u32 = 0x0001_0000;
    pub const READ_CONTROL: u32 = 0x0002_0000;
    pub const WRITE_DAC: u32 = 0x0004_0000;
    pub const WRITE_OWNER: u32 = 0x0008_0000;
    pub const SYNCHRONIZE: u32 = 0x0010_0000;

    pub const STANDARD_RIGHTS_REQUIRED: u32 = 0x000F_0000;
    pub const STANDARD_RIGHTS_READ: u32 = READ_CONTROL;
    pub const STANDARD_RIGHTS_WRITE: u32 = READ_CONTROL;
    pub const STANDARD_RIGHTS_EXECUTE: u32 = READ_CONTROL;
    pub const STANDARD_RIGHTS_ALL: u32 = 0x001F_0000;
}

/// File access rights
pub mod file_access {
    /// Read data
    pub const FILE_READ_DATA: u32 = 0x0001;
    /// Write data
    pub const FILE_WRITE_DATA: u32 = 0x0002;
    /// Append data
    pub const FILE_APPEND_DATA: u32 = 0x0004;
    pub const FILE_READ_EA: u32 = 0x0008;
    pub const FILE_WRITE_EA: u32 = 0x0010;
    pub const FILE_EXECUTE: u32 = 0x0020;
    pub const FILE_READ_ATTRIBUTES: u32 = 0x0080;
    pub const FILE_WRITE_ATTRIBUTES: u32 = 0x0100;
    pub const FILE_ALL_ACCESS: u32 = 0x001F_01FF;
    pub const FILE_GENERIC_READ: u32 = 0x0012_0089;
    pub const FILE_GENERIC_WRITE: u32 = 0x0012_0116;
    pub const FILE_GENERIC_EXECUTE: u32 = 0x0012_00A0;
}

/// File share modes
pub mod file_share {
    pub const FILE_SHARE_READ: u32 = 0x0000_0001;
    pub const FILE_SHARE_WRITE: u32 = 0x0000_0002;
    pub const FILE_SHARE_DELETE: u32 = 0x0000_0004;
}

/// Mapping from generic rights to object-specific rights
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericMapping {
    pub generic_read: u32,
    pub generic_write: u32,
    pub generic_execute: u32,
    pub generic_all: u32,
}

/// Generic mapping for file-like objects
pub const FILE_GENERIC_MAPPING: GenericMapping = GenericMapping {
    generic_read: file_access::FILE_GENERIC_READ,
    generic_write: file_access::FILE_GENERIC_WRITE,
    generic_execute: file_access::FILE_GENERIC_EXECUTE,
    generic_all: file_access::FILE_ALL_ACCESS,
};

impl GenericMapping {
    /// Map generic rights to specific rights
    pub fn map_generic(&self, access_mask: AccessMask) -> AccessMask {
        use generic_rights::*;

        let mut result = access_mask;

        if (result & GENERIC_READ) != 0 {
            result &= !GENERIC_READ;
            result |= self.generic_read;
        }
        if (result & GENERIC_WRITE) != 0 {
            result &= !GENERIC_WRITE;
            result |= self.generic_write;
        }
        if (result & GENERIC_EXECUTE) != 0 {
            result &= !GENERIC_EXECUTE;
            result |= self.generic_execute;
        }
        if (result & GENERIC_ALL) != 0 {
            result &= !GENERIC_ALL;
            result |= self.generic_all;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_generic() {
        let mapped = FILE_GENERIC_MAPPING.map_generic(generic_rights::GENERIC_READ);
        assert_eq!(mapped, file_access::FILE_GENERIC_READ);

        let mapped = FILE_GENERIC_MAPPING
            .map_generic(generic_rights::GENERIC_WRITE | standard_rights::SYNCHRONIZE);
        assert_eq!(mapped & generic_rights::GENERIC_MASK, 0);
        assert_ne!(mapped & file_access::FILE_WRITE_DATA, 0);
    }
}
