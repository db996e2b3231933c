// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration space access used to commit register changes.

use crate::topology::Bdf;
use std::ops::Deref;
use std::ops::DerefMut;
use thiserror::Error;

/// Error returned by a [`ConfigSpaceAccess`] implementation.
#[derive(Debug, Error)]
pub enum ConfigSpaceError {
    /// A configuration space read failed.
    #[error("failed to read config space of {bdf} at offset {offset:#x}")]
    Read {
        /// The function being accessed.
        bdf: Bdf,
        /// Byte offset into the function's configuration space.
        offset: u16,
    },
    /// A configuration space write failed.
    #[error("failed to write config space of {bdf} at offset {offset:#x}")]
    Write {
        /// The function being accessed.
        bdf: Bdf,
        /// Byte offset into the function's configuration space.
        offset: u16,
    },
}

/// Synchronous access to the configuration space of PCI functions.
///
/// All feature algorithms work against an in-memory mirror of the relevant
/// registers and only call into this trait to read the live value of a
/// register they are about to change, and to write it back.
pub trait ConfigSpaceAccess {
    /// Read a 16-bit register. `offset` must be 2-byte aligned.
    fn read_u16(&mut self, bdf: Bdf, offset: u16) -> Result<u16, ConfigSpaceError>;

    /// Read a 32-bit register. `offset` must be 4-byte aligned.
    fn read_u32(&mut self, bdf: Bdf, offset: u16) -> Result<u32, ConfigSpaceError>;

    /// Write a 16-bit register. `offset` must be 2-byte aligned.
    fn write_u16(&mut self, bdf: Bdf, offset: u16, value: u16) -> Result<(), ConfigSpaceError>;

    /// Read an 8-bit register.
    fn read_u8(&mut self, bdf: Bdf, offset: u16) -> Result<u8, ConfigSpaceError> {
        let value = self.read_u16(bdf, offset & !1)?;
        Ok((value >> ((offset & 1) * 8)) as u8)
    }

    /// Called before a read-modify-write of a control register.
    ///
    /// Implementations must keep anything that could issue overlapping
    /// configuration space accesses (interrupt handlers, other agents) out
    /// until the matching [`exit_exclusive`](Self::exit_exclusive).
    fn enter_exclusive(&mut self) {}

    /// Ends the section started by [`enter_exclusive`](Self::enter_exclusive).
    fn exit_exclusive(&mut self) {}
}

/// Holds the exclusive section of a [`ConfigSpaceAccess`] open until dropped.
pub(crate) struct ExclusiveAccess<'a, T: ConfigSpaceAccess + ?Sized> {
    io: &'a mut T,
}

impl<'a, T: ConfigSpaceAccess + ?Sized> ExclusiveAccess<'a, T> {
    pub fn new(io: &'a mut T) -> Self {
        io.enter_exclusive();
        Self { io }
    }
}

impl<T: ConfigSpaceAccess + ?Sized> Deref for ExclusiveAccess<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.io
    }
}

impl<T: ConfigSpaceAccess + ?Sized> DerefMut for ExclusiveAccess<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.io
    }
}

impl<T: ConfigSpaceAccess + ?Sized> Drop for ExclusiveAccess<'_, T> {
    fn drop(&mut self) {
        self.io.exit_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::TestConfigSpace;

    #[test]
    fn read_u8_selects_byte() {
        let bdf = Bdf::new(0, 1, 0);
        let mut cfg = TestConfigSpace::new();
        cfg.set_u16(bdf, 0x34, 0xAB40);
        assert_eq!(cfg.read_u8(bdf, 0x34).unwrap(), 0x40);
        assert_eq!(cfg.read_u8(bdf, 0x35).unwrap(), 0xAB);
    }

    #[test]
    fn exclusive_section_closed_on_error() {
        let bdf = Bdf::new(0, 1, 0);
        let mut cfg = TestConfigSpace::new();
        cfg.fail_writes(bdf);
        {
            let mut io = ExclusiveAccess::new(&mut cfg);
            assert!(io.write_u16(bdf, 0x10, 1).is_err());
        }
        assert_eq!(cfg.exclusive_depth(), 0);
        assert_eq!(cfg.exclusive_sections(), 1);
    }
}
