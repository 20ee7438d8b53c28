//! Scatter register file layout.
//!
//! The scatter vFPGA exposes one 64-bit address register per destination
//! buffer followed by a single "valid" register. The hardware starts
//! scattering inbound writes only after `VALID` has been set, so the address
//! registers must be written first.

use crate::accel::{AccelError, Accelerator};

/// Register indices of the four-target scatter design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ScatterRegisters {
    Vaddr1 = 0,
    Vaddr2 = 1,
    Vaddr3 = 2,
    Vaddr4 = 3,
    VaddrValid = 4,
}

/// Register layout of a scatter design with `width` destinations.
///
/// Address register `k` sits at index `k`; the valid register directly
/// follows the last address register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterRegs {
    width: u32,
}

impl ScatterRegs {
    pub fn new(width: u32) -> Self {
        Self { width }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Index of the address register of destination `k`.
    #[inline]
    pub fn vaddr(&self, k: u32) -> u32 {
        debug_assert!(k < self.width);
        k
    }

    /// Index of the valid register.
    #[inline]
    pub fn valid(&self) -> u32 {
        self.width
    }

    /// Number of registers in the layout.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.width as usize + 1
    }

    /// Write the destination addresses, then raise the valid flag.
    pub fn program<A: Accelerator + ?Sized>(
        &self,
        accel: &A,
        addrs: &[u64],
    ) -> Result<(), AccelError> {
        assert_eq!(
            addrs.len(),
            self.width as usize,
            "one address per scatter destination"
        );
        for (k, &addr) in addrs.iter().enumerate() {
            accel.set_csr(addr, self.vaddr(k as u32))?;
        }
        accel.set_csr(u64::from(true), self.valid())?;
        log::info!(
            "scatterbench: programmed {} scatter addresses, valid at register {}",
            self.width,
            self.valid()
        );
        Ok(())
    }
}

impl Default for ScatterRegs {
    fn default() -> Self {
        Self::new(ScatterRegisters::VaddrValid as u32)
    }
}
