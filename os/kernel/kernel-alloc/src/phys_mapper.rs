//! # HHDM-based PhysMapper for Kernel Virtual Memory
//!
//! This module provides a [`PhysMapper`] implementation for kernels that use a
//! higher-half direct map (HHDM). Every physical address `pa` is reachable at
//! `offset + pa`, where `offset` is handed over by the bootloader at runtime.
//!
//! ## Why is this needed?
//! - Code can only dereference virtual addresses, not physical ones.
//! - Page tables, the frame bitmap and freshly allocated frames live in
//!   physical memory and must be "seen" from the kernel to be edited.
//! - The strategy differs between kernel and host tests, so the rest of the
//!   memory core only talks to the [`PhysMapper`] trait.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_vmem::info::HHDM_BASE;
//!
//! let mapper = HhdmPhysMapper::new(0xffff_8000_0000_0000);
//! assert_eq!(mapper.offset(), 0xffff_8000_0000_0000);
//! assert_eq!(HhdmPhysMapper::default().offset(), HHDM_BASE);
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] implementation for kernels with a higher-half direct map.
///
/// # Safety
/// - The HHDM mapping must be present and cover the referenced physical range.
/// - The returned reference must only be used for valid, mapped and writable memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Kernel virtual alias of `pa`.
    #[inline]
    #[must_use]
    pub const fn to_virtual(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset.wrapping_add(pa.as_u64()))
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::new(HHDM_BASE)
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.to_virtual(pa).as_mut_ptr::<T>();
        // SAFETY: Caller must ensure the physical address is valid and mapped via HHDM.
        unsafe { &mut *va }
    }
}
