use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame};

/// CR3, the Page-Map Level-4 Base Register (PCID disabled).
///
/// Holds the physical base of the PML4 plus the cache-control bits used for
/// the PML4 walk itself.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2: reserved.
    #[bits(3)]
    __reserved0: u8,

    /// Bit 3: page-level write-through for the PML4.
    pub pwt: bool,

    /// Bit 4: page-level cache disable for the PML4.
    pub pcd: bool,

    /// Bits 5–11: reserved.
    #[bits(7)]
    __reserved1: u8,

    /// Bits 12–51: PML4 physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52–63: reserved.
    #[bits(12)]
    __reserved2: u16,
}

impl Cr3 {
    /// Encode a root-table address.
    ///
    /// # Panics
    /// An unaligned root cannot be expressed in CR3 and loading it would
    /// silently point the MMU at the wrong table. This is a fatal condition.
    #[must_use]
    pub fn from_pml4_phys(pml4_phys: PhysicalAddress) -> Self {
        assert!(
            pml4_phys.is_aligned::<kernel_memory_addresses::Size4K>(),
            "root page table {pml4_phys} is not 4 KiB aligned"
        );
        assert_eq!(
            pml4_phys.as_u64() >> 52,
            0,
            "root page table {pml4_phys} exceeds the physical address width"
        );
        Self::new().with_pml4_base_4k(pml4_phys.as_u64() >> 12)
    }

    /// Encode a root-table frame.
    #[must_use]
    pub fn from_frame(root: PhysicalFrame) -> Self {
        Self::from_pml4_phys(root.base())
    }

    #[must_use]
    pub const fn pml4_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.pml4_base_4k() << 12)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_aligned_root() {
        let cr3 = Cr3::from_pml4_phys(PhysicalAddress::new(0x0012_3000));
        assert_eq!(cr3.into_bits(), 0x0012_3000);
        assert_eq!(cr3.pml4_phys().as_u64(), 0x0012_3000);
    }

    #[test]
    #[should_panic(expected = "not 4 KiB aligned")]
    fn rejects_unaligned_root() {
        let _ = Cr3::from_pml4_phys(PhysicalAddress::new(0x0012_3008));
    }
}
