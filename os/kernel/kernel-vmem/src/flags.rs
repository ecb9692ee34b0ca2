bitflags::bitflags! {
    /// Page-table entry flags in their architectural bit positions.
    ///
    /// External code that constructs mappings (program loader, drivers
    /// asking for uncached buffers) depends on these exact positions. The
    /// physical address bits (12..=51) are deliberately not part of this set.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct PageFlags: u64 {
        /// Page is present. Clear means any access faults.
        const PRESENT = 1 << 0;

        /// Page is writable. Clear means read-only (also for CPL0 if CR0.WP=1).
        const WRITABLE = 1 << 1;

        /// Page is accessible from user mode (CPL=3).
        const USER = 1 << 2;

        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;

        /// Caching disabled; used for MMIO and DMA descriptor memory.
        const CACHE_DISABLE = 1 << 4;

        /// Set by the CPU on first access.
        const ACCESSED = 1 << 5;

        /// Set by the CPU on first write (leaf entries only).
        const DIRTY = 1 << 6;

        /// Entry maps a 2 MiB (PD) or 1 GiB (PDPT) page instead of a table.
        const HUGE_PAGE = 1 << 7;

        /// TLB entry survives CR3 reloads when CR4.PGE is set.
        const GLOBAL = 1 << 8;

        /// Instruction fetches fault (requires EFER.NXE).
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    /// Kernel read/write data.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);

    /// User read/write data.
    pub const USER_RW: Self = Self::KERNEL_RW.union(Self::USER);

    /// Flags installed on intermediate (non-leaf) entries.
    ///
    /// Effective permissions are the intersection along the walk, so
    /// intermediate levels are permissive and the leaf decides.
    #[must_use]
    pub const fn intermediate(user: bool) -> Self {
        if user { Self::USER_RW } else { Self::KERNEL_RW }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions_match_the_hardware_layout() {
        assert_eq!(PageFlags::PRESENT.bits(), 0x1);
        assert_eq!(PageFlags::WRITABLE.bits(), 0x2);
        assert_eq!(PageFlags::USER.bits(), 0x4);
        assert_eq!(PageFlags::WRITE_THROUGH.bits(), 0x8);
        assert_eq!(PageFlags::CACHE_DISABLE.bits(), 0x10);
        assert_eq!(PageFlags::ACCESSED.bits(), 0x20);
        assert_eq!(PageFlags::DIRTY.bits(), 0x40);
        assert_eq!(PageFlags::HUGE_PAGE.bits(), 0x80);
        assert_eq!(PageFlags::GLOBAL.bits(), 0x100);
        assert_eq!(PageFlags::NO_EXECUTE.bits(), 1 << 63);
    }

    #[test]
    fn address_bits_are_not_flags() {
        let raw = 0x0000_0012_3456_7000 | PageFlags::KERNEL_RW.bits();
        assert_eq!(PageFlags::from_bits_truncate(raw), PageFlags::KERNEL_RW);
    }
}
