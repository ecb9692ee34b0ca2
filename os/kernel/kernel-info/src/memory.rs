//! # Memory Layout

/// Default Higher Half Direct Map (HHDM) base.
///
/// Physical address `pa` is reachable at `HHDM_BASE + pa`. The bootloader may
/// report a different offset at runtime; the memory manager always uses the
/// reported value and falls back to this one only when none was given.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// First byte of the kernel page-allocation window used by `alloc_pages`.
pub const KERNEL_HEAP_BASE: u64 = 0xffff_ffff_c000_0000;

/// End (exclusive) of the kernel page-allocation window.
pub const KERNEL_HEAP_LIMIT: u64 = 0xffff_ffff_e000_0000;

/// Number of 4 KiB pages in the kernel page-allocation window.
pub const KERNEL_HEAP_PAGES: u64 = (KERNEL_HEAP_LIMIT - KERNEL_HEAP_BASE) / 4096;

/// Start of the identity-mapped low-memory window.
pub const LOW_IDENTITY_START: u64 = 0x0010_0000; // 1 MiB

/// End (exclusive) of the identity-mapped low-memory window.
pub const LOW_IDENTITY_END: u64 = 0x0400_0000; // 64 MiB

/// PML4 slot that maps the PML4 onto itself.
pub const RECURSIVE_SLOT: usize = 510;

/// End (exclusive) of the DMA zone: ISA DMA engines address 24 bits.
pub const ZONE_DMA_END: u64 = 0x0100_0000; // 16 MiB

/// End (exclusive) of the DMA32 zone: 32-bit DMA engines.
pub const ZONE_DMA32_END: u64 = 0x1_0000_0000; // 4 GiB

const _: () = {
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(KERNEL_HEAP_BASE > KERNEL_BASE);
    assert!(KERNEL_HEAP_LIMIT > KERNEL_HEAP_BASE);
    assert!(KERNEL_HEAP_BASE.is_multiple_of(4096));
    assert!(KERNEL_HEAP_LIMIT.is_multiple_of(4096));
    assert!(LOW_IDENTITY_START.is_multiple_of(4096));
    assert!(LOW_IDENTITY_END.is_multiple_of(4096));
    assert!(LOW_IDENTITY_END > LOW_IDENTITY_START);
    assert!(RECURSIVE_SLOT < 512 && RECURSIVE_SLOT >= 256);
    assert!(ZONE_DMA32_END > ZONE_DMA_END);
};
