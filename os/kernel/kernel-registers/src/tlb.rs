//! Translation lookaside buffer maintenance.

use kernel_memory_addresses::VirtualAddress;

/// Drop the cached translation of the page containing `va` on this CPU.
#[inline]
#[cfg(all(feature = "asm", target_arch = "x86_64", target_os = "none"))]
pub fn invalidate_page(va: VirtualAddress) {
    // SAFETY: invlpg only discards a cache entry; the kernel runs at CPL0.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Hosted builds have no TLB to maintain.
#[inline]
#[cfg(not(all(feature = "asm", target_arch = "x86_64", target_os = "none")))]
pub const fn invalidate_page(_va: VirtualAddress) {}
