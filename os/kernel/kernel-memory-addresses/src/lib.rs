//! # Physical and Virtual Address Types
//!
//! Zero-cost newtypes that keep physical and virtual addresses apart at
//! compile time, plus page types parameterised by page size.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] | A byte address translated by the page tables. |
//! | [`PhysicalPage<S>`] | Page-aligned physical base of size `S`. |
//! | [`VirtualPage<S>`] | Page-aligned virtual base of size `S`. |
//! | [`PhysicalFrame`] | A 4 KiB physical page, the frame allocator's unit. |
//!
//! ## Page Sizes
//!
//! The three x86-64 page sizes are marker types implementing [`PageSize`]:
//! [`Size4K`], [`Size2M`] and [`Size1G`].
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0040_1234);
//! let frame: PhysicalFrame = pa.page();
//! assert_eq!(frame.index(), 0x401);
//! assert_eq!(frame.join(pa.offset::<Size4K>()), pa);
//!
//! assert_eq!(align_up(0x1001, PAGE_SIZE), 0x2000);
//! assert_eq!(align_down(0x1fff, PAGE_SIZE), 0x1000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// A 4 KiB physical frame.
pub type PhysicalFrame = PhysicalPage<Size4K>;

/// Size of one frame in bytes.
pub const PAGE_SIZE: u64 = Size4K::SIZE;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), 0);
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(0x12345, 16), 0x12350);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}

/// Number of whole frames needed to hold `bytes`.
///
/// ```rust
/// # use kernel_memory_addresses::frames_for;
/// assert_eq!(frames_for(0), 0);
/// assert_eq!(frames_for(1), 1);
/// assert_eq!(frames_for(4096), 1);
/// assert_eq!(frames_for(4097), 2);
/// ```
#[inline]
#[must_use]
pub const fn frames_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let pa = PhysicalAddress::new(0x0000_0001_0000_0ABC);
        let frame: PhysicalFrame = pa.page();
        assert_eq!(frame.base().as_u64(), 0x0000_0001_0000_0000);
        assert_eq!(frame.index(), pa.frame_index());
        assert_eq!(PhysicalFrame::from_index(frame.index()), frame);
        assert_eq!(frame.join(0xABC), pa);
    }

    #[test]
    fn huge_page_offsets() {
        let va = VirtualAddress::new(0xFFFF_8000_4012_3456);
        assert_eq!(va.offset::<Size2M>(), 0x12_3456);
        assert_eq!(va.offset::<Size1G>(), 0x12_3456);
        assert_eq!(va.page::<Size1G>().base().as_u64(), 0xFFFF_8000_4000_0000);
    }

    #[test]
    fn canonical_sign_extension() {
        assert_eq!(
            VirtualAddress::new_canonical(0x0000_8000_0000_0000).as_u64(),
            0xFFFF_8000_0000_0000
        );
        assert_eq!(
            VirtualAddress::new_canonical(0x0000_7FFF_FFFF_F000).as_u64(),
            0x0000_7FFF_FFFF_F000
        );
    }

    #[test]
    fn unaligned_pages_are_rejected() {
        assert!(PhysicalFrame::from_aligned(PhysicalAddress::new(0x1001)).is_none());
        assert!(VirtualPage::<Size4K>::from_aligned(VirtualAddress::new(0x2000)).is_some());
    }
}
