use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the page sizes the paging hardware can map.
///
/// Sealed: only [`Size4K`], [`Size2M`] and [`Size1G`] implement it.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display
{
    /// Page size in bytes (power of two).
    const SIZE: u64;

    /// `log2(SIZE)`, i.e. the number of offset bits inside a page.
    const SHIFT: u32;

    /// Mask selecting the in-page offset bits.
    const OFFSET_MASK: u64 = Self::SIZE - 1;

    /// Short human-readable name used in diagnostics.
    const NAME: &'static str;
}

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $shift:expr, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const NAME: &'static str = $label;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::NAME)
            }
        }
    };
}

page_size!(
    /// 4 KiB page, the allocation granularity of the frame allocator.
    Size4K, 12, "4K"
);
page_size!(
    /// 2 MiB page, mapped by a page-directory entry with `PS=1`.
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB page, mapped by a PDPT entry with `PS=1`.
    Size1G, 30, "1G"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_and_shifts_agree() {
        assert_eq!(Size4K::SIZE, 4096);
        assert_eq!(Size2M::SIZE, 2 * 1024 * 1024);
        assert_eq!(Size1G::SIZE, 1024 * 1024 * 1024);
        assert_eq!(Size4K::OFFSET_MASK, 0xFFF);
        assert_eq!(format!("{Size2M}"), "2M");
    }
}
