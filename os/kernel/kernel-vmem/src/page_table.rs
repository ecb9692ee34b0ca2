//! # Page-Table Entries and Tables
//!
//! All four levels share one entry layout, so a single [`PageTableEntry`]
//! bitfield and a single 512-entry [`PageTable`] model PML4, PDPT, PD and PT.
//! The level an entry lives at is tracked by the walker, not by the type.
//!
//! ## Invariants & Notes
//!
//! - [`PageTable`] is 4 KiB-aligned and contains exactly 512 entries.
//! - A present non-leaf entry always points to a zeroed-on-creation table.
//! - Tables are only ever reached through a [`PhysMapper`](crate::PhysMapper);
//!   no table is aliased as a long-lived Rust reference.

use crate::PageFlags;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};

/// Number of entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// A single page-table entry (PML4E, PDPTE, PDE or PTE).
#[doc(alias = "PTE")]
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disable: bool,

    /// Accessed (A, bit 5).
    pub accessed: bool,

    /// Dirty (D, bit 6), leaf only.
    pub dirty: bool,

    /// Page Size (PS, bit 7): a 2 MiB or 1 GiB leaf at PD or PDPT level.
    pub huge_page: bool,

    /// Global (G, bit 8), leaf only.
    pub global: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12].
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection key (bits 59..=62).
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageTableEntry {
    /// A non-present entry.
    #[inline]
    #[must_use]
    pub const fn absent() -> Self {
        Self::new()
    }

    /// A leaf mapping `frame` with `flags`. `PRESENT` is always set.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalFrame, flags: PageFlags) -> Self {
        let flags = flags.union(PageFlags::PRESENT);
        Self::from_bits(flags.bits() | frame.base().as_u64())
    }

    /// A link to the next-level table stored in `table`.
    #[inline]
    #[must_use]
    pub const fn table(table: PhysicalFrame, user: bool) -> Self {
        Self::leaf(table, PageFlags::intermediate(user))
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.present()
    }

    /// Physical address stored in the entry (table or page base).
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// The referenced frame, if the entry is present.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> Option<PhysicalFrame> {
        if self.present() {
            Some(PhysicalFrame::containing(self.address()))
        } else {
            None
        }
    }

    /// The flag bits without the address.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.into_bits())
    }
}

impl fmt::Display for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.present() {
            write!(f, "{} {:?}", self.address(), self.flags())
        } else {
            f.write_str("<absent>")
        }
    }
}

/// One 4 KiB table of 512 entries, valid at every level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::absent(); ENTRIES_PER_TABLE],
        }
    }

    /// Mark every entry non-present.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::absent());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PageTableEntry {
        self.entries[i.as_usize()]
    }

    /// Caller handles any TLB invalidation for active mappings.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PageTableEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Present entries with their index.
    pub fn present_entries(&self) -> impl Iterator<Item = (TableIndex, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_present())
            .map(|(i, e)| (TableIndex::from_usize(i), *e))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }
}

/// Index into a table at any level, always `< 512`.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// # Panics
    /// Panics if `i >= 512`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_usize(i: usize) -> Self {
        assert!(i < ENTRIES_PER_TABLE, "table index out of range");
        Self(i as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    const fn at_shift(va: VirtualAddress, shift: u32) -> Self {
        Self(((va.as_u64() >> shift) & 0x1FF) as u16)
    }
}

/// Paging level, top to bottom.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    /// Number of address bits below this level's index.
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// The level below, or `None` at the page-table level.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        })
    }
}

/// The four table indices selected by a virtual address.
///
/// ```text
/// | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
/// |  PML4 |  PDPT |   PD  |   PT  | Offset |
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TableIndices {
    pub pml4: TableIndex,
    pub pdpt: TableIndex,
    pub pd: TableIndex,
    pub pt: TableIndex,
}

impl TableIndices {
    #[must_use]
    pub const fn at(&self, level: Level) -> TableIndex {
        match level {
            Level::Pml4 => self.pml4,
            Level::Pdpt => self.pdpt,
            Level::Pd => self.pd,
            Level::Pt => self.pt,
        }
    }

    /// Rebuild the (canonical) virtual address of the page these indices select.
    #[must_use]
    pub const fn to_address(&self) -> VirtualAddress {
        let raw = ((self.pml4.0 as u64) << 39)
            | ((self.pdpt.0 as u64) << 30)
            | ((self.pd.0 as u64) << 21)
            | ((self.pt.0 as u64) << 12);
        VirtualAddress::new_canonical(raw)
    }
}

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> TableIndices {
    TableIndices {
        pml4: TableIndex::at_shift(va, Level::Pml4.shift()),
        pdpt: TableIndex::at_shift(va, Level::Pdpt.shift()),
        pd: TableIndex::at_shift(va, Level::Pd.shift()),
        pt: TableIndex::at_shift(va, Level::Pt.shift()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_round_trip() {
        let va = VirtualAddress::new(0xFFFF_FFFF_C012_3000);
        let idx = split_indices(va);
        assert_eq!(idx.pml4.as_usize(), 511);
        assert_eq!(idx.pdpt.as_usize(), 511);
        assert_eq!(idx.pd.as_usize(), 0);
        assert_eq!(idx.pt.as_usize(), 0x123);
        assert_eq!(idx.to_address(), va);
    }

    #[test]
    fn leaf_encodes_address_and_forces_present() {
        let frame = PhysicalFrame::from_index(0x5555);
        let e = PageTableEntry::leaf(frame, PageFlags::WRITABLE | PageFlags::NO_EXECUTE);
        assert!(e.present());
        assert!(e.writable());
        assert!(e.no_execute());
        assert!(!e.user());
        assert!(!e.huge_page());
        assert_eq!(e.address().as_u64(), 0x5555_000);
        assert_eq!(e.frame(), Some(frame));
        assert_eq!(
            e.flags(),
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE
        );
    }

    #[test]
    fn table_links_are_permissive() {
        let e = PageTableEntry::table(PhysicalFrame::from_index(7), true);
        assert!(e.present() && e.writable() && e.user());
        assert!(!PageTableEntry::table(PhysicalFrame::from_index(7), false).user());
    }

    #[test]
    fn absent_entries_have_no_frame() {
        assert_eq!(PageTableEntry::absent().frame(), None);
        assert!(PageTable::zeroed().is_empty());
    }
}
