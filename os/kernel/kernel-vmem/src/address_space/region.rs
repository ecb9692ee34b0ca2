//! Virtual memory regions: what a task has declared, independent of what is
//! currently present in its page tables.

use crate::address_space::AddressSpace;
use crate::{FrameAlloc, PageFlags, PhysMapper};
use core::fmt;
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};
use log::{debug, error};

bitflags::bitflags! {
    /// Access rights of a region.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags::bitflags! {
    /// How a region was requested.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct MapFlags: u32 {
        /// Changes are visible to every space mapping the same object.
        const SHARED = 0x01;
        /// Changes stay private to this space.
        const PRIVATE = 0x02;
        /// Place the region exactly at the requested address.
        const FIXED = 0x10;
        /// Not backed by a file; pages start zeroed.
        const ANONYMOUS = 0x20;
    }
}

/// The file window behind a file-backed region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FileBacking {
    /// Opaque handle of the backing file object.
    pub handle: u64,
    /// First byte of the window; must be page aligned.
    pub offset_lo: u64,
    /// End of the window.
    pub offset_hi: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    Anonymous,
    File(FileBacking),
    /// Device memory; the frames belong to the device, never to the allocator.
    Device,
}

impl RegionKind {
    /// Whether frames mapped in such a region are returned when it goes away.
    #[must_use]
    pub const fn owns_frames(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

/// A half-open `[start, end)` range of virtual pages with uniform rights.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub protection: Protection,
    pub flags: MapFlags,
    pub kind: RegionKind,
}

impl MemoryRegion {
    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.start <= va && va < self.end
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.start < end && start < self.end
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_private(&self) -> bool {
        self.flags.contains(MapFlags::PRIVATE)
    }

    /// Leaf flags matching the region's rights for a user mapping.
    #[must_use]
    pub fn page_flags(&self) -> PageFlags {
        let mut flags = PageFlags::PRESENT | PageFlags::USER;
        flags.set(PageFlags::WRITABLE, self.protection.contains(Protection::WRITE));
        flags.set(PageFlags::NO_EXECUTE, !self.protection.contains(Protection::EXEC));
        flags
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = |bit, c| if self.protection.contains(bit) { c } else { '-' };
        let kind = match self.kind {
            RegionKind::Anonymous => "anon",
            RegionKind::File(_) => "file",
            RegionKind::Device => "device",
        };
        write!(
            f,
            "[{}..{}) {}{}{} {kind} {}",
            self.start,
            self.end,
            p(Protection::READ, 'r'),
            p(Protection::WRITE, 'w'),
            p(Protection::EXEC, 'x'),
            if self.is_private() { "private" } else { "shared" },
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("region [{start}..{end}) is not page aligned")]
    Unaligned {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("region [{start}..{end}) is empty")]
    EmptyRange {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("exactly one of PRIVATE and SHARED is required")]
    SharingMode,
    #[error("file-backed region without a backing file")]
    MissingBacking,
    #[error("file window {0:#x}..{1:#x} is invalid")]
    InvalidBacking(u64, u64),
    #[error("region [{start}..{end}) overlaps an existing region")]
    Overlap {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("no region starts at {0}")]
    NotFound(VirtualAddress),
}

/// Outcome of a failed [`AddressSpace::check_access`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// No region covers the address; the access is a fault.
    #[error("no region covers {0}")]
    NoRegion(VirtualAddress),
    /// A region covers the address but lacks a requested right.
    #[error("{missing:?} access denied at {address}")]
    Denied {
        address: VirtualAddress,
        missing: Protection,
    },
}

impl AddressSpace {
    /// Declare a new region. Only metadata is recorded; nothing is mapped.
    ///
    /// Anonymous regions ignore `file`; every other region needs one.
    ///
    /// # Errors
    /// See [`RegionError`].
    pub fn map_region(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
        protection: Protection,
        flags: MapFlags,
        file: Option<FileBacking>,
    ) -> Result<(), RegionError> {
        debug!("Mapping region {start}..{end}, {protection:?}, {flags:?}");

        if !start.is_aligned::<Size4K>() || !end.is_aligned::<Size4K>() {
            return Err(RegionError::Unaligned { start, end });
        }
        if start >= end {
            return Err(RegionError::EmptyRange { start, end });
        }
        if flags.contains(MapFlags::PRIVATE) == flags.contains(MapFlags::SHARED) {
            return Err(RegionError::SharingMode);
        }

        let kind = if flags.contains(MapFlags::ANONYMOUS) {
            RegionKind::Anonymous
        } else {
            let file = file.ok_or(RegionError::MissingBacking)?;
            if !file.offset_lo.is_multiple_of(Size4K::SIZE) || file.offset_hi < file.offset_lo {
                return Err(RegionError::InvalidBacking(file.offset_lo, file.offset_hi));
            }
            RegionKind::File(file)
        };

        self.add_region(MemoryRegion {
            start,
            end,
            protection,
            flags,
            kind,
        })
    }

    /// Insert an already-built region.
    ///
    /// # Errors
    /// [`RegionError::EmptyRange`] or [`RegionError::Overlap`].
    pub fn add_region(&mut self, region: MemoryRegion) -> Result<(), RegionError> {
        let MemoryRegion { start, end, .. } = region;
        if start >= end {
            return Err(RegionError::EmptyRange { start, end });
        }
        if self.regions.iter().any(|r| r.overlaps(start, end)) {
            return Err(RegionError::Overlap { start, end });
        }
        self.regions.push(region);
        Ok(())
    }

    /// Drop the region starting at `start` without touching the page tables.
    ///
    /// # Errors
    /// [`RegionError::NotFound`] if no region starts there.
    pub fn remove_region(&mut self, start: VirtualAddress) -> Result<MemoryRegion, RegionError> {
        let pos = self
            .regions
            .iter()
            .position(|r| r.start == start)
            .ok_or(RegionError::NotFound(start))?;
        Ok(self.regions.swap_remove(pos))
    }

    /// The region covering `va`, if any.
    #[must_use]
    pub fn region_containing(&self, va: VirtualAddress) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(va))
    }

    #[inline]
    #[must_use]
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Check that the region covering `va` grants every right in `needed`.
    ///
    /// Exec is checked first, then write, then read, so the reported
    /// `missing` right is the first one in that order.
    ///
    /// # Errors
    /// [`AccessError::NoRegion`] or [`AccessError::Denied`].
    pub fn check_access(
        &self,
        va: VirtualAddress,
        needed: Protection,
    ) -> Result<&MemoryRegion, AccessError> {
        let Some(region) = self.region_containing(va) else {
            error!("No region covers {va}");
            return Err(AccessError::NoRegion(va));
        };
        debug!("Access check at {va} in {region}");

        for right in [Protection::EXEC, Protection::WRITE, Protection::READ] {
            if needed.contains(right) && !region.protection.contains(right) {
                error!("{right:?} access denied at {va} in {region}");
                return Err(AccessError::Denied {
                    address: va,
                    missing: right,
                });
            }
        }
        Ok(region)
    }

    /// Remove the region starting at `start` and unmap its pages.
    ///
    /// Frames are returned to `frames` only for anonymous regions.
    ///
    /// # Errors
    /// [`RegionError::NotFound`] if no region starts there.
    pub fn unmap_region<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        &mut self,
        mapper: &M,
        frames: &mut A,
        start: VirtualAddress,
    ) -> Result<MemoryRegion, RegionError> {
        let region = self.remove_region(start)?;
        let pages = self.unmap_range(mapper, frames, region.start, region.end, region.kind.owns_frames());
        debug!("Unmapped region {region} ({pages} pages present)");
        Ok(region)
    }

    /// Copy every region of `src` into this space.
    ///
    /// Only metadata is copied. Nothing is copied when any region would
    /// overlap one already present here.
    ///
    /// # Errors
    /// [`RegionError::Overlap`] naming the first conflicting region.
    pub fn duplicate_regions_from(&mut self, src: &Self) -> Result<usize, RegionError> {
        if let Some(clash) = src
            .regions
            .iter()
            .find(|r| self.regions.iter().any(|own| own.overlaps(r.start, r.end)))
        {
            return Err(RegionError::Overlap {
                start: clash.start,
                end: clash.end,
            });
        }
        self.regions.extend_from_slice(&src.regions);
        debug!("Duplicated {} regions", src.regions.len());
        Ok(src.regions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BumpAlloc, TestPhys};
    use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalFrame};

    const BASE: u64 = 0x40_0000;

    fn va(x: u64) -> VirtualAddress {
        VirtualAddress::new(x)
    }

    fn anon(space: &mut AddressSpace, start: u64, pages: u64, prot: Protection) {
        space
            .map_region(
                va(start),
                va(start + pages * PAGE_SIZE),
                prot,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                None,
            )
            .unwrap();
    }

    fn empty_space() -> AddressSpace {
        AddressSpace::from_root(PhysicalFrame::from_index(1))
    }

    #[test]
    fn map_region_validates_its_arguments() {
        let mut s = empty_space();
        let rw = Protection::READ | Protection::WRITE;
        let anon = MapFlags::PRIVATE | MapFlags::ANONYMOUS;

        assert!(matches!(
            s.map_region(va(BASE + 1), va(BASE + PAGE_SIZE), rw, anon, None),
            Err(RegionError::Unaligned { .. })
        ));
        assert!(matches!(
            s.map_region(va(BASE), va(BASE), rw, anon, None),
            Err(RegionError::EmptyRange { .. })
        ));
        assert_eq!(
            s.map_region(va(BASE), va(BASE + PAGE_SIZE), rw, MapFlags::ANONYMOUS, None),
            Err(RegionError::SharingMode)
        );
        assert_eq!(
            s.map_region(
                va(BASE),
                va(BASE + PAGE_SIZE),
                rw,
                MapFlags::SHARED | MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                None
            ),
            Err(RegionError::SharingMode)
        );
        assert_eq!(
            s.map_region(va(BASE), va(BASE + PAGE_SIZE), rw, MapFlags::SHARED, None),
            Err(RegionError::MissingBacking)
        );
        let bad = FileBacking {
            handle: 3,
            offset_lo: 0x10,
            offset_hi: 0x2000,
        };
        assert_eq!(
            s.map_region(va(BASE), va(BASE + PAGE_SIZE), rw, MapFlags::SHARED, Some(bad)),
            Err(RegionError::InvalidBacking(0x10, 0x2000))
        );
        assert!(s.regions().is_empty());
    }

    #[test]
    fn file_backed_region_records_its_window() {
        let mut s = empty_space();
        let file = FileBacking {
            handle: 9,
            offset_lo: 0x1000,
            offset_hi: 0x3000,
        };
        s.map_region(
            va(BASE),
            va(BASE + 2 * PAGE_SIZE),
            Protection::READ | Protection::EXEC,
            MapFlags::PRIVATE,
            Some(file),
        )
        .unwrap();
        let r = s.region_containing(va(BASE + 0x1800)).unwrap();
        assert_eq!(r.kind, RegionKind::File(file));
        assert!(r.is_private());
        assert_eq!(r.size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let mut s = empty_space();
        anon(&mut s, BASE, 4, Protection::READ);
        let res = s.map_region(
            va(BASE + 3 * PAGE_SIZE),
            va(BASE + 5 * PAGE_SIZE),
            Protection::READ,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
        );
        assert!(matches!(res, Err(RegionError::Overlap { .. })));

        // Adjacent is fine.
        anon(&mut s, BASE + 4 * PAGE_SIZE, 1, Protection::READ);
        assert_eq!(s.regions().len(), 2);
    }

    #[test]
    fn region_lookup_is_half_open() {
        let mut s = empty_space();
        anon(&mut s, BASE, 1, Protection::READ);
        assert!(s.region_containing(va(BASE)).is_some());
        assert!(s.region_containing(va(BASE + PAGE_SIZE - 1)).is_some());
        assert!(s.region_containing(va(BASE + PAGE_SIZE)).is_none());
        assert!(s.region_containing(va(BASE - 1)).is_none());
    }

    #[test]
    fn check_access_reports_fault_and_denial() {
        let mut s = empty_space();
        anon(&mut s, BASE, 1, Protection::READ);

        assert_eq!(
            s.check_access(va(0x1000), Protection::READ),
            Err(AccessError::NoRegion(va(0x1000)))
        );
        assert!(s.check_access(va(BASE + 8), Protection::READ).is_ok());
        assert_eq!(
            s.check_access(va(BASE), Protection::READ | Protection::WRITE | Protection::EXEC),
            Err(AccessError::Denied {
                address: va(BASE),
                missing: Protection::EXEC
            })
        );
        assert_eq!(
            s.check_access(va(BASE), Protection::READ | Protection::WRITE),
            Err(AccessError::Denied {
                address: va(BASE),
                missing: Protection::WRITE
            })
        );
    }

    #[test]
    fn remove_region_needs_an_exact_start() {
        let mut s = empty_space();
        anon(&mut s, BASE, 2, Protection::READ);
        assert_eq!(
            s.remove_region(va(BASE + PAGE_SIZE)),
            Err(RegionError::NotFound(va(BASE + PAGE_SIZE)))
        );
        assert_eq!(s.remove_region(va(BASE)).unwrap().start, va(BASE));
        assert!(s.regions().is_empty());
    }

    #[test]
    fn duplicate_is_all_or_nothing() {
        let mut src = empty_space();
        anon(&mut src, BASE, 1, Protection::READ);
        anon(&mut src, BASE + 0x10_0000, 1, Protection::READ | Protection::WRITE);

        let mut dest = empty_space();
        assert_eq!(dest.duplicate_regions_from(&src), Ok(2));
        assert_eq!(dest.regions(), src.regions());

        let mut busy = empty_space();
        anon(&mut busy, BASE + 0x10_0000, 1, Protection::READ);
        assert!(matches!(
            busy.duplicate_regions_from(&src),
            Err(RegionError::Overlap { .. })
        ));
        assert_eq!(busy.regions().len(), 1);
    }

    #[test]
    fn page_flags_follow_protection() {
        let mut s = empty_space();
        anon(&mut s, BASE, 1, Protection::READ | Protection::WRITE);
        let flags = s.regions()[0].page_flags();
        assert!(flags.contains(PageFlags::USER | PageFlags::WRITABLE | PageFlags::NO_EXECUTE));
    }

    #[test]
    fn unmap_region_frees_anonymous_frames_only() {
        let phys = TestPhys::with_frames(64);
        let mut alloc = BumpAlloc::new(1, 32);
        let mut s = AddressSpace::new(&phys, &mut alloc).unwrap();

        anon(&mut s, BASE, 2, Protection::READ | Protection::WRITE);
        s.add_region(MemoryRegion {
            start: va(BASE + 0x10_0000),
            end: va(BASE + 0x10_0000 + PAGE_SIZE),
            protection: Protection::READ | Protection::WRITE,
            flags: MapFlags::SHARED,
            kind: RegionKind::Device,
        })
        .unwrap();

        let flags = PageFlags::USER_RW;
        s.map(&phys, &mut alloc, va(BASE), PhysicalAddress::new(50 << 12), flags)
            .unwrap();
        s.map(&phys, &mut alloc, va(BASE + PAGE_SIZE), PhysicalAddress::new(51 << 12), flags)
            .unwrap();
        s.map(&phys, &mut alloc, va(BASE + 0x10_0000), PhysicalAddress::new(52 << 12), flags)
            .unwrap();

        s.unmap_region(&phys, &mut alloc, va(BASE)).unwrap();
        assert_eq!(
            alloc.freed,
            [PhysicalFrame::from_index(50), PhysicalFrame::from_index(51)]
        );
        assert_eq!(s.translate(&phys, va(BASE)), None);

        s.unmap_region(&phys, &mut alloc, va(BASE + 0x10_0000)).unwrap();
        assert_eq!(alloc.freed.len(), 2);
        assert!(s.regions().is_empty());
    }
}
