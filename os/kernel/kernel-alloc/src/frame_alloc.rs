//! # Zoned Bitmap Frame Allocator
//!
//! One bit per 4 KiB frame from physical address zero up to the end of the
//! highest usable memory map entry. The bitmap is the only source of truth:
//! zone counters change exactly when a bit flips.
//!
//! ## Storage
//!
//! The bitmap lives in physical memory it manages itself. [`BitmapFrameAllocator::init`]
//! places it at the start of the first usable entry large enough to hold it
//! and keeps those frames permanently allocated.
//!
//! ```text
//! storage: [ used bits (1 = allocated) | managed bits (1 = usable RAM) ]
//! ```
//!
//! The second bitmap lets `free_page` reject frames the allocator never
//! handed out (firmware memory, holes, the bitmap itself).

mod zone;

pub use crate::frame_alloc::zone::{Zone, ZoneStats};
use crate::bitmap::Bitmap;
use core::ops::Range;
use kernel_info::boot::MemoryMapEntry;
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, frames_for};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, error, info};

/// Why the frame allocator refused a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmmError {
    #[error("the memory map contains no usable memory")]
    NoUsableMemory,
    #[error("no usable region can hold the {0}-frame allocation bitmap")]
    NoBitmapRegion(u64),
    #[error("zone {0} is exhausted")]
    ZoneExhausted(Zone),
    #[error("every zone is exhausted")]
    OutOfMemory,
    #[error("no run of {count} free frames in zone {zone}")]
    NoContiguousRun { count: usize, zone: Zone },
    #[error("frame count must be non-zero")]
    InvalidCount,
    #[error("frame {0} is not allocated")]
    DoubleFree(PhysicalAddress),
    #[error("frame {0} is not managed by the frame allocator")]
    NotManaged(PhysicalAddress),
}

pub struct BitmapFrameAllocator {
    used: Bitmap,
    managed: Bitmap,
    zones: [ZoneStats; 3],
    storage: Range<u64>,
}

impl BitmapFrameAllocator {
    /// Build the allocator from the boot memory map.
    ///
    /// Every frame starts out allocated; frames lying entirely inside a
    /// usable entry are then released, except those holding the bitmap.
    ///
    /// # Errors
    /// [`PmmError::NoUsableMemory`] or [`PmmError::NoBitmapRegion`]; both are
    /// fatal for the kernel since nothing can allocate yet.
    ///
    /// # Safety
    /// `mapper` must make every usable entry of `map` writable, and the
    /// usable memory must not be in use by anything else.
    pub unsafe fn init<M: PhysMapper + ?Sized>(
        map: &[MemoryMapEntry],
        mapper: &M,
    ) -> Result<Self, PmmError> {
        let usable = || map.iter().filter(|e| e.kind.is_usable());

        let highest = usable().map(MemoryMapEntry::end).max().unwrap_or(0);
        let frames = frames_for(highest);
        if frames == 0 {
            return Err(PmmError::NoUsableMemory);
        }

        let words = Bitmap::words_for(frames);
        let storage_frames = frames_for(2 * words * 8);
        let storage = usable()
            .map(MemoryMapEntry::whole_frames)
            .find(|r| r.end - r.start >= storage_frames)
            .map(|r| r.start..r.start + storage_frames)
            .ok_or(PmmError::NoBitmapRegion(storage_frames))?;

        let base = PhysicalFrame::from_index(storage.start).base();
        let all: &'static mut [u64] = unsafe {
            let first: &mut u64 = mapper.phys_to_mut(base);
            core::slice::from_raw_parts_mut(core::ptr::from_mut(first), 2 * words as usize)
        };
        let (used_words, managed_words) = all.split_at_mut(words as usize);

        let mut this = Self {
            used: Bitmap::new(used_words, frames, true),
            managed: Bitmap::new(managed_words, frames, false),
            zones: [ZoneStats::default(); 3],
            storage,
        };

        for i in usable().flat_map(MemoryMapEntry::whole_frames) {
            if this.managed.is_set(i) {
                continue;
            }
            this.managed.set(i);
            let zone = &mut this.zones[Zone::of_frame(i).index()];
            zone.total += 1;
            if !this.storage.contains(&i) {
                this.used.clear(i);
                zone.free += 1;
            }
        }

        info!(
            "Frame allocator tracks {frames} frames, bitmap at {base} ({storage_frames} frames), {} free",
            this.free_page_count()
        );
        Ok(this)
    }

    /// Allocate one frame from `zone`.
    ///
    /// # Errors
    /// [`PmmError::ZoneExhausted`] when the zone has no free frame left.
    pub fn alloc_page(&mut self, zone: Zone) -> Result<PhysicalFrame, PmmError> {
        let i = self
            .used
            .find_clear(zone.frames())
            .ok_or(PmmError::ZoneExhausted(zone))?;
        self.take(i);
        let frame = PhysicalFrame::from_index(i);
        debug!("Allocated frame {frame} from {zone}");
        Ok(frame)
    }

    /// Allocate one frame from any zone, highest zone first.
    ///
    /// # Errors
    /// [`PmmError::OutOfMemory`] when every zone is exhausted.
    pub fn alloc_page_any(&mut self) -> Result<PhysicalFrame, PmmError> {
        Zone::FALLBACK
            .into_iter()
            .find_map(|zone| self.alloc_page(zone).ok())
            .ok_or(PmmError::OutOfMemory)
    }

    /// Return one frame.
    ///
    /// # Errors
    /// [`PmmError::DoubleFree`] if the frame is already free and
    /// [`PmmError::NotManaged`] if it was never the allocator's to give out.
    /// Nothing changes in either case.
    pub fn free_page(&mut self, frame: PhysicalFrame) -> Result<(), PmmError> {
        self.check_allocated(frame.index())?;
        self.give_back(frame.index());
        debug!("Freed frame {frame}");
        Ok(())
    }

    /// Allocate `count` physically consecutive frames inside `zone`.
    ///
    /// # Errors
    /// [`PmmError::InvalidCount`] for zero, [`PmmError::NoContiguousRun`] if
    /// no run that long exists. Nothing is allocated on failure.
    pub fn alloc_contiguous(&mut self, count: usize, zone: Zone) -> Result<PhysicalFrame, PmmError> {
        if count == 0 {
            return Err(PmmError::InvalidCount);
        }
        let first = self
            .used
            .find_clear_run(zone.frames(), count as u64)
            .ok_or(PmmError::NoContiguousRun { count, zone })?;
        for i in first..first + count as u64 {
            self.take(i);
        }
        let frame = PhysicalFrame::from_index(first);
        debug!("Allocated {count} contiguous frames at {frame} from {zone}");
        Ok(frame)
    }

    /// Like [`alloc_contiguous`](Self::alloc_contiguous), trying zones highest first.
    ///
    /// # Errors
    /// [`PmmError::InvalidCount`], or [`PmmError::NoContiguousRun`] for the
    /// last zone tried.
    pub fn alloc_contiguous_any(&mut self, count: usize) -> Result<PhysicalFrame, PmmError> {
        let mut last = PmmError::InvalidCount;
        for zone in Zone::FALLBACK {
            match self.alloc_contiguous(count, zone) {
                Ok(frame) => return Ok(frame),
                Err(PmmError::InvalidCount) => return Err(PmmError::InvalidCount),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Return `count` frames starting at `first`.
    ///
    /// All or nothing: if any frame of the run is not currently allocated,
    /// no frame is freed.
    ///
    /// # Errors
    /// [`PmmError::InvalidCount`] for zero or a run past the end of the
    /// frame space, otherwise [`PmmError::DoubleFree`] or
    /// [`PmmError::NotManaged`] naming the first offending frame.
    pub fn free_contiguous(&mut self, first: PhysicalFrame, count: usize) -> Result<(), PmmError> {
        let end = u64::try_from(count)
            .ok()
            .filter(|&n| n > 0)
            .and_then(|n| first.index().checked_add(n))
            .ok_or(PmmError::InvalidCount)?;
        let run = first.index()..end;
        for i in run.clone() {
            self.check_allocated(i)?;
        }
        for i in run {
            self.give_back(i);
        }
        debug!("Freed {count} contiguous frames at {first}");
        Ok(())
    }

    /// Whether the frame containing `pa` is unavailable for allocation.
    ///
    /// Addresses past the end of the bitmap are reported as used.
    #[must_use]
    pub fn page_is_used(&self, pa: PhysicalAddress) -> bool {
        let i = pa.frame_index();
        i >= self.used.len() || self.used.is_set(i)
    }

    #[must_use]
    pub const fn zone_stats(&self, zone: Zone) -> ZoneStats {
        self.zones[zone.index()]
    }

    #[must_use]
    pub fn free_page_count(&self) -> u64 {
        self.zones.iter().map(|z| z.free).sum()
    }

    #[must_use]
    pub fn total_page_count(&self) -> u64 {
        self.zones.iter().map(|z| z.total).sum()
    }

    /// First frame and length of the bitmap's own storage.
    #[must_use]
    pub const fn bitmap_storage(&self) -> (PhysicalFrame, u64) {
        (
            PhysicalFrame::from_index(self.storage.start),
            self.storage.end - self.storage.start,
        )
    }

    pub fn dump_stats(&self) {
        for zone in Zone::ALL {
            let s = self.zone_stats(zone);
            info!(
                "{zone:>6}: {:>8} total, {:>8} used, {:>8} free",
                s.total,
                s.used(),
                s.free
            );
        }
    }

    fn take(&mut self, i: u64) {
        debug_assert!(!self.used.is_set(i));
        self.used.set(i);
        self.zones[Zone::of_frame(i).index()].free -= 1;
    }

    fn give_back(&mut self, i: u64) {
        debug_assert!(self.used.is_set(i));
        self.used.clear(i);
        self.zones[Zone::of_frame(i).index()].free += 1;
    }

    fn check_allocated(&self, i: u64) -> Result<(), PmmError> {
        let pa = PhysicalFrame::from_index(i).base();
        if i >= self.used.len() || !self.managed.is_set(i) || self.storage.contains(&i) {
            error!("Frame {pa} is not managed by the frame allocator");
            return Err(PmmError::NotManaged(pa));
        }
        if !self.used.is_set(i) {
            error!("Double free of frame {pa}");
            return Err(PmmError::DoubleFree(pa));
        }
        Ok(())
    }
}

impl FrameAlloc for BitmapFrameAllocator {
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        self.alloc_page_any().ok()
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        // Already logged by `check_allocated`.
        let _ = self.free_page(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_ram::TestRam;
    use kernel_info::boot::MemoryKind;
    use kernel_memory_addresses::PAGE_SIZE;

    fn pmm(ram: &TestRam, map: &[MemoryMapEntry]) -> BitmapFrameAllocator {
        unsafe { BitmapFrameAllocator::init(map, ram) }.unwrap()
    }

    #[test]
    fn one_mebibyte_at_zero() {
        let ram = TestRam::new(0x10_0000);
        let a = pmm(&ram, &[MemoryMapEntry::new(0, 0x10_0000, MemoryKind::Usable)]);
        assert_eq!(a.total_page_count(), 256);
        assert_eq!(a.bitmap_storage(), (PhysicalFrame::from_index(0), 1));
        assert_eq!(a.free_page_count(), 255);
        assert!(a.page_is_used(PhysicalAddress::new(0)));
        assert!(!a.page_is_used(PhysicalAddress::new(PAGE_SIZE)));
    }

    #[test]
    fn partial_frames_and_reserved_entries_stay_used() {
        let ram = TestRam::new(0x10_0000);
        let map = [
            MemoryMapEntry::new(0x800, 0x3800, MemoryKind::Usable),
            MemoryMapEntry::new(0x4000, 0x4000, MemoryKind::Reserved),
            MemoryMapEntry::new(0x8000, 0x8000, MemoryKind::Usable),
        ];
        let a = pmm(&ram, &map);
        // Frames 1..4 are whole; frame 1 hosts the bitmap. Frames 8..16 are free.
        assert_eq!(a.total_page_count(), 3 + 8);
        assert_eq!(a.free_page_count(), 2 + 8);
        assert!(a.page_is_used(PhysicalAddress::new(0)));
        assert!(a.page_is_used(PhysicalAddress::new(0x5000)));
    }

    #[test]
    fn empty_map_is_fatal() {
        let ram = TestRam::new(PAGE_SIZE as usize);
        let map = [MemoryMapEntry::new(0, 0x1000, MemoryKind::Reserved)];
        assert_eq!(
            unsafe { BitmapFrameAllocator::init(&map, &ram) }.err(),
            Some(PmmError::NoUsableMemory)
        );
    }

    #[test]
    fn no_room_for_the_bitmap_is_fatal() {
        let ram = TestRam::new(PAGE_SIZE as usize);
        // Only partial frames are usable, so no whole frame can hold the bitmap.
        let map = [MemoryMapEntry::new(0x10, 0x1000, MemoryKind::Usable)];
        assert_eq!(
            unsafe { BitmapFrameAllocator::init(&map, &ram) }.err(),
            Some(PmmError::NoBitmapRegion(1))
        );
    }

    #[test]
    fn freeing_the_bitmap_or_reserved_memory_is_refused() {
        let ram = TestRam::new(0x10_0000);
        let map = [
            MemoryMapEntry::new(0, 0x8000, MemoryKind::Usable),
            MemoryMapEntry::new(0x8000, 0x8000, MemoryKind::AcpiNvs),
        ];
        let mut a = pmm(&ram, &map);
        let free = a.free_page_count();
        assert_eq!(
            a.free_page(PhysicalFrame::from_index(0)),
            Err(PmmError::NotManaged(PhysicalAddress::new(0)))
        );
        assert_eq!(
            a.free_page(PhysicalFrame::from_index(9)),
            Err(PmmError::NotManaged(PhysicalAddress::new(0x9000)))
        );
        assert_eq!(
            a.free_page(PhysicalFrame::from_index(4096)),
            Err(PmmError::NotManaged(PhysicalAddress::new(0x100_0000)))
        );
        assert_eq!(a.free_page_count(), free);
    }

    #[test]
    fn runs_wrapping_the_frame_space_are_refused() {
        let ram = TestRam::new(0x10_0000);
        let mut a = pmm(&ram, &[MemoryMapEntry::new(0, 0x10_0000, MemoryKind::Usable)]);
        let free = a.free_page_count();
        let last = PhysicalFrame::from_index(u64::MAX >> 12);
        assert_eq!(a.free_contiguous(last, usize::MAX), Err(PmmError::InvalidCount));
        assert_eq!(
            a.free_contiguous(PhysicalFrame::from_index(1), 0),
            Err(PmmError::InvalidCount)
        );
        assert_eq!(a.free_page_count(), free);
    }

    #[test]
    fn frame_alloc_seam_uses_any_zone() {
        let ram = TestRam::new(0x10_0000);
        let mut a = pmm(&ram, &[MemoryMapEntry::new(0, 0x4000, MemoryKind::Usable)]);
        let f = a.alloc_frame().unwrap();
        assert_eq!(f.index(), 1);
        a.free_frame(f);
        a.free_frame(f);
        assert_eq!(a.free_page_count(), 3);
    }
}
