mod common;

use common::{MIB, TestRam, pc_memory_map};
use kernel_alloc::{BitmapFrameAllocator, PmmError, Zone};
use kernel_info::boot::{MemoryKind, MemoryMapEntry};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalFrame};

fn one_mebibyte() -> (TestRam, BitmapFrameAllocator) {
    let ram = TestRam::new(MIB as usize);
    let map = [MemoryMapEntry::new(0, MIB, MemoryKind::Usable)];
    let pmm = unsafe { BitmapFrameAllocator::init(&map, &ram) }.unwrap();
    (ram, pmm)
}

fn assert_counters_consistent(pmm: &BitmapFrameAllocator) {
    let mut used = 0;
    for zone in Zone::ALL {
        let s = pmm.zone_stats(zone);
        assert_eq!(s.free + s.used(), s.total, "{zone}");
        used += s.used();
    }
    assert_eq!(pmm.free_page_count() + used, pmm.total_page_count());
}

#[test]
fn single_region_accounts_for_its_own_bitmap() {
    let (_ram, pmm) = one_mebibyte();
    let (_, bitmap_frames) = pmm.bitmap_storage();
    assert_eq!(pmm.total_page_count(), 256);
    assert_eq!(pmm.free_page_count(), 256 - bitmap_frames);
    assert_eq!(pmm.zone_stats(Zone::Dma).total, 256);
    assert_eq!(pmm.zone_stats(Zone::Normal).total, 0);
    assert_counters_consistent(&pmm);
}

#[test]
fn three_contiguous_pages_are_consecutive_and_used() {
    let (_ram, mut pmm) = one_mebibyte();
    let first = pmm.alloc_contiguous(3, Zone::Dma).unwrap();
    let base = first.base().as_u64();
    for i in 0..3 {
        let pa = PhysicalAddress::new(base + i * PAGE_SIZE);
        assert!(pa.as_u64().is_multiple_of(PAGE_SIZE));
        assert!(pmm.page_is_used(pa));
    }
    assert!(!pmm.page_is_used(PhysicalAddress::new(base + 3 * PAGE_SIZE)));
    assert_eq!(pmm.free_page_count(), 255 - 3);

    pmm.free_contiguous(first, 3).unwrap();
    assert_eq!(pmm.free_page_count(), 255);
    assert_counters_consistent(&pmm);
}

#[test]
fn double_free_is_detected_and_harmless() {
    let (_ram, mut pmm) = one_mebibyte();
    let f = pmm.alloc_page(Zone::Dma).unwrap();
    pmm.free_page(f).unwrap();
    let free = pmm.free_page_count();
    assert_eq!(pmm.free_page(f), Err(PmmError::DoubleFree(f.base())));
    assert_eq!(pmm.free_page_count(), free);
    assert!(!pmm.page_is_used(f.base()));
}

#[test]
fn contiguous_free_is_all_or_nothing() {
    let (_ram, mut pmm) = one_mebibyte();
    let run = pmm.alloc_contiguous(4, Zone::Dma).unwrap();
    let third = PhysicalFrame::from_index(run.index() + 2);
    pmm.free_page(third).unwrap();

    assert_eq!(
        pmm.free_contiguous(run, 4),
        Err(PmmError::DoubleFree(third.base()))
    );
    assert!(pmm.page_is_used(run.base()));
    assert_eq!(pmm.free_contiguous(run, 0), Err(PmmError::InvalidCount));
    assert_counters_consistent(&pmm);
}

#[test]
fn contiguous_runs_skip_holes_and_fail_whole() {
    let ram = TestRam::new((64 * PAGE_SIZE) as usize);
    let map = [
        MemoryMapEntry::new(0, 4 * PAGE_SIZE, MemoryKind::Usable),
        MemoryMapEntry::new(4 * PAGE_SIZE, PAGE_SIZE, MemoryKind::Reserved),
        MemoryMapEntry::new(5 * PAGE_SIZE, 5 * PAGE_SIZE, MemoryKind::Usable),
    ];
    let mut pmm = unsafe { BitmapFrameAllocator::init(&map, &ram) }.unwrap();

    // Frame 0 holds the bitmap, frame 4 is reserved.
    let run = pmm.alloc_contiguous(4, Zone::Dma).unwrap();
    assert_eq!(run.index(), 5);
    let free = pmm.free_page_count();
    assert_eq!(
        pmm.alloc_contiguous(4, Zone::Dma),
        Err(PmmError::NoContiguousRun {
            count: 4,
            zone: Zone::Dma
        })
    );
    assert_eq!(pmm.free_page_count(), free);
}

#[test]
fn zone_requests_stay_inside_their_zone() {
    let ram = TestRam::new((20 * MIB) as usize);
    let map = pc_memory_map();
    let mut pmm = unsafe { BitmapFrameAllocator::init(&map, &ram) }.unwrap();

    assert_eq!(pmm.zone_stats(Zone::Dma32).total, 1024);
    assert_eq!(pmm.alloc_page(Zone::Normal), Err(PmmError::ZoneExhausted(Zone::Normal)));

    let low = pmm.alloc_page(Zone::Dma).unwrap();
    assert_eq!(Zone::containing(low.base()), Zone::Dma);

    // Generic requests prefer the higher zone.
    let any = pmm.alloc_page_any().unwrap();
    assert_eq!(Zone::containing(any.base()), Zone::Dma32);
    let run = pmm.alloc_contiguous_any(8).unwrap();
    assert_eq!(Zone::containing(run.base()), Zone::Dma32);

    // Reserved and executable memory is never handed out.
    assert!(pmm.page_is_used(PhysicalAddress::new(0x9_F000)));
    assert!(pmm.page_is_used(PhysicalAddress::new(2 * MIB)));
    assert_counters_consistent(&pmm);
}

#[test]
fn exhausted_zones_fall_back_then_fail() {
    let ram = TestRam::new((8 * PAGE_SIZE) as usize);
    let map = [MemoryMapEntry::new(0, 8 * PAGE_SIZE, MemoryKind::Usable)];
    let mut pmm = unsafe { BitmapFrameAllocator::init(&map, &ram) }.unwrap();

    let frames: Vec<_> = (0..7).map(|_| pmm.alloc_page_any().unwrap()).collect();
    assert_eq!(pmm.alloc_page_any(), Err(PmmError::OutOfMemory));
    assert_eq!(pmm.alloc_page(Zone::Dma), Err(PmmError::ZoneExhausted(Zone::Dma)));

    for f in frames {
        pmm.free_page(f).unwrap();
    }
    assert_eq!(pmm.free_page_count(), 7);
    assert_counters_consistent(&pmm);
}

#[test]
fn bitmap_bit_matches_allocation_state() {
    let (_ram, mut pmm) = one_mebibyte();
    let mut held = Vec::new();
    for i in 0..40 {
        let f = pmm.alloc_page(Zone::Dma).unwrap();
        if i % 3 == 0 {
            pmm.free_page(f).unwrap();
        } else {
            held.push(f);
        }
    }
    for f in &held {
        assert!(pmm.page_is_used(f.base()));
    }
    let used_in_dma = pmm.zone_stats(Zone::Dma).used();
    let bitmap_frames = pmm.bitmap_storage().1;
    assert_eq!(used_in_dma, held.len() as u64 + bitmap_frames);
    assert_counters_consistent(&pmm);
}
