use crate::slab::layout::SlotLayout;
use crate::slab::page::{SlabLists, SlabPage};
use crate::slab::{ObjectHook, PageProvider, SlabConfig, SlabError, SlabState};
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::VirtualAddress;
use log::{debug, error, info, warn};

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// A named pool of equally sized objects.
///
/// The cache does not own a page source; every call that may need or return
/// pages borrows a [`PageProvider`]. Use the same provider for the whole
/// life of the cache. Apart from those pages the cache allocates nothing.
pub struct SlabCache {
    name: &'static str,
    id: u64,
    size: usize,
    layout: SlotLayout,
    config: SlabConfig,
    ctor: Option<ObjectHook>,
    dtor: Option<ObjectHook>,
    slabs: SlabLists,
    used_objects: usize,
}

// Slab pages are owned exclusively by the cache.
unsafe impl Send for SlabCache {}

/// Point-in-time counters of one cache.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlabCacheStats {
    pub name: &'static str,
    pub object_size: usize,
    pub stride: usize,
    pub objects_per_slab: usize,
    pub total_objects: usize,
    pub used_objects: usize,
    pub empty_slabs: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub quarantined_slabs: usize,
}

impl SlabCacheStats {
    /// Slabs objects can be allocated from or are live in.
    #[must_use]
    pub const fn total_slabs(&self) -> usize {
        self.empty_slabs + self.partial_slabs + self.full_slabs
    }
}

impl fmt::Display for SlabCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} objects of {} B (stride {}, {} per slab), slabs {} empty / {} partial / {} full / {} quarantined",
            self.name,
            self.used_objects,
            self.total_objects,
            self.object_size,
            self.stride,
            self.objects_per_slab,
            self.empty_slabs,
            self.partial_slabs,
            self.full_slabs,
            self.quarantined_slabs
        )
    }
}

impl SlabCache {
    /// Create an empty cache; no page is allocated until the first [`alloc`](Self::alloc).
    ///
    /// `align == 0` selects cache-line alignment. Alignments below 8 are raised to 8.
    ///
    /// # Errors
    /// [`SlabError::ZeroSized`], [`SlabError::InvalidAlignment`] or
    /// [`SlabError::ObjectTooLarge`] when no object fits in a slab.
    pub fn new(
        name: &'static str,
        size: usize,
        align: usize,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
        config: SlabConfig,
    ) -> Result<Self, SlabError> {
        let layout = SlotLayout::new(size, align, config.canaries)?;
        let id = NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Slab cache {name}: {size} B objects, stride {}, {} per slab",
            layout.stride, layout.per_slab
        );
        Ok(Self {
            name,
            id,
            size,
            layout,
            config,
            ctor,
            dtor,
            slabs: SlabLists::default(),
            used_objects: 0,
        })
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    #[must_use]
    pub const fn objects_per_slab(&self) -> usize {
        self.layout.per_slab
    }

    #[inline]
    #[must_use]
    pub const fn used_objects(&self) -> usize {
        self.used_objects
    }

    /// Allocate one object.
    ///
    /// Partial slabs are used first, then empty ones; only then is a new
    /// slab requested from `pages`.
    ///
    /// # Errors
    /// [`SlabError::OutOfMemory`] when a new slab is needed and `pages` has none.
    pub fn alloc<P: PageProvider + ?Sized>(&mut self, pages: &mut P) -> Result<NonNull<u8>, SlabError> {
        loop {
            let reusable = self
                .slabs
                .first(SlabState::Partial)
                .or(self.slabs.first(SlabState::Empty));
            let slab = match reusable {
                Some(slab) => slab,
                None => self.grow(pages)?,
            };

            let Some(slot) = slab.pop() else {
                // A slab on the partial or empty list always has a free slot.
                self.reclassify(slab);
                continue;
            };

            let layout = self.layout;
            let slot_base = layout.slot(slab.base(), slot);
            let object = layout.object(slab.base(), slot);
            if !unsafe { layout.poison_intact(slot_base) && layout.canaries_intact(slot_base) } {
                error!(
                    "{}: freed object {} was written to; quarantining its slab",
                    self.name,
                    VirtualAddress::from_nonnull(object)
                );
                slab.push(slot);
                self.quarantine(slab);
                continue;
            }

            if let Some(ctor) = self.ctor {
                ctor(object);
            }
            self.used_objects += 1;
            self.reclassify(slab);
            return Ok(object);
        }
    }

    /// Return `object` to the cache.
    ///
    /// Freeing the last object of a slab may release empty slabs beyond
    /// [`SlabConfig::max_empty_slabs`] to `pages`.
    ///
    /// # Errors
    /// Foreign, misaligned and double-freed objects are refused without any
    /// change. A damaged canary quarantines the slab and reports
    /// [`SlabError::Corrupted`]; the destructor does not run then.
    ///
    /// # Safety
    /// The page containing `object` must be readable.
    pub unsafe fn free<P: PageProvider + ?Sized>(
        &mut self,
        pages: &mut P,
        object: NonNull<u8>,
    ) -> Result<(), SlabError> {
        let va = VirtualAddress::from_nonnull(object);
        let (slab, slot) = unsafe { self.locate(object) }.inspect_err(|e| error!("{}: {e}", self.name))?;

        let layout = self.layout;
        if slab.state() == SlabState::Quarantine {
            error!("{}: free of {va} in a quarantined slab", self.name);
            return Err(SlabError::Quarantined(va));
        }
        if !slab.is_live(slot) {
            error!("{}: double free of {va}", self.name);
            return Err(SlabError::DoubleFree(va));
        }

        let slot_base = layout.slot(slab.base(), slot);
        if !unsafe { layout.canaries_intact(slot_base) } {
            error!("{}: canary around {va} overwritten; quarantining its slab", self.name);
            self.quarantine(slab);
            return Err(SlabError::Corrupted(va));
        }

        if let Some(dtor) = self.dtor {
            dtor(object);
        }
        unsafe { layout.poison(slot_base) };
        slab.push(slot);
        self.used_objects -= 1;
        self.reclassify(slab);
        self.trim(pages);
        Ok(())
    }

    /// Release every quarantined slab. Returns how many were released.
    pub fn purge_corrupt<P: PageProvider + ?Sized>(&mut self, pages: &mut P) -> usize {
        let mut purged = 0;
        while let Some(slab) = self.slabs.first(SlabState::Quarantine) {
            self.release(pages, slab);
            purged += 1;
        }
        if purged > 0 {
            info!("{}: purged {purged} quarantined slabs", self.name);
        }
        purged
    }

    /// Tear the cache down, returning every slab to `pages`.
    ///
    /// The destructor runs on objects still live in healthy slabs.
    pub fn destroy<P: PageProvider + ?Sized>(mut self, pages: &mut P) {
        if self.used_objects > 0 {
            warn!(
                "{}: destroyed with {} live objects",
                self.name, self.used_objects
            );
        }
        for state in SlabState::ALL {
            while let Some(slab) = self.slabs.first(state) {
                if let Some(dtor) = self.dtor.filter(|_| state != SlabState::Quarantine) {
                    for slot in slab.live_slots() {
                        dtor(self.layout.object(slab.base(), slot));
                    }
                }
                self.release(pages, slab);
            }
        }
        debug!("{}: destroyed", self.name);
    }

    #[must_use]
    pub fn stats(&self) -> SlabCacheStats {
        let count = |state| self.slabs.len(state);
        let live_slabs = count(SlabState::Empty) + count(SlabState::Partial) + count(SlabState::Full);
        SlabCacheStats {
            name: self.name,
            object_size: self.size,
            stride: self.layout.stride,
            objects_per_slab: self.layout.per_slab,
            total_objects: live_slabs * self.layout.per_slab,
            used_objects: self.used_objects,
            empty_slabs: count(SlabState::Empty),
            partial_slabs: count(SlabState::Partial),
            full_slabs: count(SlabState::Full),
            quarantined_slabs: count(SlabState::Quarantine),
        }
    }

    pub fn dump_stats(&self) {
        info!("{}", self.stats());
    }

    fn grow<P: PageProvider + ?Sized>(&mut self, pages: &mut P) -> Result<SlabPage, SlabError> {
        let Some(base) = pages.alloc_pages(1) else {
            warn!("{}: no page for a new slab", self.name);
            return Err(SlabError::OutOfMemory);
        };
        let slab = unsafe { SlabPage::format(base, self.id, self.layout.per_slab) };
        for slot in 0..self.layout.per_slab {
            let slot_base = self.layout.slot(base, slot);
            unsafe {
                self.layout.arm(slot_base);
                self.layout.poison(slot_base);
            }
        }
        self.slabs.link(slab, SlabState::Empty);
        debug!("{}: new slab at {}", self.name, VirtualAddress::from_nonnull(base));
        Ok(slab)
    }

    /// Slab and slot of `object`, via the header of its page.
    unsafe fn locate(&self, object: NonNull<u8>) -> Result<(SlabPage, usize), SlabError> {
        let va = VirtualAddress::from_nonnull(object);
        let slab = unsafe { SlabPage::containing(object) };
        if !unsafe { slab.is_owned_by(self.id) } {
            return Err(SlabError::ForeignObject(va));
        }
        let slot = self
            .layout
            .slot_of(slab.base(), object)
            .ok_or(SlabError::Misaligned(va))?;
        Ok((slab, slot))
    }

    /// Move a slab to the list matching its occupancy, unless quarantined.
    fn reclassify(&mut self, slab: SlabPage) {
        if slab.state() != SlabState::Quarantine {
            self.slabs.move_to(slab, slab.occupancy(self.layout.per_slab));
        }
    }

    fn quarantine(&mut self, slab: SlabPage) {
        if slab.state() != SlabState::Quarantine {
            self.used_objects -= slab.live_count();
            self.slabs.move_to(slab, SlabState::Quarantine);
        }
    }

    /// Release empty slabs past the configured bound.
    fn trim<P: PageProvider + ?Sized>(&mut self, pages: &mut P) {
        while self.slabs.len(SlabState::Empty) > self.config.max_empty_slabs {
            let Some(slab) = self.slabs.first(SlabState::Empty) else {
                break;
            };
            debug!(
                "{}: releasing empty slab at {}",
                self.name,
                VirtualAddress::from_nonnull(slab.base())
            );
            self.release(pages, slab);
        }
    }

    fn release<P: PageProvider + ?Sized>(&mut self, pages: &mut P, slab: SlabPage) {
        self.slabs.unlink(slab);
        slab.retire();
        pages.free_pages(slab.base(), 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::layout::POISON;
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::collections::HashSet;

    #[derive(Default)]
    struct Pages {
        live: HashSet<usize>,
        fail: bool,
    }

    const PAGE: Layout = match Layout::from_size_align(4096, 4096) {
        Ok(l) => l,
        Err(_) => panic!(),
    };

    impl PageProvider for Pages {
        fn alloc_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
            assert_eq!(count, 1);
            if self.fail {
                return None;
            }
            let p = NonNull::new(unsafe { alloc_zeroed(PAGE) })?;
            self.live.insert(p.as_ptr() as usize);
            Some(p)
        }

        fn free_pages(&mut self, base: NonNull<u8>, count: usize) {
            assert_eq!(count, 1);
            assert!(self.live.remove(&(base.as_ptr() as usize)), "page freed twice");
            unsafe { dealloc(base.as_ptr(), PAGE) };
        }
    }

    fn guarded() -> SlabConfig {
        SlabConfig {
            max_empty_slabs: 1,
            canaries: true,
        }
    }

    #[test]
    fn partial_slabs_are_preferred() {
        let mut pages = Pages::default();
        let mut c = SlabCache::new("t", 32, 0, None, None, guarded()).unwrap();
        let a = c.alloc(&mut pages).unwrap();
        let b = c.alloc(&mut pages).unwrap();
        assert_eq!(pages.live.len(), 1);
        assert_eq!(c.stats().partial_slabs, 1);
        unsafe { c.free(&mut pages, a) }.unwrap();
        assert_eq!(c.alloc(&mut pages).unwrap(), a);
        unsafe {
            c.free(&mut pages, a).unwrap();
            c.free(&mut pages, b).unwrap();
        }
        assert_eq!(c.stats().empty_slabs, 1);
        c.destroy(&mut pages);
        assert!(pages.live.is_empty());
    }

    #[test]
    fn objects_are_aligned_and_poisoned_after_free() {
        let mut pages = Pages::default();
        let mut c = SlabCache::new("t", 24, 32, None, None, guarded()).unwrap();
        let a = c.alloc(&mut pages).unwrap();
        let b = c.alloc(&mut pages).unwrap();
        assert_eq!(a.as_ptr() as usize % 32, 0);
        assert_eq!(b.as_ptr() as usize % 32, 0);
        unsafe {
            a.as_ptr().write_bytes(0x11, 24);
            c.free(&mut pages, a).unwrap();
            assert!((0..32).all(|i| *a.as_ptr().add(i) == POISON));
            c.free(&mut pages, b).unwrap();
        }
        c.destroy(&mut pages);
    }

    #[test]
    fn hooks_run_on_alloc_free_and_destroy() {
        use core::sync::atomic::AtomicUsize;
        static CTOR: AtomicUsize = AtomicUsize::new(0);
        static DTOR: AtomicUsize = AtomicUsize::new(0);
        fn ctor(p: NonNull<u8>) {
            unsafe { p.as_ptr().write(7) };
            CTOR.fetch_add(1, Ordering::Relaxed);
        }
        fn dtor(_: NonNull<u8>) {
            DTOR.fetch_add(1, Ordering::Relaxed);
        }

        let mut pages = Pages::default();
        let mut c = SlabCache::new("hooks", 16, 0, Some(ctor), Some(dtor), guarded()).unwrap();
        let a = c.alloc(&mut pages).unwrap();
        let _b = c.alloc(&mut pages).unwrap();
        assert_eq!(unsafe { *a.as_ptr() }, 7);
        unsafe { c.free(&mut pages, a) }.unwrap();
        assert_eq!((CTOR.load(Ordering::Relaxed), DTOR.load(Ordering::Relaxed)), (2, 1));

        c.destroy(&mut pages);
        assert_eq!(DTOR.load(Ordering::Relaxed), 2);
        assert!(pages.live.is_empty());
    }

    #[test]
    fn foreign_and_misaligned_pointers_are_refused() {
        let mut pages = Pages::default();
        let mut c = SlabCache::new("a", 64, 0, None, None, guarded()).unwrap();
        let mut other = SlabCache::new("b", 64, 0, None, None, guarded()).unwrap();
        let a = c.alloc(&mut pages).unwrap();
        let o = other.alloc(&mut pages).unwrap();

        let va = VirtualAddress::from_nonnull(o);
        assert_eq!(unsafe { c.free(&mut pages, o) }, Err(SlabError::ForeignObject(va)));
        let inside = unsafe { a.add(8) };
        assert_eq!(
            unsafe { c.free(&mut pages, inside) },
            Err(SlabError::Misaligned(VirtualAddress::from_nonnull(inside)))
        );
        assert_eq!(c.used_objects(), 1);

        unsafe {
            c.free(&mut pages, a).unwrap();
            other.free(&mut pages, o).unwrap();
        }
        c.destroy(&mut pages);
        other.destroy(&mut pages);
    }

    #[test]
    fn use_after_free_write_is_caught_on_reuse() {
        let mut pages = Pages::default();
        let mut c = SlabCache::new("uaf", 32, 0, None, None, guarded()).unwrap();
        let a = c.alloc(&mut pages).unwrap();
        let keep = c.alloc(&mut pages).unwrap();
        unsafe {
            c.free(&mut pages, a).unwrap();
            a.as_ptr().write(0);
        }

        // The damaged slot is detected; the allocation moves to a new slab.
        let fresh = c.alloc(&mut pages).unwrap();
        assert_ne!(fresh, a);
        let s = c.stats();
        assert_eq!((s.quarantined_slabs, s.used_objects), (1, 1));
        assert_eq!(
            unsafe { c.free(&mut pages, keep) },
            Err(SlabError::Quarantined(VirtualAddress::from_nonnull(keep)))
        );

        assert_eq!(c.purge_corrupt(&mut pages), 1);
        unsafe { c.free(&mut pages, fresh) }.unwrap();
        c.destroy(&mut pages);
        assert!(pages.live.is_empty());
    }

    #[test]
    fn failed_growth_is_reported() {
        let mut pages = Pages {
            fail: true,
            ..Pages::default()
        };
        let mut c = SlabCache::new("oom", 8, 0, None, None, SlabConfig::default()).unwrap();
        assert_eq!(c.alloc(&mut pages), Err(SlabError::OutOfMemory));
        assert_eq!(c.stats().total_slabs(), 0);
    }
}
