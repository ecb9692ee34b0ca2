//! Slab bookkeeping kept inside the slab page itself.
//!
//! ```text
//! ┌──────────────────────────────┬────────────────────┬─────────┬───────
//! │ SlabHeader                   │ free stack         │ padding │ slots
//! │ magic, cache, links, live    │ [u16; per_slab]    │         │
//! └──────────────────────────────┴────────────────────┴─────────┴───────
//! ```
//!
//! A cache never touches the global heap: list links, the free-slot stack
//! and the live bitmap all live in the page they describe.

use crate::slab::SlabState;
use core::ptr::NonNull;
use kernel_memory_addresses::PAGE_SIZE;

/// Slots per slab are bounded by what fits in one page at 8-byte stride.
pub const MAX_SLOTS: usize = 512;

pub const SLAB_MAGIC: u64 = 0x5AB5_1AB5_0000_0001;

/// Start of every slab page; the free stack follows directly.
#[repr(C)]
pub struct SlabHeader {
    magic: u64,
    cache_id: u64,
    prev: Option<NonNull<SlabHeader>>,
    next: Option<NonNull<SlabHeader>>,
    live: [u64; MAX_SLOTS / 64],
    live_count: u16,
    /// Entries on the free stack.
    free_top: u16,
    state: SlabState,
}

/// Handle to a formatted slab page.
///
/// Only [`format`](Self::format) and a successful
/// [`containing`](Self::containing) + [`is_owned_by`](Self::is_owned_by)
/// produce handles the cache uses, so every access below reads or writes a
/// live, formatted header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct SlabPage(NonNull<SlabHeader>);

impl SlabPage {
    /// Bytes the header and a free stack of `slots` entries occupy.
    #[inline]
    pub const fn bookkeeping_size(slots: usize) -> usize {
        size_of::<SlabHeader>() + slots * size_of::<u16>()
    }

    /// Write a fresh header to `base` with every slot free, slot 0 on top.
    ///
    /// # Safety
    /// `base` must be a writable, page-aligned page owned by the caller.
    pub unsafe fn format(base: NonNull<u8>, cache_id: u64, slots: usize) -> Self {
        debug_assert!(slots <= MAX_SLOTS);
        let header = base.cast::<SlabHeader>();
        unsafe {
            header.write(SlabHeader {
                magic: SLAB_MAGIC,
                cache_id,
                prev: None,
                next: None,
                live: [0; MAX_SLOTS / 64],
                live_count: 0,
                free_top: slots as u16,
                state: SlabState::Empty,
            });
        }
        let page = Self(header);
        for (i, slot) in (0..slots).rev().enumerate() {
            unsafe { page.stack().add(i).write(slot as u16) };
        }
        page
    }

    /// The page `object` lies in. The header is not validated.
    ///
    /// # Safety
    /// The page containing `object` must be mapped.
    #[inline]
    pub unsafe fn containing(object: NonNull<u8>) -> Self {
        let offset = object.as_ptr() as usize % PAGE_SIZE as usize;
        Self(unsafe { object.sub(offset) }.cast())
    }

    /// Whether the page carries a live header of cache `cache_id`.
    ///
    /// # Safety
    /// The page must be readable.
    pub unsafe fn is_owned_by(self, cache_id: u64) -> bool {
        let header = self.0.as_ptr();
        unsafe {
            (&raw const (*header).magic).read() == SLAB_MAGIC
                && (&raw const (*header).cache_id).read() == cache_id
        }
    }

    /// Invalidate the header so stale pointers into the page are refused.
    pub fn retire(self) {
        self.header_mut().magic = 0;
    }

    #[inline]
    pub const fn base(self) -> NonNull<u8> {
        self.0.cast()
    }

    /// Take the most recently freed slot.
    pub fn pop(self) -> Option<usize> {
        let header = self.header_mut();
        header.free_top = header.free_top.checked_sub(1)?;
        let top = usize::from(header.free_top);
        let slot = usize::from(unsafe { self.stack().add(top).read() });
        let header = self.header_mut();
        header.live[slot / 64] |= 1 << (slot % 64);
        header.live_count += 1;
        Some(slot)
    }

    pub fn push(self, slot: usize) {
        debug_assert!(self.is_live(slot));
        let header = self.header_mut();
        header.live[slot / 64] &= !(1 << (slot % 64));
        header.live_count -= 1;
        let top = usize::from(header.free_top);
        header.free_top += 1;
        unsafe { self.stack().add(top).write(slot as u16) };
    }

    #[inline]
    pub fn is_live(self, slot: usize) -> bool {
        slot < MAX_SLOTS && self.header().live[slot / 64] & (1 << (slot % 64)) != 0
    }

    #[inline]
    pub fn live_count(self) -> usize {
        usize::from(self.header().live_count)
    }

    pub fn live_slots(self) -> impl Iterator<Item = usize> {
        (0..MAX_SLOTS).filter(move |&s| self.is_live(s))
    }

    /// List this slab belongs on by occupancy alone.
    pub fn occupancy(self, per_slab: usize) -> SlabState {
        match self.live_count() {
            0 => SlabState::Empty,
            n if n == per_slab => SlabState::Full,
            _ => SlabState::Partial,
        }
    }

    #[inline]
    pub fn state(self) -> SlabState {
        self.header().state
    }

    fn prev(self) -> Option<Self> {
        self.header().prev.map(Self)
    }

    fn next(self) -> Option<Self> {
        self.header().next.map(Self)
    }

    fn set_links(self, prev: Option<Self>, next: Option<Self>) {
        let header = self.header_mut();
        header.prev = prev.map(|p| p.0);
        header.next = next.map(|n| n.0);
    }

    fn set_prev(self, prev: Option<Self>) {
        self.header_mut().prev = prev.map(|p| p.0);
    }

    fn set_next(self, next: Option<Self>) {
        self.header_mut().next = next.map(|n| n.0);
    }

    fn stack(self) -> *mut u16 {
        unsafe { self.0.as_ptr().add(1).cast() }
    }

    // Handles only exist for formatted pages; each reference is dropped
    // before the next one is taken.
    fn header<'a>(self) -> &'a SlabHeader {
        unsafe { self.0.as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut<'a>(self) -> &'a mut SlabHeader {
        unsafe { &mut *self.0.as_ptr() }
    }
}

/// The four per-state lists of a cache, linked through the slab headers.
#[derive(Default)]
pub struct SlabLists {
    heads: [Option<SlabPage>; 4],
    lens: [usize; 4],
}

impl SlabLists {
    #[inline]
    pub const fn first(&self, state: SlabState) -> Option<SlabPage> {
        self.heads[state.index()]
    }

    #[inline]
    pub const fn len(&self, state: SlabState) -> usize {
        self.lens[state.index()]
    }

    /// Put an unlinked page at the front of the `state` list.
    pub fn link(&mut self, page: SlabPage, state: SlabState) {
        let old = self.heads[state.index()].replace(page);
        self.lens[state.index()] += 1;
        if let Some(old) = old {
            old.set_prev(Some(page));
        }
        page.header_mut().state = state;
        page.set_links(None, old);
    }

    pub fn unlink(&mut self, page: SlabPage) {
        let state = page.state();
        let (prev, next) = (page.prev(), page.next());
        match prev {
            Some(p) => p.set_next(next),
            None => self.heads[state.index()] = next,
        }
        if let Some(n) = next {
            n.set_prev(prev);
        }
        page.set_links(None, None);
        self.lens[state.index()] -= 1;
    }

    /// Move a linked page to the front of the `to` list.
    pub fn move_to(&mut self, page: SlabPage, to: SlabState) {
        if page.state() != to {
            self.unlink(page);
            self.link(page, to);
        }
    }

    /// Pages on the `state` list, front to back.
    #[cfg(test)]
    pub fn iter(&self, state: SlabState) -> impl Iterator<Item = SlabPage> {
        core::iter::successors(self.first(state), |p| p.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    const PAGE: Layout = match Layout::from_size_align(4096, 4096) {
        Ok(l) => l,
        Err(_) => panic!(),
    };

    fn page(slots: usize) -> SlabPage {
        let base = NonNull::new(unsafe { alloc_zeroed(PAGE) }).unwrap();
        unsafe { SlabPage::format(base, 7, slots) }
    }

    fn free(p: SlabPage) {
        unsafe { dealloc(p.base().as_ptr(), PAGE) };
    }

    #[test]
    fn slots_come_back_in_lifo_order() {
        let s = page(4);
        assert_eq!(s.pop(), Some(0));
        assert_eq!(s.pop(), Some(1));
        s.push(0);
        assert_eq!(s.pop(), Some(0));
        assert_eq!(s.live_count(), 2);
        assert_eq!(s.live_slots().collect::<Vec<_>>(), [0, 1]);
        assert_eq!(s.occupancy(4), SlabState::Partial);
        s.pop();
        s.pop();
        assert_eq!(s.pop(), None);
        assert_eq!(s.occupancy(4), SlabState::Full);
        free(s);
    }

    #[test]
    fn ownership_follows_the_header() {
        let s = page(2);
        let inside = unsafe { s.base().add(1000) };
        assert_eq!(unsafe { SlabPage::containing(inside) }, s);
        assert!(unsafe { s.is_owned_by(7) });
        assert!(!unsafe { s.is_owned_by(8) });
        s.retire();
        assert!(!unsafe { s.is_owned_by(7) });
        free(s);
    }

    #[test]
    fn lists_track_membership() {
        let mut lists = SlabLists::default();
        let (x, y, z) = (page(2), page(2), page(2));
        for p in [x, y, z] {
            lists.link(p, SlabState::Empty);
        }
        assert_eq!(lists.iter(SlabState::Empty).collect::<Vec<_>>(), [z, y, x]);

        lists.move_to(y, SlabState::Partial);
        assert_eq!(lists.iter(SlabState::Empty).collect::<Vec<_>>(), [z, x]);
        assert_eq!(lists.first(SlabState::Partial), Some(y));
        assert_eq!(y.state(), SlabState::Partial);

        lists.move_to(z, SlabState::Quarantine);
        lists.move_to(x, SlabState::Quarantine);
        assert_eq!(lists.len(SlabState::Empty), 0);
        assert_eq!(lists.len(SlabState::Quarantine), 2);

        lists.unlink(z);
        assert_eq!(lists.iter(SlabState::Quarantine).collect::<Vec<_>>(), [x]);
        lists.unlink(x);
        lists.unlink(y);
        assert!(SlabState::ALL.iter().all(|&s| lists.len(s) == 0));
        for p in [x, y, z] {
            free(p);
        }
    }
}
