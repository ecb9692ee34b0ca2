//! Geometry of a one-page slab and the canary bracket around each object.

use crate::slab::SlabError;
use crate::slab::page::{MAX_SLOTS, SlabPage};
use core::ptr::NonNull;
use kernel_memory_addresses::PAGE_SIZE;

/// Alignment used when the caller asks for none; one cache line.
pub const DEFAULT_ALIGN: usize = 64;

/// Written before and after every object while canaries are enabled.
pub const CANARY: u64 = 0xDEAD_C0DE_CAFE_F00D;

/// Fill byte of freed objects.
pub const POISON: u8 = 0x5A;

const CANARY_SIZE: usize = size_of::<u64>();

const PAGE: usize = PAGE_SIZE as usize;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlotLayout {
    /// Object size rounded up to the alignment.
    pub object: usize,
    pub align: usize,
    /// Bytes before the object inside its slot.
    pub lead: usize,
    /// Distance between consecutive slots.
    pub stride: usize,
    /// Bytes reserved for the header and free stack at the start of the page.
    pub header: usize,
    pub per_slab: usize,
    pub canaries: bool,
}

impl SlotLayout {
    /// Lay out `size`-byte objects aligned to `align` (0 selects [`DEFAULT_ALIGN`]).
    pub fn new(size: usize, align: usize, canaries: bool) -> Result<Self, SlabError> {
        if size == 0 {
            return Err(SlabError::ZeroSized);
        }
        let align = match align {
            0 => DEFAULT_ALIGN,
            a if a.is_power_of_two() && a <= PAGE => a.max(CANARY_SIZE),
            a => return Err(SlabError::InvalidAlignment(a)),
        };

        let too_large = SlabError::ObjectTooLarge(size);
        let object = size.checked_next_multiple_of(align).ok_or(too_large)?;
        if object >= PAGE {
            return Err(too_large);
        }
        let lead = if canaries { CANARY_SIZE.next_multiple_of(align) } else { 0 };
        let trail = if canaries { CANARY_SIZE } else { 0 };
        let stride = (lead + object + trail).next_multiple_of(align);
        let header_for = |slots| SlabPage::bookkeeping_size(slots).next_multiple_of(align);

        // Every slot also costs a free-stack entry, so this is an upper bound.
        let room = PAGE - SlabPage::bookkeeping_size(0);
        let mut per_slab = (room / (stride + size_of::<u16>())).min(MAX_SLOTS);
        while per_slab > 0 && header_for(per_slab) + per_slab * stride > PAGE {
            per_slab -= 1;
        }
        if per_slab == 0 {
            return Err(too_large);
        }
        let header = header_for(per_slab);
        Ok(Self {
            object,
            align,
            lead,
            stride,
            header,
            per_slab,
            canaries,
        })
    }

    /// Start of slot `slot` in the slab at `page`.
    #[inline]
    pub fn slot(&self, page: NonNull<u8>, slot: usize) -> NonNull<u8> {
        debug_assert!(slot < self.per_slab);
        unsafe { page.add(self.header + slot * self.stride) }
    }

    #[inline]
    pub fn object(&self, page: NonNull<u8>, slot: usize) -> NonNull<u8> {
        unsafe { self.slot(page, slot).add(self.lead) }
    }

    /// Slot index of `object` inside `page`, if it is exactly an object start.
    pub fn slot_of(&self, page: NonNull<u8>, object: NonNull<u8>) -> Option<usize> {
        let offset = (object.as_ptr() as usize)
            .checked_sub(page.as_ptr() as usize)?
            .checked_sub(self.header + self.lead)?;
        let slot = offset / self.stride;
        (offset % self.stride == 0 && slot < self.per_slab).then_some(slot)
    }

    /// Write both canaries of a slot.
    ///
    /// # Safety
    /// `slot` must come from [`slot`](Self::slot) on a live slab page.
    pub unsafe fn arm(&self, slot: NonNull<u8>) {
        if !self.canaries {
            return;
        }
        unsafe {
            self.front(slot).write_unaligned(CANARY);
            self.back(slot).write_unaligned(CANARY);
        }
    }

    /// # Safety
    /// As for [`arm`](Self::arm).
    pub unsafe fn canaries_intact(&self, slot: NonNull<u8>) -> bool {
        !self.canaries
            || unsafe {
                self.front(slot).read_unaligned() == CANARY
                    && self.back(slot).read_unaligned() == CANARY
            }
    }

    /// Fill the object bytes of a slot with [`POISON`].
    ///
    /// # Safety
    /// As for [`arm`](Self::arm).
    pub unsafe fn poison(&self, slot: NonNull<u8>) {
        if self.canaries {
            unsafe { self.object_bytes(slot).fill(POISON) };
        }
    }

    /// # Safety
    /// As for [`arm`](Self::arm).
    pub unsafe fn poison_intact(&self, slot: NonNull<u8>) -> bool {
        !self.canaries || unsafe { self.object_bytes(slot) }.iter().all(|&b| b == POISON)
    }

    unsafe fn front(&self, slot: NonNull<u8>) -> *mut u64 {
        unsafe { slot.add(self.lead - CANARY_SIZE).as_ptr().cast() }
    }

    unsafe fn back(&self, slot: NonNull<u8>) -> *mut u64 {
        unsafe { slot.add(self.lead + self.object).as_ptr().cast() }
    }

    unsafe fn object_bytes<'a>(&self, slot: NonNull<u8>) -> &'a mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(slot.add(self.lead).as_ptr(), self.object) }
    }
}
