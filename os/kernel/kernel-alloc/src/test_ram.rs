//! Simulated physical memory for unit tests: physical address `pa` lives at
//! `base + pa` of a leaked, page-aligned host allocation.

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;
use std::alloc::{Layout, alloc_zeroed};

pub struct TestRam {
    base: *mut u8,
    len: u64,
}

impl TestRam {
    pub fn new(bytes: usize) -> Self {
        let layout = Layout::from_size_align(bytes, 4096).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());
        Self {
            base,
            len: bytes as u64,
        }
    }

    pub fn read_u64(&self, pa: u64) -> u64 {
        unsafe { *self.phys_to_ref::<u64>(PhysicalAddress::new(pa)) }
    }
}

impl PhysMapper for TestRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        assert!(pa.as_u64() < self.len, "{pa} outside simulated RAM");
        unsafe { &mut *self.base.add(pa.as_u64() as usize).cast::<T>() }
    }
}
