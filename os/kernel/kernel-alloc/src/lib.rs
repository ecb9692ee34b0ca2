//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! This crate turns the bootloader's memory map into the three allocators
//! every other kernel subsystem draws memory from.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Slab Allocator                     │
//! │    • Fixed-size object caches                       │
//! │    • Empty / partial / full / quarantine lists      │
//! │    • Canary-based corruption detection              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ whole pages
//! ┌─────────────────▼───────────────────────────────────┐
//! │             Virtual Memory Manager (VMM)            │
//! │    • Kernel address space and task spaces           │
//! │    • Kernel heap window page layer                  │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ frames
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator (PMM)            │
//! │    • One bit per 4 KiB frame                        │
//! │    • DMA / DMA32 / Normal zones                     │
//! │    • Single frames and contiguous runs              │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Physical memory is only ever touched through a [`PhysMapper`](kernel_vmem::PhysMapper);
//! in the kernel that is the [`HhdmPhysMapper`](phys_mapper::HhdmPhysMapper).
//!
//! ## Core Components
//!
//! ### Physical Frame Allocator ([`frame_alloc`])
//!
//! * **Self-hosted bitmap**: stored in the first usable region large enough
//!   to hold it; those frames are never handed out.
//! * **Zones**: requests name a zone, or use the `_any` variants which
//!   prefer Normal memory and keep low memory for DMA users.
//! * **Checked frees**: double frees and frees of unmanaged frames are
//!   reported as errors and change nothing.
//!
//! ### Virtual Memory Manager ([`vmm`])
//!
//! * **Bootstrap space**: low identity window, HHDM aliases of the memory
//!   map and the kernel image at its higher-half base.
//! * **Page layer**: [`Vmm::alloc_pages`](vmm::Vmm::alloc_pages) backs a run
//!   of the kernel heap window with zeroed frames, optionally contiguous
//!   and optionally pinned to one zone.
//! * **Task spaces**: created sharing the kernel half, destroyed with all
//!   private tables.
//!
//! ### Slab Allocator ([`slab`])
//!
//! * **O(1) alloc/free** from one-page slabs, partial slabs first.
//! * **Bounded idle memory**: empty slabs past a limit are released.
//! * **Quarantine**: slabs with damaged canaries are never reused.
//!
//! ### Memory Manager ([`memory_manager`])
//!
//! Owns the PMM and VMM behind interrupt-safe spin locks and is the handle
//! the rest of the kernel uses after boot.
//!
//! ## Usage Patterns
//!
//! ```rust,no_run
//! use kernel_alloc::memory_manager::MemoryManager;
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_alloc::slab::{SlabCache, SlabConfig};
//! # fn boot(map: &[kernel_info::boot::MemoryMapEntry], exe: &kernel_info::boot::ExecutableLocation, hhdm: u64) -> Result<(), Box<dyn std::error::Error>> {
//! let mm = unsafe { MemoryManager::init(map, exe, hhdm, HhdmPhysMapper::new(hhdm))? };
//!
//! let mut tasks = SlabCache::new("task", 256, 0, None, None, SlabConfig::default())?;
//! let task = tasks.alloc(&mut mm.pages())?;
//! unsafe { tasks.free(&mut mm.pages(), task)? };
//! # Ok(()) }
//! ```
//!
//! ## Integration Points
//!
//! * **kernel-vmem**: page tables, address spaces and regions
//! * **kernel-info**: memory layout constants and boot handoff types
//! * **kernel-sync**: spin locks that mask interrupts
//!
//! Slab caches never use the global heap; their bookkeeping lives inside the
//! slab pages, so the kernel's global allocator can be built on
//! [`SlabCache`](slab::SlabCache). Region lists of address spaces (in
//! `kernel-vmem`) do use `alloc`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

mod bitmap;
pub mod frame_alloc;
pub mod memory_manager;
pub mod phys_mapper;
pub mod slab;
pub mod vmm;

#[cfg(test)]
mod test_ram;

pub use crate::frame_alloc::{BitmapFrameAllocator, PmmError, Zone, ZoneStats};
pub use crate::memory_manager::{ManagedPages, MemoryManager};
pub use crate::phys_mapper::HhdmPhysMapper;
pub use crate::slab::{PageProvider, SlabCache, SlabCacheStats, SlabConfig, SlabError, SlabState};
pub use crate::vmm::{KernelPages, Vmm, VmmError};
