//! # Kernel Memory Layout and Boot Handoff
//!
//! Shared, dependency-light definitions the memory core is configured with:
//!
//! * [`memory`]: compile-time layout of the virtual address space and the
//!   physical zone boundaries, checked by `const` assertions.
//! * [`boot`]: the bootloader's memory map and executable location.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  Low identity window            │ 1 MiB .. 64 MiB
//!                       │  User space                     │
//! 0x0000_7FFF_FFFF_FFFF ├─────────────────────────────────┤
//!                       │  (non-canonical hole)           │
//! 0xFFFF_8000_0000_0000 ├─────────────────────────────────┤
//! HHDM_BASE             │  Higher Half Direct Map         │
//! RECURSIVE_SLOT (510)  │  Page tables, self-mapped       │ 0xFFFF_FF00_0000_0000
//! KERNEL_BASE           │  Kernel text & data             │ 0xFFFF_FFFF_8000_0000
//! KERNEL_HEAP_BASE      │  Kernel page window             │ 0xFFFF_FFFF_C000_0000
//! KERNEL_HEAP_LIMIT     └─────────────────────────────────┘ 0xFFFF_FFFF_E000_0000
//! ```
//!
//! Physical memory is classified into zones by DMA reach:
//!
//! ```text
//! 0x0000_0000 ┌──────────┐
//!             │   DMA    │ < ZONE_DMA_END (16 MiB)
//!             ├──────────┤
//!             │  DMA32   │ < ZONE_DMA32_END (4 GiB)
//!             ├──────────┤
//!             │  Normal  │
//!             └──────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
