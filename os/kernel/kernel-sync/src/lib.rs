//! # Kernel synchronization primitives
//!
//! The memory core's shared state (frame bitmap, page tables, slab lists) is
//! reachable from task context and from interrupt handlers alike. Each piece
//! sits behind a [`SpinLock`] that is taken with [`SpinLock::lock_irq`], so an
//! interrupt that itself needs to allocate cannot spin forever on a lock the
//! interrupted code already holds.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::IrqGuard;
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
