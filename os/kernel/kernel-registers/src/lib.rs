//! # Typed `x86_64` Registers
//!
//! The few control registers the memory core touches:
//!
//! * [`cr3::Cr3`]: root page-table base, loaded when an address space is
//!   activated.
//! * [`rflags::Rflags`]: interrupt-enable flag, saved and restored around
//!   interrupt-safe critical sections.
//! * [`tlb`]: single-page translation cache invalidation.
//!
//! Instructions that are privileged are only emitted for the bare-metal
//! target (`target_os = "none"`). Hosted builds, i.e. unit tests, get
//! no-op stand-ins so the surrounding code can run unprivileged.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr3;
pub mod rflags;
pub mod tlb;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}

pub trait LoadRegister {
    /// Loading this register is safe from any privilege level.
    fn load() -> Self;
}

impl<T> LoadRegisterUnsafe for T
where
    T: LoadRegister,
{
    #[inline]
    unsafe fn load_unsafe() -> Self {
        <Self as LoadRegister>::load()
    }
}
