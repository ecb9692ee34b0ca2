//! Interrupt masking.
//!
//! On the bare-metal target this uses `cli`/`sti` and the `IF` bit of
//! `RFLAGS`. Hosted builds (unit tests) cannot execute `cli`, so there the
//! guard only records that interrupts were "enabled" and does nothing else.

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the interrupt flag. If interrupts were
/// enabled it executes `cli`; on drop it executes `sti` **only** if they were
/// enabled before, so guards nest correctly.
///
/// ```no_run
/// use kernel_sync::IrqGuard;
///
/// {
///     let _g = IrqGuard::new(); // interrupts off from here
///     // critical section
/// } // restored here
/// ```
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            disable_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether interrupts were enabled when the guard was created.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    use kernel_registers::LoadRegister;
    use kernel_registers::rflags::Rflags;

    #[inline]
    #[must_use]
    pub fn interrupts_enabled() -> bool {
        Rflags::load().if_interrupt_enable()
    }

    #[inline]
    pub fn disable_interrupts() {
        // SAFETY: the kernel runs at CPL0 where cli is permitted.
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable_interrupts() {
        // SAFETY: only reached when the guard observed IF=1 on entry.
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    #[inline]
    #[must_use]
    pub const fn interrupts_enabled() -> bool {
        true
    }

    #[inline]
    pub const fn disable_interrupts() {}

    #[inline]
    pub const fn enable_interrupts() {}
}

use arch::{disable_interrupts, enable_interrupts, interrupts_enabled};
