use crate::LoadRegister;
use bitfield_struct::bitfield;

/// Architectural RFLAGS model for x86-64.
///
/// Only the interrupt flag matters to the memory core, but the full layout
/// is kept so the value can be logged and compared as a whole.
#[bitfield(u64, order = Lsb)]
pub struct Rflags {
    /// Carry Flag
    pub cf_carry: bool, // 0

    /// Always 1 in 64-bit mode.
    #[bits(default = true)]
    _always1: bool, // 1

    /// Parity Flag
    pub pf_parity: bool, // 2

    #[bits(default = false)]
    _rsvd3: bool, // 3

    /// Adjust Flag
    pub af_adjust: bool, // 4

    #[bits(default = false)]
    _rsvd5: bool, // 5

    /// Zero Flag
    pub zf_zero: bool, // 6

    /// Sign Flag
    pub sf_sign: bool, // 7

    /// Trap Flag
    pub tf_trap: bool, // 8

    /// Interrupt Enable Flag
    pub if_interrupt_enable: bool, // 9

    /// Direction Flag
    pub df_direction: bool, // 10

    /// Overflow Flag
    pub of_overflow: bool, // 11

    /// I/O Privilege Level
    #[bits(2)]
    pub iopl: u8, // 12–13

    /// Nested Task
    pub nt_nested: bool, // 14

    #[bits(default = false)]
    _rsvd15: bool, // 15

    /// Resume Flag
    pub rf_resume: bool, // 16

    #[bits(default = false)]
    _vm: bool, // 17

    /// Alignment Check
    pub ac_alignment_check: bool, // 18

    /// Virtual Interrupt Flag
    pub vif_virtual_interrupt: bool, // 19

    /// Virtual Interrupt Pending
    pub vip_virtual_interrupt_pending: bool, // 20

    /// ID Flag
    pub id_cpuid: bool, // 21

    #[bits(42, default = false)]
    _reserved_rest: u64,
}

#[cfg(target_arch = "x86_64")]
impl LoadRegister for Rflags {
    #[inline]
    fn load() -> Self {
        let r: u64;
        // SAFETY: pushfq/pop is unprivileged and leaves the stack balanced.
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags));
        }
        Self::from_bits(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_flag_is_bit_nine() {
        let flags = Rflags::from_bits(1 << 9);
        assert!(flags.if_interrupt_enable());
        assert!(!Rflags::from_bits(0).if_interrupt_enable());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn user_mode_runs_with_interrupts_enabled() {
        assert!(Rflags::load().if_interrupt_enable());
    }
}
