//! # Boot Memory Handoff
//!
//! The bootloader describes physical memory once, as an ordered list of
//! [`MemoryMapEntry`] values, and tells the kernel where its executable image
//! was loaded ([`ExecutableLocation`]). Both are plain data and safe to copy.

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, align_down, align_up};

/// Classification of a memory map entry.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemoryKind {
    /// Free RAM, owned by the frame allocator after boot.
    Usable = 0,
    /// Firmware-reserved; never touched.
    Reserved = 1,
    /// ACPI tables; reclaimable once parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// Defective RAM.
    BadMemory = 4,
    /// Loader data structures; reclaimable once the kernel stops using them.
    BootloaderReclaimable = 5,
    /// The kernel image and boot modules.
    ExecutableAndModules = 6,
    /// Linear framebuffer.
    Framebuffer = 7,
}

impl MemoryKind {
    /// Whether frames of this kind are handed to the frame allocator.
    #[inline]
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }

    /// Whether the kernel keeps an HHDM alias of this kind of memory.
    #[inline]
    #[must_use]
    pub const fn is_direct_mapped(self) -> bool {
        matches!(
            self,
            Self::Usable | Self::BootloaderReclaimable | Self::ExecutableAndModules | Self::Framebuffer
        )
    }
}

/// One `(base, length, kind)` record of the boot memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: PhysicalAddress,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[inline]
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            length,
            kind,
        }
    }

    /// First byte past the entry (saturating).
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64().saturating_add(self.length)
    }

    /// Index range of the frames lying *entirely* inside this entry.
    ///
    /// ```rust
    /// # use kernel_info::boot::{MemoryKind, MemoryMapEntry};
    /// let e = MemoryMapEntry::new(0x1800, 0x3000, MemoryKind::Usable);
    /// assert_eq!(e.whole_frames(), 2..4);
    /// ```
    #[inline]
    #[must_use]
    pub const fn whole_frames(&self) -> core::ops::Range<u64> {
        let start = align_up(self.base.as_u64(), PAGE_SIZE) / PAGE_SIZE;
        let end = align_down(self.end(), PAGE_SIZE) / PAGE_SIZE;
        if end > start { start..end } else { start..start }
    }

    /// Index range of every frame this entry touches, even partially.
    #[inline]
    #[must_use]
    pub const fn touched_frames(&self) -> core::ops::Range<u64> {
        let start = align_down(self.base.as_u64(), PAGE_SIZE) / PAGE_SIZE;
        let end = align_up(self.end(), PAGE_SIZE) / PAGE_SIZE;
        start..end
    }
}

/// Where the bootloader placed the kernel image.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExecutableLocation {
    pub physical_base: PhysicalAddress,
    pub virtual_base: VirtualAddress,
}
