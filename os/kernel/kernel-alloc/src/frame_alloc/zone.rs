use core::fmt;
use core::ops::Range;
use kernel_info::memory::{ZONE_DMA_END, ZONE_DMA32_END};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Physical address classes, split by what DMA engines can reach.
///
/// ```text
/// 0 ─────────── 16 MiB ─────────── 4 GiB ───────────────►
/// │    Dma      │      Dma32       │       Normal
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Zone {
    /// Below 16 MiB; legacy ISA DMA.
    Dma,
    /// Below 4 GiB; 32-bit DMA engines.
    Dma32,
    /// Everything else.
    Normal,
}

impl Zone {
    pub const ALL: [Self; 3] = [Self::Dma, Self::Dma32, Self::Normal];

    /// Order in which zone-agnostic requests are served, keeping low memory
    /// for callers that need it.
    pub const FALLBACK: [Self; 3] = [Self::Normal, Self::Dma32, Self::Dma];

    /// Frame indices belonging to this zone.
    #[must_use]
    pub const fn frames(self) -> Range<u64> {
        match self {
            Self::Dma => 0..ZONE_DMA_END / PAGE_SIZE,
            Self::Dma32 => ZONE_DMA_END / PAGE_SIZE..ZONE_DMA32_END / PAGE_SIZE,
            Self::Normal => ZONE_DMA32_END / PAGE_SIZE..u64::MAX / PAGE_SIZE,
        }
    }

    #[must_use]
    pub const fn containing(pa: PhysicalAddress) -> Self {
        Self::of_frame(pa.frame_index())
    }

    #[must_use]
    pub const fn of_frame(index: u64) -> Self {
        if index < ZONE_DMA_END / PAGE_SIZE {
            Self::Dma
        } else if index < ZONE_DMA32_END / PAGE_SIZE {
            Self::Dma32
        } else {
            Self::Normal
        }
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dma => "DMA",
            Self::Dma32 => "DMA32",
            Self::Normal => "Normal",
        })
    }
}

/// Frame counters of one zone. `used` is derived, so `free + used == total`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ZoneStats {
    pub total: u64,
    pub free: u64,
}

impl ZoneStats {
    #[inline]
    #[must_use]
    pub const fn used(&self) -> u64 {
        self.total - self.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_boundaries() {
        assert_eq!(Zone::containing(PhysicalAddress::new(0)), Zone::Dma);
        assert_eq!(Zone::containing(PhysicalAddress::new(0xFF_F000)), Zone::Dma);
        assert_eq!(Zone::containing(PhysicalAddress::new(0x100_0000)), Zone::Dma32);
        assert_eq!(Zone::containing(PhysicalAddress::new(0xFFFF_F000)), Zone::Dma32);
        assert_eq!(Zone::containing(PhysicalAddress::new(0x1_0000_0000)), Zone::Normal);
    }

    #[test]
    fn ranges_tile_the_frame_space() {
        assert_eq!(Zone::Dma.frames().end, Zone::Dma32.frames().start);
        assert_eq!(Zone::Dma32.frames().end, Zone::Normal.frames().start);
        for zone in Zone::ALL {
            assert_eq!(Zone::of_frame(zone.frames().start), zone);
        }
    }
}
