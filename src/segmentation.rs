use bitflags::bitflags;
use x86::segmentation::SegmentSelector;

bitflags! {
    /// Segment access rights in the VMCS layout (SDM Vol. 3C, Table 25-2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentAccessRights: u32 {
        const ACCESSED = 1 << 0;
        /// Readable for code segments, writable for data segments.
        const WRITABLE = 1 << 1;
        /// Conforming for code segments, expand-down for data segments.
        const CONFORMING = 1 << 2;
        const EXECUTABLE = 1 << 3;
        /// Code or data segment (the S bit).
        const CODE_DATA = 1 << 4;
        const DPL_RING_3 = 3 << 5;
        const PRESENT = 1 << 7;
        const AVAILABLE = 1 << 12;
        const LONG_MODE = 1 << 13;
        /// Default operation size.
        const DB = 1 << 14;
        const GRANULARITY = 1 << 15;
        /// The segment is unusable. Other bits are undefined when set.
        const UNUSABLE = 1 << 16;

        const TYPE_MASK = 0xf;
    }
}

impl SegmentAccessRights {
    /// Bits that keep their meaning for an unusable segment.
    const UNUSABLE_KEEP: Self = Self::UNUSABLE
        .union(Self::LONG_MODE)
        .union(Self::DB)
        .union(Self::GRANULARITY)
        .union(Self::DPL_RING_3)
        .union(Self::TYPE_MASK)
        .union(Self::CODE_DATA);

    /// Rights of a real-mode data segment after reset.
    pub const REAL_DATA: Self = Self::from_bits_truncate(0x93);
    /// Rights of the real-mode code segment after reset.
    pub const REAL_CODE: Self = Self::from_bits_truncate(0x9b);
    /// Rights of a busy 32-bit TSS.
    pub const TSS_BUSY: Self = Self::from_bits_truncate(0x8b);
    /// Rights of an LDT.
    pub const LDT: Self = Self::from_bits_truncate(0x82);
    /// Rights the processor requires for every segment in virtual-8086 mode.
    pub const V86: Self = Self::from_bits_truncate(0xf3);

    /// Normalizes rights read back from the VMCS: an unusable segment keeps
    /// only the architecturally defined bits.
    pub fn normalize_imported(raw: u32) -> Self {
        let rights = Self::from_bits_truncate(raw);
        if rights.contains(Self::UNUSABLE) {
            rights & Self::UNUSABLE_KEEP
        } else {
            rights
        }
    }

    pub fn dpl(&self) -> u8 {
        ((self.bits() >> 5) & 3) as u8
    }
}

/// A segment register as it is kept in the guest context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: SegmentSelector,
    pub base: u64,
    pub limit: u32,
    pub access_rights: SegmentAccessRights,
}

impl Segment {
    /// A real-mode data segment as found after reset.
    pub const fn real_mode_data() -> Self {
        Self {
            selector: SegmentSelector::from_raw(0),
            base: 0,
            limit: 0xffff,
            access_rights: SegmentAccessRights::REAL_DATA,
        }
    }

    pub const fn real_mode_code() -> Self {
        Self {
            access_rights: SegmentAccessRights::REAL_CODE,
            ..Self::real_mode_data()
        }
    }

    /// A real-mode segment with the given selector: base is `selector << 4`.
    pub const fn real_mode(selector: u16, access_rights: SegmentAccessRights) -> Self {
        Self {
            selector: SegmentSelector::from_raw(selector),
            base: (selector as u64) << 4,
            limit: 0xffff,
            access_rights,
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.access_rights.contains(SegmentAccessRights::UNUSABLE)
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            selector: SegmentSelector::from_raw(0),
            base: 0,
            limit: 0,
            access_rights: SegmentAccessRights::UNUSABLE,
        }
    }
}

/// GDTR or IDTR.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u32,
}
