//! Decoding of GDT descriptors, used to find the host TSS.

/// An 8-byte code/data descriptor, or a 16-byte system descriptor in long mode.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5 Segment Descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    low: u64,
    high: u64,
}

impl SegmentDescriptor {
    pub const fn from_raw(raw: [u64; 2]) -> Self {
        Self { low: raw[0], high: raw[1] }
    }

    /// S bit clear: TSS, LDT or gate.
    pub fn is_system(&self) -> bool {
        self.low & (1 << 44) == 0
    }

    pub fn is_present(&self) -> bool {
        self.low & (1 << 47) != 0
    }

    pub fn base(&self) -> u64 {
        let mut base = (self.low >> 16) & 0xFF_FFFF;
        base |= ((self.low >> 56) & 0xFF) << 24;

        // System descriptors take 16 bytes in long mode; bits 63:32 of the base live in the second half.
        if self.is_system() {
            base |= (self.high & 0xFFFF_FFFF) << 32;
        }
        base
    }

    /// Limit in bytes, expanded by the granularity bit.
    pub fn limit(&self) -> u32 {
        let mut limit = (self.low & 0xFFFF) | ((self.low >> 32) & 0xF_0000);

        if self.low & (1 << 55) != 0 {
            limit = (limit << 12) | 0xFFF;
        }

        limit as u32
    }

    /// Attribute bits in the VMCS access-rights layout.
    pub fn access_rights(&self) -> u32 {
        ((self.low >> 40) & 0xF0FF) as u32
    }
}
