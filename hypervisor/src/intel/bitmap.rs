//! The VMX MSR permission bitmap.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.9 MSR-Bitmap Address

use {crate::intel::page::PhysPage, bit_field::BitField};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrAccessType {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrOperation {
    /// Cause a VM exit on access.
    Hook,
    /// Let the guest access the MSR directly.
    Unhook,
}

const READ_LOW: usize = 0x000;
const READ_HIGH: usize = 0x400;
const WRITE_LOW: usize = 0x800;
const WRITE_HIGH: usize = 0xC00;

/// Byte offset and bit inside the bitmap page for `msr`, `None` for MSRs outside both ranges (always intercepted).
fn locate(msr: u32, access: MsrAccessType) -> Option<(usize, usize)> {
    let (base, index) = match msr {
        0x0000_0000..=0x0000_1FFF => (if access == MsrAccessType::Read { READ_LOW } else { WRITE_LOW }, msr),
        0xC000_0000..=0xC000_1FFF => (if access == MsrAccessType::Read { READ_HIGH } else { WRITE_HIGH }, msr - 0xC000_0000),
        _ => return None,
    };
    Some((base + (index as usize >> 3), index as usize & 7))
}

/// Typed view over the bitmap page owned by a VCPU.
pub struct MsrBitmap<'a> {
    page: &'a mut PhysPage,
}

impl<'a> MsrBitmap<'a> {
    pub fn new(page: &'a mut PhysPage) -> Self {
        Self { page }
    }

    /// Sets every bit so all RDMSR/WRMSR instructions exit.
    pub fn intercept_all(&mut self) {
        self.page.as_mut_slice().fill(0xFF);
    }

    pub fn modify_msr_interception(&mut self, msr: u32, access: MsrAccessType, operation: MsrOperation) {
        let Some((offset, bit)) = locate(msr, access) else {
            return;
        };
        let mut byte = self.page.read_u8(offset);
        byte.set_bit(bit, operation == MsrOperation::Hook);
        self.page.write_u8(offset, byte);
    }

    /// Convenience for MSRs the guest may both read and write freely.
    pub fn passthrough(&mut self, msr: u32) {
        self.modify_msr_interception(msr, MsrAccessType::Read, MsrOperation::Unhook);
        self.modify_msr_interception(msr, MsrAccessType::Write, MsrOperation::Unhook);
    }

    pub fn is_intercepted(&self, msr: u32, access: MsrAccessType) -> bool {
        match locate(msr, access) {
            Some((offset, bit)) => self.page.read_u8(offset).get_bit(bit),
            None => true,
        }
    }
}
