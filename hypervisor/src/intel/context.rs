//! The canonical guest CPU context.
//!
//! The context is owned by the caller (the generic CPU-context manager); the
//! engine reads it before every entry and writes it back after every exit.

use {
    crate::intel::capture::GuestRegisters,
    bit_field::BitField,
    x86_64::registers::{
        control::{Cr0Flags, Cr4Flags},
        model_specific::EferFlags,
        rflags::RFlags,
    },
};

/// Access-rights word as laid out in the VMCS (bits 7:0 type/S/DPL/P, 15:12 AVL/L/D/B/G).
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-2. Format of Access Rights
pub const ACCESS_RIGHTS_UNUSABLE: u32 = 1 << 16;

/// One hidden segment register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}

impl SegmentRegister {
    pub const fn new(selector: u16, base: u64, limit: u32, access_rights: u32) -> Self {
        Self {
            selector,
            base,
            limit,
            access_rights,
        }
    }

    pub fn segment_type(&self) -> u32 {
        self.access_rights.get_bits(0..4)
    }

    pub fn dpl(&self) -> u32 {
        self.access_rights.get_bits(5..7)
    }

    pub fn set_dpl(&mut self, dpl: u32) {
        self.access_rights.set_bits(5..7, dpl);
    }

    pub fn is_present(&self) -> bool {
        self.access_rights.get_bit(7)
    }

    pub fn is_long_mode_code(&self) -> bool {
        self.access_rights.get_bit(13)
    }
}

/// GDTR or IDTR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u32,
}

/// Everything the engine transfers between the caller and the VMCS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestCpuContext {
    pub regs: GuestRegisters,

    pub es: SegmentRegister,
    pub cs: SegmentRegister,
    pub ss: SegmentRegister,
    pub ds: SegmentRegister,
    pub fs: SegmentRegister,
    pub gs: SegmentRegister,
    pub ldtr: SegmentRegister,
    pub tr: SegmentRegister,

    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,

    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,

    /// DR0-DR3 in slots 0-3, DR6 in 6 and DR7 in 7; slots 4 and 5 alias nothing.
    pub dr: [u64; 8],

    pub efer: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_eip: u64,
    pub sysenter_esp: u64,

    pub pdpte: [u64; 4],

    /// Interrupts are inhibited until the instruction at this RIP retires (STI / MOV SS shadow).
    pub interrupt_inhibit_pc: Option<u64>,
}

impl GuestCpuContext {
    pub fn cr0_flags(&self) -> Cr0Flags {
        Cr0Flags::from_bits_retain(self.cr0)
    }

    pub fn cr4_flags(&self) -> Cr4Flags {
        Cr4Flags::from_bits_retain(self.cr4)
    }

    pub fn rflags(&self) -> RFlags {
        RFlags::from_bits_retain(self.regs.rflags)
    }

    pub fn is_real_mode(&self) -> bool {
        !self.cr0_flags().contains(Cr0Flags::PROTECTED_MODE_ENABLE)
    }

    pub fn is_v86_mode(&self) -> bool {
        !self.is_real_mode() && self.rflags().contains(RFlags::VIRTUAL_8086_MODE)
    }

    pub fn is_paging_enabled(&self) -> bool {
        self.cr0_flags().contains(Cr0Flags::PAGING)
    }

    pub fn is_long_mode(&self) -> bool {
        EferFlags::from_bits_retain(self.efer).contains(EferFlags::LONG_MODE_ACTIVE)
    }

    /// 64-bit submode of long mode (CS.L set).
    pub fn is_64bit_code(&self) -> bool {
        self.is_long_mode() && self.cs.is_long_mode_code()
    }

    /// Legacy PAE paging, which loads PDPTEs from CR3 instead of walking a PML4.
    pub fn is_pae_paging(&self) -> bool {
        self.is_paging_enabled() && self.cr4_flags().contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION) && !self.is_long_mode()
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.rflags().contains(RFlags::INTERRUPT_FLAG)
    }

    /// STI/MOV SS shadow still covers the current instruction.
    pub fn interrupts_inhibited(&self) -> bool {
        self.interrupt_inhibit_pc == Some(self.regs.rip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_helpers_follow_control_registers() {
        let mut ctx = GuestCpuContext::default();
        assert!(ctx.is_real_mode());

        ctx.cr0 = (Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::PAGING).bits();
        ctx.cr4 = Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits();
        assert!(ctx.is_pae_paging());

        ctx.efer = (EferFlags::LONG_MODE_ENABLE | EferFlags::LONG_MODE_ACTIVE).bits();
        ctx.cs.access_rights = 0xA09B;
        assert!(!ctx.is_pae_paging());
        assert!(ctx.is_64bit_code());
    }

    #[test]
    fn inhibit_only_covers_the_recorded_instruction() {
        let mut ctx = GuestCpuContext::default();
        ctx.regs.rip = 0x1000;
        ctx.interrupt_inhibit_pc = Some(0x1000);
        assert!(ctx.interrupts_inhibited());

        ctx.regs.rip = 0x1001;
        assert!(!ctx.interrupts_inhibited());
    }
}
