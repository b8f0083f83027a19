//! Real-address mode run as virtual-8086 mode.
//!
//! Without unrestricted-guest support, VMX cannot run real mode natively. The
//! guest runs as a virtual-8086 task instead, and events it must see are
//! delivered by hand through its interrupt vector table, since hardware
//! injection would go through the protected-mode IDT.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.3.1.2 Checks on Guest Segment Registers

use {
    crate::{
        intel::{
            context::{GuestCpuContext, SegmentRegister, ACCESS_RIGHTS_UNUSABLE},
            vmerror::ExceptionInterrupt,
        },
        services::{GuestMemory, MemoryError},
    },
    bit_field::BitField,
    x86_64::registers::rflags::RFlags,
};

/// Access rights every segment must carry in virtual-8086 mode: present, DPL 3, read/write data, accessed.
pub const V86_ACCESS_RIGHTS: u32 = 0xF3;

/// Busy 32-bit TSS, present.
pub const BUSY_TSS_ACCESS_RIGHTS: u32 = 0x8B;

/// RFLAGS bits owned by the emulation while real mode runs as virtual-8086 mode.
pub const EMULATION_RFLAGS: u64 = RFlags::VIRTUAL_8086_MODE.bits() | RFlags::IOPL_HIGH.bits() | RFlags::IOPL_LOW.bits();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RealModeState {
    /// Real mode currently runs as virtual-8086 mode.
    pub emulating: bool,
    /// The guest's own VM and IOPL bits while they are hidden.
    pub saved_rflags: u64,
    /// Real mode was active at the previous full load.
    pub was_real_mode: bool,
}

impl RealModeState {
    /// Hides the guest's VM/IOPL bits behind VM=1, IOPL=0.
    pub fn mask_rflags(&mut self, rflags: u64) -> u64 {
        self.saved_rflags = rflags & EMULATION_RFLAGS;
        (rflags & !EMULATION_RFLAGS) | RFlags::VIRTUAL_8086_MODE.bits()
    }

    /// Puts the guest's own VM/IOPL bits back.
    pub fn unmask_rflags(&self, rflags: u64) -> u64 {
        (rflags & !EMULATION_RFLAGS) | self.saved_rflags
    }
}

/// Segment as virtual-8086 mode requires it for `selector`.
pub fn v86_segment(selector: u16) -> SegmentRegister {
    SegmentRegister::new(selector, (selector as u64) << 4, 0xFFFF, V86_ACCESS_RIGHTS)
}

/// Keeps the granularity bit consistent with the limit.
pub fn normalize_granularity(segment: &mut SegmentRegister) {
    if segment.access_rights & ACCESS_RIGHTS_UNUSABLE != 0 {
        return;
    }
    if segment.limit & 0xFFF != 0xFFF {
        segment.access_rights.set_bit(15, false);
    }
    if segment.limit >> 20 != 0 {
        segment.access_rights.set_bit(15, true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRole {
    Code,
    Stack,
    Data,
}

/// Rewrites descriptor state that real mode leaves inconsistent once CR0.PE is set but
/// the segment registers have not been reloaded yet.
pub fn fixup_after_real_mode(segment: &mut SegmentRegister, role: SegmentRole) {
    if segment.access_rights & ACCESS_RIGHTS_UNUSABLE != 0 {
        return;
    }

    let rpl = (segment.selector & 3) as u32;
    match role {
        SegmentRole::Code => {
            segment.set_dpl(rpl);
            if !segment.access_rights.get_bit(3) {
                // execute/read, accessed
                segment.access_rights.set_bits(0..4, 0xB);
            }
        }
        SegmentRole::Stack => segment.set_dpl(rpl),
        SegmentRole::Data => {
            if segment.dpl() < rpl {
                segment.set_dpl(rpl);
            }
        }
    }
    normalize_granularity(segment);
}

/// Result of delivering an event through the real-mode IVT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealModeDelivery {
    /// Handler entered for this vector (after any escalation).
    Delivered(u8),
    /// Not even #DF fits in the IVT: the machine must reset.
    ResetRequested,
    MemoryFault(MemoryError),
}

fn push_word<M: GuestMemory + ?Sized>(memory: &mut M, ctx: &mut GuestCpuContext, value: u16) -> Result<(), MemoryError> {
    let sp = (ctx.regs.rsp as u16).wrapping_sub(2);
    memory.write_phys(ctx.ss.base.wrapping_add(sp as u64), &value.to_le_bytes())?;
    ctx.regs.rsp = (ctx.regs.rsp & !0xFFFF) | sp as u64;
    Ok(())
}

/// Delivers `vector` the way a real-mode CPU would: check the IVT limit, push
/// FLAGS, CS and IP, then jump to the handler.
///
/// A vector outside the IVT raises #GP; a #GP outside it raises #DF; a #DF outside it resets.
pub fn inject_real_mode_event<M: GuestMemory + ?Sized>(memory: &mut M, ctx: &mut GuestCpuContext, vector: u8, software: bool, instruction_length: u32) -> RealModeDelivery {
    let mut vector = vector;
    let mut software = software;

    loop {
        if vector as u64 * 4 + 3 <= ctx.idtr.limit as u64 {
            break;
        }
        vector = match ExceptionInterrupt::from_u32(vector as u32) {
            Some(ExceptionInterrupt::DoubleFault) => return RealModeDelivery::ResetRequested,
            Some(ExceptionInterrupt::GeneralProtectionFault) => ExceptionInterrupt::DoubleFault as u8,
            _ => ExceptionInterrupt::GeneralProtectionFault as u8,
        };
        software = false;
    }

    let mut entry = [0u8; 4];
    if let Err(e) = memory.read_phys(ctx.idtr.base + vector as u64 * 4, &mut entry) {
        return RealModeDelivery::MemoryFault(e);
    }
    let offset = u16::from_le_bytes([entry[0], entry[1]]);
    let selector = u16::from_le_bytes([entry[2], entry[3]]);

    let mut ip = ctx.regs.rip as u16;
    if software {
        ip = ip.wrapping_add(instruction_length as u16);
    }

    let pushes = [ctx.regs.rflags as u16, ctx.cs.selector, ip];
    for value in pushes {
        if let Err(e) = push_word(memory, ctx, value) {
            return RealModeDelivery::MemoryFault(e);
        }
    }

    ctx.cs.selector = selector;
    ctx.cs.base = (selector as u64) << 4;
    ctx.regs.rip = offset as u64;
    ctx.regs.rflags &= !(RFlags::INTERRUPT_FLAG | RFlags::TRAP_FLAG | RFlags::RESUME_FLAG | RFlags::ALIGNMENT_CHECK).bits();
    ctx.interrupt_inhibit_pc = None;

    RealModeDelivery::Delivered(vector)
}
