//! Port I/O exits.
//!
//! Every port access exits (unconditional I/O exiting). The access is handed to
//! the port dispatcher; completed accesses are checked against the guest's I/O
//! breakpoints afterwards.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 18.2.4 Debug Control Register (DR7)

use {
    crate::{
        intel::{
            events::{EventInjection, PendingEvent},
            support::VmxSupport,
            vmerror::IoExitQualification,
            vmexit::{ExitContext, ExitType},
        },
        services::{IoAccess, IoOutcome, VcpuServices},
        vmm::Disposition,
    },
    bit_field::BitField,
    log::*,
    x86_64::registers::control::Cr4Flags,
};

fn size_mask(size: u8) -> u64 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

pub fn handle_io_instruction<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>) -> ExitType {
    let qualification = IoExitQualification(exit_ctx.exit.qualification);
    let access = IoAccess {
        port: qualification.port() as u16,
        size: qualification.access_size(),
        input: qualification.direction_in() == 1,
        string: qualification.string() == 1,
        rep: qualification.rep() == 1,
    };

    trace!("I/O {:?} at RIP {:#x}", access, exit_ctx.ctx.regs.rip);

    if access.string {
        return match exit_ctx.services.string_io(access, exit_ctx.ctx) {
            IoOutcome::Done(()) => {
                exit_ctx.context_handed_out();
                complete(exit_ctx, access)
            }
            IoOutcome::Deferred => ExitType::Return(Disposition::EmulateInstruction),
        };
    }

    let mask = size_mask(access.size);
    if access.input {
        match exit_ctx.services.read_port(access.port, access.size) {
            IoOutcome::Done(value) => {
                let rax = exit_ctx.ctx.regs.rax;
                // A 32-bit IN zero-extends into RAX; narrower ones merge.
                exit_ctx.ctx.regs.rax = if access.size == 4 { value as u64 } else { (rax & !mask) | (value as u64 & mask) };
                complete(exit_ctx, access)
            }
            IoOutcome::Deferred => ExitType::Return(Disposition::EmulateIoPort),
        }
    } else {
        let value = (exit_ctx.ctx.regs.rax & mask) as u32;
        match exit_ctx.services.write_port(access.port, access.size, value) {
            IoOutcome::Done(()) => complete(exit_ctx, access),
            IoOutcome::Deferred => ExitType::Return(Disposition::EmulateIoPort),
        }
    }
}

/// Finishes a serviced access: skips the instruction and raises #DB on an I/O breakpoint hit.
fn complete<S: VmxSupport, V: VcpuServices + ?Sized>(exit_ctx: &mut ExitContext<'_, S, V>, access: IoAccess) -> ExitType {
    let dr7 = exit_ctx.ctx.dr[7];
    if !exit_ctx.ctx.cr4_flags().contains(Cr4Flags::DEBUGGING_EXTENSIONS) || dr7 & 0xFF == 0 {
        return ExitType::IncrementRIP;
    }

    let addresses = if exit_ctx.vcpu.guest_debug_active { exit_ctx.support.read_debug_registers() } else { exit_ctx.ctx.dr };
    let hits = io_breakpoint_hits(dr7, &addresses, access.port, access.size);
    if hits == 0 {
        return ExitType::IncrementRIP;
    }

    debug!("I/O breakpoint hit on port {:#x}: {:#x}", access.port, hits);

    // #DB is a trap here: it is delivered after the instruction completes.
    exit_ctx.advance_rip();
    let dr6 = (exit_ctx.ctx.dr[6] & !0xF) | hits as u64 | 0xFFFF_0FF0;
    exit_ctx.ctx.dr[6] = dr6;
    if exit_ctx.vcpu.guest_debug_active {
        let mut registers = exit_ctx.support.read_debug_registers();
        registers[6] = dr6;
        exit_ctx.support.write_debug_registers(&registers);
    }

    exit_ctx.vcpu.pending_event = Some(PendingEvent::new(EventInjection::debug(), 0, 0));
    ExitType::Continue
}

/// DR6.B0-B3 bits for the enabled I/O breakpoints (R/W = 10b) that overlap `port..port + size`.
fn io_breakpoint_hits(dr7: u64, addresses: &[u64; 8], port: u16, size: u8) -> u32 {
    let first = port as u64;
    let last = first + size as u64 - 1;
    let mut hits = 0;

    for n in 0..4 {
        if dr7.get_bits(n * 2..n * 2 + 2) == 0 {
            continue;
        }
        let control = dr7.get_bits(16 + n * 4..20 + n * 4);
        if control & 0b11 != 0b10 {
            continue;
        }

        let length = match control >> 2 {
            0 => 1,
            1 => 2,
            2 => 8,
            _ => 4,
        };
        let start = addresses[n] & 0xFFFF & !(length - 1);
        let end = start + length - 1;

        if start <= last && first <= end {
            hits |= 1 << n;
        }
    }

    hits
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            intel::{context::GuestCpuContext, vmexit::ExitRecord},
            testing::{test_vcpu, MockServices, SimulatedCpu},
        },
    };

    fn io_exit(port: u16, size: u8, input: bool) -> ExitRecord {
        let size_encoding = match size {
            1 => 0,
            2 => 1,
            _ => 3,
        };
        ExitRecord {
            reason: 30,
            qualification: size_encoding | ((input as u64) << 3) | ((port as u64) << 16),
            instruction_length: 1,
            ..Default::default()
        }
    }

    #[test]
    fn byte_input_merges_into_al() {
        let mut cpu = SimulatedCpu::new();
        let mut vcpu = test_vcpu(&mut cpu);
        let mut services = MockServices::new();
        services.ports.insert(0x60, 0x1C);
        let mut ctx = GuestCpuContext::default();
        ctx.regs.rax = 0xFFFF_FFFF_FFFF_FF00;

        let mut exit_ctx = ExitContext { vcpu: &mut vcpu, support: &mut cpu, services: &mut services, ctx: &mut ctx, exit: io_exit(0x60, 1, true) };
        assert_eq!(handle_io_instruction(&mut exit_ctx), ExitType::IncrementRIP);
        assert_eq!(exit_ctx.ctx.regs.rax, 0xFFFF_FFFF_FFFF_FF1C);
    }

    #[test]
    fn unknown_port_is_deferred_to_the_caller() {
        let mut cpu = SimulatedCpu::new();
        let mut vcpu = test_vcpu(&mut cpu);
        let mut services = MockServices::new();
        let mut ctx = GuestCpuContext::default();

        let mut exit_ctx = ExitContext { vcpu: &mut vcpu, support: &mut cpu, services: &mut services, ctx: &mut ctx, exit: io_exit(0x1234, 4, false) };
        assert_eq!(handle_io_instruction(&mut exit_ctx), ExitType::Return(Disposition::EmulateIoPort));
    }

    #[test]
    fn armed_io_breakpoint_raises_debug_trap() {
        let mut cpu = SimulatedCpu::new();
        let mut vcpu = test_vcpu(&mut cpu);
        let mut services = MockServices::new();
        services.ports.insert(0x3F8, 0);
        let mut ctx = GuestCpuContext::default();
        ctx.cr4 = Cr4Flags::DEBUGGING_EXTENSIONS.bits();
        ctx.regs.rip = 0x7C00;
        ctx.dr[1] = 0x3F8;
        // L1, R/W1 = 10b, LEN1 = 0
        ctx.dr[7] = (1 << 2) | (0b10 << 20);

        let mut exit_ctx = ExitContext { vcpu: &mut vcpu, support: &mut cpu, services: &mut services, ctx: &mut ctx, exit: io_exit(0x3F8, 1, false) };
        assert_eq!(handle_io_instruction(&mut exit_ctx), ExitType::Continue);
        assert_eq!(exit_ctx.ctx.regs.rip, 0x7C01);
        assert_eq!(exit_ctx.ctx.dr[6] & 0xF, 0b10);
        assert_eq!(exit_ctx.vcpu.pending_event.map(|event| event.info), Some(EventInjection::debug()));
    }

    #[test]
    fn breakpoint_length_covers_neighbouring_ports() {
        let mut addresses = [0u64; 8];
        addresses[0] = 0x71;
        // L0, R/W0 = 10b, LEN0 = 4 bytes (11b)
        let dr7 = 1 | (0b1110 << 16);
        assert_eq!(io_breakpoint_hits(dr7, &addresses, 0x72, 1), 1);
        assert_eq!(io_breakpoint_hits(dr7, &addresses, 0x74, 1), 0);
        // R/W = 01b is a data-write breakpoint, not an I/O one.
        assert_eq!(io_breakpoint_hits(1 | (0b1101 << 16), &addresses, 0x72, 1), 0);
    }
}
