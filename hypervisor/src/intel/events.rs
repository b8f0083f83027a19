//! This module provides utilities and structures to manage event injection in VMX.
//! It tracks the one event whose delivery a VM exit interrupted, turns queued
//! traps into entry interruption words, and falls back to delivering through
//! the guest's IVT while real mode runs as virtual-8086 mode.

use {
    crate::{
        intel::{
            context::GuestCpuContext,
            dirty::GuestStateChanges,
            realmode::{inject_real_mode_event, RealModeDelivery},
            support::VmxSupport,
            vcpu::VirtualCpu,
            vmerror::{ExceptionInterrupt, InterruptionType},
        },
        services::{MemoryError, QueuedTrap, TrapKind, TrapQueue, GuestMemory},
    },
    bitfield::bitfield,
    log::*,
    x86::vmx::vmcs::{self, control::PrimaryControls},
};

bitfield! {
    /// Represents the VM-Entry Interruption-Information Field.
    ///
    /// The IDT-vectoring information and VM-exit interruption information fields share this layout.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.8.3 VM-Entry Controls for Event Injection
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EventInjection(u32);

    impl Debug;

    /// Vector of interrupt or exception
    pub get_vector, set_vector: 7, 0;

    /// Interruption type:
    /// 0: External interrupt
    /// 1: Reserved
    /// 2: Non-maskable interrupt (NMI)
    /// 3: Hardware exception (e.g,. #PF)
    /// 4: Software interrupt (INT n)
    /// 5: Privileged software exception (INT1)
    /// 6: Software exception (INT3 or INTO)
    /// 7: Other event
    pub get_type, set_type: 10, 8;

    /// Deliver error code (0 = do not deliver; 1 = deliver)
    pub get_deliver_error_code, set_deliver_error_code: 11, 11;

    // Reserved: 30:12

    /// Valid
    pub get_valid, set_valid: 31, 31;
}

const VALID: u32 = 1;

/// Bits 30:12 are reserved in the entry field but carry NMI-unblocking state in the exit fields.
const RESERVED_BITS: u32 = 0x7FFF_F000;

impl EventInjection {
    /// Builds a valid interruption word.
    pub fn new(vector: u8, kind: InterruptionType, deliver_error_code: bool) -> Self {
        let mut event = EventInjection(0);

        event.set_vector(vector as u32);
        event.set_type(kind as u32);
        event.set_deliver_error_code(deliver_error_code as u32);
        event.set_valid(VALID);

        event
    }

    /// General Protection (#GP) with an error code.
    pub fn general_protection() -> u32 {
        Self::new(ExceptionInterrupt::GeneralProtectionFault as u8, InterruptionType::HardwareException, true).0
    }

    /// Page Fault (#PF) with an error code.
    pub fn page_fault() -> u32 {
        Self::new(ExceptionInterrupt::PageFault as u8, InterruptionType::HardwareException, true).0
    }

    /// Undefined Opcode (#UD).
    pub fn undefined_opcode() -> u32 {
        Self::new(ExceptionInterrupt::InvalidOpcode as u8, InterruptionType::HardwareException, false).0
    }

    /// Debug (#DB) raised by a hardware breakpoint match.
    pub fn debug() -> u32 {
        Self::new(ExceptionInterrupt::Debug as u8, InterruptionType::HardwareException, false).0
    }

    /// Non-maskable interrupt, always vector 2.
    pub fn nmi() -> u32 {
        Self::new(ExceptionInterrupt::NonMaskableInterrupt as u8, InterruptionType::NonMaskableInterrupt, false).0
    }

    pub fn external_interrupt(vector: u8) -> u32 {
        Self::new(vector, InterruptionType::ExternalInterrupt, false).0
    }

    /// Hardware exception; the error code bit follows the architectural vector table.
    pub fn hardware_exception(vector: u8) -> u32 {
        Self::new(vector, InterruptionType::HardwareException, ExceptionInterrupt::has_error_code(vector)).0
    }

    /// `INT3`/`INTO` are software exceptions, every other `INT n` a software interrupt.
    pub fn software_interrupt(vector: u8) -> u32 {
        let kind = match vector {
            3 | 4 => InterruptionType::SoftwareException,
            _ => InterruptionType::SoftwareInterrupt,
        };
        Self::new(vector, kind, false).0
    }
}

/// An interruption word together with its error code and instruction length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    pub info: u32,
    pub error_code: u32,
    /// Only meaningful for software interrupts and exceptions.
    pub instruction_length: u32,
}

impl PendingEvent {
    pub const fn new(info: u32, error_code: u32, instruction_length: u32) -> Self {
        Self { info, error_code, instruction_length }
    }

    /// Captures an event whose delivery the last VM exit interrupted.
    ///
    /// Software interrupts and exceptions are dropped since restarting the instruction
    /// raises them again; so are words with an unknown type.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 28.2.4 Information for VM Exits During Event Delivery
    pub fn from_idt_vectoring(info: u32, error_code: u32, instruction_length: u32) -> Option<Self> {
        let word = EventInjection(info);
        if word.get_valid() != VALID {
            return None;
        }

        match InterruptionType::from_u32(word.get_type()) {
            Some(InterruptionType::ExternalInterrupt) | Some(InterruptionType::NonMaskableInterrupt) | Some(InterruptionType::HardwareException) => {}
            _ => return None,
        }

        Some(Self::new(info & !RESERVED_BITS, error_code, instruction_length))
    }

    /// Builds the entry word for a trap taken off the queue.
    pub fn from_trap(trap: &QueuedTrap) -> Self {
        match trap.kind {
            TrapKind::HardwareInterrupt => Self::new(EventInjection::external_interrupt(trap.vector), 0, 0),
            TrapKind::SoftwareInterrupt => Self::new(EventInjection::software_interrupt(trap.vector), 0, trap.instruction_length),
            TrapKind::Exception if trap.vector == ExceptionInterrupt::NonMaskableInterrupt as u8 => Self::new(EventInjection::nmi(), 0, 0),
            TrapKind::Exception => {
                let mut word = EventInjection::new(trap.vector, InterruptionType::HardwareException, false);
                if ExceptionInterrupt::has_error_code(trap.vector) {
                    word.set_deliver_error_code(1);
                }
                Self::new(word.0, trap.error_code.unwrap_or(0), 0)
            }
        }
    }

    pub fn vector(&self) -> u8 {
        EventInjection(self.info).get_vector() as u8
    }

    pub fn interruption_type(&self) -> Option<InterruptionType> {
        InterruptionType::from_u32(EventInjection(self.info).get_type())
    }

    pub fn delivers_error_code(&self) -> bool {
        EventInjection(self.info).get_deliver_error_code() != 0
    }

    pub fn is_software(&self) -> bool {
        matches!(
            self.interruption_type(),
            Some(InterruptionType::SoftwareInterrupt) | Some(InterruptionType::SoftwareException) | Some(InterruptionType::PrivilegedSoftwareException)
        )
    }

    pub fn is_hardware_exception(&self) -> bool {
        self.interruption_type() == Some(InterruptionType::HardwareException)
    }
}

/// Why an event could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionError {
    /// Real-mode delivery of #DF failed as well.
    ResetRequested,
    /// The IVT or the guest stack is not backed by memory.
    GuestMemory(MemoryError),
}

fn is_contributory(vector: u8) -> bool {
    matches!(vector, 0 | 10 | 11 | 12 | 13)
}

/// Outcome of raising an exception while another event was being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reflection {
    Inject(PendingEvent),
    /// The first event was #DF: the guest triple faults.
    TripleFault,
}

/// Combines an exception with the event whose delivery raised it.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 6-5. Conditions for Generating a Double Fault
pub fn reflect_exception(vector: u8, error_code: u32, interrupted: Option<PendingEvent>) -> Reflection {
    let second = PendingEvent::new(EventInjection::hardware_exception(vector), error_code, 0);

    let Some(first) = interrupted.filter(PendingEvent::is_hardware_exception) else {
        return Reflection::Inject(second);
    };

    let first_vector = first.vector();
    let page_fault = ExceptionInterrupt::PageFault as u8;
    let second_is_serious = is_contributory(vector) || vector == page_fault;

    if first_vector == ExceptionInterrupt::DoubleFault as u8 && second_is_serious {
        return Reflection::TripleFault;
    }

    if (is_contributory(first_vector) && is_contributory(vector)) || (first_vector == page_fault && second_is_serious) {
        trace!("#{} during delivery of #{} escalates to #DF", vector, first_vector);
        return Reflection::Inject(PendingEvent::new(EventInjection::hardware_exception(ExceptionInterrupt::DoubleFault as u8), 0, 0));
    }

    Reflection::Inject(second)
}

/// Arms or disarms interrupt-window exiting.
pub fn set_interrupt_window<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, enabled: bool) {
    let bit = PrimaryControls::INTERRUPT_WINDOW_EXITING.bits();
    let procbased = if enabled { vcpu.controls.procbased | bit } else { vcpu.controls.procbased & !bit };

    if procbased == vcpu.controls.procbased || (enabled && !vcpu.caps.procbased.can_set(bit)) {
        return;
    }

    vcpu.controls.procbased = procbased;
    vcpu.field_cache.write(support, vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, procbased as u64);
}

/// Hands `event` to the hardware, or delivers it by hand while real mode is emulated.
pub fn inject_event<S: VmxSupport, M: GuestMemory + ?Sized>(vcpu: &mut VirtualCpu, support: &mut S, memory: &mut M, ctx: &mut GuestCpuContext, event: PendingEvent) -> Result<(), InjectionError> {
    if vcpu.real_mode.emulating {
        let software = event.is_software();
        let result = inject_real_mode_event(memory, ctx, event.vector(), software, event.instruction_length);
        vcpu.mark_dirty(GuestStateChanges::RIP | GuestStateChanges::RSP | GuestStateChanges::RFLAGS | GuestStateChanges::SEGMENTS);

        return match result {
            RealModeDelivery::Delivered(vector) => {
                trace!("Delivered vector {:#x} through the real-mode IVT", vector);
                Ok(())
            }
            RealModeDelivery::ResetRequested => Err(InjectionError::ResetRequested),
            RealModeDelivery::MemoryFault(e) => Err(InjectionError::GuestMemory(e)),
        };
    }

    trace!("Injecting event: info={:#x} error_code={:#x}", event.info, event.error_code);

    vcpu.field_cache.write(support, vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event.info as u64);
    if event.delivers_error_code() {
        vcpu.field_cache.write(support, vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, event.error_code as u64);
    }
    if event.is_software() {
        vcpu.field_cache.write(support, vmcs::control::VMENTRY_INSTRUCTION_LEN, event.instruction_length as u64);
    }
    vcpu.injected_event = Some(event);

    Ok(())
}

/// Decides which event, if any, the next VM entry delivers.
///
/// An interrupted delivery always goes first. Otherwise an NMI beats a maskable
/// interrupt, and a maskable interrupt is only acknowledged once the guest can take it.
/// A queued trap of any kind waits for RFLAGS.IF and the end of an STI/MOV SS shadow;
/// until then an interrupt window is armed.
pub fn evaluate_pending_events<S, V>(vcpu: &mut VirtualCpu, support: &mut S, services: &mut V, ctx: &mut GuestCpuContext) -> Result<(), InjectionError>
where
    S: VmxSupport,
    V: TrapQueue + GuestMemory + ?Sized,
{
    vcpu.injected_event = None;

    if let Some(event) = vcpu.pending_event.take() {
        trace!("Re-injecting interrupted event {:#x}", event.info);
        return inject_event(vcpu, support, services, ctx, event);
    }

    let deliverable = ctx.interrupts_enabled() && !ctx.interrupts_inhibited();

    if !services.has_trap() {
        if services.nmi_pending() {
            services.take_nmi();
            return inject_event(vcpu, support, services, ctx, PendingEvent::new(EventInjection::nmi(), 0, 0));
        }

        if services.interrupt_pending() {
            if deliverable {
                if let Some(vector) = services.get_interrupt() {
                    services.assert_trap(QueuedTrap::interrupt(vector));
                }
            } else {
                set_interrupt_window(vcpu, support, true);
            }
        }
    }

    let Some(trap) = services.query_trap() else {
        return Ok(());
    };

    if !deliverable {
        trace!("Holding back {:?} vector {:#x} until the guest can take it", trap.kind, trap.vector);
        set_interrupt_window(vcpu, support, true);
        return Ok(());
    }

    services.reset_trap();

    if trap.vector == ExceptionInterrupt::PageFault as u8 && trap.kind == TrapKind::Exception {
        if let Some(address) = trap.fault_address {
            ctx.regs.cr2 = address;
        }
    }

    inject_event(vcpu, support, services, ctx, PendingEvent::from_trap(&trap))
}
