//! Runs guest code on the current physical core until something needs the caller.
//!
//! One call to [`run_guest_code`] enters the guest, handles VM exits in place and
//! re-enters until an exit can only be serviced outside the engine. Each pass
//! through the loop is `Idle → Entering → InGuest → Exited → Dispatching`, and
//! dispatch either resumes immediately or hands a [`Disposition`] back.
//!
//! Nothing between disabling and restoring host interrupts may block, allocate or
//! log; everything that talks to the services happens before or after that window.

use {
    crate::{
        config::VIRTUAL_APIC_TPR_OFFSET,
        error::HypervisorError,
        intel::{
            context::GuestCpuContext,
            diagnostics::{dump_vmcs_state, VmEntryFailure},
            events::{evaluate_pending_events, InjectionError, PendingEvent},
            guest::{load_guest_state, save_guest_state, EntryInputs},
            host::save_host_state,
            percpu::PhysicalCore,
            support::VmxSupport,
            tlb::TlbFlush,
            vcpu::{RunState, VirtualCpu},
            vmerror::{VmxBasicExitReason, VmxFailure},
            vmexit::{dispatch, ExitContext, ExitRecord, ExitType},
        },
        services::{ActionFlags, VcpuServices},
    },
    log::*,
    x86::vmx::vmcs::{self, control::PrimaryControls},
};

/// Why [`run_guest_code`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A host interrupt arrived or the resume budget ran out.
    InterruptPending,
    /// A virtual timer expired.
    TimerPending,
    /// The VM or VCPU has pending actions for the host.
    ForcedAction(ActionFlags),
    /// The guest executed HLT with nothing to deliver.
    Halted,
    /// The instruction at RIP must be interpreted by the caller.
    EmulateInstruction,
    /// The port access at RIP must be completed by the caller.
    EmulateIoPort,
    /// A guest exception needs the caller's recompiler or interpreter.
    GuestTrap,
    /// The guest triple faulted.
    ResetRequested,
    /// Task switches are left to the interpreter.
    Interpret,
    /// Exit reason the engine does not handle.
    UnexpectedExit(u32),
    /// VM entry rejected the guest state.
    InvalidGuestState,
    /// VMLAUNCH/VMRESUME failed.
    WorldSwitchFailed,
    /// VM entry failed while loading MSRs.
    MsrLoadFailed,
    /// Engine bug or inconsistent state.
    InternalError,
}

/// What went wrong inside the interrupt-disabled window.
enum EntryError {
    Prepare(HypervisorError),
    Switch(VmxFailure),
}

/// Runs the guest until an exit must be handled by the caller.
///
/// # Arguments
///
/// - `vcpu`: The VCPU; its control block must be current on `core` (see [`crate::intel::host::enter`]).
/// - `core`: The physical core the calling thread is running on.
/// - `support`: Hardware access for that core.
/// - `services`: The VM's memory, interrupt, emulation, I/O and timer services.
/// - `ctx`: The guest CPU context, read before every entry and written after every exit.
///
/// # Returns
///
/// Why the guest stopped. The function never fails in any other way.
pub fn run_guest_code<S, V>(vcpu: &mut VirtualCpu, core: &PhysicalCore, support: &mut S, services: &mut V, ctx: &mut GuestCpuContext) -> Disposition
where
    S: VmxSupport,
    V: VcpuServices + ?Sized,
{
    if vcpu.active_core != Some(core.id) || vcpu.run_state != RunState::Idle {
        error!("VCPU {} is not ready to run on core {} ({:?})", vcpu.id, core.id, vcpu.run_state);
        return Disposition::InternalError;
    }

    let mut last_exit = None;
    let disposition = run_loop(vcpu, core, support, services, ctx, &mut last_exit);

    // A bare host interrupt leaves the guest state in the VMCS intact; only the host may have moved.
    let host_only = disposition == Disposition::InterruptPending && last_exit.is_some_and(|exit| exit.is_plain_external_interrupt());
    vcpu.host_state_stale = true;
    if !host_only {
        vcpu.mark_all_dirty();
    }
    vcpu.run_state = RunState::Idle;

    disposition
}

fn run_loop<S, V>(vcpu: &mut VirtualCpu, core: &PhysicalCore, support: &mut S, services: &mut V, ctx: &mut GuestCpuContext, last_exit: &mut Option<ExitRecord>) -> Disposition
where
    S: VmxSupport,
    V: VcpuServices + ?Sized,
{
    let mut loops = 0;

    loop {
        vcpu.run_state = RunState::Entering;

        loops += 1;
        if loops > vcpu.config.max_resume_loops {
            return Disposition::InterruptPending;
        }

        // The STI/MOV SS shadow ends once RIP moved on.
        if ctx.interrupt_inhibit_pc.is_some_and(|pc| pc != ctx.regs.rip) {
            ctx.interrupt_inhibit_pc = None;
        }

        if !services.single_stepping() {
            let actions = services.pending_actions();
            if !actions.is_empty() {
                trace!("Pending actions {:?}", actions);
                return Disposition::ForcedAction(actions);
            }
        }

        sync_tpr_to_guest(vcpu, support, services);

        // Event delivery must know whether the coming entry runs real mode as virtual-8086.
        if vcpu.dirty.needs_full_load() {
            vcpu.real_mode.emulating = ctx.is_real_mode();
        }

        match evaluate_pending_events(vcpu, support, services, ctx) {
            Ok(()) => {}
            Err(InjectionError::ResetRequested) => return Disposition::ResetRequested,
            Err(InjectionError::GuestMemory(error)) => {
                error!("Event delivery failed to access guest memory at {:#x}", error.address);
                return Disposition::InternalError;
            }
        }

        let inputs = EntryInputs::gather(services);
        if vcpu.policy.nested_paging {
            vcpu.tlb.eptp = inputs.eptp;
        }

        let were_enabled = support.disable_interrupts();
        let entered = enter_guest(vcpu, core, support, ctx, &inputs);
        support.restore_interrupts(were_enabled);
        vcpu.run_state = RunState::Exited;

        if entered.is_ok() && vcpu.tlb.last_flush == TlbFlush::VpidAllContexts {
            trace!("Core {}: ASIDs recycled, flushed every VPID context (VCPU {} now uses {})", core.id, vcpu.id, vcpu.tlb.asid);
        }

        match entered {
            Ok(()) => {}
            Err(EntryError::Prepare(error)) => {
                error!("VCPU {}: preparing the VM entry failed: {:?}", vcpu.id, error);
                vcpu.field_cache.discard_writes();
                vcpu.pending_event = vcpu.injected_event.take();
                return Disposition::InternalError;
            }
            Err(EntryError::Switch(failure)) => {
                let record = VmEntryFailure::from_instruction(support, failure, vcpu.injected_event.take());
                error!("VCPU {}: VM entry instruction failed: {:?}", vcpu.id, record);
                report_lost_event(&record);
                dump_vmcs_state(support);
                vcpu.last_entry_failure = Some(record);
                return Disposition::WorldSwitchFailed;
            }
        }

        vcpu.field_cache.refresh(support);
        let exit = ExitRecord::read(vcpu, support);
        *last_exit = Some(exit);

        if exit.is_entry_failure() {
            let record = VmEntryFailure::from_exit(exit.reason, exit.qualification, vcpu.injected_event.take());
            error!("VCPU {}: VM entry failed: {:?}", vcpu.id, record);
            report_lost_event(&record);
            dump_vmcs_state(support);
            vcpu.last_entry_failure = Some(record);

            return match record.basic_reason() {
                Some(VmxBasicExitReason::VmEntryFailureInvalidGuestState) => Disposition::InvalidGuestState,
                Some(VmxBasicExitReason::VmEntryFailureMsrLoading) => Disposition::MsrLoadFailed,
                _ => Disposition::WorldSwitchFailed,
            };
        }

        vcpu.launched = true;
        vcpu.injected_event = None;
        vcpu.pending_event = PendingEvent::from_idt_vectoring(exit.idt_vectoring_info, exit.idt_vectoring_error_code, exit.instruction_length);

        if let Err(error) = save_guest_state(vcpu, support, ctx) {
            error!("VCPU {}: saving guest state failed: {:?}", vcpu.id, error);
            return Disposition::InternalError;
        }
        sync_tpr_from_guest(vcpu, services);
        vcpu.exit_history.record(exit.reason, ctx.regs.rip);

        vcpu.run_state = RunState::Dispatching;
        let mut exit_ctx = ExitContext {
            vcpu: &mut *vcpu,
            support: &mut *support,
            services: &mut *services,
            ctx: &mut *ctx,
            exit,
        };

        match dispatch(&mut exit_ctx) {
            ExitType::IncrementRIP => exit_ctx.advance_rip(),
            ExitType::Continue => {}
            ExitType::Return(disposition) => return disposition,
        }
    }
}

/// The interrupt-disabled part of an iteration: TLB, host state, guest state and the world switch.
fn enter_guest<S: VmxSupport>(vcpu: &mut VirtualCpu, core: &PhysicalCore, support: &mut S, ctx: &mut GuestCpuContext, inputs: &EntryInputs) -> Result<(), EntryError> {
    vcpu.tlb.prepare_entry(core, support).map_err(EntryError::Prepare)?;

    if vcpu.host_state_stale {
        save_host_state(vcpu, support).map_err(EntryError::Prepare)?;
    }
    load_guest_state(vcpu, support, ctx, inputs).map_err(EntryError::Prepare)?;
    vcpu.field_cache.flush_writes(support);

    vcpu.run_state = RunState::InGuest;
    support.world_switch(&mut ctx.regs, vcpu.launched, vcpu.run_routine).map_err(EntryError::Switch)
}

fn report_lost_event(record: &VmEntryFailure) {
    if let Some(event) = record.interrupted_event {
        error!("Event {:#x} (error code {:#x}) was not delivered and is dropped", event.info, event.error_code);
    }
}

/// Copies the interrupt controller's TPR into the virtual-APIC page and arms the TPR threshold.
fn sync_tpr_to_guest<S: VmxSupport, V: VcpuServices + ?Sized>(vcpu: &mut VirtualCpu, support: &mut S, services: &mut V) {
    if !vcpu.controls.has_primary(PrimaryControls::USE_TPR_SHADOW) {
        return;
    }
    let Some(state) = services.tpr() else {
        return;
    };
    let Some(page) = vcpu.pages.virtual_apic.as_mut() else {
        return;
    };

    page.write_u8(VIRTUAL_APIC_TPR_OFFSET, state.tpr);
    vcpu.last_tpr = Some(state.tpr);

    // Exit once the guest lowers its TPR below the priority class of the waiting interrupt.
    let threshold = match state.pending_vector {
        Some(vector) if vector >> 4 <= state.tpr >> 4 => vector >> 4,
        _ => 0,
    };
    vcpu.field_cache.write(support, vmcs::control::TPR_THRESHOLD, threshold as u64);
}

/// Pushes a TPR the guest wrote through the shadow back to the interrupt controller.
fn sync_tpr_from_guest<V: VcpuServices + ?Sized>(vcpu: &mut VirtualCpu, services: &mut V) {
    if !vcpu.controls.has_primary(PrimaryControls::USE_TPR_SHADOW) {
        return;
    }
    let Some(tpr) = vcpu.pages.virtual_apic.as_ref().map(|page| page.read_u8(VIRTUAL_APIC_TPR_OFFSET)) else {
        return;
    };

    if vcpu.last_tpr.is_some_and(|last| last != tpr) {
        trace!("Guest TPR changed to {:#x}", tpr);
        services.set_tpr(tpr);
        vcpu.last_tpr = Some(tpr);
    }
}

/// Drops the TLB entries for one guest-linear address, or defers to the pending full flush.
pub fn invalidate_page<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, address: u64) -> Result<(), HypervisorError> {
    vcpu.tlb.invalidate_page(support, address)
}

/// Drops the TLB entries for one guest-physical page.
pub fn invalidate_phys_page<S: VmxSupport>(vcpu: &mut VirtualCpu, support: &mut S, gpa: u64) -> Result<(), HypervisorError> {
    vcpu.tlb.invalidate_phys_page(support, gpa)
}

/// Flushes the VCPU's whole TLB context on its next entry.
pub fn flush_tlb(vcpu: &mut VirtualCpu) {
    vcpu.tlb.flush_all();
}
