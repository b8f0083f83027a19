//! Per-VCPU virtualization control state.

use {
    crate::{
        config::EngineConfig,
        intel::{
            capabilities::VmxCapabilities,
            diagnostics::{ExitHistory, VmEntryFailure},
            dirty::GuestStateChanges,
            events::PendingEvent,
            guest::TscMode,
            page::{PageAllocator, PhysPage},
            realmode::RealModeState,
            support::{DebugRegisters, RunRoutine},
            tlb::{TlbState, TlbStrategy},
            vmcs::{ControlPages, ControlPolicy, VmcsControls, VmcsFieldCache},
        },
    },
};

/// Where the execution loop currently is for this VCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Entering,
    InGuest,
    Exited,
    Dispatching,
}

/// Pages owned by one VCPU. Each slot is freed at most once.
#[derive(Debug, Default)]
pub struct VcpuPages {
    pub vmcs: Option<PhysPage>,
    pub virtual_apic: Option<PhysPage>,
    pub msr_bitmap: Option<PhysPage>,
    pub guest_msrs: Option<PhysPage>,
    pub host_msrs: Option<PhysPage>,
}

impl VcpuPages {
    pub fn vmcs_pa(&self) -> Option<u64> {
        self.vmcs.as_ref().map(|page| page.pa)
    }

    pub fn control_pages(&self, apic_access: Option<u64>) -> ControlPages {
        ControlPages {
            virtual_apic: self.virtual_apic.as_ref().map(|page| page.pa),
            apic_access,
            msr_bitmap: self.msr_bitmap.as_ref().map(|page| page.pa),
            guest_msrs: self.guest_msrs.as_ref().map(|page| page.pa),
            host_msrs: self.host_msrs.as_ref().map(|page| page.pa),
        }
    }

    /// Frees every allocated page; safe on a partially allocated set and when called twice.
    pub fn free<A: PageAllocator>(&mut self, allocator: &mut A) {
        for slot in [&mut self.vmcs, &mut self.virtual_apic, &mut self.msr_bitmap, &mut self.guest_msrs, &mut self.host_msrs] {
            if let Some(page) = slot.take() {
                allocator.free_page(page);
            }
        }
    }
}

/// One guest CPU.
#[derive(Debug)]
pub struct VirtualCpu {
    pub id: u32,
    pub pages: VcpuPages,
    pub config: EngineConfig,
    pub caps: VmxCapabilities,
    pub policy: ControlPolicy,

    /// Execution controls as last written to the VMCS.
    pub controls: VmcsControls,
    pub cr0_mask: u64,
    pub cr4_mask: u64,

    pub tlb: TlbState,

    /// Event whose delivery was cut short by a VM exit and must be re-injected.
    pub pending_event: Option<PendingEvent>,
    /// Event written to the entry fields for the entry in progress.
    pub injected_event: Option<PendingEvent>,

    pub dirty: GuestStateChanges,
    pub host_state_stale: bool,
    pub run_routine: RunRoutine,
    pub real_mode: RealModeState,
    pub field_cache: VmcsFieldCache,
    pub tsc_mode: TscMode,
    pub guest_msr_count: usize,

    /// VMLAUNCH already succeeded on the loaded VMCS.
    pub launched: bool,
    /// Core the VMCS is currently loaded on.
    pub active_core: Option<u32>,
    pub run_state: RunState,

    /// The guest's DR0-DR3 are live in hardware.
    pub guest_debug_active: bool,
    pub host_debug_saved: Option<DebugRegisters>,

    pub last_tpr: Option<u8>,
    pub last_entry_failure: Option<VmEntryFailure>,
    pub exit_history: ExitHistory,
}

impl VirtualCpu {
    pub fn new(id: u32, config: EngineConfig, caps: VmxCapabilities, policy: ControlPolicy, strategy: TlbStrategy) -> Self {
        let mut tlb = TlbState::new(strategy, config.max_asid.clamp(2, 1 << 16), config.shootdown_capacity);
        tlb.individual_address_invvpid = caps.supports_invvpid_individual_address();

        Self {
            id,
            pages: VcpuPages::default(),
            config,
            caps,
            policy,
            controls: VmcsControls::default(),
            cr0_mask: 0,
            cr4_mask: 0,
            tlb,
            pending_event: None,
            injected_event: None,
            dirty: GuestStateChanges::all(),
            host_state_stale: true,
            run_routine: RunRoutine::default(),
            real_mode: RealModeState::default(),
            field_cache: VmcsFieldCache::new(),
            tsc_mode: TscMode::default(),
            guest_msr_count: 0,
            launched: false,
            active_core: None,
            run_state: RunState::Idle,
            guest_debug_active: false,
            host_debug_saved: None,
            last_tpr: None,
            last_entry_failure: None,
            exit_history: ExitHistory::new(),
        }
    }

    /// Marks every guest-state category for reload.
    pub fn mark_all_dirty(&mut self) {
        self.dirty = GuestStateChanges::all();
    }

    pub fn mark_dirty(&mut self, changes: GuestStateChanges) {
        self.dirty |= changes;
    }
}
