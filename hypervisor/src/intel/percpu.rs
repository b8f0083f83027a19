//! Per physical core virtualization state.
//!
//! A [`PhysicalCore`] is shared between every VCPU that gets scheduled on that
//! core. Only the fields below are shared, and only through atomics.

use {
    crate::error::HypervisorError,
    alloc::vec::Vec,
    core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    log::*,
};

/// One host logical processor.
#[derive(Debug)]
pub struct PhysicalCore {
    /// Index of the core in [`PhysicalCores`].
    pub id: u32,

    /// VMXON has been executed on this core.
    root_mode: AtomicBool,

    /// Last VPID handed out on this core. 0 belongs to the host.
    current_asid: AtomicU32,

    /// Bumped whenever every ASID on this core becomes stale.
    flush_generation: AtomicU64,

    /// The next VCPU entering on this core must flush all contexts.
    flush_on_next_use: AtomicBool,

    /// Physical address of the VMCS currently loaded on this core, 0 if none.
    active_vmcs: AtomicU64,
}

impl PhysicalCore {
    pub const fn new(id: u32) -> Self {
        Self {
            id,
            root_mode: AtomicBool::new(false),
            current_asid: AtomicU32::new(0),
            flush_generation: AtomicU64::new(0),
            flush_on_next_use: AtomicBool::new(false),
            active_vmcs: AtomicU64::new(0),
        }
    }

    pub fn is_root_mode(&self) -> bool {
        self.root_mode.load(Ordering::Acquire)
    }

    /// Records a root-mode transition. Entering root mode makes every cached translation suspect.
    pub fn set_root_mode(&self, enabled: bool) {
        if enabled {
            self.current_asid.store(0, Ordering::Release);
            self.flush_on_next_use.store(true, Ordering::Release);
            self.flush_generation.fetch_add(1, Ordering::AcqRel);
        }
        self.root_mode.store(enabled, Ordering::Release);
    }

    pub fn flush_generation(&self) -> u64 {
        self.flush_generation.load(Ordering::Acquire)
    }

    pub fn current_asid(&self) -> u32 {
        self.current_asid.load(Ordering::Acquire)
    }

    /// Hands out the next ASID, wrapping to 1 once `max_asid` is reached.
    ///
    /// A wrap means the IDs handed out so far may be reused, so the generation is
    /// bumped and the next user is told to flush every context. Runs with host
    /// interrupts disabled, so it does not log; the caller reports the wrap.
    pub fn allocate_asid(&self, max_asid: u32) -> u32 {
        let mut current = self.current_asid.load(Ordering::Acquire);
        loop {
            let (next, wrapped) = if current + 1 >= max_asid { (1, true) } else { (current + 1, false) };

            match self.current_asid.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if wrapped {
                        self.flush_generation.fetch_add(1, Ordering::AcqRel);
                        self.flush_on_next_use.store(true, Ordering::Release);
                    }
                    return next;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Consumes the "flush all contexts" request, returning whether it was set.
    pub fn take_flush_request(&self) -> bool {
        self.flush_on_next_use.swap(false, Ordering::AcqRel)
    }

    /// Marks `vmcs_pa` as the control block loaded on this core.
    pub fn activate(&self, vmcs_pa: u64) -> Result<(), HypervisorError> {
        match self.active_vmcs.compare_exchange(0, vmcs_pa, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(current) if current == vmcs_pa => Ok(()),
            Err(current) => {
                error!("Core {} already has VMCS {:#x} active, refusing {:#x}", self.id, current, vmcs_pa);
                Err(HypervisorError::ControlBlockBusy(self.id))
            }
        }
    }

    pub fn deactivate(&self, vmcs_pa: u64) {
        let _ = self.active_vmcs.compare_exchange(vmcs_pa, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn active_vmcs(&self) -> Option<u64> {
        match self.active_vmcs.load(Ordering::Acquire) {
            0 => None,
            pa => Some(pa),
        }
    }
}

/// Table of every host logical processor, created once at engine start.
#[derive(Debug)]
pub struct PhysicalCores {
    cores: Vec<PhysicalCore>,
}

impl PhysicalCores {
    pub fn new(count: u32) -> Self {
        Self {
            cores: (0..count).map(PhysicalCore::new).collect(),
        }
    }

    pub fn get(&self, id: u32) -> Option<&PhysicalCore> {
        self.cores.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }
}
