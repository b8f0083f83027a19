//! TLB tagging and invalidation.
//!
//! One of three strategies is picked per VM at setup: EPT (flush by EPT
//! context), VPID (rotate the per-core address-space id) or none (the CPU
//! flushes linear mappings on every transition anyway). Whatever the strategy,
//! [`TlbState::prepare_entry`] issues at most one hardware invalidation per VM
//! entry.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.4 CACHING TRANSLATION INFORMATION

use {
    crate::{
        error::HypervisorError,
        intel::{
            percpu::PhysicalCore,
            support::{InvEptKind, InvVpidKind, VmxSupport},
        },
    },
    alloc::{sync::Arc, vec::Vec},
    spin::Mutex,
    x86::vmx::vmcs,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlbStrategy {
    Ept,
    Vpid,
    #[default]
    None,
}

/// What a drained shootdown queue asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shootdown {
    Nothing,
    One(u64),
    Many,
    Full,
}

#[derive(Debug)]
struct ShootdownQueue {
    pages: Vec<u64>,
    full: bool,
}

/// Invalidation requests posted by other threads while the VCPU is not executing.
#[derive(Debug)]
pub struct TlbShootdown {
    capacity: usize,
    queue: Mutex<ShootdownQueue>,
}

impl TlbShootdown {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            queue: Mutex::new(ShootdownQueue {
                pages: Vec::with_capacity(capacity),
                full: false,
            }),
        })
    }

    /// Queues one page. A full queue degrades to a full flush.
    pub fn queue_page(&self, address: u64) {
        let mut queue = self.queue.lock();
        if queue.full || queue.pages.contains(&address) {
            return;
        }
        if queue.pages.len() == self.capacity {
            queue.pages.clear();
            queue.full = true;
        } else {
            queue.pages.push(address);
        }
    }

    pub fn request_full_flush(&self) {
        let mut queue = self.queue.lock();
        queue.pages.clear();
        queue.full = true;
    }

    pub fn is_empty(&self) -> bool {
        let queue = self.queue.lock();
        !queue.full && queue.pages.is_empty()
    }

    /// Empties the queue without allocating.
    pub fn drain(&self) -> Shootdown {
        let mut queue = self.queue.lock();
        let request = if queue.full {
            Shootdown::Full
        } else {
            match queue.pages.as_slice() {
                [] => Shootdown::Nothing,
                [address] => Shootdown::One(*address),
                _ => Shootdown::Many,
            }
        };
        queue.pages.clear();
        queue.full = false;
        request
    }
}

/// The single hardware invalidation issued for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbFlush {
    None,
    EptContext,
    VpidAddress(u64),
    VpidContext,
    VpidAllContexts,
}

/// Per-VCPU TLB bookkeeping.
#[derive(Debug)]
pub struct TlbState {
    pub strategy: TlbStrategy,
    pub asid: u32,
    pub max_asid: u32,
    pub last_core: Option<u32>,
    pub flush_generation: u64,
    pub force_flush: bool,
    /// What the latest [`TlbState::prepare_entry`] issued, for logging once interrupts are back on.
    pub last_flush: TlbFlush,
    pub eptp: u64,
    pub individual_address_invvpid: bool,
    pub shootdown: Arc<TlbShootdown>,
}

impl TlbState {
    pub fn new(strategy: TlbStrategy, max_asid: u32, shootdown_capacity: usize) -> Self {
        Self {
            strategy,
            asid: 0,
            max_asid,
            last_core: None,
            flush_generation: 0,
            force_flush: true,
            last_flush: TlbFlush::None,
            eptp: 0,
            individual_address_invvpid: true,
            shootdown: TlbShootdown::new(shootdown_capacity),
        }
    }

    /// True if the next entry on `core` must flush the whole context.
    pub fn needs_flush(&self, core: &PhysicalCore) -> bool {
        self.force_flush || self.last_core != Some(core.id) || self.flush_generation != core.flush_generation()
    }

    /// Schedules a full flush for the next entry.
    pub fn flush_all(&mut self) {
        self.force_flush = true;
    }

    /// Invalidates one guest-linear address now, unless a full flush is already pending.
    pub fn invalidate_page<S: VmxSupport>(&mut self, support: &mut S, address: u64) -> Result<(), HypervisorError> {
        if self.force_flush {
            return Ok(());
        }

        match self.strategy {
            TlbStrategy::Vpid if self.asid != 0 => {
                let kind = if self.individual_address_invvpid { InvVpidKind::IndividualAddress } else { InvVpidKind::SingleContext };
                support.invvpid(kind, self.asid as u16, address).map_err(|_| HypervisorError::InvvpidFailed)
            }
            TlbStrategy::Vpid => {
                self.force_flush = true;
                Ok(())
            }
            TlbStrategy::Ept => support.invept(InvEptKind::SingleContext, self.eptp).map_err(|_| HypervisorError::InveptFailed),
            TlbStrategy::None => Ok(()),
        }
    }

    /// Invalidates one guest-physical page now. EPT has no page-granular invalidation, so this flushes the context.
    pub fn invalidate_phys_page<S: VmxSupport>(&mut self, support: &mut S, _gpa: u64) -> Result<(), HypervisorError> {
        if self.force_flush {
            return Ok(());
        }

        match self.strategy {
            TlbStrategy::Ept => support.invept(InvEptKind::SingleContext, self.eptp).map_err(|_| HypervisorError::InveptFailed),
            TlbStrategy::Vpid | TlbStrategy::None => Ok(()),
        }
    }

    /// Runs the strategy for the coming entry on `core`.
    ///
    /// Called with host interrupts disabled: it neither allocates nor logs.
    pub fn prepare_entry<S: VmxSupport>(&mut self, core: &PhysicalCore, support: &mut S) -> Result<TlbFlush, HypervisorError> {
        if self.last_core != Some(core.id) || self.flush_generation != core.flush_generation() {
            self.force_flush = true;
        }

        let request = self.shootdown.drain();
        if request == Shootdown::Full {
            self.force_flush = true;
        }

        let flush = match self.strategy {
            TlbStrategy::Ept => {
                if self.force_flush || request != Shootdown::Nothing {
                    support.invept(InvEptKind::SingleContext, self.eptp).map_err(|_| HypervisorError::InveptFailed)?;
                    TlbFlush::EptContext
                } else {
                    TlbFlush::None
                }
            }
            TlbStrategy::Vpid => {
                if self.force_flush {
                    self.asid = core.allocate_asid(self.max_asid);
                    support.vmwrite(vmcs::control::VPID, self.asid as u64);

                    if core.take_flush_request() {
                        support.invvpid(InvVpidKind::AllContexts, 0, 0).map_err(|_| HypervisorError::InvvpidFailed)?;
                        TlbFlush::VpidAllContexts
                    } else {
                        support.invvpid(InvVpidKind::SingleContext, self.asid as u16, 0).map_err(|_| HypervisorError::InvvpidFailed)?;
                        TlbFlush::VpidContext
                    }
                } else {
                    match request {
                        Shootdown::Nothing => TlbFlush::None,
                        Shootdown::One(address) if self.individual_address_invvpid => {
                            support.invvpid(InvVpidKind::IndividualAddress, self.asid as u16, address).map_err(|_| HypervisorError::InvvpidFailed)?;
                            TlbFlush::VpidAddress(address)
                        }
                        _ => {
                            support.invvpid(InvVpidKind::SingleContext, self.asid as u16, 0).map_err(|_| HypervisorError::InvvpidFailed)?;
                            TlbFlush::VpidContext
                        }
                    }
                }
            }
            TlbStrategy::None => TlbFlush::None,
        };

        self.last_core = Some(core.id);
        self.flush_generation = core.flush_generation();
        self.force_flush = false;
        self.last_flush = flush;

        Ok(flush)
    }
}
