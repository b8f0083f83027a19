//! VT-x execution engine for a hosted (type-2) hypervisor.
//!
//! The engine owns the hardware side of running a guest CPU: root mode, the
//! VMCS lifecycle, guest/host state transfer, event injection, TLB tagging and
//! the enter/exit/dispatch loop. Everything else (guest memory, interrupt
//! controllers, instruction emulation, timers) is reached through the traits
//! in [`services`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;
extern crate static_assertions;

pub mod config;
pub mod error;
pub mod intel;
pub mod logger;
pub mod services;
pub mod vmm;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;
