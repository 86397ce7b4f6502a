//! Nested VMX engine.
//!
//! Emulates the Intel VT-x instruction set (VMXON, VMLAUNCH, VMREAD, ...) for a guest that wants to run
//! its own hypervisor. The engine is driven by the instruction emulator of the outer virtual machine,
//! which is reached through the [`platform::Platform`] trait.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use] extern crate static_assertions;

pub mod cpu;
pub mod platform;
pub mod utils;
pub mod vmx;

#[cfg(test)] mod test_utils;
