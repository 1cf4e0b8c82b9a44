//! FerriteOS Kernel Library
//!
//! Core of a small preemptive multi-processor x86_64 kernel: physical and
//! virtual memory management, interrupt and syscall dispatch, a per-CPU
//! priority scheduler with process semantics, and a legacy virtio block
//! driver. The library also compiles for the host target so that the pure
//! logic of each subsystem can be exercised by ordinary `cargo test`.

#![no_std]

extern crate alloc;

// On bare metal the kernel heap backs `alloc`; the heap region is carved out
// of the frame allocator during boot (see `mm::heap`).
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Host target (unit tests, coverage): delegate to the system allocator so
// test code using Vec/String/alloc compiles and runs.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the kernel heap allocator.
#[cfg(target_os = "none")]
pub fn kernel_heap() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod syscall;
pub mod time;

/// Name reported by the `uname` syscall and the boot banner.
pub const OS_NAME: &str = "FerriteOS";
/// Release string reported by `uname`.
pub const OS_RELEASE: &str = env!("CARGO_PKG_VERSION");
