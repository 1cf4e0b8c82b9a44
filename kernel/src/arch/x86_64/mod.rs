//! x86_64 architecture support: descriptor tables, the trap core, legacy
//! PIC/PIT, local APIC, and multi-processor bring-up.

pub mod apic;
pub mod cpu;
pub mod gdt;
pub mod idt;
pub mod interrupts;
pub mod irq;
pub mod mp;
pub mod pic;
pub mod pit;
pub mod smp;

/// Halt forever with interrupts left as-is between halts.
pub fn halt_loop() -> ! {
    loop {
        #[cfg(target_os = "none")]
        x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

/// Busy-wait hint for spin loops.
#[inline]
pub fn pause() {
    core::hint::spin_loop();
}

/// Write the CR3 register, switching address spaces.
#[cfg(target_os = "none")]
pub fn write_cr3(root: u64) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;
    // SAFETY: the caller passes the root of a live address space whose
    // kernel half mirrors the one currently executing.
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(root)),
            Cr3Flags::empty(),
        )
    };
}

#[cfg(not(target_os = "none"))]
pub fn write_cr3(_root: u64) {}
