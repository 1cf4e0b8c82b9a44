//! Local APIC.
//!
//! Memory-mapped per-CPU interrupt controller; used here for the spurious
//! vector, EOI on the reschedule IPI, and INIT/SIPI/broadcast IPIs during
//! multi-processor bring-up.

use core::sync::atomic::{AtomicU64, Ordering};

use super::cpu;
use super::interrupts::APIC_SPURIOUS_VECTOR;

const IA32_APIC_BASE_MSR: u32 = 0x1B;
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;

const REG_ID: u32 = 0x020;
const REG_EOI: u32 = 0x0B0;
const REG_DFR: u32 = 0x0E0;
const REG_LDR: u32 = 0x0D0;
const REG_SVR: u32 = 0x0F0;
const REG_ICR_LOW: u32 = 0x300;
const REG_ICR_HIGH: u32 = 0x310;
const REG_LVT_LINT0: u32 = 0x350;
const REG_LVT_LINT1: u32 = 0x360;

const ICR_DELIVERY_STATUS: u32 = 1 << 12;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_TRIGGER_LEVEL: u32 = 1 << 15;
const ICR_DEST_ALL_EXCL_SELF: u32 = 3 << 18;
const LVT_MASKED: u32 = 1 << 16;

static APIC_BASE: AtomicU64 = AtomicU64::new(0);

fn write(reg: u32, value: u32) {
    let base = APIC_BASE.load(Ordering::Relaxed);
    if base == 0 {
        return;
    }
    // SAFETY: the APIC MMIO page is identity-mapped; a read-back after the
    // write forces it to post.
    unsafe {
        let ptr = (base + reg as u64) as *mut u32;
        core::ptr::write_volatile(ptr, value);
        core::ptr::read_volatile(ptr as *const u32);
    }
}

fn read(reg: u32) -> u32 {
    let base = APIC_BASE.load(Ordering::Relaxed);
    if base == 0 {
        return 0;
    }
    // SAFETY: identity-mapped APIC register read.
    unsafe { core::ptr::read_volatile((base + reg as u64) as *const u32) }
}

fn wait_icr_idle() {
    while read(REG_ICR_LOW) & ICR_DELIVERY_STATUS != 0 {
        super::pause();
    }
}

fn init_common() {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::model_specific::Msr;
        let mut msr = Msr::new(IA32_APIC_BASE_MSR);
        // SAFETY: setting the global-enable bit of IA32_APIC_BASE and
        // recording the MMIO base it reports.
        unsafe {
            let base = msr.read() | APIC_GLOBAL_ENABLE;
            msr.write(base);
            APIC_BASE.store(base & 0xFFFF_F000, Ordering::Relaxed);
        }
    }

    write(REG_DFR, 0xFFFF_FFFF);
    write(REG_LDR, 0x0100_0000);
    write(REG_LVT_LINT0, LVT_MASKED);
    write(REG_LVT_LINT1, LVT_MASKED);
    // Software-enable with the spurious vector.
    write(REG_SVR, APIC_SPURIOUS_VECTOR as u32 | 0x100);
}

/// Enable the BSP's APIC and flip `current_cpu_id` over to APIC-based
/// identification.
pub fn init_bsp() {
    init_common();
    cpu::set_apic_ready(true);
    log::info!("APIC enabled on BSP, id={}", id());
}

/// Enable an AP's APIC.
pub fn init_ap() {
    init_common();
    cpu::set_apic_ready(true);
}

/// Local APIC id of the calling CPU.
pub fn id() -> u32 {
    read(REG_ID) >> 24
}

/// Signal end-of-interrupt for an APIC-delivered vector.
pub fn end_of_interrupt() {
    if APIC_BASE.load(Ordering::Relaxed) != 0 {
        write(REG_EOI, 0);
    }
}

/// Send INIT to one CPU.
pub fn send_init(apic_id: u32) {
    wait_icr_idle();
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, 0x0000_C500 | ICR_LEVEL_ASSERT | ICR_TRIGGER_LEVEL);
    wait_icr_idle();
}

/// Send a startup IPI with the real-mode landing page number.
pub fn send_sipi(apic_id: u32, vector: u8) {
    wait_icr_idle();
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, 0x0000_0600 | vector as u32);
    wait_icr_idle();
}

/// Broadcast a fixed-vector IPI to every CPU except the sender.
pub fn send_ipi_all(vector: u8) {
    wait_icr_idle();
    write(REG_ICR_HIGH, 0);
    write(REG_ICR_LOW, vector as u32 | ICR_DEST_ALL_EXCL_SELF);
    wait_icr_idle();
}
