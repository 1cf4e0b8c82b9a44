//! Multi-processor bring-up.
//!
//! The BSP copies a real-mode trampoline to a low-memory landing page,
//! fills in a bootstrap record (stack, CPU index, entry point, kernel CR3),
//! and kicks each AP with INIT / SIPI / SIPI. The trampoline switches the
//! AP straight from real mode into long mode (PAE + LME + paging in one
//! step, which is legal because the target CR3 identity-maps low memory)
//! and calls [`ap_main`] on a dedicated boot stack.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::cpu::{self, MAX_CPUS};
use super::interrupts::APIC_RESCHED_VECTOR;
use super::{apic, gdt, idt, mp, pause};
use crate::sched;

/// Physical landing page for the trampoline (must be below 1 MiB and
/// page-number addressable by a SIPI vector).
const AP_TRAMPOLINE_ADDR: u64 = 0x7000;
const AP_TRAMPOLINE_VECTOR: u8 = 0x07;

const AP_BOOT_STACK_SIZE: usize = 16384;

// Written through the trampoline copy at a fixed offset; the AP reads the
// fields from real-mode assembly.
#[repr(C)]
#[allow(dead_code)]
struct ApBootstrap {
    stack_top: u64,
    cpu_id: u64,
    entry: u64,
    cr3: u64,
}

#[repr(align(16))]
#[allow(dead_code)] // Alignment wrapper -- accessed via raw pointer
struct ApStack([u8; AP_BOOT_STACK_SIZE]);

const ZERO_STACK: ApStack = ApStack([0; AP_BOOT_STACK_SIZE]);
static mut AP_BOOT_STACKS: [ApStack; MAX_CPUS] = [ZERO_STACK; MAX_CPUS];

#[allow(clippy::declare_interior_mutable_const)]
const ATOMIC_U32_ZERO: AtomicU32 = AtomicU32::new(0);
static AP_ONLINE: [AtomicU32; MAX_CPUS] = [ATOMIC_U32_ZERO; MAX_CPUS];
static SMP_ENABLED: AtomicBool = AtomicBool::new(false);

// Real-mode trampoline. Runs at AP_TRAMPOLINE_ADDR with CS:IP = 0x0700:0,
// so every absolute reference is written as `0x7000 + (label - start)`.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
.section .text
.global ap_trampoline_start
.global ap_trampoline_data
.global ap_trampoline_end
.code16
ap_trampoline_start:
    cli
    xorw %ax, %ax
    movw %ax, %ds

    lgdtl (0x7000 + ap_tramp_gdtr - ap_trampoline_start)

    # CR4.PAE
    movl %cr4, %eax
    orl $0x20, %eax
    movl %eax, %cr4

    # Kernel CR3 from the bootstrap record
    movl (0x7000 + ap_tramp_cr3 - ap_trampoline_start), %eax
    movl %eax, %cr3

    # EFER.LME
    movl $0xC0000080, %ecx
    rdmsr
    orl $0x100, %eax
    wrmsr

    # CR0.PG | CR0.PE: real mode straight into long mode
    movl %cr0, %eax
    orl $0x80000001, %eax
    movl %eax, %cr0

    ljmpl $0x08, $(0x7000 + ap_tramp_long - ap_trampoline_start)

.code64
ap_tramp_long:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss

    movq (0x7000 + ap_tramp_stack - ap_trampoline_start), %rsp
    movq (0x7000 + ap_tramp_cpu - ap_trampoline_start), %rdi
    movq (0x7000 + ap_tramp_entry - ap_trampoline_start), %rax
    callq *%rax
2:  hlt
    jmp 2b

.p2align 3
ap_tramp_gdt:
    .quad 0
    .quad 0x00AF9A000000FFFF    # 64-bit code
    .quad 0x00CF92000000FFFF    # data
ap_tramp_gdt_end:
ap_tramp_gdtr:
    .word ap_tramp_gdt_end - ap_tramp_gdt - 1
    .long 0x7000 + ap_tramp_gdt - ap_trampoline_start

.p2align 3
ap_trampoline_data:
ap_tramp_stack: .quad 0
ap_tramp_cpu:   .quad 0
ap_tramp_entry: .quad 0
ap_tramp_cr3:   .quad 0
ap_trampoline_end:
.code64
"#,
    options(att_syntax)
);

#[cfg(target_arch = "x86_64")]
#[allow(non_upper_case_globals)]
extern "C" {
    static ap_trampoline_start: u8;
    static ap_trampoline_data: u8;
    static ap_trampoline_end: u8;
}

fn delay_cycles(cycles: u32) {
    for _ in 0..cycles {
        pause();
    }
}

/// Copy the trampoline to the landing page and fill the bootstrap record
/// for one AP.
fn prepare_trampoline(cpu_id: u32) {
    // SAFETY: the landing page is reserved low memory; the linker symbols
    // bound the trampoline blob; boot stacks are per-CPU statics.
    unsafe {
        let start = &ap_trampoline_start as *const u8;
        let end = &ap_trampoline_end as *const u8;
        let size = end as usize - start as usize;
        core::ptr::copy_nonoverlapping(start, AP_TRAMPOLINE_ADDR as *mut u8, size);

        let data_off = &ap_trampoline_data as *const u8 as usize - start as usize;
        let record = (AP_TRAMPOLINE_ADDR as usize + data_off) as *mut ApBootstrap;
        let stack_base = (&raw mut AP_BOOT_STACKS[cpu_id as usize]) as u64;
        let entry: extern "C" fn(u64) -> ! = ap_main;
        (*record).stack_top = stack_base + AP_BOOT_STACK_SIZE as u64;
        (*record).cpu_id = cpu_id as u64;
        (*record).entry = entry as u64;
        (*record).cr3 = crate::mm::paging::kernel_root();
    }
}

/// Bring up the APIC, enumerate CPUs, and start every AP. With `enable`
/// false (or no MP tables) the system stays single-CPU.
pub fn init(enable: bool) {
    apic::init_bsp();

    if !enable {
        cpu::init_bsp(apic::id());
        log::info!("SMP disabled by configuration");
        return;
    }

    let Some(info) = mp::detect() else {
        cpu::init_bsp(apic::id());
        log::info!("falling back to single CPU");
        return;
    };

    cpu::init_bsp(info.bsp_apic_id as u32);
    for i in 0..info.cpu_count as usize {
        let apic_id = info.cpu_apic_ids[i] as u32;
        cpu::register(apic_id, apic_id == info.bsp_apic_id as u32);
    }

    let count = cpu::count();
    SMP_ENABLED.store(count > 1, Ordering::Release);
    log::info!("starting {} application processor(s)", count - 1);

    for cpu_id in 1..count {
        let apic_id = cpu::apic_id_of(cpu_id);
        AP_ONLINE[cpu_id as usize].store(0, Ordering::Release);
        prepare_trampoline(cpu_id);

        apic::send_init(apic_id);
        delay_cycles(100_000);
        apic::send_sipi(apic_id, AP_TRAMPOLINE_VECTOR);
        delay_cycles(20_000);
        apic::send_sipi(apic_id, AP_TRAMPOLINE_VECTOR);

        let mut timeout = 2_000_000u32;
        while AP_ONLINE[cpu_id as usize].load(Ordering::Acquire) == 0 && timeout > 0 {
            pause();
            timeout -= 1;
        }
        if AP_ONLINE[cpu_id as usize].load(Ordering::Acquire) == 0 {
            log::warn!("CPU {cpu_id} (APIC {apic_id}) did not come online");
        }
    }

    log::info!("{} CPU(s) online", cpu::online_count());
}

/// Whether more than one CPU is running.
pub fn enabled() -> bool {
    SMP_ENABLED.load(Ordering::Acquire)
}

/// Ask every other CPU to re-run scheduling at its next opportunity.
pub fn broadcast_reschedule() {
    if enabled() {
        apic::send_ipi_all(APIC_RESCHED_VECTOR);
    }
}

/// First Rust code an AP runs, still on the trampoline-provided stack.
extern "C" fn ap_main(cpu_id: u64) -> ! {
    let cpu_id = cpu_id as u32;
    cpu::set_online(cpu_id, true);
    gdt::init();
    idt::init();
    apic::init_ap();

    // SAFETY: each AP owns its slot of the boot stack array.
    let stack_base = unsafe { (&raw mut AP_BOOT_STACKS[cpu_id as usize]) as u64 };
    sched::register_cpu_bootstrap(cpu_id, stack_base, AP_BOOT_STACK_SIZE);

    AP_ONLINE[cpu_id as usize].store(1, Ordering::Release);
    log::info!("CPU {cpu_id} online");

    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
    super::halt_loop();
}
