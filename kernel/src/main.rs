//! FerriteOS kernel binary.
//!
//! Multiboot2 entry point and the boot sequence: console and logging,
//! physical and virtual memory, descriptor tables, interrupt plumbing,
//! scheduler, secondary CPUs, filesystem and drivers, then the first user
//! process.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use ferrite_kernel::{
    arch::{
        self,
        x86_64::{gdt, idt, irq, pic, pit, smp},
    },
    boot, drivers, elf, fs, logger, mm, sched, time,
};

// Multiboot2 header, boot stack, and the 64-bit entry shim. The boot
// protocol handoff (protected-mode trampoline into long mode) lives in the
// loader; it lands here with the multiboot registers intact: magic in EAX,
// info pointer in EBX.
#[cfg(target_os = "none")]
core::arch::global_asm!(
    r#"
.section .multiboot_header, "a"
.p2align 3
mb2_header_start:
    .long 0xE85250D6
    .long 0
    .long mb2_header_end - mb2_header_start
    .long -(0xE85250D6 + (mb2_header_end - mb2_header_start))
    # end tag
    .word 0
    .word 0
    .long 8
mb2_header_end:

.section .bss
.p2align 4
.global boot_stack_bottom
.global boot_stack_top
boot_stack_bottom:
    .skip 65536
boot_stack_top:

.section .text
.global _start
_start:
    movl %eax, %edi
    movq %rbx, %rsi
    leaq boot_stack_top(%rip), %rsp
    xorl %ebp, %ebp
    call kernel_main
1:  hlt
    jmp 1b
"#,
    options(att_syntax)
);

#[cfg(target_os = "none")]
#[allow(non_upper_case_globals)]
extern "C" {
    static boot_stack_bottom: u8;
    static boot_stack_top: u8;
}

/// Periodic housekeeping thread: once a second, log the tick counter and
/// free memory.
#[cfg(target_os = "none")]
extern "C" fn klog_thread(_arg: usize) {
    loop {
        sched::sleep_ticks(pit::frequency_hz() as u64);
        log::info!(
            "ticks={} free_mem={} KiB",
            pit::ticks(),
            mm::frame::free_bytes() / 1024
        );
    }
}

/// Load `/init.elf` into a fresh address space and start it as the first
/// user process.
#[cfg(target_os = "none")]
fn start_init() {
    let Ok(mut file) = fs::open("/init.elf", fs::O_RDONLY) else {
        log::warn!("/init.elf not found; staying in kernel idle loop");
        return;
    };
    let size = file.node.size();
    let mut image = alloc::vec![0u8; size];
    match fs::read(&mut file, &mut image) {
        Ok(n) if n == size => {}
        _ => {
            log::error!("failed to read /init.elf");
            return;
        }
    }

    let Ok(root) = mm::paging::create_user_space() else {
        log::error!("no address space for init");
        return;
    };
    let loaded = match elf::load(&image, root) {
        Ok(loaded) => loaded,
        Err(e) => {
            log::error!("failed to load /init.elf: {e}");
            mm::paging::release(root);
            return;
        }
    };
    match sched::spawn_user("init", loaded.entry, loaded.initial_brk, root) {
        Ok(id) => log::info!("created user thread {id} (init)"),
        Err(e) => {
            log::error!("failed to start init: {e}");
            mm::paging::release(root);
        }
    }
}

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn kernel_main(magic: u64, info_ptr: *const u8) -> ! {
    logger::init();
    log::info!(
        "{} {} booting",
        ferrite_kernel::OS_NAME,
        ferrite_kernel::OS_RELEASE
    );

    if magic != boot::BOOT_MAGIC {
        log::error!("bad multiboot2 magic {magic:#x}");
        arch::halt_loop();
    }
    // SAFETY: the bootloader's info blob stays resident in identity-mapped
    // low memory.
    let Ok(info) = (unsafe { boot::BootInfo::from_ptr(info_ptr) }) else {
        log::error!("unreadable boot information");
        arch::halt_loop();
    };

    let options = info
        .cmdline()
        .map(boot::apply_cmdline)
        .unwrap_or_default();
    if let Some(name) = info.bootloader_name() {
        log::info!("booted by {name}");
    }
    if let Some(fb) = info.framebuffer() {
        log::info!(
            "framebuffer {}x{} bpp {} at {:#x}",
            fb.width,
            fb.height,
            fb.bpp,
            fb.addr
        );
    }

    // Memory: frames, kernel address space, heap.
    if mm::frame::init(&info).is_err() {
        log::error!("cannot run without a firmware memory map");
        arch::halt_loop();
    }
    if let Err(e) = mm::paging::init() {
        log::error!("address-space setup failed: {e}");
        arch::halt_loop();
    }
    if let Err(e) = mm::heap::init() {
        log::error!("kernel heap setup failed: {e}");
        arch::halt_loop();
    }

    // CPU tables and interrupt plumbing.
    gdt::init();
    idt::init();
    pic::init();
    irq::init();
    pit::init(100);
    time::init();

    // Timer and cascade stay open; everything else is unmasked on demand.
    pic::set_line_masked(0, false);
    pic::set_line_masked(2, false);

    // Scheduler adopts this execution context as thread 0.
    // SAFETY: linker-provided boot stack bounds; addresses only.
    let (stack_bottom, stack_top) = unsafe {
        (
            &boot_stack_bottom as *const u8 as u64,
            &boot_stack_top as *const u8 as u64,
        )
    };
    sched::init(stack_bottom, (stack_top - stack_bottom) as usize);

    // Secondary CPUs.
    smp::init(options.smp);

    // Filesystem surface and device discovery.
    fs::devfs::init();
    drivers::pci::scan(|dev| {
        log::debug!(
            "pci {:02x}:{:02x}.{} {:04x}:{:04x} class {:02x}.{:02x}",
            dev.bus,
            dev.slot,
            dev.func,
            dev.vendor_id,
            dev.device_id,
            dev.class,
            dev.subclass
        );
        if dev.vendor_id == 0x1AF4 {
            drivers::virtio_blk::try_init_legacy(dev.bus, dev.slot, dev.func);
        }
    });

    if let Err(e) = sched::spawn_kernel("klog", klog_thread, 0) {
        log::warn!("could not start klog thread: {e}");
    }

    start_init();
    sched::dump();

    x86_64::instructions::interrupts::enable();
    arch::halt_loop();
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("KERNEL PANIC: {info}");
    x86_64::instructions::interrupts::disable();
    arch::halt_loop();
}

// The binary only has meaning on bare metal; the host build exists so
// `cargo build`/`cargo test` work without a cross target installed.
#[cfg(not(target_os = "none"))]
fn main() {}
