//! Trap core: unified trap frame, interrupt stubs, and the dispatcher.
//!
//! Every IDT vector points into a table of assembly stubs with a fixed
//! 16-byte stride. Each stub normalizes the CPU's entry state (pushing a
//! dummy error code for vectors that lack one, then the vector number) and
//! jumps to a common prologue that saves all general-purpose registers and
//! calls [`interrupt_dispatch`] with the resulting [`TrapFrame`]. The
//! dispatcher returns the frame pointer to resume -- possibly a different
//! thread's -- and the epilogue restores registers and `iretq`s.

use crate::arch::x86_64::{apic, irq, pic, pit};
use crate::sched;
use crate::syscall;

/// First vector of the remapped legacy IRQ range.
pub const IRQ_BASE: u8 = 32;
/// Number of legacy IRQ lines behind the two PICs.
pub const IRQ_COUNT: u8 = 16;
/// Spurious-interrupt vector programmed into the APIC SVR.
pub const APIC_SPURIOUS_VECTOR: u8 = 0xF0;
/// Cross-CPU reschedule IPI vector.
pub const APIC_RESCHED_VECTOR: u8 = 0xF1;
/// Software interrupt used for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Exit code for a thread whose kernel-stack canary no longer matches.
const STACK_CORRUPTION_EXIT_CODE: i32 = 134;

/// The on-stack record built on every kernel entry.
///
/// `rsp`/`ss` are pushed by the CPU only when the trap crossed from ring 3;
/// for kernel-mode traps those two fields read whatever lies beyond the
/// frame and must be ignored (check [`TrapFrame::from_user`]).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    pub vector: u64,
    pub error_code: u64,

    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,

    /// Only valid if `(cs & 3) == 3`.
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// Whether the saved CS has RPL 3, i.e. the trap came from user mode.
    #[inline]
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

// 256 interrupt stubs at a fixed 16-byte stride, plus the shared
// prologue/epilogue. Vectors 8, 10-14, 17, 21, 29 and 30 push a hardware
// error code (mask 0x60227D00); the rest get a dummy zero so the frame
// layout is uniform.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
.section .text
.p2align 4
.global vector_stubs
vector_stubs:
.set vec, 0
.rept 256
    .set has_err, 0
    .if vec < 32
        .set has_err, (0x60227D00 >> vec) & 1
    .endif
    .if has_err == 0
        pushq $0
    .endif
    pushq $vec
    jmp trap_common
    .p2align 4
    .set vec, vec + 1
.endr

trap_common:
    pushq %rax
    pushq %rbx
    pushq %rcx
    pushq %rdx
    pushq %rbp
    pushq %rdi
    pushq %rsi
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15

    movq %rsp, %rdi
    cld
    call interrupt_dispatch
    movq %rax, %rsp

    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rsi
    popq %rdi
    popq %rbp
    popq %rdx
    popq %rcx
    popq %rbx
    popq %rax

    addq $16, %rsp
    iretq
"#,
    options(att_syntax)
);

fn exception_name(vector: u64) -> &'static str {
    match vector {
        0 => "#DE Divide Error",
        1 => "#DB Debug",
        2 => "NMI",
        3 => "#BP Breakpoint",
        4 => "#OF Overflow",
        5 => "#BR Bound Range Exceeded",
        6 => "#UD Invalid Opcode",
        7 => "#NM Device Not Available",
        8 => "#DF Double Fault",
        9 => "Coprocessor Segment Overrun",
        10 => "#TS Invalid TSS",
        11 => "#NP Segment Not Present",
        12 => "#SS Stack-Segment Fault",
        13 => "#GP General Protection",
        14 => "#PF Page Fault",
        16 => "#MF x87 Floating-Point",
        17 => "#AC Alignment Check",
        18 => "#MC Machine Check",
        19 => "#XM SIMD Floating-Point",
        20 => "#VE Virtualization",
        21 => "#CP Control Protection",
        28 => "#HV Hypervisor Injection",
        29 => "#VC VMM Communication",
        30 => "#SX Security",
        _ => "Reserved",
    }
}

fn dump_frame(frame: &TrapFrame) {
    log::error!(
        "  vec={} err={:#x} RIP={:#x} CS={:#x} RFLAGS={:#x}",
        frame.vector,
        frame.error_code,
        frame.rip,
        frame.cs,
        frame.rflags
    );
    log::error!(
        "  RAX={:#x} RBX={:#x} RCX={:#x} RDX={:#x}",
        frame.rax,
        frame.rbx,
        frame.rcx,
        frame.rdx
    );
    log::error!(
        "  RSI={:#x} RDI={:#x} RBP={:#x}",
        frame.rsi,
        frame.rdi,
        frame.rbp
    );
    if frame.from_user() {
        log::error!("  RSP={:#x} SS={:#x}", frame.rsp, frame.ss);
    }
}

#[cfg(target_os = "none")]
fn read_cr2() -> u64 {
    x86_64::registers::control::Cr2::read_raw()
}

#[cfg(not(target_os = "none"))]
fn read_cr2() -> u64 {
    0
}

fn handle_exception(frame: &mut TrapFrame) -> *mut TrapFrame {
    let vector = frame.vector;
    log::error!(
        "[EXCEPTION] {} (thread {})",
        exception_name(vector),
        sched::current_thread_id()
    );

    if vector == 14 {
        let err = frame.error_code;
        log::error!(
            "  CR2={:#x} err={:#x} [P={} W={} U={} RSVD={} I={}]",
            read_cr2(),
            err,
            err & 1,
            (err >> 1) & 1,
            (err >> 2) & 1,
            (err >> 3) & 1,
            (err >> 4) & 1
        );
    }

    dump_frame(frame);

    if frame.from_user() {
        log::error!("[EXCEPTION] killing user thread {}", sched::current_thread_id());
        return sched::on_exit(frame, 128 + vector as i32);
    }

    panic!("unrecoverable kernel exception: {}", exception_name(vector));
}

fn handle_irq(frame: &mut TrapFrame) -> *mut TrapFrame {
    let line = (frame.vector - IRQ_BASE as u64) as u8;

    irq::enter(line);
    if line == 0 {
        pit::handle_tick();
    } else {
        irq::dispatch(line, frame);
    }

    // EOI with interrupts off; the tick path may switch frames after it.
    x86_64::instructions::interrupts::disable();
    pic::end_of_interrupt(line);

    if line == 0 {
        let next = sched::on_tick(frame);
        irq::exit();
        return next;
    }
    irq::exit();
    frame
}

/// Central dispatch, called from the assembly stubs. Returns the frame to
/// resume; the epilogue restores it and `iretq`s.
#[no_mangle]
pub extern "C" fn interrupt_dispatch(frame: &mut TrapFrame) -> *mut TrapFrame {
    // Defense-in-depth: a clobbered canary means the thread's kernel stack
    // overflowed into its base word.
    if !sched::current_canary_ok() {
        log::error!(
            "kernel stack canary mismatch on thread {}",
            sched::current_thread_id()
        );
        if frame.from_user() {
            return sched::on_exit(frame, STACK_CORRUPTION_EXIT_CODE);
        }
        panic!("kernel thread stack corrupted");
    }

    let vector = frame.vector;

    if (IRQ_BASE as u64..(IRQ_BASE + IRQ_COUNT) as u64).contains(&vector) {
        return handle_irq(frame);
    }

    if vector == APIC_RESCHED_VECTOR as u64 {
        apic::end_of_interrupt();
        return sched::on_tick(frame);
    }

    if vector == APIC_SPURIOUS_VECTOR as u64 {
        return frame;
    }

    if vector == SYSCALL_VECTOR as u64 {
        return syscall::handle(frame);
    }

    if vector < 32 {
        return handle_exception(frame);
    }

    log::warn!("stray interrupt on vector {vector}");
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_frame() -> TrapFrame {
        // SAFETY: TrapFrame is plain-old-data; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }

    #[test]
    fn frame_layout_matches_stub_pushes() {
        // 15 GP registers + vector + error code + 5-word CPU frame.
        assert_eq!(core::mem::size_of::<TrapFrame>(), 22 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, r15), 0);
        assert_eq!(core::mem::offset_of!(TrapFrame, rax), 14 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, vector), 15 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rip), 17 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rsp), 20 * 8);
    }

    #[test]
    fn user_frame_detected_by_cs_rpl() {
        let mut frame = zeroed_frame();
        frame.cs = 0x08;
        assert!(!frame.from_user());
        frame.cs = 0x1B;
        assert!(frame.from_user());
    }

    #[test]
    fn page_fault_vector_carries_error_code() {
        // The stub error-code mask must cover exactly the architectural set.
        let mask: u32 = 0x60227D00;
        for vec in [8u32, 10, 11, 12, 13, 14, 17, 21, 29, 30] {
            assert_ne!(mask & (1 << vec), 0, "vector {vec} should push an error code");
        }
        for vec in [0u32, 3, 6, 16, 18, 19, 32 - 1] {
            assert_eq!(mask & (1 << vec), 0, "vector {vec} must get a dummy code");
        }
    }
}
