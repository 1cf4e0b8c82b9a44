//! Thread descriptors and synthetic trap frames.
//!
//! A thread is the scheduling unit; a process and its main thread coincide.
//! Every thread owns a kernel stack whose base word holds a canary; user
//! threads additionally reference a user stack mapped at the fixed top of
//! the user region and carry heap bounds for `brk`.

use crate::arch::x86_64::gdt::{KERNEL_CODE_SELECTOR, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::fs::OpenFile;

/// Fixed capacity of the per-thread open-file table (fd = index + 3).
pub const MAX_OPEN_FILES: usize = 8;
/// Fixed thread-name length (NUL-padded).
pub const THREAD_NAME_LEN: usize = 16;
/// Kernel stack size: 4 pages = 16 KiB.
pub const KSTACK_PAGES: usize = 4;
/// User stack size: 4 pages = 16 KiB.
pub const USTACK_PAGES: usize = 4;

/// RFLAGS for freshly built frames: IF set, reserved bit 1.
const INITIAL_RFLAGS: u64 = 0x202;

/// Entry function type for kernel threads.
pub type KernelThreadFn = extern "C" fn(usize);

/// Thread lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Unused,
    Ready,
    Running,
    Sleeping,
    Blocked,
    Zombie,
}

/// One slot of the fixed thread table.
pub struct Thread {
    /// Monotonic id; 0 is reserved for the boot CPU's bootstrap thread.
    pub id: u64,
    pub name: [u8; THREAD_NAME_LEN],
    pub state: ThreadState,
    pub is_user: bool,
    /// Higher value wins during selection.
    pub priority: u8,
    /// Saved trap-frame pointer, captured at preemption.
    pub rsp: u64,
    /// Address-space root (CR3 value); physical, identity-mapped.
    pub cr3: u64,

    /// Kernel stack base (physical = virtual here) and size.
    pub kstack: u64,
    pub kstack_size: usize,
    pub kstack_canary: u64,

    /// User stack physical base / size / fixed virtual top.
    pub ustack: u64,
    pub ustack_size: usize,
    pub ustack_top: u64,

    /// User heap bounds for `brk`.
    pub brk_start: u64,
    pub brk_end: u64,
    /// Placement cursor for anonymous `mmap`.
    pub mmap_base: u64,

    pub open_files: [Option<OpenFile>; MAX_OPEN_FILES],

    /// Parent thread id, if any.
    pub parent: Option<u64>,
    /// Live (un-reaped) children.
    pub children: u32,
    pub exit_code: i32,
    /// waitpid target: >0 a specific child id, <=0 any child.
    pub wait_target: i64,
    /// Where to store the child's exit code (user VA in the waiter's space).
    pub wait_status_ptr: u64,

    /// Tick at which a SLEEPING thread becomes READY again.
    pub wakeup_tick: u64,
    /// CPU this thread is queued on.
    pub cpu_id: u32,
    /// The waiting parent already consumed this zombie's status; the slot
    /// is freed by the scheduler once the thread is off-CPU.
    pub reap_pending: bool,
}

impl Thread {
    pub const fn unused() -> Self {
        const NO_FILE: Option<OpenFile> = None;
        Self {
            id: 0,
            name: [0; THREAD_NAME_LEN],
            state: ThreadState::Unused,
            is_user: false,
            priority: 0,
            rsp: 0,
            cr3: 0,
            kstack: 0,
            kstack_size: 0,
            kstack_canary: 0,
            ustack: 0,
            ustack_size: 0,
            ustack_top: 0,
            brk_start: 0,
            brk_end: 0,
            mmap_base: 0,
            open_files: [NO_FILE; MAX_OPEN_FILES],
            parent: None,
            children: 0,
            exit_code: 0,
            wait_target: 0,
            wait_status_ptr: 0,
            wakeup_tick: 0,
            cpu_id: 0,
            reap_pending: false,
        }
    }

    /// Reset a slot for reuse, keeping nothing from the previous occupant.
    pub fn reset(&mut self) {
        *self = Thread::unused();
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = [0; THREAD_NAME_LEN];
        for (dst, src) in self.name.iter_mut().zip(name.bytes()) {
            if src == 0 {
                break;
            }
            *dst = src;
        }
        // Keep the last byte as a terminator.
        self.name[THREAD_NAME_LEN - 1] = 0;
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    /// Top of the kernel stack (trap frames are built downward from here).
    pub fn kstack_top(&self) -> u64 {
        self.kstack + self.kstack_size as u64
    }
}

/// Mix a canary for a thread's kernel stack. Deterministic for the
/// thread's lifetime (slot address, stack placement and creation tick are
/// all fixed once the thread exists), but varies across threads and boots.
pub fn make_canary(slot_addr: u64, kstack: u64, kstack_size: u64, tick: u64, cpu: u64) -> u64 {
    let mut v = 0xC3A5_C85C_97CB_3127u64;
    v ^= slot_addr;
    v ^= kstack;
    v ^= kstack_size;
    v ^= tick;
    v ^= cpu << 32;
    if v == 0 {
        v = 0xA5A5_A5A5_A5A5_A5A5;
    }
    v
}

/// Stamp the canary into the stack's base word.
pub fn canary_init(thread: &mut Thread, tick: u64, cpu: u64) {
    if thread.kstack == 0 || thread.kstack_size < 8 {
        return;
    }
    let slot_addr = thread as *const Thread as u64;
    thread.kstack_canary = make_canary(
        slot_addr,
        thread.kstack,
        thread.kstack_size as u64,
        tick,
        cpu,
    );
    // SAFETY: the kernel stack was just allocated for this thread and its
    // base word is reserved for the canary.
    unsafe { core::ptr::write(thread.kstack as *mut u64, thread.kstack_canary) };
}

/// Check the canary still matches the base word.
pub fn canary_ok(thread: &Thread) -> bool {
    if thread.kstack == 0 || thread.kstack_size < 8 {
        return true;
    }
    // SAFETY: `kstack` points at this thread's live kernel stack.
    unsafe { core::ptr::read(thread.kstack as *const u64) == thread.kstack_canary }
}

/// First-run landing pad for kernel threads: the synthetic frame IRETs here
/// with `rdi = f`, `rsi = arg`.
pub extern "C" fn thread_trampoline(f: KernelThreadFn, arg: usize) -> ! {
    f(arg);
    log::warn!("kernel thread returned; halting it");
    crate::arch::halt_loop();
}

/// Push one value onto a downward-growing synthetic stack.
///
/// # Safety
///
/// `sp` must stay inside the thread's freshly allocated kernel stack.
unsafe fn push(sp: &mut u64, value: u64) {
    *sp -= 8;
    // SAFETY: caller guarantees the slot is inside the stack allocation.
    unsafe { core::ptr::write(*sp as *mut u64, value) };
}

/// Build a ring-0 IRET frame that drops into [`thread_trampoline`] with
/// interrupts enabled. The entry RSP is offset so a function entered via
/// IRET sees `RSP % 16 == 8`, as the SysV ABI expects at a call boundary.
pub fn build_kernel_frame(thread: &mut Thread, f: KernelThreadFn, arg: usize) {
    let mut sp = thread.kstack_top() - 8;
    let trampoline: extern "C" fn(KernelThreadFn, usize) -> ! = thread_trampoline;

    // SAFETY: all pushes stay within the just-allocated kernel stack.
    unsafe {
        // iret frame (ring 0): RFLAGS, CS, RIP
        push(&mut sp, INITIAL_RFLAGS);
        push(&mut sp, KERNEL_CODE_SELECTOR as u64);
        push(&mut sp, trampoline as u64);

        // error code + vector (discarded by the common stub)
        push(&mut sp, 0);
        push(&mut sp, 0);

        // General registers in the exact order the epilogue pops them.
        push(&mut sp, 0); // rax
        push(&mut sp, 0); // rbx
        push(&mut sp, 0); // rcx
        push(&mut sp, 0); // rdx
        push(&mut sp, 0); // rbp
        push(&mut sp, f as usize as u64); // rdi = entry function
        push(&mut sp, arg as u64); // rsi = argument
        push(&mut sp, 0); // r8
        push(&mut sp, 0); // r9
        push(&mut sp, 0); // r10
        push(&mut sp, 0); // r11
        push(&mut sp, 0); // r12
        push(&mut sp, 0); // r13
        push(&mut sp, 0); // r14
        push(&mut sp, 0); // r15
    }

    thread.rsp = sp;
}

/// Build a ring-3 IRET frame entering `user_rip` on the thread's user stack.
pub fn build_user_frame(thread: &mut Thread, user_rip: u64) {
    let mut sp = thread.kstack_top();
    let user_rsp = thread.ustack_top & !0xF;

    // SAFETY: all pushes stay within the just-allocated kernel stack.
    unsafe {
        // iret frame (ring 3): SS, RSP, RFLAGS, CS, RIP
        push(&mut sp, USER_DATA_SELECTOR as u64);
        push(&mut sp, user_rsp);
        push(&mut sp, INITIAL_RFLAGS);
        push(&mut sp, USER_CODE_SELECTOR as u64);
        push(&mut sp, user_rip);

        // error code + vector
        push(&mut sp, 0);
        push(&mut sp, 0);

        // All general registers start zeroed.
        for _ in 0..15 {
            push(&mut sp, 0);
        }
    }

    thread.rsp = sp;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canary_is_reproducible_and_nonzero() {
        let a = make_canary(0x1000, 0x200000, 16384, 42, 1);
        let b = make_canary(0x1000, 0x200000, 16384, 42, 1);
        assert_eq!(a, b);
        assert_ne!(a, 0);
        // Any input change produces a different canary.
        assert_ne!(a, make_canary(0x1008, 0x200000, 16384, 42, 1));
        assert_ne!(a, make_canary(0x1000, 0x200000, 16384, 43, 1));
        assert_ne!(a, make_canary(0x1000, 0x200000, 16384, 42, 2));
    }

    #[test]
    fn name_is_truncated_and_terminated() {
        let mut thread = Thread::unused();
        thread.set_name("a-rather-long-thread-name");
        assert_eq!(thread.name_str().len(), THREAD_NAME_LEN - 1);
        thread.set_name("init");
        assert_eq!(thread.name_str(), "init");
    }

    #[test]
    fn threads_without_kstack_pass_canary_check() {
        let thread = Thread::unused();
        assert!(canary_ok(&thread));
    }
}
