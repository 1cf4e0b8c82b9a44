//! Preemptive multi-CPU scheduler with process semantics.
//!
//! A fixed table of threads and one current pointer per CPU, all guarded by
//! a single lock that is held across frame save, selection, and the
//! TSS/CR3 updates of a switch. Selection promotes due sleepers, then picks
//! the highest-priority READY thread queued on the running CPU; ties break
//! in table order. New threads are spread across online CPUs round-robin
//! and a reschedule IPI nudges the other CPUs to notice.
//!
//! The scheduler lock is only ever taken with interrupts disabled on the
//! local CPU (trap context, or explicitly masked), so a tick cannot
//! deadlock against a holder on its own CPU.

pub mod thread;

use spin::Mutex;

use crate::arch;
use crate::arch::x86_64::cpu::{self, MAX_CPUS};
use crate::arch::x86_64::interrupts::TrapFrame;
use crate::arch::x86_64::{gdt, pit, smp};
use crate::error::{KernelError, KernelResult};
use crate::mm::{frame, paging, PageFlags, PAGE_SIZE};

pub use thread::{KernelThreadFn, Thread, ThreadState};
use thread::{KSTACK_PAGES, USTACK_PAGES};

/// Fixed capacity of the thread table.
pub const MAX_THREADS: usize = 64;

const NEG_ONE: u64 = u64::MAX;

struct Scheduler {
    threads: [Thread; MAX_THREADS],
    current: [Option<usize>; MAX_CPUS],
    next_id: u64,
    cpu_cursor: u32,
    kernel_cr3: u64,
}

impl Scheduler {
    const fn new() -> Self {
        const UNUSED: Thread = Thread::unused();
        Self {
            threads: [UNUSED; MAX_THREADS],
            current: [None; MAX_CPUS],
            next_id: 1,
            cpu_cursor: 0,
            kernel_cr3: 0,
        }
    }

    /// Claim an UNUSED slot, assign the next id, and mark it READY.
    fn alloc_slot(&mut self) -> Option<usize> {
        for (idx, slot) in self.threads.iter_mut().enumerate() {
            if slot.state == ThreadState::Unused {
                slot.reset();
                slot.state = ThreadState::Ready;
                slot.priority = 1;
                slot.id = self.next_id;
                self.next_id += 1;
                return Some(idx);
            }
        }
        None
    }

    fn find_by_id(&self, id: u64) -> Option<usize> {
        self.threads
            .iter()
            .position(|t| t.state != ThreadState::Unused && t.id == id)
    }

    fn find_child(&self, parent_id: u64, pid: i64, require_zombie: bool) -> Option<usize> {
        self.threads.iter().position(|t| {
            t.state != ThreadState::Unused
                && t.parent == Some(parent_id)
                && (pid <= 0 || t.id == pid as u64)
                && (!require_zombie || t.state == ThreadState::Zombie)
        })
    }

    /// Round-robin CPU assignment for new threads.
    fn pick_cpu(&mut self) -> u32 {
        let online = cpu::online_count();
        let picked = self.cpu_cursor % online;
        self.cpu_cursor = (self.cpu_cursor + 1) % online;
        picked
    }

    /// Promote sleepers whose deadline has passed.
    fn wake_sleepers(&mut self, now: u64) {
        for t in self.threads.iter_mut() {
            if t.state == ThreadState::Sleeping && now >= t.wakeup_tick {
                t.state = ThreadState::Ready;
            }
        }
    }

    /// Highest-priority READY thread queued on `cpu_id`; ties break in
    /// table order. Falls back to the still-runnable current thread, then
    /// to the boot CPU's bootstrap thread (slot 0).
    fn pick_next(&self, cpu_id: u32) -> usize {
        let mut best: Option<usize> = None;
        let mut best_prio = 0u8;
        for (idx, t) in self.threads.iter().enumerate() {
            if t.state != ThreadState::Ready || t.cpu_id != cpu_id {
                continue;
            }
            if best.is_none() || t.priority > best_prio {
                best = Some(idx);
                best_prio = t.priority;
            }
        }
        if let Some(idx) = best {
            return idx;
        }
        if let Some(cur) = self.current[cpu_id as usize] {
            let t = &self.threads[cur];
            if t.state == ThreadState::Running || t.state == ThreadState::Ready {
                return cur;
            }
        }
        0
    }

    /// Switch `cpu_id` to `next`, saving the outgoing frame pointer.
    /// Returns the frame to resume.
    fn do_switch(&mut self, cpu_id: u32, frame: *mut TrapFrame, next: usize) -> *mut TrapFrame {
        let cpu = cpu_id as usize;
        if self.current[cpu] == Some(next) {
            return frame;
        }

        let prev_cr3 = match self.current[cpu] {
            Some(prev) => {
                let t = &mut self.threads[prev];
                t.rsp = frame as u64;
                if t.state == ThreadState::Running {
                    t.state = ThreadState::Ready;
                }
                t.cr3
            }
            None => 0,
        };

        let incoming = &mut self.threads[next];
        incoming.state = ThreadState::Running;
        self.current[cpu] = Some(next);

        // Ring-3 traps must land on the incoming thread's kernel stack.
        if incoming.kstack != 0 {
            gdt::set_kernel_stack(incoming.kstack_top());
        }
        if incoming.cr3 != 0 && incoming.cr3 != prev_cr3 {
            arch::x86_64::write_cr3(incoming.cr3);
        }

        incoming.rsp as *mut TrapFrame
    }

    /// Move a thread to ZOMBIE, record its exit code, and wake a parent
    /// that is blocked waiting for it. A woken parent gets the status
    /// written and the child id patched into its saved frame's RAX, so its
    /// waitpid returns correctly; the zombie itself is reclaimed by
    /// [`Scheduler::reap_zombies`] once it is off-CPU.
    fn mark_zombie(&mut self, idx: usize, exit_code: i32) {
        let (zombie_id, parent_id) = {
            let t = &mut self.threads[idx];
            t.exit_code = exit_code;
            t.state = ThreadState::Zombie;
            (t.id, t.parent)
        };

        let Some(parent_id) = parent_id else { return };
        let Some(parent_idx) = self.find_by_id(parent_id) else {
            return;
        };
        let parent = &mut self.threads[parent_idx];
        if parent.children > 0 {
            parent.children -= 1;
        }
        if parent.state == ThreadState::Blocked
            && (parent.wait_target <= 0 || parent.wait_target == zombie_id as i64)
        {
            write_status(parent.cr3, parent.wait_status_ptr, exit_code);
            if parent.rsp != 0 {
                // The parent blocked inside its waitpid trap; its saved
                // frame is where the syscall's return value lives.
                // SAFETY: a BLOCKED thread's rsp points at the trap frame
                // captured when it was switched out.
                unsafe { (*(parent.rsp as *mut TrapFrame)).rax = zombie_id };
            }
            parent.wait_target = 0;
            parent.wait_status_ptr = 0;
            parent.state = ThreadState::Ready;
            self.threads[idx].reap_pending = true;
        }
    }

    fn is_current_anywhere(&self, idx: usize) -> bool {
        self.current.iter().any(|c| *c == Some(idx))
    }

    /// Free zombies whose status has already been consumed, once no CPU is
    /// still executing them.
    fn reap_zombies(&mut self) {
        for idx in 0..MAX_THREADS {
            if self.threads[idx].state == ThreadState::Zombie
                && self.threads[idx].reap_pending
                && !self.is_current_anywhere(idx)
            {
                self.release_resources(idx);
                self.threads[idx].state = ThreadState::Unused;
            }
        }
    }

    /// Free everything a reaped thread still holds: kernel stack, open
    /// files, and its address-space reference (whose destruction reclaims
    /// the user stack and heap pages once no other thread shares it).
    fn release_resources(&mut self, idx: usize) {
        let t = &mut self.threads[idx];
        if t.kstack != 0 {
            frame::free_frames(t.kstack, t.kstack_size / PAGE_SIZE as usize);
            t.kstack = 0;
        }
        for file in t.open_files.iter_mut() {
            *file = None;
        }
        if t.is_user {
            let cr3 = t.cr3;
            t.cr3 = 0;
            paging::release(cr3);
        }
    }
}

static SCHED: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Write a waitpid status through a user pointer, translating through the
/// owning thread's address space so the write is correct even when the
/// current CR3 belongs to someone else.
fn write_status(space_root: u64, status_ptr: u64, code: i32) {
    if status_ptr == 0 || space_root == 0 {
        return;
    }
    if let Some((pa, flags)) = paging::resolve(space_root, status_ptr) {
        if flags.contains(PageFlags::PRESENT) {
            // SAFETY: resolved to a present frame; identity-mapped.
            unsafe { core::ptr::write_unaligned(pa as *mut i32, code) };
        }
    }
}

fn current_cpu() -> usize {
    (cpu::current_id() as usize).min(MAX_CPUS - 1)
}

/// Adopt the boot execution context as thread 0 ("bootstrap") on CPU 0.
/// Its trap frame will be built by the first preemption.
pub fn init(boot_stack_base: u64, boot_stack_size: usize) {
    let mut sched = SCHED.lock();
    sched.kernel_cr3 = paging::kernel_root();

    let t0 = &mut sched.threads[0];
    t0.reset();
    t0.id = 0;
    t0.state = ThreadState::Running;
    t0.priority = 1;
    t0.cr3 = paging::kernel_root();
    t0.cpu_id = 0;
    t0.kstack = boot_stack_base;
    t0.kstack_size = boot_stack_size;
    t0.set_name("bootstrap");
    if t0.kstack != 0 {
        thread::canary_init(t0, pit::ticks(), 0);
        gdt::set_kernel_stack(t0.kstack_top());
    }

    sched.current[0] = Some(0);
    log::info!("scheduler up, kernel CR3={:#x}", sched.kernel_cr3);
}

/// Adopt an AP's boot context as that CPU's bootstrap thread.
pub fn register_cpu_bootstrap(cpu_id: u32, stack_base: u64, stack_size: usize) {
    let cpu_id = cpu_id.min(MAX_CPUS as u32 - 1);
    let mut sched = SCHED.lock();
    let Some(idx) = sched.alloc_slot() else {
        log::error!("thread table full, CPU {cpu_id} has no bootstrap thread");
        return;
    };
    let kernel_cr3 = sched.kernel_cr3;
    let t = &mut sched.threads[idx];
    t.state = ThreadState::Running;
    t.cr3 = kernel_cr3;
    t.cpu_id = cpu_id;
    t.kstack = stack_base;
    t.kstack_size = stack_size;
    t.set_name("cpu-bootstrap");
    thread::canary_init(t, pit::ticks(), cpu_id as u64);
    gdt::set_kernel_stack(t.kstack_top());
    sched.current[cpu_id as usize] = Some(idx);
}

/// Timer tick / reschedule IPI: wake sleepers and re-run selection for the
/// calling CPU only.
pub fn on_tick(frame: &mut TrapFrame) -> *mut TrapFrame {
    let cpu_id = current_cpu() as u32;
    let mut sched = SCHED.lock();
    sched.wake_sleepers(pit::ticks());
    sched.reap_zombies();
    let next = sched.pick_next(cpu_id);
    sched.do_switch(cpu_id, frame, next)
}

/// Cooperative yield (the `yield` syscall).
pub fn yield_now(frame: &mut TrapFrame) -> *mut TrapFrame {
    on_tick(frame)
}

/// Terminate the calling thread with `exit_code` and pick something else to
/// run. If nothing is runnable the boot CPU's bootstrap thread takes over;
/// if even that is a zombie, the kernel halts.
pub fn on_exit(frame: &mut TrapFrame, exit_code: i32) -> *mut TrapFrame {
    let cpu_id = current_cpu() as u32;
    let mut sched = SCHED.lock();
    let Some(cur) = sched.current[cpu_id as usize] else {
        return frame;
    };
    log::info!("thread {} exited with code {exit_code}", sched.threads[cur].id);

    sched.threads[cur].rsp = frame as *mut TrapFrame as u64;
    sched.mark_zombie(cur, exit_code);

    let mut next = sched.pick_next(cpu_id);
    if next == cur {
        next = 0;
        if sched.threads[0].state == ThreadState::Zombie {
            log::error!("no runnable threads; halting");
            arch::halt_loop();
        }
    }
    sched.do_switch(cpu_id, frame, next)
}

/// `fork`: duplicate the calling user thread. The child shares the parent's
/// address space, user stack, heap bounds and mmap cursor, and gets shallow
/// copies of every open file. Parent sees the child id, child sees 0.
pub fn fork(frame: &mut TrapFrame) -> *mut TrapFrame {
    let cpu_id = current_cpu() as u32;
    let mut sched = SCHED.lock();

    let Some(parent_idx) = sched.current[cpu_id as usize] else {
        frame.rax = NEG_ONE;
        return frame;
    };
    if !sched.threads[parent_idx].is_user {
        frame.rax = NEG_ONE;
        return frame;
    }

    let Some(child_idx) = sched.alloc_slot() else {
        frame.rax = NEG_ONE;
        return frame;
    };

    // Copy the inheritable parent state out before touching the child slot.
    let parent = &sched.threads[parent_idx];
    let parent_id = parent.id;
    let cr3 = parent.cr3;
    let priority = parent.priority;
    let parent_cpu = parent.cpu_id;
    let ustack = parent.ustack;
    let ustack_size = parent.ustack_size;
    let ustack_top = parent.ustack_top;
    let brk_start = parent.brk_start;
    let brk_end = parent.brk_end;
    let mmap_base = parent.mmap_base;
    let kstack_size = parent.kstack_size;
    let name = parent.name;
    let files = parent.open_files.clone();

    let Ok(kstack) = frame::alloc_frames(kstack_size / PAGE_SIZE as usize) else {
        sched.threads[child_idx].reset();
        frame.rax = NEG_ONE;
        return frame;
    };

    paging::retain(cr3);

    let child = &mut sched.threads[child_idx];
    child.is_user = true;
    child.cr3 = cr3;
    child.priority = priority;
    child.cpu_id = parent_cpu;
    child.parent = Some(parent_id);
    child.ustack = ustack;
    child.ustack_size = ustack_size;
    child.ustack_top = ustack_top;
    child.brk_start = brk_start;
    child.brk_end = brk_end;
    child.mmap_base = mmap_base;
    child.open_files = files;
    child.kstack = kstack;
    child.kstack_size = kstack_size;
    child.name = name;
    thread::canary_init(child, pit::ticks(), cpu_id as u64);

    // The child resumes from a copy of the parent's frame with RAX = 0.
    let child_frame = (child.kstack_top() - core::mem::size_of::<TrapFrame>() as u64)
        as *mut TrapFrame;
    // SAFETY: the child's kernel stack was just allocated and is large
    // enough for one trap frame at its top.
    unsafe {
        core::ptr::copy_nonoverlapping(frame as *const TrapFrame, child_frame, 1);
        (*child_frame).rax = 0;
    }
    child.rsp = child_frame as u64;
    child.state = ThreadState::Ready;

    let child_id = child.id;
    sched.threads[parent_idx].children += 1;
    frame.rax = child_id;
    frame as *mut TrapFrame
}

/// `waitpid`: reap a zombie child (writing its exit code through
/// `status_ptr`), report -1 if no matching child exists, or block until a
/// matching child exits.
pub fn waitpid(frame: &mut TrapFrame, pid: i64, status_ptr: u64) -> *mut TrapFrame {
    let cpu_id = current_cpu() as u32;
    let mut sched = SCHED.lock();
    let Some(cur_idx) = sched.current[cpu_id as usize] else {
        frame.rax = NEG_ONE;
        return frame;
    };
    let cur_id = sched.threads[cur_idx].id;
    let cur_cr3 = sched.threads[cur_idx].cr3;

    if let Some(zombie_idx) = sched.find_child(cur_id, pid, true) {
        let zombie_id = sched.threads[zombie_idx].id;
        let exit_code = sched.threads[zombie_idx].exit_code;
        write_status(cur_cr3, status_ptr, exit_code);
        if sched.is_current_anywhere(zombie_idx) {
            // A killed thread coasting to its next trap entry on another
            // CPU cannot lose its kernel stack yet; the tick sweep frees
            // it once it is off-CPU.
            sched.threads[zombie_idx].reap_pending = true;
        } else {
            sched.release_resources(zombie_idx);
            sched.threads[zombie_idx].state = ThreadState::Unused;
        }
        frame.rax = zombie_id;
        return frame;
    }

    if sched.find_child(cur_id, pid, false).is_none() {
        frame.rax = NEG_ONE;
        return frame;
    }

    // Block until a matching child exits. The switch happens under the
    // same lock hold, so the exit path can only observe BLOCKED after this
    // frame has been saved -- its RAX patch and status write always land in
    // the right place.
    {
        let cur = &mut sched.threads[cur_idx];
        cur.wait_target = pid;
        cur.wait_status_ptr = status_ptr;
        cur.state = ThreadState::Blocked;
    }
    sched.wake_sleepers(pit::ticks());
    let next = sched.pick_next(cpu_id);
    sched.do_switch(cpu_id, frame, next)
}

/// `kill`: move a user thread to ZOMBIE with exit code `-sig`. The caller
/// routes self-kill through the exit path instead. A target running on
/// another CPU keeps running until its next trap entry.
pub fn kill(pid: i64, sig: i32) -> i64 {
    let cpu_id = current_cpu();
    let mut sched = SCHED.lock();
    let Some(target_idx) = (pid > 0)
        .then(|| sched.find_by_id(pid as u64))
        .flatten()
    else {
        return -1;
    };
    if !sched.threads[target_idx].is_user {
        return -1;
    }
    if sched.current[cpu_id] == Some(target_idx) {
        return 0;
    }
    if sched.threads[target_idx].state == ThreadState::Zombie {
        return 0;
    }
    sched.mark_zombie(target_idx, -sig);
    0
}

/// Put the calling thread to sleep for `ticks` timer ticks, then yield via
/// the syscall vector (valid from ring 0 as well).
pub fn sleep_ticks(ticks: u64) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHED.lock();
        if let Some(cur) = sched.current[current_cpu()] {
            sched.threads[cur].wakeup_tick = pit::ticks() + ticks;
            sched.threads[cur].state = ThreadState::Sleeping;
        }
    });
    #[cfg(target_os = "none")]
    // SAFETY: software interrupt into the syscall gate; the dispatcher
    // treats RAX=3 as yield and the trap machinery preserves all registers.
    unsafe {
        core::arch::asm!("int 0x80", inout("rax") crate::syscall::SYS_YIELD => _);
    }
}

/// Create a kernel thread running `f(arg)`.
pub fn spawn_kernel(name: &str, f: KernelThreadFn, arg: usize) -> KernelResult<u64> {
    let id = x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHED.lock();
        let parent_id = sched.current[current_cpu()].map(|idx| sched.threads[idx].id);

        let idx = sched.alloc_slot().ok_or(KernelError::ResourceExhausted {
            resource: "thread table",
        })?;
        let kstack = match frame::alloc_frames(KSTACK_PAGES) {
            Ok(pa) => pa,
            Err(e) => {
                sched.threads[idx].reset();
                return Err(e);
            }
        };

        let kernel_cr3 = sched.kernel_cr3;
        let cpu_id = sched.pick_cpu();
        if let Some(pid) = parent_id {
            if let Some(p_idx) = sched.find_by_id(pid) {
                sched.threads[p_idx].children += 1;
            }
        }
        let t = &mut sched.threads[idx];
        t.cr3 = kernel_cr3;
        t.parent = parent_id;
        t.cpu_id = cpu_id;
        t.kstack = kstack;
        t.kstack_size = KSTACK_PAGES * PAGE_SIZE as usize;
        t.set_name(name);
        thread::canary_init(t, pit::ticks(), cpu_id as u64);
        thread::build_kernel_frame(t, f, arg);
        t.state = ThreadState::Ready;
        Ok(t.id)
    })?;
    smp::broadcast_reschedule();
    Ok(id)
}

/// Create a user thread entering `entry` in address space `cr3`, with a
/// fresh user stack below [`paging::USER_STACK_TOP`] and heap starting at
/// `brk`. The caller supplies (and on failure keeps) the address space.
pub fn spawn_user(name: &str, entry: u64, brk: u64, cr3: u64) -> KernelResult<u64> {
    if cr3 == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let ustack_size = USTACK_PAGES as u64 * PAGE_SIZE;
    let ustack_base_va = paging::USER_STACK_TOP - ustack_size;

    let id = x86_64::instructions::interrupts::without_interrupts(|| {
        let mut sched = SCHED.lock();
        let parent_id = sched.current[current_cpu()].map(|idx| sched.threads[idx].id);

        let idx = sched.alloc_slot().ok_or(KernelError::ResourceExhausted {
            resource: "thread table",
        })?;
        let kstack = match frame::alloc_frames(KSTACK_PAGES) {
            Ok(pa) => pa,
            Err(e) => {
                sched.threads[idx].reset();
                return Err(e);
            }
        };
        let ustack_phys = match frame::alloc_frames(USTACK_PAGES) {
            Ok(pa) => pa,
            Err(e) => {
                frame::free_frames(kstack, KSTACK_PAGES);
                sched.threads[idx].reset();
                return Err(e);
            }
        };
        // SAFETY: freshly allocated, identity-mapped user stack frames.
        unsafe {
            core::ptr::write_bytes(ustack_phys as *mut u8, 0, ustack_size as usize);
        }
        if let Err(e) = paging::map_range(
            cr3,
            ustack_base_va,
            ustack_phys,
            ustack_size,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
        ) {
            frame::free_frames(ustack_phys, USTACK_PAGES);
            frame::free_frames(kstack, KSTACK_PAGES);
            sched.threads[idx].reset();
            return Err(e);
        }

        let cpu_id = sched.pick_cpu();
        if let Some(pid) = parent_id {
            if let Some(p_idx) = sched.find_by_id(pid) {
                sched.threads[p_idx].children += 1;
            }
        }
        let t = &mut sched.threads[idx];
        t.is_user = true;
        t.cr3 = cr3;
        t.parent = parent_id;
        t.cpu_id = cpu_id;
        t.kstack = kstack;
        t.kstack_size = KSTACK_PAGES * PAGE_SIZE as usize;
        t.ustack = ustack_phys;
        t.ustack_size = ustack_size as usize;
        t.ustack_top = paging::USER_STACK_TOP;
        t.brk_start = brk;
        t.brk_end = brk;
        t.mmap_base = crate::mm::align_up(brk, PAGE_SIZE) + 0x0100_0000;
        t.set_name(name);
        thread::canary_init(t, pit::ticks(), cpu_id as u64);
        thread::build_user_frame(t, entry);
        t.state = ThreadState::Ready;
        Ok(t.id)
    })?;
    smp::broadcast_reschedule();
    Ok(id)
}

/// Swap the calling thread onto a freshly loaded image: new address space,
/// new user stack, new entry point, zeroed registers. The old address
/// space reference is dropped (destroying it if this thread was the sole
/// holder).
pub fn exec_replace(
    frame: &mut TrapFrame,
    new_cr3: u64,
    entry: u64,
    brk: u64,
    ustack_phys: u64,
    ustack_size: u64,
) {
    let cpu_id = current_cpu();
    let old_cr3 = {
        let mut sched = SCHED.lock();
        let Some(cur) = sched.current[cpu_id] else { return };
        let t = &mut sched.threads[cur];
        let old = t.cr3;
        t.cr3 = new_cr3;
        t.ustack = ustack_phys;
        t.ustack_size = ustack_size as usize;
        t.ustack_top = paging::USER_STACK_TOP;
        t.brk_start = brk;
        t.brk_end = brk;
        t.mmap_base = crate::mm::align_up(brk, PAGE_SIZE) + 0x0100_0000;
        old
    };

    arch::x86_64::write_cr3(new_cr3);
    paging::release(old_cr3);

    // Fresh register state: only the return frame survives, pointing at the
    // new image's entry and stack.
    // SAFETY: TrapFrame is plain-old-data; all-zero is a valid value.
    let mut fresh: TrapFrame = unsafe { core::mem::zeroed() };
    fresh.rip = entry;
    fresh.cs = frame.cs;
    fresh.rflags = 0x202;
    fresh.rsp = paging::USER_STACK_TOP & !0xF;
    fresh.ss = frame.ss;
    *frame = fresh;
}

/// Id of the thread currently running on this CPU (0 during early boot).
pub fn current_thread_id() -> u64 {
    let sched = SCHED.lock();
    sched.current[current_cpu()]
        .map(|idx| sched.threads[idx].id)
        .unwrap_or(0)
}

/// Check the current thread's kernel-stack canary (true when no thread is
/// current yet).
pub fn current_canary_ok() -> bool {
    let sched = SCHED.lock();
    match sched.current[current_cpu()] {
        Some(idx) => thread::canary_ok(&sched.threads[idx]),
        None => true,
    }
}

/// Run `f` against the current thread, if any.
pub fn with_current<R>(f: impl FnOnce(&Thread) -> R) -> Option<R> {
    let sched = SCHED.lock();
    sched.current[current_cpu()].map(|idx| f(&sched.threads[idx]))
}

/// Run `f` against the current thread mutably, if any.
pub fn with_current_mut<R>(f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    let mut sched = SCHED.lock();
    let cpu = current_cpu();
    match sched.current[cpu] {
        Some(idx) => Some(f(&mut sched.threads[idx])),
        None => None,
    }
}

/// Number of occupied thread-table slots.
pub fn thread_count() -> u64 {
    SCHED
        .lock()
        .threads
        .iter()
        .filter(|t| t.state != ThreadState::Unused)
        .count() as u64
}

/// Log the thread table.
pub fn dump() {
    let sched = SCHED.lock();
    log::info!("threads:");
    for t in sched.threads.iter() {
        if t.state == ThreadState::Unused {
            continue;
        }
        log::info!(
            "  id={} name={} state={:?} user={} prio={} cpu={}",
            t.id,
            t.name_str(),
            t.state,
            t.is_user,
            t.priority,
            t.cpu_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(sched: &mut Scheduler, cpu: u32, priority: u8) -> usize {
        let idx = sched.alloc_slot().unwrap();
        sched.threads[idx].cpu_id = cpu;
        sched.threads[idx].priority = priority;
        idx
    }

    #[test]
    fn slots_get_monotonic_ids_starting_at_one() {
        let mut sched = Scheduler::new();
        let a = sched.alloc_slot().unwrap();
        let b = sched.alloc_slot().unwrap();
        assert_eq!(sched.threads[a].id, 1);
        assert_eq!(sched.threads[b].id, 2);
        assert_eq!(sched.threads[a].state, ThreadState::Ready);
    }

    #[test]
    fn table_exhaustion_returns_none() {
        let mut sched = Scheduler::new();
        for _ in 0..MAX_THREADS {
            assert!(sched.alloc_slot().is_some());
        }
        assert!(sched.alloc_slot().is_none());
        // Reaping one slot makes it available again.
        sched.threads[5].state = ThreadState::Unused;
        assert_eq!(sched.alloc_slot(), Some(5));
    }

    #[test]
    fn pick_next_prefers_priority_then_table_order() {
        let mut sched = Scheduler::new();
        let low = ready(&mut sched, 0, 1);
        let high = ready(&mut sched, 0, 5);
        let high_later = ready(&mut sched, 0, 5);
        assert_eq!(sched.pick_next(0), high);
        sched.threads[high].state = ThreadState::Running;
        assert_eq!(sched.pick_next(0), high_later);
        sched.threads[high_later].state = ThreadState::Running;
        assert_eq!(sched.pick_next(0), low);
    }

    #[test]
    fn pick_next_ignores_other_cpus_queues() {
        let mut sched = Scheduler::new();
        let other = ready(&mut sched, 1, 9);
        let mine = ready(&mut sched, 0, 1);
        assert_eq!(sched.pick_next(0), mine);
        assert_eq!(sched.pick_next(1), other);
    }

    #[test]
    fn pick_next_keeps_running_current_without_ready_threads() {
        let mut sched = Scheduler::new();
        let cur = ready(&mut sched, 0, 1);
        sched.threads[cur].state = ThreadState::Running;
        sched.current[0] = Some(cur);
        assert_eq!(sched.pick_next(0), cur);
        // A zombie current falls back to the bootstrap slot.
        sched.threads[cur].state = ThreadState::Zombie;
        assert_eq!(sched.pick_next(0), 0);
    }

    #[test]
    fn sleepers_wake_when_deadline_passes() {
        let mut sched = Scheduler::new();
        let idx = ready(&mut sched, 0, 1);
        sched.threads[idx].state = ThreadState::Sleeping;
        sched.threads[idx].wakeup_tick = 100;

        sched.wake_sleepers(99);
        assert_eq!(sched.threads[idx].state, ThreadState::Sleeping);
        sched.wake_sleepers(100);
        assert_eq!(sched.threads[idx].state, ThreadState::Ready);
    }

    #[test]
    fn zombie_child_wakes_blocked_parent() {
        let mut sched = Scheduler::new();
        let parent = ready(&mut sched, 0, 1);
        let child = ready(&mut sched, 0, 1);
        let parent_id = sched.threads[parent].id;
        sched.threads[child].parent = Some(parent_id);
        sched.threads[parent].children = 1;
        sched.threads[parent].state = ThreadState::Blocked;
        sched.threads[parent].wait_target = 0; // any child

        sched.mark_zombie(child, 7);
        assert_eq!(sched.threads[child].state, ThreadState::Zombie);
        assert_eq!(sched.threads[child].exit_code, 7);
        assert_eq!(sched.threads[parent].state, ThreadState::Ready);
        assert_eq!(sched.threads[parent].children, 0);
        // The parent consumed the status; the slot is now sweepable.
        assert!(sched.threads[child].reap_pending);
    }

    #[test]
    fn consumed_zombies_are_reaped_once_off_cpu() {
        let mut sched = Scheduler::new();
        let zombie = ready(&mut sched, 0, 1);
        sched.threads[zombie].state = ThreadState::Zombie;
        sched.threads[zombie].reap_pending = true;

        // Still current on CPU 0 (a killed thread coasting to its next
        // trap): must not be reaped yet.
        sched.current[0] = Some(zombie);
        sched.reap_zombies();
        assert_eq!(sched.threads[zombie].state, ThreadState::Zombie);

        sched.current[0] = None;
        sched.reap_zombies();
        assert_eq!(sched.threads[zombie].state, ThreadState::Unused);
    }

    #[test]
    fn parent_waiting_for_other_child_stays_blocked() {
        let mut sched = Scheduler::new();
        let parent = ready(&mut sched, 0, 1);
        let child = ready(&mut sched, 0, 1);
        let parent_id = sched.threads[parent].id;
        sched.threads[child].parent = Some(parent_id);
        sched.threads[parent].state = ThreadState::Blocked;
        sched.threads[parent].wait_target = 9999;

        sched.mark_zombie(child, 1);
        assert_eq!(sched.threads[parent].state, ThreadState::Blocked);
    }

    #[test]
    fn find_child_honors_pid_and_zombie_filters() {
        let mut sched = Scheduler::new();
        let parent = ready(&mut sched, 0, 1);
        let child = ready(&mut sched, 0, 1);
        let parent_id = sched.threads[parent].id;
        let child_id = sched.threads[child].id;
        sched.threads[child].parent = Some(parent_id);

        assert_eq!(sched.find_child(parent_id, -1, false), Some(child));
        assert_eq!(sched.find_child(parent_id, child_id as i64, false), Some(child));
        assert_eq!(sched.find_child(parent_id, child_id as i64 + 5, false), None);
        assert_eq!(sched.find_child(parent_id, -1, true), None);
        sched.threads[child].state = ThreadState::Zombie;
        assert_eq!(sched.find_child(parent_id, -1, true), Some(child));
    }
}
