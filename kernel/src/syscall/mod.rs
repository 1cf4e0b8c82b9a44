//! System call dispatcher.
//!
//! Entered through software interrupt 0x80. The number arrives in RAX,
//! arguments in RDI/RSI/RDX/R10/R8/R9, and the result is written back into
//! the frame's RAX (-1 on any failure). Ring-3 callers must be user
//! threads and ring-0 callers kernel threads; a mismatch is refused before
//! decoding.
//!
//! Userspace pointers are trusted by this kernel (no copy-in/out
//! validation); hardening against a hostile userland is an accepted
//! non-goal.

use alloc::vec;
use alloc::vec::Vec;

use crate::arch::x86_64::interrupts::TrapFrame;
use crate::arch::x86_64::pit;
use crate::error::KernelResult;
use crate::mm::{align_down, align_up, frame, paging, PageFlags, PAGE_SIZE};
use crate::sched::{self, thread::USTACK_PAGES};
use crate::time::{self, TimeVal};
use crate::{elf, fs, serial};

/// Yield's registry number, used by the in-kernel sleep helper to issue
/// `int 0x80` directly.
pub const SYS_YIELD: u64 = 3;

const NEG_ONE: u64 = u64::MAX;
const PATH_MAX: usize = 512;

/// System call numbers. A stable registry; gaps are not reused.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Write = 1,
    Exit = 2,
    Yield = 3,
    Brk = 4,
    Fork = 5,
    Execve = 6,
    Waitpid = 7,
    GetTimeOfDay = 8,
    Sleep = 9,
    Socket = 10,
    Bind = 11,
    SendTo = 12,
    RecvFrom = 13,
    Connect = 14,
    Listen = 15,
    Accept = 16,
    Close = 17,
    Open = 18,
    Read = 19,
    LSeek = 20,
    GetPid = 21,
    Uname = 22,
    SysInfo = 23,
    Mmap = 24,
    Kill = 25,
    ReadDir = 26,
}

impl TryFrom<u64> for Syscall {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, ()> {
        Ok(match value {
            1 => Syscall::Write,
            2 => Syscall::Exit,
            3 => Syscall::Yield,
            4 => Syscall::Brk,
            5 => Syscall::Fork,
            6 => Syscall::Execve,
            7 => Syscall::Waitpid,
            8 => Syscall::GetTimeOfDay,
            9 => Syscall::Sleep,
            10 => Syscall::Socket,
            11 => Syscall::Bind,
            12 => Syscall::SendTo,
            13 => Syscall::RecvFrom,
            14 => Syscall::Connect,
            15 => Syscall::Listen,
            16 => Syscall::Accept,
            17 => Syscall::Close,
            18 => Syscall::Open,
            19 => Syscall::Read,
            20 => Syscall::LSeek,
            21 => Syscall::GetPid,
            22 => Syscall::Uname,
            23 => Syscall::SysInfo,
            24 => Syscall::Mmap,
            25 => Syscall::Kill,
            26 => Syscall::ReadDir,
            _ => return Err(()),
        })
    }
}

pub const UTSNAME_LEN: usize = 32;

/// `uname` output layout shared with userspace.
#[repr(C)]
pub struct Utsname {
    pub sysname: [u8; UTSNAME_LEN],
    pub nodename: [u8; UTSNAME_LEN],
    pub release: [u8; UTSNAME_LEN],
    pub version: [u8; UTSNAME_LEN],
    pub machine: [u8; UTSNAME_LEN],
}

/// `sysinfo` output layout shared with userspace.
#[repr(C)]
#[derive(Default)]
pub struct Sysinfo {
    pub uptime: u64,
    pub totalram: u64,
    pub freeram: u64,
    pub sharedram: u64,
    pub bufferram: u64,
    pub totalswap: u64,
    pub freeswap: u64,
    pub procs: u16,
}

// Seek whence values.
const SEEK_SET: u64 = 0;
const SEEK_CUR: u64 = 1;
const SEEK_END: u64 = 2;

fn user_slice<'a>(ptr: u64, len: u64) -> Option<&'a [u8]> {
    if ptr == 0 {
        return None;
    }
    // SAFETY: userspace pointers are trusted (documented non-goal); the
    // mapping is live in the current address space.
    Some(unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) })
}

fn user_slice_mut<'a>(ptr: u64, len: u64) -> Option<&'a mut [u8]> {
    if ptr == 0 {
        return None;
    }
    // SAFETY: as above.
    Some(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}

/// Read a NUL-terminated user string, capped at `PATH_MAX`.
fn user_cstr<'a>(ptr: u64) -> Option<&'a str> {
    if ptr == 0 {
        return None;
    }
    let mut len = 0usize;
    // SAFETY: trusted user pointer; bounded scan for the terminator.
    unsafe {
        while len < PATH_MAX {
            if core::ptr::read((ptr + len as u64) as *const u8) == 0 {
                break;
            }
            len += 1;
        }
        let bytes = core::slice::from_raw_parts(ptr as *const u8, len);
        core::str::from_utf8(bytes).ok()
    }
}

/// Copy a &str into a fixed NUL-padded field.
fn fill_field(dst: &mut [u8], src: &str) {
    for (d, s) in dst.iter_mut().zip(src.bytes()) {
        *d = s;
    }
}

/// Dispatch one system call. Returns the frame to resume with (a different
/// one if the call switched threads).
pub fn handle(frame: &mut TrapFrame) -> *mut TrapFrame {
    let is_user_thread = sched::with_current(|t| t.is_user).unwrap_or(false);
    if frame.from_user() {
        if !is_user_thread {
            log::warn!("denied: ring-3 syscall without a user thread");
            frame.rax = NEG_ONE;
            return frame;
        }
    } else if is_user_thread {
        log::warn!("denied: ring-0 syscall from a user thread");
        frame.rax = NEG_ONE;
        return frame;
    }

    let Ok(syscall) = Syscall::try_from(frame.rax) else {
        log::warn!("unknown syscall {}", frame.rax);
        frame.rax = NEG_ONE;
        return frame;
    };

    match syscall {
        Syscall::Exit => return sched::on_exit(frame, frame.rdi as i32),
        Syscall::Yield => {
            frame.rax = 0;
            return sched::yield_now(frame);
        }
        Syscall::Fork => return sched::fork(frame),
        Syscall::Execve => return sys_exec(frame),
        Syscall::Waitpid => {
            return sched::waitpid(frame, frame.rdi as i64, frame.rsi);
        }
        Syscall::Kill => {
            let pid = frame.rdi as i64;
            let sig = frame.rsi as i32;
            let self_id = sched::current_thread_id() as i64;
            if pid == 0 || pid == self_id {
                return sched::on_exit(frame, -sig);
            }
            frame.rax = sched::kill(pid, sig) as u64;
            return frame;
        }
        _ => {}
    }

    frame.rax = match syscall {
        Syscall::Write => sys_write(frame.rdi, frame.rsi, frame.rdx),
        Syscall::Brk => sys_brk(frame.rdi),
        Syscall::GetTimeOfDay => sys_gettimeofday(frame.rdi),
        Syscall::Sleep => sys_sleep(frame.rdi),
        Syscall::Open => sys_open(frame.rdi, frame.rsi),
        Syscall::Read => sys_read(frame.rdi, frame.rsi, frame.rdx),
        Syscall::LSeek => sys_lseek(frame.rdi, frame.rsi as i64, frame.rdx),
        Syscall::Close => sys_close(frame.rdi),
        Syscall::ReadDir => sys_readdir(frame.rdi, frame.rsi, frame.rdx),
        Syscall::GetPid => sched::current_thread_id(),
        Syscall::Uname => sys_uname(frame.rdi),
        Syscall::SysInfo => sys_sysinfo(frame.rdi),
        Syscall::Mmap => sys_mmap(frame.rdi, frame.rsi, frame.rdx as u32),
        // The loopback socket stack is an external collaborator this core
        // does not carry; its surface reports failure.
        Syscall::Socket
        | Syscall::Bind
        | Syscall::SendTo
        | Syscall::RecvFrom
        | Syscall::Connect
        | Syscall::Listen
        | Syscall::Accept => NEG_ONE,
        // Handled above.
        Syscall::Exit
        | Syscall::Yield
        | Syscall::Fork
        | Syscall::Execve
        | Syscall::Waitpid
        | Syscall::Kill => unreachable!(),
    };
    frame
}

// ---------------------------------------------------------------------------
// File descriptors
// ---------------------------------------------------------------------------

fn fd_index(fd: u64) -> Option<usize> {
    let fd = fd as i64;
    if fd < 3 {
        return None;
    }
    let idx = (fd - 3) as usize;
    (idx < sched::thread::MAX_OPEN_FILES).then_some(idx)
}

/// Clone the handle out, run the VFS operation without the scheduler lock,
/// and store the advanced offset back.
fn with_fd<R>(fd: u64, op: impl FnOnce(&mut fs::OpenFile) -> KernelResult<R>) -> Option<R> {
    let idx = fd_index(fd)?;
    let mut file = sched::with_current(|t| t.open_files[idx].clone()).flatten()?;
    let result = op(&mut file).ok()?;
    let offset = file.offset;
    sched::with_current_mut(|t| {
        if let Some(f) = &mut t.open_files[idx] {
            f.offset = offset;
        }
    });
    Some(result)
}

fn sys_write(fd: u64, buf: u64, len: u64) -> u64 {
    if fd == 1 || fd == 2 {
        let Some(bytes) = user_slice(buf, len) else {
            return NEG_ONE;
        };
        serial::write_bytes(bytes);
        return len;
    }
    let Some(bytes) = user_slice(buf, len) else {
        return NEG_ONE;
    };
    match with_fd(fd, |file| fs::write(file, bytes)) {
        Some(n) => n as u64,
        None => NEG_ONE,
    }
}

fn sys_read(fd: u64, buf: u64, len: u64) -> u64 {
    if fd == 0 {
        // No input driver in this core; stdin is empty.
        return 0;
    }
    let Some(bytes) = user_slice_mut(buf, len) else {
        return NEG_ONE;
    };
    match with_fd(fd, |file| fs::read(file, bytes)) {
        Some(n) => n as u64,
        None => NEG_ONE,
    }
}

fn sys_open(path_ptr: u64, flags: u64) -> u64 {
    let is_user = sched::with_current(|t| t.is_user).unwrap_or(false);
    let Some(path) = user_cstr(path_ptr) else {
        return NEG_ONE;
    };
    if !is_user {
        return NEG_ONE;
    }
    let Ok(file) = fs::open(path, flags as u32) else {
        return NEG_ONE;
    };
    let fd = sched::with_current_mut(|t| {
        for (idx, slot) in t.open_files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file.clone());
                return Some(idx as u64 + 3);
            }
        }
        None
    });
    match fd.flatten() {
        Some(fd) => fd,
        None => NEG_ONE,
    }
}

fn sys_close(fd: u64) -> u64 {
    let Some(idx) = fd_index(fd) else {
        return NEG_ONE;
    };
    let closed = sched::with_current_mut(|t| t.open_files[idx].take().is_some());
    match closed {
        Some(true) => 0,
        _ => NEG_ONE,
    }
}

fn sys_lseek(fd: u64, offset: i64, whence: u64) -> u64 {
    let Some(idx) = fd_index(fd) else {
        return NEG_ONE;
    };
    let result = sched::with_current_mut(|t| {
        let file = t.open_files[idx].as_mut()?;
        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => file.offset as i64,
            SEEK_END => file.node.size() as i64,
            _ => return None,
        };
        let new_pos = base.checked_add(offset)?;
        if new_pos < 0 {
            return None;
        }
        file.offset = new_pos as usize;
        Some(new_pos as u64)
    });
    match result.flatten() {
        Some(pos) => pos,
        None => NEG_ONE,
    }
}

fn sys_readdir(fd: u64, buf: u64, len: u64) -> u64 {
    if len == 0 {
        return NEG_ONE;
    }
    let Some(out) = user_slice_mut(buf, len) else {
        return NEG_ONE;
    };
    let entry = with_fd(fd, fs::readdir);
    match entry {
        Some(Some(name)) => {
            let n = name.len().min(out.len() - 1);
            out[..n].copy_from_slice(&name.as_bytes()[..n]);
            out[n] = 0;
            n as u64
        }
        Some(None) => 0,
        None => NEG_ONE,
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

fn sys_brk(new_end: u64) -> u64 {
    let info = sched::with_current(|t| (t.is_user, t.cr3, t.brk_start, t.brk_end));
    let Some((true, cr3, brk_start, brk_end)) = info else {
        return NEG_ONE;
    };
    if new_end == 0 {
        return brk_end;
    }
    match paging::set_brk(cr3, brk_start, brk_end, new_end) {
        Ok(updated) => {
            sched::with_current_mut(|t| t.brk_end = updated);
            updated
        }
        Err(_) => NEG_ONE,
    }
}

fn sys_mmap(addr: u64, len: u64, prot: u32) -> u64 {
    let info = sched::with_current(|t| (t.is_user, t.cr3, t.mmap_base));
    let Some((true, cr3, mmap_base)) = info else {
        return NEG_ONE;
    };
    if len == 0 {
        return NEG_ONE;
    }

    let size = align_up(len, PAGE_SIZE);
    let base = if addr != 0 {
        align_down(addr, PAGE_SIZE)
    } else {
        align_up(mmap_base, PAGE_SIZE)
    };

    let mut flags = PageFlags::PRESENT | PageFlags::USER;
    if prot & 0x2 != 0 {
        flags |= PageFlags::WRITABLE;
    }
    if prot & 0x4 == 0 {
        flags |= PageFlags::NO_EXECUTE;
    }

    let mut mapped = 0u64;
    while mapped < size {
        let Ok(pa) = frame::alloc_zeroed_frame() else {
            break;
        };
        if paging::map_page(cr3, base + mapped, pa, flags).is_err() {
            frame::free_frames(pa, 1);
            break;
        }
        mapped += PAGE_SIZE;
    }

    if mapped != size {
        // Partial mapping: roll everything back.
        let mut off = 0;
        while off < mapped {
            if let Some(pa) = paging::unmap_page(cr3, base + off) {
                frame::free_frames(pa, 1);
            }
            off += PAGE_SIZE;
        }
        return NEG_ONE;
    }

    if addr == 0 {
        sched::with_current_mut(|t| t.mmap_base = base + size);
    }
    base
}

// ---------------------------------------------------------------------------
// Time and info
// ---------------------------------------------------------------------------

fn sys_gettimeofday(tv_ptr: u64) -> u64 {
    if tv_ptr == 0 {
        return NEG_ONE;
    }
    let mut tv = TimeVal::default();
    time::gettimeofday(&mut tv);
    // SAFETY: trusted user pointer.
    unsafe { core::ptr::write_unaligned(tv_ptr as *mut TimeVal, tv) };
    0
}

fn sys_sleep(ms: u64) -> u64 {
    let hz = pit::frequency_hz() as u64;
    if hz == 0 {
        return NEG_ONE;
    }
    let ticks = (ms * hz + 999) / 1000;
    sched::sleep_ticks(ticks);
    0
}

fn sys_uname(out_ptr: u64) -> u64 {
    if out_ptr == 0 {
        return NEG_ONE;
    }
    // SAFETY: Utsname is plain-old-data; all-zero is a valid value.
    let mut info: Utsname = unsafe { core::mem::zeroed() };
    fill_field(&mut info.sysname, crate::OS_NAME);
    fill_field(&mut info.nodename, "ferrite");
    fill_field(&mut info.release, crate::OS_RELEASE);
    fill_field(&mut info.version, "dev");
    fill_field(&mut info.machine, "x86_64");
    // SAFETY: trusted user pointer to a Utsname-sized buffer.
    unsafe { core::ptr::write_unaligned(out_ptr as *mut Utsname, info) };
    0
}

fn sys_sysinfo(out_ptr: u64) -> u64 {
    if out_ptr == 0 {
        return NEG_ONE;
    }
    let info = Sysinfo {
        uptime: time::uptime_ms() / 1000,
        totalram: frame::total_bytes(),
        freeram: frame::free_bytes(),
        procs: sched::thread_count() as u16,
        ..Sysinfo::default()
    };
    // SAFETY: trusted user pointer to a Sysinfo-sized buffer.
    unsafe { core::ptr::write_unaligned(out_ptr as *mut Sysinfo, info) };
    0
}

// ---------------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------------

/// `execve`: load a fresh image into a fresh address space and swap the
/// calling thread onto it. On any failure the original state is untouched
/// and -1 is returned.
fn sys_exec(frame: &mut TrapFrame) -> *mut TrapFrame {
    let is_user = sched::with_current(|t| t.is_user).unwrap_or(false);
    if !is_user {
        frame.rax = NEG_ONE;
        return frame;
    }
    let Some(path) = user_cstr(frame.rdi) else {
        frame.rax = NEG_ONE;
        return frame;
    };

    let Ok(mut file) = fs::open(path, fs::O_RDONLY) else {
        frame.rax = NEG_ONE;
        return frame;
    };
    let size = file.node.size();
    let mut image: Vec<u8> = vec![0; size];
    if size > 0 {
        match fs::read(&mut file, &mut image) {
            Ok(n) if n == size => {}
            _ => {
                frame.rax = NEG_ONE;
                return frame;
            }
        }
    }

    let Ok(new_cr3) = paging::create_user_space() else {
        frame.rax = NEG_ONE;
        return frame;
    };
    let loaded = match elf::load(&image, new_cr3) {
        Ok(loaded) => loaded,
        Err(_) => {
            paging::release(new_cr3);
            frame.rax = NEG_ONE;
            return frame;
        }
    };

    // Fresh user stack in the new space, at the standard top.
    let ustack_size = USTACK_PAGES as u64 * PAGE_SIZE;
    let Ok(ustack_phys) = frame::alloc_frames(USTACK_PAGES) else {
        paging::release(new_cr3);
        frame.rax = NEG_ONE;
        return frame;
    };
    // SAFETY: freshly allocated, identity-mapped stack frames.
    unsafe { core::ptr::write_bytes(ustack_phys as *mut u8, 0, ustack_size as usize) };
    if paging::map_range(
        new_cr3,
        paging::USER_STACK_TOP - ustack_size,
        ustack_phys,
        ustack_size,
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
    )
    .is_err()
    {
        frame::free_frames(ustack_phys, USTACK_PAGES);
        paging::release(new_cr3);
        frame.rax = NEG_ONE;
        return frame;
    }

    sched::exec_replace(
        frame,
        new_cr3,
        loaded.entry,
        loaded.initial_brk,
        ustack_phys,
        ustack_size,
    );
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_are_stable() {
        assert_eq!(Syscall::try_from(1), Ok(Syscall::Write));
        assert_eq!(Syscall::try_from(5), Ok(Syscall::Fork));
        assert_eq!(Syscall::try_from(7), Ok(Syscall::Waitpid));
        assert_eq!(Syscall::try_from(17), Ok(Syscall::Close));
        assert_eq!(Syscall::try_from(26), Ok(Syscall::ReadDir));
        assert!(Syscall::try_from(0).is_err());
        assert!(Syscall::try_from(27).is_err());
        assert_eq!(SYS_YIELD, Syscall::Yield as u64);
    }

    #[test]
    fn fd_index_maps_past_the_standard_streams() {
        assert_eq!(fd_index(0), None);
        assert_eq!(fd_index(2), None);
        assert_eq!(fd_index(3), Some(0));
        assert_eq!(
            fd_index(3 + sched::thread::MAX_OPEN_FILES as u64 - 1),
            Some(sched::thread::MAX_OPEN_FILES - 1)
        );
        assert_eq!(fd_index(3 + sched::thread::MAX_OPEN_FILES as u64), None);
        assert_eq!(fd_index(u64::MAX), None); // -1 stays invalid
    }

    #[test]
    fn info_structs_match_the_abi() {
        assert_eq!(core::mem::size_of::<Utsname>(), 5 * UTSNAME_LEN);
        assert_eq!(core::mem::size_of::<TimeVal>(), 16);
        // uptime..freeswap are 7 u64 fields, then procs + padding.
        assert_eq!(core::mem::offset_of!(Sysinfo, procs), 56);
    }

    #[test]
    fn field_fill_truncates_without_overflow() {
        let mut buf = [0u8; 8];
        fill_field(&mut buf, "a-very-long-name");
        assert_eq!(&buf, b"a-very-l");
        let mut buf = [0xFFu8; 8];
        fill_field(&mut buf, "ab");
        assert_eq!(&buf[..2], b"ab");
    }
}
