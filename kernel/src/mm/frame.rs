//! Physical frame allocator.
//!
//! A flat bitmap over the first 4 GiB of physical memory, one bit per 4 KiB
//! frame (set = free). Allocation is a first-fit linear scan for a run of
//! free frames; a free-frame counter is kept in lockstep with the bitmap so
//! an impossible request fails in O(1).

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::boot::BootInfo;
use crate::error::{KernelError, KernelResult};
use crate::mm::{align_down, align_up, PAGE_SIZE};

/// Highest physical address tracked by the bitmap (identity-mapped bound).
pub const MAX_PHYS_BYTES: u64 = 4 * 1024 * 1024 * 1024;

const MAX_FRAMES: u64 = MAX_PHYS_BYTES / PAGE_SIZE;
const BITMAP_WORDS: usize = (MAX_FRAMES / 64) as usize;

/// The frame bitmap. Kept as a plain struct so the allocation logic can be
/// driven directly in unit tests; the kernel uses the global instance below.
pub struct FrameBitmap {
    /// One bit per frame, set = free. Starts all-used; `init` frees the
    /// ranges the firmware reports as available.
    bits: [u64; BITMAP_WORDS],
    free_frames: u64,
}

impl FrameBitmap {
    pub const fn new() -> Self {
        Self {
            bits: [0; BITMAP_WORDS],
            free_frames: 0,
        }
    }

    #[inline]
    fn is_free(&self, frame: u64) -> bool {
        self.bits[(frame / 64) as usize] >> (frame % 64) & 1 != 0
    }

    #[inline]
    fn mark_free(&mut self, frame: u64) {
        if !self.is_free(frame) {
            self.bits[(frame / 64) as usize] |= 1 << (frame % 64);
            self.free_frames += 1;
        }
    }

    #[inline]
    fn mark_used(&mut self, frame: u64) {
        if self.is_free(frame) {
            self.bits[(frame / 64) as usize] &= !(1 << (frame % 64));
            self.free_frames -= 1;
        }
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> u64 {
        self.free_frames
    }

    /// Number of frames the bitmap tracks.
    pub fn total_frames(&self) -> u64 {
        MAX_FRAMES
    }

    /// Count the set bits the slow way (test support for the lockstep
    /// counter invariant).
    pub fn count_free_bits(&self) -> u64 {
        self.bits.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Mark a byte range free, rounding inward so a partial page at either
    /// end is never freed. Clips silently outside the tracked region.
    pub fn free_range(&mut self, addr: u64, size: u64) {
        let start = align_up(addr, PAGE_SIZE);
        let end = align_down(addr.saturating_add(size), PAGE_SIZE).min(MAX_PHYS_BYTES);
        if end <= start {
            return;
        }
        for frame in start / PAGE_SIZE..end / PAGE_SIZE {
            self.mark_free(frame);
        }
    }

    /// Mark a byte range used, rounding outward so a partially covered page
    /// is always reserved. Clips silently outside the tracked region.
    pub fn reserve_range(&mut self, addr: u64, size: u64) {
        let start = align_down(addr, PAGE_SIZE);
        let end = align_up(addr.saturating_add(size), PAGE_SIZE).min(MAX_PHYS_BYTES);
        if end <= start {
            return;
        }
        for frame in start / PAGE_SIZE..end / PAGE_SIZE {
            self.mark_used(frame);
        }
    }

    /// Allocate `pages` contiguous frames, first-fit. Returns the physical
    /// base address.
    pub fn alloc(&mut self, pages: usize) -> Option<u64> {
        if pages == 0 || pages as u64 > self.free_frames {
            return None;
        }
        let mut run = 0u64;
        let mut start = 0u64;
        for frame in 0..MAX_FRAMES {
            if self.is_free(frame) {
                if run == 0 {
                    start = frame;
                }
                run += 1;
                if run == pages as u64 {
                    for f in start..start + run {
                        self.mark_used(f);
                    }
                    return Some(start * PAGE_SIZE);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Free `pages` frames starting at `addr`. Frames that are already free
    /// (or out of range) are left untouched.
    pub fn free(&mut self, addr: u64, pages: usize) {
        if addr == 0 {
            return;
        }
        let start = addr / PAGE_SIZE;
        for frame in start..(start + pages as u64).min(MAX_FRAMES) {
            self.mark_free(frame);
        }
    }
}

static FRAMES: Mutex<FrameBitmap> = Mutex::new(FrameBitmap::new());
static READY: AtomicBool = AtomicBool::new(false);

// Linker-provided bounds of the kernel image.
#[cfg(target_os = "none")]
#[allow(non_upper_case_globals)]
extern "C" {
    static _kernel_start: u8;
    static _kernel_end: u8;
}

#[cfg(target_os = "none")]
fn kernel_image_range() -> (u64, u64) {
    // SAFETY: taking the addresses of linker symbols; never dereferenced.
    unsafe {
        (
            &_kernel_start as *const u8 as u64,
            &_kernel_end as *const u8 as u64,
        )
    }
}

#[cfg(not(target_os = "none"))]
fn kernel_image_range() -> (u64, u64) {
    (0, 0)
}

/// Initialize the allocator from the firmware memory map: free every
/// available range, then re-reserve the low megabyte, the kernel image, and
/// the boot information blob.
pub fn init(boot: &BootInfo) -> KernelResult<()> {
    let mut bitmap = FRAMES.lock();

    let map = boot.memory_map().map_err(|e| {
        log::error!("no memory map from firmware; all frames stay reserved");
        e
    })?;
    for region in map {
        if region.is_available() {
            bitmap.free_range(region.addr, region.len);
        }
    }

    // BIOS data, real-mode IVT, VGA, AP trampoline landing page.
    bitmap.reserve_range(0, 0x10_0000);

    let (kstart, kend) = kernel_image_range();
    bitmap.reserve_range(kstart, kend - kstart);
    bitmap.reserve_range(boot.base_addr(), boot.total_size() as u64);

    let free = bitmap.free_frames();
    let total = bitmap.total_frames();
    log::info!(
        "frame allocator: {} tracked pages, {} used, {} free",
        total,
        total - free,
        free
    );
    READY.store(true, Ordering::Release);
    Ok(())
}

/// Allocate `pages` contiguous frames from the global bitmap.
pub fn alloc_frames(pages: usize) -> KernelResult<u64> {
    if !READY.load(Ordering::Acquire) {
        return Err(KernelError::NotInitialized {
            subsystem: "frame allocator",
        });
    }
    FRAMES.lock().alloc(pages).ok_or(KernelError::OutOfMemory)
}

/// Allocate one frame and zero it through the identity map.
pub fn alloc_zeroed_frame() -> KernelResult<u64> {
    let pa = alloc_frames(1)?;
    // SAFETY: the frame was just handed out by the allocator and physical
    // memory below 4 GiB is identity-mapped.
    unsafe { core::ptr::write_bytes(pa as *mut u8, 0, PAGE_SIZE as usize) };
    Ok(pa)
}

/// Return `pages` frames starting at `addr` to the free pool.
pub fn free_frames(addr: u64, pages: usize) {
    FRAMES.lock().free(addr, pages);
}

/// Reserve an arbitrary byte range (rounds outward).
pub fn reserve_range(addr: u64, size: u64) {
    FRAMES.lock().reserve_range(addr, size);
}

/// Free an arbitrary byte range (rounds inward).
pub fn free_range(addr: u64, size: u64) {
    FRAMES.lock().free_range(addr, size);
}

/// Total tracked memory in bytes.
pub fn total_bytes() -> u64 {
    FRAMES.lock().total_frames() * PAGE_SIZE
}

/// Currently free memory in bytes.
pub fn free_bytes() -> u64 {
    FRAMES.lock().free_frames() * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn bitmap_with_16_mib() -> Box<FrameBitmap> {
        // The bitmap is large; keep test instances on the heap. Page 0 stays
        // reserved so a successful alloc is never ambiguous with address 0.
        let mut bitmap = Box::new(FrameBitmap::new());
        bitmap.free_range(PAGE_SIZE, 16 * 1024 * 1024);
        bitmap
    }

    #[test]
    fn counter_tracks_bitmap() {
        let mut bitmap = bitmap_with_16_mib();
        assert_eq!(bitmap.free_frames(), bitmap.count_free_bits());

        let a = bitmap.alloc(3).unwrap();
        let b = bitmap.alloc(1).unwrap();
        bitmap.free(a, 3);
        bitmap.reserve_range(b, PAGE_SIZE);
        bitmap.free_range(0x20_0000, 0x1_0000);
        assert_eq!(bitmap.free_frames(), bitmap.count_free_bits());
    }

    #[test]
    fn alloc_returns_contiguous_previously_free_run() {
        let mut bitmap = bitmap_with_16_mib();
        let before = bitmap.free_frames();
        let base = bitmap.alloc(4).unwrap();
        assert_eq!(base % PAGE_SIZE, 0);
        assert_eq!(bitmap.free_frames(), before - 4);
        for i in 0..4 {
            assert!(!bitmap.is_free(base / PAGE_SIZE + i));
        }
    }

    #[test]
    fn alloc_skips_reserved_hole() {
        let mut bitmap = bitmap_with_16_mib();
        // Punch a hole so the first fitting run starts after it.
        bitmap.reserve_range(0, 8 * PAGE_SIZE);
        bitmap.reserve_range(10 * PAGE_SIZE, PAGE_SIZE);
        let base = bitmap.alloc(4).unwrap();
        assert_eq!(base, 11 * PAGE_SIZE);
    }

    #[test]
    fn alloc_fails_fast_when_not_enough_memory() {
        let mut bitmap = Box::new(FrameBitmap::new());
        bitmap.free_range(0, 4 * PAGE_SIZE);
        assert!(bitmap.alloc(5).is_none());
        assert!(bitmap.alloc(0).is_none());
        assert_eq!(bitmap.free_frames(), 4);
    }

    #[test]
    fn free_of_free_page_is_noop() {
        let mut bitmap = bitmap_with_16_mib();
        let before = bitmap.free_frames();
        bitmap.free(PAGE_SIZE, 1);
        assert_eq!(bitmap.free_frames(), before);
    }

    #[test]
    fn reserve_rounds_outward_free_rounds_inward() {
        let mut bitmap = Box::new(FrameBitmap::new());
        // Freeing a range that covers page 1 only partially must not free it.
        bitmap.free_range(PAGE_SIZE + 1, 2 * PAGE_SIZE);
        assert!(!bitmap.is_free(1));
        assert!(bitmap.is_free(2));
        assert!(!bitmap.is_free(3));

        // Reserving one byte of page 2 must reserve the whole page.
        bitmap.reserve_range(2 * PAGE_SIZE + 7, 1);
        assert!(!bitmap.is_free(2));
    }

    #[test]
    fn range_ops_clip_outside_tracked_region() {
        let mut bitmap = Box::new(FrameBitmap::new());
        bitmap.free_range(MAX_PHYS_BYTES - PAGE_SIZE, 4 * PAGE_SIZE);
        assert_eq!(bitmap.free_frames(), 1);
        bitmap.reserve_range(MAX_PHYS_BYTES + PAGE_SIZE, PAGE_SIZE);
        assert_eq!(bitmap.free_frames(), 1);
    }
}
