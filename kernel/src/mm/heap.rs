//! Kernel heap.
//!
//! Carves a fixed region out of the frame allocator and hands it to the
//! linked-list allocator behind `#[global_allocator]`. Everything in the
//! kernel that uses `alloc` (VFS nodes, exec buffers, open-file duplication)
//! draws from this region.

use crate::error::KernelResult;
use crate::mm::{frame, PAGE_SIZE};

/// Heap size: 8 MiB.
pub const HEAP_PAGES: usize = 2048;

pub fn init() -> KernelResult<()> {
    let base = frame::alloc_frames(HEAP_PAGES)?;
    #[cfg(target_os = "none")]
    {
        // SAFETY: the region was just allocated, is identity-mapped, and is
        // handed to the allocator exactly once.
        unsafe {
            crate::kernel_heap()
                .lock()
                .init(base as *mut u8, HEAP_PAGES * PAGE_SIZE as usize);
        }
    }
    log::info!(
        "kernel heap: {} KiB at {base:#x}",
        HEAP_PAGES as u64 * PAGE_SIZE / 1024
    );
    Ok(())
}
