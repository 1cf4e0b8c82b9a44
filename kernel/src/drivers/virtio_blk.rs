//! Legacy virtio block driver.
//!
//! Drives a virtio-pci block device (vendor 0x1AF4, device 0x1001) through
//! the legacy I/O-port register layout with a single split virtqueue.
//! Exactly one request is in flight at a time: a three-descriptor chain
//! (request header, 512-byte data buffer, status byte) is published in the
//! available ring, the device is notified through the queue-notify port,
//! and completion is spin-waited via the used ring's index.

use core::sync::atomic::{compiler_fence, Ordering};

use spin::Mutex;

use crate::arch::pause;
use crate::drivers::pci;
use crate::mm::{align_up, frame, PAGE_SIZE};

/// Block size of the device surface.
pub const SECTOR_SIZE: usize = 512;

// Legacy virtio-pci register offsets from the BAR0 I/O base.
const REG_HOST_FEATURES: u16 = 0x00; // u32
const REG_GUEST_FEATURES: u16 = 0x04; // u32
const REG_QUEUE_PFN: u16 = 0x08; // u32
const REG_QUEUE_SIZE: u16 = 0x0C; // u16
const REG_QUEUE_SELECT: u16 = 0x0E; // u16
const REG_QUEUE_NOTIFY: u16 = 0x10; // u16
const REG_STATUS: u16 = 0x12; // u8
const REG_DEVICE_CONFIG: u16 = 0x14;

const STATUS_ACK: u8 = 0x01;
const STATUS_DRIVER: u8 = 0x02;
const STATUS_DRIVER_OK: u8 = 0x04;
const STATUS_FAILED: u8 = 0x80;

const VIRTQ_DESC_F_NEXT: u16 = 1;
const VIRTQ_DESC_F_WRITE: u16 = 2;

const REQUEST_READ: u32 = 0;
const REQUEST_WRITE: u32 = 1;

/// Descriptor table entry of the split virtqueue.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

/// 16-byte request header preceding the data descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlkRequest {
    typ: u32,
    reserved: u32,
    sector: u64,
}

/// Offsets of the three virtqueue regions inside one contiguous
/// allocation: descriptors at the base, available ring right after, used
/// ring on the next page boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    pub desc_bytes: usize,
    pub avail_offset: usize,
    pub used_offset: usize,
    pub total_bytes: usize,
}

/// Compute the legacy layout for a queue of `n` descriptors.
pub fn queue_layout(n: u16) -> QueueLayout {
    let n = n as usize;
    let desc_bytes = n * core::mem::size_of::<VirtqDesc>();
    let avail_bytes = 6 + 2 * n;
    let used_offset = align_up((desc_bytes + avail_bytes) as u64, PAGE_SIZE) as usize;
    let used_bytes = 6 + 8 * n;
    let total_bytes = align_up((used_offset + used_bytes) as u64, PAGE_SIZE) as usize;
    QueueLayout {
        desc_bytes,
        avail_offset: desc_bytes,
        used_offset,
        total_bytes,
    }
}

struct VirtioBlk {
    io_base: u16,
    queue_size: u16,
    queue_mem: u64,
    desc: *mut VirtqDesc,
    avail: *mut u8,
    used: *const u8,
    last_used_idx: u16,
    /// Request header and status byte live here so their physical
    /// addresses are stable for the duration of a request.
    req: BlkRequest,
    status: u8,
}

// SAFETY: the raw pointers reference the driver-owned queue allocation;
// all access happens under the DEVICE mutex.
unsafe impl Send for VirtioBlk {}

static DEVICE: Mutex<Option<VirtioBlk>> = Mutex::new(None);

#[cfg(target_os = "none")]
mod io {
    use x86_64::instructions::port::Port;

    pub fn in8(base: u16, off: u16) -> u8 {
        // SAFETY: the virtio BAR0 I/O window belongs to this driver.
        unsafe { Port::<u8>::new(base + off).read() }
    }
    pub fn out8(base: u16, off: u16, v: u8) {
        // SAFETY: as above.
        unsafe { Port::<u8>::new(base + off).write(v) }
    }
    pub fn in16(base: u16, off: u16) -> u16 {
        // SAFETY: as above.
        unsafe { Port::<u16>::new(base + off).read() }
    }
    pub fn out16(base: u16, off: u16, v: u16) {
        // SAFETY: as above.
        unsafe { Port::<u16>::new(base + off).write(v) }
    }
    pub fn in32(base: u16, off: u16) -> u32 {
        // SAFETY: as above.
        unsafe { Port::<u32>::new(base + off).read() }
    }
    pub fn out32(base: u16, off: u16, v: u32) {
        // SAFETY: as above.
        unsafe { Port::<u32>::new(base + off).write(v) }
    }
}

#[cfg(not(target_os = "none"))]
mod io {
    pub fn in8(_: u16, _: u16) -> u8 {
        0
    }
    pub fn out8(_: u16, _: u16, _: u8) {}
    pub fn in16(_: u16, _: u16) -> u16 {
        0
    }
    pub fn out16(_: u16, _: u16, _: u16) {}
    pub fn in32(_: u16, _: u16) -> u32 {
        0
    }
    pub fn out32(_: u16, _: u16, _: u32) {}
}

impl VirtioBlk {
    /// Select queue 0, size it from the device, allocate the ring memory,
    /// and hand the device its page frame number.
    fn setup_queue(&mut self) -> bool {
        io::out16(self.io_base, REG_QUEUE_SELECT, 0);
        let queue_size = io::in16(self.io_base, REG_QUEUE_SIZE);
        if queue_size == 0 {
            return false;
        }
        self.queue_size = queue_size;

        let layout = queue_layout(queue_size);
        let pages = layout.total_bytes / PAGE_SIZE as usize;
        let Ok(mem) = frame::alloc_frames(pages) else {
            return false;
        };
        // SAFETY: freshly allocated, identity-mapped queue memory.
        unsafe { core::ptr::write_bytes(mem as *mut u8, 0, layout.total_bytes) };

        self.queue_mem = mem;
        self.desc = mem as *mut VirtqDesc;
        self.avail = (mem + layout.avail_offset as u64) as *mut u8;
        self.used = (mem + layout.used_offset as u64) as *const u8;
        self.last_used_idx = 0;

        io::out32(self.io_base, REG_QUEUE_PFN, (mem >> 12) as u32);
        true
    }

    fn avail_idx_ptr(&self) -> *mut u16 {
        // flags at +0, idx at +2, ring at +4
        (self.avail as u64 + 2) as *mut u16
    }

    fn used_idx(&self) -> u16 {
        // SAFETY: device-written field of the live used ring.
        unsafe { core::ptr::read_volatile((self.used as u64 + 2) as *const u16) }
    }

    /// Submit a three-descriptor chain for `sector` and spin until the
    /// used ring advances. `data` must be exactly one sector.
    fn transfer(&mut self, typ: u32, sector: u64, data: u64) -> bool {
        if self.queue_size < 3 {
            return false;
        }

        self.req = BlkRequest {
            typ,
            reserved: 0,
            sector,
        };
        self.status = 0xFF;

        let data_write_flag = if typ == REQUEST_READ {
            VIRTQ_DESC_F_WRITE
        } else {
            0
        };

        // SAFETY: descriptor table, available ring and used ring all live
        // in the driver-owned queue allocation; the header and status
        // fields are pinned inside `self` (static storage, identity
        // mapped). Fences order ring-index publication against descriptor
        // writes; x86-TSO provides the store-store guarantee.
        unsafe {
            let desc = self.desc;
            *desc.add(0) = VirtqDesc {
                addr: &self.req as *const BlkRequest as u64,
                len: core::mem::size_of::<BlkRequest>() as u32,
                flags: VIRTQ_DESC_F_NEXT,
                next: 1,
            };
            *desc.add(1) = VirtqDesc {
                addr: data,
                len: SECTOR_SIZE as u32,
                flags: VIRTQ_DESC_F_NEXT | data_write_flag,
                next: 2,
            };
            *desc.add(2) = VirtqDesc {
                addr: &self.status as *const u8 as u64,
                len: 1,
                flags: VIRTQ_DESC_F_WRITE,
                next: 0,
            };

            let ring = (self.avail as u64 + 4) as *mut u16;
            let idx = core::ptr::read_volatile(self.avail_idx_ptr());
            core::ptr::write_volatile(ring.add((idx % self.queue_size) as usize), 0);
            compiler_fence(Ordering::SeqCst);
            core::ptr::write_volatile(self.avail_idx_ptr(), idx.wrapping_add(1));
            compiler_fence(Ordering::SeqCst);
        }

        io::out16(self.io_base, REG_QUEUE_NOTIFY, 0);

        while self.used_idx() == self.last_used_idx {
            pause();
        }
        compiler_fence(Ordering::SeqCst);
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        self.status == 0
    }
}

/// Probe one PCI function as a legacy virtio block device and bring it up.
pub fn try_init_legacy(bus: u8, slot: u8, func: u8) -> bool {
    let vendor = pci::read_u16(bus, slot, func, 0x00);
    let device = pci::read_u16(bus, slot, func, 0x02);
    if vendor != 0x1AF4 || device != 0x1001 {
        return false;
    }

    // I/O space + bus mastering.
    let command = pci::read_u16(bus, slot, func, 0x04);
    pci::write_u16(bus, slot, func, 0x04, command | 0x0005);

    let bar0 = pci::read_u32(bus, slot, func, 0x10);
    if bar0 & 1 == 0 {
        log::warn!("virtio-blk BAR0 is not I/O; legacy driver needs port I/O");
        return false;
    }
    let io_base = (bar0 & !0x3) as u16;

    let mut dev = VirtioBlk {
        io_base,
        queue_size: 0,
        queue_mem: 0,
        desc: core::ptr::null_mut(),
        avail: core::ptr::null_mut(),
        used: core::ptr::null(),
        last_used_idx: 0,
        req: BlkRequest {
            typ: 0,
            reserved: 0,
            sector: 0,
        },
        status: 0,
    };

    // Reset, acknowledge, declare a driver.
    io::out8(io_base, REG_STATUS, 0);
    io::out8(io_base, REG_STATUS, STATUS_ACK);
    io::out8(io_base, REG_STATUS, STATUS_ACK | STATUS_DRIVER);

    // Feature negotiation: accept none.
    let _features = io::in32(io_base, REG_HOST_FEATURES);
    io::out32(io_base, REG_GUEST_FEATURES, 0);

    if !dev.setup_queue() {
        log::warn!("virtio-blk queue setup failed");
        io::out8(io_base, REG_STATUS, STATUS_FAILED);
        return false;
    }

    let status = io::in8(io_base, REG_STATUS);
    io::out8(io_base, REG_STATUS, status | STATUS_DRIVER_OK);

    // 64-bit sector count sits at the start of the device config space.
    let cap_lo = io::in32(io_base, REG_DEVICE_CONFIG) as u64;
    let cap_hi = io::in32(io_base, REG_DEVICE_CONFIG + 4) as u64;
    log::info!(
        "virtio-blk at io {:#x}, queue size {} at {:#x}, capacity {} sectors",
        io_base,
        dev.queue_size,
        dev.queue_mem,
        cap_hi << 32 | cap_lo
    );

    *DEVICE.lock() = Some(dev);
    true
}

/// Whether a device completed initialization.
pub fn is_ready() -> bool {
    DEVICE.lock().is_some()
}

/// Synchronously read one sector.
pub fn read_sector(sector: u64, out: &mut [u8; SECTOR_SIZE]) -> bool {
    let mut guard = DEVICE.lock();
    match guard.as_mut() {
        Some(dev) => dev.transfer(REQUEST_READ, sector, out.as_mut_ptr() as u64),
        None => false,
    }
}

/// Synchronously write one sector.
pub fn write_sector(sector: u64, data: &[u8; SECTOR_SIZE]) -> bool {
    let mut guard = DEVICE.lock();
    match guard.as_mut() {
        Some(dev) => dev.transfer(REQUEST_WRITE, sector, data.as_ptr() as u64),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_for_qemu_sized_queue() {
        // N = 256: desc 4096 bytes, avail 518, used on the next page.
        let layout = queue_layout(256);
        assert_eq!(layout.desc_bytes, 4096);
        assert_eq!(layout.avail_offset, 4096);
        assert_eq!(layout.used_offset, 8192);
        // used ring = 6 + 8*256 = 2054 -> total rounds to 3 pages + 1
        assert_eq!(layout.total_bytes, 8192 + 4096);
        assert_eq!(layout.total_bytes % PAGE_SIZE as usize, 0);
    }

    #[test]
    fn layout_for_tiny_queue() {
        let layout = queue_layout(8);
        assert_eq!(layout.desc_bytes, 128);
        assert_eq!(layout.avail_offset, 128);
        // desc + avail = 128 + 22 = 150 -> used ring starts on page 2
        assert_eq!(layout.used_offset, 4096);
        assert_eq!(layout.total_bytes, 8192);
    }

    #[test]
    fn used_ring_never_overlaps_avail() {
        for n in [1u16, 3, 8, 64, 128, 256, 1024] {
            let layout = queue_layout(n);
            let avail_end = layout.avail_offset + 6 + 2 * n as usize;
            assert!(layout.used_offset >= avail_end);
            assert_eq!(layout.used_offset % PAGE_SIZE as usize, 0);
        }
    }

    #[test]
    fn requests_fail_without_a_device() {
        // The global starts empty on the host.
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(!read_sector(0, &mut buf));
        assert!(!write_sector(0, &buf));
        assert!(!is_ready());
    }
}
