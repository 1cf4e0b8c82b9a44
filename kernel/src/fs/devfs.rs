//! Device nodes.
//!
//! Exposes the virtio block device as `/dev/disk`, a byte-addressed node
//! over 512-byte sectors: reads pull whole sectors and copy out the wanted
//! slice, writes read-modify-write any partially covered sector.

use alloc::sync::Arc;

use crate::drivers::virtio_blk::{self, SECTOR_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::fs::{self, DeviceOps, VfsNode};

/// Sector-granular backing store behind a byte-addressed device node.
/// Factored as a trait so the merge logic is testable without hardware.
pub trait SectorBacked: Send + Sync {
    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> bool;
    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> bool;
}

struct VirtioDisk;

impl SectorBacked for VirtioDisk {
    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> bool {
        virtio_blk::read_sector(sector, buf)
    }

    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> bool {
        virtio_blk::write_sector(sector, buf)
    }
}

/// Byte-offset adapter over a sector device.
pub struct SectorDevice<B: SectorBacked> {
    backing: B,
}

impl<B: SectorBacked> SectorDevice<B> {
    pub fn new(backing: B) -> Self {
        Self { backing }
    }
}

impl<B: SectorBacked> DeviceOps for SectorDevice<B> {
    fn read(&self, offset: usize, buf: &mut [u8]) -> KernelResult<usize> {
        let mut sector = [0u8; SECTOR_SIZE];
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let sector_idx = (pos / SECTOR_SIZE) as u64;
            let sector_off = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_off).min(buf.len() - done);

            if !self.backing.read_sector(sector_idx, &mut sector) {
                return Err(KernelError::HardwareError { device: "disk" });
            }
            buf[done..done + chunk].copy_from_slice(&sector[sector_off..sector_off + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    fn write(&self, offset: usize, buf: &[u8]) -> KernelResult<usize> {
        let mut sector = [0u8; SECTOR_SIZE];
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let sector_idx = (pos / SECTOR_SIZE) as u64;
            let sector_off = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_off).min(buf.len() - done);

            // Partial sectors need the existing contents merged in.
            if sector_off != 0 || chunk != SECTOR_SIZE {
                if !self.backing.read_sector(sector_idx, &mut sector) {
                    return Err(KernelError::HardwareError { device: "disk" });
                }
            }
            sector[sector_off..sector_off + chunk].copy_from_slice(&buf[done..done + chunk]);
            if !self.backing.write_sector(sector_idx, &sector) {
                return Err(KernelError::HardwareError { device: "disk" });
            }
            done += chunk;
        }
        Ok(done)
    }
}

/// Populate `/dev` (and the writable scratch directory `/rw`).
pub fn init() {
    let _ = fs::mkdir("/dev");
    let _ = fs::mkdir("/rw");

    if let Some(dev) = fs::resolve("/dev") {
        if dev.find_child("disk").is_none() {
            let ops = Arc::new(SectorDevice::new(VirtioDisk));
            let _ = dev.add_child(VfsNode::new_device("disk", ops));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// 8-sector RAM store for exercising the merge logic.
    struct RamStore {
        sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    }

    impl RamStore {
        fn new() -> Self {
            Self {
                sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; 8]),
            }
        }
    }

    impl SectorBacked for RamStore {
        fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> bool {
            match self.sectors.lock().get(sector as usize) {
                Some(data) => {
                    buf.copy_from_slice(data);
                    true
                }
                None => false,
            }
        }

        fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> bool {
            match self.sectors.lock().get_mut(sector as usize) {
                Some(data) => {
                    data.copy_from_slice(buf);
                    true
                }
                None => false,
            }
        }
    }

    #[test]
    fn aligned_sector_roundtrip() {
        let dev = SectorDevice::new(RamStore::new());
        let pattern: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i % 256) as u8).collect();
        assert_eq!(dev.write(2 * SECTOR_SIZE, &pattern).unwrap(), SECTOR_SIZE);

        let mut out = vec![0u8; SECTOR_SIZE];
        assert_eq!(dev.read(2 * SECTOR_SIZE, &mut out).unwrap(), SECTOR_SIZE);
        assert_eq!(out, pattern);
    }

    #[test]
    fn partial_write_preserves_rest_of_sector() {
        let dev = SectorDevice::new(RamStore::new());
        let base = vec![0xAAu8; SECTOR_SIZE];
        dev.write(0, &base).unwrap();

        // Overwrite 16 bytes in the middle.
        dev.write(100, &[0x55u8; 16]).unwrap();

        let mut out = vec![0u8; SECTOR_SIZE];
        dev.read(0, &mut out).unwrap();
        assert_eq!(&out[..100], &base[..100]);
        assert_eq!(&out[100..116], &[0x55u8; 16]);
        assert_eq!(&out[116..], &base[116..]);
    }

    #[test]
    fn unaligned_read_crosses_sector_boundary() {
        let dev = SectorDevice::new(RamStore::new());
        let mut pattern = vec![0u8; 2 * SECTOR_SIZE];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        dev.write(0, &pattern).unwrap();

        let mut out = vec![0u8; 100];
        dev.read(SECTOR_SIZE - 50, &mut out).unwrap();
        assert_eq!(&out[..], &pattern[SECTOR_SIZE - 50..SECTOR_SIZE + 50]);
    }

    #[test]
    fn out_of_range_sector_reports_hardware_error() {
        let dev = SectorDevice::new(RamStore::new());
        let mut out = vec![0u8; 16];
        assert!(dev.read(100 * SECTOR_SIZE, &mut out).is_err());
    }
}
