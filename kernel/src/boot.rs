//! Multiboot2 boot information.
//!
//! The bootloader hands over a pointer to an info blob: an 8-byte header
//! `{total_size, reserved}` followed by tags, each `{type, size}` padded to
//! 8-byte alignment. Only the tag types the kernel consumes are decoded
//! here: command line, bootloader name, memory map, and framebuffer.

use crate::error::{KernelError, KernelResult};

/// Magic value the bootloader leaves in the first argument register.
pub const BOOT_MAGIC: u64 = 0x36d7_6289;

/// Tag identifiers recognized by this kernel.
pub mod tag {
    pub const END: u32 = 0;
    pub const CMDLINE: u32 = 1;
    pub const BOOTLOADER: u32 = 2;
    pub const MEMORY_MAP: u32 = 6;
    pub const FRAMEBUFFER: u32 = 8;
}

/// Memory-map entry type for usable RAM.
pub const MEMORY_AVAILABLE: u32 = 1;

/// A parsed view over the boot information blob.
pub struct BootInfo<'a> {
    data: &'a [u8],
}

/// One raw tag: its type and payload (header excluded).
#[derive(Debug, Clone, Copy)]
pub struct Tag<'a> {
    pub typ: u32,
    pub data: &'a [u8],
}

/// One memory-map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub addr: u64,
    pub len: u64,
    pub typ: u32,
}

impl MemoryRegion {
    pub fn is_available(&self) -> bool {
        self.typ == MEMORY_AVAILABLE
    }
}

/// Framebuffer description from the type-8 tag.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub addr: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u8,
    pub typ: u8,
}

fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    let bytes = data.get(off..off + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(data: &[u8], off: usize) -> Option<u64> {
    let bytes = data.get(off..off + 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Some(u64::from_le_bytes(buf))
}

const fn align8(x: u32) -> u32 {
    (x + 7) & !7
}

impl<'a> BootInfo<'a> {
    /// Parse a boot info blob from a byte slice.
    pub fn from_bytes(data: &'a [u8]) -> KernelResult<Self> {
        let total = read_u32(data, 0).ok_or(KernelError::InvalidArgument)? as usize;
        if total < 8 || total > data.len() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            data: &data[..total],
        })
    }

    /// Parse the blob the bootloader left in memory.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid multiboot2 information structure that
    /// stays mapped (identity-mapped low memory) for the kernel's lifetime.
    pub unsafe fn from_ptr(ptr: *const u8) -> KernelResult<BootInfo<'static>> {
        if ptr.is_null() {
            return Err(KernelError::InvalidArgument);
        }
        // SAFETY: caller guarantees `ptr` addresses a live info blob whose
        // first word is its total size.
        let total = unsafe { core::ptr::read(ptr as *const u32) } as usize;
        if total < 8 {
            return Err(KernelError::InvalidArgument);
        }
        // SAFETY: the blob occupies `total` contiguous identity-mapped bytes.
        let data = unsafe { core::slice::from_raw_parts(ptr, total) };
        Ok(BootInfo { data })
    }

    /// Physical address of the blob (for reserving it in the frame bitmap).
    pub fn base_addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    /// Total size in bytes, from the blob header.
    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    /// Iterate over all tags up to the end tag.
    pub fn tags(&self) -> TagIter<'a> {
        TagIter {
            data: self.data,
            offset: 8,
        }
    }

    fn find(&self, typ: u32) -> Option<Tag<'a>> {
        self.tags().find(|t| t.typ == typ)
    }

    /// Kernel command line, if the bootloader passed one.
    pub fn cmdline(&self) -> Option<&'a str> {
        let tag = self.find(tag::CMDLINE)?;
        let raw = tag.data.split(|&b| b == 0).next()?;
        core::str::from_utf8(raw).ok()
    }

    /// Bootloader name string.
    pub fn bootloader_name(&self) -> Option<&'a str> {
        let tag = self.find(tag::BOOTLOADER)?;
        let raw = tag.data.split(|&b| b == 0).next()?;
        core::str::from_utf8(raw).ok()
    }

    /// Iterate over the firmware memory map.
    pub fn memory_map(&self) -> KernelResult<MemoryMapIter<'a>> {
        let tag = self
            .find(tag::MEMORY_MAP)
            .ok_or(KernelError::NotFound)?;
        let entry_size = read_u32(tag.data, 0).ok_or(KernelError::InvalidArgument)?;
        if entry_size < 24 {
            return Err(KernelError::InvalidArgument);
        }
        let entries = tag.data.get(8..).ok_or(KernelError::InvalidArgument)?;
        Ok(MemoryMapIter {
            data: entries,
            entry_size: entry_size as usize,
            offset: 0,
        })
    }

    /// Framebuffer info, if the bootloader set up a linear framebuffer.
    pub fn framebuffer(&self) -> Option<FramebufferInfo> {
        let tag = self.find(tag::FRAMEBUFFER)?;
        Some(FramebufferInfo {
            addr: read_u64(tag.data, 0)?,
            pitch: read_u32(tag.data, 8)?,
            width: read_u32(tag.data, 12)?,
            height: read_u32(tag.data, 16)?,
            bpp: *tag.data.get(20)?,
            typ: *tag.data.get(21)?,
        })
    }
}

/// Iterator over raw tags.
pub struct TagIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for TagIter<'a> {
    type Item = Tag<'a>;

    fn next(&mut self) -> Option<Tag<'a>> {
        let typ = read_u32(self.data, self.offset)?;
        let size = read_u32(self.data, self.offset + 4)?;
        if typ == tag::END || size < 8 {
            return None;
        }
        let payload = self
            .data
            .get(self.offset + 8..self.offset + size as usize)?;
        self.offset += align8(size) as usize;
        Some(Tag { typ, data: payload })
    }
}

/// Iterator over memory-map entries.
pub struct MemoryMapIter<'a> {
    data: &'a [u8],
    entry_size: usize,
    offset: usize,
}

impl<'a> Iterator for MemoryMapIter<'a> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<MemoryRegion> {
        if self.offset + self.entry_size > self.data.len() {
            return None;
        }
        let region = MemoryRegion {
            addr: read_u64(self.data, self.offset)?,
            len: read_u64(self.data, self.offset + 8)?,
            typ: read_u32(self.data, self.offset + 16)?,
        };
        self.offset += self.entry_size;
        Some(region)
    }
}

/// Apply recognized command-line options (`loglevel=`, `smp=off`).
pub fn apply_cmdline(cmdline: &str) -> BootOptions {
    let mut options = BootOptions::default();
    for word in cmdline.split_whitespace() {
        if let Some(level) = word.strip_prefix("loglevel=") {
            crate::logger::set_level(level);
        } else if word == "smp=off" {
            options.smp = false;
        } else {
            log::warn!("unrecognized boot option: {word}");
        }
    }
    options
}

/// Boot options decoded from the command line.
#[derive(Debug, Clone, Copy)]
pub struct BootOptions {
    pub smp: bool,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self { smp: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn pad8(buf: &mut Vec<u8>) {
        while buf.len() % 8 != 0 {
            buf.push(0);
        }
    }

    /// Build a blob with a cmdline tag, a two-entry memory map, and an end
    /// tag, then fix up the total size.
    fn sample_blob() -> Vec<u8> {
        let mut buf = Vec::new();
        push_u32(&mut buf, 0); // total_size, patched below
        push_u32(&mut buf, 0); // reserved

        let cmdline = b"loglevel=debug smp=off\0";
        push_u32(&mut buf, tag::CMDLINE);
        push_u32(&mut buf, 8 + cmdline.len() as u32);
        buf.extend_from_slice(cmdline);
        pad8(&mut buf);

        // memory map: {addr=0, len=16MiB, type=1}, {addr=16MiB, len=1MiB, type=2}
        push_u32(&mut buf, tag::MEMORY_MAP);
        push_u32(&mut buf, 8 + 8 + 2 * 24);
        push_u32(&mut buf, 24); // entry_size
        push_u32(&mut buf, 0); // entry_version
        push_u64(&mut buf, 0);
        push_u64(&mut buf, 16 * 1024 * 1024);
        push_u32(&mut buf, 1);
        push_u32(&mut buf, 0);
        push_u64(&mut buf, 16 * 1024 * 1024);
        push_u64(&mut buf, 1024 * 1024);
        push_u32(&mut buf, 2);
        push_u32(&mut buf, 0);
        pad8(&mut buf);

        push_u32(&mut buf, tag::END);
        push_u32(&mut buf, 8);

        let total = buf.len() as u32;
        buf[0..4].copy_from_slice(&total.to_le_bytes());
        buf
    }

    #[test]
    fn parses_cmdline_tag() {
        let blob = sample_blob();
        let info = BootInfo::from_bytes(&blob).unwrap();
        assert_eq!(info.cmdline(), Some("loglevel=debug smp=off"));
    }

    #[test]
    fn iterates_memory_map() {
        let blob = sample_blob();
        let info = BootInfo::from_bytes(&blob).unwrap();
        let regions: Vec<MemoryRegion> = info.memory_map().unwrap().collect();
        assert_eq!(regions.len(), 2);
        assert!(regions[0].is_available());
        assert_eq!(regions[0].len, 16 * 1024 * 1024);
        assert!(!regions[1].is_available());
    }

    #[test]
    fn stops_at_end_tag() {
        let blob = sample_blob();
        let info = BootInfo::from_bytes(&blob).unwrap();
        // cmdline + memory map; the end tag terminates iteration
        assert_eq!(info.tags().count(), 2);
    }

    #[test]
    fn rejects_truncated_blob() {
        let blob = sample_blob();
        assert!(BootInfo::from_bytes(&blob[..4]).is_err());
    }

    #[test]
    fn missing_memory_map_is_not_found() {
        let mut buf = Vec::new();
        push_u32(&mut buf, 16);
        push_u32(&mut buf, 0);
        push_u32(&mut buf, tag::END);
        push_u32(&mut buf, 8);
        let info = BootInfo::from_bytes(&buf).unwrap();
        assert_eq!(info.memory_map().err(), Some(KernelError::NotFound));
    }
}
