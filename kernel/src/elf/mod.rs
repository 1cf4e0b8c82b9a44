//! ELF64 loader.
//!
//! Maps a static or position-independent x86_64 executable into a target
//! address space: PT_LOAD segments are backed by zeroed frames mapped with
//! permissions derived from the segment's RWX bits, file bytes are copied
//! page by page through `resolve`, and for ET_DYN images RELA/REL
//! relocations are applied against the embedded dynamic symbol table.

use crate::error::{KernelError, KernelResult};
use crate::mm::{align_down, align_up, frame, paging, PageFlags, PAGE_SIZE};

const MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const CLASS_64: u8 = 2;
const DATA_LSB: u8 = 1;

const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;

const DT_NULL: i64 = 0;
const DT_STRTAB: i64 = 5;
const DT_SYMTAB: i64 = 6;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_RELAENT: i64 = 9;
const DT_SYMENT: i64 = 11;
const DT_REL: i64 = 17;
const DT_RELSZ: i64 = 18;
const DT_RELENT: i64 = 19;

const R_X86_64_64: u32 = 1;
const R_X86_64_GLOB_DAT: u32 = 6;
const R_X86_64_JUMP_SLOT: u32 = 7;
const R_X86_64_RELATIVE: u32 = 8;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SYM_SIZE: u64 = 24;
const RELA_SIZE: u64 = 24;
const REL_SIZE: u64 = 16;

/// Load bias applied to ET_DYN images, above the user region base.
const DYN_LOAD_BIAS_OFFSET: u64 = 0x0100_0000;

/// Result of a successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    /// Entry point (bias applied for ET_DYN).
    pub entry: u64,
    /// Highest page-aligned segment end; the user heap starts here.
    pub initial_brk: u64,
}

fn read_u16(data: &[u8], off: usize) -> Option<u16> {
    let b = data.get(off..off + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    let b = data.get(off..off + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], off: usize) -> Option<u64> {
    let b = data.get(off..off + 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(b);
    Some(u64::from_le_bytes(buf))
}

#[derive(Debug, Clone, Copy)]
struct ElfHeader {
    typ: u16,
    entry: u64,
    phoff: u64,
    phnum: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

/// Validate the identification, machine and type fields and check that the
/// program-header table lies within the image.
fn parse_header(image: &[u8]) -> KernelResult<ElfHeader> {
    if image.len() < EHDR_SIZE || image[0..4] != MAGIC {
        return Err(KernelError::InvalidArgument);
    }
    if image[4] != CLASS_64 || image[5] != DATA_LSB {
        return Err(KernelError::InvalidArgument);
    }
    let typ = read_u16(image, 16).ok_or(KernelError::InvalidArgument)?;
    let machine = read_u16(image, 18).ok_or(KernelError::InvalidArgument)?;
    if typ != ET_EXEC && typ != ET_DYN {
        return Err(KernelError::InvalidArgument);
    }
    if machine != EM_X86_64 {
        return Err(KernelError::InvalidArgument);
    }
    let entry = read_u64(image, 24).ok_or(KernelError::InvalidArgument)?;
    let phoff = read_u64(image, 32).ok_or(KernelError::InvalidArgument)?;
    let phentsize = read_u16(image, 54).ok_or(KernelError::InvalidArgument)?;
    let phnum = read_u16(image, 56).ok_or(KernelError::InvalidArgument)?;
    if phentsize as usize != PHDR_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    let table_end = phoff
        .checked_add(phnum as u64 * PHDR_SIZE as u64)
        .ok_or(KernelError::InvalidArgument)?;
    if table_end > image.len() as u64 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(ElfHeader {
        typ,
        entry,
        phoff,
        phnum,
    })
}

fn program_header(image: &[u8], hdr: &ElfHeader, index: u16) -> Option<ProgramHeader> {
    if index >= hdr.phnum {
        return None;
    }
    let base = hdr.phoff as usize + index as usize * PHDR_SIZE;
    Some(ProgramHeader {
        p_type: read_u32(image, base)?,
        p_flags: read_u32(image, base + 4)?,
        p_offset: read_u64(image, base + 8)?,
        p_vaddr: read_u64(image, base + 16)?,
        p_filesz: read_u64(image, base + 32)?,
        p_memsz: read_u64(image, base + 40)?,
    })
}

/// Relocation inputs gathered from PT_DYNAMIC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DynInfo {
    rela: u64,
    relasz: u64,
    relaent: u64,
    rel: u64,
    relsz: u64,
    relent: u64,
    symtab: u64,
    syment: u64,
    strtab: u64,
}

fn scan_dynamic(image: &[u8], hdr: &ElfHeader) -> DynInfo {
    let mut info = DynInfo::default();
    for i in 0..hdr.phnum {
        let Some(ph) = program_header(image, hdr, i) else {
            continue;
        };
        if ph.p_type != PT_DYNAMIC {
            continue;
        }
        let count = ph.p_filesz / 16;
        for j in 0..count {
            let base = (ph.p_offset + j * 16) as usize;
            let Some(tag) = read_u64(image, base) else { break };
            let Some(val) = read_u64(image, base + 8) else {
                break;
            };
            match tag as i64 {
                DT_NULL => break,
                DT_RELA => info.rela = val,
                DT_RELASZ => info.relasz = val,
                DT_RELAENT => info.relaent = val,
                DT_REL => info.rel = val,
                DT_RELSZ => info.relsz = val,
                DT_RELENT => info.relent = val,
                DT_SYMTAB => info.symtab = val,
                DT_SYMENT => info.syment = val,
                DT_STRTAB => info.strtab = val,
                _ => {}
            }
        }
    }
    info
}

/// Translate an unbiased virtual address to an offset in the file image by
/// finding the PT_LOAD segment whose file-backed portion covers it.
fn vaddr_to_offset(image: &[u8], hdr: &ElfHeader, vaddr: u64) -> Option<usize> {
    for i in 0..hdr.phnum {
        let ph = program_header(image, hdr, i)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        if vaddr >= ph.p_vaddr && vaddr < ph.p_vaddr + ph.p_filesz {
            let off = ph.p_offset + (vaddr - ph.p_vaddr);
            if off < image.len() as u64 {
                return Some(off as usize);
            }
        }
    }
    None
}

/// Write a u64 into the target address space through its page tables.
fn write_u64_va(root: u64, va: u64, value: u64) -> KernelResult<()> {
    let (pa, _) = paging::resolve(root, va).ok_or(KernelError::Corruption {
        what: "relocation target unmapped",
    })?;
    // SAFETY: resolved to a mapped frame; identity-mapped.
    unsafe { core::ptr::write_unaligned(pa as *mut u64, value) };
    Ok(())
}

fn read_u64_va(root: u64, va: u64) -> KernelResult<u64> {
    let (pa, _) = paging::resolve(root, va).ok_or(KernelError::Corruption {
        what: "relocation source unmapped",
    })?;
    // SAFETY: resolved to a mapped frame; identity-mapped.
    Ok(unsafe { core::ptr::read_unaligned(pa as *const u64) })
}

/// Resolve a dynamic-symbol value from the embedded symbol table.
fn symbol_value(image: &[u8], hdr: &ElfHeader, info: &DynInfo, sym_idx: u32) -> KernelResult<u64> {
    if info.symtab == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let syment = if info.syment == 0 { SYM_SIZE } else { info.syment };
    let sym_va = info.symtab + sym_idx as u64 * syment;
    let off = vaddr_to_offset(image, hdr, sym_va).ok_or(KernelError::InvalidArgument)?;
    let shndx = read_u16(image, off + 6).ok_or(KernelError::InvalidArgument)?;
    if shndx == 0 {
        // SHN_UNDEF: nothing to link against in this kernel.
        return Err(KernelError::NotFound);
    }
    read_u64(image, off + 8).ok_or(KernelError::InvalidArgument)
}

fn apply_relocations(
    image: &[u8],
    hdr: &ElfHeader,
    info: &DynInfo,
    root: u64,
    bias: u64,
) -> KernelResult<()> {
    let reloc_base = if hdr.typ == ET_DYN { bias } else { 0 };

    if info.rela != 0 && info.relasz != 0 {
        let ent = if info.relaent == 0 { RELA_SIZE } else { info.relaent };
        let table = vaddr_to_offset(image, hdr, info.rela).ok_or(KernelError::InvalidArgument)?;
        for i in 0..info.relasz / ent {
            let base = table + (i * ent) as usize;
            let offset = read_u64(image, base).ok_or(KernelError::InvalidArgument)?;
            let r_info = read_u64(image, base + 8).ok_or(KernelError::InvalidArgument)?;
            let addend = read_u64(image, base + 16).ok_or(KernelError::InvalidArgument)? as i64;
            let place = reloc_base + offset;
            let value = relocation_value(image, hdr, info, bias, r_info, addend)?;
            write_u64_va(root, place, value)?;
        }
    }

    if info.rel != 0 && info.relsz != 0 {
        let ent = if info.relent == 0 { REL_SIZE } else { info.relent };
        let table = vaddr_to_offset(image, hdr, info.rel).ok_or(KernelError::InvalidArgument)?;
        for i in 0..info.relsz / ent {
            let base = table + (i * ent) as usize;
            let offset = read_u64(image, base).ok_or(KernelError::InvalidArgument)?;
            let r_info = read_u64(image, base + 8).ok_or(KernelError::InvalidArgument)?;
            let place = reloc_base + offset;
            // REL entries take the pre-existing in-place value as addend.
            let addend = read_u64_va(root, place)? as i64;
            let value = relocation_value(image, hdr, info, bias, r_info, addend)?;
            write_u64_va(root, place, value)?;
        }
    }

    Ok(())
}

fn relocation_value(
    image: &[u8],
    hdr: &ElfHeader,
    info: &DynInfo,
    bias: u64,
    r_info: u64,
    addend: i64,
) -> KernelResult<u64> {
    let typ = r_info as u32;
    let sym_idx = (r_info >> 32) as u32;
    match typ {
        R_X86_64_RELATIVE => Ok(bias.wrapping_add(addend as u64)),
        R_X86_64_64 | R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => {
            let sym = symbol_value(image, hdr, info, sym_idx)?;
            Ok(bias.wrapping_add(sym).wrapping_add(addend as u64))
        }
        other => {
            log::warn!("unsupported relocation type {other}");
            Err(KernelError::NotSupported)
        }
    }
}

/// Load `image` into `target_root`. On failure, frames already mapped stay
/// with the address space and are reclaimed when it is destroyed.
pub fn load(image: &[u8], target_root: u64) -> KernelResult<LoadedImage> {
    let hdr = parse_header(image)?;

    let bias = if hdr.typ == ET_DYN {
        align_up(paging::USER_REGION_BASE + DYN_LOAD_BIAS_OFFSET, PAGE_SIZE)
    } else {
        0
    };

    let mut initial_brk = 0u64;

    for i in 0..hdr.phnum {
        let ph = program_header(image, &hdr, i).ok_or(KernelError::InvalidArgument)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.p_offset + ph.p_filesz > image.len() as u64 {
            return Err(KernelError::InvalidArgument);
        }

        let vaddr = ph.p_vaddr + bias;
        let seg_start = align_down(vaddr, PAGE_SIZE);
        let seg_end = align_up(vaddr + ph.p_memsz, PAGE_SIZE);

        // Segments must land inside the user region; anything below it
        // would collide with the shared kernel identity mapping.
        if seg_start < paging::USER_REGION_BASE || seg_end > paging::USER_STACK_TOP {
            return Err(KernelError::InvalidArgument);
        }

        let mut flags = PageFlags::PRESENT | PageFlags::USER;
        if ph.p_flags & PF_W != 0 {
            flags |= PageFlags::WRITABLE;
        }
        if ph.p_flags & PF_X == 0 {
            flags |= PageFlags::NO_EXECUTE;
        }

        let mut va = seg_start;
        while va < seg_end {
            let pa = frame::alloc_zeroed_frame()?;
            if let Err(e) = paging::map_page(target_root, va, pa, flags) {
                frame::free_frames(pa, 1);
                return Err(e);
            }
            va += PAGE_SIZE;
        }

        // Copy the file-backed portion page by page; the rest stays zero.
        let src = &image[ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize];
        let mut copied = 0usize;
        while copied < src.len() {
            let cur_va = vaddr + copied as u64;
            let (pa, _) = paging::resolve(target_root, cur_va).ok_or(KernelError::Corruption {
                what: "fresh segment page unmapped",
            })?;
            let page_off = (cur_va & (PAGE_SIZE - 1)) as usize;
            let chunk = (PAGE_SIZE as usize - page_off).min(src.len() - copied);
            // SAFETY: `pa` resolves inside a frame just mapped for this
            // segment; identity-mapped.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src[copied..].as_ptr(),
                    pa as *mut u8,
                    chunk,
                );
            }
            copied += chunk;
        }

        initial_brk = initial_brk.max(seg_end);
    }

    let dyn_info = scan_dynamic(image, &hdr);
    if dyn_info.rela != 0 || dyn_info.rel != 0 {
        apply_relocations(image, &hdr, &dyn_info, target_root, bias)?;
    }

    let entry = hdr.entry + bias;
    log::info!("loaded ELF image, entry {entry:#x}, brk {initial_brk:#x}");
    Ok(LoadedImage {
        entry,
        initial_brk,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }
    fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Minimal valid header: ET_EXEC, x86_64, `phnum` headers at offset 64.
    fn image_with_phnum(phnum: u16) -> Vec<u8> {
        let mut buf = vec![0u8; EHDR_SIZE + phnum as usize * PHDR_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = CLASS_64;
        buf[5] = DATA_LSB;
        put_u16(&mut buf, 16, ET_EXEC);
        put_u16(&mut buf, 18, EM_X86_64);
        put_u64(&mut buf, 24, 0x40_0000); // entry
        put_u64(&mut buf, 32, EHDR_SIZE as u64); // phoff
        put_u16(&mut buf, 54, PHDR_SIZE as u16);
        put_u16(&mut buf, 56, phnum);
        buf
    }

    fn put_phdr(buf: &mut [u8], index: usize, ph: &ProgramHeader) {
        let base = EHDR_SIZE + index * PHDR_SIZE;
        put_u32(buf, base, ph.p_type);
        put_u32(buf, base + 4, ph.p_flags);
        put_u64(buf, base + 8, ph.p_offset);
        put_u64(buf, base + 16, ph.p_vaddr);
        put_u64(buf, base + 32, ph.p_filesz);
        put_u64(buf, base + 40, ph.p_memsz);
    }

    #[test]
    fn accepts_a_wellformed_header() {
        let image = image_with_phnum(0);
        let hdr = parse_header(&image).unwrap();
        assert_eq!(hdr.typ, ET_EXEC);
        assert_eq!(hdr.entry, 0x40_0000);
        assert_eq!(hdr.phnum, 0);
    }

    #[test]
    fn rejects_bad_magic_class_machine_and_type() {
        let good = image_with_phnum(0);

        let mut bad = good.clone();
        bad[1] = b'X';
        assert!(parse_header(&bad).is_err());

        let mut bad = good.clone();
        bad[4] = 1; // 32-bit
        assert!(parse_header(&bad).is_err());

        let mut bad = good.clone();
        put_u16(&mut bad, 18, 40); // ARM
        assert!(parse_header(&bad).is_err());

        let mut bad = good.clone();
        put_u16(&mut bad, 16, 1); // ET_REL
        assert!(parse_header(&bad).is_err());

        assert!(parse_header(&good[..32]).is_err());
    }

    #[test]
    fn rejects_phdr_table_outside_image() {
        let mut image = image_with_phnum(0);
        put_u16(&mut image, 56, 4); // claims 4 headers that are not there
        assert!(parse_header(&image).is_err());
    }

    #[test]
    fn reads_program_headers_back() {
        let mut image = image_with_phnum(2);
        let ph = ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_X | 0x4,
            p_offset: 0x1000,
            p_vaddr: 0x40_0000,
            p_filesz: 0x80,
            p_memsz: 0x100,
        };
        put_phdr(&mut image, 1, &ph);

        let hdr = parse_header(&image).unwrap();
        assert_eq!(program_header(&image, &hdr, 1), Some(ph));
        assert!(program_header(&image, &hdr, 2).is_none());
    }

    #[test]
    fn dynamic_scan_collects_relocation_tags() {
        // One PT_DYNAMIC segment with RELA/RELASZ/SYMTAB and a terminator.
        let dyn_entries: [(i64, u64); 4] = [
            (DT_RELA, 0x5000),
            (DT_RELASZ, 48),
            (DT_SYMTAB, 0x6000),
            (DT_NULL, 0),
        ];
        let mut image = image_with_phnum(1);
        let dyn_off = image.len();
        for &(tag, val) in &dyn_entries {
            image.extend_from_slice(&(tag as u64).to_le_bytes());
            image.extend_from_slice(&val.to_le_bytes());
        }
        put_phdr(
            &mut image,
            0,
            &ProgramHeader {
                p_type: PT_DYNAMIC,
                p_flags: 0,
                p_offset: dyn_off as u64,
                p_vaddr: 0,
                p_filesz: (dyn_entries.len() * 16) as u64,
                p_memsz: (dyn_entries.len() * 16) as u64,
            },
        );

        let hdr = parse_header(&image).unwrap();
        let info = scan_dynamic(&image, &hdr);
        assert_eq!(info.rela, 0x5000);
        assert_eq!(info.relasz, 48);
        assert_eq!(info.symtab, 0x6000);
        assert_eq!(info.rel, 0);
    }

    #[test]
    fn vaddr_translation_uses_file_backed_extent() {
        let mut image = image_with_phnum(1);
        image.resize(0x3000, 0);
        put_phdr(
            &mut image,
            0,
            &ProgramHeader {
                p_type: PT_LOAD,
                p_flags: 0x4,
                p_offset: 0x2000,
                p_vaddr: 0x40_0000,
                p_filesz: 0x100,
                p_memsz: 0x800,
            },
        );
        let hdr = parse_header(&image).unwrap();
        assert_eq!(vaddr_to_offset(&image, &hdr, 0x40_0010), Some(0x2010));
        // Inside memsz but past filesz: not file-backed.
        assert_eq!(vaddr_to_offset(&image, &hdr, 0x40_0200), None);
        assert_eq!(vaddr_to_offset(&image, &hdr, 0x50_0000), None);
    }

    #[test]
    fn load_rejects_segments_outside_the_user_region() {
        // An ET_EXEC image linked at 0x400000 would land inside the kernel
        // identity map; the loader must refuse before touching any frames.
        let mut image = image_with_phnum(1);
        put_phdr(
            &mut image,
            0,
            &ProgramHeader {
                p_type: PT_LOAD,
                p_flags: 0x5,
                p_offset: 0,
                p_vaddr: 0x40_0000,
                p_filesz: 0,
                p_memsz: 0x1000,
            },
        );
        assert!(load(&image, 0).is_err());
    }

    #[test]
    fn relative_relocation_value_applies_bias() {
        let image = image_with_phnum(0);
        let hdr = parse_header(&image).unwrap();
        let info = DynInfo::default();
        let value =
            relocation_value(&image, &hdr, &info, 0x1000_0000, R_X86_64_RELATIVE as u64, 0x40)
                .unwrap();
        assert_eq!(value, 0x1000_0040);
        // Unknown relocation types are a load failure.
        assert!(relocation_value(&image, &hdr, &info, 0, 99, 0).is_err());
    }
}
