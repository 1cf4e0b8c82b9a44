//! Address spaces and the 4-level page-table walker.
//!
//! An address space is identified by the physical address of its root (PML4)
//! table. The kernel space identity-maps the first 4 GiB with 2 MiB global
//! huge pages under entry 0; user spaces share that entry and put all user
//! mappings in higher entries. User roots are reference counted: fork shares
//! the parent's space, exec and reaping drop references, and the last drop
//! tears the whole tree down.
//!
//! All table memory is reached through the identity map, so a table's
//! physical address doubles as its pointer.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::{align_up, frame, PageFlags, PAGE_SIZE};

const ENTRIES_PER_TABLE: usize = 512;

/// Mask selecting the physical address bits of a page-table entry.
pub const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Bottom of the user half used by this kernel (PML4 entry 1).
pub const USER_REGION_BASE: u64 = 0x0000_0080_0000_0000;

/// Top of the fixed user stack region.
pub const USER_STACK_TOP: u64 = USER_REGION_BASE + 0x0000_007F_FFFF_F000;

const MAX_USER_SPACES: usize = 64;

#[derive(Clone, Copy)]
struct SpaceSlot {
    root: u64,
    refs: u32,
}

static KERNEL_ROOT: Mutex<u64> = Mutex::new(0);
static USER_SPACES: Mutex<[SpaceSlot; MAX_USER_SPACES]> =
    Mutex::new([SpaceSlot { root: 0, refs: 0 }; MAX_USER_SPACES]);

/// Split a canonical virtual address into its four table indices.
#[inline]
pub const fn table_indices(virt: u64) -> (usize, usize, usize, usize) {
    (
        (virt >> 39) as usize & 0x1FF,
        (virt >> 30) as usize & 0x1FF,
        (virt >> 21) as usize & 0x1FF,
        (virt >> 12) as usize & 0x1FF,
    )
}

/// View a table's physical address as the table itself (identity map).
fn table_mut(phys: u64) -> &'static mut [u64; ENTRIES_PER_TABLE] {
    // SAFETY: page tables live in identity-mapped physical memory below
    // 4 GiB and are only reached while the owning lock or boot-time single
    // threading guarantees exclusive access.
    unsafe { &mut *((phys & ENTRY_ADDR_MASK) as *mut [u64; ENTRIES_PER_TABLE]) }
}

#[inline]
fn invalidate(virt: u64) {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt));
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Walk one level down, allocating a zeroed intermediate table on demand.
/// Parent entries get `PRESENT|WRITABLE` (plus `USER` for user mappings) so
/// the leaf flags dominate the effective permission. A huge entry where a
/// table is expected (e.g. mapping 4 KiB pages into the kernel's 2 MiB
/// identity range) is corruption, not something to walk through.
fn ensure_table(parent: &mut [u64; ENTRIES_PER_TABLE], idx: usize, user: bool) -> KernelResult<u64> {
    let entry = parent[idx];
    if entry & PageFlags::PRESENT.bits() != 0 {
        if entry & PageFlags::HUGE.bits() != 0 {
            return Err(KernelError::Corruption {
                what: "huge entry where a page table was expected",
            });
        }
        return Ok(entry & ENTRY_ADDR_MASK);
    }
    let pa = frame::alloc_zeroed_frame()?;
    let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE;
    if user {
        flags |= PageFlags::USER;
    }
    parent[idx] = pa | flags.bits();
    Ok(pa)
}

/// Install a 4 KiB mapping. Fails if a present leaf already exists (no
/// silent overmapping).
pub fn map_page(root: u64, virt: u64, phys: u64, flags: PageFlags) -> KernelResult<()> {
    let (l4, l3, l2, l1) = table_indices(virt);
    let user = flags.contains(PageFlags::USER);

    let pml4 = table_mut(root);
    let pdpt = table_mut(ensure_table(pml4, l4, user)?);
    let pd = table_mut(ensure_table(pdpt, l3, user)?);
    let pt = table_mut(ensure_table(pd, l2, user)?);

    if pt[l1] & PageFlags::PRESENT.bits() != 0 {
        return Err(KernelError::AlreadyMapped);
    }
    pt[l1] = (phys & ENTRY_ADDR_MASK) | (flags | PageFlags::PRESENT).bits();
    invalidate(virt);
    Ok(())
}

/// Map a contiguous byte range page by page.
pub fn map_range(root: u64, virt: u64, phys: u64, size: u64, flags: PageFlags) -> KernelResult<()> {
    let pages = align_up(size, PAGE_SIZE) / PAGE_SIZE;
    for i in 0..pages {
        map_page(root, virt + i * PAGE_SIZE, phys + i * PAGE_SIZE, flags)?;
    }
    Ok(())
}

/// Remove a leaf mapping and return the physical address it referenced.
/// A non-present walk or leaf yields `None`.
pub fn unmap_page(root: u64, virt: u64) -> Option<u64> {
    let (l4, l3, l2, l1) = table_indices(virt);

    let pml4 = table_mut(root);
    if pml4[l4] & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    let pdpt = table_mut(pml4[l4]);
    if pdpt[l3] & PageFlags::PRESENT.bits() == 0
        || pdpt[l3] & PageFlags::HUGE.bits() != 0
    {
        return None;
    }
    let pd = table_mut(pdpt[l3]);
    if pd[l2] & PageFlags::PRESENT.bits() == 0 || pd[l2] & PageFlags::HUGE.bits() != 0 {
        return None;
    }
    let pt = table_mut(pd[l2]);

    let entry = pt[l1];
    if entry & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    pt[l1] = 0;
    invalidate(virt);
    Some(entry & ENTRY_ADDR_MASK)
}

/// Translate a virtual address, honoring 1 GiB and 2 MiB huge entries.
/// Returns the physical address (with the page offset composed back in) and
/// the flags of the mapping entry.
pub fn resolve(root: u64, virt: u64) -> Option<(u64, PageFlags)> {
    let (l4, l3, l2, l1) = table_indices(virt);

    let pml4 = table_mut(root);
    let e4 = pml4[l4];
    if e4 & PageFlags::PRESENT.bits() == 0 {
        return None;
    }

    let pdpt = table_mut(e4);
    let e3 = pdpt[l3];
    if e3 & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    if e3 & PageFlags::HUGE.bits() != 0 {
        let pa = (e3 & ENTRY_ADDR_MASK) + (virt & 0x3FFF_FFFF);
        return Some((pa, PageFlags::from_bits_truncate(e3)));
    }

    let pd = table_mut(e3);
    let e2 = pd[l2];
    if e2 & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    if e2 & PageFlags::HUGE.bits() != 0 {
        let pa = (e2 & ENTRY_ADDR_MASK) + (virt & 0x1F_FFFF);
        return Some((pa, PageFlags::from_bits_truncate(e2)));
    }

    let pt = table_mut(e2);
    let e1 = pt[l1];
    if e1 & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    let pa = (e1 & ENTRY_ADDR_MASK) | (virt & 0xFFF);
    Some((pa, PageFlags::from_bits_truncate(e1)))
}

// ---------------------------------------------------------------------------
// Address-space lifetime
// ---------------------------------------------------------------------------

fn free_pt(pt_phys: u64) {
    let pt = table_mut(pt_phys);
    for entry in pt.iter_mut() {
        if *entry & PageFlags::PRESENT.bits() != 0 {
            frame::free_frames(*entry & ENTRY_ADDR_MASK, 1);
        }
        *entry = 0;
    }
    frame::free_frames(pt_phys, 1);
}

fn free_pd(pd_phys: u64) {
    let pd = table_mut(pd_phys);
    for entry in pd.iter_mut() {
        if *entry & PageFlags::PRESENT.bits() == 0 {
            continue;
        }
        let pa = *entry & ENTRY_ADDR_MASK;
        if *entry & PageFlags::HUGE.bits() != 0 {
            frame::free_frames(pa, 512);
        } else {
            free_pt(pa);
        }
        *entry = 0;
    }
    frame::free_frames(pd_phys, 1);
}

fn free_pdpt(pdpt_phys: u64) {
    let pdpt = table_mut(pdpt_phys);
    for entry in pdpt.iter_mut() {
        if *entry & PageFlags::PRESENT.bits() == 0 {
            continue;
        }
        let pa = *entry & ENTRY_ADDR_MASK;
        if *entry & PageFlags::HUGE.bits() != 0 {
            frame::free_frames(pa, 512 * 512);
        } else {
            free_pd(pa);
        }
        *entry = 0;
    }
    frame::free_frames(pdpt_phys, 1);
}

/// Free every frame reachable from the non-kernel entries of a user root,
/// every intermediate table, then the root itself.
fn destroy_user_space(root: u64) {
    let kernel = kernel_root();
    if root == 0 || root == kernel {
        return;
    }
    let pml4 = table_mut(root);
    // Entry 0 is the shared kernel mapping; never ours to free.
    for entry in pml4.iter_mut().skip(1) {
        if *entry & PageFlags::PRESENT.bits() == 0 {
            continue;
        }
        free_pdpt(*entry & ENTRY_ADDR_MASK);
        *entry = 0;
    }
    frame::free_frames(root & ENTRY_ADDR_MASK, 1);
}

/// Build the kernel identity map: PML4 entry 0 covers 4 GiB through 2 MiB
/// global huge pages, supervisor only.
fn map_identity_kernel(root: u64) -> KernelResult<()> {
    let pml4 = table_mut(root);
    let pdpt_phys = frame::alloc_zeroed_frame()?;
    pml4[0] = pdpt_phys | (PageFlags::PRESENT | PageFlags::WRITABLE).bits();

    let pdpt = table_mut(pdpt_phys);
    for gib in 0..4u64 {
        let pd_phys = frame::alloc_zeroed_frame()?;
        pdpt[gib as usize] = pd_phys | (PageFlags::PRESENT | PageFlags::WRITABLE).bits();
        let pd = table_mut(pd_phys);
        for (i, entry) in pd.iter_mut().enumerate() {
            let phys = gib * 0x4000_0000 + i as u64 * 0x20_0000;
            *entry = phys
                | (PageFlags::PRESENT
                    | PageFlags::WRITABLE
                    | PageFlags::HUGE
                    | PageFlags::GLOBAL)
                    .bits();
        }
    }
    Ok(())
}

/// Create the kernel address space and switch to it. Also enables EFER.NXE
/// so `NO_EXECUTE` leaf entries are honored from here on.
pub fn init() -> KernelResult<()> {
    let root = frame::alloc_zeroed_frame()?;
    map_identity_kernel(root)?;
    *KERNEL_ROOT.lock() = root;

    #[cfg(target_os = "none")]
    {
        use x86_64::registers::model_specific::{Efer, EferFlags};
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        use x86_64::PhysAddr;

        // SAFETY: setting NXE only widens the set of valid PTE bits; the
        // identity map just built contains no NO_EXECUTE entries.
        unsafe { Efer::update(|flags| flags.insert(EferFlags::NO_EXECUTE_ENABLE)) };
        // SAFETY: `root` addresses a fully populated PML4 whose entry 0
        // identity-maps the memory the kernel is executing from.
        unsafe {
            Cr3::write(
                PhysFrame::containing_address(PhysAddr::new(root)),
                Cr3Flags::empty(),
            )
        };
    }

    log::info!("kernel address space at {root:#x}");
    Ok(())
}

/// Physical address of the shared kernel root table.
pub fn kernel_root() -> u64 {
    *KERNEL_ROOT.lock()
}

/// Create a fresh user address space mirroring the kernel's entry 0, with an
/// initial reference count of one.
pub fn create_user_space() -> KernelResult<u64> {
    let root = frame::alloc_zeroed_frame()?;
    let kernel = kernel_root();
    table_mut(root)[0] = table_mut(kernel)[0];

    let mut spaces = USER_SPACES.lock();
    match spaces.iter_mut().find(|s| s.refs == 0) {
        Some(slot) => {
            slot.root = root;
            slot.refs = 1;
            Ok(root)
        }
        None => {
            drop(spaces);
            frame::free_frames(root, 1);
            Err(KernelError::ResourceExhausted {
                resource: "address spaces",
            })
        }
    }
}

/// Take an additional reference on a user root (fork sharing). Every live
/// root was registered by `create_user_space`, so an unknown root is left
/// alone.
pub fn retain(root: u64) {
    if root == 0 || root == kernel_root() {
        return;
    }
    let mut spaces = USER_SPACES.lock();
    if let Some(slot) = spaces.iter_mut().find(|s| s.refs > 0 && s.root == root) {
        slot.refs += 1;
    }
}

/// Drop a reference on a user root; the last drop destroys the space.
pub fn release(root: u64) {
    if root == 0 || root == kernel_root() {
        return;
    }
    let mut destroy = false;
    {
        let mut spaces = USER_SPACES.lock();
        if let Some(slot) = spaces.iter_mut().find(|s| s.refs > 0 && s.root == root) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slot.root = 0;
                destroy = true;
            }
        }
    }
    if destroy {
        destroy_user_space(root);
    }
}

/// Current reference count of a user root (0 if unregistered).
pub fn space_refs(root: u64) -> u32 {
    USER_SPACES
        .lock()
        .iter()
        .find(|s| s.refs > 0 && s.root == root)
        .map_or(0, |s| s.refs)
}

/// Move the user heap end. Growing maps zeroed anonymous pages with
/// `PRESENT|WRITABLE|USER`; shrinking unmaps and frees. On a failed growth
/// the pages mapped so far stay in place and the error propagates.
/// Returns the new `brk_end` value to record in the thread.
pub fn set_brk(root: u64, brk_start: u64, brk_end: u64, new_end: u64) -> KernelResult<u64> {
    let start = align_up(brk_start, PAGE_SIZE);
    let new_aligned = align_up(new_end, PAGE_SIZE).max(start);
    let cur = align_up(brk_end, PAGE_SIZE);

    if new_aligned > cur {
        let mut va = cur;
        while va < new_aligned {
            let pa = frame::alloc_zeroed_frame()?;
            if let Err(e) = map_page(
                root,
                va,
                pa,
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
            ) {
                frame::free_frames(pa, 1);
                return Err(e);
            }
            va += PAGE_SIZE;
        }
    } else if new_aligned < cur {
        let mut va = new_aligned;
        while va < cur {
            if let Some(pa) = unmap_page(root, va) {
                frame::free_frames(pa, 1);
            }
            va += PAGE_SIZE;
        }
    }
    Ok(new_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_split_covers_all_levels() {
        let virt = (3u64 << 39) | (7u64 << 30) | (511u64 << 21) | (1u64 << 12) | 0xABC;
        assert_eq!(table_indices(virt), (3, 7, 511, 1));
    }

    #[test]
    fn user_stack_lives_in_user_region() {
        let (l4, ..) = table_indices(USER_STACK_TOP - 1);
        assert_eq!(l4, 1);
        let (l4, ..) = table_indices(USER_REGION_BASE);
        assert_eq!(l4, 1);
        // Kernel identity map stays in entry 0.
        let (l4, ..) = table_indices(0x1000);
        assert_eq!(l4, 0);
    }

    #[test]
    fn entry_mask_strips_flags() {
        let entry = 0x0000_0001_2345_6000u64
            | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE).bits();
        assert_eq!(entry & ENTRY_ADDR_MASK, 0x0000_0001_2345_6000);
    }
}
