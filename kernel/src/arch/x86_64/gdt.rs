//! Global Descriptor Table and TSS.
//!
//! Layout:
//! - 0x00: Null descriptor
//! - 0x08: Kernel code segment (Ring 0)
//! - 0x10: Kernel data segment (Ring 0)
//! - 0x18: User code segment (selector 0x1B with RPL 3)
//! - 0x20: User data segment (selector 0x23 with RPL 3)
//! - 0x28: TSS (occupies 2 entries)
//!
//! The TSS carries RSP0 (updated on every context switch so ring-3 traps
//! land on the incoming thread's kernel stack) and IST1, a dedicated 4 KiB
//! stack the CPU switches to on a double fault.

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// IST slot used by the double-fault gate (slot index 0 = IST1).
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Selector values fixed by the layout above.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x1B;
pub const USER_DATA_SELECTOR: u16 = 0x23;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // Double-fault stack. Must be 16-byte aligned for the x86_64 ABI.
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096;
            #[repr(align(16))]
            #[allow(dead_code)] // Alignment wrapper -- field accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut DF_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const DF_STACK;
            VirtAddr::from_ptr(stack_ptr) + STACK_SIZE as u64
        };
        // RSP0 is installed by the scheduler before the first user thread runs.
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                user_code_selector,
                user_data_selector,
                tss_selector,
            },
        )
    };
}

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
}

/// Load the GDT and TSS on the calling CPU. The BSP calls this once during
/// boot; APs call it again on their way up (the table itself is shared).
pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    debug_assert_eq!(GDT.1.code_selector.0, KERNEL_CODE_SELECTOR);
    debug_assert_eq!(GDT.1.user_code_selector.0, USER_CODE_SELECTOR);
    debug_assert_eq!(GDT.1.user_data_selector.0, USER_DATA_SELECTOR);

    // SAFETY: the selectors reference descriptors in the GDT loaded above.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
}

/// Update the kernel stack pointer in the TSS (RSP0).
///
/// Called during context switch with the scheduler lock held and interrupts
/// disabled, so there is no concurrent access to the field.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: exclusive access per above; the TSS is a live static.
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}
