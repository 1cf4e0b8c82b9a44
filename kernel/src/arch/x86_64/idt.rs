//! Interrupt Descriptor Table.
//!
//! All 256 vectors route to the stub table in [`super::interrupts`]; the
//! stubs have a fixed 16-byte stride, so the gate address for vector `n` is
//! `vector_stubs + n * 16`. Everything is an interrupt gate (IF cleared on
//! entry): exceptions and IRQs at DPL 0, the syscall vector at DPL 3 so
//! `int 0x80` works from ring 3, and the double fault on IST1.

use lazy_static::lazy_static;

use super::gdt::{self, KERNEL_CODE_SELECTOR};
use super::interrupts::SYSCALL_VECTOR;

/// Byte stride between consecutive entries of the stub table.
const STUB_STRIDE: usize = 16;

const GATE_INTERRUPT: u8 = 0x8E;
const GATE_INTERRUPT_USER: u8 = 0xEE; // DPL=3

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    /// Bits 0-2 hold the IST index, rest zero.
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn new(handler: u64, type_attr: u8, ist: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: KERNEL_CODE_SELECTOR,
            ist: ist & 0x7,
            type_attr,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }
}

#[repr(C, align(16))]
struct Idt {
    entries: [IdtEntry; 256],
}

#[cfg(target_arch = "x86_64")]
#[allow(non_upper_case_globals)]
extern "C" {
    static vector_stubs: u8;
}

fn stub_address(vector: usize) -> u64 {
    // SAFETY: taking the address of an assembly label; never dereferenced.
    let base = unsafe { &vector_stubs as *const u8 as u64 };
    base + (vector * STUB_STRIDE) as u64
}

lazy_static! {
    static ref IDT: Idt = {
        let mut entries = [IdtEntry::missing(); 256];
        for (vector, entry) in entries.iter_mut().enumerate() {
            let ist = if vector == 8 {
                gdt::DOUBLE_FAULT_IST_INDEX as u8 + 1
            } else {
                0
            };
            let attr = if vector == SYSCALL_VECTOR as usize {
                GATE_INTERRUPT_USER
            } else {
                GATE_INTERRUPT
            };
            *entry = IdtEntry::new(stub_address(vector), attr, ist);
        }
        Idt { entries }
    };
}

/// Load the IDT on the calling CPU. Shared table; the BSP builds it, APs
/// just load it.
pub fn init() {
    use x86_64::structures::DescriptorTablePointer;
    use x86_64::VirtAddr;

    let pointer = DescriptorTablePointer {
        limit: (core::mem::size_of::<Idt>() - 1) as u16,
        base: VirtAddr::from_ptr(&IDT.entries as *const _),
    };
    // SAFETY: the IDT is a live static whose entries all point at the
    // permanent stub table.
    unsafe { x86_64::instructions::tables::lidt(&pointer) };
}
