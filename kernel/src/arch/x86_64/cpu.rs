//! CPU roster.
//!
//! Maps dense CPU indices to local-APIC ids and tracks which CPUs are
//! online. Registration happens on the BSP during boot (single-threaded);
//! afterwards the roster is effectively read-only apart from the online
//! flags, so plain atomics suffice.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::apic;

/// Upper bound on supported CPUs.
pub const MAX_CPUS: usize = 8;

#[allow(clippy::declare_interior_mutable_const)]
const ATOMIC_U32_ZERO: AtomicU32 = AtomicU32::new(0);

static APIC_IDS: [AtomicU32; MAX_CPUS] = [ATOMIC_U32_ZERO; MAX_CPUS];
static PRESENT_MASK: AtomicU32 = AtomicU32::new(0);
static ONLINE_MASK: AtomicU32 = AtomicU32::new(0);
static CPU_COUNT: AtomicU32 = AtomicU32::new(0);
static BSP_INDEX: AtomicU32 = AtomicU32::new(0);
static APIC_READY: AtomicBool = AtomicBool::new(false);

/// Until the APIC is up, `current_id` answers with the BSP index.
pub fn set_apic_ready(ready: bool) {
    APIC_READY.store(ready, Ordering::Release);
}

/// Reset the roster with the BSP as CPU 0.
pub fn init_bsp(apic_id: u32) {
    for id in APIC_IDS.iter() {
        id.store(0, Ordering::Relaxed);
    }
    APIC_IDS[0].store(apic_id, Ordering::Relaxed);
    PRESENT_MASK.store(1, Ordering::Relaxed);
    ONLINE_MASK.store(1, Ordering::Relaxed);
    CPU_COUNT.store(1, Ordering::Relaxed);
    BSP_INDEX.store(0, Ordering::Relaxed);
}

/// Register a CPU by APIC id, returning its dense index. Re-registering an
/// existing id is idempotent; overflowing `MAX_CPUS` returns the BSP.
pub fn register(apic_id: u32, is_bsp: bool) -> u32 {
    let count = CPU_COUNT.load(Ordering::Relaxed);
    for idx in 0..count {
        if APIC_IDS[idx as usize].load(Ordering::Relaxed) == apic_id {
            if is_bsp {
                BSP_INDEX.store(idx, Ordering::Relaxed);
            }
            return idx;
        }
    }

    if count as usize >= MAX_CPUS {
        return BSP_INDEX.load(Ordering::Relaxed);
    }

    let idx = count;
    APIC_IDS[idx as usize].store(apic_id, Ordering::Relaxed);
    PRESENT_MASK.fetch_or(1 << idx, Ordering::Relaxed);
    CPU_COUNT.store(count + 1, Ordering::Relaxed);
    if is_bsp {
        BSP_INDEX.store(idx, Ordering::Relaxed);
    }
    idx
}

/// Mark a CPU online or offline.
pub fn set_online(cpu: u32, online: bool) {
    if cpu as usize >= MAX_CPUS {
        return;
    }
    if online {
        ONLINE_MASK.fetch_or(1 << cpu, Ordering::Release);
    } else {
        ONLINE_MASK.fetch_and(!(1 << cpu), Ordering::Release);
    }
}

/// Registered CPU count (at least 1).
pub fn count() -> u32 {
    CPU_COUNT.load(Ordering::Relaxed).max(1)
}

/// Number of CPUs currently online (at least 1).
pub fn online_count() -> u32 {
    (ONLINE_MASK.load(Ordering::Acquire).count_ones()).max(1)
}

/// APIC id for a dense CPU index (the BSP's id for out-of-range indices).
pub fn apic_id_of(cpu: u32) -> u32 {
    let idx = if cpu < CPU_COUNT.load(Ordering::Relaxed) {
        cpu
    } else {
        BSP_INDEX.load(Ordering::Relaxed)
    };
    APIC_IDS[idx as usize].load(Ordering::Relaxed)
}

/// Dense index of the calling CPU. Falls back to the BSP index until the
/// APIC is declared ready (or for an unknown APIC id).
pub fn current_id() -> u32 {
    if !APIC_READY.load(Ordering::Acquire) {
        return BSP_INDEX.load(Ordering::Relaxed);
    }
    let apic_id = apic::id();
    let count = CPU_COUNT.load(Ordering::Relaxed);
    for idx in 0..count {
        if APIC_IDS[idx as usize].load(Ordering::Relaxed) == apic_id {
            return idx;
        }
    }
    BSP_INDEX.load(Ordering::Relaxed)
}
