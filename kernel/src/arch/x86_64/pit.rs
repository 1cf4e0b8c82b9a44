//! Programmable interval timer (channel 0).
//!
//! Drives the scheduler tick. The global tick counter is the kernel's
//! monotonic time base; `sleep` deadlines and `gettimeofday` both derive
//! from it.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const PIT_BASE_HZ: u32 = 1_193_182;

static TICKS: AtomicU64 = AtomicU64::new(0);
static FREQUENCY_HZ: AtomicU32 = AtomicU32::new(0);

/// Program channel 0 as a rate generator at `hz` ticks per second.
pub fn init(hz: u32) {
    let hz = if hz == 0 { 100 } else { hz };
    let divisor = (PIT_BASE_HZ / hz).clamp(1, 0xFFFF);

    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::port::Port;
        let mut cmd: Port<u8> = Port::new(0x43);
        let mut ch0: Port<u8> = Port::new(0x40);
        // SAFETY: channel 0, lobyte/hibyte, mode 3 (square wave), binary.
        unsafe {
            cmd.write(0x36u8);
            ch0.write((divisor & 0xFF) as u8);
            ch0.write((divisor >> 8) as u8);
        }
    }

    TICKS.store(0, Ordering::Relaxed);
    FREQUENCY_HZ.store(hz, Ordering::Relaxed);
    log::info!("timer at {hz} Hz (divisor {divisor})");
}

/// Called from the IRQ 0 path.
pub fn handle_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Ticks since `init`.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Configured tick frequency, or 0 before `init`.
pub fn frequency_hz() -> u32 {
    FREQUENCY_HZ.load(Ordering::Relaxed)
}
