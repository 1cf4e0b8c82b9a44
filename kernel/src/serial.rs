//! COM1 serial console.
//!
//! All kernel output goes to the 16550 UART at 0x3F8; QEMU mirrors it to
//! stdio with `-serial stdio`.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

const COM1: u16 = 0x3F8;

lazy_static! {
    static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 I/O port; nothing else in the
        // kernel touches this port range.
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    x86_64::instructions::interrupts::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}

/// Raw byte output for the `write` syscall's console path.
pub fn write_bytes(bytes: &[u8]) {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let mut port = SERIAL1.lock();
        for &b in bytes {
            port.send(b);
        }
    });
}
