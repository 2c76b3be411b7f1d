//! Serial console for x86_64.
//!
//! COM1 (0x3F8) carries the kernel log.

use core::fmt::Write;

use uart_16550::SerialPort;
use vali_hal::Console;

/// COM1 I/O port address.
const COM1_PORT: u16 = 0x3F8;

/// COM1 as a [`Console`].
pub struct SerialConsole {
    port: SerialPort,
}

impl SerialConsole {
    /// Initializes COM1.
    pub fn com1() -> Self {
        // SAFETY: COM1_PORT (0x3F8) is a well-known x86 serial port address.
        // We're running in kernel mode with full I/O port access.
        let mut port = unsafe { SerialPort::new(COM1_PORT) };
        port.init();
        SerialConsole { port }
    }
}

impl Console for SerialConsole {
    fn write_str(&mut self, s: &str) {
        // Writing to the UART cannot fail.
        let _ = self.port.write_str(s);
    }

    fn clear(&mut self) {
        let _ = self.port.write_str("\x1b[2J\x1b[H");
    }
}
