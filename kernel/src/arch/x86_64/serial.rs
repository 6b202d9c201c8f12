//! COM1 serial console: early boot output, the `log`/`kprint!` sinks, and
//! the backing device for fd 0/1/2.

use core::fmt::Write;

use ferrite_core::arch::x86_64::instructions::port::Port;
use ferrite_core::log::LogLevel;
use ferrite_core::sync::SpinLock;

const COM1: u16 = 0x3F8;

const REG_THR: u16 = 0;
const REG_RBR: u16 = 0;
const REG_DLL: u16 = 0;
const REG_IER: u16 = 1;
const REG_DLM: u16 = 1;
const REG_FCR: u16 = 2;
const REG_LCR: u16 = 3;
const REG_MCR: u16 = 4;
const REG_LSR: u16 = 5;

const LSR_DATA_READY: u8 = 1 << 0;
const LSR_THR_EMPTY: u8 = 1 << 5;

/// A single COM1 handle. Carries no state beyond the port base, matching
/// the upstream UART driver this is grounded on.
struct Serial;

impl Serial {
    fn port(offset: u16) -> Port<u8> {
        Port::new(COM1 + offset)
    }

    /// Programs 115200 8N1 with FIFOs enabled. No loopback self-test: under
    /// QEMU's `-serial stdio` there may be nothing to echo back, and a
    /// failed self-test would otherwise take down boot over a diagnostic
    /// console.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, before any concurrent access.
    unsafe fn init(&self) {
        unsafe {
            Self::port(REG_IER).write(0x00);
            Self::port(REG_LCR).write(0x80); // DLAB
            Self::port(REG_DLL).write(1); // divisor 1 -> 115200 baud
            Self::port(REG_DLM).write(0);
            Self::port(REG_LCR).write(0x03); // 8N1, DLAB cleared
            Self::port(REG_FCR).write(0xC7); // enable+clear FIFOs, 14-byte trigger
            Self::port(REG_MCR).write(0x0B); // DTR | RTS | OUT2
        }
    }

    fn write_byte(&self, byte: u8) {
        unsafe {
            while Self::port(REG_LSR).read() & LSR_THR_EMPTY == 0 {
                core::hint::spin_loop();
            }
            Self::port(REG_THR).write(byte);
        }
    }

    fn data_available(&self) -> bool {
        unsafe { Self::port(REG_LSR).read() & LSR_DATA_READY != 0 }
    }

    fn try_read_byte(&self) -> Option<u8> {
        if self.data_available() {
            Some(unsafe { Self::port(REG_RBR).read() })
        } else {
            None
        }
    }
}

impl Write for Serial {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

static CONSOLE: SpinLock<Serial> = SpinLock::new(Serial);

/// Initializes COM1 and installs it as the `ferrite_core::log` print/log
/// sinks. Must run exactly once, early in boot, before any `kprintln!`.
///
/// # Safety
///
/// Must be called before any other thread touches COM1.
pub unsafe fn init() {
    unsafe {
        CONSOLE.lock().init();
        ferrite_core::log::set_print_fn(print_fn);
        ferrite_core::log::set_log_fn(log_fn);
    }
}

fn print_fn(args: core::fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

fn log_fn(level: LogLevel, args: core::fmt::Arguments) {
    let mut console = CONSOLE.lock();
    let _ = write!(console, "[{}] ", level.name());
    let _ = console.write_fmt(args);
    let _ = console.write_str("\n");
}

/// Writes `bytes` to the console, returning the number written.
pub fn write_bytes(bytes: &[u8]) -> usize {
    let console = CONSOLE.lock();
    for &b in bytes {
        if b == b'\n' {
            console.write_byte(b'\r');
        }
        console.write_byte(b);
    }
    bytes.len()
}

/// Non-blocking single-byte read, echoing the byte back if one was read.
pub fn try_read_echo() -> Option<u8> {
    let console = CONSOLE.lock();
    let byte = console.try_read_byte()?;
    console.write_byte(byte);
    if byte == b'\r' {
        console.write_byte(b'\n');
    }
    Some(byte)
}
