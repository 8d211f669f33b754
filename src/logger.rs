//! `log` backend for EL2.
//!
//! Records are formatted straight into a [`Console`] one line at a time,
//! without allocating. On a QEMU virt board the console is the PL011 UART.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::platform::UART_BASE;
use crate::sync::SpinLock;

/// Byte sink for log output.
pub trait Console: Sync + Send {
    fn puts(&self, s: &str);
}

// PL011 registers
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
const UART_DR: usize = 0x00; // Data Register
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
const UART_FR: usize = 0x18; // Flag Register
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
const UART_FR_TXFF: u32 = 1 << 5; // Transmit FIFO full

/// PL011 UART (already initialized by firmware on QEMU virt).
pub struct Pl011 {
    #[cfg_attr(not(all(target_arch = "aarch64", target_os = "none")), allow(dead_code))]
    base: usize,
}

impl Pl011 {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    fn putc(&self, c: u8) {
        // SAFETY: `base` is the device-mapped PL011 register block.
        unsafe {
            while core::ptr::read_volatile((self.base + UART_FR) as *const u32) & UART_FR_TXFF != 0 {}
            core::ptr::write_volatile((self.base + UART_DR) as *mut u32, c as u32);
        }
    }

    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    fn putc(&self, _c: u8) {}
}

impl Console for Pl011 {
    fn puts(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.putc(b'\r');
            }
            self.putc(byte);
        }
    }
}

struct ConsoleWriter<'a, C: Console>(&'a C);

impl<C: Console> Write for ConsoleWriter<'_, C> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.puts(s);
        Ok(())
    }
}

pub struct HypLogger<C: Console> {
    console: C,
    level: LevelFilter,
    /// Keeps lines from different CPUs from interleaving.
    line: SpinLock<()>,
}

impl<C: Console> HypLogger<C> {
    pub const fn new(console: C, level: LevelFilter) -> Self {
        Self {
            console,
            level,
            line: SpinLock::new(()),
        }
    }

    pub fn console(&self) -> &C {
        &self.console
    }
}

impl<C: Console> Log for HypLogger<C> {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _line = self.line.lock();
        let _ = writeln!(
            ConsoleWriter(&self.console),
            "[{:<5}] {}",
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static PL011_LOGGER: HypLogger<Pl011> = HypLogger::new(Pl011::new(UART_BASE), LevelFilter::Trace);

/// Route `log` output to the board UART.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&PL011_LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
