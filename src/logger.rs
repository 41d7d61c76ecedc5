//! `log` facade wired to the PL011 UART.
//!
//! Installed once at boot (see `main::rust_main`). Everything past the
//! earliest boot banners should go through `log::{trace,debug,info,warn,
//! error}` rather than the raw `uart_puts` helpers, which remain only for
//! the pre-logger banner and the panic handler.

use core::fmt::Write;
use core::sync::atomic::{AtomicU8, Ordering};
use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::uart::UartWriter;

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

struct UartLogger;

static LOGGER: UartLogger = UartLogger;

impl Log for UartLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        (metadata.level() as u8) <= MAX_LEVEL.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut w = UartWriter;
        let _ = writeln!(
            w,
            "[{:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the UART-backed logger. Must be called exactly once, after the
/// UART has been initialized and before any `log::*!` call sites run.
pub fn init(level: LevelFilter) {
    MAX_LEVEL.store(level_to_u8(level), Ordering::Relaxed);
    log::set_max_level(level);
    // Safe to ignore: a second call would only happen on a logic error in
    // boot sequencing, and SetLoggerError carries no state we need here.
    let _ = log::set_logger(&LOGGER);
}

fn level_to_u8(level: LevelFilter) -> u8 {
    match level {
        LevelFilter::Off => 0,
        LevelFilter::Error => Level::Error as u8,
        LevelFilter::Warn => Level::Warn as u8,
        LevelFilter::Info => Level::Info as u8,
        LevelFilter::Debug => Level::Debug as u8,
        LevelFilter::Trace => Level::Trace as u8,
    }
}
