//! `log` backend writing to a [`Console`].
//!
//! Lines look like `[DEBUG vali_kernel::sched] message`. The backend is the
//! kernel's only static: the `log` facade needs a `'static` logger.

use alloc::boxed::Box;
use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};
use vali_common::{OsError, OsResult};
use vali_hal::Console;

static LOGGER: spin::Once<KernelLogger> = spin::Once::new();

/// Installs the kernel logger. Fails with `AlreadyExists` if a logger is
/// already installed.
pub fn init(console: Box<dyn Console + Send>, level: LevelFilter) -> OsResult<()> {
    if LOGGER.is_completed() {
        return Err(OsError::AlreadyExists);
    }
    let logger = LOGGER.call_once(|| KernelLogger::new(console, level));
    log::set_logger(logger).map_err(|_| OsError::AlreadyExists)?;
    log::set_max_level(level);
    Ok(())
}

/// Formats records into a console.
pub struct KernelLogger {
    console: spin::Mutex<Box<dyn Console + Send>>,
    level: LevelFilter,
}

impl KernelLogger {
    /// Creates a logger that drops records above `level`.
    pub fn new(console: Box<dyn Console + Send>, level: LevelFilter) -> Self {
        KernelLogger {
            console: spin::Mutex::new(console),
            level,
        }
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut console = self.console.lock();
        let mut writer = ConsoleWriter(&mut **console);
        // A console cannot fail; the only error source is a broken Display impl.
        let _ = writeln!(
            writer,
            "[{:<5} {}] {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

struct ConsoleWriter<'a>(&'a mut dyn Console);

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}
