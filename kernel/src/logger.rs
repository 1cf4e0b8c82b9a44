//! `log` facade backend.
//!
//! Routes every `log::info!` / `warn!` / ... record to the serial console
//! with a short level prefix and the module path. The maximum level defaults
//! to `Info` and can be overridden with `loglevel=` on the kernel command
//! line (see [`crate::boot`]).

use log::{LevelFilter, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let level = match record.level() {
                log::Level::Error => "ERROR",
                log::Level::Warn => "WARN ",
                log::Level::Info => "info ",
                log::Level::Debug => "debug",
                log::Level::Trace => "trace",
            };
            println!(
                "[{}] {}: {}",
                level,
                record.module_path().unwrap_or("kernel"),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger. Called once, first thing in `kernel_main`.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Apply a `loglevel=` command-line value. Unknown values are ignored.
pub fn set_level(name: &str) {
    let level = match name {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => return,
    };
    log::set_max_level(level);
}
