//! Kernel log output through the console macros.
//!
//! The level is fixed at build time by the `LOG` environment variable
//! (`error`, `warn`, `info`, `debug`, `trace` or `off`) and defaults to `info`.

use kidneyos_shared::println;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let color = match record.level() {
            Level::Error => 31,
            Level::Warn => 93,
            Level::Info => 34,
            Level::Debug => 32,
            Level::Trace => 90,
        };
        println!(
            "\u{1B}[{}m[{:>5}] {}\u{1B}[0m",
            color,
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn level_filter(level: Option<&str>) -> LevelFilter {
    match level {
        Some("error" | "ERROR") => LevelFilter::Error,
        Some("warn" | "WARN") => LevelFilter::Warn,
        Some("debug" | "DEBUG") => LevelFilter::Debug,
        Some("trace" | "TRACE") => LevelFilter::Trace,
        Some("off" | "OFF") => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Install the console logger. Fails if a logger is already installed.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level_filter(option_env!("LOG")));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(level_filter(None), LevelFilter::Info);
        assert_eq!(level_filter(Some("trace")), LevelFilter::Trace);
        assert_eq!(level_filter(Some("WARN")), LevelFilter::Warn);
        assert_eq!(level_filter(Some("verbose")), LevelFilter::Info);
    }

    #[test]
    fn installs_once() {
        let _ = init();
        assert!(init().is_err());
        log::info!("logger installed");
    }
}
