use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

const CRATE_TARGET: &str = "virt_netsetup";

/// Stderr logger. Records from other crates (the netlink stack is chatty at
/// debug level) are capped at warn unless tracing is enabled.
struct NetsetupLogger {
    level: AtomicUsize,
}

impl NetsetupLogger {
    const fn new() -> Self {
        Self {
            level: AtomicUsize::new(LevelFilter::Info as usize),
        }
    }

    fn level(&self) -> LevelFilter {
        LevelFilter::iter()
            .nth(self.level.load(Ordering::Relaxed))
            .unwrap_or(LevelFilter::Trace)
    }

    fn set_level(&self, level: LevelFilter) {
        self.level.store(level as usize, Ordering::Relaxed);
    }

    fn target_level(&self, target: &str) -> LevelFilter {
        let level = self.level();
        let own = target == CRATE_TARGET
            || target.starts_with("virt_netsetup::")
            || target == "netsetup";
        if own || level == LevelFilter::Trace {
            level
        } else {
            level.min(LevelFilter::Warn)
        }
    }
}

impl Log for NetsetupLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.target_level(metadata.target())
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(
                io::stderr(),
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

static LOGGER: NetsetupLogger = NetsetupLogger::new();

/// Installs the process logger at debug or info level.
pub fn init_logger(debug: bool) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Trace);
    set_log_level(if debug { Level::Debug } else { Level::Info });
    Ok(())
}

pub fn set_log_level(level: Level) {
    LOGGER.set_level(level.to_level_filter());
}
