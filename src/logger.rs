use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

const CRATE_TARGET: &str = env!("CARGO_CRATE_NAME");

struct DynLogger {
    level: AtomicUsize,
}

impl DynLogger {
    const fn new() -> Self {
        Self {
            level: AtomicUsize::new(LevelFilter::Info as usize),
        }
    }

    fn current_level(&self) -> LevelFilter {
        match self.level.load(Ordering::Relaxed) {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    fn set_level_internal(&self, level: LevelFilter) {
        self.level.store(level as usize, Ordering::Relaxed);
    }
}

impl Log for DynLogger {
    // HTTP and IMDS client internals only get through at trace level.
    fn enabled(&self, metadata: &Metadata) -> bool {
        let level = self.current_level();
        if !metadata.target().starts_with(CRATE_TARGET) && level < LevelFilter::Trace {
            return metadata.level() <= Level::Warn && metadata.level() <= level;
        }
        metadata.level() <= level
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

static LOGGER: DynLogger = DynLogger::new();

pub fn init_logger(level: Level) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Trace);
    set_log_level(level);
    Ok(())
}

pub fn set_log_level(level: Level) {
    LOGGER.set_level_internal(level.to_level_filter());
}

#[cfg(test)]
mod test {
    use log::MetadataBuilder;

    use super::*;

    fn enabled(logger: &DynLogger, target: &str, level: Level) -> bool {
        logger.enabled(&MetadataBuilder::new().target(target).level(level).build())
    }

    #[test]
    fn test_level_round_trip() {
        let logger = DynLogger::new();
        for level in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            logger.set_level_internal(level);
            assert_eq!(logger.current_level(), level);
        }
    }

    #[test]
    fn test_foreign_targets_filtered_below_trace() {
        let logger = DynLogger::new();
        logger.set_level_internal(LevelFilter::Debug);
        assert!(enabled(&logger, "platform_metadata::transport", Level::Debug));
        assert!(!enabled(&logger, "reqwest::connect", Level::Debug));
        assert!(enabled(&logger, "reqwest::connect", Level::Warn));

        logger.set_level_internal(LevelFilter::Trace);
        assert!(enabled(&logger, "reqwest::connect", Level::Debug));

        logger.set_level_internal(LevelFilter::Error);
        assert!(!enabled(&logger, "reqwest::connect", Level::Warn));
    }
}
