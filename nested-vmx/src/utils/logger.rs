use alloc::format;
use log::{LevelFilter, Metadata, Record, SetLoggerError};

/// Receives every formatted log line.
pub type LogSink = fn(&str);

/// Forwards `log` records to a sink provided by the embedding emulator.
pub struct VmxLogger {
    sink: LogSink,
    level: LevelFilter,
}

impl VmxLogger {
    pub const fn new(sink: LogSink, level: LevelFilter) -> Self {
        Self { sink, level }
    }

    /// Installs the logger as the global `log` backend.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.level);

        Ok(())
    }
}

impl log::Log for VmxLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let message = format!("{} - {}\n", record.level(), record.args());

            (self.sink)(&message);
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use log::Log;

    static LINES: AtomicUsize = AtomicUsize::new(0);

    fn count_sink(line: &str) {
        assert!(line.ends_with('\n'));
        LINES.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn test_level_filter() {
        let logger = VmxLogger::new(count_sink, LevelFilter::Info);

        logger.log(
            &Record::builder()
                .level(log::Level::Info)
                .args(format_args!("vmxon"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(log::Level::Trace)
                .args(format_args!("vmread"))
                .build(),
        );

        assert_eq!(LINES.load(Ordering::Relaxed), 1);
    }
}
