//! Console logger for Concordia
//!
//! Backs the `log` facade with a line-oriented writer. The console driver
//! itself lives outside this crate; boot code hands us anything that
//! implements `core::fmt::Write` and every record goes there as
//! `[LEVEL] target: message`.

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};

use crate::sync::SpinLock;
use crate::{Error, Result};

/// Console sink type
pub type ConsoleSink = dyn Write + Send;

/// Logger that forwards records to the registered console sink
pub struct ConsoleLogger {
    sink: SpinLock<Option<&'static mut ConsoleSink>>,
}

impl ConsoleLogger {
    const fn new() -> Self {
        Self {
            sink: SpinLock::new(None),
        }
    }
}

static LOGGER: ConsoleLogger = ConsoleLogger::new();

/// Get the compile-time log level
pub fn level() -> LevelFilter {
    if cfg!(feature = "verbose") {
        LevelFilter::Trace
    } else if cfg!(feature = "debug") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Install the console logger
///
/// Fails with `InvalidState` if another logger was already installed.
pub fn init(sink: &'static mut ConsoleSink) -> Result<()> {
    log::set_logger(&LOGGER).map_err(|_| Error::InvalidState)?;
    *LOGGER.sink.lock() = Some(sink);
    log::set_max_level(level());
    Ok(())
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut sink = self.sink.lock();
        if let Some(out) = sink.as_mut() {
            let _ = write_record(&mut **out, record);
        }
    }

    fn flush(&self) {}
}

fn write_record(out: &mut ConsoleSink, record: &Record<'_>) -> fmt::Result {
    writeln!(
        out,
        "[{:<5}] {}: {}",
        record.level(),
        record.target(),
        record.args()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    static CAPTURED: SpinLock<heapless::String<512>> = SpinLock::new(heapless::String::new());

    /// Keeps only complete lines from this test's target, other tests log concurrently
    struct CaptureSink {
        line: heapless::String<256>,
    }

    impl Write for CaptureSink {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for ch in s.chars() {
                if ch == '\n' {
                    if self.line.contains("concordia::test") {
                        let mut captured = CAPTURED.lock();
                        let _ = captured.push_str(&self.line);
                        let _ = captured.push('\n');
                    }
                    self.line.clear();
                } else {
                    let _ = self.line.push(ch);
                }
            }
            Ok(())
        }
    }

    fn capture_sink() -> &'static mut ConsoleSink {
        Box::leak(Box::new(CaptureSink {
            line: heapless::String::new(),
        }))
    }

    #[test]
    fn test_records_reach_sink() {
        init(capture_sink()).expect("logger installs once");

        log::info!(target: "concordia::test", "cells ready");
        log::trace!(target: "concordia::test", "hidden at default level");

        let text = CAPTURED.lock().clone();
        assert!(text.contains("[INFO ] concordia::test: cells ready"));
        if level() < LevelFilter::Trace {
            assert!(!text.contains("hidden"));
        }

        // A second logger cannot be installed
        assert_eq!(init(capture_sink()), Err(Error::InvalidState));
    }
}
