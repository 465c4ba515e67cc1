// Copyright 2024 The Lantern Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Routes the `log` crate's records to the serial port.
//!
//! The library crates log through the [`log`] facade so they stay
//! independent of the output device; this module is the kernel's one
//! sink, prefixing each record with its level and writing it to COM1.

use log::{Level, LevelFilter, Log, Metadata, Record};
use serial::println;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let prefix = match record.level() {
            Level::Error => "FAIL",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DBUG",
            Level::Trace => "TRCE",
        };

        println!("[{}] {}", prefix, record.args());
    }

    fn flush(&self) {}
}

/// Installs the serial logger as the `log` crate's sink.
///
pub(crate) fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}
