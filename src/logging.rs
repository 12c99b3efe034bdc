// framesmith - Video to still image dataset pipeline.
// Copyright 2025 0verv0ltage
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Log sink: an append-only text file mirrored to standard output.
//!
//! Installed once by the entry point. Every other module only uses the
//! `log` macros.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::Mutex,
};

use anyhow::{Context, Result};
use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};

#[derive(Debug, Clone)]
/// Where log lines go and how verbose they are.
pub struct LogConfig {
    /// File log lines are appended to. `None` logs to stdout only.
    pub file: Option<PathBuf>,
    /// Most verbose level written.
    pub level: LevelFilter,
}

#[derive(Debug)]
/// `log::Log` implementation writing each record to both sinks.
struct TeeLogger {
    /// Verbosity limit.
    level: LevelFilter,
    /// Open log file, shared between worker threads.
    file: Option<Mutex<File>>,
}

impl TeeLogger {
    /// Formats one record as `[timestamp][LEVEL] message`.
    fn format(record: &Record<'_>) -> String {
        format!(
            "[{}][{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    }
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = Self::format(record);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
        let _ = writeln!(io::stdout().lock(), "{line}");
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        let _ = io::stdout().flush();
    }
}

/// Install the process wide logger.
///
/// # Errors
/// Fails if the log file can not be opened or a logger was already installed.
pub fn init(config: &LogConfig) -> Result<()> {
    let file = match &config.file {
        Some(path) => Some(Mutex::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Unable to open log file {}", path.display()))?,
        )),
        None => None,
    };
    log::set_boxed_logger(Box::new(TeeLogger {
        level: config.level,
        file,
    }))
    .context("Logger already initialized.")?;
    log::set_max_level(config.level);
    Ok(())
}
