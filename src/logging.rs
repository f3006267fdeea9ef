//! Logging bootstrap for the binaries and the handle passed to pipeline stages.
//!
//! Library code never logs through the global facade directly. Every stage takes a
//! [PipelineLog] which carries its own target and verbosity, so callers decide what
//! each stage is allowed to emit.

use crate::error::Result;
use flexi_logger::{Duplicate, FileSpec, Logger, LoggerHandle, WriteMode};
use log::{Level, LevelFilter};
use std::fmt;
use std::path::Path;

const LOG_FILE_BASENAME: &str = "dmri-prep";
const ROOT_TARGET: &str = "dmri_prep";

/// starts the process logger. Messages go to stderr, and additionally to a log file when
/// `log_dir` is given. The returned handle must be kept alive for the duration of the run.
pub fn init_logging(level: LevelFilter, log_dir: Option<&Path>) -> Result<LoggerHandle> {
    let logger = Logger::try_with_str(level.as_str().to_ascii_lowercase())?;
    let logger = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            logger
                .log_to_file(FileSpec::default().directory(dir).basename(LOG_FILE_BASENAME))
                .duplicate_to_stderr(Duplicate::All)
                .format_for_files(flexi_logger::detailed_format)
                .write_mode(WriteMode::BufferAndFlush)
        }
        None => logger.log_to_stderr(),
    };
    Ok(logger.start()?)
}

/// Logging handle injected into pipeline stages.
#[derive(Debug, Clone)]
pub struct PipelineLog {
    target: String,
    level: LevelFilter,
}

impl Default for PipelineLog {
    fn default() -> Self {
        Self::new(LevelFilter::Info)
    }
}

impl PipelineLog {
    pub fn new(level: LevelFilter) -> Self {
        Self {
            target: ROOT_TARGET.to_string(),
            level,
        }
    }

    /// a handle that emits nothing
    pub fn silent() -> Self {
        Self::new(LevelFilter::Off)
    }

    /// derives a handle for a named stage, inheriting the verbosity
    pub fn stage(&self, name: &str) -> Self {
        Self {
            target: format!("{ROOT_TARGET}::{name}"),
            level: self.level,
        }
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level
    }

    pub fn error(&self, args: fmt::Arguments) {
        self.emit(Level::Error, args)
    }

    pub fn warn(&self, args: fmt::Arguments) {
        self.emit(Level::Warn, args)
    }

    pub fn info(&self, args: fmt::Arguments) {
        self.emit(Level::Info, args)
    }

    pub fn debug(&self, args: fmt::Arguments) {
        self.emit(Level::Debug, args)
    }

    fn emit(&self, level: Level, args: fmt::Arguments) {
        if self.enabled(level) {
            log::log!(target: self.target.as_str(), level, "{}", args);
        }
    }
}
