//! Centralized log devices.
//!
//! The parent process owns every log sink. Workers reach buffered sinks
//! through the PPC `LogAppend` command; the `tracing` device is safe to write
//! from any process and is written directly.

mod sink;

pub use sink::{LogLine, LogSink};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Error, Result};

/// Maximum length of a single log line in bytes.
pub const MAX_LINE: usize = 512;

/// Log severity, from low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Notice,
    Warning,
    #[serde(rename = "err")]
    Error,
    Crit,
    Alert,
    Emerg,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Notice => "notice",
            Level::Warning => "warning",
            Level::Error => "err",
            Level::Crit => "crit",
            Level::Alert => "alert",
            Level::Emerg => "emerg",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "notice" => Ok(Level::Notice),
            "warning" | "warn" => Ok(Level::Warning),
            "err" | "error" => Ok(Level::Error),
            "crit" => Ok(Level::Crit),
            "alert" => Ok(Level::Alert),
            "emerg" => Ok(Level::Emerg),
            other => Err(Error::config(format!("unknown log level [{}]", other))),
        }
    }
}

/// Log device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Bounded in-memory FIFO.
    Memory,
    /// Buffered append-only file.
    File,
    /// Forwarded to the tracing subscriber.
    Tracing,
}

/// A pre-rendered log line as carried by the `LogAppend` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: Level,
    pub line: String,
}

impl LogRecord {
    pub fn new(level: Level, line: impl Into<String>) -> Self {
        Self {
            level,
            line: line.into(),
        }
    }
}

/// Destination for log lines produced while serving a connection.
pub trait LogWriter {
    fn write_line(&mut self, level: Level, line: &str) -> Result<()>;
}

impl LogWriter for LogSink {
    fn write_line(&mut self, level: Level, line: &str) -> Result<()> {
        self.write(level, line)
    }
}

/// An optional device; lines are dropped when absent.
impl<W: LogWriter + ?Sized> LogWriter for Option<&mut W> {
    fn write_line(&mut self, level: Level, line: &str) -> Result<()> {
        match self {
            Some(writer) => writer.write_line(level, line),
            None => Ok(()),
        }
    }
}

/// Cut `line` to at most [`MAX_LINE`] bytes on a character boundary.
pub(crate) fn truncate_line(line: &str) -> &str {
    if line.len() <= MAX_LINE {
        return line;
    }
    let mut end = MAX_LINE;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Warning < Level::Error);
        assert!(Level::Alert < Level::Emerg);
    }

    #[test]
    fn level_parsing_accepts_aliases() {
        assert_eq!("WARN".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!("error".parse::<Level>().unwrap(), Level::Error);
        assert_eq!("notice".parse::<Level>().unwrap(), Level::Notice);
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_LINE);
        let cut = truncate_line(&long);
        assert!(cut.len() <= MAX_LINE);
        assert!(cut.chars().all(|c| c == 'é'));

        assert_eq!(truncate_line("short"), "short");
    }

    #[test]
    fn record_serializes_lowercase_level() {
        let json = serde_json::to_string(&LogRecord::new(Level::Warning, "disk")).unwrap();
        assert_eq!(json, r#"{"level":"warning","line":"disk"}"#);
    }
}
