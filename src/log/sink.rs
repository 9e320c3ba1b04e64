//! Log device implementations.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use super::{truncate_line, Level, LogKind};
use crate::types::{Error, LogConfig, Result};

/// A line held by a memory log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

#[derive(Debug)]
enum Device {
    Memory {
        bound: usize,
        lines: VecDeque<LogLine>,
    },
    File {
        path: PathBuf,
        writer: BufWriter<File>,
    },
    Tracing,
}

/// A log device with a severity threshold.
#[derive(Debug)]
pub struct LogSink {
    threshold: Level,
    flush_interval: Duration,
    device: Device,
}

impl LogSink {
    /// Open the device described by `config`.
    pub fn open(config: &LogConfig) -> Result<Self> {
        let device = match config.kind {
            LogKind::Memory => Device::Memory {
                bound: config.limit,
                lines: VecDeque::with_capacity(config.limit.min(1024)),
            },
            LogKind::File => {
                let path = config
                    .path
                    .clone()
                    .ok_or_else(|| Error::config("file log requires a path"))?;
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                Device::File {
                    path,
                    writer: BufWriter::new(file),
                }
            }
            LogKind::Tracing => Device::Tracing,
        };

        Ok(Self {
            threshold: config.threshold,
            flush_interval: config.flush_interval,
            device,
        })
    }

    /// Append a line; lines below the threshold are dropped.
    pub fn write(&mut self, level: Level, line: &str) -> Result<()> {
        if level < self.threshold {
            return Ok(());
        }
        let line = truncate_line(line);

        match &mut self.device {
            Device::Memory { bound, lines } => {
                while lines.len() >= *bound {
                    lines.pop_front();
                }
                lines.push_back(LogLine {
                    level,
                    timestamp: Utc::now(),
                    line: line.to_string(),
                });
            }
            Device::File { writer, .. } => {
                writeln!(writer, "{} [{}] {}", Utc::now().to_rfc3339(), level, line)?;
            }
            Device::Tracing => match level {
                Level::Debug => tracing::debug!(target: "forkd::log", "{}", line),
                Level::Info | Level::Notice => tracing::info!(target: "forkd::log", "{}", line),
                Level::Warning => tracing::warn!(target: "forkd::log", "{}", line),
                _ => tracing::error!(target: "forkd::log", level = %level, "{}", line),
            },
        }
        Ok(())
    }

    /// Push buffered lines to the underlying device.
    pub fn flush(&mut self) -> Result<()> {
        if let Device::File { writer, path } = &mut self.device {
            writer.flush().map_err(|e| {
                Error::resource(format!("flushing {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }

    /// Whether any process may write to this device directly.
    pub fn is_direct(&self) -> bool {
        matches!(self.device, Device::Tracing)
    }

    pub fn kind(&self) -> LogKind {
        match self.device {
            Device::Memory { .. } => LogKind::Memory,
            Device::File { .. } => LogKind::File,
            Device::Tracing => LogKind::Tracing,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Lines held by a memory log, oldest first. Empty for other devices.
    pub fn lines(&self) -> impl Iterator<Item = &LogLine> {
        let lines = match &self.device {
            Device::Memory { lines, .. } => Some(lines.iter()),
            _ => None,
        };
        lines.into_iter().flatten()
    }

    /// Number of lines held by a memory log.
    pub fn count(&self) -> usize {
        match &self.device {
            Device::Memory { lines, .. } => lines.len(),
            _ => 0,
        }
    }

    /// Drop every line of a memory log.
    pub fn clear(&mut self) {
        if let Device::Memory { lines, .. } = &mut self.device {
            lines.clear();
        }
    }
}
