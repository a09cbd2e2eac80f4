//! Experiment tracking
//!
//! Lightweight JSONL metrics log, written next to the run output. Disabled
//! trackers swallow every call so the training loop never branches on the
//! toggle.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

pub struct RunTracker {
    writer: Option<BufWriter<File>>,
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    step: usize,
    name: &'a str,
    value: f64,
}

impl RunTracker {
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    pub fn to_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)
            .with_context(|| format!("creating metrics log {}", path.display()))?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    /// Record the run configuration once, at the start.
    pub fn log_config<T: Serialize>(&mut self, config: &T) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, config)?;
            writeln!(writer)?;
        }
        Ok(())
    }

    pub fn log_scalar(&mut self, step: usize, name: &str, value: f64) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, &ScalarRecord { step, name, value })?;
            writeln!(writer)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracker_is_a_no_op() {
        let mut tracker = RunTracker::disabled();
        assert!(!tracker.is_enabled());
        tracker.log_scalar(0, "loss", 1.0).unwrap();
        tracker.flush().unwrap();
    }

    #[test]
    fn enabled_tracker_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");

        let mut tracker = RunTracker::to_file(&path).unwrap();
        tracker.log_scalar(0, "loss", 0.5).unwrap();
        tracker.log_scalar(1, "loss", 0.25).unwrap();
        tracker.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let record: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(record["step"], 1);
        assert_eq!(record["value"], 0.25);
    }
}
