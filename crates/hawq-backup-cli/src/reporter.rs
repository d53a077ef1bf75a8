//! Progress output on stderr.

use hawq_backup::{ProgressEvent, ProgressReporter};
use std::io::Write;

const BAR_WIDTH: usize = 30;

/// `(current/total) |#####-----| table` redrawn in place.
pub struct TextProgress;

impl TextProgress {
    fn draw(&self, completed: usize, total: usize, label: &str) {
        let filled = if total == 0 {
            BAR_WIDTH
        } else {
            completed * BAR_WIDTH / total
        };
        let bar = format!("{}{}", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled));
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r\x1b[2K({}/{}) |{}| {}", completed, total, bar, label);
        if completed >= total {
            let _ = writeln!(err);
        }
        let _ = err.flush();
    }
}

impl ProgressReporter for TextProgress {
    fn report(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::TableFinished {
                table,
                completed,
                total,
                ..
            } => self.draw(*completed, *total, &table.to_string()),
            ProgressEvent::TableFailed {
                table,
                completed,
                total,
                ..
            } => self.draw(*completed, *total, &format!("{} FAILED", table)),
            _ => {}
        }
    }
}

/// One JSON object per event.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            eprintln!("{}", line);
        }
    }
}
