//! Busy indicator for in-flight warehouse calls.

use std::time::Instant;

const FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Milliseconds per animation frame.
const FRAME_DURATION_MS: u128 = 100;

#[derive(Debug, Clone)]
pub struct Spinner {
    start_time: Instant,
    label: String,
}

impl Spinner {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            start_time: Instant::now(),
            label: label.into(),
        }
    }

    pub fn frame(&self) -> &'static str {
        let index = (self.start_time.elapsed().as_millis() / FRAME_DURATION_MS) as usize;
        FRAMES[index % FRAMES.len()]
    }

    /// Frame, label and elapsed whole seconds, e.g. `⠙ Estimating 3s`.
    pub fn display(&self) -> String {
        format!(
            "{} {} {}s",
            self.frame(),
            self.label,
            self.start_time.elapsed().as_secs()
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}
