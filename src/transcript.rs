//! Push transcript
//!
//! Ordered, human-readable lines reported back to the pusher. Lines are
//! kept for inspection and optionally echoed to a sink as they happen.

use std::sync::{Mutex, PoisonError};

type Sink = Box<dyn Fn(&str) + Send + Sync>;

/// Collects transcript lines for one push
#[derive(Default)]
pub struct Transcript {
    lines: Mutex<Vec<String>>,
    sink: Option<Sink>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo every line to `sink` as it is recorded
    pub fn with_sink(sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            sink: Some(Box::new(sink)),
        }
    }

    fn push(&self, line: String) {
        if let Some(sink) = &self.sink {
            sink(&line);
        }
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    /// A pipeline milestone
    pub fn step(&self, message: impl AsRef<str>) {
        self.push(format!("-----> {}", message.as_ref()));
    }

    /// A formation or deploy notice
    pub fn notice(&self, message: impl AsRef<str>) {
        self.push(format!("=====> {}", message.as_ref()));
    }

    /// Output relayed from a buildpack
    pub fn output(&self, line: impl AsRef<str>) {
        self.push(format!("       {}", line.as_ref()));
    }

    /// Snapshot of all lines so far
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether any line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|l| l.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lines_are_prefixed() {
        let transcript = Transcript::new();
        transcript.step("Creating release...");
        transcript.notice("Application deployed");
        transcript.output("hello");

        assert_eq!(
            transcript.lines(),
            vec![
                "-----> Creating release...",
                "=====> Application deployed",
                "       hello",
            ]
        );
        assert!(transcript.contains("Application deployed"));
        assert!(!transcript.contains("cached"));
    }

    #[test]
    fn sink_sees_lines_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let transcript = Transcript::with_sink(move |line| {
            sink_seen.lock().unwrap().push(line.to_string());
        });

        transcript.step("one");
        transcript.step("two");

        assert_eq!(*seen.lock().unwrap(), transcript.lines());
    }
}
