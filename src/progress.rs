//! Import progress reporting.
//!
//! The import pipeline emits one [`ImportProgressEvent`] at the start and
//! end of every stage, and one per embedding batch, so callers can show
//! what is being processed and how much is left. Reporters must be cheap:
//! they run inline on the import task.

use std::fmt;

use tracing::debug;

/// Stage of a single-document import, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImportStage {
    Chunking,
    Embedding,
    Dedup,
    Storing,
}

impl ImportStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStage::Chunking => "chunking",
            ImportStage::Embedding => "embedding",
            ImportStage::Dedup => "dedup",
            ImportStage::Storing => "storing",
        }
    }
}

impl fmt::Display for ImportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single progress event. `completed` never decreases within a stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportProgressEvent {
    pub stage: ImportStage,
    pub completed: u64,
    pub total: u64,
    /// Human label, e.g. the source value being imported.
    pub label: String,
}

/// Receives progress events from the import pipeline.
pub trait ImportProgressReporter: Send + Sync {
    fn report(&self, event: ImportProgressEvent);
}

impl<F> ImportProgressReporter for F
where
    F: Fn(ImportProgressEvent) + Send + Sync,
{
    fn report(&self, event: ImportProgressEvent) {
        self(event)
    }
}

/// Emits every event as a `tracing` debug record:
/// `import notes.md  embedding  1,200 / 5,000`.
pub struct TracingProgress;

impl ImportProgressReporter for TracingProgress {
    fn report(&self, event: ImportProgressEvent) {
        debug!(
            stage = %event.stage,
            completed = event.completed,
            total = event.total,
            "import {}  {}  {} / {}",
            event.label,
            event.stage,
            format_number(event.completed),
            format_number(event.total)
        );
    }
}

/// No-op reporter when progress is not wanted.
pub struct NoProgress;

impl ImportProgressReporter for NoProgress {
    fn report(&self, _event: ImportProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn closures_are_reporters() {
        let seen = Mutex::new(Vec::new());
        let reporter = |event: ImportProgressEvent| seen.lock().unwrap().push(event.stage);
        reporter.report(ImportProgressEvent {
            stage: ImportStage::Dedup,
            completed: 1,
            total: 2,
            label: "doc".to_string(),
        });
        TracingProgress.report(ImportProgressEvent {
            stage: ImportStage::Storing,
            completed: 0,
            total: 0,
            label: "doc".to_string(),
        });
        assert_eq!(*seen.lock().unwrap(), vec![ImportStage::Dedup]);
    }
}
