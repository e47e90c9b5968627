use std::error::Error;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, warn};

/// Destination for diagnostics about a channel: corrupted input, stray
/// console output and write failures.
///
/// Implementations must be cheap to call from any thread; encoders and
/// decoders hold them behind an `Arc`.
pub trait DumpSink: Send + Sync {
    fn dump_text(&self, text: &str);

    fn dump_error(&self, context: &str, error: &dyn Error);
}

/// Dumps through `tracing` only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDump;

impl LogDump {
    pub fn shared() -> Arc<dyn DumpSink> {
        Arc::new(LogDump)
    }
}

impl DumpSink for LogDump {
    fn dump_text(&self, text: &str) {
        warn!(target: "forkwire::dump", "{text}");
    }

    fn dump_error(&self, context: &str, err: &dyn Error) {
        error!(target: "forkwire::dump", error = %err, "{context}");
    }
}

/// Keeps every dump in memory. Useful for inspecting what a decoder
/// discarded.
#[derive(Debug, Default)]
pub struct MemoryDump {
    records: Mutex<Vec<String>>,
}

impl MemoryDump {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records dumped so far.
    pub fn records(&self) -> Vec<String> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DumpSink for MemoryDump {
    fn dump_text(&self, text: &str) {
        self.lock().push(text.to_string());
    }

    fn dump_error(&self, context: &str, err: &dyn Error) {
        self.lock().push(format!("{context}: {err}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_dump_records_in_order() {
        let dump = MemoryDump::new();
        assert!(dump.is_empty());

        dump.dump_text("first");
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        dump.dump_error("writing frame", &err);

        assert_eq!(dump.len(), 2);
        assert_eq!(
            dump.records(),
            vec!["first".to_string(), "writing frame: pipe gone".to_string()]
        );
    }

    #[test]
    fn test_log_dump_is_object_safe() {
        let sink: Arc<dyn DumpSink> = LogDump::shared();
        sink.dump_text("corrupted");
        sink.dump_error("context", &std::fmt::Error);
    }
}
