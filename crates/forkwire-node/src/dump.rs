use std::error::Error;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Local, SecondsFormat};
use forkwire_frame::DumpSink;
use serde::Serialize;
use tracing::{error, warn};

/// File extension of dump files.
pub const DUMP_EXTENSION: &str = "dumpstream";

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum RecordKind {
    Text,
    Error,
}

#[derive(Debug, Serialize)]
struct DumpRecord<'a> {
    time: String,
    kind: RecordKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
    message: String,
}

/// Writes dumps as JSON lines into `<dir>/<timestamp>-<label>.dumpstream`.
///
/// The file is created on the first dump, so a clean run leaves nothing
/// behind. Every record is also logged through `tracing`.
pub struct FileDump {
    path: PathBuf,
    file: Mutex<Option<BufWriter<File>>>,
}

impl FileDump {
    pub fn new(dir: impl AsRef<Path>, label: &str) -> Self {
        Self::at(dir, label, Local::now())
    }

    fn at(dir: impl AsRef<Path>, label: &str, now: DateTime<Local>) -> Self {
        let file_name = format!(
            "{}-{label}.{DUMP_EXTENSION}",
            now.format("%Y-%m-%dT%H-%M-%S_%3f")
        );
        Self {
            path: dir.as_ref().join(file_name),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &DumpRecord<'_>) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = self.append_locked(&mut file, record) {
            error!(path = %self.path.display(), error = %err, "cannot write dump file");
        }
    }

    fn append_locked(
        &self,
        file: &mut Option<BufWriter<File>>,
        record: &DumpRecord<'_>,
    ) -> io::Result<()> {
        if file.is_none() {
            *file = Some(BufWriter::new(self.open()?));
        }
        let Some(writer) = file.as_mut() else {
            return Ok(());
        };
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    fn open(&self) -> io::Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
    }
}

impl DumpSink for FileDump {
    fn dump_text(&self, text: &str) {
        warn!(target: "forkwire::dump", "{text}");
        self.append(&DumpRecord {
            time: timestamp(),
            kind: RecordKind::Text,
            context: None,
            message: text.to_string(),
        });
    }

    fn dump_error(&self, context: &str, err: &dyn Error) {
        error!(target: "forkwire::dump", error = %err, "{context}");
        self.append(&DumpRecord {
            time: timestamp(),
            kind: RecordKind::Error,
            context: Some(context),
            message: err.to_string(),
        });
    }
}

impl std::fmt::Debug for FileDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDump").field("path", &self.path).finish()
    }
}

fn timestamp() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Millis, false)
}
