use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use forkwire_frame::{
    encode_frame, FieldValue, Message, Opcode, ProtocolVariant, RawFrame, Vocabulary,
    MAGIC_COMMAND,
};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    /// Canonical wire form of each frame.
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FrameOutput<'a> {
    pub stream: &'static str,
    pub opcode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_run_id: Option<u64>,
    pub fields: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<&'a str>,
    pub timestamp_ms: u128,
}

impl<'a> FrameOutput<'a> {
    pub fn from_frame<K: Opcode>(frame: &RawFrame<'_, K>, worker: Option<&'a str>) -> Self {
        Self {
            stream: if K::MAGIC == MAGIC_COMMAND {
                "command"
            } else {
                "event"
            },
            opcode: frame.kind.as_str(),
            run_mode: frame.run_mode.map(|mode| mode.as_str()),
            test_run_id: frame.test_run_id,
            fields: frame.fields.iter().map(field_value).collect(),
            worker,
            timestamp_ms: now_unix_millis(),
        }
    }
}

fn field_value(field: &FieldValue<'_>) -> Value {
    match field {
        FieldValue::Text(Some(text)) => Value::String(text.to_string()),
        FieldValue::Integer(Some(n)) => Value::from(*n),
        FieldValue::Text(None) | FieldValue::Integer(None) => Value::Null,
    }
}

fn field_text(field: &Value) -> String {
    match field {
        Value::Null => "-".to_string(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Print one decoded message to stdout in `format`.
pub fn print_message<M: Message>(
    message: &M,
    worker: Option<&str>,
    variant: ProtocolVariant,
    format: OutputFormat,
) {
    let frame = message.to_frame();
    match format {
        OutputFormat::Json => {
            let out = FrameOutput::from_frame(&frame, worker);
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let out = FrameOutput::from_frame(&frame, worker);
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["OPCODE", "RUN MODE", "TEST RUN", "FIELDS"])
                .add_row(vec![
                    out.opcode.to_string(),
                    out.run_mode.unwrap_or("-").to_string(),
                    out.test_run_id
                        .map_or_else(|| "-".to_string(), |id| id.to_string()),
                    out.fields
                        .iter()
                        .map(field_text)
                        .collect::<Vec<_>>()
                        .join(" | "),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let out = FrameOutput::from_frame(&frame, worker);
            let fields: Vec<String> = out.fields.iter().map(field_text).collect();
            println!(
                "{} {} run_mode={} test_run_id={} worker={} fields=[{}]",
                out.stream,
                out.opcode,
                out.run_mode.unwrap_or("-"),
                out.test_run_id
                    .map_or_else(|| "-".to_string(), |id| id.to_string()),
                worker.unwrap_or("-"),
                fields.join(", ")
            );
        }
        OutputFormat::Raw => print_raw(&frame, variant),
    }
}

fn now_unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn print_raw<K: Opcode>(frame: &RawFrame<'_, K>, variant: ProtocolVariant) {
    let vocabulary = Vocabulary::<K>::shared();
    let mut buf = BytesMut::new();
    if let Err(err) = encode_frame(&vocabulary, frame, variant, &mut buf) {
        tracing::warn!(error = %err, "cannot re-encode frame");
        return;
    }
    let mut out = std::io::stdout();
    let _ = out.write_all(&buf);
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use forkwire_frame::{Event, OutputEvent, ReportEntry, ReportEvent, RunMode};

    use super::*;

    #[test]
    fn json_output_keeps_nulls_and_header() {
        let event = Event::TestStarting(ReportEvent {
            run_mode: RunMode::RerunFailingTests,
            entry: ReportEntry::new("pkg.MyTest", "shouldWork").with_test_run_id(9),
        });
        let frame = event.to_frame();
        let out = FrameOutput::from_frame(&frame, Some("worker-1"));

        assert_eq!(out.stream, "event");
        assert_eq!(out.opcode, "test-starting");
        assert_eq!(out.run_mode, Some("rerun-test-after-failure"));
        assert_eq!(out.test_run_id, Some(9));
        assert_eq!(out.fields[0], Value::from("pkg.MyTest"));
        assert!(out.fields.iter().any(Value::is_null));

        let json = serde_json::to_value(&out).expect("serializable");
        assert_eq!(json["worker"], "worker-1");
    }

    #[test]
    fn header_less_frames_omit_run_mode() {
        let frame = Event::Bye.to_frame();
        let json = serde_json::to_value(FrameOutput::from_frame(&frame, None))
            .expect("serializable");
        assert!(json.get("run_mode").is_none());
        assert!(json.get("worker").is_none());
        assert_eq!(json["fields"], Value::Array(Vec::new()));
    }

    #[test]
    fn output_field_text_marks_null() {
        let event = Event::StdOutStream(OutputEvent {
            run_mode: RunMode::Normal,
            test_run_id: None,
            text: None,
        });
        let frame = event.to_frame();
        let out = FrameOutput::from_frame(&frame, None);
        let texts: Vec<String> = out.fields.iter().map(field_text).collect();
        assert_eq!(texts, vec!["-".to_string()]);
    }
}
