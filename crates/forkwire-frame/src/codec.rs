use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};
use crate::opcode::{Opcode, Segment, Vocabulary};

/// Magic preamble of frames sent by the test runner.
pub const MAGIC_COMMAND: &str = "forkwire-command";

/// Magic preamble of frames sent by a forked worker.
pub const MAGIC_EVENT: &str = "forkwire-event";

/// Token separator.
pub const DELIMITER: u8 = b':';

/// Frame terminator.
pub const LINE_BREAK: u8 = b'\n';

/// Token standing for an absent value.
pub const NULL_TOKEN: &[u8] = b"-";

/// The only character set string fields are written in.
pub const ENCODING_UTF8: &str = "UTF-8";

/// Default maximum payload field size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Longest header token (magic, opcode, run mode, ids, lengths) accepted by
/// the decoder.
pub const MAX_HEADER_TOKEN: usize = 64;

/// How string payload fields are written.
///
/// ```text
/// Binary:  ...:<byte-length>:<utf-8 bytes>:...     null: ...:-:...
/// Legacy:  ...:<base64 of utf-8 bytes>:...         null: ...:-:...
/// ```
///
/// Both share the header and opcode rules; only the field encoding differs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProtocolVariant {
    #[default]
    Binary,
    Legacy,
}

impl ProtocolVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVariant::Binary => "binary",
            ProtocolVariant::Legacy => "legacy",
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVariant {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binary" => Ok(ProtocolVariant::Binary),
            "legacy" => Ok(ProtocolVariant::Legacy),
            other => Err(FrameError::UnknownVariant(other.to_string())),
        }
    }
}

/// Whether a test runs for the first time or is re-run after failing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RunMode {
    #[default]
    Normal,
    RerunFailingTests,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Normal => "normal-run",
            RunMode::RerunFailingTests => "rerun-test-after-failure",
        }
    }

    pub fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"normal-run" => Some(RunMode::Normal),
            b"rerun-test-after-failure" => Some(RunMode::RerunFailingTests),
            _ => None,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One payload field of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Text(Option<Cow<'a, str>>),
    Integer(Option<u32>),
}

impl<'a> FieldValue<'a> {
    pub fn text(value: Option<&'a str>) -> Self {
        FieldValue::Text(value.map(Cow::Borrowed))
    }

    pub fn segment(&self) -> Segment {
        match self {
            FieldValue::Text(_) => Segment::Text,
            FieldValue::Integer(_) => Segment::Integer,
        }
    }
}

/// A frame reduced to its opcode, header values and payload fields.
///
/// This is the common currency between typed messages and the wire: messages
/// convert to and from `RawFrame`, the codec turns it into bytes, and the
/// decoder assembles it token by token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame<'a, K> {
    pub kind: K,
    pub run_mode: Option<RunMode>,
    pub test_run_id: Option<u64>,
    pub fields: Vec<FieldValue<'a>>,
}

impl<'a, K: Opcode> RawFrame<'a, K> {
    pub fn new(kind: K) -> Self {
        Self {
            kind,
            run_mode: None,
            test_run_id: None,
            fields: Vec::new(),
        }
    }

    pub fn with_run_mode(mut self, run_mode: RunMode, test_run_id: Option<u64>) -> Self {
        self.run_mode = Some(run_mode);
        self.test_run_id = test_run_id;
        self
    }

    pub fn text(mut self, value: Option<&'a str>) -> Self {
        self.fields.push(FieldValue::text(value));
        self
    }

    pub fn integer(mut self, value: Option<u32>) -> Self {
        self.fields.push(FieldValue::Integer(value));
        self
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload field size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Upper bound of the encoded size of `frame`, used to size the buffer once.
pub fn estimate_frame_len<K: Opcode>(
    vocabulary: &Vocabulary<K>,
    frame: &RawFrame<'_, K>,
    variant: ProtocolVariant,
) -> usize {
    let mut len = vocabulary.prefix(frame.kind).len() + 1;
    let mut fields = frame.fields.iter();
    for segment in frame.kind.layout() {
        len += 1 + match segment {
            Segment::RunMode => RunMode::RerunFailingTests.as_str().len(),
            Segment::TestRunId => 20,
            Segment::Encoding => ENCODING_UTF8.len(),
            Segment::Integer => 10,
            Segment::Text => match fields.find(|f| f.segment() == Segment::Text) {
                Some(FieldValue::Text(Some(text))) => text_len(text.len(), variant),
                _ => NULL_TOKEN.len(),
            },
        };
    }
    len
}

fn text_len(n: usize, variant: ProtocolVariant) -> usize {
    match variant {
        ProtocolVariant::Binary => decimal_len(n) + 1 + n,
        ProtocolVariant::Legacy => base64_len(n),
    }
}

fn base64_len(n: usize) -> usize {
    4 * n.div_ceil(3)
}

fn decimal_len(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Encode `frame` into `dst`.
///
/// ```text
/// :MAGIC:OPCODE[:RUN-MODE:TEST-RUN-ID][:UTF-8](:FIELD)*:\n
/// ```
///
/// The opcode's layout decides which segments are written; `frame.fields`
/// must supply exactly one value per payload segment, in order.
pub fn encode_frame<K: Opcode>(
    vocabulary: &Vocabulary<K>,
    frame: &RawFrame<'_, K>,
    variant: ProtocolVariant,
    dst: &mut BytesMut,
) -> Result<()> {
    let layout = frame.kind.layout();
    let expected = layout.iter().filter(|s| s.is_field()).count();
    if frame.fields.len() != expected {
        return Err(FrameError::Layout {
            opcode: frame.kind.as_str(),
            reason: format!("expected {expected} fields, got {}", frame.fields.len()),
        });
    }

    dst.reserve(estimate_frame_len(vocabulary, frame, variant));
    dst.put_slice(vocabulary.prefix(frame.kind));

    let mut fields = frame.fields.iter();
    for segment in layout {
        match segment {
            Segment::RunMode => {
                dst.put_slice(frame.run_mode.unwrap_or_default().as_str().as_bytes());
            }
            Segment::TestRunId => put_decimal(dst, frame.test_run_id),
            Segment::Encoding => dst.put_slice(ENCODING_UTF8.as_bytes()),
            Segment::Text | Segment::Integer => match (segment, fields.next()) {
                (Segment::Text, Some(FieldValue::Text(value))) => {
                    put_text(dst, value.as_deref(), variant)?;
                }
                (Segment::Integer, Some(FieldValue::Integer(value))) => {
                    put_decimal(dst, value.map(u64::from));
                }
                (_, field) => {
                    return Err(FrameError::Layout {
                        opcode: frame.kind.as_str(),
                        reason: format!("expected {segment:?} field, got {field:?}"),
                    });
                }
            },
        }
        dst.put_u8(DELIMITER);
    }

    dst.put_u8(LINE_BREAK);
    Ok(())
}

fn put_decimal(dst: &mut BytesMut, value: Option<u64>) {
    match value {
        Some(n) => dst.put_slice(n.to_string().as_bytes()),
        None => dst.put_slice(NULL_TOKEN),
    }
}

fn put_text(dst: &mut BytesMut, value: Option<&str>, variant: ProtocolVariant) -> Result<()> {
    let Some(text) = value else {
        dst.put_slice(NULL_TOKEN);
        return Ok(());
    };

    match variant {
        ProtocolVariant::Binary => {
            dst.put_slice(text.len().to_string().as_bytes());
            dst.put_u8(DELIMITER);
            dst.put_slice(text.as_bytes());
        }
        ProtocolVariant::Legacy => {
            let start = dst.len();
            dst.resize(start + base64_len(text.len()), 0);
            let written = STANDARD
                .encode_slice(text.as_bytes(), &mut dst[start..])
                .map_err(|e| FrameError::Encoding(e.to_string()))?;
            dst.truncate(start + written);
        }
    }
    Ok(())
}

/// Decode one legacy (base64) field token.
pub(crate) fn decode_legacy_text(token: &[u8]) -> std::result::Result<Option<String>, String> {
    if token == NULL_TOKEN {
        return Ok(None);
    }
    let bytes = STANDARD.decode(token).map_err(|e| e.to_string())?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|e| e.to_string())
}

/// Parse a decimal token, `-` meaning absent.
pub(crate) fn parse_decimal<T: FromStr>(token: &[u8]) -> std::result::Result<Option<T>, ()> {
    if token == NULL_TOKEN {
        return Ok(None);
    }
    if token.is_empty() || !token.iter().all(u8::is_ascii_digit) {
        return Err(());
    }
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Some)
        .ok_or(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{CommandKind, EventKind};

    fn encode<K: Opcode>(frame: &RawFrame<'_, K>, variant: ProtocolVariant) -> String {
        let vocabulary = Vocabulary::new();
        let mut buf = BytesMut::new();
        encode_frame(&vocabulary, frame, variant, &mut buf).unwrap();
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_encode_zero_field_command() {
        let frame = RawFrame::new(CommandKind::ByeAck);
        assert_eq!(
            encode(&frame, ProtocolVariant::Binary),
            ":forkwire-command:bye-ack:\n"
        );
        assert_eq!(
            encode(&frame, ProtocolVariant::Legacy),
            ":forkwire-command:bye-ack:\n"
        );
    }

    #[test]
    fn test_encode_binary_text_is_length_prefixed() {
        let frame = RawFrame::new(CommandKind::RunClass).text(Some("pkg.Über"));
        assert_eq!(
            encode(&frame, ProtocolVariant::Binary),
            ":forkwire-command:run-testclass:UTF-8:9:pkg.Über:\n"
        );
    }

    #[test]
    fn test_encode_legacy_text_is_base64() {
        let frame = RawFrame::new(CommandKind::RunClass).text(Some("pkg.A"));
        assert_eq!(
            encode(&frame, ProtocolVariant::Legacy),
            ":forkwire-command:run-testclass:UTF-8:cGtnLkE=:\n"
        );
    }

    #[test]
    fn test_encode_nulls_use_sentinel() {
        let frame = RawFrame::new(EventKind::StdOutStream)
            .with_run_mode(RunMode::RerunFailingTests, None)
            .text(None);
        assert_eq!(
            encode(&frame, ProtocolVariant::Binary),
            ":forkwire-event:std-out-stream:rerun-test-after-failure:-:UTF-8:-:\n"
        );
    }

    #[test]
    fn test_encode_report_layout() {
        let frame = RawFrame::new(EventKind::TestSucceeded)
            .with_run_mode(RunMode::Normal, Some(7))
            .text(Some("a"))
            .text(None)
            .text(Some("b"))
            .text(None)
            .text(None)
            .text(Some(""))
            .integer(Some(42))
            .text(None)
            .text(None)
            .text(None);
        assert_eq!(
            encode(&frame, ProtocolVariant::Binary),
            ":forkwire-event:test-succeeded:normal-run:7:UTF-8:1:a:-:1:b:-:-:0::42:-:-:-:\n"
        );
    }

    #[test]
    fn test_encode_rejects_arity_mismatch() {
        let commands = Vocabulary::<CommandKind>::new();
        let mut buf = BytesMut::new();
        let frame = RawFrame::new(CommandKind::ByeAck).text(Some("extra"));
        let err = encode_frame(&commands, &frame, ProtocolVariant::Binary, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::Layout { opcode: "bye-ack", .. }));

        let events = Vocabulary::<EventKind>::new();
        let frame = RawFrame::new(EventKind::SystemProperty)
            .with_run_mode(RunMode::Normal, None)
            .integer(Some(1))
            .text(None);
        let err = encode_frame(&events, &frame, ProtocolVariant::Binary, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::Layout { opcode: "sys-prop", .. }));
    }

    #[test]
    fn test_estimate_is_an_upper_bound() {
        let vocabulary = Vocabulary::new();
        let long = "x".repeat(1000);
        let frame = RawFrame::new(EventKind::TestFailed)
            .with_run_mode(RunMode::RerunFailingTests, Some(u64::MAX))
            .text(Some(&long))
            .text(Some("é"))
            .text(None)
            .text(Some("n"))
            .text(Some("g"))
            .text(Some("m"))
            .integer(Some(u32::MAX))
            .text(Some("trace"))
            .text(Some(&long))
            .text(None);

        for variant in [ProtocolVariant::Binary, ProtocolVariant::Legacy] {
            let mut buf = BytesMut::new();
            encode_frame(&vocabulary, &frame, variant, &mut buf).unwrap();
            assert!(buf.len() <= estimate_frame_len(&vocabulary, &frame, variant));
        }
    }

    #[test]
    fn test_base64_len() {
        assert_eq!(base64_len(0), 0);
        assert_eq!(base64_len(1), 4);
        assert_eq!(base64_len(3), 4);
        assert_eq!(base64_len(4), 8);
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal::<u32>(b"-"), Ok(None));
        assert_eq!(parse_decimal::<u32>(b"120"), Ok(Some(120)));
        assert_eq!(parse_decimal::<u32>(b""), Err(()));
        assert_eq!(parse_decimal::<u32>(b"+1"), Err(()));
        assert_eq!(parse_decimal::<u32>(b"4294967296"), Err(()));
        assert_eq!(parse_decimal::<u64>(b"4294967296"), Ok(Some(4294967296)));
    }

    #[test]
    fn test_decode_legacy_text() {
        assert_eq!(decode_legacy_text(b"-"), Ok(None));
        assert_eq!(decode_legacy_text(b""), Ok(Some(String::new())));
        assert_eq!(decode_legacy_text(b"cGtnLkE="), Ok(Some("pkg.A".to_string())));
        assert!(decode_legacy_text(b"@@@").is_err());
        assert!(decode_legacy_text(b"//79").is_err());
    }

    #[test]
    fn test_variant_and_run_mode_names() {
        assert_eq!("legacy".parse::<ProtocolVariant>().unwrap(), ProtocolVariant::Legacy);
        assert!("text".parse::<ProtocolVariant>().is_err());
        assert_eq!(ProtocolVariant::default(), ProtocolVariant::Binary);
        assert_eq!(
            RunMode::from_token(b"rerun-test-after-failure"),
            Some(RunMode::RerunFailingTests)
        );
        assert_eq!(RunMode::from_token(b"normal"), None);
    }
}
