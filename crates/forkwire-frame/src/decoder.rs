//! Resynchronizing stream decoder.
//!
//! The decoder reads a byte stream that may carry more than frames: a forked
//! worker can write straight to the process's standard output, and a broken
//! frame must not take the rest of the stream down with it. Bytes are fed
//! one at a time through a small state machine:
//!
//! ```text
//! Scanning --':'--> Token --':'--> Token ... --> Terminator --'\n'--> frame
//!                     |                            ^
//!                     +--<len>':'--> Bytes --> FieldEnd --':'
//! ```
//!
//! Anything that does not open with `:MAGIC:` is treated as console output
//! and reported line by line. A candidate that did open with the magic but
//! then breaks the grammar is dumped once and the rest of its line is
//! skipped. A `:` that broke it is reused as the start of the next candidate,
//! so a frame later on the same line is still found.

use std::borrow::Cow;
use std::io::{ErrorKind, Read};
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use forkwire_transport::TransportError;
use tracing::{debug, warn};

use crate::codec::{
    decode_legacy_text, parse_decimal, FieldValue, FrameConfig, ProtocolVariant, RawFrame,
    RunMode, DELIMITER, ENCODING_UTF8, LINE_BREAK, MAX_HEADER_TOKEN, NULL_TOKEN,
};
use crate::dump::DumpSink;
use crate::error::{FrameError, MalformedFrame, Result};
use crate::message::{Command, Event, Message};
use crate::opcode::{Opcode, Segment, Vocabulary};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Bytes of a broken frame kept for the dump.
const FRAGMENT_LIMIT: usize = 1024;

/// Longest run of console output reported as one line.
const LINE_LIMIT: usize = 8 * 1024;

/// Decodes [`Command`]s sent by the test runner.
pub type CommandDecoder<R> = StreamDecoder<R, Command>;

/// Decodes [`Event`]s sent by a forked worker.
pub type EventDecoder<R> = StreamDecoder<R, Event>;

/// Reads complete messages of type `M` from any `Read` stream.
///
/// Partial reads, corrupted frames and interleaved console output are
/// handled internally; callers only ever see whole, well-formed messages.
pub struct StreamDecoder<R, M: Message> {
    input: R,
    grammar: Grammar<M::Kind>,
    memento: Option<Memento<M::Kind>>,
    _message: PhantomData<fn() -> M>,
}

impl<R: Read, M: Message> StreamDecoder<R, M> {
    /// Decoder for the binary variant with default limits.
    pub fn new(input: R, vocabulary: Arc<Vocabulary<M::Kind>>, dump: Arc<dyn DumpSink>) -> Self {
        Self::with_config(
            input,
            vocabulary,
            dump,
            ProtocolVariant::default(),
            &FrameConfig::default(),
        )
    }

    pub fn with_config(
        input: R,
        vocabulary: Arc<Vocabulary<M::Kind>>,
        dump: Arc<dyn DumpSink>,
        variant: ProtocolVariant,
        config: &FrameConfig,
    ) -> Self {
        Self {
            input,
            grammar: Grammar {
                vocabulary,
                variant,
                max_payload: config.max_payload_size,
                dump,
            },
            memento: None,
            _message: PhantomData,
        }
    }

    /// Read the next complete message (blocking on blocking inputs).
    ///
    /// Returns `Err(FrameError::EndOfStream)` once the input is exhausted. On
    /// a non-blocking input a `WouldBlock` read surfaces as
    /// `Err(FrameError::Io)`; everything read so far is kept and the next
    /// call resumes where this one stopped.
    pub fn decode(&mut self) -> Result<M> {
        let grammar = &self.grammar;
        let memento = self.memento.get_or_insert_with(Memento::new);

        loop {
            while let Some(frame) = memento.advance(grammar) {
                match M::from_frame(frame) {
                    Ok(message) => return Ok(message),
                    Err(err) => memento.reject(grammar, &err),
                }
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.input.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(read_error(err)),
            };

            if read == 0 {
                if let Some(frame) = memento.finish_input(grammar) {
                    match M::from_frame(frame) {
                        Ok(message) => return Ok(message),
                        Err(err) => memento.reject(grammar, &err),
                    }
                }
                return Err(FrameError::EndOfStream);
            }

            memento.buf.extend_from_slice(&chunk[..read]);
        }
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.grammar.variant
    }

    /// Bytes read from the input but not consumed yet.
    pub fn pending_len(&self) -> usize {
        self.memento.as_ref().map_or(0, |m| m.buf.len())
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.input
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.input
    }

    /// Consume the decoder and return the inner stream.
    pub fn into_inner(self) -> R {
        self.input
    }
}

impl<R, M: Message> std::fmt::Debug for StreamDecoder<R, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("magic", &<M::Kind as Opcode>::MAGIC)
            .field("variant", &self.grammar.variant)
            .field("started", &self.memento.is_some())
            .finish()
    }
}

fn read_error(err: std::io::Error) -> FrameError {
    match TransportError::from_io(&err) {
        Some(TransportError::ChannelClosed) => {
            FrameError::Transport(TransportError::ChannelClosed)
        }
        Some(TransportError::NotReadable) => FrameError::Transport(TransportError::NotReadable),
        _ => FrameError::Io(err),
    }
}

/// Read-only decoding context.
struct Grammar<K> {
    vocabulary: Arc<Vocabulary<K>>,
    variant: ProtocolVariant,
    max_payload: usize,
    dump: Arc<dyn DumpSink>,
}

impl<K: Opcode> Grammar<K> {
    fn report_line(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        warn!(line = %text, "corrupted stream: output outside of a frame");
        self.dump.dump_text(&format!(
            "Corrupted stream: unexpected output outside of a frame: {text}"
        ));
    }

    fn report_frame(&self, reason: &str, fragment: &[u8]) {
        let text = String::from_utf8_lossy(fragment);
        warn!(reason, fragment = %text, "discarding malformed frame");
        self.dump
            .dump_text(&format!("Corrupted frame ({reason}): {text}"));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Outside any frame, waiting for `:`.
    Scanning,
    /// Accumulating a `:`-terminated token.
    Token,
    /// Reading the bytes of a length-prefixed field.
    Bytes { remaining: usize },
    /// Expecting the `:` after a length-prefixed field.
    FieldEnd,
    /// All segments read, expecting the line break.
    Terminator,
}

/// A frame whose opcode is known and whose segments are being filled in.
struct Partial<K> {
    kind: K,
    layout: &'static [Segment],
    next: usize,
    run_mode: Option<RunMode>,
    test_run_id: Option<u64>,
    fields: Vec<FieldValue<'static>>,
}

/// Everything a decoder has read but not yet turned into a message.
struct Memento<K> {
    buf: BytesMut,
    state: State,
    token: Vec<u8>,
    magic: bool,
    partial: Option<Partial<K>>,
    fragment: Vec<u8>,
    line: Vec<u8>,
    /// Drop stray bytes until the next line break.
    skip_line: bool,
}

impl<K: Opcode> Memento<K> {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            state: State::Scanning,
            token: Vec::new(),
            magic: false,
            partial: None,
            fragment: Vec::new(),
            line: Vec::new(),
            skip_line: false,
        }
    }

    /// Consume buffered bytes until a frame completes or the buffer runs dry.
    fn advance(&mut self, g: &Grammar<K>) -> Option<RawFrame<'static, K>> {
        while !self.buf.is_empty() {
            if let State::Bytes { remaining } = self.state {
                let n = remaining.min(self.buf.len());
                let chunk = self.buf.split_to(n);
                self.token.extend_from_slice(&chunk);
                self.record(&chunk);
                self.state = match remaining - n {
                    0 => State::FieldEnd,
                    remaining => State::Bytes { remaining },
                };
                continue;
            }

            let byte = self.buf[0];
            self.buf.advance(1);
            if let Some(frame) = self.step(g, byte) {
                return Some(frame);
            }
        }
        None
    }

    fn step(&mut self, g: &Grammar<K>, byte: u8) -> Option<RawFrame<'static, K>> {
        match self.state {
            State::Scanning => self.scan(g, byte),
            State::Token if !self.magic => self.magic_byte(g, byte),
            State::Token => match byte {
                DELIMITER => {
                    self.record(&[byte]);
                    self.end_token(g);
                }
                LINE_BREAK => self.malformed(g, "line break inside frame", byte),
                _ if self.token.len() >= self.token_limit(g) => {
                    self.malformed(g, "token too long", byte)
                }
                _ => {
                    self.token.push(byte);
                    self.record(&[byte]);
                }
            },
            State::Bytes { remaining } => {
                self.token.push(byte);
                self.record(&[byte]);
                self.state = match remaining {
                    0 | 1 => State::FieldEnd,
                    _ => State::Bytes {
                        remaining: remaining - 1,
                    },
                };
            }
            State::FieldEnd if byte == DELIMITER => {
                self.record(&[byte]);
                self.end_binary_text(g);
            }
            State::FieldEnd => self.malformed(g, "field longer than its length prefix", byte),
            State::Terminator if byte == LINE_BREAK => return self.complete(),
            State::Terminator => self.malformed(g, "unexpected token after last field", byte),
        }
        None
    }

    fn scan(&mut self, g: &Grammar<K>, byte: u8) {
        match byte {
            DELIMITER => self.begin_candidate(),
            LINE_BREAK => {
                self.skip_line = false;
                self.flush_line(g);
            }
            _ if self.skip_line => {}
            _ => {
                self.line.push(byte);
                if self.line.len() >= LINE_LIMIT {
                    self.flush_line(g);
                }
            }
        }
    }

    fn magic_byte(&mut self, g: &Grammar<K>, byte: u8) {
        let magic = g.vocabulary.magic().as_bytes();

        if byte == DELIMITER && self.token == magic {
            self.record(&[byte]);
            self.token.clear();
            self.magic = true;
            self.skip_line = false;
            // Text sharing the line with a frame is still stray output.
            self.flush_line(g);
            return;
        }

        if magic.get(self.token.len()) == Some(&byte) {
            self.token.push(byte);
            self.record(&[byte]);
            return;
        }

        // Not a frame after all: the candidate was console output. A lone
        // separator right before a line break is dropped.
        let fragment = std::mem::take(&mut self.fragment);
        if !self.skip_line && !(self.token.is_empty() && byte == LINE_BREAK) {
            self.line.extend_from_slice(&fragment);
        }
        self.reset();
        self.scan(g, byte);
    }

    fn end_token(&mut self, g: &Grammar<K>) {
        let Some(partial) = self.partial.as_mut() else {
            match g.vocabulary.lookup(&self.token) {
                Some(kind) => {
                    self.partial = Some(Partial {
                        kind,
                        layout: kind.layout(),
                        next: 0,
                        run_mode: None,
                        test_run_id: None,
                        fields: Vec::new(),
                    });
                    self.token.clear();
                    self.after_segment();
                }
                None => self.malformed(g, "unknown opcode", DELIMITER),
            }
            return;
        };

        let token = self.token.as_slice();
        let accepted = match partial.layout[partial.next] {
            Segment::RunMode => RunMode::from_token(token)
                .map(|mode| partial.run_mode = Some(mode))
                .ok_or("invalid run mode"),
            Segment::TestRunId => parse_decimal::<u64>(token)
                .map(|id| partial.test_run_id = id)
                .map_err(|()| "invalid test run id"),
            Segment::Encoding => std::str::from_utf8(token)
                .ok()
                .filter(|charset| charset.eq_ignore_ascii_case(ENCODING_UTF8))
                .map(|_| ())
                .ok_or("unsupported encoding"),
            Segment::Integer => parse_decimal::<u32>(token)
                .map(|value| partial.fields.push(FieldValue::Integer(value)))
                .map_err(|()| "invalid integer field"),
            Segment::Text => match g.variant {
                ProtocolVariant::Legacy => match decode_legacy_text(token) {
                    Ok(text) => {
                        partial
                            .fields
                            .push(FieldValue::Text(text.map(Cow::Owned)));
                        Ok(())
                    }
                    Err(_) => Err("invalid base64 field"),
                },
                ProtocolVariant::Binary if token == NULL_TOKEN => {
                    partial.fields.push(FieldValue::Text(None));
                    Ok(())
                }
                ProtocolVariant::Binary => match parse_decimal::<usize>(token) {
                    Ok(Some(len)) if len <= g.max_payload => {
                        self.token.clear();
                        self.state = match len {
                            0 => State::FieldEnd,
                            remaining => State::Bytes { remaining },
                        };
                        return;
                    }
                    Ok(Some(_)) => Err("field exceeds maximum payload size"),
                    _ => Err("invalid field length"),
                },
            },
        };

        match accepted {
            Ok(()) => {
                partial.next += 1;
                self.token.clear();
                self.after_segment();
            }
            Err(reason) => self.malformed(g, reason, DELIMITER),
        }
    }

    fn end_binary_text(&mut self, g: &Grammar<K>) {
        let bytes = std::mem::take(&mut self.token);
        let Ok(text) = String::from_utf8(bytes) else {
            return self.malformed(g, "invalid UTF-8 in field", DELIMITER);
        };
        let Some(partial) = self.partial.as_mut() else {
            return self.malformed(g, "field without opcode", DELIMITER);
        };
        partial.fields.push(FieldValue::Text(Some(Cow::Owned(text))));
        partial.next += 1;
        self.after_segment();
    }

    fn after_segment(&mut self) {
        self.state = match &self.partial {
            Some(partial) if partial.next >= partial.layout.len() => State::Terminator,
            _ => State::Token,
        };
    }

    fn token_limit(&self, g: &Grammar<K>) -> usize {
        let legacy_text = g.variant == ProtocolVariant::Legacy
            && self
                .partial
                .as_ref()
                .is_some_and(|p| p.layout[p.next] == Segment::Text);
        if legacy_text {
            4 * g.max_payload.div_ceil(3)
        } else {
            MAX_HEADER_TOKEN
        }
    }

    fn complete(&mut self) -> Option<RawFrame<'static, K>> {
        let partial = self.partial.take();
        self.reset_state();
        partial.map(|p| RawFrame {
            kind: p.kind,
            run_mode: p.run_mode,
            test_run_id: p.test_run_id,
            fields: p.fields,
        })
    }

    /// A complete frame that does not form a valid message.
    fn reject(&mut self, g: &Grammar<K>, err: &MalformedFrame) {
        g.report_frame(err.reason(), &self.fragment);
        self.fragment.clear();
    }

    fn malformed(&mut self, g: &Grammar<K>, reason: &str, byte: u8) {
        g.report_frame(reason, &self.fragment);
        self.reset();
        self.skip_line = true;
        self.scan(g, byte);
    }

    /// The input ended. Deliver a frame that only lacks its line break,
    /// report anything else still pending.
    fn finish_input(&mut self, g: &Grammar<K>) -> Option<RawFrame<'static, K>> {
        match self.state {
            State::Terminator => return self.complete(),
            State::Scanning => {}
            _ if self.magic => {
                g.report_frame("truncated by end of stream", &self.fragment);
            }
            _ if self.skip_line => {}
            _ => {
                let fragment = std::mem::take(&mut self.fragment);
                self.line.extend_from_slice(&fragment);
            }
        }
        self.reset();
        self.skip_line = false;
        self.flush_line(g);
        debug!("decoder reached end of stream");
        None
    }

    fn begin_candidate(&mut self) {
        self.reset();
        self.state = State::Token;
        self.record(&[DELIMITER]);
    }

    fn flush_line(&mut self, g: &Grammar<K>) {
        if self.line.iter().any(|b| !b.is_ascii_whitespace()) {
            g.report_line(&self.line);
        }
        self.line.clear();
    }

    fn record(&mut self, bytes: &[u8]) {
        let room = FRAGMENT_LIMIT.saturating_sub(self.fragment.len());
        self.fragment
            .extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn reset(&mut self) {
        self.reset_state();
        self.fragment.clear();
    }

    fn reset_state(&mut self) {
        self.state = State::Scanning;
        self.token.clear();
        self.magic = false;
        self.partial = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;
    use crate::dump::MemoryDump;
    use crate::message::{OutputEvent, ReportEntry, ReportEvent, Shutdown, StackTrace};
    use crate::opcode::{CommandKind, EventKind};
    use std::io::{self, Cursor};

    /// Simulates a stream that only returns one byte per read call.
    struct ByteByByteReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    /// Returns its first chunk, then `WouldBlock` once, then the rest.
    struct WouldBlockThenData {
        chunks: Vec<Option<Vec<u8>>>,
    }

    impl Read for WouldBlockThenData {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Ok(0);
            }
            match self.chunks.remove(0) {
                None => Err(io::Error::new(ErrorKind::WouldBlock, "not yet")),
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
            }
        }
    }

    /// Interrupts every other read.
    struct InterruptingReader {
        inner: Cursor<Vec<u8>>,
        interrupt: bool,
    }

    impl Read for InterruptingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(ErrorKind::Interrupted.into());
            }
            self.inner.read(buf)
        }
    }

    fn encode_all<M: Message>(messages: &[M], variant: ProtocolVariant) -> Vec<u8> {
        let vocabulary = Vocabulary::<M::Kind>::new();
        let mut buf = BytesMut::new();
        for message in messages {
            encode_frame(&vocabulary, &message.to_frame(), variant, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn command_decoder<R: Read>(
        input: R,
        variant: ProtocolVariant,
    ) -> (CommandDecoder<R>, Arc<MemoryDump>) {
        let dump = Arc::new(MemoryDump::new());
        let decoder = CommandDecoder::with_config(
            input,
            Vocabulary::shared(),
            dump.clone(),
            variant,
            &FrameConfig::default(),
        );
        (decoder, dump)
    }

    fn event_decoder<R: Read>(input: R) -> (EventDecoder<R>, Arc<MemoryDump>) {
        let dump = Arc::new(MemoryDump::new());
        let decoder = EventDecoder::new(input, Vocabulary::shared(), dump.clone());
        (decoder, dump)
    }

    fn sample_events() -> Vec<Event> {
        vec![
            Event::TestSetStarting(ReportEvent {
                run_mode: RunMode::Normal,
                entry: ReportEntry::new("pkg.MyTest", "pkg.MyTest"),
            }),
            Event::StdOutStreamNewLine(OutputEvent {
                run_mode: RunMode::Normal,
                test_run_id: Some(3),
                text: Some("line with : colons\nand a break".into()),
            }),
            Event::TestFailed(ReportEvent {
                run_mode: RunMode::RerunFailingTests,
                entry: ReportEntry::new("pkg.MyTest", "shouldWork")
                    .with_test_run_id(3)
                    .with_elapsed(12)
                    .with_message("expected <1> but was <2>")
                    .with_stack_trace(StackTrace {
                        message: Some("AssertionError".into()),
                        smart_trimmed: Some("at pkg.MyTest.shouldWork".into()),
                        full: None,
                    }),
            }),
            Event::ConsoleInfoLog(Some(String::new())),
            Event::ConsoleWarningLog(None),
            Event::Bye,
        ]
    }

    #[test]
    fn test_decode_sequence_both_variants() {
        for variant in [ProtocolVariant::Binary, ProtocolVariant::Legacy] {
            let events = sample_events();
            let dump = Arc::new(MemoryDump::new());
            let mut decoder = EventDecoder::with_config(
                Cursor::new(encode_all(&events, variant)),
                Vocabulary::shared(),
                dump.clone(),
                variant,
                &FrameConfig::default(),
            );

            for expected in &events {
                assert_eq!(&decoder.decode().unwrap(), expected, "{variant}");
            }
            assert!(matches!(decoder.decode(), Err(FrameError::EndOfStream)));
            assert!(dump.is_empty(), "{variant}: {:?}", dump.records());
        }
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let commands = vec![
            Command::RunClass {
                class_name: "pkg.Über".into(),
            },
            Command::Noop,
            Command::Shutdown(Shutdown::Exit),
        ];
        let data = encode_all(&commands, ProtocolVariant::Binary);
        let (mut decoder, dump) =
            command_decoder(ByteByByteReader { data, pos: 0 }, ProtocolVariant::Binary);

        for expected in &commands {
            assert_eq!(&decoder.decode().unwrap(), expected);
        }
        assert!(dump.is_empty());
    }

    #[test]
    fn test_bye_ack_with_trailing_field_is_skipped() {
        let input = b":forkwire-command:bye-ack:\n\
                      :forkwire-command:bye-ack:extra:\n\
                      :forkwire-command:noop:\n";
        let (mut decoder, dump) = command_decoder(Cursor::new(input.to_vec()), ProtocolVariant::Binary);

        assert_eq!(decoder.decode().unwrap(), Command::ByeAck);
        assert_eq!(decoder.decode().unwrap(), Command::Noop);
        assert!(matches!(decoder.decode(), Err(FrameError::EndOfStream)));

        let records = dump.records();
        assert_eq!(records.len(), 1, "{records:?}");
        assert!(records[0].contains("unexpected token after last field"));
        assert!(records[0].contains("bye-ack"));
    }

    #[test]
    fn test_broken_frame_is_reported_once() {
        let input = b":forkwire-command:run-testclass:UTF-8:x:pkg:Test:
                      :forkwire-command:noop:
";
        let (mut decoder, dump) = command_decoder(Cursor::new(input.to_vec()), ProtocolVariant::Binary);

        assert_eq!(decoder.decode().unwrap(), Command::Noop);
        let records = dump.records();
        assert_eq!(records.len(), 1, "{records:?}");
        assert!(records[0].contains("invalid field length"));
    }

    #[test]
    fn test_console_output_after_broken_frame_line_is_still_reported() {
        let input = b":forkwire-command:bye-ack:junk tail
                      stray line
                      :forkwire-command:noop:
";
        let (mut decoder, dump) = command_decoder(Cursor::new(input.to_vec()), ProtocolVariant::Binary);

        assert_eq!(decoder.decode().unwrap(), Command::Noop);
        let records = dump.records();
        assert_eq!(records.len(), 2, "{records:?}");
        assert!(records[0].contains("unexpected token after last field"));
        assert!(records[1].ends_with("stray line"));
    }

    #[test]
    fn test_resync_after_unknown_opcode() {
        let input = b":forkwire-command:launch-rockets:\n:forkwire-command:testset-finished:\n";
        let (mut decoder, dump) = command_decoder(Cursor::new(input.to_vec()), ProtocolVariant::Binary);

        assert_eq!(decoder.decode().unwrap(), Command::TestSetFinished);
        assert!(dump.records()[0].contains("unknown opcode"));
    }

    #[test]
    fn test_separator_that_breaks_a_frame_starts_the_next_one() {
        // The opcode is cut short by the start of a new frame.
        let mut input = b":forkwire-event:std-out-str".to_vec();
        input.extend(encode_all(&[Event::NextTest], ProtocolVariant::Binary));
        let (mut decoder, dump) = event_decoder(Cursor::new(input));

        assert_eq!(decoder.decode().unwrap(), Event::NextTest);
        assert_eq!(dump.len(), 1);
        assert!(dump.records()[0].contains("unknown opcode"));
    }

    #[test]
    fn test_console_output_is_reported_and_skipped() {
        let mut input = b"Picked up JAVA_TOOL_OPTIONS: -Xmx1g\n".to_vec();
        input.extend(b"partial line ");
        input.extend(encode_all(&[Event::StopOnNextTest], ProtocolVariant::Binary));
        input.extend(b"\n\n   \n");
        input.extend(encode_all(&[Event::Bye], ProtocolVariant::Binary));
        let (mut decoder, dump) = event_decoder(Cursor::new(input));

        assert_eq!(decoder.decode().unwrap(), Event::StopOnNextTest);
        assert_eq!(decoder.decode().unwrap(), Event::Bye);

        let records = dump.records();
        assert_eq!(records.len(), 2, "{records:?}");
        assert!(records[0].ends_with("Picked up JAVA_TOOL_OPTIONS: -Xmx1g"));
        assert!(records[1].ends_with("partial line "));
    }

    #[test]
    fn test_command_frame_on_event_stream_is_discarded() {
        let mut input = encode_all(&[Command::Noop], ProtocolVariant::Binary);
        input.extend(encode_all(&[Event::NextTest], ProtocolVariant::Binary));
        let (mut decoder, dump) = event_decoder(Cursor::new(input));

        assert_eq!(decoder.decode().unwrap(), Event::NextTest);
        assert!(dump.records()[0].contains("forkwire-command"));
    }

    #[test]
    fn test_final_frame_without_line_break_is_delivered() {
        let input = b":forkwire-command:run-testclass:UTF-8:5:pkg.A:".to_vec();
        let (mut decoder, dump) = command_decoder(Cursor::new(input), ProtocolVariant::Binary);

        assert_eq!(
            decoder.decode().unwrap(),
            Command::RunClass {
                class_name: "pkg.A".into()
            }
        );
        assert!(matches!(decoder.decode(), Err(FrameError::EndOfStream)));
        assert!(dump.is_empty());
    }

    #[test]
    fn test_truncated_frame_at_end_of_stream() {
        let input = b":forkwire-command:run-testclass:UTF-8:10:pkg".to_vec();
        let (mut decoder, dump) = command_decoder(Cursor::new(input), ProtocolVariant::Binary);

        assert!(matches!(decoder.decode(), Err(FrameError::EndOfStream)));
        assert!(dump.records()[0].contains("truncated"));
        assert!(matches!(decoder.decode(), Err(FrameError::EndOfStream)));
    }

    #[test]
    fn test_would_block_keeps_progress() {
        let frame = encode_all(&[Command::Shutdown(Shutdown::Kill)], ProtocolVariant::Binary);
        let (head, tail) = frame.split_at(20);
        let input = WouldBlockThenData {
            chunks: vec![Some(head.to_vec()), None, Some(tail.to_vec())],
        };
        let (mut decoder, _dump) = command_decoder(input, ProtocolVariant::Binary);

        match decoder.decode() {
            Err(FrameError::Io(err)) => assert_eq!(err.kind(), ErrorKind::WouldBlock),
            other => panic!("expected WouldBlock, got {other:?}"),
        }
        assert_eq!(decoder.decode().unwrap(), Command::Shutdown(Shutdown::Kill));
    }

    #[test]
    fn test_interrupted_reads_are_retried() {
        let input = InterruptingReader {
            inner: Cursor::new(encode_all(&[Command::ByeAck], ProtocolVariant::Legacy)),
            interrupt: false,
        };
        let (mut decoder, _dump) = command_decoder(input, ProtocolVariant::Legacy);
        assert_eq!(decoder.decode().unwrap(), Command::ByeAck);
    }

    #[test]
    fn test_invalid_fields_are_malformed() {
        let cases: [(&[u8], ProtocolVariant, &str); 6] = [
            (
                b":forkwire-command:run-testclass:UTF-16:1:a:\n",
                ProtocolVariant::Binary,
                "unsupported encoding",
            ),
            (
                b":forkwire-command:run-testclass:UTF-8:x:a:\n",
                ProtocolVariant::Binary,
                "invalid field length",
            ),
            (
                b":forkwire-command:run-testclass:UTF-8:1:ab:\n",
                ProtocolVariant::Binary,
                "field longer than its length prefix",
            ),
            (
                b":forkwire-command:run-testclass:UTF-8:2:\xff\xfe:\n",
                ProtocolVariant::Binary,
                "invalid UTF-8",
            ),
            (
                b":forkwire-command:run-testclass:UTF-8:@@:\n",
                ProtocolVariant::Legacy,
                "invalid base64",
            ),
            (
                b":forkwire-command:run-testclass:UTF-8:-:\n",
                ProtocolVariant::Binary,
                "class name",
            ),
        ];

        for (frame, variant, reason) in cases {
            let mut input = frame.to_vec();
            input.extend(encode_all(&[Command::Noop], variant));
            let (mut decoder, dump) = command_decoder(Cursor::new(input), variant);

            assert_eq!(decoder.decode().unwrap(), Command::Noop, "{reason}");
            assert!(
                dump.records()[0].contains(reason),
                "{reason}: {:?}",
                dump.records()
            );
        }
    }

    #[test]
    fn test_invalid_header_tokens_are_malformed() {
        let cases: [(&[u8], &str); 3] = [
            (b":forkwire-event:std-err-stream:fast-run:-:UTF-8:-:\n", "invalid run mode"),
            (b":forkwire-event:std-err-stream:normal-run:x1:UTF-8:-:\n", "invalid test run id"),
            (
                b":forkwire-event:test-skipped:normal-run:1:UTF-8:-:-:-:-:-:-:1.5:-:-:-:\n",
                "invalid integer field",
            ),
        ];
        for (frame, reason) in cases {
            let mut input = frame.to_vec();
            input.extend(encode_all(&[Event::Bye], ProtocolVariant::Binary));
            let (mut decoder, dump) = event_decoder(Cursor::new(input));

            assert_eq!(decoder.decode().unwrap(), Event::Bye, "{reason}");
            assert!(dump.records()[0].contains(reason), "{:?}", dump.records());
        }
    }

    #[test]
    fn test_oversized_field_is_rejected() {
        let mut input = b":forkwire-command:run-testclass:UTF-8:100:".to_vec();
        input.extend(vec![b'a'; 100]);
        input.extend(b":\n");
        input.extend(encode_all(&[Command::Noop], ProtocolVariant::Binary));

        let dump = Arc::new(MemoryDump::new());
        let config = FrameConfig {
            max_payload_size: 10,
            ..FrameConfig::default()
        };
        let mut decoder = CommandDecoder::with_config(
            Cursor::new(input),
            Vocabulary::shared(),
            dump.clone(),
            ProtocolVariant::Binary,
            &config,
        );

        assert_eq!(decoder.decode().unwrap(), Command::Noop);
        assert!(dump.records()[0].contains("maximum payload size"));
    }

    #[test]
    fn test_overlong_header_token_is_rejected() {
        let mut input = b":forkwire-command:".to_vec();
        input.extend(vec![b'x'; MAX_HEADER_TOKEN + 1]);
        input.extend(b":\n");
        input.extend(encode_all(&[Command::ByeAck], ProtocolVariant::Binary));
        let (mut decoder, dump) = command_decoder(Cursor::new(input), ProtocolVariant::Binary);

        assert_eq!(decoder.decode().unwrap(), Command::ByeAck);
        assert!(dump.records()[0].contains("token too long"));
    }

    #[test]
    fn test_test_starting_without_trace() {
        let event = Event::TestStarting(ReportEvent {
            run_mode: RunMode::Normal,
            entry: ReportEntry::new("pkg.MyTest", "shouldWork"),
        });
        let (mut decoder, _dump) =
            event_decoder(Cursor::new(encode_all(&[event.clone()], ProtocolVariant::Binary)));

        let decoded = decoder.decode().unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.report().unwrap().entry.stack_trace, None);
        assert_eq!(decoded.kind(), EventKind::TestStarting);
    }

    #[test]
    fn test_memento_is_created_lazily() {
        let (decoder, _dump) = command_decoder(Cursor::new(Vec::new()), ProtocolVariant::Binary);
        assert!(format!("{decoder:?}").contains("started: false"));
        assert_eq!(decoder.pending_len(), 0);
        assert_eq!(decoder.variant(), ProtocolVariant::Binary);
        assert_eq!(CommandKind::MAGIC, "forkwire-command");
    }

    #[test]
    fn test_closed_read_channel_surfaces_as_transport_error() {
        let mut channel = forkwire_transport::ReadChannel::new(Cursor::new(Vec::new()));
        channel.close();
        let (mut decoder, _dump) = command_decoder(channel, ProtocolVariant::Binary);
        assert!(matches!(
            decoder.decode(),
            Err(FrameError::Transport(TransportError::ChannelClosed))
        ));
    }
}
