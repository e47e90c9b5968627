use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use forkwire_transport::{BufferedChannel, TransportError};
use tracing::{error, warn};

use crate::codec::{encode_frame, estimate_frame_len, ProtocolVariant, RawFrame, RunMode};
use crate::dump::DumpSink;
use crate::message::{
    output_frame, report_frame, stack_trace_frame, system_property_frame, Command, Event,
    Message, ReportEntry, Shutdown, StackTrace,
};
use crate::opcode::{CommandKind, EventKind, Opcode, Vocabulary};

/// Write-failure state shared by every encoder derived from the same one.
#[derive(Debug, Default)]
struct SendStatus {
    trouble: AtomicBool,
    on_exit: AtomicBool,
}

/// Encodes frames and writes them to a buffered channel, absorbing write
/// failures.
struct Emitter<W, K> {
    channel: Arc<BufferedChannel<W>>,
    vocabulary: Arc<Vocabulary<K>>,
    variant: ProtocolVariant,
    dump: Arc<dyn DumpSink>,
    status: Arc<SendStatus>,
}

impl<W, K> Clone for Emitter<W, K> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            vocabulary: Arc::clone(&self.vocabulary),
            variant: self.variant,
            dump: Arc::clone(&self.dump),
            status: Arc::clone(&self.status),
        }
    }
}

impl<W: Write, K: Opcode> Emitter<W, K> {
    fn new(
        channel: Arc<BufferedChannel<W>>,
        vocabulary: Arc<Vocabulary<K>>,
        variant: ProtocolVariant,
        dump: Arc<dyn DumpSink>,
    ) -> Self {
        Self {
            channel,
            vocabulary,
            variant,
            dump,
            status: Arc::default(),
        }
    }

    fn emit(&self, frame: &RawFrame<'_, K>, buffered: bool) {
        if self.in_trouble() {
            return;
        }
        let mut buf =
            BytesMut::with_capacity(estimate_frame_len(&self.vocabulary, frame, self.variant));
        if self.encode(frame, &mut buf) {
            self.write(&buf, buffered);
        }
    }

    fn encode(&self, frame: &RawFrame<'_, K>, buf: &mut BytesMut) -> bool {
        match encode_frame(&self.vocabulary, frame, self.variant, buf) {
            Ok(()) => true,
            Err(err) => {
                self.dump.dump_error("failed to encode frame", &err);
                false
            }
        }
    }

    fn write(&self, bytes: &[u8], buffered: bool) {
        if self.in_trouble() {
            return;
        }

        let result = if buffered {
            self.channel.write_buffered(bytes)
        } else {
            self.channel.write(bytes)
        };

        match result {
            Ok(()) => {}
            Err(TransportError::ChannelClosed) => {
                if !self.status.on_exit.load(Ordering::Acquire) {
                    let frame = String::from_utf8_lossy(bytes);
                    warn!(frame = %frame.trim_end(), "fork channel closed before frame was sent");
                    self.dump.dump_text(&format!(
                        "Channel closed while writing the frame {}",
                        frame.trim_end()
                    ));
                }
            }
            Err(err) => {
                if !self.status.trouble.swap(true, Ordering::AcqRel) {
                    error!(error = %err, "fork channel write failed; dropping further frames");
                    self.dump
                        .dump_error("I/O error while writing to the fork channel", &err);
                }
            }
        }
    }

    fn in_trouble(&self) -> bool {
        self.status.trouble.load(Ordering::Acquire)
    }
}

/// Worker side: turns test lifecycle callbacks into event frames.
///
/// Every call writes exactly one frame (a system property batch writes one
/// per entry). Standard output/error passthrough and all but the last entry
/// of a property batch go through the channel buffer; everything else is
/// written and flushed immediately. Write failures never surface to the
/// caller: the first I/O failure is dumped and latched (see
/// [`check_error`](Self::check_error)), and later frames are dropped.
pub struct EventEncoder<W> {
    emitter: Emitter<W, EventKind>,
    run_mode: RunMode,
}

impl<W: Write> EventEncoder<W> {
    pub fn new(
        channel: Arc<BufferedChannel<W>>,
        vocabulary: Arc<Vocabulary<EventKind>>,
        variant: ProtocolVariant,
        dump: Arc<dyn DumpSink>,
    ) -> Self {
        Self {
            emitter: Emitter::new(channel, vocabulary, variant, dump),
            run_mode: RunMode::Normal,
        }
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    /// An encoder on the same channel that tags events as re-runs.
    pub fn as_rerun_mode(&self) -> Self {
        self.with_run_mode(RunMode::RerunFailingTests)
    }

    /// An encoder on the same channel that tags events as first runs.
    pub fn as_normal_mode(&self) -> Self {
        self.with_run_mode(RunMode::Normal)
    }

    fn with_run_mode(&self, run_mode: RunMode) -> Self {
        Self {
            emitter: self.emitter.clone(),
            run_mode,
        }
    }

    /// Whether a write has failed. Once set it stays set.
    pub fn check_error(&self) -> bool {
        self.emitter.in_trouble()
    }

    pub fn channel(&self) -> &Arc<BufferedChannel<W>> {
        &self.emitter.channel
    }

    pub fn test_set_starting(&self, entry: &ReportEntry) {
        self.report(EventKind::TestSetStarting, entry);
    }

    /// Sends `properties` first, then the completion event.
    pub fn test_set_completed<I, K, V>(&self, entry: &ReportEntry, properties: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.send_system_properties(properties, entry.test_run_id);
        self.report(EventKind::TestSetCompleted, entry);
    }

    pub fn test_starting(&self, entry: &ReportEntry) {
        self.report(EventKind::TestStarting, entry);
    }

    pub fn test_succeeded(&self, entry: &ReportEntry) {
        self.report(EventKind::TestSucceeded, entry);
    }

    pub fn test_failed(&self, entry: &ReportEntry) {
        self.report(EventKind::TestFailed, entry);
    }

    pub fn test_skipped(&self, entry: &ReportEntry) {
        self.report(EventKind::TestSkipped, entry);
    }

    pub fn test_error(&self, entry: &ReportEntry) {
        self.report(EventKind::TestError, entry);
    }

    pub fn test_assumption_failure(&self, entry: &ReportEntry) {
        self.report(EventKind::TestAssumptionFailure, entry);
    }

    /// Captured standard output (buffered).
    pub fn std_out(&self, test_run_id: Option<u64>, text: Option<&str>, new_line: bool) {
        let kind = if new_line {
            EventKind::StdOutStreamNewLine
        } else {
            EventKind::StdOutStream
        };
        self.emitter
            .emit(&output_frame(kind, self.run_mode, test_run_id, text), true);
    }

    /// Captured standard error (buffered).
    pub fn std_err(&self, test_run_id: Option<u64>, text: Option<&str>, new_line: bool) {
        let kind = if new_line {
            EventKind::StdErrStreamNewLine
        } else {
            EventKind::StdErrStream
        };
        self.emitter
            .emit(&output_frame(kind, self.run_mode, test_run_id, text), true);
    }

    pub fn console_info_log(&self, message: Option<&str>) {
        self.console(EventKind::ConsoleInfoLog, message);
    }

    pub fn console_debug_log(&self, message: Option<&str>) {
        self.console(EventKind::ConsoleDebugLog, message);
    }

    pub fn console_warning_log(&self, message: Option<&str>) {
        self.console(EventKind::ConsoleWarningLog, message);
    }

    pub fn console_error_log(&self, trace: &StackTrace) {
        self.emitter
            .emit(&stack_trace_frame(EventKind::ConsoleErrorLog, trace), false);
    }

    /// One `sys-prop` frame per entry. All but the last are buffered, and the
    /// encode buffer is shared across the batch.
    pub fn send_system_properties<I, K, V>(&self, properties: I, test_run_id: Option<u64>)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut buf = BytesMut::new();
        let mut properties = properties.into_iter().peekable();
        while let Some((key, value)) = properties.next() {
            if self.check_error() {
                return;
            }
            let frame = system_property_frame(
                self.run_mode,
                test_run_id,
                Some(key.as_ref()),
                Some(value.as_ref()),
            );
            buf.clear();
            if self.emitter.encode(&frame, &mut buf) {
                let last = properties.peek().is_none();
                self.emitter.write(&buf, !last);
            }
        }
    }

    pub fn bye(&self) {
        self.control(EventKind::Bye);
    }

    pub fn stop_on_next_test(&self) {
        self.control(EventKind::StopOnNextTest);
    }

    /// Ask the controller for the next test class.
    pub fn acquire_next_test(&self) {
        self.control(EventKind::NextTest);
    }

    /// Report the error that is about to terminate the worker.
    pub fn send_exit_error(&self, trace: &StackTrace) {
        self.emitter
            .emit(&stack_trace_frame(EventKind::JvmExitError, trace), false);
    }

    /// Send a prebuilt event. Output events are buffered like
    /// [`std_out`](Self::std_out); the rest is immediate.
    pub fn send(&self, event: &Event) {
        let buffered = event.kind().is_output();
        self.emitter.emit(&event.to_frame(), buffered);
    }

    /// The worker is exiting: push a final line break so the controller can
    /// finish reading, and stop reporting closed-channel failures.
    ///
    /// Must be called before the channel is closed.
    pub fn on_jvm_exit(&self) {
        self.emitter.status.on_exit.store(true, Ordering::Release);
        self.emitter.write(b"\n", false);
    }

    fn report(&self, kind: EventKind, entry: &ReportEntry) {
        self.emitter
            .emit(&report_frame(kind, self.run_mode, entry), false);
    }

    fn console(&self, kind: EventKind, message: Option<&str>) {
        self.emitter
            .emit(&RawFrame::new(kind).text(message), false);
    }

    fn control(&self, kind: EventKind) {
        self.emitter.emit(&RawFrame::new(kind), false);
    }
}

impl<W> std::fmt::Debug for EventEncoder<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEncoder")
            .field("run_mode", &self.run_mode)
            .field("variant", &self.emitter.variant)
            .field("trouble", &self.emitter.status.trouble.load(Ordering::Relaxed))
            .finish()
    }
}

/// Controller side: writes commands to a worker. Every command is flushed
/// immediately.
pub struct CommandEncoder<W> {
    emitter: Emitter<W, CommandKind>,
}

impl<W: Write> CommandEncoder<W> {
    pub fn new(
        channel: Arc<BufferedChannel<W>>,
        vocabulary: Arc<Vocabulary<CommandKind>>,
        variant: ProtocolVariant,
        dump: Arc<dyn DumpSink>,
    ) -> Self {
        Self {
            emitter: Emitter::new(channel, vocabulary, variant, dump),
        }
    }

    pub fn run_class(&self, class_name: &str) {
        self.emitter
            .emit(&RawFrame::new(CommandKind::RunClass).text(Some(class_name)), false);
    }

    pub fn test_set_finished(&self) {
        self.send(&Command::TestSetFinished);
    }

    pub fn skip_since_next_test(&self) {
        self.send(&Command::SkipSinceNextTest);
    }

    pub fn shutdown(&self, shutdown: Shutdown) {
        self.send(&Command::Shutdown(shutdown));
    }

    pub fn noop(&self) {
        self.send(&Command::Noop);
    }

    pub fn bye_ack(&self) {
        self.send(&Command::ByeAck);
    }

    pub fn send(&self, command: &Command) {
        self.emitter.emit(&command.to_frame(), false);
    }

    /// Whether a write has failed. Once set it stays set.
    pub fn check_error(&self) -> bool {
        self.emitter.in_trouble()
    }

    pub fn channel(&self) -> &Arc<BufferedChannel<W>> {
        &self.emitter.channel
    }
}

impl<W> std::fmt::Debug for CommandEncoder<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEncoder")
            .field("variant", &self.emitter.variant)
            .field("trouble", &self.emitter.status.trouble.load(Ordering::Relaxed))
            .finish()
    }
}
