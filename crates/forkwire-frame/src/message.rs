//! Typed commands and events, and their mapping onto [`RawFrame`]s.

use std::borrow::Cow;
use std::fmt;

use tracing::debug;

use crate::codec::{FieldValue, RawFrame, RunMode};
use crate::error::MalformedFrame;
use crate::opcode::{CommandKind, EventKind, Opcode};

/// A value that travels as exactly one frame.
pub trait Message: Sized + Send + 'static {
    type Kind: Opcode;

    fn kind(&self) -> Self::Kind;

    /// Borrowing view of this message as a frame.
    fn to_frame(&self) -> RawFrame<'_, Self::Kind>;

    /// Rebuild a message from a decoded frame.
    fn from_frame(frame: RawFrame<'static, Self::Kind>) -> Result<Self, MalformedFrame>;
}

/// How a worker should terminate when asked to shut down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Shutdown {
    /// Finish the current work, then exit normally.
    #[default]
    Default,
    /// Exit immediately.
    Exit,
    /// Halt without running shutdown hooks.
    Kill,
}

impl Shutdown {
    pub fn as_str(self) -> &'static str {
        match self {
            Shutdown::Default => "default",
            Shutdown::Exit => "exit",
            Shutdown::Kill => "kill",
        }
    }

    /// Parse the `shutdown` parameter. Absent or unknown values mean
    /// [`Shutdown::Default`].
    pub fn from_param(param: Option<&str>) -> Self {
        match param {
            Some("exit") => Shutdown::Exit,
            Some("kill") => Shutdown::Kill,
            Some("default") | None => Shutdown::Default,
            Some(other) => {
                debug!(param = other, "unknown shutdown parameter, using default");
                Shutdown::Default
            }
        }
    }
}

impl fmt::Display for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller to worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RunClass { class_name: String },
    TestSetFinished,
    SkipSinceNextTest,
    Shutdown(Shutdown),
    Noop,
    ByeAck,
}

impl Message for Command {
    type Kind = CommandKind;

    fn kind(&self) -> CommandKind {
        match self {
            Command::RunClass { .. } => CommandKind::RunClass,
            Command::TestSetFinished => CommandKind::TestSetFinished,
            Command::SkipSinceNextTest => CommandKind::SkipSinceNextTest,
            Command::Shutdown(_) => CommandKind::Shutdown,
            Command::Noop => CommandKind::Noop,
            Command::ByeAck => CommandKind::ByeAck,
        }
    }

    fn to_frame(&self) -> RawFrame<'_, CommandKind> {
        let frame = RawFrame::new(self.kind());
        match self {
            Command::RunClass { class_name } => frame.text(Some(class_name.as_str())),
            Command::Shutdown(shutdown) => frame.text(Some(shutdown.as_str())),
            _ => frame,
        }
    }

    fn from_frame(frame: RawFrame<'static, CommandKind>) -> Result<Self, MalformedFrame> {
        let kind = frame.kind;
        let mut fields = Fields::new(kind, frame.fields);
        let command = match kind {
            CommandKind::RunClass => Command::RunClass {
                class_name: fields
                    .text()?
                    .ok_or_else(|| MalformedFrame::new("run-testclass without a class name"))?,
            },
            CommandKind::Shutdown => {
                Command::Shutdown(Shutdown::from_param(fields.text()?.as_deref()))
            }
            CommandKind::TestSetFinished => Command::TestSetFinished,
            CommandKind::SkipSinceNextTest => Command::SkipSinceNextTest,
            CommandKind::Noop => Command::Noop,
            CommandKind::ByeAck => Command::ByeAck,
        };
        fields.finish()?;
        Ok(command)
    }
}

/// A captured failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    pub message: Option<String>,
    pub smart_trimmed: Option<String>,
    pub full: Option<String>,
}

impl StackTrace {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// True when none of the three parts is present.
    pub fn is_empty(&self) -> bool {
        self.message.is_none() && self.smart_trimmed.is_none() && self.full.is_none()
    }
}

/// Outcome record of a test or test set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportEntry {
    pub source_name: Option<String>,
    pub source_text: Option<String>,
    pub name: Option<String>,
    pub name_text: Option<String>,
    pub group: Option<String>,
    pub message: Option<String>,
    /// Milliseconds.
    pub elapsed: Option<u32>,
    pub stack_trace: Option<StackTrace>,
    pub test_run_id: Option<u64>,
}

impl ReportEntry {
    pub fn new(source_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source_name: Some(source_name.into()),
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_test_run_id(mut self, test_run_id: u64) -> Self {
        self.test_run_id = Some(test_run_id);
        self
    }

    pub fn with_elapsed(mut self, elapsed: u32) -> Self {
        self.elapsed = Some(elapsed);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: StackTrace) -> Self {
        self.stack_trace = Some(stack_trace);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEvent {
    pub run_mode: RunMode,
    pub entry: ReportEntry,
}

/// A chunk of the worker's standard output or error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub run_mode: RunMode,
    pub test_run_id: Option<u64>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemProperty {
    pub run_mode: RunMode,
    pub test_run_id: Option<u64>,
    pub key: Option<String>,
    pub value: Option<String>,
}

/// Worker to controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Bye,
    StopOnNextTest,
    NextTest,
    ConsoleErrorLog(StackTrace),
    ConsoleDebugLog(Option<String>),
    ConsoleInfoLog(Option<String>),
    ConsoleWarningLog(Option<String>),
    StdOutStream(OutputEvent),
    StdOutStreamNewLine(OutputEvent),
    StdErrStream(OutputEvent),
    StdErrStreamNewLine(OutputEvent),
    SystemProperty(SystemProperty),
    TestSetStarting(ReportEvent),
    TestSetCompleted(ReportEvent),
    TestStarting(ReportEvent),
    TestSucceeded(ReportEvent),
    TestFailed(ReportEvent),
    TestError(ReportEvent),
    TestSkipped(ReportEvent),
    TestAssumptionFailure(ReportEvent),
    JvmExitError(StackTrace),
}

impl Event {
    /// Run mode of events that carry one.
    pub fn run_mode(&self) -> Option<RunMode> {
        match self {
            Event::StdOutStream(e)
            | Event::StdOutStreamNewLine(e)
            | Event::StdErrStream(e)
            | Event::StdErrStreamNewLine(e) => Some(e.run_mode),
            Event::SystemProperty(p) => Some(p.run_mode),
            _ => self.report().map(|r| r.run_mode),
        }
    }

    /// The report of lifecycle events.
    pub fn report(&self) -> Option<&ReportEvent> {
        match self {
            Event::TestSetStarting(r)
            | Event::TestSetCompleted(r)
            | Event::TestStarting(r)
            | Event::TestSucceeded(r)
            | Event::TestFailed(r)
            | Event::TestError(r)
            | Event::TestSkipped(r)
            | Event::TestAssumptionFailure(r) => Some(r),
            _ => None,
        }
    }

    fn report_variant(kind: EventKind, report: ReportEvent) -> Option<Self> {
        Some(match kind {
            EventKind::TestSetStarting => Event::TestSetStarting(report),
            EventKind::TestSetCompleted => Event::TestSetCompleted(report),
            EventKind::TestStarting => Event::TestStarting(report),
            EventKind::TestSucceeded => Event::TestSucceeded(report),
            EventKind::TestFailed => Event::TestFailed(report),
            EventKind::TestError => Event::TestError(report),
            EventKind::TestSkipped => Event::TestSkipped(report),
            EventKind::TestAssumptionFailure => Event::TestAssumptionFailure(report),
            _ => return None,
        })
    }
}

impl Message for Event {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            Event::Bye => EventKind::Bye,
            Event::StopOnNextTest => EventKind::StopOnNextTest,
            Event::NextTest => EventKind::NextTest,
            Event::ConsoleErrorLog(_) => EventKind::ConsoleErrorLog,
            Event::ConsoleDebugLog(_) => EventKind::ConsoleDebugLog,
            Event::ConsoleInfoLog(_) => EventKind::ConsoleInfoLog,
            Event::ConsoleWarningLog(_) => EventKind::ConsoleWarningLog,
            Event::StdOutStream(_) => EventKind::StdOutStream,
            Event::StdOutStreamNewLine(_) => EventKind::StdOutStreamNewLine,
            Event::StdErrStream(_) => EventKind::StdErrStream,
            Event::StdErrStreamNewLine(_) => EventKind::StdErrStreamNewLine,
            Event::SystemProperty(_) => EventKind::SystemProperty,
            Event::TestSetStarting(_) => EventKind::TestSetStarting,
            Event::TestSetCompleted(_) => EventKind::TestSetCompleted,
            Event::TestStarting(_) => EventKind::TestStarting,
            Event::TestSucceeded(_) => EventKind::TestSucceeded,
            Event::TestFailed(_) => EventKind::TestFailed,
            Event::TestError(_) => EventKind::TestError,
            Event::TestSkipped(_) => EventKind::TestSkipped,
            Event::TestAssumptionFailure(_) => EventKind::TestAssumptionFailure,
            Event::JvmExitError(_) => EventKind::JvmExitError,
        }
    }

    fn to_frame(&self) -> RawFrame<'_, EventKind> {
        let kind = self.kind();
        match self {
            Event::Bye | Event::StopOnNextTest | Event::NextTest => RawFrame::new(kind),
            Event::ConsoleErrorLog(trace) | Event::JvmExitError(trace) => {
                stack_trace_frame(kind, trace)
            }
            Event::ConsoleDebugLog(message)
            | Event::ConsoleInfoLog(message)
            | Event::ConsoleWarningLog(message) => RawFrame::new(kind).text(message.as_deref()),
            Event::StdOutStream(output)
            | Event::StdOutStreamNewLine(output)
            | Event::StdErrStream(output)
            | Event::StdErrStreamNewLine(output) => output_frame(
                kind,
                output.run_mode,
                output.test_run_id,
                output.text.as_deref(),
            ),
            Event::SystemProperty(property) => system_property_frame(
                property.run_mode,
                property.test_run_id,
                property.key.as_deref(),
                property.value.as_deref(),
            ),
            Event::TestSetStarting(report)
            | Event::TestSetCompleted(report)
            | Event::TestStarting(report)
            | Event::TestSucceeded(report)
            | Event::TestFailed(report)
            | Event::TestError(report)
            | Event::TestSkipped(report)
            | Event::TestAssumptionFailure(report) => {
                report_frame(kind, report.run_mode, &report.entry)
            }
        }
    }

    fn from_frame(frame: RawFrame<'static, EventKind>) -> Result<Self, MalformedFrame> {
        let kind = frame.kind;
        let header = (frame.run_mode, frame.test_run_id);
        let mut fields = Fields::new(kind, frame.fields);
        let run_mode = || {
            header
                .0
                .ok_or_else(|| MalformedFrame::new(format!("{} without run mode", kind.as_str())))
        };

        let event = match kind {
            EventKind::Bye => Event::Bye,
            EventKind::StopOnNextTest => Event::StopOnNextTest,
            EventKind::NextTest => Event::NextTest,
            EventKind::ConsoleErrorLog => Event::ConsoleErrorLog(fields.stack_trace()?),
            EventKind::JvmExitError => Event::JvmExitError(fields.stack_trace()?),
            EventKind::ConsoleDebugLog => Event::ConsoleDebugLog(fields.text()?),
            EventKind::ConsoleInfoLog => Event::ConsoleInfoLog(fields.text()?),
            EventKind::ConsoleWarningLog => Event::ConsoleWarningLog(fields.text()?),
            EventKind::StdOutStream
            | EventKind::StdOutStreamNewLine
            | EventKind::StdErrStream
            | EventKind::StdErrStreamNewLine => {
                let output = OutputEvent {
                    run_mode: run_mode()?,
                    test_run_id: header.1,
                    text: fields.text()?,
                };
                match kind {
                    EventKind::StdOutStream => Event::StdOutStream(output),
                    EventKind::StdOutStreamNewLine => Event::StdOutStreamNewLine(output),
                    EventKind::StdErrStream => Event::StdErrStream(output),
                    _ => Event::StdErrStreamNewLine(output),
                }
            }
            EventKind::SystemProperty => Event::SystemProperty(SystemProperty {
                run_mode: run_mode()?,
                test_run_id: header.1,
                key: fields.text()?,
                value: fields.text()?,
            }),
            EventKind::TestSetStarting
            | EventKind::TestSetCompleted
            | EventKind::TestStarting
            | EventKind::TestSucceeded
            | EventKind::TestFailed
            | EventKind::TestError
            | EventKind::TestSkipped
            | EventKind::TestAssumptionFailure => {
                let report = ReportEvent {
                    run_mode: run_mode()?,
                    entry: fields.report_entry(header.1)?,
                };
                Event::report_variant(kind, report)
                    .ok_or_else(|| MalformedFrame::new("not a report event"))?
            }
        };
        fields.finish()?;
        Ok(event)
    }
}

pub(crate) fn stack_trace_frame(kind: EventKind, trace: &StackTrace) -> RawFrame<'_, EventKind> {
    RawFrame::new(kind)
        .text(trace.message.as_deref())
        .text(trace.smart_trimmed.as_deref())
        .text(trace.full.as_deref())
}

pub(crate) fn output_frame(
    kind: EventKind,
    run_mode: RunMode,
    test_run_id: Option<u64>,
    text: Option<&str>,
) -> RawFrame<'_, EventKind> {
    RawFrame::new(kind)
        .with_run_mode(run_mode, test_run_id)
        .text(text)
}

pub(crate) fn system_property_frame<'a>(
    run_mode: RunMode,
    test_run_id: Option<u64>,
    key: Option<&'a str>,
    value: Option<&'a str>,
) -> RawFrame<'a, EventKind> {
    RawFrame::new(EventKind::SystemProperty)
        .with_run_mode(run_mode, test_run_id)
        .text(key)
        .text(value)
}

pub(crate) fn report_frame(
    kind: EventKind,
    run_mode: RunMode,
    entry: &ReportEntry,
) -> RawFrame<'_, EventKind> {
    let trace = entry.stack_trace.as_ref();
    RawFrame::new(kind)
        .with_run_mode(run_mode, entry.test_run_id)
        .text(entry.source_name.as_deref())
        .text(entry.source_text.as_deref())
        .text(entry.name.as_deref())
        .text(entry.name_text.as_deref())
        .text(entry.group.as_deref())
        .text(entry.message.as_deref())
        .integer(entry.elapsed)
        .text(trace.and_then(|t| t.message.as_deref()))
        .text(trace.and_then(|t| t.smart_trimmed.as_deref()))
        .text(trace.and_then(|t| t.full.as_deref()))
}

/// Consumes the payload fields of a decoded frame in order.
struct Fields<K> {
    kind: K,
    fields: std::vec::IntoIter<FieldValue<'static>>,
}

impl<K: Opcode> Fields<K> {
    fn new(kind: K, fields: Vec<FieldValue<'static>>) -> Self {
        Self {
            kind,
            fields: fields.into_iter(),
        }
    }

    fn text(&mut self) -> Result<Option<String>, MalformedFrame> {
        match self.fields.next() {
            Some(FieldValue::Text(value)) => Ok(value.map(Cow::into_owned)),
            other => Err(self.unexpected("text", other)),
        }
    }

    fn integer(&mut self) -> Result<Option<u32>, MalformedFrame> {
        match self.fields.next() {
            Some(FieldValue::Integer(value)) => Ok(value),
            other => Err(self.unexpected("integer", other)),
        }
    }

    fn stack_trace(&mut self) -> Result<StackTrace, MalformedFrame> {
        Ok(StackTrace {
            message: self.text()?,
            smart_trimmed: self.text()?,
            full: self.text()?,
        })
    }

    fn report_entry(&mut self, test_run_id: Option<u64>) -> Result<ReportEntry, MalformedFrame> {
        let mut entry = ReportEntry {
            source_name: self.text()?,
            source_text: self.text()?,
            name: self.text()?,
            name_text: self.text()?,
            group: self.text()?,
            message: self.text()?,
            elapsed: self.integer()?,
            stack_trace: None,
            test_run_id,
        };
        let trace = self.stack_trace()?;
        if !trace.is_empty() {
            entry.stack_trace = Some(trace);
        }
        Ok(entry)
    }

    fn finish(mut self) -> Result<(), MalformedFrame> {
        match self.fields.next() {
            None => Ok(()),
            Some(extra) => Err(MalformedFrame::new(format!(
                "{}: unexpected extra field {extra:?}",
                self.kind.as_str()
            ))),
        }
    }

    fn unexpected(&self, expected: &str, got: Option<FieldValue<'static>>) -> MalformedFrame {
        MalformedFrame::new(format!(
            "{}: expected {expected} field, got {got:?}",
            self.kind.as_str()
        ))
    }
}
