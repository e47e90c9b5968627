//! Opcode vocabularies for both channel directions.
//!
//! Every opcode fixes the shape of its frame: which header segments follow
//! the opcode token and how many payload fields come after them. The decoder
//! walks this layout token by token, so a frame with too few or too many
//! fields for its opcode is rejected as malformed.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use crate::codec::{MAGIC_COMMAND, MAGIC_EVENT};

/// One position in a frame after the opcode token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// `normal-run` or `rerun-test-after-failure`.
    RunMode,
    /// Decimal test-run identifier or the null token.
    TestRunId,
    /// Character set of the string fields, always `UTF-8`.
    Encoding,
    /// Nullable string payload field.
    Text,
    /// Nullable decimal payload field.
    Integer,
}

impl Segment {
    /// Whether this segment carries a payload field (as opposed to a header).
    pub fn is_field(self) -> bool {
        matches!(self, Segment::Text | Segment::Integer)
    }
}

/// Number of payload fields an opcode carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    None,
    One,
    Many(usize),
}

/// A closed set of opcodes sharing one magic preamble.
pub trait Opcode: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Preamble token that opens every frame of this vocabulary.
    const MAGIC: &'static str;

    /// Every opcode of the vocabulary.
    const ALL: &'static [Self];

    /// Wire name.
    fn as_str(self) -> &'static str;

    /// Segments following the opcode token, in wire order.
    fn layout(self) -> &'static [Segment];

    fn arity(self) -> Arity {
        match self.layout().iter().filter(|s| s.is_field()).count() {
            0 => Arity::None,
            1 => Arity::One,
            n => Arity::Many(n),
        }
    }
}

const NO_FIELDS: &[Segment] = &[];
const ONE_STRING: &[Segment] = &[Segment::Encoding, Segment::Text];
const STACK_TRACE: &[Segment] = &[
    Segment::Encoding,
    Segment::Text,
    Segment::Text,
    Segment::Text,
];
const OUTPUT: &[Segment] = &[
    Segment::RunMode,
    Segment::TestRunId,
    Segment::Encoding,
    Segment::Text,
];
const SYSTEM_PROPERTY: &[Segment] = &[
    Segment::RunMode,
    Segment::TestRunId,
    Segment::Encoding,
    Segment::Text,
    Segment::Text,
];
const REPORT_ENTRY: &[Segment] = &[
    Segment::RunMode,
    Segment::TestRunId,
    Segment::Encoding,
    // source name, source text, name, name text, group, message
    Segment::Text,
    Segment::Text,
    Segment::Text,
    Segment::Text,
    Segment::Text,
    Segment::Text,
    // elapsed
    Segment::Integer,
    // stack trace: message, smart-trimmed, full
    Segment::Text,
    Segment::Text,
    Segment::Text,
];

/// Commands sent by the test runner to a forked worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    RunClass,
    TestSetFinished,
    SkipSinceNextTest,
    Shutdown,
    Noop,
    ByeAck,
}

impl Opcode for CommandKind {
    const MAGIC: &'static str = MAGIC_COMMAND;

    const ALL: &'static [Self] = &[
        CommandKind::RunClass,
        CommandKind::TestSetFinished,
        CommandKind::SkipSinceNextTest,
        CommandKind::Shutdown,
        CommandKind::Noop,
        CommandKind::ByeAck,
    ];

    fn as_str(self) -> &'static str {
        match self {
            CommandKind::RunClass => "run-testclass",
            CommandKind::TestSetFinished => "testset-finished",
            CommandKind::SkipSinceNextTest => "skip-since-next-test",
            CommandKind::Shutdown => "shutdown",
            CommandKind::Noop => "noop",
            CommandKind::ByeAck => "bye-ack",
        }
    }

    fn layout(self) -> &'static [Segment] {
        match self {
            CommandKind::RunClass | CommandKind::Shutdown => ONE_STRING,
            CommandKind::TestSetFinished
            | CommandKind::SkipSinceNextTest
            | CommandKind::Noop
            | CommandKind::ByeAck => NO_FIELDS,
        }
    }
}

/// Events sent by a forked worker to the test runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Bye,
    StopOnNextTest,
    NextTest,
    ConsoleErrorLog,
    ConsoleDebugLog,
    ConsoleInfoLog,
    ConsoleWarningLog,
    StdOutStream,
    StdOutStreamNewLine,
    StdErrStream,
    StdErrStreamNewLine,
    SystemProperty,
    TestSetStarting,
    TestSetCompleted,
    TestStarting,
    TestSucceeded,
    TestFailed,
    TestError,
    TestSkipped,
    TestAssumptionFailure,
    JvmExitError,
}

impl EventKind {
    /// Lifecycle events carrying a full report entry.
    pub fn is_report(self) -> bool {
        self.layout() == REPORT_ENTRY
    }

    /// Standard output/error passthrough events.
    pub fn is_output(self) -> bool {
        self.layout() == OUTPUT
    }
}

impl Opcode for EventKind {
    const MAGIC: &'static str = MAGIC_EVENT;

    const ALL: &'static [Self] = &[
        EventKind::Bye,
        EventKind::StopOnNextTest,
        EventKind::NextTest,
        EventKind::ConsoleErrorLog,
        EventKind::ConsoleDebugLog,
        EventKind::ConsoleInfoLog,
        EventKind::ConsoleWarningLog,
        EventKind::StdOutStream,
        EventKind::StdOutStreamNewLine,
        EventKind::StdErrStream,
        EventKind::StdErrStreamNewLine,
        EventKind::SystemProperty,
        EventKind::TestSetStarting,
        EventKind::TestSetCompleted,
        EventKind::TestStarting,
        EventKind::TestSucceeded,
        EventKind::TestFailed,
        EventKind::TestError,
        EventKind::TestSkipped,
        EventKind::TestAssumptionFailure,
        EventKind::JvmExitError,
    ];

    fn as_str(self) -> &'static str {
        match self {
            EventKind::Bye => "bye",
            EventKind::StopOnNextTest => "stop-on-next-test",
            EventKind::NextTest => "next-test",
            EventKind::ConsoleErrorLog => "console-error-log",
            EventKind::ConsoleDebugLog => "console-debug-log",
            EventKind::ConsoleInfoLog => "console-info-log",
            EventKind::ConsoleWarningLog => "console-warning-log",
            EventKind::StdOutStream => "std-out-stream",
            EventKind::StdOutStreamNewLine => "std-out-stream-new-line",
            EventKind::StdErrStream => "std-err-stream",
            EventKind::StdErrStreamNewLine => "std-err-stream-new-line",
            EventKind::SystemProperty => "sys-prop",
            EventKind::TestSetStarting => "testset-starting",
            EventKind::TestSetCompleted => "testset-completed",
            EventKind::TestStarting => "test-starting",
            EventKind::TestSucceeded => "test-succeeded",
            EventKind::TestFailed => "test-failed",
            EventKind::TestError => "test-error",
            EventKind::TestSkipped => "test-skipped",
            EventKind::TestAssumptionFailure => "test-assumption-failure",
            EventKind::JvmExitError => "jvm-exit-error",
        }
    }

    fn layout(self) -> &'static [Segment] {
        match self {
            EventKind::Bye | EventKind::StopOnNextTest | EventKind::NextTest => NO_FIELDS,
            EventKind::ConsoleErrorLog | EventKind::JvmExitError => STACK_TRACE,
            EventKind::ConsoleDebugLog
            | EventKind::ConsoleInfoLog
            | EventKind::ConsoleWarningLog => ONE_STRING,
            EventKind::StdOutStream
            | EventKind::StdOutStreamNewLine
            | EventKind::StdErrStream
            | EventKind::StdErrStreamNewLine => OUTPUT,
            EventKind::SystemProperty => SYSTEM_PROPERTY,
            EventKind::TestSetStarting
            | EventKind::TestSetCompleted
            | EventKind::TestStarting
            | EventKind::TestSucceeded
            | EventKind::TestFailed
            | EventKind::TestError
            | EventKind::TestSkipped
            | EventKind::TestAssumptionFailure => REPORT_ENTRY,
        }
    }
}

/// Immutable lookup table for one opcode vocabulary.
///
/// Built once and shared (`Arc`) between the encoders and decoders of a
/// channel. Holds the name index used while decoding and the pre-rendered
/// `:magic:opcode:` prefix of every frame used while encoding.
#[derive(Debug)]
pub struct Vocabulary<K> {
    by_name: HashMap<&'static str, K>,
    prefixes: HashMap<K, Box<[u8]>>,
}

impl<K: Opcode> Vocabulary<K> {
    pub fn new() -> Self {
        let by_name = K::ALL.iter().map(|k| (k.as_str(), *k)).collect();
        let prefixes = K::ALL
            .iter()
            .map(|k| {
                let prefix = format!(":{}:{}:", K::MAGIC, k.as_str());
                (*k, prefix.into_bytes().into_boxed_slice())
            })
            .collect();
        Self { by_name, prefixes }
    }

    /// Convenience for `Arc::new(Vocabulary::new())`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn magic(&self) -> &'static str {
        K::MAGIC
    }

    /// Resolve a wire name to its opcode.
    pub fn lookup(&self, name: &[u8]) -> Option<K> {
        std::str::from_utf8(name)
            .ok()
            .and_then(|name| self.by_name.get(name).copied())
    }

    /// The `:magic:opcode:` bytes that open a frame of `kind`.
    pub fn prefix(&self, kind: K) -> &[u8] {
        self.prefixes.get(&kind).map(|p| &p[..]).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl<K: Opcode> Default for Vocabulary<K> {
    fn default() -> Self {
        Self::new()
    }
}
