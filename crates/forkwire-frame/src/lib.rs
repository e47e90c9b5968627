//! Event/command framing for the channel between a test runner and its
//! forked workers.
//!
//! Every message travels as one colon-delimited, line-terminated frame:
//!
//! ```text
//! :forkwire-event:test-starting:normal-run:7:UTF-8:10:pkg.MyTest:...:\n
//! ```
//!
//! - a magic preamble (`forkwire-command` or `forkwire-event`)
//! - an opcode that fixes the rest of the layout
//! - optional run mode and test-run id, the `UTF-8` charset token
//! - nullable payload fields (`-` for null)
//!
//! The encoders never fail the caller; the decoder never returns malformed
//! input and resynchronizes on its own. Both report what went wrong to a
//! [`DumpSink`].

pub mod codec;
pub mod decoder;
pub mod dump;
pub mod encoder;
pub mod error;
pub mod message;
pub mod opcode;

pub use codec::{
    encode_frame, estimate_frame_len, FieldValue, FrameConfig, ProtocolVariant, RawFrame,
    RunMode, DEFAULT_MAX_PAYLOAD, MAGIC_COMMAND, MAGIC_EVENT,
};
pub use decoder::{CommandDecoder, EventDecoder, StreamDecoder};
pub use dump::{DumpSink, LogDump, MemoryDump};
pub use encoder::{CommandEncoder, EventEncoder};
pub use error::{FrameError, MalformedFrame, Result};
pub use message::{
    Command, Event, Message, OutputEvent, ReportEntry, ReportEvent, Shutdown, StackTrace,
    SystemProperty,
};
pub use opcode::{Arity, CommandKind, EventKind, Opcode, Segment, Vocabulary};
