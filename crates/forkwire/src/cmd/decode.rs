use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;

use forkwire_frame::{
    Command, DumpSink, Event, FrameConfig, FrameError, MemoryDump, Message, ProtocolVariant,
    StreamDecoder, Vocabulary,
};
use tracing::{info, warn};

use crate::cmd::DecodeArgs;
use crate::exit::{frame_error, io_error, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let input: Box<dyn Read> = match &args.file {
        Some(path) => Box::new(
            File::open(path)
                .map_err(|err| io_error(&format!("cannot open {}", path.display()), err))?,
        ),
        None => Box::new(io::stdin().lock()),
    };

    let dump = Arc::new(MemoryDump::new());
    let frames = if args.commands {
        drain::<Command>(input, dump.clone(), args.variant, format)?
    } else {
        drain::<Event>(input, dump.clone(), args.variant, format)?
    };

    for record in dump.records() {
        warn!(target: "forkwire::dump", "{record}");
    }
    let corrupted = dump.len();
    info!(frames, corrupted, "stream decoded");

    Ok(if corrupted > 0 { DATA_INVALID } else { SUCCESS })
}

fn drain<M: Message>(
    input: Box<dyn Read>,
    dump: Arc<dyn DumpSink>,
    variant: ProtocolVariant,
    format: OutputFormat,
) -> CliResult<usize> {
    let mut decoder = StreamDecoder::<_, M>::with_config(
        input,
        Vocabulary::<M::Kind>::shared(),
        dump,
        variant,
        &FrameConfig::default(),
    );

    let mut frames = 0usize;
    loop {
        match decoder.decode() {
            Ok(message) => {
                print_message(&message, None, variant, format);
                frames += 1;
            }
            Err(FrameError::EndOfStream) => return Ok(frames),
            Err(err) => return Err(frame_error("decode failed", err)),
        }
    }
}
