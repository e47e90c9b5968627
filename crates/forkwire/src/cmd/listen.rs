use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use forkwire_frame::{Event, FrameConfig, FrameError};
use forkwire_node::{FileDump, ForkListener, NodeConfig, NodeError};
use tracing::{debug, info};

use crate::cmd::{parse_duration, ListenArgs};
use crate::exit::{node_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let read_timeout = args.timeout.as_deref().map(parse_duration).transpose()?;
    let node = NodeConfig::default()
        .with_variant(args.variant)
        .with_frame_config(FrameConfig {
            read_timeout,
            ..FrameConfig::default()
        });

    let mut listener = ForkListener::bind(&args.bind)
        .map_err(|err| node_error("bind failed", err))?
        .with_node_config(node);
    if let Some(dir) = &args.dump_dir {
        listener = listener.with_dump(Arc::new(FileDump::new(dir, "listen")));
    }

    // Hand this line to the worker.
    eprintln!("{}", listener.worker_config());

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut controller = listener
        .accept()
        .map_err(|err| node_error("accept failed", err))?;
    info!(worker = controller.id(), peer = ?controller.peer_addr(), "worker connected");

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        let event = match controller.next_event() {
            Ok(event) => event,
            Err(NodeError::Frame(FrameError::EndOfStream)) => {
                info!(worker = controller.id(), "worker closed the stream");
                break;
            }
            Err(err) => return Err(node_error("receive failed", err)),
        };

        print_message(&event, Some(controller.id()), args.variant, format);
        printed = printed.saturating_add(1);

        if event == Event::Bye {
            controller.commands().bye_ack();
            break;
        }
        if let Some(count) = args.count {
            if printed >= count {
                break;
            }
        }
    }

    if let Err(err) = controller.close() {
        debug!(error = %err, "closing controller channel failed");
    }
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
