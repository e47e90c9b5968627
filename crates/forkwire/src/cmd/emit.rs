use std::sync::Arc;

use forkwire_frame::{Command, DumpSink, FrameConfig, FrameError, LogDump};
use forkwire_node::{connect_with_config, FileDump, NodeConfig, NodeError, WorkerChannel};
use forkwire_transport::ChannelConfig;
use serde::Serialize;
use tracing::info;

use crate::cmd::{parse_duration, EmitArgs};
use crate::exit::{node_error, transport_error, CliError, CliResult, SUCCESS, TRANSPORT_ERROR};
use crate::output::{print_message, OutputFormat};

#[derive(Debug, Serialize)]
struct EmitSummary {
    channel: String,
    variant: &'static str,
    events_sent: usize,
    bye_acknowledged: Option<bool>,
}

pub fn run(args: EmitArgs, format: OutputFormat) -> CliResult<i32> {
    let config: ChannelConfig = args
        .config
        .parse()
        .map_err(|err| transport_error("invalid channel configuration", err))?;
    let timeout = parse_duration(&args.timeout)?;
    let node = NodeConfig::default()
        .with_variant(args.variant)
        .with_frame_config(FrameConfig {
            read_timeout: Some(timeout),
            ..FrameConfig::default()
        });
    let dump: Arc<dyn DumpSink> = match &args.dump_dir {
        Some(dir) => Arc::new(FileDump::new(dir, "emit")),
        None => LogDump::shared(),
    };

    let mut worker = connect_with_config(&config, &node, dump)
        .map_err(|err| node_error("connect failed", err))?;

    let mut sent = 0usize;
    for message in &args.info {
        worker.events().console_info_log(Some(message.as_str()));
        sent += 1;
    }
    for text in &args.stdout {
        worker.events().std_out(None, Some(text.as_str()), true);
        sent += 1;
    }

    let mut bye_acknowledged = None;
    if args.bye {
        worker.events().bye();
        sent += 1;
        bye_acknowledged = Some(wait_for_bye_ack(&mut worker, &args, format)?);
    }

    let failed = worker.events().check_error();
    worker
        .close()
        .map_err(|err| node_error("close failed", err))?;
    if failed {
        return Err(CliError::new(
            TRANSPORT_ERROR,
            "event stream write failed; see diagnostics",
        ));
    }

    let summary = EmitSummary {
        channel: config.to_string(),
        variant: args.variant.as_str(),
        events_sent: sent,
        bye_acknowledged,
    };
    match config {
        // Stdout carries the event stream.
        ChannelConfig::Pipe => info!(events_sent = sent, "events emitted"),
        ChannelConfig::Tcp { .. } => println!(
            "{}",
            serde_json::to_string(&summary).unwrap_or_else(|_| "{}".to_string())
        ),
    }
    Ok(SUCCESS)
}

/// Read commands until bye-ack. Other commands are printed on the way.
fn wait_for_bye_ack(
    worker: &mut WorkerChannel,
    args: &EmitArgs,
    format: OutputFormat,
) -> CliResult<bool> {
    loop {
        match worker.next_command() {
            Ok(Command::ByeAck) => return Ok(true),
            Ok(command) => {
                if matches!(worker.config(), ChannelConfig::Tcp { .. }) {
                    print_message(&command, None, args.variant, format);
                }
            }
            Err(NodeError::Frame(FrameError::EndOfStream)) => return Ok(false),
            Err(err) => return Err(node_error("waiting for bye-ack failed", err)),
        }
    }
}
