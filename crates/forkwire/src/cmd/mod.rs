use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use forkwire_frame::ProtocolVariant;
use forkwire_transport::TcpForkServer;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod decode;
pub mod emit;
pub mod listen;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept one worker and print the events it sends.
    Listen(ListenArgs),
    /// Connect as a worker and send events.
    Emit(EmitArgs),
    /// Decode a captured stream and print its frames.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Listen(args) => listen::run(args, format),
        Command::Emit(args) => emit::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address to bind. Port 0 picks a free port.
    #[arg(long, default_value = TcpForkServer::DEFAULT_BIND)]
    pub bind: String,
    /// Exit after receiving N events.
    #[arg(long)]
    pub count: Option<usize>,
    /// Text encoding on the wire.
    #[arg(long, default_value = "binary")]
    pub variant: ProtocolVariant,
    /// Give up if the worker is silent this long (e.g. 30s, 500ms).
    #[arg(long)]
    pub timeout: Option<String>,
    /// Write corrupted-stream diagnostics into this directory.
    #[arg(long, value_name = "DIR")]
    pub dump_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct EmitArgs {
    /// Channel configuration: pipe:std:in or tcp://host:port[?sessionId=ID].
    pub config: String,
    /// Send a console info log event.
    #[arg(long = "info", value_name = "MSG")]
    pub info: Vec<String>,
    /// Send a line of standard output.
    #[arg(long = "stdout", value_name = "TEXT")]
    pub stdout: Vec<String>,
    /// Finish with bye and wait for the controller's bye-ack.
    #[arg(long)]
    pub bye: bool,
    /// Text encoding on the wire.
    #[arg(long, default_value = "binary")]
    pub variant: ProtocolVariant,
    /// How long to wait for bye-ack (e.g. 5s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
    /// Write diagnostics into this directory.
    #[arg(long, value_name = "DIR")]
    pub dump_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Captured stream. Reads stdin when omitted.
    pub file: Option<PathBuf>,
    /// The stream carries commands instead of events.
    #[arg(long)]
    pub commands: bool,
    /// Text encoding on the wire.
    #[arg(long, default_value = "binary")]
    pub variant: ProtocolVariant,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert_eq!(parse_duration("0s").unwrap_err().code, USAGE);
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration(" ").is_err());
    }
}
