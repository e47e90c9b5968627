use std::sync::Arc;

use forkwire_frame::{
    Command, CommandDecoder, CommandKind, DumpSink, EventEncoder, EventKind, LogDump, Vocabulary,
};
use forkwire_transport::{BufferedChannel, ChannelConfig, ForkStream, ReadChannel};
use tracing::debug;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::flusher::PeriodicFlusher;

/// Worker end of a fork channel: commands in, events out.
///
/// Buffered events are pushed out by a [`PeriodicFlusher`] that lives as
/// long as this value.
pub struct WorkerChannel {
    commands: CommandDecoder<ReadChannel<ForkStream>>,
    events: EventEncoder<ForkStream>,
    flusher: PeriodicFlusher,
    config: ChannelConfig,
}

/// Connect to the controller named by `config` (`pipe:std:in` or
/// `tcp://host:port`) with default settings.
pub fn connect(config: &str) -> Result<WorkerChannel> {
    let config: ChannelConfig = config.parse()?;
    connect_with_config(&config, &NodeConfig::default(), LogDump::shared())
}

/// Connect with explicit node settings and dump sink.
pub fn connect_with_config(
    config: &ChannelConfig,
    node: &NodeConfig,
    dump: Arc<dyn DumpSink>,
) -> Result<WorkerChannel> {
    let pair = config.connect()?;
    pair.input.set_read_timeout(node.frame.read_timeout)?;
    pair.output.set_write_timeout(node.frame.write_timeout)?;
    debug!(
        channel = %config,
        transport = pair.input.transport_name(),
        variant = %node.variant,
        "worker channel connected"
    );

    let commands = CommandDecoder::with_config(
        ReadChannel::from_stream(pair.input),
        Vocabulary::<CommandKind>::shared(),
        Arc::clone(&dump),
        node.variant,
        &node.frame,
    );

    let channel = Arc::new(BufferedChannel::from_stream(
        pair.output,
        node.buffer_capacity,
    ));
    let flusher = PeriodicFlusher::start(&channel, node.flush_period)?;
    let events = EventEncoder::new(
        channel,
        Vocabulary::<EventKind>::shared(),
        node.variant,
        dump,
    );

    Ok(WorkerChannel {
        commands,
        events,
        flusher,
        config: config.clone(),
    })
}

impl WorkerChannel {
    /// Block until the next command arrives.
    pub fn next_command(&mut self) -> Result<Command> {
        Ok(self.commands.decode()?)
    }

    pub fn events(&self) -> &EventEncoder<ForkStream> {
        &self.events
    }

    pub fn commands_mut(&mut self) -> &mut CommandDecoder<ReadChannel<ForkStream>> {
        &mut self.commands
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Split into decoder, encoder and flusher so commands can be read on a
    /// dedicated thread. Keep the flusher alive as long as the encoder.
    pub fn into_parts(
        self,
    ) -> (
        CommandDecoder<ReadChannel<ForkStream>>,
        EventEncoder<ForkStream>,
        PeriodicFlusher,
    ) {
        (self.commands, self.events, self.flusher)
    }

    /// Mark the exit, flush and close the event channel, then shut the
    /// transport down.
    pub fn close(mut self) -> Result<()> {
        self.events.on_jvm_exit();
        self.flusher.shutdown();
        let result = self.events.channel().close();
        self.commands.get_mut().close();
        self.commands.get_ref().get_ref().shutdown()?;
        debug!(channel = %self.config, "worker channel closed");
        Ok(result?)
    }
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("config", &self.config)
            .field("events", &self.events)
            .field("flusher", &self.flusher)
            .finish()
    }
}
