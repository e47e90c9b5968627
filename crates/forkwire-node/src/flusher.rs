use std::io::Write;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use forkwire_transport::BufferedChannel;
use tracing::{debug, trace};

use crate::error::{NodeError, Result};

/// Pushes buffered event bytes out when the producer goes quiet.
///
/// Every `period` the flusher compares the channel's overflow counter with
/// the value seen on the previous tick. An unchanged counter means nothing
/// forced a flush in between, so the flusher writes an empty slice, which
/// drains the buffer. A changed counter is only recorded.
///
/// The thread holds a weak reference and exits by itself once the channel is
/// dropped or closed.
pub struct PeriodicFlusher {
    stop: Option<Sender<()>>,
    handle: JoinHandle<()>,
}

impl PeriodicFlusher {
    pub fn start<W>(channel: &Arc<BufferedChannel<W>>, period: Duration) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let weak = Arc::downgrade(channel);
        let last = channel.count_buffer_overflows();

        let handle = thread::Builder::new()
            .name("forkwire-flusher".to_string())
            .spawn(move || {
                run(weak, period, last, |timeout| {
                    matches!(stopped.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
                })
            })
            .map_err(NodeError::Flusher)?;

        debug!(?period, "flusher started");
        Ok(Self {
            stop: Some(stop),
            handle,
        })
    }

    /// Ask the thread to stop. Does not wait for it.
    pub fn shutdown(&mut self) {
        self.stop.take();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicFlusher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PeriodicFlusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicFlusher")
            .field("cancelled", &self.stop.is_none())
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

/// `wait` sleeps one period and returns false once the flusher is cancelled.
fn run<W, F>(channel: Weak<BufferedChannel<W>>, period: Duration, mut last: u64, mut wait: F)
where
    W: Write,
    F: FnMut(Duration) -> bool,
{
    while wait(period) {
        let Some(channel) = channel.upgrade() else {
            break;
        };
        if !channel.is_open() {
            break;
        }

        let overflows = channel.count_buffer_overflows();
        if overflows != last {
            last = overflows;
            continue;
        }

        if let Err(err) = channel.write(&[]) {
            if err.is_closed() {
                break;
            }
            trace!(error = %err, "periodic flush failed");
        }
    }
    debug!("flusher stopped");
}
