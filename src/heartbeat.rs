//! Progress heartbeat.
//!
//! While copies are in flight the engine thread sits in device
//! synchronization, so a separate task ticks the progress sink once per
//! interval until it is told to stop. The task shares nothing with the
//! transfers; its only input is the stop channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::error::Result;
use crate::progress::ProgressSink;

/// Handle of a running heartbeat task.
#[derive(Debug)]
pub struct Heartbeat {
    stop: oneshot::Sender<()>,
    task: JoinHandle<u64>,
}

impl Heartbeat {
    /// Spawn the heartbeat on the current tokio runtime.
    ///
    /// The first tick comes one full `interval` after the start.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(interval: Duration, sink: Arc<dyn ProgressSink>) -> Self {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(beat(interval, sink, stopped));
        Self { stop, task }
    }

    /// Stop the task and return the number of ticks it emitted.
    pub async fn stop(self) -> Result<u64> {
        // the task may already be gone if its runtime is shutting down
        let _ = self.stop.send(());
        Ok(self.task.await?)
    }
}

async fn beat(
    interval: Duration,
    sink: Arc<dyn ProgressSink>,
    mut stopped: oneshot::Receiver<()>,
) -> u64 {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = 0;

    loop {
        tokio::select! {
            biased;
            // a dropped handle stops the task too
            _ = &mut stopped => break,
            _ = ticker.tick() => {
                sink.heartbeat();
                ticks += 1;
            }
        }
    }
    ticks
}
