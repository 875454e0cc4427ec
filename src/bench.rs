//! Benchmark orchestration.
//!
//! [`Bench::run`] takes a validated configuration through the whole flow:
//!
//! 1. check every referenced device exists
//! 2. allocate all descriptors on a blocking worker
//! 3. start the heartbeat
//! 4. issue and drain on a blocking worker
//! 5. stop the heartbeat, report, release host buffers
//!
//! The result is all-or-nothing. Resources of a failed run are not released
//! individually.

use std::sync::Arc;
use std::time::Instant;

use crate::backend::DeviceRuntime;
use crate::config::RunConfig;
use crate::engine;
use crate::error::{HitsError, Locate, Result};
use crate::heartbeat::Heartbeat;
use crate::logging::{self, PerformanceMetrics};
use crate::progress::{ConsoleProgress, ProgressSink};
use crate::report::{self, RunReport};
use crate::transfer;

/// Runs benchmarks against one device runtime.
#[derive(Clone)]
pub struct Bench {
    runtime: Arc<dyn DeviceRuntime>,
    sink: Arc<dyn ProgressSink>,
}

impl Bench {
    /// Bench reporting progress on stdout.
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self {
            runtime,
            sink: Arc::new(ConsoleProgress),
        }
    }

    /// Replace the progress sink.
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Device runtime in use.
    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    /// Fail with [`HitsError::InvalidDevice`] if a transfer references a
    /// device the runtime does not expose.
    pub fn check_devices(&self, config: &RunConfig) -> Result<()> {
        let count = self.runtime.device_count().located()?;
        config
            .transfers
            .iter()
            .flat_map(|request| request.devices())
            .find(|device| device.0 >= count)
            .map_or(Ok(()), |device| {
                Err(HitsError::InvalidDevice { device, count })
            })
    }

    /// Run every configured transfer and report its bandwidth.
    ///
    /// Announcements, heartbeat ticks, the completion line and one result
    /// per transfer go to the progress sink as they happen.
    pub async fn run(&self, config: &RunConfig) -> Result<RunReport> {
        config.validate()?;
        self.check_devices(config)?;

        let mut metrics = PerformanceMetrics::new();
        crate::log_info!(
            "bench",
            "{} transfers, {} iterations of {} bytes on the {} runtime",
            config.transfers.len(),
            config.iterations,
            config.transfer_size,
            self.runtime.name()
        );

        let started = Instant::now();
        let runtime = Arc::clone(&self.runtime);
        let setup_config = config.clone();
        let mut descriptors =
            tokio::task::spawn_blocking(move || transfer::allocate_all(&*runtime, &setup_config))
                .await??;
        record(&mut metrics, "setup", started);

        let heartbeat = Heartbeat::start(config.heartbeat_interval, Arc::clone(&self.sink));

        let runtime = Arc::clone(&self.runtime);
        let sink = Arc::clone(&self.sink);
        let iterations = config.iterations;
        let execution = tokio::task::spawn_blocking(move || {
            let issue_started = Instant::now();
            engine::issue(&*runtime, &mut descriptors, iterations, &*sink)?;
            let issued = issue_started.elapsed();

            let drain_started = Instant::now();
            engine::drain(&*runtime, &descriptors)?;
            Ok::<_, HitsError>((descriptors, issued, drain_started.elapsed()))
        })
        .await;

        let heartbeats = heartbeat.stop().await?;
        let (descriptors, issued, drained) = execution??;
        for (phase, duration) in [("issue", issued), ("drain", drained)] {
            metrics.record_phase(phase, duration);
            logging::log_timing("bench", phase, duration);
        }

        self.sink.completed();

        let started = Instant::now();
        let transfers = report::measure_all(&*self.runtime, &descriptors, iterations)?;
        for result in &transfers {
            self.sink.result(result);
        }
        record(&mut metrics, "report", started);

        for descriptor in descriptors {
            descriptor.release(&*self.runtime)?;
        }

        Ok(RunReport {
            transfers,
            heartbeats,
            metrics,
        })
    }
}

fn record(metrics: &mut PerformanceMetrics, phase: &str, started: Instant) {
    let duration = started.elapsed();
    metrics.record_phase(phase, duration);
    logging::log_timing("bench", phase, duration);
}
