//! # hits: Host and device Interconnect Transfer Speed
//!
//! Measures data-transfer bandwidth between host memory and accelerator
//! devices, and between devices over peer links, on a single machine. Every
//! configured transfer gets its own stream and is issued concurrently with the
//! others, so the numbers reflect links that are loaded at the same time.
//!
//! ## Key Features
//!
//! - **Concurrent streams**: host to device, device to host and peer
//!   transfers run side by side, one stream each
//! - **Device-side timing**: start and stop events bracket exactly the copies
//!   of a transfer
//! - **NUMA placement**: host buffers are placed on the node closest to the
//!   device, pinned or pageable
//! - **Runtime abstraction**: HIP behind the `hip` feature, plus a
//!   deterministic simulated runtime for tests and dry runs
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use hits::backend::simulated::SimulatedRuntime;
//! use hits::progress::RecordingProgress;
//! use hits::{Bench, RunConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::builder()
//!     .host_to_device(0)
//!     .device_to_device(0, 1)
//!     .transfer_size(16 << 20)
//!     .iterations(10)
//!     .build()?;
//!
//! let runtime = Arc::new(SimulatedRuntime::fully_connected(2));
//! let bench = Bench::new(runtime).with_progress(Arc::new(RecordingProgress::new()));
//!
//! let report = bench.run(&config).await?;
//! for transfer in &report.transfers {
//!     println!("{}", transfer);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Real Devices
//!
//! Build with `--features hip` and use [`backend::detect_runtime`] to get the
//! HIP runtime. Errors reported by the runtime carry the runtime's code, which
//! the `hits` binary uses as its exit status.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod backend;
pub mod bench;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod progress;
pub mod report;
pub mod transfer;

pub use backend::{detect_runtime, DeviceId, DeviceRuntime};
pub use bench::Bench;
pub use config::{AllocFlags, ConfigBuilder, LoggingConfig, RunConfig, TransferRequest};
pub use error::{HitsError, Result};
pub use logging::{LogLevel, Logger, PerformanceMetrics};
pub use progress::{ConsoleProgress, ProgressSink, RecordingProgress};
pub use report::{BandwidthReport, RunReport};
pub use transfer::{TransferDescriptor, TransferKind, TransferState};
