//! Bandwidth computation and result lines.

use std::fmt;

use crate::backend::{DeviceId, DeviceRuntime};
use crate::error::{Locate, Result};
use crate::logging::PerformanceMetrics;
use crate::transfer::{TransferDescriptor, TransferKind};

/// Measured bandwidth of one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthReport {
    /// Position in the configured transfer order
    pub index: usize,
    /// Transfer type
    pub kind: TransferKind,
    /// Primary device
    pub device: DeviceId,
    /// PCI bus number of the primary device
    pub device_bus: u8,
    /// Source device and its PCI bus number, for peer transfers
    pub peer: Option<(DeviceId, u8)>,
    /// Bytes moved per copy
    pub transfer_size: usize,
    /// Number of copies
    pub iterations: u64,
    /// Time between start and stop events, in seconds
    pub elapsed_seconds: f64,
    /// Throughput in GB/s (10^9 bytes per second)
    pub gbps: f64,
}

impl fmt::Display for BandwidthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some((src, src_bus)) => write!(
                f,
                "Transfer {} - P2P transfers from Device {} (0x{:02x}) to Device {} (0x{:02x}):",
                self.index, src, src_bus, self.device, self.device_bus
            )?,
            None => write!(
                f,
                "Transfer {} - Direct transfers ({}) with Device {} (0x{:02x}):",
                self.index, self.kind, self.device, self.device_bus
            )?,
        }
        write!(
            f,
            " {:.3} GB/s  ({:.2} seconds)",
            self.gbps, self.elapsed_seconds
        )
    }
}

/// Throughput in GB/s of `iterations` copies of `bytes` taking
/// `elapsed_seconds`.
///
/// Zero or negative elapsed time yields 0.0 rather than infinity.
///
/// # Examples
///
/// ```rust
/// use hits::report::throughput_gbps;
///
/// assert_eq!(throughput_gbps(1_000_000_000, 10, 2.0), 5.0);
/// assert_eq!(throughput_gbps(1_000_000_000, 10, 0.0), 0.0);
/// ```
pub fn throughput_gbps(bytes: usize, iterations: u64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 {
        return 0.0;
    }
    bytes as f64 / 1e9 * iterations as f64 / elapsed_seconds
}

/// Measure one synchronized transfer.
pub fn measure(
    runtime: &dyn DeviceRuntime,
    transfer: &TransferDescriptor,
    iterations: u64,
) -> Result<BandwidthReport> {
    let (start, stop) = transfer.events();
    let elapsed_ms = runtime
        .elapsed_ms(transfer.device(), start, stop)
        .located()?;
    let elapsed_seconds = f64::from(elapsed_ms) / 1e3;
    let bytes = transfer.bytes();

    Ok(BandwidthReport {
        index: transfer.index(),
        kind: transfer.kind(),
        device: transfer.device(),
        device_bus: transfer.device_properties().pci.bus,
        peer: transfer
            .peer()
            .zip(transfer.peer_properties().map(|p| p.pci.bus)),
        transfer_size: bytes,
        iterations,
        elapsed_seconds,
        gbps: throughput_gbps(bytes, iterations, elapsed_seconds),
    })
}

/// Measure every descriptor, in order.
pub fn measure_all(
    runtime: &dyn DeviceRuntime,
    descriptors: &[TransferDescriptor],
    iterations: u64,
) -> Result<Vec<BandwidthReport>> {
    descriptors
        .iter()
        .map(|t| measure(runtime, t, iterations))
        .collect()
}

/// Outcome of a complete run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// One report per configured transfer, in order
    pub transfers: Vec<BandwidthReport>,
    /// Heartbeat ticks emitted while transfers were in flight
    pub heartbeats: u64,
    /// Wall-clock timings of the setup, issue, drain and report phases
    pub metrics: PerformanceMetrics,
}

impl RunReport {
    /// Sum of all transfer throughputs.
    pub fn aggregate_gbps(&self) -> f64 {
        self.transfers.iter().map(|t| t.gbps).sum()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for transfer in &self.transfers {
            writeln!(f, "{}", transfer)?;
        }
        Ok(())
    }
}
