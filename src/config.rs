//! Run configuration.
//!
//! A [`RunConfig`] is the validated, immutable description of one benchmark
//! run: which transfers to launch, how many iterations, how large each copy is
//! and how host buffers are allocated. Validation happens before any device
//! resource is touched.

use std::path::PathBuf;
use std::time::Duration;

use crate::backend::DeviceId;
use crate::error::{HitsError, Result};
use crate::logging::LogLevel;
use crate::transfer::TransferKind;

/// Largest supported transfer size (1 GiB).
pub const MAX_TRANSFER_SIZE: usize = 1 << 30;

/// Default transfer size.
pub const DEFAULT_TRANSFER_SIZE: usize = MAX_TRANSFER_SIZE;

/// Default number of iterations per transfer.
pub const DEFAULT_ITERATIONS: u64 = 100;

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

/// One requested transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    /// Transfer type and direction
    pub kind: TransferKind,
    /// Device of a direct transfer, destination device of a peer transfer
    pub device: DeviceId,
    /// Source device of a peer transfer
    pub peer: Option<DeviceId>,
}

impl TransferRequest {
    /// Host memory to `device`.
    pub fn host_to_device(device: impl Into<DeviceId>) -> Self {
        Self {
            kind: TransferKind::HostToDevice,
            device: device.into(),
            peer: None,
        }
    }

    /// `device` to host memory.
    pub fn device_to_host(device: impl Into<DeviceId>) -> Self {
        Self {
            kind: TransferKind::DeviceToHost,
            device: device.into(),
            peer: None,
        }
    }

    /// Peer copy from `src` into `dst`.
    pub fn device_to_device(dst: impl Into<DeviceId>, src: impl Into<DeviceId>) -> Self {
        Self {
            kind: TransferKind::DeviceToDevice,
            device: dst.into(),
            peer: Some(src.into()),
        }
    }

    /// Devices referenced by this request.
    pub fn devices(&self) -> impl Iterator<Item = DeviceId> {
        std::iter::once(self.device).chain(self.peer)
    }

    fn validate(&self) -> Result<()> {
        match (self.kind, self.peer) {
            (TransferKind::DeviceToDevice, None) => Err(HitsError::config(
                "transfers",
                "a device to device transfer needs a source device",
            )),
            (TransferKind::HostToDevice | TransferKind::DeviceToHost, Some(_)) => {
                Err(HitsError::config(
                    "transfers",
                    "a direct transfer takes a single device",
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Parse a `<dst>,<src>` device pair.
///
/// # Examples
///
/// ```rust
/// use hits::backend::DeviceId;
/// use hits::config::parse_device_pair;
///
/// assert_eq!(parse_device_pair("0,1").unwrap(), (DeviceId(0), DeviceId(1)));
/// assert!(parse_device_pair("0,1,2").is_err());
/// ```
pub fn parse_device_pair(text: &str) -> Result<(DeviceId, DeviceId)> {
    let mut ids = text.split(',');
    let mut next = |which: &str| -> Result<DeviceId> {
        let token = ids.next().map(str::trim).unwrap_or_default();
        token.parse::<u32>().map(DeviceId).map_err(|_| {
            HitsError::config(
                "dtod",
                format!(
                    "cannot parse {} GPU id; expected two ids separated by a comma",
                    which
                ),
            )
        })
    };
    let dst = next("first")?;
    let src = next("second")?;
    if ids.next().is_some() {
        return Err(HitsError::config(
            "dtod",
            "only accepts a list of two GPU ids separated by a comma",
        ));
    }
    Ok((dst, src))
}

/// Host allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocFlags {
    /// Place host buffers on the NUMA node of the device
    pub numa_aware: bool,
    /// Use pinned host memory instead of pageable memory
    pub pinned: bool,
}

impl Default for AllocFlags {
    fn default() -> Self {
        Self {
            numa_aware: true,
            pinned: true,
        }
    }
}

/// Logging and diagnostics configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Enable diagnostic logging
    pub enabled: bool,
    /// Minimum log level
    pub level: LogLevel,
    /// Log file path (None = stderr only)
    pub log_file: Option<PathBuf>,
    /// Use JSON format for log entries
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: LogLevel::Warn,
            log_file: None,
            json_format: false,
        }
    }
}

/// Complete configuration of one benchmark run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Transfers to launch, in order
    pub transfers: Vec<TransferRequest>,
    /// Iterations per transfer
    pub iterations: u64,
    /// Bytes per copy
    pub transfer_size: usize,
    /// Host allocation policy
    pub alloc: AllocFlags,
    /// Heartbeat period
    pub heartbeat_interval: Duration,
    /// sysfs mount used for NUMA topology
    pub sysfs_root: PathBuf,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            transfers: Vec::new(),
            iterations: DEFAULT_ITERATIONS,
            transfer_size: DEFAULT_TRANSFER_SIZE,
            alloc: AllocFlags::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT,
            sysfs_root: PathBuf::from("/sys"),
            logging: LoggingConfig::default(),
        }
    }
}

impl RunConfig {
    /// Smoke-test preset: 16 MiB copies, 10 iterations.
    pub fn quick() -> Self {
        Self {
            iterations: 10,
            transfer_size: 16 << 20,
            ..Default::default()
        }
    }

    /// Start building a configuration from the defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// - [`HitsError::NoTransfers`] when no transfer is configured
    /// - [`HitsError::InvalidConfig`] for a zero iteration count, a size of 0
    ///   or above [`MAX_TRANSFER_SIZE`], an inconsistent transfer request or
    ///   a zero heartbeat period
    pub fn validate(&self) -> Result<()> {
        if self.transfers.is_empty() {
            return Err(HitsError::NoTransfers);
        }

        if self.iterations == 0 {
            return Err(HitsError::config(
                "iterations",
                "must be greater than 0",
            ));
        }

        if self.transfer_size == 0 {
            return Err(HitsError::config("size", "must be greater than 0"));
        }

        if self.transfer_size > MAX_TRANSFER_SIZE {
            return Err(HitsError::config(
                "size",
                format!("maximum transfer size value is {}", MAX_TRANSFER_SIZE),
            ));
        }

        for request in &self.transfers {
            request.validate()?;
        }

        if self.heartbeat_interval.is_zero() {
            return Err(HitsError::config(
                "heartbeat_interval",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Builder for [`RunConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: RunConfig,
}

impl ConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transfer.
    pub fn transfer(mut self, request: TransferRequest) -> Self {
        self.config.transfers.push(request);
        self
    }

    /// Append a host to device transfer.
    pub fn host_to_device(self, device: u32) -> Self {
        self.transfer(TransferRequest::host_to_device(device))
    }

    /// Append a device to host transfer.
    pub fn device_to_host(self, device: u32) -> Self {
        self.transfer(TransferRequest::device_to_host(device))
    }

    /// Append a peer transfer from `src` into `dst`.
    pub fn device_to_device(self, dst: u32, src: u32) -> Self {
        self.transfer(TransferRequest::device_to_device(dst, src))
    }

    /// Set the iteration count.
    pub fn iterations(mut self, iterations: u64) -> Self {
        self.config.iterations = iterations;
        self
    }

    /// Set the transfer size in bytes.
    pub fn transfer_size(mut self, bytes: usize) -> Self {
        self.config.transfer_size = bytes;
        self
    }

    /// Enable or disable NUMA-aware host placement.
    pub fn numa_aware(mut self, enabled: bool) -> Self {
        self.config.alloc.numa_aware = enabled;
        self
    }

    /// Enable or disable pinned host memory.
    pub fn pinned(mut self, enabled: bool) -> Self {
        self.config.alloc.pinned = enabled;
        self
    }

    /// Set the heartbeat period.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the sysfs root used for NUMA topology.
    pub fn sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.sysfs_root = root.into();
        self
    }

    /// Set the logging configuration.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<RunConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.iterations, 100);
        assert_eq!(config.transfer_size, 1 << 30);
        assert!(config.alloc.numa_aware);
        assert!(config.alloc.pinned);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        // no transfers yet
        assert!(matches!(config.validate(), Err(HitsError::NoTransfers)));
    }

    #[test]
    fn test_quick_config() {
        let mut config = RunConfig::quick();
        config.transfers.push(TransferRequest::host_to_device(0));
        assert!(config.validate().is_ok());
        assert_eq!(config.iterations, 10);
        assert_eq!(config.transfer_size, 16 << 20);
    }

    #[test]
    fn test_size_boundaries() {
        let at_max = RunConfig::builder()
            .host_to_device(0)
            .transfer_size(MAX_TRANSFER_SIZE)
            .build();
        assert!(at_max.is_ok());

        let above = RunConfig::builder()
            .host_to_device(0)
            .transfer_size(MAX_TRANSFER_SIZE + 1)
            .build();
        assert!(matches!(
            above,
            Err(HitsError::InvalidConfig { field: "size", .. })
        ));

        let zero = RunConfig::builder().host_to_device(0).transfer_size(0).build();
        assert!(matches!(
            zero,
            Err(HitsError::InvalidConfig { field: "size", .. })
        ));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let result = RunConfig::builder().device_to_host(1).iterations(0).build();
        assert!(matches!(
            result,
            Err(HitsError::InvalidConfig {
                field: "iterations",
                ..
            })
        ));
    }

    #[test]
    fn test_inconsistent_requests() {
        let mut config = RunConfig::quick();
        config.transfers.push(TransferRequest {
            kind: TransferKind::DeviceToDevice,
            device: DeviceId(0),
            peer: None,
        });
        assert!(config.validate().is_err());

        let mut config = RunConfig::quick();
        config.transfers.push(TransferRequest {
            kind: TransferKind::HostToDevice,
            device: DeviceId(0),
            peer: Some(DeviceId(1)),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = RunConfig::builder()
            .host_to_device(0)
            .device_to_host(1)
            .device_to_device(0, 1)
            .iterations(7)
            .transfer_size(4096)
            .numa_aware(false)
            .pinned(false)
            .heartbeat_interval(Duration::from_millis(250))
            .sysfs_root("/tmp/sys")
            .build()
            .unwrap();

        assert_eq!(config.transfers.len(), 3);
        assert_eq!(config.transfers[2].peer, Some(DeviceId(1)));
        assert_eq!(config.iterations, 7);
        assert_eq!(config.transfer_size, 4096);
        assert!(!config.alloc.numa_aware);
        assert!(!config.alloc.pinned);
        assert_eq!(config.sysfs_root, PathBuf::from("/tmp/sys"));
    }

    #[test]
    fn test_request_devices() {
        let peer = TransferRequest::device_to_device(2, 3);
        assert_eq!(peer.devices().collect::<Vec<_>>(), vec![DeviceId(2), DeviceId(3)]);
        let direct = TransferRequest::device_to_host(4);
        assert_eq!(direct.devices().collect::<Vec<_>>(), vec![DeviceId(4)]);
    }

    #[test]
    fn test_parse_device_pair() {
        assert_eq!(
            parse_device_pair("3, 1").unwrap(),
            (DeviceId(3), DeviceId(1))
        );
        assert!(parse_device_pair("").is_err());
        assert!(parse_device_pair("0").is_err());
        assert!(parse_device_pair("0,").is_err());
        assert!(parse_device_pair("-1,0").is_err());
        assert!(parse_device_pair("a,b").is_err());
        assert!(parse_device_pair("0,1,2").is_err());
    }
}
