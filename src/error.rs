//! Error types and handling for transfer benchmark runs.
//!
//! Every failure aborts the whole run: bandwidth numbers for a partial set of
//! transfers are not comparable, so there is a single error type and no
//! per-transfer recovery.

use std::panic::Location;

use thiserror::Error;

use crate::backend::DeviceId;

/// Result type alias for benchmark operations.
pub type Result<T> = std::result::Result<T, HitsError>;

/// Comprehensive error type for benchmark runs.
///
/// Variants fall into three groups:
///
/// - configuration errors, detected before any resource is allocated
/// - capability errors, raised when the machine topology cannot run a transfer
/// - runtime errors, reported by the device runtime at any stage
#[derive(Debug, Error)]
pub enum HitsError {
    /// A configuration field is out of range or malformed.
    #[error("invalid {field}: {reason}")]
    InvalidConfig {
        /// Name of the offending field
        field: &'static str,
        /// Human-readable reason
        reason: String,
    },

    /// No transfer was requested.
    #[error("at least one transfer (--htod, --dtoh or --dtod) must be given")]
    NoTransfers,

    /// A transfer references a device the runtime does not expose.
    #[error("device {device} does not exist ({count} devices available)")]
    InvalidDevice {
        /// Requested device
        device: DeviceId,
        /// Number of devices reported by the runtime
        count: u32,
    },

    /// The primary device cannot directly access the secondary device.
    #[error("P2P cannot be enabled between devices {device} and {peer}")]
    PeerAccessUnsupported {
        /// Device that would access peer memory (destination side)
        device: DeviceId,
        /// Device owning the memory (source side)
        peer: DeviceId,
    },

    /// A device runtime call failed.
    #[error("{call} failed: {message} (code {code}){}", fmt_location(.location))]
    Runtime {
        /// Runtime entry point that failed
        call: &'static str,
        /// Error code returned by the runtime
        code: i32,
        /// Runtime error string
        message: String,
        /// Crate source location of the failing call
        location: Option<&'static Location<'static>>,
    },

    /// No device runtime is available in this build or on this machine.
    #[error("no device runtime available: {0}")]
    NoRuntime(String),

    /// The blocking worker running setup or execution panicked.
    #[error("transfer worker failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn fmt_location(location: &Option<&'static Location<'static>>) -> String {
    match location {
        Some(loc) => format!(" at {}:{}", loc.file(), loc.line()),
        None => String::new(),
    }
}

impl HitsError {
    /// Build a runtime error without location; see [`Locate::located`].
    pub fn runtime(call: &'static str, code: i32, message: impl Into<String>) -> Self {
        HitsError::Runtime {
            call,
            code,
            message: message.into(),
            location: None,
        }
    }

    /// Build a configuration error.
    pub fn config(field: &'static str, reason: impl Into<String>) -> Self {
        HitsError::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    /// Process exit status for this error.
    ///
    /// Runtime failures exit with the runtime's own code, everything else with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            HitsError::Runtime { code, .. } if (1..=255).contains(code) => *code,
            _ => 1,
        }
    }

    /// Whether this error was raised before any device resource was touched.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            HitsError::InvalidConfig { .. } | HitsError::NoTransfers | HitsError::InvalidDevice { .. }
        )
    }

    fn at(self, loc: &'static Location<'static>) -> Self {
        match self {
            HitsError::Runtime {
                call,
                code,
                message,
                location: None,
            } => HitsError::Runtime {
                call,
                code,
                message,
                location: Some(loc),
            },
            other => other,
        }
    }
}

/// Attach the caller's source location to runtime errors.
pub(crate) trait Locate<T> {
    fn located(self) -> Result<T>;
}

impl<T> Locate<T> for Result<T> {
    #[track_caller]
    fn located(self) -> Result<T> {
        let loc = Location::caller();
        self.map_err(|e| e.at(loc))
    }
}

// Errors cross the blocking-worker boundary
static_assertions::assert_impl_all!(HitsError: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io::{Error as IoError, ErrorKind};

    mod error_messages {
        use super::*;

        #[test]
        fn peer_access_names_both_devices() {
            let error = HitsError::PeerAccessUnsupported {
                device: DeviceId(0),
                peer: DeviceId(1),
            };
            assert_eq!(
                error.to_string(),
                "P2P cannot be enabled between devices 0 and 1"
            );
        }

        #[test]
        fn invalid_config() {
            let error = HitsError::config("size", "must be at most 1073741824 bytes");
            assert_eq!(
                error.to_string(),
                "invalid size: must be at most 1073741824 bytes"
            );
        }

        #[test]
        fn runtime_without_location() {
            let error = HitsError::runtime("hipMalloc", 2, "out of memory");
            assert_eq!(error.to_string(), "hipMalloc failed: out of memory (code 2)");
        }

        #[test]
        fn runtime_with_location() {
            let result: Result<()> = Err(HitsError::runtime("hipMalloc", 2, "out of memory"));
            let error = result.located().unwrap_err();
            let text = error.to_string();
            assert!(text.starts_with("hipMalloc failed: out of memory (code 2) at "));
            assert!(text.contains("error.rs"));
        }
    }

    mod exit_codes {
        use super::*;

        #[test]
        fn runtime_code_is_exit_status() {
            assert_eq!(HitsError::runtime("hipMalloc", 2, "oom").exit_code(), 2);
        }

        #[test]
        fn out_of_range_code_falls_back_to_one() {
            assert_eq!(HitsError::runtime("hipEventRecord", 0, "?").exit_code(), 1);
            assert_eq!(HitsError::runtime("hipEventRecord", 700, "?").exit_code(), 1);
        }

        #[test]
        fn other_errors_exit_with_one() {
            assert_eq!(HitsError::NoTransfers.exit_code(), 1);
            let peer = HitsError::PeerAccessUnsupported {
                device: DeviceId(2),
                peer: DeviceId(3),
            };
            assert_eq!(peer.exit_code(), 1);
        }
    }

    mod error_traits {
        use super::*;

        #[test]
        fn preserves_io_source() {
            let error = HitsError::from(IoError::new(ErrorKind::NotFound, "missing"));
            let source = error.source().unwrap();
            let io_err = source.downcast_ref::<IoError>().unwrap();
            assert_eq!(io_err.kind(), ErrorKind::NotFound);
        }

        #[test]
        fn located_keeps_existing_location() {
            let first: Result<()> = Err(HitsError::runtime("hipSetDevice", 101, "invalid device"));
            let first = first.located();
            let line = match &first {
                Err(HitsError::Runtime { location, .. }) => location.unwrap().line(),
                _ => panic!("Expected Runtime error variant"),
            };
            let again = first.located();
            match again {
                Err(HitsError::Runtime { location, .. }) => {
                    assert_eq!(location.unwrap().line(), line)
                }
                _ => panic!("Expected Runtime error variant"),
            }
        }

        #[test]
        fn config_classification() {
            assert!(HitsError::NoTransfers.is_config_error());
            assert!(!HitsError::runtime("hipMalloc", 2, "oom").is_config_error());
        }
    }
}
