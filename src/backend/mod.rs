//! Device runtime abstraction.
//!
//! This module provides a unified interface over the accelerator runtime so the
//! orchestration code can run against real HIP devices or against a
//! deterministic in-process simulation.
//!
//! Every device-targeted call takes the target [`DeviceId`] explicitly. The
//! runtime makes that device current immediately before the call; callers never
//! rely on a previously selected device.

use std::fmt;

use crate::error::{HitsError, Result};

#[cfg(feature = "hip")]
pub mod hip;
pub mod simulated;

/// Index of an accelerator device as enumerated by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(id: u32) -> Self {
        DeviceId(id)
    }
}

/// PCI location of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PciBusId {
    /// PCI domain
    pub domain: u32,
    /// Bus number
    pub bus: u8,
    /// Device number on the bus
    pub device: u8,
}

impl PciBusId {
    /// Parse the `dddd:bb:dd.f` form returned by the runtime.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim().trim_end_matches('\0');
        let mut parts = text.split(':');
        let domain = u32::from_str_radix(parts.next()?, 16).ok()?;
        let bus = u8::from_str_radix(parts.next()?, 16).ok()?;
        let device = parts.next()?.split('.').next()?;
        let device = u8::from_str_radix(device, 16).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            domain,
            bus,
            device,
        })
    }
}

impl fmt::Display for PciBusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:02x}:{:02x}", self.domain, self.bus, self.device)
    }
}

/// Capability snapshot of a device, queried once at setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Marketing name
    pub name: String,
    /// PCI location
    pub pci: PciBusId,
    /// Total device memory in bytes
    pub total_memory: u64,
}

/// Handle of an execution stream created by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

/// Handle of a timing event created by a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u32);

/// Address of memory handed out by a runtime (device or pinned host).
///
/// Stored as a plain integer so handles can cross threads; it is only ever
/// turned back into a pointer inside a runtime implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub usize);

/// Direction and endpoints of one asynchronous copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    /// Host memory to device memory
    HostToDevice,
    /// Device memory to host memory
    DeviceToHost,
    /// Device memory to device memory over a peer link
    Peer {
        /// Device owning the destination buffer
        dst_device: DeviceId,
        /// Device owning the source buffer
        src_device: DeviceId,
    },
}

/// One asynchronous copy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRequest {
    /// Copy variant
    pub kind: CopyKind,
    /// Destination address
    pub dst: usize,
    /// Source address
    pub src: usize,
    /// Number of bytes
    pub bytes: usize,
}

/// Trait for device runtimes that can allocate, copy and time transfers.
///
/// Implementations must be shareable across threads: setup and execution run
/// on a blocking worker while the caller keeps the runtime alive.
///
/// # Device selection
///
/// Methods taking a `device` argument operate on that device. Stream and
/// event methods must be given the device the stream or event was created on.
pub trait DeviceRuntime: Send + Sync {
    /// Backend name for diagnostics, such as "hip" or "simulated".
    fn name(&self) -> &'static str;

    /// Number of visible devices.
    fn device_count(&self) -> Result<u32>;

    /// Query the capability snapshot of a device.
    fn device_properties(&self, device: DeviceId) -> Result<DeviceProperties>;

    /// Create a non-blocking execution stream on `device`.
    fn create_stream(&self, device: DeviceId) -> Result<StreamId>;

    /// Create a timing event on `device`.
    fn create_event(&self, device: DeviceId) -> Result<EventId>;

    /// Allocate `bytes` of memory on `device`.
    fn device_alloc(&self, device: DeviceId, bytes: usize) -> Result<DevicePtr>;

    /// Allocate `bytes` of pinned host memory visible to `device`.
    ///
    /// The allocation honours the calling thread's NUMA memory policy.
    fn host_alloc_pinned(&self, device: DeviceId, bytes: usize) -> Result<DevicePtr>;

    /// Release pinned host memory obtained from [`host_alloc_pinned`](Self::host_alloc_pinned).
    fn host_free_pinned(&self, ptr: DevicePtr) -> Result<()>;

    /// Whether `device` can directly access memory owned by `peer`.
    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool>;

    /// Enable direct access from `device` to memory owned by `peer`.
    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<()>;

    /// Queue an asynchronous copy on `stream`. Never blocks.
    fn copy_async(&self, device: DeviceId, stream: StreamId, copy: CopyRequest) -> Result<()>;

    /// Queue a timestamp record of `event` on `stream`. Never blocks.
    fn record_event(&self, device: DeviceId, event: EventId, stream: StreamId) -> Result<()>;

    /// Block until all work queued on `device` has completed.
    fn synchronize(&self, device: DeviceId) -> Result<()>;

    /// Elapsed time between two recorded events, in milliseconds.
    fn elapsed_ms(&self, device: DeviceId, start: EventId, stop: EventId) -> Result<f32>;
}

/// Runtime error code for a peer mapping that already exists.
///
/// Shared by HIP and the simulated runtime.
pub const PEER_ACCESS_ALREADY_ENABLED: i32 = 704;

/// Detect the device runtime available in this build.
///
/// # Errors
///
/// Returns [`HitsError::NoRuntime`] when the crate was built without the
/// `hip` feature or when the HIP runtime reports no devices.
pub fn detect_runtime() -> Result<Box<dyn DeviceRuntime>> {
    #[cfg(feature = "hip")]
    {
        let runtime = hip::HipRuntime::new()?;
        if runtime.device_count()? == 0 {
            return Err(HitsError::NoRuntime("HIP reports no devices".into()));
        }
        Ok(Box::new(runtime))
    }

    #[cfg(not(feature = "hip"))]
    {
        Err(HitsError::NoRuntime(
            "built without the `hip` feature; use --simulate <devices>".into(),
        ))
    }
}
