//! Transfer descriptors.
//!
//! A [`TransferDescriptor`] owns everything one configured transfer needs
//! while the run is in flight: both buffers, a dedicated stream on the
//! primary device and the start/stop timing events. Descriptors are created
//! by [`setup`], driven by [`crate::engine`] and consumed by
//! [`crate::report`].

use std::fmt;

use crate::backend::{
    CopyKind, CopyRequest, DeviceId, DeviceProperties, DeviceRuntime, EventId, StreamId,
};
use crate::buffer::TransferBuffer;
use crate::error::{HitsError, Result};

pub mod peer;
pub mod setup;

pub use peer::negotiate_peer_access;
pub use setup::{allocate, allocate_all};

/// Transfer type and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Host memory to device memory
    HostToDevice,
    /// Device memory to host memory
    DeviceToHost,
    /// Device memory to device memory over a peer link
    DeviceToDevice,
}

impl TransferKind {
    /// Whether one side of the transfer is host memory.
    pub fn is_direct(self) -> bool {
        !matches!(self, TransferKind::DeviceToDevice)
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferKind::HostToDevice => "Host to Device",
            TransferKind::DeviceToHost => "Device to Host",
            TransferKind::DeviceToDevice => "Device to Device",
        })
    }
}

/// Lifecycle of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Allocated, nothing issued
    NotStarted,
    /// Start event recorded, copies being issued
    Running,
    /// Stop event recorded
    Completed,
}

/// Resources and state of one configured transfer.
#[derive(Debug)]
pub struct TransferDescriptor {
    pub(crate) index: usize,
    pub(crate) kind: TransferKind,
    pub(crate) device: DeviceId,
    pub(crate) peer: Option<DeviceId>,
    pub(crate) source: TransferBuffer,
    pub(crate) destination: TransferBuffer,
    pub(crate) stream: StreamId,
    pub(crate) start: EventId,
    pub(crate) stop: EventId,
    pub(crate) numa_node: Option<u32>,
    pub(crate) device_props: DeviceProperties,
    pub(crate) peer_props: Option<DeviceProperties>,
    pub(crate) state: TransferState,
}

impl TransferDescriptor {
    /// Position in the configured transfer order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Transfer type.
    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Primary device: the device of a direct transfer, the destination of a
    /// peer transfer. Owns the stream and events.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Source device of a peer transfer.
    pub fn peer(&self) -> Option<DeviceId> {
        self.peer
    }

    /// Source buffer.
    pub fn source(&self) -> &TransferBuffer {
        &self.source
    }

    /// Destination buffer.
    pub fn destination(&self) -> &TransferBuffer {
        &self.destination
    }

    /// Stream the copies are issued on.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Start and stop events.
    pub fn events(&self) -> (EventId, EventId) {
        (self.start, self.stop)
    }

    /// NUMA node of the host buffer, if it was resolved.
    pub fn numa_node(&self) -> Option<u32> {
        self.numa_node
    }

    /// Properties of the primary device.
    pub fn device_properties(&self) -> &DeviceProperties {
        &self.device_props
    }

    /// Properties of the peer device.
    pub fn peer_properties(&self) -> Option<&DeviceProperties> {
        self.peer_props.as_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// True once the first copy has been issued.
    pub fn has_started(&self) -> bool {
        self.state != TransferState::NotStarted
    }

    /// Bytes moved by one copy.
    pub fn bytes(&self) -> usize {
        self.source.len()
    }

    /// One-line description printed when the transfer starts.
    pub fn announcement(&self) -> String {
        match (self.kind, self.peer, &self.peer_props) {
            (TransferKind::DeviceToDevice, Some(peer), Some(peer_props)) => format!(
                "Launching P2P PCIe transfers from Device {} (0x{:02x}) to Device {} (0x{:02x})",
                peer,
                peer_props.pci.bus,
                self.device,
                self.device_props.pci.bus
            ),
            _ => {
                let mut line = format!(
                    "Launching {} transfers with Device {} (0x{:02x})",
                    self.kind, self.device, self.device_props.pci.bus
                );
                if let Some(node) = self.numa_node {
                    line.push_str(&format!(" - Host buffer allocated on NUMA node {}", node));
                }
                line
            }
        }
    }

    /// The copy issued on every iteration.
    ///
    /// # Errors
    ///
    /// [`HitsError::InvalidConfig`] for a device to device descriptor without
    /// a peer device.
    pub fn copy_request(&self) -> Result<CopyRequest> {
        let kind = match (self.kind, self.peer) {
            (TransferKind::HostToDevice, _) => CopyKind::HostToDevice,
            (TransferKind::DeviceToHost, _) => CopyKind::DeviceToHost,
            (TransferKind::DeviceToDevice, Some(peer)) => CopyKind::Peer {
                dst_device: self.device,
                src_device: peer,
            },
            (TransferKind::DeviceToDevice, None) => {
                return Err(HitsError::config(
                    "peer",
                    format!("transfer {} has no source device", self.index),
                ))
            }
        };
        Ok(CopyRequest {
            kind,
            dst: self.destination.address(),
            src: self.source.address(),
            bytes: self.bytes(),
        })
    }

    /// Release host-side buffers.
    ///
    /// Device buffers, the stream and the events stay allocated until the
    /// process exits.
    pub fn release(self, runtime: &dyn DeviceRuntime) -> Result<()> {
        self.source.release(runtime)?;
        self.destination.release(runtime)
    }
}
