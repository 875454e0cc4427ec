//! Resource allocation for transfers.
//!
//! Every transfer gets a non-blocking stream and two events on its primary
//! device, plus a source and a destination buffer of the run-wide size:
//!
//! | kind             | source                  | destination             |
//! |------------------|-------------------------|-------------------------|
//! | host to device   | host (pinned/pageable)  | primary device          |
//! | device to host   | primary device          | host (pinned/pageable)  |
//! | device to device | peer device             | primary device          |
//!
//! Allocation is all-or-nothing: the first failure aborts the run.

use crate::backend::{DeviceId, DeviceRuntime};
use crate::buffer::{prefer_node, reset_node_preference, NumaTopology, TransferBuffer};
use crate::config::{AllocFlags, RunConfig, TransferRequest};
use crate::error::{Locate, Result};
use crate::logging::{self, LogLevel};
use crate::transfer::{negotiate_peer_access, TransferDescriptor, TransferKind, TransferState};

/// Allocate the descriptors of every configured transfer, in order.
pub fn allocate_all(
    runtime: &dyn DeviceRuntime,
    config: &RunConfig,
) -> Result<Vec<TransferDescriptor>> {
    let topology = NumaTopology::new(&config.sysfs_root);
    config
        .transfers
        .iter()
        .enumerate()
        .map(|(index, request)| {
            allocate(
                runtime,
                index,
                request,
                config.transfer_size,
                config.alloc,
                &topology,
            )
        })
        .collect()
}

/// Allocate the resources of one transfer.
///
/// Peer transfers negotiate access before any buffer is allocated. Direct
/// transfers resolve the device's NUMA node first when `flags.numa_aware` is
/// set and make it the preferred node of the calling thread, so the host
/// buffer lands next to the device. When the node is unknown or rejected the
/// thread falls back to the default policy, and a rejected node is still
/// reported on the descriptor.
pub fn allocate(
    runtime: &dyn DeviceRuntime,
    index: usize,
    request: &TransferRequest,
    size: usize,
    flags: AllocFlags,
    topology: &NumaTopology,
) -> Result<TransferDescriptor> {
    let device = request.device;
    let device_props = runtime.device_properties(device).located()?;
    let peer_props = match request.peer {
        Some(peer) => Some(runtime.device_properties(peer).located()?),
        None => None,
    };

    let start = runtime.create_event(device).located()?;
    let stop = runtime.create_event(device).located()?;
    let stream = runtime.create_stream(device).located()?;

    let mut numa_node = None;
    let (source, destination) = match (request.kind, request.peer) {
        (TransferKind::DeviceToDevice, Some(peer)) => {
            negotiate_peer_access(runtime, device, peer)?;
            let destination = TransferBuffer::device(runtime, device, size).located()?;
            let source = TransferBuffer::device(runtime, peer, size).located()?;
            (source, destination)
        }
        (kind, _) => {
            if flags.numa_aware {
                numa_node = place_near(index, device, topology.device_node(&device_props.pci));
            }

            let host = TransferBuffer::host(runtime, device, size, flags).located()?;
            let on_device = TransferBuffer::device(runtime, device, size).located()?;
            if kind == TransferKind::HostToDevice {
                (host, on_device)
            } else {
                (on_device, host)
            }
        }
    };

    logging::log_transfer(
        LogLevel::Debug,
        "setup",
        index,
        Some(device),
        &format!(
            "{} transfer ready: {} bytes, source {:?}, destination {:?}",
            request.kind,
            size,
            source.placement(),
            destination.placement()
        ),
    );

    Ok(TransferDescriptor {
        index,
        kind: request.kind,
        device,
        peer: request.peer,
        source,
        destination,
        stream,
        start,
        stop,
        numa_node,
        device_props,
        peer_props,
        state: TransferState::NotStarted,
    })
}

fn place_near(index: usize, device: DeviceId, node: Option<u32>) -> Option<u32> {
    let Some(node) = node else {
        reset_node_preference();
        logging::log_transfer(
            LogLevel::Info,
            "numa",
            index,
            Some(device),
            "NUMA node of the device is unknown; host placement left to the kernel",
        );
        return None;
    };

    if !prefer_node(node) {
        reset_node_preference();
        logging::log_transfer(
            LogLevel::Warn,
            "numa",
            index,
            Some(device),
            &format!("kernel rejected NUMA node {} as preferred node", node),
        );
    }
    Some(node)
}
