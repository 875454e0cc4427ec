//! Deterministic in-process device runtime.
//!
//! Every stream owns a virtual clock. A copy advances the clock of its stream by
//! `bytes / bandwidth`, an event record stamps the current clock value. Results
//! therefore depend only on the configuration, which makes runs repeatable and
//! lets the orchestration be tested on machines without accelerators.
//!
//! The runtime is deliberately strict: it rejects stream and event operations
//! addressed to the wrong device, copies between buffers placed on the wrong
//! devices, peer copies without enabled peer access, and elapsed-time queries
//! on unrecorded events or on devices that were not synchronized after the
//! event was queued. Error codes match the HIP runtime.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::backend::{
    CopyKind, CopyRequest, DeviceId, DevicePtr, DeviceProperties, DeviceRuntime, EventId,
    PciBusId, StreamId, PEER_ACCESS_ALREADY_ENABLED,
};
use crate::error::{HitsError, Result};

const INVALID_VALUE: i32 = 1;
const OUT_OF_MEMORY: i32 = 2;
const INVALID_DEVICE: i32 = 101;
const PEER_ACCESS_UNSUPPORTED: i32 = 217;
const INVALID_HANDLE: i32 = 400;
const NOT_READY: i32 = 600;
const PEER_ACCESS_NOT_ENABLED: i32 = 705;

// Outside the user-space address range so pageable host buffers never alias
const DEVICE_BASE: usize = 0x4000_0000_0000_0000;
const PINNED_BASE: usize = 0x5000_0000_0000_0000;
const ALLOC_ALIGN: usize = 1 << 21;

/// Bandwidth model of the simulated interconnect, in GB/s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkModel {
    /// Host to device over pinned memory
    pub host_to_device_gbps: f64,
    /// Device to host over pinned memory
    pub device_to_host_gbps: f64,
    /// Device to device over a peer link
    pub peer_gbps: f64,
    /// Fraction of pinned bandwidth reached with pageable host memory
    pub pageable_factor: f64,
}

impl Default for LinkModel {
    fn default() -> Self {
        Self {
            host_to_device_gbps: 25.0,
            device_to_host_gbps: 26.0,
            peer_gbps: 50.0,
            pageable_factor: 0.5,
        }
    }
}

/// One command queued on a simulated stream, in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    /// Event timestamp record
    Record(EventId),
    /// Asynchronous copy
    Copy {
        /// Copy variant
        kind: CopyKind,
        /// Bytes copied
        bytes: usize,
    },
}

#[derive(Debug)]
struct SimDevice {
    props: DeviceProperties,
    capacity: u64,
    used: u64,
    peers: HashSet<DeviceId>,
    enabled_peers: HashSet<DeviceId>,
    synchronizations: u64,
}

#[derive(Debug)]
struct SimStream {
    device: DeviceId,
    clock_ns: f64,
    pending: bool,
    log: Vec<StreamCommand>,
}

#[derive(Debug)]
struct SimEvent {
    device: DeviceId,
    stamp: Option<(StreamId, f64)>,
}

#[derive(Debug, Clone, Copy)]
enum Placement {
    Device(DeviceId),
    PinnedHost,
}

#[derive(Debug, Default)]
struct SimState {
    devices: Vec<SimDevice>,
    streams: Vec<SimStream>,
    events: Vec<SimEvent>,
    allocations: HashMap<usize, (Placement, usize)>,
    next_device_addr: usize,
    next_pinned_addr: usize,
}

impl SimState {
    fn device(&mut self, device: DeviceId, call: &'static str) -> Result<&mut SimDevice> {
        self.devices
            .get_mut(device.0 as usize)
            .ok_or_else(|| HitsError::runtime(call, INVALID_DEVICE, "invalid device ordinal"))
    }

    fn stream(
        &mut self,
        device: DeviceId,
        stream: StreamId,
        call: &'static str,
    ) -> Result<&mut SimStream> {
        let entry = self
            .streams
            .get_mut(stream.0 as usize)
            .ok_or_else(|| HitsError::runtime(call, INVALID_HANDLE, "invalid stream handle"))?;
        if entry.device != device {
            return Err(HitsError::runtime(
                call,
                INVALID_DEVICE,
                format!(
                    "stream belongs to device {} but device {} was selected",
                    entry.device, device
                ),
            ));
        }
        Ok(entry)
    }

    /// Find the allocation containing `addr..addr + bytes`.
    fn placement_of(&self, addr: usize, bytes: usize) -> Option<Placement> {
        self.allocations
            .iter()
            .find(|(base, (_, len))| addr >= **base && addr + bytes <= **base + *len)
            .map(|(_, (placement, _))| *placement)
    }
}

/// Deterministic device runtime for tests, benchmarks and dry runs.
///
/// # Examples
///
/// ```rust
/// use hits::backend::simulated::SimulatedRuntime;
/// use hits::backend::{DeviceId, DeviceRuntime};
///
/// let runtime = SimulatedRuntime::builder().devices(2).peer_link(0, 1).build();
/// assert_eq!(runtime.device_count().unwrap(), 2);
/// assert!(runtime.can_access_peer(DeviceId(0), DeviceId(1)).unwrap());
/// ```
#[derive(Debug)]
pub struct SimulatedRuntime {
    links: LinkModel,
    state: Mutex<SimState>,
}

impl SimulatedRuntime {
    /// Runtime with `devices` devices, default links and no peer access.
    pub fn new(devices: u32) -> Self {
        Self::builder().devices(devices).build()
    }

    /// Runtime with `devices` devices where every pair has peer access.
    pub fn fully_connected(devices: u32) -> Self {
        let mut builder = Self::builder().devices(devices);
        for a in 0..devices {
            for b in (a + 1)..devices {
                builder = builder.peer_link(a, b);
            }
        }
        builder.build()
    }

    /// Start configuring a simulated runtime.
    pub fn builder() -> SimulatedRuntimeBuilder {
        SimulatedRuntimeBuilder::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| HitsError::runtime("simulated", INVALID_VALUE, "runtime state poisoned"))
    }

    /// Commands queued on `stream` so far, in issue order.
    pub fn stream_log(&self, stream: StreamId) -> Vec<StreamCommand> {
        self.state()
            .ok()
            .and_then(|s| s.streams.get(stream.0 as usize).map(|s| s.log.clone()))
            .unwrap_or_default()
    }

    /// Number of pinned host allocations not yet freed.
    pub fn pinned_allocations(&self) -> usize {
        self.state()
            .map(|s| {
                s.allocations
                    .values()
                    .filter(|(p, _)| matches!(p, Placement::PinnedHost))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Bytes currently allocated on `device`.
    pub fn device_memory_used(&self, device: DeviceId) -> u64 {
        self.state()
            .ok()
            .and_then(|s| s.devices.get(device.0 as usize).map(|d| d.used))
            .unwrap_or(0)
    }

    /// Number of completed synchronizations of `device`.
    pub fn synchronizations(&self, device: DeviceId) -> u64 {
        self.state()
            .ok()
            .and_then(|s| s.devices.get(device.0 as usize).map(|d| d.synchronizations))
            .unwrap_or(0)
    }

    /// Whether peer access from `device` to `peer` has been enabled.
    pub fn peer_enabled(&self, device: DeviceId, peer: DeviceId) -> bool {
        self.state()
            .ok()
            .and_then(|s| {
                s.devices
                    .get(device.0 as usize)
                    .map(|d| d.enabled_peers.contains(&peer))
            })
            .unwrap_or(false)
    }

    fn copy_rate(&self, state: &SimState, copy: &CopyRequest) -> Result<f64> {
        let invalid = |reason: String| HitsError::runtime("hipMemcpyAsync", INVALID_VALUE, reason);
        let dst = state.placement_of(copy.dst, copy.bytes);
        let src = state.placement_of(copy.src, copy.bytes);

        match copy.kind {
            CopyKind::HostToDevice => {
                if !matches!(dst, Some(Placement::Device(_))) {
                    return Err(invalid("destination is not device memory".into()));
                }
                Ok(match src {
                    Some(Placement::PinnedHost) => self.links.host_to_device_gbps,
                    None => self.links.host_to_device_gbps * self.links.pageable_factor,
                    Some(Placement::Device(_)) => {
                        return Err(invalid("source is device memory".into()))
                    }
                })
            }
            CopyKind::DeviceToHost => {
                if !matches!(src, Some(Placement::Device(_))) {
                    return Err(invalid("source is not device memory".into()));
                }
                Ok(match dst {
                    Some(Placement::PinnedHost) => self.links.device_to_host_gbps,
                    None => self.links.device_to_host_gbps * self.links.pageable_factor,
                    Some(Placement::Device(_)) => {
                        return Err(invalid("destination is device memory".into()))
                    }
                })
            }
            CopyKind::Peer {
                dst_device,
                src_device,
            } => {
                let placed = |p: Option<Placement>, d: DeviceId| {
                    matches!(p, Some(Placement::Device(owner)) if owner == d)
                };
                if !placed(dst, dst_device) {
                    return Err(invalid(format!("destination is not on device {}", dst_device)));
                }
                if !placed(src, src_device) {
                    return Err(invalid(format!("source is not on device {}", src_device)));
                }
                let enabled = state
                    .devices
                    .get(dst_device.0 as usize)
                    .map(|d| d.enabled_peers.contains(&src_device))
                    .unwrap_or(false);
                if !enabled {
                    return Err(HitsError::runtime(
                        "hipMemcpyPeerAsync",
                        PEER_ACCESS_NOT_ENABLED,
                        "peer access has not been enabled",
                    ));
                }
                Ok(self.links.peer_gbps)
            }
        }
    }
}

impl DeviceRuntime for SimulatedRuntime {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn device_count(&self) -> Result<u32> {
        Ok(self.state()?.devices.len() as u32)
    }

    fn device_properties(&self, device: DeviceId) -> Result<DeviceProperties> {
        let mut state = self.state()?;
        Ok(state.device(device, "hipGetDeviceProperties")?.props.clone())
    }

    fn create_stream(&self, device: DeviceId) -> Result<StreamId> {
        let mut state = self.state()?;
        state.device(device, "hipStreamCreateWithFlags")?;
        state.streams.push(SimStream {
            device,
            clock_ns: 0.0,
            pending: false,
            log: Vec::new(),
        });
        Ok(StreamId(state.streams.len() as u32 - 1))
    }

    fn create_event(&self, device: DeviceId) -> Result<EventId> {
        let mut state = self.state()?;
        state.device(device, "hipEventCreate")?;
        state.events.push(SimEvent {
            device,
            stamp: None,
        });
        Ok(EventId(state.events.len() as u32 - 1))
    }

    fn device_alloc(&self, device: DeviceId, bytes: usize) -> Result<DevicePtr> {
        let mut state = self.state()?;
        let entry = state.device(device, "hipMalloc")?;
        if entry.used + bytes as u64 > entry.capacity {
            return Err(HitsError::runtime("hipMalloc", OUT_OF_MEMORY, "out of memory"));
        }
        entry.used += bytes as u64;

        let addr = DEVICE_BASE + state.next_device_addr;
        state.next_device_addr += bytes.div_ceil(ALLOC_ALIGN).max(1) * ALLOC_ALIGN;
        state
            .allocations
            .insert(addr, (Placement::Device(device), bytes));
        Ok(DevicePtr(addr))
    }

    fn host_alloc_pinned(&self, device: DeviceId, bytes: usize) -> Result<DevicePtr> {
        let mut state = self.state()?;
        state.device(device, "hipHostMalloc")?;
        let addr = PINNED_BASE + state.next_pinned_addr;
        state.next_pinned_addr += bytes.div_ceil(ALLOC_ALIGN).max(1) * ALLOC_ALIGN;
        state.allocations.insert(addr, (Placement::PinnedHost, bytes));
        Ok(DevicePtr(addr))
    }

    fn host_free_pinned(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state()?;
        match state.allocations.get(&ptr.0) {
            Some((Placement::PinnedHost, _)) => {
                state.allocations.remove(&ptr.0);
                Ok(())
            }
            _ => Err(HitsError::runtime(
                "hipHostFree",
                INVALID_VALUE,
                "pointer is not a pinned host allocation",
            )),
        }
    }

    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool> {
        let mut state = self.state()?;
        state.device(peer, "hipDeviceCanAccessPeer")?;
        Ok(state
            .device(device, "hipDeviceCanAccessPeer")?
            .peers
            .contains(&peer))
    }

    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<()> {
        let mut state = self.state()?;
        state.device(peer, "hipDeviceEnablePeerAccess")?;
        let entry = state.device(device, "hipDeviceEnablePeerAccess")?;
        if !entry.peers.contains(&peer) {
            return Err(HitsError::runtime(
                "hipDeviceEnablePeerAccess",
                PEER_ACCESS_UNSUPPORTED,
                "peer access is not supported between these devices",
            ));
        }
        if !entry.enabled_peers.insert(peer) {
            return Err(HitsError::runtime(
                "hipDeviceEnablePeerAccess",
                PEER_ACCESS_ALREADY_ENABLED,
                "peer access is already enabled",
            ));
        }
        Ok(())
    }

    fn copy_async(&self, device: DeviceId, stream: StreamId, copy: CopyRequest) -> Result<()> {
        let mut state = self.state()?;
        let rate = self.copy_rate(&state, &copy)?;
        let entry = state.stream(device, stream, "hipMemcpyAsync")?;
        entry.clock_ns += copy.bytes as f64 / rate;
        entry.pending = true;
        entry.log.push(StreamCommand::Copy {
            kind: copy.kind,
            bytes: copy.bytes,
        });
        Ok(())
    }

    fn record_event(&self, device: DeviceId, event: EventId, stream: StreamId) -> Result<()> {
        let mut state = self.state()?;
        let owner = state
            .events
            .get(event.0 as usize)
            .map(|e| e.device)
            .ok_or_else(|| {
                HitsError::runtime("hipEventRecord", INVALID_HANDLE, "invalid event handle")
            })?;
        if owner != device {
            return Err(HitsError::runtime(
                "hipEventRecord",
                INVALID_DEVICE,
                format!("event belongs to device {} but device {} was selected", owner, device),
            ));
        }
        let entry = state.stream(device, stream, "hipEventRecord")?;
        let clock = entry.clock_ns;
        entry.pending = true;
        entry.log.push(StreamCommand::Record(event));
        state.events[event.0 as usize].stamp = Some((stream, clock));
        Ok(())
    }

    fn synchronize(&self, device: DeviceId) -> Result<()> {
        let mut state = self.state()?;
        state.device(device, "hipDeviceSynchronize")?.synchronizations += 1;
        state
            .streams
            .iter_mut()
            .filter(|s| s.device == device)
            .for_each(|s| s.pending = false);
        Ok(())
    }

    fn elapsed_ms(&self, device: DeviceId, start: EventId, stop: EventId) -> Result<f32> {
        let state = self.state()?;
        let stamp = |event: EventId| -> Result<(StreamId, f64)> {
            let entry = state.events.get(event.0 as usize).ok_or_else(|| {
                HitsError::runtime("hipEventElapsedTime", INVALID_HANDLE, "invalid event handle")
            })?;
            if entry.device != device {
                return Err(HitsError::runtime(
                    "hipEventElapsedTime",
                    INVALID_DEVICE,
                    "event belongs to another device",
                ));
            }
            entry.stamp.ok_or_else(|| {
                HitsError::runtime(
                    "hipEventElapsedTime",
                    INVALID_HANDLE,
                    "event has not been recorded",
                )
            })
        };
        let (start_stream, start_ns) = stamp(start)?;
        let (stop_stream, stop_ns) = stamp(stop)?;

        for s in [start_stream, stop_stream] {
            if state.streams[s.0 as usize].pending {
                return Err(HitsError::runtime(
                    "hipEventElapsedTime",
                    NOT_READY,
                    "event has not completed",
                ));
            }
        }
        Ok(((stop_ns - start_ns) / 1e6) as f32)
    }
}

/// Builder for [`SimulatedRuntime`].
#[derive(Debug, Clone)]
pub struct SimulatedRuntimeBuilder {
    devices: u32,
    links: LinkModel,
    memory: u64,
    peers: Vec<(u32, u32)>,
    buses: HashMap<u32, PciBusId>,
}

impl Default for SimulatedRuntimeBuilder {
    fn default() -> Self {
        Self {
            devices: 1,
            links: LinkModel::default(),
            memory: 64 << 30,
            peers: Vec::new(),
            buses: HashMap::new(),
        }
    }
}

impl SimulatedRuntimeBuilder {
    /// Number of devices.
    pub fn devices(mut self, devices: u32) -> Self {
        self.devices = devices;
        self
    }

    /// Bandwidth model.
    pub fn links(mut self, links: LinkModel) -> Self {
        self.links = links;
        self
    }

    /// Memory capacity of every device in bytes.
    pub fn device_memory(mut self, bytes: u64) -> Self {
        self.memory = bytes;
        self
    }

    /// Allow peer access in both directions between `a` and `b`.
    pub fn peer_link(mut self, a: u32, b: u32) -> Self {
        self.peers.push((a, b));
        self
    }

    /// Override the PCI location of a device.
    pub fn bus(mut self, device: u32, pci: PciBusId) -> Self {
        self.buses.insert(device, pci);
        self
    }

    /// Build the runtime.
    pub fn build(self) -> SimulatedRuntime {
        let mut devices: Vec<SimDevice> = (0..self.devices)
            .map(|i| SimDevice {
                props: DeviceProperties {
                    name: format!("Simulated Device {}", i),
                    pci: self.buses.get(&i).copied().unwrap_or(PciBusId {
                        domain: 0,
                        bus: 0x03u8.wrapping_add((i as u8).wrapping_mul(0x20)),
                        device: 0,
                    }),
                    total_memory: self.memory,
                },
                capacity: self.memory,
                used: 0,
                peers: HashSet::new(),
                enabled_peers: HashSet::new(),
                synchronizations: 0,
            })
            .collect();

        for (a, b) in self.peers {
            if a == b {
                continue;
            }
            if let Some(d) = devices.get_mut(a as usize) {
                d.peers.insert(DeviceId(b));
            }
            if let Some(d) = devices.get_mut(b as usize) {
                d.peers.insert(DeviceId(a));
            }
        }

        SimulatedRuntime {
            links: self.links,
            state: Mutex::new(SimState {
                devices,
                ..Default::default()
            }),
        }
    }
}
