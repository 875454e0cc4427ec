//! HIP runtime backend.
//!
//! Thin FFI layer over `libamdhip64`. Streams and events are kept in handle
//! tables so the rest of the crate only sees plain [`StreamId`]/[`EventId`]
//! values. Every device-targeted call selects its device first.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use crate::backend::{
    CopyKind, CopyRequest, DeviceId, DevicePtr, DeviceProperties, DeviceRuntime, EventId,
    PciBusId, StreamId,
};
use crate::error::{HitsError, Result};

type HipError = c_int;
type HipStream = *mut c_void;
type HipEvent = *mut c_void;

const HIP_SUCCESS: HipError = 0;
const HIP_STREAM_NON_BLOCKING: c_uint = 0x1;
const HIP_HOST_MALLOC_DEFAULT: c_uint = 0x0;
const HIP_HOST_MALLOC_NUMA_USER: c_uint = 0x2000_0000;
const HIP_MEMCPY_HOST_TO_DEVICE: c_int = 1;
const HIP_MEMCPY_DEVICE_TO_HOST: c_int = 2;

#[link(name = "amdhip64")]
extern "C" {
    fn hipGetErrorString(error: HipError) -> *const c_char;
    fn hipGetDeviceCount(count: *mut c_int) -> HipError;
    fn hipSetDevice(device: c_int) -> HipError;
    fn hipDeviceGetName(name: *mut c_char, len: c_int, device: c_int) -> HipError;
    fn hipDeviceGetPCIBusId(bus_id: *mut c_char, len: c_int, device: c_int) -> HipError;
    fn hipDeviceTotalMem(bytes: *mut usize, device: c_int) -> HipError;
    fn hipStreamCreateWithFlags(stream: *mut HipStream, flags: c_uint) -> HipError;
    fn hipEventCreate(event: *mut HipEvent) -> HipError;
    fn hipEventRecord(event: HipEvent, stream: HipStream) -> HipError;
    fn hipEventElapsedTime(ms: *mut f32, start: HipEvent, stop: HipEvent) -> HipError;
    fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> HipError;
    fn hipHostMalloc(ptr: *mut *mut c_void, size: usize, flags: c_uint) -> HipError;
    fn hipHostFree(ptr: *mut c_void) -> HipError;
    fn hipDeviceCanAccessPeer(can_access: *mut c_int, device: c_int, peer: c_int) -> HipError;
    fn hipDeviceEnablePeerAccess(peer: c_int, flags: c_uint) -> HipError;
    fn hipMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        size: usize,
        kind: c_int,
        stream: HipStream,
    ) -> HipError;
    fn hipMemcpyPeerAsync(
        dst: *mut c_void,
        dst_device: c_int,
        src: *const c_void,
        src_device: c_int,
        size: usize,
        stream: HipStream,
    ) -> HipError;
    fn hipDeviceSynchronize() -> HipError;
}

/// Convert a HIP status into a crate result.
fn check(call: &'static str, code: HipError) -> Result<()> {
    if code == HIP_SUCCESS {
        return Ok(());
    }
    // SAFETY: hipGetErrorString returns a static NUL-terminated string for any code.
    let message = unsafe {
        let text = hipGetErrorString(code);
        if text.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(text).to_string_lossy().into_owned()
        }
    };
    Err(HitsError::runtime(call, code, message))
}

fn ordinal(device: DeviceId) -> c_int {
    device.0 as c_int
}

/// Raw runtime handle stored in the handle tables.
struct RawHandle(*mut c_void);

// SAFETY: HIP stream and event handles may be used from any host thread.
unsafe impl Send for RawHandle {}

#[derive(Default)]
struct Handles {
    streams: Vec<RawHandle>,
    events: Vec<RawHandle>,
}

/// Device runtime backed by the HIP runtime library.
pub struct HipRuntime {
    handles: Mutex<Handles>,
}

impl HipRuntime {
    /// Initialize the runtime by querying the device count.
    pub fn new() -> Result<Self> {
        let mut count: c_int = 0;
        // SAFETY: count is a valid out pointer.
        check("hipGetDeviceCount", unsafe { hipGetDeviceCount(&mut count) })?;
        Ok(Self {
            handles: Mutex::new(Handles::default()),
        })
    }

    fn handles(&self) -> Result<MutexGuard<'_, Handles>> {
        self.handles
            .lock()
            .map_err(|_| HitsError::runtime("hip", 1, "handle table poisoned"))
    }

    fn select(&self, device: DeviceId) -> Result<()> {
        // SAFETY: plain call; invalid ordinals are reported through the status.
        check("hipSetDevice", unsafe { hipSetDevice(ordinal(device)) })
    }

    fn stream(&self, stream: StreamId) -> Result<HipStream> {
        self.handles()?
            .streams
            .get(stream.0 as usize)
            .map(|h| h.0)
            .ok_or_else(|| HitsError::runtime("hipStream", 400, "unknown stream handle"))
    }

    fn event(&self, event: EventId) -> Result<HipEvent> {
        self.handles()?
            .events
            .get(event.0 as usize)
            .map(|h| h.0)
            .ok_or_else(|| HitsError::runtime("hipEvent", 400, "unknown event handle"))
    }
}

impl DeviceRuntime for HipRuntime {
    fn name(&self) -> &'static str {
        "hip"
    }

    fn device_count(&self) -> Result<u32> {
        let mut count: c_int = 0;
        // SAFETY: count is a valid out pointer.
        check("hipGetDeviceCount", unsafe { hipGetDeviceCount(&mut count) })?;
        Ok(count.max(0) as u32)
    }

    fn device_properties(&self, device: DeviceId) -> Result<DeviceProperties> {
        let mut name = [0 as c_char; 256];
        let mut bus = [0 as c_char; 64];
        let mut total: usize = 0;

        // SAFETY: buffers are valid for the lengths passed; HIP NUL-terminates them.
        unsafe {
            check(
                "hipDeviceGetName",
                hipDeviceGetName(name.as_mut_ptr(), name.len() as c_int, ordinal(device)),
            )?;
            check(
                "hipDeviceGetPCIBusId",
                hipDeviceGetPCIBusId(bus.as_mut_ptr(), bus.len() as c_int, ordinal(device)),
            )?;
            check("hipDeviceTotalMem", hipDeviceTotalMem(&mut total, ordinal(device)))?;
        }

        // SAFETY: both arrays were NUL-terminated by the runtime.
        let name = unsafe { CStr::from_ptr(name.as_ptr()) }.to_string_lossy().into_owned();
        let bus = unsafe { CStr::from_ptr(bus.as_ptr()) }.to_string_lossy().into_owned();
        let pci = PciBusId::parse(&bus).ok_or_else(|| {
            HitsError::runtime("hipDeviceGetPCIBusId", 1, format!("unparsable bus id {:?}", bus))
        })?;

        Ok(DeviceProperties {
            name,
            pci,
            total_memory: total as u64,
        })
    }

    fn create_stream(&self, device: DeviceId) -> Result<StreamId> {
        self.select(device)?;
        let mut stream: HipStream = ptr::null_mut();
        // SAFETY: stream is a valid out pointer.
        check("hipStreamCreateWithFlags", unsafe {
            hipStreamCreateWithFlags(&mut stream, HIP_STREAM_NON_BLOCKING)
        })?;
        let mut handles = self.handles()?;
        handles.streams.push(RawHandle(stream));
        Ok(StreamId(handles.streams.len() as u32 - 1))
    }

    fn create_event(&self, device: DeviceId) -> Result<EventId> {
        self.select(device)?;
        let mut event: HipEvent = ptr::null_mut();
        // SAFETY: event is a valid out pointer.
        check("hipEventCreate", unsafe { hipEventCreate(&mut event) })?;
        let mut handles = self.handles()?;
        handles.events.push(RawHandle(event));
        Ok(EventId(handles.events.len() as u32 - 1))
    }

    fn device_alloc(&self, device: DeviceId, bytes: usize) -> Result<DevicePtr> {
        self.select(device)?;
        let mut ptr: *mut c_void = ptr::null_mut();
        // SAFETY: ptr is a valid out pointer.
        check("hipMalloc", unsafe { hipMalloc(&mut ptr, bytes) })?;
        Ok(DevicePtr(ptr as usize))
    }

    fn host_alloc_pinned(&self, device: DeviceId, bytes: usize) -> Result<DevicePtr> {
        self.select(device)?;
        let mut ptr: *mut c_void = ptr::null_mut();
        // SAFETY: ptr is a valid out pointer. NumaUser makes HIP follow the
        // calling thread's memory policy.
        check("hipHostMalloc", unsafe {
            hipHostMalloc(
                &mut ptr,
                bytes,
                HIP_HOST_MALLOC_DEFAULT | HIP_HOST_MALLOC_NUMA_USER,
            )
        })?;
        Ok(DevicePtr(ptr as usize))
    }

    fn host_free_pinned(&self, ptr: DevicePtr) -> Result<()> {
        // SAFETY: ptr came from hipHostMalloc and is freed once.
        check("hipHostFree", unsafe { hipHostFree(ptr.0 as *mut c_void) })
    }

    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool> {
        let mut access: c_int = 0;
        // SAFETY: access is a valid out pointer.
        check("hipDeviceCanAccessPeer", unsafe {
            hipDeviceCanAccessPeer(&mut access, ordinal(device), ordinal(peer))
        })?;
        Ok(access != 0)
    }

    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> Result<()> {
        self.select(device)?;
        // SAFETY: plain call on the selected device.
        check("hipDeviceEnablePeerAccess", unsafe {
            hipDeviceEnablePeerAccess(ordinal(peer), 0)
        })
    }

    fn copy_async(&self, device: DeviceId, stream: StreamId, copy: CopyRequest) -> Result<()> {
        self.select(device)?;
        let stream = self.stream(stream)?;
        let dst = copy.dst as *mut c_void;
        let src = copy.src as *const c_void;

        // SAFETY: both addresses come from allocations of at least `bytes`
        // owned by a live transfer descriptor.
        match copy.kind {
            CopyKind::HostToDevice => check("hipMemcpyAsync", unsafe {
                hipMemcpyAsync(dst, src, copy.bytes, HIP_MEMCPY_HOST_TO_DEVICE, stream)
            }),
            CopyKind::DeviceToHost => check("hipMemcpyAsync", unsafe {
                hipMemcpyAsync(dst, src, copy.bytes, HIP_MEMCPY_DEVICE_TO_HOST, stream)
            }),
            CopyKind::Peer {
                dst_device,
                src_device,
            } => check("hipMemcpyPeerAsync", unsafe {
                hipMemcpyPeerAsync(
                    dst,
                    ordinal(dst_device),
                    src,
                    ordinal(src_device),
                    copy.bytes,
                    stream,
                )
            }),
        }
    }

    fn record_event(&self, device: DeviceId, event: EventId, stream: StreamId) -> Result<()> {
        self.select(device)?;
        let event = self.event(event)?;
        let stream = self.stream(stream)?;
        // SAFETY: both handles were created on this device and are never destroyed.
        check("hipEventRecord", unsafe { hipEventRecord(event, stream) })
    }

    fn synchronize(&self, device: DeviceId) -> Result<()> {
        self.select(device)?;
        // SAFETY: plain blocking call on the selected device.
        check("hipDeviceSynchronize", unsafe { hipDeviceSynchronize() })
    }

    fn elapsed_ms(&self, device: DeviceId, start: EventId, stop: EventId) -> Result<f32> {
        self.select(device)?;
        let start = self.event(start)?;
        let stop = self.event(stop)?;
        let mut ms: f32 = 0.0;
        // SAFETY: ms is a valid out pointer; events are live.
        check("hipEventElapsedTime", unsafe {
            hipEventElapsedTime(&mut ms, start, stop)
        })?;
        Ok(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_ok() {
        assert!(check("hipSetDevice", HIP_SUCCESS).is_ok());
    }

    #[test]
    fn failure_keeps_code() {
        let err = check("hipMalloc", 2).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().starts_with("hipMalloc failed"));
    }
}
