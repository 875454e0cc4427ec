//! Transfer buffers and host placement policy.
//!
//! A transfer buffer lives in one of three places: device memory, pinned host
//! memory handed out by the device runtime, or plain pageable host memory.
//! Host buffers can additionally be placed on the NUMA node closest to the
//! device they exchange data with.

use crate::backend::{DeviceId, DevicePtr, DeviceRuntime};
use crate::config::AllocFlags;
use crate::error::{HitsError, Result};

pub mod allocation;
pub mod numa;

pub use allocation::AlignedBuffer;
pub use numa::{prefer_node, reset_node_preference, NumaTopology};

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Memory of the given device
    Device(DeviceId),
    /// Pinned, device-visible host memory
    PinnedHost,
    /// Pageable host memory
    PageableHost,
}

/// Source or destination buffer of a transfer.
///
/// Exclusively owned by its transfer descriptor. The size is fixed at
/// allocation time.
#[derive(Debug)]
pub enum TransferBuffer {
    /// Device memory
    Device {
        /// Owning device
        device: DeviceId,
        /// Device address
        ptr: DevicePtr,
        /// Size in bytes
        len: usize,
    },
    /// Pinned host memory from the device runtime
    Pinned {
        /// Host address
        ptr: DevicePtr,
        /// Size in bytes
        len: usize,
    },
    /// Pageable host memory
    Pageable(AlignedBuffer),
}

impl TransferBuffer {
    /// Allocate `len` bytes on `device`.
    ///
    /// A zero `len` is rejected before the runtime is called.
    pub fn device(runtime: &dyn DeviceRuntime, device: DeviceId, len: usize) -> Result<Self> {
        ensure_non_empty(len)?;
        let ptr = runtime.device_alloc(device, len)?;
        Ok(TransferBuffer::Device { device, ptr, len })
    }

    /// Allocate `len` bytes of host memory for exchanges with `device`.
    ///
    /// Pinned memory comes from the runtime; otherwise a page-aligned heap
    /// buffer is allocated and its pages are touched so they are placed
    /// according to the calling thread's NUMA policy.
    pub fn host(
        runtime: &dyn DeviceRuntime,
        device: DeviceId,
        len: usize,
        flags: AllocFlags,
    ) -> Result<Self> {
        ensure_non_empty(len)?;
        if flags.pinned {
            let ptr = runtime.host_alloc_pinned(device, len)?;
            return Ok(TransferBuffer::Pinned { ptr, len });
        }

        let mut buffer = AlignedBuffer::new(len)?;
        if flags.numa_aware {
            buffer.touch_pages();
        }
        Ok(TransferBuffer::Pageable(buffer))
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        match self {
            TransferBuffer::Device { len, .. } | TransferBuffer::Pinned { len, .. } => *len,
            TransferBuffer::Pageable(buffer) => buffer.len(),
        }
    }

    /// Always false; zero-length buffers are rejected at allocation.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address handed to the runtime for copies.
    pub fn address(&self) -> usize {
        match self {
            TransferBuffer::Device { ptr, .. } | TransferBuffer::Pinned { ptr, .. } => ptr.0,
            TransferBuffer::Pageable(buffer) => buffer.as_ptr() as usize,
        }
    }

    /// Where the buffer lives.
    pub fn placement(&self) -> Placement {
        match self {
            TransferBuffer::Device { device, .. } => Placement::Device(*device),
            TransferBuffer::Pinned { .. } => Placement::PinnedHost,
            TransferBuffer::Pageable(_) => Placement::PageableHost,
        }
    }

    /// Release host-side memory.
    ///
    /// Pinned memory is returned to the runtime and pageable memory is freed.
    /// Device memory is left to process exit.
    pub fn release(self, runtime: &dyn DeviceRuntime) -> Result<()> {
        match self {
            TransferBuffer::Pinned { ptr, .. } => runtime.host_free_pinned(ptr),
            TransferBuffer::Pageable(buffer) => {
                drop(buffer);
                Ok(())
            }
            TransferBuffer::Device { .. } => Ok(()),
        }
    }
}

fn ensure_non_empty(len: usize) -> Result<()> {
    if len == 0 {
        return Err(HitsError::config("size", "must be greater than 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::simulated::SimulatedRuntime;

    #[test]
    fn pinned_host_buffer() {
        let runtime = SimulatedRuntime::new(1);
        let buffer = TransferBuffer::host(&runtime, DeviceId(0), 4096, AllocFlags::default())
            .unwrap();
        assert_eq!(buffer.placement(), Placement::PinnedHost);
        assert_eq!(buffer.len(), 4096);
        assert_eq!(runtime.pinned_allocations(), 1);

        buffer.release(&runtime).unwrap();
        assert_eq!(runtime.pinned_allocations(), 0);
    }

    #[test]
    fn pageable_host_buffer() {
        let runtime = SimulatedRuntime::new(1);
        let flags = AllocFlags {
            numa_aware: true,
            pinned: false,
        };
        let buffer = TransferBuffer::host(&runtime, DeviceId(0), 8192, flags).unwrap();
        assert_eq!(buffer.placement(), Placement::PageableHost);
        assert_eq!(buffer.address() % allocation::PAGE_SIZE, 0);
        assert_eq!(runtime.pinned_allocations(), 0);
        buffer.release(&runtime).unwrap();
    }

    #[test]
    fn device_buffer_is_left_allocated() {
        let runtime = SimulatedRuntime::new(2);
        let buffer = TransferBuffer::device(&runtime, DeviceId(1), 1 << 20).unwrap();
        assert_eq!(buffer.placement(), Placement::Device(DeviceId(1)));
        buffer.release(&runtime).unwrap();
        assert_eq!(runtime.device_memory_used(DeviceId(1)), 1 << 20);
    }

    #[test]
    fn zero_length_buffers_are_rejected() {
        let runtime = SimulatedRuntime::new(1);
        let err = TransferBuffer::device(&runtime, DeviceId(0), 0).unwrap_err();
        assert!(matches!(err, HitsError::InvalidConfig { field: "size", .. }));

        for pinned in [true, false] {
            let flags = AllocFlags {
                numa_aware: false,
                pinned,
            };
            assert!(TransferBuffer::host(&runtime, DeviceId(0), 0, flags).is_err());
        }
        assert_eq!(runtime.device_memory_used(DeviceId(0)), 0);
        assert_eq!(runtime.pinned_allocations(), 0);
    }
}
