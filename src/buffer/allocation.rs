//! Page-aligned allocation for pageable host buffers.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::ptr::NonNull;

use crate::error::{HitsError, Result};

/// Page size assumed for alignment and first-touch.
pub const PAGE_SIZE: usize = 4096;

/// Zero-initialized, page-aligned heap buffer.
///
/// Owns its allocation and frees it with the same layout on drop.
#[derive(Debug)]
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
// SAFETY: no interior mutability is exposed through shared references.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `size` bytes aligned to [`PAGE_SIZE`].
    ///
    /// # Errors
    ///
    /// Returns an `OutOfMemory` I/O error when the allocator fails, and
    /// `InvalidInput` for a zero or unrepresentable size.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(HitsError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "host buffer size must be greater than 0",
            )));
        }

        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| HitsError::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            HitsError::Io(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("failed to allocate {} bytes of host memory", size),
            ))
        })?;

        Ok(Self { ptr, layout })
    }

    /// Write one byte per page so the kernel places every page now.
    ///
    /// Placement follows the calling thread's memory policy at fault time.
    pub fn touch_pages(&mut self) {
        for offset in (0..self.len()).step_by(PAGE_SIZE) {
            // SAFETY: offset < len and the buffer is exclusively borrowed.
            unsafe { self.ptr.as_ptr().add(offset).write_volatile(0) };
        }
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false; zero-sized buffers cannot be constructed.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Start address of the buffer.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
