//! Page-aligned buffers for RDMA registration
//!
//! The buffer is handed to the transport as a raw region and may be
//! changed by the network behind the program's back, so single-byte
//! accessors go through volatile reads and writes.

use crate::error::{ProbeError, Result};
use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;

/// Alignment of every probe buffer
pub const PAGE_SIZE: usize = 4096;

/// Heap buffer registered with the transport for the lifetime of an endpoint
pub struct ProbeBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    locked: bool,
}

// SAFETY: the buffer owns its allocation exclusively.
unsafe impl Send for ProbeBuffer {}

impl ProbeBuffer {
    /// Allocate `size` zeroed bytes aligned to [`PAGE_SIZE`].
    pub fn zeroed(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(ProbeError::InvalidConfig("buffer size must be non-zero".to_string()));
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| ProbeError::InvalidConfig(format!("buffer size {}: {}", size, e)))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| ProbeError::ResourceFailed {
            context: "buffer allocation",
            source: io::Error::new(io::ErrorKind::OutOfMemory, format!("{} bytes", size)),
        })?;
        Ok(Self {
            ptr,
            layout,
            locked: false,
        })
    }

    /// Allocate a buffer where the `i`-th `cell_size` cell holds the byte `i as u8`.
    ///
    /// A trailing partial cell continues the pattern.
    pub fn patterned(size: usize, cell_size: usize) -> Result<Self> {
        let mut buffer = Self::zeroed(size)?;
        let cell_size = cell_size.max(1);
        for (i, cell) in buffer.as_mut_slice().chunks_mut(cell_size).enumerate() {
            cell.fill(i as u8);
        }
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Virtual address of the first byte, as advertised to the peer
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Keep the pages resident so the device never sees them swapped out.
    pub fn lock(&mut self) -> io::Result<()> {
        if self.locked {
            return Ok(());
        }
        // SAFETY: the range is a live allocation owned by self.
        if unsafe { libc::mlock(self.ptr.as_ptr().cast(), self.len()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        self.locked = true;
        Ok(())
    }

    /// Whether `[offset, offset + len)` lies inside the buffer
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len())
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if !self.contains(offset, len) {
            return Err(ProbeError::OutOfBounds {
                offset,
                len,
                size: self.len(),
            });
        }
        Ok(())
    }

    /// Volatile load of the byte at `offset`
    pub fn byte(&self, offset: usize) -> Result<u8> {
        self.check(offset, 1)?;
        // SAFETY: offset is in bounds.
        Ok(unsafe { self.ptr.as_ptr().add(offset).read_volatile() })
    }

    /// Volatile store of the byte at `offset`
    pub fn set_byte(&mut self, offset: usize, value: u8) -> Result<()> {
        self.check(offset, 1)?;
        // SAFETY: offset is in bounds.
        unsafe { self.ptr.as_ptr().add(offset).write_volatile(value) };
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialised bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for ProbeBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with the same layout.
        unsafe {
            if self.locked {
                libc::munlock(self.ptr.as_ptr().cast(), self.len());
            }
            alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl std::fmt::Debug for ProbeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_alignment() {
        let buffer = ProbeBuffer::zeroed(100).unwrap();
        assert_eq!(buffer.addr() % PAGE_SIZE as u64, 0);
        assert_eq!(buffer.len(), 100);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_out_of_bounds() {
        let mut buffer = ProbeBuffer::zeroed(16).unwrap();
        assert!(matches!(
            buffer.set_byte(16, 1),
            Err(ProbeError::OutOfBounds { offset: 16, len: 1, size: 16 })
        ));
        assert!(!buffer.contains(10, 8));
        assert!(buffer.contains(8, 8));
        assert!(buffer.byte(usize::MAX).is_err());
        assert!(ProbeBuffer::zeroed(0).is_err());
    }

    #[test]
    fn test_patterned_cells() {
        let buffer = ProbeBuffer::patterned(8 * 300, 8).unwrap();
        assert_eq!(&buffer.as_slice()[..8], &[0u8; 8]);
        assert_eq!(&buffer.as_slice()[8..16], &[1u8; 8]);
        // cell index wraps at 256
        assert_eq!(buffer.byte(8 * 257).unwrap(), 1);
    }

    #[test]
    fn test_lock_is_idempotent() {
        let mut buffer = ProbeBuffer::zeroed(PAGE_SIZE).unwrap();
        // RLIMIT_MEMLOCK may forbid locking in the test environment
        if buffer.lock().is_ok() {
            buffer.lock().unwrap();
        }
    }

    #[test]
    fn test_volatile_byte() {
        let mut buffer = ProbeBuffer::zeroed(8).unwrap();
        buffer.set_byte(3, 0xaa).unwrap();
        assert_eq!(buffer.byte(3).unwrap(), 0xaa);
        assert_eq!(buffer.as_slice()[3], 0xaa);
    }
}
