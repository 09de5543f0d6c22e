//! Shared anonymous mappings
//!
//! The run state must be visible to process-backed strands after `fork`, so its mutable
//! parts live in `MAP_SHARED | MAP_ANONYMOUS` mappings rather than on the heap. Only
//! types made of atomics (and padding) may be placed there; they are marked with the
//! [`Zeroable`] trait because a fresh mapping is zero-filled and no constructor runs.

use anyhow::{Context, Result};
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64};

/// Types whose all-zero bit pattern is a valid, initialized value
///
/// # Safety
///
/// Implementors must contain no pointers, references or types with drop glue, and a
/// zeroed instance must be valid. Shared access must go through interior mutability
/// that is sound across processes (plain atomics).
pub unsafe trait Zeroable: Sync {}

unsafe impl Zeroable for AtomicU64 {}
unsafe impl Zeroable for AtomicU32 {}
unsafe impl Zeroable for AtomicI32 {}
unsafe impl Zeroable for crate::stats::AlignedCounter {}
unsafe impl Zeroable for crate::stats::StrandCounters {}

/// Fixed-length array of `T` in a shared anonymous mapping
pub struct SharedRegion<T: Zeroable> {
    ptr: NonNull<T>,
    len: usize,
    bytes: usize,
    _marker: PhantomData<T>,
}

// The mapping is only reachable through &T, and T: Sync
unsafe impl<T: Zeroable> Send for SharedRegion<T> {}
unsafe impl<T: Zeroable> Sync for SharedRegion<T> {}

impl<T: Zeroable> SharedRegion<T> {
    /// Map `len` zeroed elements
    pub fn new(len: usize) -> Result<Self> {
        let bytes = std::mem::size_of::<T>()
            .checked_mul(len.max(1))
            .context("Shared region size overflow")?;

        // SAFETY: anonymous mapping, no fd, kernel chooses the address
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to map {} bytes of shared run state", bytes));
        }
        let ptr = NonNull::new(addr as *mut T).context("mmap returned a null mapping")?;

        Ok(Self {
            ptr,
            len,
            bytes,
            _marker: PhantomData,
        })
    }
}

impl<T: Zeroable> Deref for SharedRegion<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: mapping is page aligned, zero-filled and valid for T: Zeroable
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Zeroable> Drop for SharedRegion<T> {
    fn drop(&mut self) {
        // SAFETY: ptr/bytes describe the mapping created in new()
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.bytes);
        }
    }
}

impl<T: Zeroable> std::fmt::Debug for SharedRegion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("len", &self.len)
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_region_is_zeroed_and_writable() {
        let region: SharedRegion<AtomicU64> = SharedRegion::new(16).unwrap();
        assert_eq!(region.len(), 16);
        assert!(region.iter().all(|v| v.load(Ordering::Relaxed) == 0));
        region[3].store(42, Ordering::Relaxed);
        assert_eq!(region[3].load(Ordering::Relaxed), 42);
    }

    #[test]
    fn test_empty_region() {
        let region: SharedRegion<AtomicU32> = SharedRegion::new(0).unwrap();
        assert!(region.is_empty());
    }
}
