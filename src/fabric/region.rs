//! Buffer regions: a block of registered memory, carved into fixed-size
//! buffers, handed out and returned through a lock-free free-list.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crossbeam_queue::ArrayQueue;

use crate::rdma::mr::{Mr, MrSlice, Permission, Slicing};
use crate::rdma::pd::Pd;

use super::error::RegionError;

/// A single fixed-size buffer carved out of a [`Region`].
///
/// Buffers are plain addresses, not borrows: the region's free-list hands
/// them out by value and the in-flight side (an sge in a posted work
/// request) identifies them the same way. A buffer is in exactly one of
/// {free-list, in-flight} at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    /// Start address of the buffer, within the region's registered memory.
    pub address: u64,
    /// Usable length of the buffer, in bytes (the region's `buf_size`).
    pub length: usize,
    /// Local key of the region's memory registration.
    pub local_key: u32,
}

impl Buffer {
    /// View the buffer as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other live reference (Rust or NIC DMA)
    /// into this buffer exists for the duration of the borrow.
    #[inline]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.address as *mut u8, self.length)
    }
}

/// A fixed-capacity free-list of buffer descriptors.
///
/// Kept independent of how the backing memory was registered, so the
/// acquire/release conservation invariant can be exercised directly in
/// tests without a live device.
struct BufferPool {
    free: ArrayQueue<Buffer>,
}

impl BufferPool {
    fn new(buffers: impl IntoIterator<Item = Buffer>, capacity: usize) -> Self {
        let free = ArrayQueue::new(capacity);
        for buf in buffers {
            free.push(buf).expect("free-list sized to buf_count");
        }
        Self { free }
    }

    fn acquire(&self) -> Option<Buffer> {
        self.free.pop()
    }

    /// # Panics
    ///
    /// Panics if the free-list is already at capacity, which would indicate
    /// a buffer was released twice.
    fn release(&self, buf: Buffer) {
        self.free
            .push(buf)
            .expect("released more buffers than were acquired");
    }

    fn remaining(&self) -> usize {
        self.free.len()
    }

    fn capacity(&self) -> usize {
        self.free.capacity()
    }
}

/// Validate `Region::new`'s dimensions and compute the total backing-store
/// size, without touching a device. Split out so the rejection paths are
/// directly testable.
fn validate_dims(buf_count: usize, buf_size: usize, align: usize) -> Result<usize, RegionError> {
    if buf_count == 0 || buf_size == 0 {
        return Err(RegionError::EmptyRegion);
    }
    if align == 0 || !align.is_power_of_two() {
        return Err(RegionError::InvalidAlignment);
    }
    buf_count.checked_mul(buf_size).ok_or(RegionError::EmptyRegion)
}

/// A pool of equal-size buffers backed by one registered memory region.
///
/// The backing store is a raw, custom-aligned allocation (not `Box<[u8]>` or
/// `Vec<u8>`, neither of which can guarantee arbitrary alignment): `Region`
/// owns that allocation directly and registers it as one `Mr`. The `Mr` is
/// declared before the raw pointer/layout so that Rust's field drop order
/// deregisters the memory before the backing store is freed.
pub struct Region {
    mr: Mr<'static>,
    ptr: NonNull<u8>,
    layout: Layout,
    buf_size: usize,
    pool: BufferPool,
    // Keeps the leaked `Pd` clone (and therefore the device context) alive
    // for as long as this region's `Mr` needs it.
    _pd: &'static Pd,
}

// SAFETY: the region's raw pointer is only ever dereferenced through buffers
// that the free-list hands out to exactly one holder at a time.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocate, register, and carve up a new buffer region.
    ///
    /// `buf_count` buffers of `buf_size` bytes each are allocated in one
    /// contiguous, `align`-aligned block and registered as a single `Mr`
    /// with `perm`.
    pub fn new(
        pd: &Pd,
        buf_count: usize,
        buf_size: usize,
        align: usize,
        perm: Permission,
    ) -> Result<Self, RegionError> {
        let total = validate_dims(buf_count, buf_size, align)?;
        let layout = Layout::from_size_align(total, align).map_err(|_| RegionError::EmptyRegion)?;

        // SAFETY: `layout` has nonzero size, checked above.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(std::io::Error::last_os_error)?;

        // `Mr::reg` requires `&'a Pd` and `&'a [u8]` with a shared lifetime `'a`.
        // The real registration handle is independently `Arc`-owned by `Pd`'s
        // inner struct, so leaking a clone to obtain a `'static` reference
        // only extends how long the Rust-level borrow-check token lives, not
        // the underlying device resource's actual lifetime.
        let pd_static: &'static Pd = Box::leak(Box::new(pd.clone()));
        // SAFETY: `ptr`/`total` describe the allocation made above, which
        // outlives the `Mr` (see field order on `Region`).
        let buf: &'static [u8] = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), total) };
        let mr = match Mr::reg(pd_static, buf, perm) {
            Ok(mr) => mr,
            Err(e) => {
                // SAFETY: `raw` was allocated with `layout` above and is not
                // registered, so it's safe to free here.
                unsafe { alloc::dealloc(raw, layout) };
                // SAFETY: never dereferenced again; we leak the allocation's
                // address space only (no backing memory access through it).
                drop(unsafe { Box::from_raw(pd_static as *const Pd as *mut Pd) });
                return Err(e.into());
            }
        };

        let lkey = mr.lkey();
        let buffers = (0..buf_count).map(|i| Buffer {
            address: ptr.as_ptr() as u64 + (i * buf_size) as u64,
            length: buf_size,
            local_key: lkey,
        });
        let pool = BufferPool::new(buffers, buf_count);

        Ok(Self {
            mr,
            ptr,
            layout,
            buf_size,
            pool,
            _pd: pd_static,
        })
    }

    /// Number of bytes in each buffer.
    #[inline]
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Number of buffers currently on the free-list.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.pool.remaining()
    }

    /// Capacity of the region (total buffer count).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Local key of the region's single memory registration.
    #[inline]
    pub fn lkey(&self) -> u32 {
        self.mr.lkey()
    }

    /// Take one buffer off the free-list, if any is available.
    pub fn acquire(&self) -> Option<Buffer> {
        self.pool.acquire()
    }

    /// Return a buffer to the free-list.
    ///
    /// # Panics
    ///
    /// Panics if the free-list is already at capacity, which would indicate
    /// a buffer was released twice.
    pub fn release(&self, buf: Buffer) {
        self.pool.release(buf);
    }

    /// Produce a scatter/gather slice over a buffer previously handed out by
    /// [`Self::acquire`], for use in `Qp::send`/`Qp::recv`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` does not fall within this region's registered memory.
    pub fn slice_of(&self, buf: &Buffer) -> MrSlice<'_> {
        self.mr
            .slice_by_ptr(buf.address as *mut u8, buf.length)
            .expect("buffer address must fall within the region")
    }

    /// Whole-region slice, for tests and diagnostics.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr`/`layout` describe the allocation made in `new`,
        // which outlives this borrow.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // `mr` is dropped first by field declaration order, deregistering
        // before we free the backing allocation below.
        // SAFETY: `ptr`/`layout` describe the allocation made in `new`, and
        // no buffer outlives the region (the free-list and all in-flight
        // buffers are only ever used while the region is alive).
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_buf_count_or_buf_size() {
        assert!(matches!(validate_dims(0, 128, 64), Err(RegionError::EmptyRegion)));
        assert!(matches!(validate_dims(8, 0, 64), Err(RegionError::EmptyRegion)));
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        assert!(matches!(validate_dims(8, 128, 0), Err(RegionError::InvalidAlignment)));
        assert!(matches!(validate_dims(8, 128, 3), Err(RegionError::InvalidAlignment)));
    }

    #[test]
    fn rejects_overflowing_total_size() {
        assert!(matches!(
            validate_dims(usize::MAX, 2, 8),
            Err(RegionError::EmptyRegion)
        ));
    }

    #[test]
    fn accepts_valid_dims_and_computes_total() {
        assert_eq!(validate_dims(8, 128, 64).unwrap(), 1024);
    }

    fn synthetic_buffers(count: usize, buf_size: usize) -> Vec<Buffer> {
        (0..count)
            .map(|i| Buffer {
                address: (i * buf_size) as u64,
                length: buf_size,
                local_key: 1,
            })
            .collect()
    }

    #[test]
    fn pool_conserves_buffers_across_acquire_release() {
        let pool = BufferPool::new(synthetic_buffers(4, 128), 4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.remaining(), 4);

        let mut acquired = Vec::new();
        while let Some(buf) = pool.acquire() {
            acquired.push(buf);
        }
        assert_eq!(acquired.len(), 4);
        assert_eq!(pool.remaining(), 0);
        assert!(pool.acquire().is_none());

        for buf in acquired {
            pool.release(buf);
        }
        assert_eq!(pool.remaining(), 4);
    }

    #[test]
    #[should_panic(expected = "released more buffers than were acquired")]
    fn pool_release_beyond_capacity_panics() {
        let pool = BufferPool::new(std::iter::empty(), 1);
        pool.release(Buffer {
            address: 0,
            length: 1,
            local_key: 0,
        });
    }
}
