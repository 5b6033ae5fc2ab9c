// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process memory primitives used by the backends.

// UNSAFETY: Manual memory management with mmap, mlock and the global allocator.
#![expect(unsafe_code)]

use crate::entry::VirtAddr;
use std::alloc::Layout;
use std::io;
use std::mem::ManuallyDrop;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let s = PAGE_SIZE.load(Ordering::Relaxed);
    if s != 0 {
        s
    } else {
        // SAFETY: sysconf has no memory safety requirements.
        let s = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        PAGE_SIZE.store(s, Ordering::Relaxed);
        s
    }
}

/// A read/write shared mapping of a file descriptor.
///
/// Unmapped on drop, or explicitly via [`SharedMapping::unmap`] to observe
/// failures.
#[derive(Debug)]
pub(crate) struct SharedMapping {
    addr: NonNull<u8>,
    len: usize,
}

// SAFETY: SharedMapping's internal pointer represents an owned virtual address
// range. There is no safety issue accessing this pointer across threads.
unsafe impl Send for SharedMapping {}
// SAFETY: See above comment
unsafe impl Sync for SharedMapping {}

impl SharedMapping {
    /// Maps the first `len` bytes of `fd`.
    pub fn new(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        // Length of 0 return an OS error, so we need to handle it explicitly.
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        // SAFETY: calling mmap to create a new mapping at a kernel-chosen
        // address. The result is validated below.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let addr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;

        Ok(Self { addr, len })
    }

    pub fn va(&self) -> VirtAddr {
        VirtAddr::from_non_zero(self.addr.addr())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Unmaps the range, returning the result of the unmap call.
    pub fn unmap(self) -> io::Result<()> {
        let this = ManuallyDrop::new(self);
        // SAFETY: this is the mapping created in `new`, and it will not be
        // used again.
        unsafe { munmap(this.addr, this.len) }
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        // SAFETY: self contains a valid mmap result.
        if let Err(err) = unsafe { munmap(self.addr, self.len) } {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                va = %self.va(),
                "failed to unmap shared mapping"
            );
        }
    }
}

/// # Safety
///
/// `addr..addr + len` must be a mapping owned by the caller that is not
/// accessed afterwards.
unsafe fn munmap(addr: NonNull<u8>, len: usize) -> io::Result<()> {
    // SAFETY: guaranteed by caller.
    if unsafe { libc::munmap(addr.as_ptr().cast(), len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Zero-initialized process memory with a caller-chosen alignment, released
/// on drop.
#[derive(Debug)]
pub(crate) struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
// SAFETY: See above comment
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Returns `None` if `size` is zero, `align` is not a power of two, or the
    /// allocator is out of memory.
    pub fn new(align: usize, size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, align).ok()?;
        // SAFETY: the layout has a non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    pub fn va(&self) -> VirtAddr {
        VirtAddr::from_non_zero(self.ptr.addr())
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: the pointer was allocated in `new` with this layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Pins `va..va + len` in RAM.
pub(crate) fn lock_range(va: VirtAddr, len: usize) -> io::Result<()> {
    // SAFETY: mlock does not access the memory; ranges that are not mapped
    // fail with ENOMEM.
    if unsafe { libc::mlock(va.as_ptr().cast(), len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Releases a pin taken by [`lock_range`].
pub(crate) fn unlock_range(va: VirtAddr, len: usize) -> io::Result<()> {
    // SAFETY: munlock does not access the memory; ranges that are not mapped
    // fail with ENOMEM.
    if unsafe { libc::munlock(va.as_ptr().cast(), len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
