// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mapping entries and the tokens used to look them up.

use crate::backend::ion::IonResources;
use crate::backend::m4u::M4uResources;
use crate::backend::BackendKind;
use crate::descriptor::BufferDescriptor;
use std::fmt;
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;

/// A non-null process virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtAddr(NonZeroUsize);

impl VirtAddr {
    /// Returns the address `addr`, or `None` if it is null.
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Returns the address of `ptr`, or `None` if it is null.
    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        Self::new(ptr as usize)
    }

    pub(crate) const fn from_non_zero(addr: NonZeroUsize) -> Self {
        Self(addr)
    }

    /// The address as an integer.
    pub const fn get(self) -> usize {
        self.0.get()
    }

    /// The address as a pointer.
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.get() as *mut u8
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Caller-supplied token naming the logical buffer a mapping backs.
///
/// The manager stores it and copies it into [`BufferInfo`] descriptors but
/// never interprets it.
///
/// [`BufferInfo`]: crate::descriptor::BufferInfo
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferHeader(pub usize);

impl fmt::Display for BufferHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque platform graphic buffer handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub usize);

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One live buffer mapping.
///
/// Entries are created by a backend, owned by the
/// [`MvaManager`](crate::MvaManager) registry, and consumed by the backend that
/// created them when they are freed.
#[derive(Debug)]
pub struct MvaEntry {
    pub(crate) va: VirtAddr,
    pub(crate) pa: u64,
    pub(crate) size: usize,
    pub(crate) buffer_header: BufferHeader,
    pub(crate) native_handle: Option<NativeHandle>,
    pub(crate) allocated: bool,
    pub(crate) secure_handle: u32,
    pub(crate) resources: EntryResources,
}

/// Backend-private state of an entry.
#[derive(Debug)]
pub(crate) enum EntryResources {
    Ion(IonResources),
    M4u(M4uResources),
}

impl MvaEntry {
    /// The process virtual address of the buffer.
    pub fn va(&self) -> VirtAddr {
        self.va
    }

    /// The device-visible address of the buffer.
    pub fn pa(&self) -> u64 {
        self.pa
    }

    /// The length of the mapped region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The caller's buffer header token.
    pub fn buffer_header(&self) -> BufferHeader {
        self.buffer_header
    }

    /// The graphic buffer handle the entry was imported from, if any.
    pub fn native_handle(&self) -> Option<NativeHandle> {
        self.native_handle
    }

    /// Whether the backing memory was allocated by the manager and is
    /// released together with the mapping.
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// The secure memory handle, zero for normal memory.
    pub fn secure_handle(&self) -> u32 {
        self.secure_handle
    }

    /// The backend that created this entry.
    pub fn backend(&self) -> BackendKind {
        match self.resources {
            EntryResources::Ion(_) => BackendKind::Ion,
            EntryResources::M4u(_) => BackendKind::M4u,
        }
    }

    /// Fills in a hardware descriptor for this entry.
    pub fn describe<D: BufferDescriptor>(&self) -> D {
        D::from_entry(self)
    }

    /// The ION buffer handle, or zero for entries without one.
    pub(crate) fn ion_buffer_handle(&self) -> i32 {
        match &self.resources {
            EntryResources::Ion(res) => res.handle.0,
            EntryResources::M4u(_) => 0,
        }
    }

    /// The ION device descriptor, or zero for entries without one.
    pub(crate) fn ion_device_fd(&self) -> i32 {
        match &self.resources {
            EntryResources::Ion(res) => res.device_fd,
            EntryResources::M4u(_) => 0,
        }
    }

    /// The shareable buffer descriptor, or -1 for entries without one.
    pub(crate) fn ion_share_fd(&self) -> i32 {
        match &self.resources {
            EntryResources::Ion(res) => res.share_fd.as_raw_fd(),
            EntryResources::M4u(_) => -1,
        }
    }
}
