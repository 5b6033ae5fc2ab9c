// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixed-layout buffer descriptors handed to the video codec driver.

use crate::entry::MvaEntry;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A descriptor shape that can be filled in from a mapping entry.
pub trait BufferDescriptor: Sized {
    /// Copies the relevant fields of `entry` into a new descriptor.
    fn from_entry(entry: &MvaEntry) -> Self;
}

/// Address triple shared by the bitstream and frame descriptors.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct BufferAddr {
    /// Process virtual address.
    pub va: u64,
    /// Device-visible address.
    pub pa: u64,
    /// Length in bytes.
    pub size: u64,
}

impl BufferAddr {
    fn from_entry(entry: &MvaEntry) -> Self {
        Self {
            va: entry.va().get() as u64,
            pa: entry.pa(),
            size: entry.size() as u64,
        }
    }
}

/// Encoder output (bitstream) buffer descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct BitstreamBuffer {
    /// Buffer address.
    pub addr: BufferAddr,
    /// Virtual address the encoder starts writing at.
    pub start_va: u64,
    /// ION buffer handle, zero when not ION backed.
    pub ion_buf_handle: i32,
    /// ION device descriptor, zero when not ION backed.
    pub ion_dev_fd: i32,
    /// Secure memory handle.
    pub sec_mem_handle: u32,
    /// Reserved.
    pub _rsvd: u32,
}

static_assertions::const_assert_eq!(48, size_of::<BitstreamBuffer>());

impl BufferDescriptor for BitstreamBuffer {
    fn from_entry(entry: &MvaEntry) -> Self {
        Self {
            addr: BufferAddr::from_entry(entry),
            start_va: entry.va().get() as u64,
            ion_buf_handle: entry.ion_buffer_handle(),
            ion_dev_fd: entry.ion_device_fd(),
            sec_mem_handle: 0,
            _rsvd: 0,
        }
    }
}

/// Encoder input (frame) buffer descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FrameBuffer {
    /// Buffer address.
    pub addr: BufferAddr,
    /// ION buffer handle, zero when not ION backed.
    pub ion_buf_handle: i32,
    /// ION device descriptor, zero when not ION backed.
    pub ion_dev_fd: i32,
    /// Secure memory handle.
    pub sec_mem_handle: u32,
    /// Reserved.
    pub _rsvd: u32,
}

static_assertions::const_assert_eq!(40, size_of::<FrameBuffer>());

impl BufferDescriptor for FrameBuffer {
    fn from_entry(entry: &MvaEntry) -> Self {
        Self {
            addr: BufferAddr::from_entry(entry),
            ion_buf_handle: entry.ion_buffer_handle(),
            ion_dev_fd: entry.ion_device_fd(),
            sec_mem_handle: 0,
            _rsvd: 0,
        }
    }
}

/// Generic buffer information used to pass buffers between codec components.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct BufferInfo {
    /// Virtual address the buffer was originally registered with.
    pub ori_va: u64,
    /// Process virtual address.
    pub va: u64,
    /// Device-visible address.
    pub pa: u64,
    /// Length in bytes.
    pub size: u64,
    /// The caller's buffer header token.
    pub buffer_header: u64,
    /// The graphic buffer handle, zero if none.
    pub native_handle: u64,
    /// Secure memory handle.
    pub secure_handle: u32,
    /// Shareable ION buffer descriptor, -1 when not ION backed.
    pub ion_fd: i32,
}

static_assertions::const_assert_eq!(56, size_of::<BufferInfo>());

impl BufferDescriptor for BufferInfo {
    fn from_entry(entry: &MvaEntry) -> Self {
        let va = entry.va().get() as u64;
        Self {
            ori_va: va,
            va,
            pa: entry.pa(),
            size: entry.size() as u64,
            buffer_header: entry.buffer_header().0 as u64,
            native_handle: entry.native_handle().map_or(0, |h| h.0 as u64),
            secure_handle: entry.secure_handle(),
            ion_fd: entry.ion_share_fd(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::m4u::M4uBufferConfig;
    use crate::backend::m4u::M4uResources;
    use crate::entry::BufferHeader;
    use crate::entry::EntryResources;
    use crate::entry::VirtAddr;
    use zerocopy::IntoBytes;

    fn m4u_entry() -> MvaEntry {
        MvaEntry {
            va: VirtAddr::new(0x7f00_1000).unwrap(),
            pa: 0x8800_0000,
            size: 0x2000,
            buffer_header: BufferHeader(0xb00),
            native_handle: None,
            allocated: false,
            secure_handle: 0,
            resources: EntryResources::M4u(M4uResources {
                buffer: None,
                config: M4uBufferConfig::default(),
            }),
        }
    }

    #[test]
    fn test_m4u_bitstream() {
        let bs: BitstreamBuffer = m4u_entry().describe();
        assert_eq!(
            bs.addr,
            BufferAddr {
                va: 0x7f00_1000,
                pa: 0x8800_0000,
                size: 0x2000,
            }
        );
        assert_eq!(bs.start_va, 0x7f00_1000);
        assert_eq!(bs.ion_buf_handle, 0);
        assert_eq!(bs.ion_dev_fd, 0);
        assert_eq!(bs.sec_mem_handle, 0);
    }

    #[test]
    fn test_m4u_frame() {
        let frm: FrameBuffer = m4u_entry().describe();
        assert_eq!(frm.addr.va, 0x7f00_1000);
        assert_eq!(frm.addr.pa, 0x8800_0000);
        assert_eq!(frm.addr.size, 0x2000);
        assert_eq!(frm.ion_buf_handle, 0);
        assert_eq!(frm.ion_dev_fd, 0);
    }

    #[test]
    fn test_m4u_buffer_info() {
        let info: BufferInfo = m4u_entry().describe();
        assert_eq!(info.ori_va, info.va);
        assert_eq!(info.va, 0x7f00_1000);
        assert_eq!(info.pa, 0x8800_0000);
        assert_eq!(info.size, 0x2000);
        assert_eq!(info.buffer_header, 0xb00);
        assert_eq!(info.native_handle, 0);
        assert_eq!(info.ion_fd, -1);
    }

    #[test]
    fn test_descriptor_layout() {
        let frm: FrameBuffer = m4u_entry().describe();
        let bytes = frm.as_bytes();
        assert_eq!(&bytes[..8], &0x7f00_1000u64.to_ne_bytes());
        assert_eq!(&bytes[8..16], &0x8800_0000u64.to_ne_bytes());
        assert_eq!(&bytes[16..24], &0x2000u64.to_ne_bytes());
    }
}
