// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions of the structures passed to the ION device, following the
//! legacy (pre-4.12) Linux ION UAPI and the MediaTek custom command extension.
//!
//! Layouts match the LP64 ABI. Kernel unions holding either a user handle or a
//! kernel pointer are modeled as the user handle followed by the pointer's
//! upper half.

use std::fmt;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Ioctl type defined by Linux.
pub const ION_IOC_MAGIC: u8 = b'I';

/// Heap id mask selecting the multimedia heap.
pub const ION_HEAP_MULTIMEDIA_MASK: u32 = 1 << 10;

/// Buffer mappings are cached.
pub const ION_FLAG_CACHED: u32 = 1;
/// Cached mappings require explicit cache maintenance.
pub const ION_FLAG_CACHED_NEEDS_SYNC: u32 = 2;

/// `ION_CMD_SYSTEM` custom command class.
pub const ION_CMD_SYSTEM: u32 = 0;
/// `ION_CMD_MULTIMEDIA` custom command class.
pub const ION_CMD_MULTIMEDIA: u32 = 1;

/// `ION_MM_CONFIG_BUFFER` multimedia command.
pub const ION_MM_CONFIG_BUFFER: u32 = 0;
/// `ION_SYS_GET_PHYS` system command.
pub const ION_SYS_GET_PHYS: u32 = 1;

/// Size of the command union carried by [`IonMmData`] and [`IonSysData`].
///
/// Larger than any member the kernel defines, so the kernel never reads past
/// the end of the structure.
pub const ION_CMD_PAYLOAD_SIZE: usize = 120;

/// A per-client handle naming one ION buffer.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IonHandle(pub i32);

impl fmt::Display for IonHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// `struct ion_allocation_data`.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IonAllocationData {
    /// Size of the allocation in bytes.
    pub len: u64,
    /// Required alignment of the allocation.
    pub align: u64,
    /// Mask of heaps the allocation may come from.
    pub heap_id_mask: u32,
    /// `ION_FLAG_*` values.
    pub flags: u32,
    /// Output handle.
    pub handle: IonHandle,
    /// Padding.
    pub _pad: u32,
}

static_assertions::const_assert_eq!(32, size_of::<IonAllocationData>());

/// `struct ion_handle_data`.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IonHandleData {
    /// The buffer handle.
    pub handle: IonHandle,
}

/// `struct ion_fd_data`.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IonFdData {
    /// The buffer handle. Input for share, output for import.
    pub handle: IonHandle,
    /// The shareable descriptor. Output for share, input for import.
    pub fd: i32,
}

/// `struct ion_custom_data`.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IonCustomData {
    /// `ION_CMD_*` command class.
    pub cmd: u32,
    /// Padding.
    pub _pad: u32,
    /// User pointer to the command structure.
    pub arg: u64,
}

static_assertions::const_assert_eq!(16, size_of::<IonCustomData>());

/// `ion_mm_config_buffer_param_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IonMmConfigBufferParam {
    /// The buffer handle.
    pub handle: IonHandle,
    /// Upper half of the kernel handle union.
    pub _handle_hi: u32,
    /// M4U module port that will access the buffer.
    pub module_id: i32,
    /// Non-zero for secure buffers.
    pub security: u32,
    /// Non-zero for cache coherent buffers.
    pub coherent: u32,
    /// Padding.
    pub _pad: u32,
}

/// `struct ion_mm_data`.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IonMmData {
    /// `ION_MM_*` command.
    pub mm_cmd: u32,
    /// Padding before the pointer-aligned union.
    pub _pad: u32,
    /// Parameters for [`ION_MM_CONFIG_BUFFER`].
    pub config_buffer_param: IonMmConfigBufferParam,
    /// Remainder of the command union.
    pub _rsvd: [u8; ION_CMD_PAYLOAD_SIZE - size_of::<IonMmConfigBufferParam>()],
}

static_assertions::const_assert_eq!(128, size_of::<IonMmData>());

/// `ion_sys_get_phys_param_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IonSysGetPhysParam {
    /// The buffer handle.
    pub handle: IonHandle,
    /// Upper half of the kernel handle union.
    pub _handle_hi: u32,
    /// Output device address.
    pub phy_addr: u32,
    /// Padding.
    pub _pad: u32,
    /// Output buffer length.
    pub len: u64,
}

/// `struct ion_sys_data`.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IonSysData {
    /// `ION_SYS_*` command.
    pub sys_cmd: u32,
    /// Padding before the pointer-aligned union.
    pub _pad: u32,
    /// Parameters for [`ION_SYS_GET_PHYS`].
    pub get_phys_param: IonSysGetPhysParam,
    /// Remainder of the command union.
    pub _rsvd: [u8; ION_CMD_PAYLOAD_SIZE - size_of::<IonSysGetPhysParam>()],
}

static_assertions::const_assert_eq!(128, size_of::<IonSysData>());

#[cfg(test)]
mod test {
    use super::*;
    use std::mem::offset_of;
    use zerocopy::FromZeros;

    #[test]
    fn test_command_payload_offsets() {
        assert_eq!(offset_of!(IonMmData, config_buffer_param), 8);
        assert_eq!(offset_of!(IonMmConfigBufferParam, module_id), 8);
        assert_eq!(offset_of!(IonSysData, get_phys_param), 8);
        assert_eq!(offset_of!(IonSysGetPhysParam, phy_addr), 8);
    }

    #[test]
    fn test_handle_bytes() {
        let mut data = IonFdData::new_zeroed();
        data.handle = IonHandle(0x12);
        data.fd = 3;
        assert_eq!(data.as_bytes(), [0x12, 0, 0, 0, 3, 0, 0, 0]);
        assert_eq!(IonHandle(0x12).to_string(), "0x12");
    }
}
