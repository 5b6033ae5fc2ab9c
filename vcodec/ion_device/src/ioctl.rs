// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The module implements the ION client APIs based on ioctl.

// UNSAFETY: unsafe needed to make ioctl calls and adopt returned descriptors.
#![expect(unsafe_code)]

use crate::protocol;
use crate::protocol::IonHandle;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use thiserror::Error;
use zerocopy::FromZeros;

/// Path of the ION device node.
pub const ION_DEVICE_PATH: &str = "/dev/ion";

#[expect(missing_docs)] // self-explanatory fields
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open /dev/ion")]
    OpenDevIon(#[source] std::io::Error),
    #[error("ION_IOC_ALLOC ioctl failed for {len:#x} bytes")]
    AllocIoctl {
        len: usize,
        #[source]
        err: nix::Error,
    },
    #[error("ION_IOC_FREE ioctl failed for handle {0}")]
    FreeIoctl(IonHandle, #[source] nix::Error),
    #[error("ION_IOC_SHARE ioctl failed for handle {0}")]
    ShareIoctl(IonHandle, #[source] nix::Error),
    #[error("ION_IOC_IMPORT ioctl failed for fd {0}")]
    ImportIoctl(RawFd, #[source] nix::Error),
    #[error("ION_MM_CONFIG_BUFFER failed for handle {0}")]
    ConfigBufferIoctl(IonHandle, #[source] nix::Error),
    #[error("ION_SYS_GET_PHYS failed for handle {0}")]
    GetPhysIoctl(IonHandle, #[source] nix::Error),
}

nix::ioctl_readwrite!(
    /// `ION_IOC_ALLOC` ioctl defined by Linux.
    ion_ioc_alloc,
    protocol::ION_IOC_MAGIC,
    0,
    protocol::IonAllocationData
);

nix::ioctl_readwrite!(
    /// `ION_IOC_FREE` ioctl defined by Linux.
    ion_ioc_free,
    protocol::ION_IOC_MAGIC,
    1,
    protocol::IonHandleData
);

nix::ioctl_readwrite!(
    /// `ION_IOC_SHARE` ioctl defined by Linux.
    ion_ioc_share,
    protocol::ION_IOC_MAGIC,
    4,
    protocol::IonFdData
);

nix::ioctl_readwrite!(
    /// `ION_IOC_IMPORT` ioctl defined by Linux.
    ion_ioc_import,
    protocol::ION_IOC_MAGIC,
    5,
    protocol::IonFdData
);

nix::ioctl_readwrite!(
    /// `ION_IOC_CUSTOM` ioctl defined by Linux.
    ion_ioc_custom,
    protocol::ION_IOC_MAGIC,
    6,
    protocol::IonCustomData
);

/// Parameters for [`IonClient::config_buffer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// M4U module port that will access the buffer.
    pub module_id: i32,
    /// Mark the buffer as secure.
    pub security: bool,
    /// Mark the buffer as cache coherent.
    pub coherent: bool,
}

/// A client of the /dev/ion device.
///
/// Handles are scoped to the client; dropping the client releases every
/// handle it still holds.
#[derive(Debug)]
pub struct IonClient {
    file: File,
}

impl IonClient {
    /// Opens a new client of the ION device.
    pub fn open() -> Result<Self, Error> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(ION_DEVICE_PATH)
            .map_err(Error::OpenDevIon)?;

        tracing::debug!(fd = file.as_raw_fd(), "opened ion client");
        Ok(Self { file })
    }

    /// Allocates `len` bytes from the heaps in `heap_id_mask`.
    pub fn alloc(
        &self,
        len: usize,
        align: usize,
        heap_id_mask: u32,
        flags: u32,
    ) -> Result<IonHandle, Error> {
        let mut data = protocol::IonAllocationData {
            len: len as u64,
            align: align as u64,
            heap_id_mask,
            flags,
            handle: IonHandle(0),
            _pad: 0,
        };

        // SAFETY: Make ION_IOC_ALLOC ioctl call to the device with correct types.
        unsafe {
            ion_ioc_alloc(self.file.as_raw_fd(), &mut data)
                .map_err(|err| Error::AllocIoctl { len, err })?;
        }

        Ok(data.handle)
    }

    /// Drops the client's reference to `handle`.
    pub fn free(&self, handle: IonHandle) -> Result<(), Error> {
        let mut data = protocol::IonHandleData { handle };

        // SAFETY: Make ION_IOC_FREE ioctl call to the device with correct types.
        unsafe {
            ion_ioc_free(self.file.as_raw_fd(), &mut data)
                .map_err(|err| Error::FreeIoctl(handle, err))?;
        }

        Ok(())
    }

    /// Returns a new shareable (mappable) descriptor for `handle`.
    pub fn share(&self, handle: IonHandle) -> Result<OwnedFd, Error> {
        let mut data = protocol::IonFdData { handle, fd: -1 };

        // SAFETY: Make ION_IOC_SHARE ioctl call to the device with correct
        // types. On success the kernel installed a new descriptor that nothing
        // else owns.
        let fd = unsafe {
            ion_ioc_share(self.file.as_raw_fd(), &mut data)
                .map_err(|err| Error::ShareIoctl(handle, err))?;
            OwnedFd::from_raw_fd(data.fd)
        };

        Ok(fd)
    }

    /// Imports a shareable descriptor into a handle owned by this client.
    pub fn import(&self, fd: BorrowedFd<'_>) -> Result<IonHandle, Error> {
        let mut data = protocol::IonFdData {
            handle: IonHandle(0),
            fd: fd.as_raw_fd(),
        };

        // SAFETY: Make ION_IOC_IMPORT ioctl call to the device with correct
        // types. The descriptor is borrowed for the duration of the call.
        unsafe {
            ion_ioc_import(self.file.as_raw_fd(), &mut data)
                .map_err(|err| Error::ImportIoctl(fd.as_raw_fd(), err))?;
        }

        Ok(data.handle)
    }

    /// Configures the M4U port and security attributes of a multimedia buffer.
    pub fn config_buffer(&self, handle: IonHandle, config: &BufferConfig) -> Result<(), Error> {
        let mut mm_data = protocol::IonMmData::new_zeroed();
        mm_data.mm_cmd = protocol::ION_MM_CONFIG_BUFFER;
        mm_data.config_buffer_param.handle = handle;
        mm_data.config_buffer_param.module_id = config.module_id;
        mm_data.config_buffer_param.security = config.security.into();
        mm_data.config_buffer_param.coherent = config.coherent.into();

        // SAFETY: `mm_data` is a valid ION_CMD_MULTIMEDIA structure and lives
        // until the call returns.
        unsafe {
            self.custom(
                protocol::ION_CMD_MULTIMEDIA,
                std::ptr::from_mut(&mut mm_data).cast(),
            )
            .map_err(|err| Error::ConfigBufferIoctl(handle, err))
        }
    }

    /// Returns the device-visible address of `handle`.
    pub fn phys_addr(&self, handle: IonHandle) -> Result<u64, Error> {
        let mut sys_data = protocol::IonSysData::new_zeroed();
        sys_data.sys_cmd = protocol::ION_SYS_GET_PHYS;
        sys_data.get_phys_param.handle = handle;

        // SAFETY: `sys_data` is a valid ION_CMD_SYSTEM structure and lives
        // until the call returns.
        unsafe {
            self.custom(
                protocol::ION_CMD_SYSTEM,
                std::ptr::from_mut(&mut sys_data).cast(),
            )
            .map_err(|err| Error::GetPhysIoctl(handle, err))?;
        }

        Ok(sys_data.get_phys_param.phy_addr.into())
    }

    /// # Safety
    ///
    /// `arg` must point to the command structure matching `cmd` and remain
    /// valid for the duration of the call.
    unsafe fn custom(&self, cmd: u32, arg: *mut u8) -> nix::Result<()> {
        let mut data = protocol::IonCustomData {
            cmd,
            _pad: 0,
            arg: arg as u64,
        };
        // SAFETY: guaranteed by caller.
        unsafe { ion_ioc_custom(self.file.as_raw_fd(), &mut data)? };
        Ok(())
    }
}

impl AsRawFd for IonClient {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
