// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared memory object backend, built on the ION allocator.
//!
//! Every entry holds an ION handle, a shareable descriptor for it and a
//! read/write shared mapping of that descriptor. The device-visible address
//! comes from the MediaTek system custom command.

use super::BackendKind;
use super::BoolProperty;
use super::MvaBackend;
use crate::device_cache::SharedCache;
use crate::entry::BufferHeader;
use crate::entry::EntryResources;
use crate::entry::MvaEntry;
use crate::entry::NativeHandle;
use crate::entry::VirtAddr;
use crate::mapping::SharedMapping;
use crate::Error;
use anyhow::Context;
use ion_device::ioctl::BufferConfig;
use ion_device::ioctl::IonClient;
use ion_device::protocol::ION_FLAG_CACHED;
use ion_device::protocol::ION_FLAG_CACHED_NEEDS_SYNC;
use ion_device::protocol::ION_HEAP_MULTIMEDIA_MASK;
use ion_device::IonHandle;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::IntoRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Default name of the shared ION client.
pub const DEFAULT_CLIENT_NAME: &str = "vcodec";

/// Default M4U port of the video encoder.
pub const DEFAULT_VENC_MODULE_ID: i32 = 2;

/// Default M4U port of the video decoder.
pub const DEFAULT_VDEC_MODULE_ID: i32 = 1;

/// The ION primitives the backend needs.
pub trait IonDevice: Send + Sync {
    /// The descriptor number of the device, reported in hardware descriptors.
    fn device_fd(&self) -> RawFd;

    /// Allocates a buffer.
    fn alloc(
        &self,
        len: usize,
        align: usize,
        heap_id_mask: u32,
        flags: u32,
    ) -> anyhow::Result<IonHandle>;

    /// Imports a shareable descriptor.
    fn import(&self, fd: BorrowedFd<'_>) -> anyhow::Result<IonHandle>;

    /// Returns a new shareable descriptor for a buffer.
    fn share(&self, handle: IonHandle) -> anyhow::Result<OwnedFd>;

    /// Releases a handle.
    fn free(&self, handle: IonHandle) -> anyhow::Result<()>;

    /// Sets the port and security attributes of a buffer.
    fn config_buffer(&self, handle: IonHandle, config: &BufferConfig) -> anyhow::Result<()>;

    /// Returns the device-visible address of a buffer.
    fn phys_addr(&self, handle: IonHandle) -> anyhow::Result<u64>;
}

impl IonDevice for IonClient {
    fn device_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn alloc(
        &self,
        len: usize,
        align: usize,
        heap_id_mask: u32,
        flags: u32,
    ) -> anyhow::Result<IonHandle> {
        Ok(IonClient::alloc(self, len, align, heap_id_mask, flags)?)
    }

    fn import(&self, fd: BorrowedFd<'_>) -> anyhow::Result<IonHandle> {
        Ok(IonClient::import(self, fd)?)
    }

    fn share(&self, handle: IonHandle) -> anyhow::Result<OwnedFd> {
        Ok(IonClient::share(self, handle)?)
    }

    fn free(&self, handle: IonHandle) -> anyhow::Result<()> {
        Ok(IonClient::free(self, handle)?)
    }

    fn config_buffer(&self, handle: IonHandle, config: &BufferConfig) -> anyhow::Result<()> {
        Ok(IonClient::config_buffer(self, handle, config)?)
    }

    fn phys_addr(&self, handle: IonHandle) -> anyhow::Result<u64> {
        Ok(IonClient::phys_addr(self, handle)?)
    }
}

/// Describes platform graphic buffers.
pub trait GraphicBufferQuery: Send + Sync {
    /// The allocation size of the buffer in bytes.
    fn alloc_size(&self, handle: NativeHandle) -> anyhow::Result<usize>;

    /// The ION descriptor backing the buffer.
    fn ion_fd(&self, handle: NativeHandle) -> anyhow::Result<BorrowedFd<'_>>;
}

/// Configuration of the shared memory object backend.
#[derive(Debug, Clone)]
pub struct IonConfig {
    /// Name of the ION client. Backends with the same name share a client.
    pub client_name: String,
    /// Heaps buffers are allocated from.
    pub heap_id_mask: u32,
    /// Allocation flags.
    pub alloc_flags: u32,
    /// M4U port used when buffers feed the encoder.
    pub venc_module_id: i32,
    /// M4U port used when buffers feed the decoder.
    pub vdec_module_id: i32,
}

impl Default for IonConfig {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            heap_id_mask: ION_HEAP_MULTIMEDIA_MASK,
            alloc_flags: ION_FLAG_CACHED | ION_FLAG_CACHED_NEEDS_SYNC,
            venc_module_id: DEFAULT_VENC_MODULE_ID,
            vdec_module_id: DEFAULT_VDEC_MODULE_ID,
        }
    }
}

static ION_CLIENTS: SharedCache<IonClient> = SharedCache::new();

/// The descriptor a buffer was imported from.
#[derive(Debug)]
pub(crate) enum SourceFd {
    /// A duplicate closed when the entry is freed.
    Owned(OwnedFd),
    /// The caller's descriptor, left open.
    Borrowed(RawFd),
}

/// Per-entry state of the shared memory object backend.
#[derive(Debug)]
pub(crate) struct IonResources {
    pub handle: IonHandle,
    pub device_fd: RawFd,
    pub share_fd: OwnedFd,
    pub mapping: SharedMapping,
    pub source_fd: Option<SourceFd>,
}

enum Source<'a> {
    Alloc { align: usize },
    Import(BorrowedFd<'a>),
}

/// The shared memory object backend.
pub struct IonBackend {
    device: Arc<dyn IonDevice>,
    query: Option<Arc<dyn GraphicBufferQuery>>,
    config: IonConfig,
    mci_mode: bool,
    client_locally: bool,
    vdec: bool,
}

impl IonBackend {
    /// Opens (or reuses) the ION client named in `config`.
    ///
    /// The legacy ION ABI has no way to name a client, so the name only
    /// selects which process-wide client is shared.
    pub fn open(config: IonConfig) -> anyhow::Result<Self> {
        let client = ION_CLIENTS
            .get_or_try_insert_with(&config.client_name, IonClient::open)
            .with_context(|| format!("failed to open ion client {}", config.client_name))?;
        Ok(Self::new(client, config))
    }

    /// Returns a backend using `device`.
    pub fn new(device: Arc<dyn IonDevice>, config: IonConfig) -> Self {
        Self {
            device,
            query: None,
            config,
            mci_mode: false,
            client_locally: false,
            vdec: false,
        }
    }

    /// Sets the collaborator used to import graphic buffers.
    pub fn with_buffer_query(mut self, query: Arc<dyn GraphicBufferQuery>) -> Self {
        self.query = Some(query);
        self
    }

    fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            module_id: if self.vdec {
                self.config.vdec_module_id
            } else {
                self.config.venc_module_id
            },
            security: self.mci_mode,
            coherent: self.mci_mode,
        }
    }

    /// Gets an ION handle for `source` and maps it.
    fn map_buffer(
        &self,
        source: Source<'_>,
        size: usize,
    ) -> anyhow::Result<(IonHandle, OwnedFd, SharedMapping, u64)> {
        let handle = match source {
            Source::Alloc { align } => self
                .device
                .alloc(
                    size,
                    align,
                    self.config.heap_id_mask,
                    self.config.alloc_flags,
                )
                .with_context(|| format!("failed to allocate {size:#x} bytes"))?,
            Source::Import(fd) => self
                .device
                .import(fd)
                .with_context(|| format!("failed to import fd {}", fd.as_raw_fd()))?,
        };

        match self.map_handle(handle, size) {
            Ok((share_fd, mapping, pa)) => Ok((handle, share_fd, mapping, pa)),
            Err(err) => {
                if let Err(free_err) = self.device.free(handle) {
                    tracing::error!(
                        error = free_err.as_ref() as &dyn std::error::Error,
                        %handle,
                        "failed to free ion handle"
                    );
                }
                Err(err)
            }
        }
    }

    fn map_handle(
        &self,
        handle: IonHandle,
        size: usize,
    ) -> anyhow::Result<(OwnedFd, SharedMapping, u64)> {
        let share_fd = self
            .device
            .share(handle)
            .with_context(|| format!("failed to share ion handle {handle}"))?;
        let mapping = SharedMapping::new(share_fd.as_fd(), size)
            .with_context(|| format!("failed to map ion handle {handle}"))?;

        // The buffer stays usable with the default port configuration.
        if let Err(err) = self.device.config_buffer(handle, &self.buffer_config()) {
            tracing::warn!(
                error = err.as_ref() as &dyn std::error::Error,
                %handle,
                "failed to configure ion buffer"
            );
        }

        let pa = self
            .device
            .phys_addr(handle)
            .with_context(|| format!("failed to get physical address of {handle}"))?;
        Ok((share_fd, mapping, pa))
    }

    fn import_graphic_buffer(
        &self,
        query: &dyn GraphicBufferQuery,
        handle: NativeHandle,
        buffer_header: BufferHeader,
    ) -> anyhow::Result<MvaEntry> {
        let size = query
            .alloc_size(handle)
            .with_context(|| format!("failed to query size of graphic buffer {handle}"))?;
        let fd = query
            .ion_fd(handle)
            .with_context(|| format!("failed to query ion fd of graphic buffer {handle}"))?;

        let source_fd = if self.client_locally {
            SourceFd::Borrowed(fd.as_raw_fd())
        } else {
            SourceFd::Owned(
                fd.try_clone_to_owned()
                    .context("failed to duplicate source fd")?,
            )
        };

        let (ion_handle, share_fd, mapping, pa) = self.map_buffer(Source::Import(fd), size)?;
        let entry = MvaEntry {
            va: mapping.va(),
            pa,
            size,
            buffer_header,
            native_handle: Some(handle),
            allocated: false,
            secure_handle: 0,
            resources: EntryResources::Ion(IonResources {
                handle: ion_handle,
                device_fd: self.device.device_fd(),
                share_fd,
                mapping,
                source_fd: Some(source_fd),
            }),
        };
        tracing::debug!(
            va = %entry.va,
            pa,
            size,
            native_handle = %handle,
            %ion_handle,
            "ion import"
        );
        Ok(entry)
    }
}

/// Records the first failure of a multi-step release and logs every one.
fn record_release_step(
    result: &mut anyhow::Result<()>,
    va: VirtAddr,
    step: anyhow::Result<()>,
) {
    if let Err(err) = step {
        tracing::error!(
            error = err.as_ref() as &dyn std::error::Error,
            %va,
            "ion release step failed"
        );
        if result.is_ok() {
            *result = Err(err);
        }
    }
}

impl MvaBackend for IonBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ion
    }

    fn set_bool_property(&mut self, key: &str, value: bool) {
        match BoolProperty::parse(key) {
            Some(BoolProperty::Mci) => self.mci_mode = value,
            Some(BoolProperty::Locally) => self.client_locally = value,
            Some(BoolProperty::Vdec) => self.vdec = value,
            None => tracing::debug!(key, "unsupported ion property"),
        }
    }

    fn set_buffer_query(&mut self, query: Arc<dyn GraphicBufferQuery>) -> Result<(), Error> {
        self.query = Some(query);
        Ok(())
    }

    fn allocate(
        &self,
        align: usize,
        size: usize,
        buffer_header: BufferHeader,
    ) -> Result<MvaEntry, Error> {
        if size == 0 {
            return Err(Error::InvalidRequest("size must be greater than 0"));
        }

        let (handle, share_fd, mapping, pa) = self
            .map_buffer(Source::Alloc { align }, size)
            .map_err(Error::Map)?;
        let entry = MvaEntry {
            va: mapping.va(),
            pa,
            size,
            buffer_header,
            native_handle: None,
            allocated: true,
            secure_handle: 0,
            resources: EntryResources::Ion(IonResources {
                handle,
                device_fd: self.device.device_fd(),
                share_fd,
                mapping,
                source_fd: None,
            }),
        };
        tracing::debug!(
            va = %entry.va,
            pa,
            size,
            %buffer_header,
            %handle,
            "ion allocate"
        );
        Ok(entry)
    }

    fn import_va(
        &self,
        _va: VirtAddr,
        _size: usize,
        _buffer_header: BufferHeader,
    ) -> Result<MvaEntry, Error> {
        Err(Error::Unsupported {
            backend: BackendKind::Ion,
            operation: "import_va",
        })
    }

    fn import_handle(
        &self,
        handle: NativeHandle,
        buffer_header: BufferHeader,
    ) -> Result<MvaEntry, Error> {
        let query = self.query.as_deref().ok_or(Error::NoBufferQuery)?;
        self.import_graphic_buffer(query, handle, buffer_header)
            .map_err(Error::Map)
    }

    fn free(&self, entry: MvaEntry) -> anyhow::Result<()> {
        let MvaEntry {
            va,
            pa,
            size,
            buffer_header,
            resources,
            ..
        } = entry;
        let EntryResources::Ion(IonResources {
            handle,
            device_fd: _,
            share_fd,
            mapping,
            source_fd,
        }) = resources
        else {
            anyhow::bail!("entry at {va} was not created by the ion backend");
        };

        tracing::debug!(%va, pa, size, %buffer_header, %handle, "ion free");

        let mut result = Ok(());
        record_release_step(
            &mut result,
            va,
            mapping.unmap().context("failed to unmap buffer"),
        );
        record_release_step(
            &mut result,
            va,
            nix::unistd::close(share_fd.into_raw_fd()).context("failed to close share fd"),
        );
        match source_fd {
            Some(SourceFd::Owned(fd)) => record_release_step(
                &mut result,
                va,
                nix::unistd::close(fd.into_raw_fd()).context("failed to close source fd"),
            ),
            Some(SourceFd::Borrowed(fd)) => {
                tracing::debug!(%va, source_fd = fd, "source fd stays with the caller");
            }
            None => {}
        }
        record_release_step(
            &mut result,
            va,
            self.device
                .free(handle)
                .with_context(|| format!("failed to free ion handle {handle}")),
        );
        result
    }

    fn dump(&self, entry: &MvaEntry) {
        match &entry.resources {
            EntryResources::Ion(res) => tracing::debug!(
                va = %entry.va,
                pa = entry.pa,
                size = entry.size,
                mapping_len = res.mapping.len(),
                buffer_header = %entry.buffer_header,
                native_handle = entry.native_handle.map(tracing::field::display),
                handle = %res.handle,
                share_fd = res.share_fd.as_raw_fd(),
                source_fd = ?res.source_fd,
                "ion entry"
            ),
            EntryResources::M4u(_) => {
                tracing::warn!(va = %entry.va, "entry was not created by the ion backend")
            }
        }
    }
}
