// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Buffer address manager for hardware video codecs.
//!
//! An [`MvaManager`] allocates or imports buffers through one memory backend,
//! records the process virtual address (VA) and device-visible address (PA)
//! of each, and fills in the fixed-layout descriptors the codec driver
//! expects when a caller hands it a buffer by VA or by graphic buffer handle.

#![cfg(target_os = "linux")]
#![warn(missing_docs)]

pub mod backend;
pub mod descriptor;
mod device_cache;
mod entry;
mod mapping;
pub mod pagemap;
#[cfg(test)]
mod testing;

pub use backend::ion::GraphicBufferQuery;
pub use backend::ion::IonBackend;
pub use backend::ion::IonConfig;
pub use backend::ion::IonDevice;
pub use backend::m4u::M4uBackend;
pub use backend::m4u::M4uBufferConfig;
pub use backend::m4u::TranslationTable;
pub use backend::BackendKind;
pub use backend::MvaBackend;
pub use descriptor::BitstreamBuffer;
pub use descriptor::BufferDescriptor;
pub use descriptor::BufferInfo;
pub use descriptor::FrameBuffer;
pub use entry::BufferHeader;
pub use entry::MvaEntry;
pub use entry::NativeHandle;
pub use entry::VirtAddr;

use std::sync::Arc;
use thiserror::Error;

/// Errors returned by [`MvaManager`] and the backends.
#[derive(Debug, Error)]
pub enum Error {
    /// The backend has no way to perform the operation.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        /// The backend.
        backend: BackendKind,
        /// The rejected operation.
        operation: &'static str,
    },
    /// Allocating or mapping the buffer failed. Nothing was registered.
    #[error("failed to map buffer")]
    Map(#[source] anyhow::Error),
    /// The request parameters are invalid.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    /// Importing a graphic buffer needs a [`GraphicBufferQuery`].
    #[error("no graphic buffer query is configured")]
    NoBufferQuery,
    /// The backend failed to open when the manager was created.
    #[error("backend is unavailable")]
    BackendUnavailable,
    /// A live entry already has this VA.
    #[error("va {0} is already registered")]
    DuplicateVa(VirtAddr),
    /// A live entry already has this graphic buffer handle.
    #[error("handle {0} is already registered")]
    DuplicateHandle(NativeHandle),
    /// No live entry has this VA.
    #[error("va {0} is not registered")]
    VaNotFound(VirtAddr),
    /// Releasing an entry failed. The entry is no longer registered.
    #[error("failed to release va {va}")]
    Release {
        /// The VA of the released entry.
        va: VirtAddr,
        /// The first failed release step.
        #[source]
        err: anyhow::Error,
    },
}

/// Tracks the live buffer mappings of one codec instance.
///
/// Entries are released in registration order when the manager is dropped.
pub struct MvaManager {
    kind: BackendKind,
    entries: Vec<MvaEntry>,
    backend: Option<Box<dyn MvaBackend>>,
}

impl MvaManager {
    /// Creates a manager for the backend selected by `tag`.
    ///
    /// `config_name` names the ION client for the shared memory object
    /// backend and is ignored otherwise. If the backend cannot be opened the
    /// failure is logged and every later operation fails with
    /// [`Error::BackendUnavailable`].
    pub fn new(tag: &str, config_name: Option<&str>) -> Self {
        let kind = BackendKind::from_tag(tag);
        let backend: anyhow::Result<Box<dyn MvaBackend>> = match kind {
            BackendKind::Ion => {
                let mut config = IonConfig::default();
                if let Some(name) = config_name {
                    config.client_name = name.to_owned();
                }
                IonBackend::open(config).map(|b| Box::new(b) as Box<dyn MvaBackend>)
            }
            BackendKind::M4u => M4uBackend::open().map(|b| Box::new(b) as Box<dyn MvaBackend>),
        };

        let backend = match backend {
            Ok(backend) => {
                tracing::debug!(backend = %kind, "created mva manager");
                Some(backend)
            }
            Err(err) => {
                tracing::error!(
                    error = err.as_ref() as &dyn std::error::Error,
                    backend = %kind,
                    "failed to open backend"
                );
                None
            }
        };

        Self {
            kind,
            entries: Vec::new(),
            backend,
        }
    }

    /// Creates a manager around an existing backend.
    pub fn with_backend(backend: Box<dyn MvaBackend>) -> Self {
        Self {
            kind: backend.kind(),
            entries: Vec::new(),
            backend: Some(backend),
        }
    }

    /// The kind of backend this manager was created for.
    pub fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    /// Whether the backend opened successfully.
    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    /// Sets a boolean backend mode. Keys match by prefix: `"MCI"`,
    /// `"Locally"` and `"VDEC"`.
    pub fn set_bool_property(&mut self, key: &str, value: bool) {
        match &mut self.backend {
            Some(backend) => backend.set_bool_property(key, value),
            None => tracing::warn!(key, value, "backend unavailable, ignoring property"),
        }
    }

    /// Sets the collaborator that describes graphic buffers for
    /// [`MvaManager::register_handle`].
    ///
    /// Only the shared memory object backend imports graphic buffers.
    pub fn set_buffer_query(&mut self, query: Arc<dyn GraphicBufferQuery>) -> Result<(), Error> {
        self.backend
            .as_deref_mut()
            .ok_or(Error::BackendUnavailable)?
            .set_buffer_query(query)
    }

    /// Allocates and maps a new buffer, returning its VA.
    pub fn allocate(
        &mut self,
        align: usize,
        size: usize,
        buffer_header: BufferHeader,
    ) -> Result<VirtAddr, Error> {
        let backend = self.backend.as_deref().ok_or(Error::BackendUnavailable)?;
        let entry = backend.allocate(align, size, buffer_header)?;
        let va = entry.va();
        self.insert(entry)?;
        Ok(va)
    }

    /// Maps caller-owned memory at `va`.
    pub fn register_va(
        &mut self,
        va: VirtAddr,
        size: usize,
        buffer_header: BufferHeader,
    ) -> Result<(), Error> {
        let backend = self.backend.as_deref().ok_or(Error::BackendUnavailable)?;
        if self.find_va(va).is_some() {
            return Err(Error::DuplicateVa(va));
        }
        let entry = backend.import_va(va, size, buffer_header)?;
        self.insert(entry)
    }

    /// Maps the memory behind a platform graphic buffer.
    pub fn register_handle(
        &mut self,
        handle: NativeHandle,
        buffer_header: BufferHeader,
    ) -> Result<(), Error> {
        let backend = self.backend.as_deref().ok_or(Error::BackendUnavailable)?;
        if self.find_handle(handle).is_some() {
            return Err(Error::DuplicateHandle(handle));
        }
        let entry = backend.import_handle(handle, buffer_header)?;
        self.insert(entry)
    }

    fn insert(&mut self, entry: MvaEntry) -> Result<(), Error> {
        let duplicate = if self.find_va(entry.va()).is_some() {
            Some(Error::DuplicateVa(entry.va()))
        } else {
            entry
                .native_handle()
                .filter(|&handle| self.find_handle(handle).is_some())
                .map(Error::DuplicateHandle)
        };

        if let Some(err) = duplicate {
            let va = entry.va();
            if let Some(backend) = &self.backend {
                if let Err(free_err) = backend.free(entry) {
                    tracing::error!(
                        error = free_err.as_ref() as &dyn std::error::Error,
                        %va,
                        "failed to release duplicate entry"
                    );
                }
            }
            return Err(err);
        }

        self.entries.push(entry);
        Ok(())
    }

    fn find_va(&self, va: VirtAddr) -> Option<usize> {
        self.entries.iter().position(|e| e.va() == va)
    }

    fn find_handle(&self, handle: NativeHandle) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.native_handle() == Some(handle))
    }

    /// Removes the entry at `index` and releases it.
    fn release_at(&mut self, index: usize) -> Result<(), Error> {
        let backend = self.backend.as_deref().ok_or(Error::BackendUnavailable)?;
        let entry = self.entries.remove(index);
        let va = entry.va();
        backend
            .free(entry)
            .map_err(|err| Error::Release { va, err })
    }

    /// Unmaps and releases the buffer at `va`.
    pub fn release_va(&mut self, va: VirtAddr) -> Result<(), Error> {
        let Some(index) = self.find_va(va) else {
            tracing::error!(%va, "release of unregistered va");
            return Err(Error::VaNotFound(va));
        };
        self.release_at(index)
    }

    /// Unmaps and releases the buffer imported from `handle`.
    ///
    /// Returns `Ok(false)` if no buffer was imported from `handle`.
    pub fn release_handle(&mut self, handle: NativeHandle) -> Result<bool, Error> {
        let Some(index) = self.find_handle(handle) else {
            tracing::debug!(%handle, "no entry for handle");
            return Ok(false);
        };
        self.release_at(index)?;
        Ok(true)
    }

    /// Releases every buffer in registration order.
    ///
    /// The registry is always empty afterwards. The first failure is
    /// returned.
    pub fn release_all(&mut self) -> Result<(), Error> {
        if self.entries.is_empty() {
            return Ok(());
        }
        tracing::debug!(backend = %self.kind, count = self.entries.len(), "releasing all entries");

        let mut result = Ok(());
        let entries = std::mem::take(&mut self.entries);
        let Some(backend) = self.backend.as_deref() else {
            return Err(Error::BackendUnavailable);
        };
        for entry in entries {
            let va = entry.va();
            if let Err(err) = backend.free(entry) {
                tracing::error!(
                    error = err.as_ref() as &dyn std::error::Error,
                    %va,
                    "failed to release entry"
                );
                if result.is_ok() {
                    result = Err(Error::Release { va, err });
                }
            }
        }
        result
    }

    /// Returns the descriptor of the buffer at `va`.
    pub fn resolve_va<D: BufferDescriptor>(&self, va: VirtAddr) -> Result<D, Error> {
        match self.find_va(va) {
            Some(index) => Ok(self.entries[index].describe()),
            None => {
                tracing::error!(%va, "lookup of unregistered va");
                Err(Error::VaNotFound(va))
            }
        }
    }

    /// Returns the descriptor of the buffer imported from `handle`, if any.
    pub fn resolve_handle<D: BufferDescriptor>(&self, handle: NativeHandle) -> Option<D> {
        self.find_handle(handle)
            .map(|index| self.entries[index].describe())
    }

    /// Returns the device-visible address of the buffer at `va`.
    pub fn physical_address(&self, va: VirtAddr) -> Result<u64, Error> {
        match self.find_va(va) {
            Some(index) => Ok(self.entries[index].pa()),
            None => {
                tracing::error!(%va, "address lookup of unregistered va");
                Err(Error::VaNotFound(va))
            }
        }
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The live entries in registration order.
    pub fn entries(&self) -> &[MvaEntry] {
        &self.entries
    }

    /// Logs every live entry.
    pub fn dump(&self) {
        tracing::debug!(backend = %self.kind, count = self.entries.len(), "mva entries");
        if let Some(backend) = &self.backend {
            for entry in &self.entries {
                backend.dump(entry);
            }
        }
    }
}

impl Drop for MvaManager {
    fn drop(&mut self) {
        tracing::debug!(backend = %self.kind, count = self.entries.len(), "removing mva manager");
        // Failures were already logged per entry.
        let _ = self.release_all();
    }
}
