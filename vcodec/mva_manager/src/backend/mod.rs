// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory backends that create and destroy mapping entries.

pub mod ion;
pub mod m4u;

use crate::backend::ion::GraphicBufferQuery;
use crate::entry::BufferHeader;
use crate::entry::MvaEntry;
use crate::entry::NativeHandle;
use crate::entry::VirtAddr;
use crate::Error;
use std::fmt;
use std::sync::Arc;

/// The hardware memory management scheme a backend drives.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Shared memory objects from the ION allocator.
    Ion,
    /// Direct device memory registered with the multimedia IOMMU.
    M4u,
}

impl BackendKind {
    /// Selects a backend from a selector tag.
    ///
    /// Tags starting with `m4u` (or `direct-device-memory`) select
    /// [`BackendKind::M4u`]. Everything else selects [`BackendKind::Ion`].
    pub fn from_tag(tag: &str) -> Self {
        if tag.starts_with("m4u") || tag == "direct-device-memory" {
            Self::M4u
        } else {
            if !tag.starts_with("ion") && tag != "shared-memory-object" {
                tracing::warn!(tag, "unknown backend tag, using ion");
            }
            Self::Ion
        }
    }

    /// The short name of the backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ion => "ion",
            Self::M4u => "m4u",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recognized boolean property key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BoolProperty {
    /// Secure, cache coherent buffers.
    Mci,
    /// Imported source descriptors stay owned by the caller.
    Locally,
    /// Buffers are used by the decoder rather than the encoder.
    Vdec,
}

impl BoolProperty {
    /// Keys match by prefix, so `"MCI_MODE"` is [`BoolProperty::Mci`].
    pub fn parse(key: &str) -> Option<Self> {
        if key.starts_with("MCI") {
            Some(Self::Mci)
        } else if key.starts_with("Locally") {
            Some(Self::Locally)
        } else if key.starts_with("VDEC") {
            Some(Self::Vdec)
        } else {
            None
        }
    }
}

/// A memory backend.
///
/// Backends create entries and are the only code that can destroy them:
/// [`MvaBackend::free`] consumes the entry.
pub trait MvaBackend: Send {
    /// The kind of this backend.
    fn kind(&self) -> BackendKind;

    /// Sets a boolean mode flag. Unknown keys are logged and ignored.
    fn set_bool_property(&mut self, key: &str, value: bool);

    /// Allocates and maps `size` bytes aligned to `align`.
    fn allocate(
        &self,
        align: usize,
        size: usize,
        buffer_header: BufferHeader,
    ) -> Result<MvaEntry, Error>;

    /// Maps caller-owned memory at `va`.
    fn import_va(
        &self,
        va: VirtAddr,
        size: usize,
        buffer_header: BufferHeader,
    ) -> Result<MvaEntry, Error>;

    /// Maps the memory behind a platform graphic buffer.
    fn import_handle(
        &self,
        handle: NativeHandle,
        buffer_header: BufferHeader,
    ) -> Result<MvaEntry, Error>;

    /// Sets the collaborator used by [`MvaBackend::import_handle`].
    fn set_buffer_query(&mut self, _query: Arc<dyn GraphicBufferQuery>) -> Result<(), Error> {
        Err(Error::Unsupported {
            backend: self.kind(),
            operation: "set_buffer_query",
        })
    }

    /// Unmaps and releases an entry.
    ///
    /// Every release step runs even if an earlier one fails. The first
    /// failure is returned.
    fn free(&self, entry: MvaEntry) -> anyhow::Result<()>;

    /// Logs the backend-specific state of an entry.
    fn dump(&self, entry: &MvaEntry);
}
