// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Direct device memory backend.
//!
//! Buffers are ordinary process memory that is registered with a
//! [`TranslationTable`] to obtain a device-visible address.

use super::BackendKind;
use super::BoolProperty;
use super::MvaBackend;
use crate::device_cache::SharedCache;
use crate::entry::BufferHeader;
use crate::entry::EntryResources;
use crate::entry::MvaEntry;
use crate::entry::NativeHandle;
use crate::entry::VirtAddr;
use crate::mapping::AlignedBuffer;
use crate::pagemap::PagemapTable;
use crate::Error;
use anyhow::Context;
use std::sync::Arc;

/// Registration parameters for a range.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct M4uBufferConfig {
    /// The range is secure memory.
    pub security: bool,
    /// The device snoops CPU caches for the range.
    pub cache_coherent: bool,
}

/// Registers process memory ranges for device access.
pub trait TranslationTable: Send + Sync {
    /// Makes `va..va + len` device visible and returns its device address.
    fn map(&self, va: VirtAddr, len: usize, config: &M4uBufferConfig) -> anyhow::Result<u64>;

    /// Reverses a [`TranslationTable::map`] call with the same arguments.
    fn unmap(
        &self,
        va: VirtAddr,
        pa: u64,
        len: usize,
        config: &M4uBufferConfig,
    ) -> anyhow::Result<()>;
}

static TABLES: SharedCache<PagemapTable> = SharedCache::new();

/// Per-entry state of the direct device memory backend.
#[derive(Debug)]
pub(crate) struct M4uResources {
    /// The backing allocation, for entries the backend allocated.
    pub buffer: Option<AlignedBuffer>,
    /// The configuration the range was registered with.
    pub config: M4uBufferConfig,
}

/// The direct device memory backend.
pub struct M4uBackend {
    table: Arc<dyn TranslationTable>,
    mci_mode: bool,
}

impl M4uBackend {
    /// Opens the process-wide pagemap translation table.
    pub fn open() -> anyhow::Result<Self> {
        let table = TABLES.get_or_try_insert_with("pagemap", PagemapTable::open)?;
        Ok(Self::new(table))
    }

    /// Returns a backend that registers ranges with `table`.
    pub fn new(table: Arc<dyn TranslationTable>) -> Self {
        Self {
            table,
            mci_mode: false,
        }
    }

    fn buffer_config(&self) -> M4uBufferConfig {
        M4uBufferConfig {
            security: self.mci_mode,
            cache_coherent: self.mci_mode,
        }
    }

    fn map(
        &self,
        va: VirtAddr,
        size: usize,
        buffer_header: BufferHeader,
        buffer: Option<AlignedBuffer>,
    ) -> Result<MvaEntry, Error> {
        let config = self.buffer_config();
        let pa = self
            .table
            .map(va, size, &config)
            .with_context(|| format!("failed to register {size:#x} bytes at {va}"))
            .map_err(Error::Map)?;

        let entry = MvaEntry {
            va,
            pa,
            size,
            buffer_header,
            native_handle: None,
            allocated: buffer.is_some(),
            secure_handle: 0,
            resources: EntryResources::M4u(M4uResources { buffer, config }),
        };
        tracing::debug!(
            %va,
            pa,
            size,
            %buffer_header,
            allocated = entry.allocated,
            "m4u map"
        );
        Ok(entry)
    }
}

impl MvaBackend for M4uBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::M4u
    }

    fn set_bool_property(&mut self, key: &str, value: bool) {
        match BoolProperty::parse(key) {
            Some(BoolProperty::Mci) => self.mci_mode = value,
            _ => tracing::debug!(key, "unsupported m4u property"),
        }
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
        let align = align.max(1);
        if !align.is_power_of_two() {
            return Err(Error::InvalidRequest("alignment must be a power of two"));
        }
        let buffer = AlignedBuffer::new(align, size)
            .with_context(|| format!("failed to allocate {size:#x} bytes"))
            .map_err(Error::Map)?;
        // The allocation is dropped if registration fails.
        self.map(buffer.va(), size, buffer_header, Some(buffer))
    }

    fn import_va(
        &self,
        va: VirtAddr,
        size: usize,
        buffer_header: BufferHeader,
    ) -> Result<MvaEntry, Error> {
        if size == 0 {
            return Err(Error::InvalidRequest("size must be greater than 0"));
        }
        self.map(va, size, buffer_header, None)
    }

    fn import_handle(
        &self,
        _handle: NativeHandle,
        _buffer_header: BufferHeader,
    ) -> Result<MvaEntry, Error> {
        Err(Error::Unsupported {
            backend: BackendKind::M4u,
            operation: "import_handle",
        })
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
        let EntryResources::M4u(M4uResources { buffer, config }) = resources else {
            anyhow::bail!("entry at {va} was not created by the m4u backend");
        };

        tracing::debug!(
            %va,
            pa,
            size,
            %buffer_header,
            allocated = buffer.is_some(),
            "m4u free"
        );
        let result = self
            .table
            .unmap(va, pa, size, &config)
            .with_context(|| format!("failed to unregister {va}"));
        drop(buffer);
        result
    }

    fn dump(&self, entry: &MvaEntry) {
        tracing::debug!(
            va = %entry.va,
            pa = entry.pa,
            size = entry.size,
            buffer_header = %entry.buffer_header,
            allocated = entry.allocated,
            "m4u entry"
        );
    }
}
