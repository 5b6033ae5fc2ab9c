// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process stand-ins for the kernel devices, for unit tests.

use crate::backend::ion::GraphicBufferQuery;
use crate::backend::ion::IonDevice;
use crate::backend::m4u::M4uBufferConfig;
use crate::backend::m4u::TranslationTable;
use crate::entry::NativeHandle;
use crate::entry::VirtAddr;
use ion_device::ioctl::BufferConfig;
use ion_device::IonHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn temp_buffer(len: usize) -> File {
    let file = tempfile::tempfile().unwrap();
    file.set_len(len as u64).unwrap();
    file
}

/// An ION device whose buffers are temporary files.
#[derive(Default)]
pub struct FakeIon {
    state: Mutex<FakeIonState>,
}

#[derive(Default)]
struct FakeIonState {
    next_handle: i32,
    buffers: HashMap<IonHandle, File>,
    allocs: Vec<(usize, usize)>,
    imports: usize,
    freed: Vec<IonHandle>,
    last_config: Option<BufferConfig>,
    fail_share: bool,
    fail_config: bool,
    fail_phys: bool,
    fail_free: bool,
}

impl FakeIon {
    pub const DEVICE_FD: RawFd = 77;

    pub fn pa_of(handle: IonHandle) -> u64 {
        0x4000_0000 + handle.0 as u64 * 0x10_0000
    }

    fn insert(&self, file: File) -> IonHandle {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = IonHandle(state.next_handle);
        state.buffers.insert(handle, file);
        handle
    }

    pub fn allocs(&self) -> Vec<(usize, usize)> {
        self.state.lock().allocs.clone()
    }

    pub fn imports(&self) -> usize {
        self.state.lock().imports
    }

    pub fn freed(&self) -> Vec<IonHandle> {
        self.state.lock().freed.clone()
    }

    /// The number of handles not yet freed.
    pub fn live(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn last_config(&self) -> Option<BufferConfig> {
        self.state.lock().last_config
    }

    pub fn fail_share(&self, fail: bool) {
        self.state.lock().fail_share = fail;
    }

    pub fn fail_config(&self, fail: bool) {
        self.state.lock().fail_config = fail;
    }

    pub fn fail_phys(&self, fail: bool) {
        self.state.lock().fail_phys = fail;
    }

    pub fn fail_free(&self, fail: bool) {
        self.state.lock().fail_free = fail;
    }
}

impl IonDevice for FakeIon {
    fn device_fd(&self) -> RawFd {
        Self::DEVICE_FD
    }

    fn alloc(
        &self,
        len: usize,
        align: usize,
        _heap_id_mask: u32,
        _flags: u32,
    ) -> anyhow::Result<IonHandle> {
        self.state.lock().allocs.push((len, align));
        Ok(self.insert(temp_buffer(len)))
    }

    fn import(&self, fd: BorrowedFd<'_>) -> anyhow::Result<IonHandle> {
        let file = File::from(fd.try_clone_to_owned()?);
        self.state.lock().imports += 1;
        Ok(self.insert(file))
    }

    fn share(&self, handle: IonHandle) -> anyhow::Result<OwnedFd> {
        let state = self.state.lock();
        if state.fail_share {
            anyhow::bail!("share failed");
        }
        let file = state
            .buffers
            .get(&handle)
            .ok_or_else(|| anyhow::anyhow!("no buffer {handle}"))?;
        Ok(file.as_fd().try_clone_to_owned()?)
    }

    fn free(&self, handle: IonHandle) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state
            .buffers
            .remove(&handle)
            .ok_or_else(|| anyhow::anyhow!("no buffer {handle}"))?;
        state.freed.push(handle);
        if state.fail_free {
            anyhow::bail!("free failed");
        }
        Ok(())
    }

    fn config_buffer(&self, _handle: IonHandle, config: &BufferConfig) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.last_config = Some(*config);
        if state.fail_config {
            anyhow::bail!("config failed");
        }
        Ok(())
    }

    fn phys_addr(&self, handle: IonHandle) -> anyhow::Result<u64> {
        if self.state.lock().fail_phys {
            anyhow::bail!("phys failed");
        }
        Ok(Self::pa_of(handle))
    }
}

/// Graphic buffers backed by temporary files.
pub struct FakeBufferQuery {
    buffers: Vec<(NativeHandle, usize, File)>,
}

impl FakeBufferQuery {
    pub fn new(buffers: &[(NativeHandle, usize)]) -> Self {
        Self {
            buffers: buffers
                .iter()
                .map(|&(handle, size)| (handle, size, temp_buffer(size)))
                .collect(),
        }
    }

    fn find(&self, handle: NativeHandle) -> anyhow::Result<&(NativeHandle, usize, File)> {
        self.buffers
            .iter()
            .find(|(h, _, _)| *h == handle)
            .ok_or_else(|| anyhow::anyhow!("no graphic buffer {handle}"))
    }

    /// Whether the descriptor of `handle` is still open.
    pub fn is_open(&self, handle: NativeHandle) -> bool {
        let Ok((_, _, file)) = self.find(handle) else {
            return false;
        };
        nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFD).is_ok()
    }
}

impl GraphicBufferQuery for FakeBufferQuery {
    fn alloc_size(&self, handle: NativeHandle) -> anyhow::Result<usize> {
        Ok(self.find(handle)?.1)
    }

    fn ion_fd(&self, handle: NativeHandle) -> anyhow::Result<BorrowedFd<'_>> {
        Ok(self.find(handle)?.2.as_fd())
    }
}

/// A translation table that records registrations.
#[derive(Default)]
pub struct FakeTable {
    state: Mutex<FakeTableState>,
}

#[derive(Default)]
struct FakeTableState {
    mapped: Vec<(VirtAddr, usize)>,
    last_config: Option<M4uBufferConfig>,
    fail_map: bool,
}

impl FakeTable {
    pub fn pa_of(va: VirtAddr) -> u64 {
        0x1_0000_0000 + va.get() as u64
    }

    pub fn mapped(&self) -> Vec<(VirtAddr, usize)> {
        self.state.lock().mapped.clone()
    }

    pub fn last_config(&self) -> Option<M4uBufferConfig> {
        self.state.lock().last_config
    }

    pub fn fail_map(&self, fail: bool) {
        self.state.lock().fail_map = fail;
    }
}

impl TranslationTable for FakeTable {
    fn map(&self, va: VirtAddr, len: usize, config: &M4uBufferConfig) -> anyhow::Result<u64> {
        let mut state = self.state.lock();
        if state.fail_map {
            anyhow::bail!("map failed");
        }
        state.last_config = Some(*config);
        state.mapped.push((va, len));
        Ok(Self::pa_of(va))
    }

    fn unmap(
        &self,
        va: VirtAddr,
        pa: u64,
        len: usize,
        _config: &M4uBufferConfig,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        anyhow::ensure!(pa == Self::pa_of(va), "wrong pa for {va}");
        let i = state
            .mapped
            .iter()
            .position(|&m| m == (va, len))
            .ok_or_else(|| anyhow::anyhow!("{va} not mapped"))?;
        state.mapped.remove(i);
        Ok(())
    }
}
