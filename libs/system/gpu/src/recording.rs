// This file is part of Nitrogen.
//
// Nitrogen is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Nitrogen is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Nitrogen.  If not, see <http://www.gnu.org/licenses/>.
use crate::backend::{
    BufferHandle, ComputeBackend, GlobalTexture, KernelDispatch, KernelId, ReadbackId,
    ReadbackStatus, TextureBinding, TextureDesc, TextureHandle,
};
use anyhow::{anyhow, bail, Result};
use log::trace;
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedDispatch {
    pub label: String,
    pub kernel: String,
    pub groups: [u32; 3],
    pub constants: Vec<u8>,
    pub textures: Vec<TextureBinding>,
    pub buffers: Vec<BufferHandle>,
}

/// A device-free `ComputeBackend` that records everything it is asked to do.
///
/// Readbacks stay in flight until the owner resolves them with
/// `complete_readback` or `fail_readback`. Releasing a resource that is not
/// live panics, so double releases surface immediately.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    kernels: Vec<(String, [u32; 3])>,
    textures: HashMap<TextureHandle, TextureDesc>,
    buffers: HashMap<BufferHandle, u64>,
    released_textures: Vec<TextureHandle>,
    released_buffers: Vec<BufferHandle>,
    texture_allocations: usize,
    fail_allocations: bool,
    next_handle: u32,

    parameter_uploads: Vec<Vec<u8>>,
    recorded: Vec<RecordedDispatch>,
    recorded_copies: usize,
    submissions: Vec<Vec<RecordedDispatch>>,

    next_readback: u32,
    readback_requests: Vec<(ReadbackId, BufferHandle)>,
    readbacks: HashMap<ReadbackId, ReadbackStatus>,

    globals: HashMap<GlobalTexture, TextureHandle>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kernel(mut self, name: &str, work_group_size: [u32; 3]) -> Self {
        self.kernels.push((name.to_owned(), work_group_size));
        self
    }

    /// While set, every texture and buffer allocation fails.
    pub fn set_fail_allocations(&mut self, fail: bool) {
        self.fail_allocations = fail;
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn texture_allocations(&self) -> usize {
        self.texture_allocations
    }

    pub fn texture_desc(&self, texture: TextureHandle) -> Option<&TextureDesc> {
        self.textures.get(&texture)
    }

    pub fn released_textures(&self) -> &[TextureHandle] {
        &self.released_textures
    }

    pub fn released_buffers(&self) -> &[BufferHandle] {
        &self.released_buffers
    }

    pub fn parameter_uploads(&self) -> &[Vec<u8>] {
        &self.parameter_uploads
    }

    /// Dispatches recorded since the last submit.
    pub fn pending_dispatches(&self) -> &[RecordedDispatch] {
        &self.recorded
    }

    pub fn submissions(&self) -> &[Vec<RecordedDispatch>] {
        &self.submissions
    }

    /// Every dispatch ever recorded, submitted or not, in order.
    pub fn dispatches(&self) -> impl Iterator<Item = &RecordedDispatch> {
        self.submissions.iter().flatten().chain(self.recorded.iter())
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches().count()
    }

    pub fn dispatches_of<'a>(
        &'a self,
        kernel: &'a str,
    ) -> impl Iterator<Item = &'a RecordedDispatch> {
        self.dispatches().filter(move |dispatch| dispatch.kernel == kernel)
    }

    pub fn readback_requests(&self) -> &[(ReadbackId, BufferHandle)] {
        &self.readback_requests
    }

    pub fn last_readback(&self) -> Option<ReadbackId> {
        self.readback_requests.last().map(|(id, _)| *id)
    }

    /// Readbacks requested and neither consumed nor cancelled.
    pub fn open_readbacks(&self) -> usize {
        self.readbacks.len()
    }

    pub fn complete_readback(&mut self, readback: ReadbackId, data: Vec<u8>) {
        self.resolve_readback(readback, ReadbackStatus::Complete(data));
    }

    pub fn fail_readback(&mut self, readback: ReadbackId, reason: &str) {
        self.resolve_readback(readback, ReadbackStatus::Failed(reason.to_owned()));
    }

    pub fn global_texture(&self, slot: GlobalTexture) -> Option<TextureHandle> {
        self.globals.get(&slot).copied()
    }

    fn resolve_readback(&mut self, readback: ReadbackId, status: ReadbackStatus) {
        match self.readbacks.get_mut(&readback) {
            Some(slot) => *slot = status,
            None => panic!("resolving unknown {}", readback),
        }
    }

    fn next_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }
}

impl ComputeBackend for RecordingBackend {
    fn find_kernel(&self, name: &str) -> Option<KernelId> {
        self.kernels
            .iter()
            .position(|(kernel, _)| kernel == name)
            .map(|offset| KernelId(offset as u32))
    }

    fn work_group_size(&self, kernel: KernelId) -> [u32; 3] {
        self.kernels
            .get(kernel.0 as usize)
            .map(|(_, size)| *size)
            .unwrap_or([1, 1, 1])
    }

    fn create_texture(&mut self, label: &str, desc: &TextureDesc) -> Result<TextureHandle> {
        if self.fail_allocations {
            bail!("{}: out of device memory", label);
        }
        if desc.width == 0 || desc.height == 0 {
            bail!("{}: cannot allocate a {}x{} texture", label, desc.width, desc.height);
        }
        let handle = TextureHandle(self.next_handle());
        trace!("allocated {} {}", label, handle);
        self.textures.insert(handle, *desc);
        self.texture_allocations += 1;
        Ok(handle)
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        assert!(
            self.textures.remove(&texture).is_some(),
            "release of unknown or already released {}",
            texture
        );
        self.released_textures.push(texture);
        self.globals.retain(|_, bound| *bound != texture);
    }

    fn create_buffer(&mut self, label: &str, size: u64) -> Result<BufferHandle> {
        if self.fail_allocations {
            bail!("{}: out of device memory", label);
        }
        let handle = BufferHandle(self.next_handle());
        trace!("allocated {} {} ({} bytes)", label, handle, size);
        self.buffers.insert(handle, size);
        Ok(handle)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        assert!(
            self.buffers.remove(&buffer).is_some(),
            "release of unknown or already released {}",
            buffer
        );
        self.released_buffers.push(buffer);
    }

    fn upload_parameters(&mut self, data: &[u8]) -> Result<()> {
        self.parameter_uploads.push(data.to_vec());
        Ok(())
    }

    fn dispatch(&mut self, dispatch: &KernelDispatch<'_>) -> Result<()> {
        let (kernel, _) = self
            .kernels
            .get(dispatch.kernel.0 as usize)
            .ok_or_else(|| anyhow!("{}: unknown {}", dispatch.label, dispatch.kernel))?;
        for binding in dispatch.textures {
            if !self.textures.contains_key(&binding.texture) {
                bail!("{}: dispatch reads released {}", dispatch.label, binding.texture);
            }
        }
        for buffer in dispatch.buffers {
            if !self.buffers.contains_key(buffer) {
                bail!("{}: dispatch reads released {}", dispatch.label, buffer);
            }
        }
        self.recorded.push(RecordedDispatch {
            label: dispatch.label.to_owned(),
            kernel: kernel.to_owned(),
            groups: dispatch.groups,
            constants: dispatch.constants.to_vec(),
            textures: dispatch.textures.to_vec(),
            buffers: dispatch.buffers.to_vec(),
        });
        Ok(())
    }

    fn submit(&mut self) -> bool {
        if self.recorded.is_empty() && self.recorded_copies == 0 {
            return false;
        }
        self.recorded_copies = 0;
        let recorded = std::mem::take(&mut self.recorded);
        self.submissions.push(recorded);
        true
    }

    fn request_readback(&mut self, buffer: BufferHandle) -> Result<ReadbackId> {
        if !self.buffers.contains_key(&buffer) {
            bail!("readback from unknown {}", buffer);
        }
        let id = ReadbackId(self.next_readback);
        self.next_readback += 1;
        self.recorded_copies += 1;
        self.readback_requests.push((id, buffer));
        self.readbacks.insert(id, ReadbackStatus::InFlight);
        Ok(id)
    }

    fn poll_readback(&mut self, readback: ReadbackId) -> ReadbackStatus {
        let status = match self.readbacks.get(&readback) {
            Some(status) => status.clone(),
            None => return ReadbackStatus::Failed(format!("unknown {}", readback)),
        };
        if status.is_terminal() {
            self.readbacks.remove(&readback);
        }
        status
    }

    fn cancel_readback(&mut self, readback: ReadbackId) {
        if self.readbacks.remove(&readback).is_some() {
            trace!("cancelled {}", readback);
        }
    }

    fn bind_global_texture(&mut self, slot: GlobalTexture, texture: TextureHandle) {
        self.globals.insert(slot, texture);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::TextureFormat;

    #[test]
    fn test_record_and_submit() -> Result<()> {
        let mut backend = RecordingBackend::new().with_kernel("fill", [8, 8, 1]);
        let kernel = backend.find_kernel("fill").ok_or_else(|| anyhow!("no kernel"))?;
        assert_eq!(backend.work_group_size(kernel), [8, 8, 1]);
        assert!(backend.find_kernel("missing").is_none());

        let desc = TextureDesc::storage(4, 4, TextureFormat::Rgba16Float);
        let texture = backend.create_texture("target", &desc)?;
        assert!(!backend.submit());
        backend.dispatch(&KernelDispatch {
            label: "fill",
            kernel,
            groups: [1, 1, 1],
            constants: &[],
            textures: &[TextureBinding::write(texture)],
            buffers: &[],
        })?;
        assert_eq!(backend.pending_dispatches().len(), 1);
        assert!(backend.submit());
        assert_eq!(backend.submissions().len(), 1);
        assert_eq!(backend.dispatch_count(), 1);
        assert!(!backend.submit());
        Ok(())
    }

    #[test]
    fn test_readback_lifecycle() -> Result<()> {
        let mut backend = RecordingBackend::new();
        let buffer = backend.create_buffer("out", 16)?;
        let readback = backend.request_readback(buffer)?;
        assert!(backend.submit());
        assert_eq!(backend.poll_readback(readback), ReadbackStatus::InFlight);
        backend.complete_readback(readback, vec![1, 2, 3]);
        assert_eq!(
            backend.poll_readback(readback),
            ReadbackStatus::Complete(vec![1, 2, 3])
        );
        assert!(matches!(
            backend.poll_readback(readback),
            ReadbackStatus::Failed(_)
        ));
        assert_eq!(backend.open_readbacks(), 0);
        Ok(())
    }

    #[test]
    fn test_cancel_readback() -> Result<()> {
        let mut backend = RecordingBackend::new();
        let buffer = backend.create_buffer("out", 16)?;
        let readback = backend.request_readback(buffer)?;
        assert_eq!(backend.open_readbacks(), 1);
        backend.cancel_readback(readback);
        backend.cancel_readback(readback);
        assert_eq!(backend.open_readbacks(), 0);
        assert!(matches!(
            backend.poll_readback(readback),
            ReadbackStatus::Failed(_)
        ));
        Ok(())
    }

    #[test]
    fn test_failed_allocation() {
        let mut backend = RecordingBackend::new();
        backend.set_fail_allocations(true);
        let desc = TextureDesc::storage(4, 4, TextureFormat::Rgba32Float);
        assert!(backend.create_texture("target", &desc).is_err());
        assert_eq!(backend.live_textures(), 0);
        backend.set_fail_allocations(false);
        assert!(backend.create_texture("target", &desc).is_ok());
    }

    #[test]
    #[should_panic]
    fn test_double_release_panics() {
        let mut backend = RecordingBackend::new();
        let desc = TextureDesc::storage(4, 4, TextureFormat::Rgba32Float);
        let texture = backend.create_texture("target", &desc).unwrap();
        backend.release_texture(texture);
        backend.release_texture(texture);
    }

    #[test]
    fn test_dispatch_of_released_texture_fails() -> Result<()> {
        let mut backend = RecordingBackend::new().with_kernel("fill", [1, 1, 1]);
        let kernel = backend.find_kernel("fill").ok_or_else(|| anyhow!("no kernel"))?;
        let desc = TextureDesc::storage(4, 4, TextureFormat::Rgba32Float);
        let texture = backend.create_texture("target", &desc)?;
        backend.release_texture(texture);
        let result = backend.dispatch(&KernelDispatch {
            label: "fill",
            kernel,
            groups: [1, 1, 1],
            constants: &[],
            textures: &[TextureBinding::read(texture)],
            buffers: &[],
        });
        assert!(result.is_err());
        Ok(())
    }
}
