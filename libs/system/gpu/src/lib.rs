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
mod backend;
mod program;
mod readback;
mod recording;

pub use crate::{
    backend::{
        Access, BufferHandle, ComputeBackend, GlobalTexture, KernelDispatch, KernelId, ReadbackId,
        ReadbackStatus, TextureBinding, TextureDesc, TextureFormat, TextureHandle,
    },
    program::{reflect_compute_kernels, KernelInfo},
    recording::{RecordedDispatch, RecordingBackend},
};

// Note: re-export so that callers can reach the device without a second dependency.
pub use wgpu;

use crate::readback::ReadbackTracker;
use anyhow::{anyhow, bail, Result};
use futures::executor::block_on;
use log::{info, trace};
use std::collections::HashMap;
use wgpu::util::DeviceExt;

struct Kernel {
    name: String,
    work_group_size: [u32; 3],
    pipeline: wgpu::ComputePipeline,
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

/// A headless wgpu device that implements `ComputeBackend`.
pub struct Gpu {
    _adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,

    kernels: Vec<Kernel>,
    textures: HashMap<TextureHandle, GpuTexture>,
    buffers: HashMap<BufferHandle, wgpu::Buffer>,
    globals: HashMap<GlobalTexture, TextureHandle>,
    parameters: Option<wgpu::Buffer>,
    encoder: Option<wgpu::CommandEncoder>,
    readbacks: ReadbackTracker,
    next_handle: u32,
}

impl Gpu {
    pub fn new_headless() -> Result<Self> {
        block_on(Self::new_headless_async())
    }

    pub async fn new_headless_async() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| anyhow!("no suitable graphics adapter"))?;
        info!("using adapter: {:?}", adapter.get_info());

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("sky-lut-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await?;

        Ok(Self {
            _adapter: adapter,
            device,
            queue,
            kernels: Vec::new(),
            textures: HashMap::new(),
            buffers: HashMap::new(),
            globals: HashMap::new(),
            parameters: None,
            encoder: None,
            readbacks: ReadbackTracker::default(),
            next_handle: 0,
        })
    }

    /// Compile a WGSL program and register each of its compute entry points
    /// as a kernel that can be found by name.
    pub fn load_program(&mut self, label: &str, source: &str) -> Result<()> {
        let kernels = reflect_compute_kernels(source)?;
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        for info in kernels {
            self.device.push_error_scope(wgpu::ErrorFilter::Validation);
            let pipeline = self
                .device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(info.name()),
                    layout: None,
                    module: &module,
                    entry_point: info.name(),
                });
            if let Some(err) = block_on(self.device.pop_error_scope()) {
                bail!("{}: failed to build kernel {}: {}", label, info.name(), err);
            }
            trace!("loaded kernel {} from {}", info.name(), label);
            self.kernels.push(Kernel {
                name: info.name().to_owned(),
                work_group_size: info.work_group_size(),
                pipeline,
            });
        }
        Ok(())
    }

    pub fn global_texture_view(&self, slot: GlobalTexture) -> Option<&wgpu::TextureView> {
        self.globals
            .get(&slot)
            .and_then(|handle| self.textures.get(handle))
            .map(|texture| &texture.view)
    }

    pub fn pending_readbacks(&self) -> usize {
        self.readbacks.len()
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn next_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }
}

impl ComputeBackend for Gpu {
    fn find_kernel(&self, name: &str) -> Option<KernelId> {
        self.kernels
            .iter()
            .position(|kernel| kernel.name == name)
            .map(|offset| KernelId(offset as u32))
    }

    fn work_group_size(&self, kernel: KernelId) -> [u32; 3] {
        self.kernels
            .get(kernel.0 as usize)
            .map(|kernel| kernel.work_group_size)
            .unwrap_or([1, 1, 1])
    }

    fn create_texture(&mut self, label: &str, desc: &TextureDesc) -> Result<TextureHandle> {
        let limit = self.device.limits().max_texture_dimension_2d;
        if desc.width == 0 || desc.height == 0 || desc.width > limit || desc.height > limit {
            bail!(
                "{}: cannot allocate a {}x{} texture (limit {})",
                label,
                desc.width,
                desc.height,
                limit
            );
        }
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST;
        if desc.random_write {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format.to_wgpu(),
            usage,
            view_formats: &[],
        });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            bail!("{}: {}", label, err);
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(label),
            ..Default::default()
        });

        let handle = TextureHandle(self.next_handle());
        trace!(
            "allocated {} {} ({}x{} {}, {} bytes)",
            label,
            handle,
            desc.width,
            desc.height,
            desc.format,
            desc.byte_size()
        );
        self.textures.insert(handle, GpuTexture { texture, view });
        Ok(handle)
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if let Some(gpu_texture) = self.textures.remove(&texture) {
            trace!("released {}", texture);
            // The open encoder may still refer to it; dropping defers the free.
            if self.encoder.is_none() {
                gpu_texture.texture.destroy();
            }
        }
        self.globals.retain(|_, bound| *bound != texture);
    }

    fn create_buffer(&mut self, label: &str, size: u64) -> Result<BufferHandle> {
        if size == 0 {
            bail!("{}: cannot allocate an empty buffer", label);
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            bail!("{}: {}", label, err);
        }
        let handle = BufferHandle(self.next_handle());
        trace!("allocated {} {} ({} bytes)", label, handle, size);
        self.buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) {
        if let Some(gpu_buffer) = self.buffers.remove(&buffer) {
            trace!("released {}", buffer);
            if self.encoder.is_none() {
                gpu_buffer.destroy();
            }
        }
    }

    fn upload_parameters(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            bail!("parameter block must not be empty");
        }
        if let Some(parameters) = &self.parameters {
            if parameters.size() == data.len() as u64 {
                self.queue.write_buffer(parameters, 0, data);
                return Ok(());
            }
        }
        trace!("uploading parameter block with {} bytes", data.len());
        self.parameters = Some(
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("sky-lut-parameters"),
                    contents: data,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                }),
        );
        Ok(())
    }

    fn dispatch(&mut self, dispatch: &KernelDispatch<'_>) -> Result<()> {
        let kernel = self
            .kernels
            .get(dispatch.kernel.0 as usize)
            .ok_or_else(|| anyhow!("{}: unknown {}", dispatch.label, dispatch.kernel))?;
        let parameters = self
            .parameters
            .as_ref()
            .ok_or_else(|| anyhow!("{}: no parameter block uploaded", dispatch.label))?;
        let constants = if dispatch.constants.is_empty() {
            None
        } else {
            Some(
                self.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("sky-lut-dispatch-constants"),
                        contents: dispatch.constants,
                        usage: wgpu::BufferUsages::UNIFORM,
                    }),
            )
        };

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: parameters.as_entire_binding(),
        }];
        if let Some(constants) = &constants {
            entries.push(wgpu::BindGroupEntry {
                binding: 1,
                resource: constants.as_entire_binding(),
            });
        }
        let mut binding = 2;
        for texture_binding in dispatch.textures {
            let texture = self.textures.get(&texture_binding.texture).ok_or_else(|| {
                anyhow!("{}: unknown {}", dispatch.label, texture_binding.texture)
            })?;
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: wgpu::BindingResource::TextureView(&texture.view),
            });
            binding += 1;
        }
        for buffer in dispatch.buffers {
            let gpu_buffer = self
                .buffers
                .get(buffer)
                .ok_or_else(|| anyhow!("{}: unknown {}", dispatch.label, buffer))?;
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: gpu_buffer.as_entire_binding(),
            });
            binding += 1;
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(dispatch.label),
            layout: &kernel.pipeline.get_bind_group_layout(0),
            entries: &entries,
        });
        if let Some(err) = block_on(self.device.pop_error_scope()) {
            bail!("{}: {}", dispatch.label, err);
        }

        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("sky-lut-commands"),
            })
        });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(dispatch.label),
                timestamp_writes: None,
            });
            cpass.set_pipeline(&kernel.pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            let [x, y, z] = dispatch.groups;
            cpass.dispatch_workgroups(x, y, z);
        }
        trace!("recorded {} with groups {:?}", dispatch.label, dispatch.groups);
        Ok(())
    }

    fn submit(&mut self) -> bool {
        let encoder = match self.encoder.take() {
            Some(encoder) => encoder,
            None => return false,
        };
        self.queue.submit(Some(encoder.finish()));
        self.readbacks.start_mapping();
        true
    }

    fn request_readback(&mut self, buffer: BufferHandle) -> Result<ReadbackId> {
        let source = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| anyhow!("readback from unknown {}", buffer))?;
        let size = source.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sky-lut-readback-staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("sky-lut-commands"),
            })
        });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        Ok(self.readbacks.enqueue(staging))
    }

    fn poll_readback(&mut self, readback: ReadbackId) -> ReadbackStatus {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        self.readbacks.poll(readback)
    }

    fn cancel_readback(&mut self, readback: ReadbackId) {
        self.readbacks.cancel(readback);
    }

    fn bind_global_texture(&mut self, slot: GlobalTexture, texture: TextureHandle) {
        if self.globals.insert(slot, texture) != Some(texture) {
            trace!("bound {} to {}", texture, slot.name());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PROGRAM: &str = r#"
struct Parameters {
    scale: vec4<f32>,
}

@group(0) @binding(0) var<uniform> parameters: Parameters;
@group(0) @binding(2) var<storage, read_write> values: array<vec4<f32>>;

@compute @workgroup_size(1, 1, 1)
fn fill(@builtin(global_invocation_id) id: vec3<u32>) {
    values[id.x] = parameters.scale;
}
"#;

    // Requires a real adapter; run explicitly on a machine with a GPU.
    #[test]
    #[ignore]
    fn test_dispatch_and_readback() -> Result<()> {
        let mut gpu = Gpu::new_headless()?;
        gpu.load_program("fill", PROGRAM)?;
        let kernel = gpu.find_kernel("fill").ok_or_else(|| anyhow!("no fill kernel"))?;
        assert_eq!(gpu.work_group_size(kernel), [1, 1, 1]);

        let scale = [1f32, 2., 3., 4.];
        let bytes = scale.iter().flat_map(|v| v.to_ne_bytes()).collect::<Vec<u8>>();
        gpu.upload_parameters(&bytes)?;
        let buffer = gpu.create_buffer("values", 16 * 4)?;
        gpu.dispatch(&KernelDispatch {
            label: "fill",
            kernel,
            groups: [4, 1, 1],
            constants: &[],
            textures: &[],
            buffers: &[buffer],
        })?;
        let readback = gpu.request_readback(buffer)?;
        assert!(gpu.submit());
        assert!(!gpu.submit());

        let _ = gpu.device().poll(wgpu::Maintain::Wait);
        match gpu.poll_readback(readback) {
            ReadbackStatus::Complete(data) => assert_eq!(&data[0..16], &bytes[..]),
            other => bail!("unexpected readback status {:?}", other),
        }
        gpu.release_buffer(buffer);
        Ok(())
    }

    #[test]
    #[ignore]
    fn test_cancel_unsubmitted_readback() -> Result<()> {
        let mut gpu = Gpu::new_headless()?;
        let buffer = gpu.create_buffer("values", 64)?;
        let readback = gpu.request_readback(buffer)?;
        gpu.cancel_readback(readback);
        gpu.release_buffer(buffer);
        assert_eq!(gpu.pending_readbacks(), 0);

        // The copy recorded before the release still submits cleanly.
        gpu.device().push_error_scope(wgpu::ErrorFilter::Validation);
        assert!(gpu.submit());
        assert!(block_on(gpu.device().pop_error_scope()).is_none());
        assert!(matches!(
            gpu.poll_readback(readback),
            ReadbackStatus::Failed(_)
        ));
        Ok(())
    }
}
