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
use anyhow::{bail, Result};
use std::{fmt, str::FromStr};

macro_rules! make_handle {
    ($name:ident, $prefix:expr) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}#{}", $prefix, self.0)
            }
        }
    };
}

make_handle!(TextureHandle, "texture");
make_handle!(BufferHandle, "buffer");
make_handle!(KernelId, "kernel");
make_handle!(ReadbackId, "readback");

/// Texel formats that lookup tables may be stored in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba16Float,
    Rgba32Float,
}

impl TextureFormat {
    /// Stable numeric identity, suitable for feeding into cache keys.
    pub fn id(self) -> u64 {
        match self {
            Self::Rgba16Float => 0x10,
            Self::Rgba32Float => 0x20,
        }
    }

    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    pub(crate) fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            Self::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            Self::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        }
    }
}

impl FromStr for TextureFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_lowercase().as_str() {
            "rgba16f" | "rgba16float" => Self::Rgba16Float,
            "rgba32f" | "rgba32float" => Self::Rgba32Float,
            _ => bail!("unknown texture format: {}; expected rgba16f or rgba32f", s),
        })
    }
}

impl fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Rgba16Float => write!(f, "rgba16f"),
            Self::Rgba32Float => write!(f, "rgba32f"),
        }
    }
}

/// Everything that determines the shape of a 2D lookup table. Two textures
/// with equal descriptors are interchangeable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub random_write: bool,
}

impl TextureDesc {
    pub fn storage(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
            random_write: true,
        }
    }

    pub fn byte_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.format.bytes_per_texel())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TextureBinding {
    pub texture: TextureHandle,
    pub access: Access,
}

impl TextureBinding {
    pub fn read(texture: TextureHandle) -> Self {
        Self {
            texture,
            access: Access::Read,
        }
    }

    pub fn write(texture: TextureHandle) -> Self {
        Self {
            texture,
            access: Access::Write,
        }
    }
}

/// A single compute dispatch. Resources are bound in order: the shared
/// parameter block, then `constants` if non-empty, then `textures`, then
/// `buffers`.
#[derive(Copy, Clone, Debug)]
pub struct KernelDispatch<'a> {
    pub label: &'a str,
    pub kernel: KernelId,
    pub groups: [u32; 3],
    pub constants: &'a [u8],
    pub textures: &'a [TextureBinding],
    pub buffers: &'a [BufferHandle],
}

/// Named slots through which finished lookup tables are published to any
/// shader that wants to sample them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GlobalTexture {
    TransmittanceLut,
    MultiScatteringLut,
    SkyViewLut,
}

impl GlobalTexture {
    pub fn name(self) -> &'static str {
        match self {
            Self::TransmittanceLut => "transmittance_lut",
            Self::MultiScatteringLut => "multi_scattering_lut",
            Self::SkyViewLut => "sky_view_lut",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadbackStatus {
    InFlight,
    Failed(String),
    Complete(Vec<u8>),
}

impl ReadbackStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InFlight)
    }
}

/// The compute capabilities of a graphics device.
///
/// Work handed to `dispatch` and `request_readback` is recorded and only
/// reaches the device on the next `submit`. A readback reports `InFlight`
/// until the device has finished with it; the first terminal status
/// returned from `poll_readback` consumes the request, as does
/// `cancel_readback`. Releasing a resource that recorded, unsubmitted work
/// still refers to keeps it alive until that work is submitted.
pub trait ComputeBackend {
    fn find_kernel(&self, name: &str) -> Option<KernelId>;
    fn work_group_size(&self, kernel: KernelId) -> [u32; 3];

    fn create_texture(&mut self, label: &str, desc: &TextureDesc) -> Result<TextureHandle>;
    fn release_texture(&mut self, texture: TextureHandle);
    fn create_buffer(&mut self, label: &str, size: u64) -> Result<BufferHandle>;
    fn release_buffer(&mut self, buffer: BufferHandle);

    /// Replace the parameter block that every kernel sees at binding zero.
    fn upload_parameters(&mut self, data: &[u8]) -> Result<()>;
    fn dispatch(&mut self, dispatch: &KernelDispatch<'_>) -> Result<()>;

    /// Hand all recorded work to the device. Returns false if there was
    /// nothing to submit.
    fn submit(&mut self) -> bool;

    fn request_readback(&mut self, buffer: BufferHandle) -> Result<ReadbackId>;
    fn poll_readback(&mut self, readback: ReadbackId) -> ReadbackStatus;
    /// Drop a readback that will never be polled. Unknown or already
    /// consumed ids are ignored.
    fn cancel_readback(&mut self, readback: ReadbackId);

    fn bind_global_texture(&mut self, slot: GlobalTexture, texture: TextureHandle);
}
