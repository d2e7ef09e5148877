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
use crate::view_cache::check_retention;
use anyhow::{anyhow, bail, Error, Result};
use gpu::{TextureDesc, TextureFormat};
use std::{fmt, str::FromStr};
use structopt::StructOpt;

/// Width and height of a lookup table, written as `WIDTHxHEIGHT`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LutExtent {
    pub width: u32,
    pub height: u32,
}

impl LutExtent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl FromStr for LutExtent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .split_once(|c| c == 'x' || c == 'X')
            .ok_or_else(|| anyhow!("expected an extent like 256x128, not {}", s))?;
        Ok(Self {
            width: width.trim().parse()?,
            height: height.trim().parse()?,
        })
    }
}

impl fmt::Display for LutExtent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Shapes of the three tables.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LutDescriptors {
    pub transmittance: TextureDesc,
    pub multi_scattering: TextureDesc,
    pub sky_view: TextureDesc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkyLutConfig {
    pub keep_frames: u64,
    pub sweep_interval: u64,
    pub transmittance_size: LutExtent,
    pub multi_scattering_size: LutExtent,
    pub sky_view_size: LutExtent,
    pub format: TextureFormat,
    pub ambient_probe: bool,
}

impl Default for SkyLutConfig {
    fn default() -> Self {
        Self {
            keep_frames: 300,
            sweep_interval: 60,
            transmittance_size: LutExtent::new(256, 128),
            multi_scattering_size: LutExtent::new(32, 32),
            sky_view_size: LutExtent::new(256, 128),
            format: TextureFormat::Rgba32Float,
            ambient_probe: true,
        }
    }
}

impl SkyLutConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, extent) in [
            ("transmittance", self.transmittance_size),
            ("multi-scattering", self.multi_scattering_size),
            ("sky-view", self.sky_view_size),
        ] {
            if extent.width == 0 || extent.height == 0 {
                bail!("{} lut size must be non-zero, not {}", name, extent);
            }
        }
        check_retention(self.keep_frames, self.sweep_interval)
    }

    pub fn descriptors(&self) -> LutDescriptors {
        let desc =
            |extent: LutExtent| TextureDesc::storage(extent.width, extent.height, self.format);
        LutDescriptors {
            transmittance: desc(self.transmittance_size),
            multi_scattering: desc(self.multi_scattering_size),
            sky_view: desc(self.sky_view_size),
        }
    }
}

#[derive(Clone, Debug, StructOpt)]
pub struct SkyLutOpts {
    /// Frames an unused view keeps its sky table before it is released
    #[structopt(long, default_value = "300")]
    sky_lut_keep_frames: u64,

    /// Frames between sweeps for unused views
    #[structopt(long, default_value = "60")]
    sky_lut_sweep_interval: u64,

    /// Size of the transmittance table (WIDTHxHEIGHT)
    #[structopt(long, default_value = "256x128")]
    transmittance_lut_size: LutExtent,

    /// Size of the multiple scattering table (WIDTHxHEIGHT)
    #[structopt(long, default_value = "32x32")]
    multi_scattering_lut_size: LutExtent,

    /// Size of each view's sky table (WIDTHxHEIGHT)
    #[structopt(long, default_value = "256x128")]
    sky_view_lut_size: LutExtent,

    /// Storage format for all tables (rgba16f or rgba32f)
    #[structopt(long, default_value = "rgba32f")]
    lut_format: TextureFormat,

    /// Do not derive ambient lighting from the sky
    #[structopt(long)]
    no_ambient_probe: bool,
}

impl SkyLutOpts {
    pub fn config(&self) -> Result<SkyLutConfig> {
        let config = SkyLutConfig {
            keep_frames: self.sky_lut_keep_frames,
            sweep_interval: self.sky_lut_sweep_interval,
            transmittance_size: self.transmittance_lut_size,
            multi_scattering_size: self.multi_scattering_lut_size,
            sky_view_size: self.sky_view_lut_size,
            format: self.lut_format,
            ambient_probe: !self.no_ambient_probe,
        };
        config.validate()?;
        Ok(config)
    }
}
