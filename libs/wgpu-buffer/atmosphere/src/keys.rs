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

// Cache keys for the sky tables. Keys are hashes, not digests: equal inputs
// always give equal keys, but unequal inputs only differ with high
// probability.
use crate::parameters::{normalize_light_direction, AtmosphereParameters, LinearColor};
use gpu::TextureDesc;
use nalgebra::Vector3;
use std::fmt;

/// Viewer heights closer than this share a sky view.
pub const VIEWER_HEIGHT_STEP: f32 = 0.01;

/// Light direction components closer than this share a sky view.
pub const LIGHT_DIRECTION_STEP: f32 = 1e-4;

const SEED: u64 = 17;
const MULTIPLIER: u64 = 23;
const COMBINE_MULTIPLIER: u64 = 397;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(u64);

impl CacheKey {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Copy, Clone, Debug)]
struct KeyHasher(u64);

impl KeyHasher {
    fn new() -> Self {
        Self(SEED)
    }

    fn seeded(key: CacheKey) -> Self {
        Self(key.0)
    }

    fn write_u64(self, value: u64) -> Self {
        Self(self.0.wrapping_mul(MULTIPLIER).wrapping_add(value))
    }

    fn write_i64(self, value: i64) -> Self {
        self.write_u64(value as u64)
    }

    fn write_f32(self, value: f32) -> Self {
        self.write_u64(u64::from(canonical_bits(value)))
    }

    fn write_color(self, color: &LinearColor) -> Self {
        self.write_f32(color.r)
            .write_f32(color.g)
            .write_f32(color.b)
            .write_f32(color.a)
    }

    fn finish(self) -> CacheKey {
        CacheKey(self.0)
    }
}

// Both zeros hash alike, as do all NaNs.
fn canonical_bits(value: f32) -> u32 {
    if value == 0. {
        0
    } else if value.is_nan() {
        f32::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

/// Round `value` to the nearest multiple of `step`, returning the multiple.
pub fn quantize(value: f32, step: f32) -> i64 {
    (f64::from(value) / f64::from(step)).round() as i64
}

pub fn compute_parameter_key(params: &AtmosphereParameters) -> CacheKey {
    KeyHasher::new()
        .write_f32(params.rayleigh_scale_height)
        .write_f32(params.rayleigh_scattering_strength)
        .write_f32(params.mie_scale_height)
        .write_f32(params.mie_anisotropy)
        .write_f32(params.mie_scattering_strength)
        .write_f32(params.ozone_center_height)
        .write_f32(params.ozone_width)
        .write_f32(params.planet_radius)
        .write_f32(params.atmosphere_height)
        .write_f32(params.sea_level)
        .write_color(&params.sun_light_color)
        .write_f32(params.sun_light_intensity)
        .write_f32(params.sun_disk_angle)
        .write_color(&params.ground_tint)
        .finish()
}

/// Key for one view's sky table. The light direction is normalized here, so
/// callers may pass it in any length.
pub fn compute_view_key(
    shared_key: CacheKey,
    viewer_height: f32,
    light_direction: &Vector3<f32>,
) -> CacheKey {
    let direction = normalize_light_direction(light_direction);
    KeyHasher::seeded(shared_key)
        .write_i64(quantize(viewer_height, VIEWER_HEIGHT_STEP))
        .write_i64(quantize(direction.x, LIGHT_DIRECTION_STEP))
        .write_i64(quantize(direction.y, LIGHT_DIRECTION_STEP))
        .write_i64(quantize(direction.z, LIGHT_DIRECTION_STEP))
        .finish()
}

pub fn compute_descriptor_key(desc: &TextureDesc) -> CacheKey {
    KeyHasher::new()
        .write_u64(u64::from(desc.width))
        .write_u64(u64::from(desc.height))
        .write_u64(desc.format.id())
        .write_u64(u64::from(desc.random_write))
        .finish()
}

pub fn combine(a: CacheKey, b: CacheKey) -> CacheKey {
    CacheKey(a.0.wrapping_mul(COMBINE_MULTIPLIER) ^ b.0)
}

pub fn combine3(a: CacheKey, b: CacheKey, c: CacheKey) -> CacheKey {
    combine(combine(a, b), c)
}
