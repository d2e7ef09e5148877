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
use nalgebra::Vector3;
use static_assertions::{assert_eq_size, const_assert_eq};
use std::mem;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Used whenever no usable light direction is available: straight down.
pub const DEFAULT_LIGHT_DIRECTION: [f32; 3] = [0., -1., 0.];

// Anything shorter than this is treated as having no direction at all.
const MIN_DIRECTION_LENGTH: f32 = 1e-6;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LinearColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl LinearColor {
    pub const WHITE: Self = Self::new(1., 1., 1., 1.);
    pub const GRAY: Self = Self::new(0.5, 0.5, 0.5, 1.);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// The physical description of a planet's atmosphere. Distances are in
/// meters; the sun disk angle is in degrees.
#[derive(Clone, Debug, PartialEq)]
pub struct AtmosphereParameters {
    pub rayleigh_scale_height: f32,
    pub rayleigh_scattering_strength: f32,
    pub mie_scale_height: f32,
    pub mie_anisotropy: f32,
    pub mie_scattering_strength: f32,
    pub ozone_center_height: f32,
    pub ozone_width: f32,
    pub planet_radius: f32,
    pub atmosphere_height: f32,
    pub sea_level: f32,
    pub sun_light_color: LinearColor,
    pub sun_light_intensity: f32,
    pub sun_disk_angle: f32,
    pub ground_tint: LinearColor,
}

impl Default for AtmosphereParameters {
    fn default() -> Self {
        Self {
            rayleigh_scale_height: 8_000.,
            rayleigh_scattering_strength: 1.,
            mie_scale_height: 1_200.,
            mie_anisotropy: 0.8,
            mie_scattering_strength: 1.,
            ozone_center_height: 25_000.,
            ozone_width: 15_000.,
            planet_radius: 6_360_000.,
            atmosphere_height: 60_000.,
            sea_level: 0.,
            sun_light_color: LinearColor::WHITE,
            sun_light_intensity: 31.4,
            sun_disk_angle: 2.5,
            ground_tint: LinearColor::GRAY,
        }
    }
}

impl AtmosphereParameters {
    pub fn uniforms(&self) -> AtmosphereUniforms {
        AtmosphereUniforms {
            sun_light_color: self.sun_light_color.to_array(),
            ground_tint: self.ground_tint.to_array(),
            rayleigh_scale_height: self.rayleigh_scale_height,
            rayleigh_scattering_strength: self.rayleigh_scattering_strength,
            mie_scale_height: self.mie_scale_height,
            mie_anisotropy: self.mie_anisotropy,
            mie_scattering_strength: self.mie_scattering_strength,
            ozone_center_height: self.ozone_center_height,
            ozone_width: self.ozone_width,
            planet_radius: self.planet_radius,
            atmosphere_height: self.atmosphere_height,
            sea_level: self.sea_level,
            sun_light_intensity: self.sun_light_intensity,
            sun_disk_angle: self.sun_disk_angle,
        }
    }
}

/// GPU image of `AtmosphereParameters`, bound at binding zero of every kernel.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Debug, Default)]
pub struct AtmosphereUniforms {
    sun_light_color: [f32; 4],
    ground_tint: [f32; 4],
    rayleigh_scale_height: f32,
    rayleigh_scattering_strength: f32,
    mie_scale_height: f32,
    mie_anisotropy: f32,
    mie_scattering_strength: f32,
    ozone_center_height: f32,
    ozone_width: f32,
    planet_radius: f32,
    atmosphere_height: f32,
    sea_level: f32,
    sun_light_intensity: f32,
    sun_disk_angle: f32,
}
assert_eq_size!(AtmosphereUniforms, [f32; 20]);
const_assert_eq!(mem::size_of::<AtmosphereUniforms>() % 16, 0);

/// Per-view constants for the sky-view kernel, bound at binding one.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Debug, Default)]
pub(crate) struct ViewConstants {
    light_direction: [f32; 4],
    viewer_height: f32,
    pad: [f32; 3],
}
const_assert_eq!(mem::size_of::<ViewConstants>(), 32);

impl ViewConstants {
    pub(crate) fn new(viewer_height: f32, light_direction: &Vector3<f32>) -> Self {
        Self {
            light_direction: [light_direction.x, light_direction.y, light_direction.z, 0.],
            viewer_height,
            pad: [0.; 3],
        }
    }
}

fn usable_direction(direction: &Vector3<f32>) -> Option<Vector3<f32>> {
    if !direction.iter().all(|c| c.is_finite()) {
        return None;
    }
    direction.try_normalize(MIN_DIRECTION_LENGTH)
}

/// Normalize `direction`, substituting straight down for anything that has
/// no usable direction.
pub fn normalize_light_direction(direction: &Vector3<f32>) -> Vector3<f32> {
    usable_direction(direction).unwrap_or_else(|| Vector3::from(DEFAULT_LIGHT_DIRECTION))
}

/// Pick the scene's own sun if it has one, then the global sun, then
/// straight down.
pub fn resolve_light_direction(
    primary: Option<Vector3<f32>>,
    fallback: Option<Vector3<f32>>,
) -> Vector3<f32> {
    primary
        .as_ref()
        .and_then(usable_direction)
        .or_else(|| fallback.as_ref().and_then(usable_direction))
        .unwrap_or_else(|| Vector3::from(DEFAULT_LIGHT_DIRECTION))
}
