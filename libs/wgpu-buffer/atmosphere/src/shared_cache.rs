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
use crate::{
    error::SkyLutError,
    keys::{combine, combine3, compute_descriptor_key, compute_parameter_key, CacheKey},
    parameters::AtmosphereParameters,
};
use gpu::{ComputeBackend, TextureDesc, TextureHandle};
use log::trace;

/// A texture along with the descriptor it was allocated with.
#[derive(Copy, Clone, Debug)]
pub(crate) struct LutTarget {
    pub(crate) texture: TextureHandle,
    pub(crate) desc: TextureDesc,
}

/// Make sure `slot` holds a texture matching `desc`, replacing whatever was
/// there if the shape changed. On failure the slot is left empty.
pub(crate) fn reallocate_if_needed(
    gpu: &mut dyn ComputeBackend,
    slot: &mut Option<LutTarget>,
    desc: &TextureDesc,
    label: &str,
) -> Result<TextureHandle, SkyLutError> {
    if let Some(target) = slot {
        if target.desc == *desc {
            return Ok(target.texture);
        }
    }
    if let Some(stale) = slot.take() {
        trace!(
            "{}: reallocating {}x{} -> {}x{}",
            label,
            stale.desc.width,
            stale.desc.height,
            desc.width,
            desc.height
        );
        gpu.release_texture(stale.texture);
    }
    let texture = gpu
        .create_texture(label, desc)
        .map_err(|err| SkyLutError::allocation(label, err))?;
    *slot = Some(LutTarget {
        texture,
        desc: *desc,
    });
    Ok(texture)
}

/// The view-independent tables for this frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SharedLuts {
    pub transmittance: TextureHandle,
    pub multi_scattering: TextureHandle,
    /// Identity of the shared contents; feeds every view key.
    pub key: CacheKey,
    /// Key of the atmosphere parameters alone.
    pub parameter_key: CacheKey,
    /// The caller must recompute both tables before using them.
    pub needs_update: bool,
}

/// Owns the transmittance and multi-scattering tables, which every view
/// shares.
#[derive(Debug, Default)]
pub struct SharedLutCache {
    transmittance: Option<LutTarget>,
    multi_scattering: Option<LutTarget>,
    key: Option<CacheKey>,
    descriptor_key: Option<CacheKey>,
    valid: bool,
}

impl SharedLutCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate or reuse both tables and decide whether their contents must
    /// be recomputed. A true `needs_update` is only reported once per change:
    /// the cache assumes the caller recomputes the tables.
    pub fn resolve(
        &mut self,
        gpu: &mut dyn ComputeBackend,
        parameters: &AtmosphereParameters,
        transmittance_desc: &TextureDesc,
        multi_scattering_desc: &TextureDesc,
    ) -> Result<SharedLuts, SkyLutError> {
        let parameter_key = compute_parameter_key(parameters);
        let transmittance_desc_key = compute_descriptor_key(transmittance_desc);
        let multi_scattering_desc_key = compute_descriptor_key(multi_scattering_desc);
        let key = combine3(parameter_key, transmittance_desc_key, multi_scattering_desc_key);
        let descriptor_key = combine(transmittance_desc_key, multi_scattering_desc_key);

        let transmittance = reallocate_if_needed(
            gpu,
            &mut self.transmittance,
            transmittance_desc,
            "transmittance-lut",
        )
        .map_err(|err| self.fail(err))?;
        let multi_scattering = reallocate_if_needed(
            gpu,
            &mut self.multi_scattering,
            multi_scattering_desc,
            "multi-scattering-lut",
        )
        .map_err(|err| self.fail(err))?;

        if self.descriptor_key != Some(descriptor_key) {
            trace!("shared lut descriptors changed");
            self.valid = false;
            self.descriptor_key = Some(descriptor_key);
        }

        let needs_update = !self.valid || self.key != Some(key);
        if needs_update {
            trace!("shared luts stale; new key {}", key);
            self.key = Some(key);
            self.valid = true;
        }

        Ok(SharedLuts {
            transmittance,
            multi_scattering,
            key,
            parameter_key,
            needs_update,
        })
    }

    /// Force the next resolve to report `needs_update`.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn key(&self) -> Option<CacheKey> {
        self.key
    }

    pub fn release(&mut self, gpu: &mut dyn ComputeBackend) {
        for target in [self.transmittance.take(), self.multi_scattering.take()]
            .into_iter()
            .flatten()
        {
            gpu.release_texture(target.texture);
        }
        *self = Self::default();
    }

    fn fail(&mut self, err: SkyLutError) -> SkyLutError {
        self.valid = false;
        err
    }
}
