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
    keys::CacheKey,
    opts::LutDescriptors,
    parameters::{AtmosphereParameters, ViewConstants},
    shared_cache::SharedLuts,
    view_cache::ViewLut,
};
use anyhow::Result;
use gpu::{Access, ComputeBackend, KernelDispatch, KernelId, TextureBinding, TextureDesc};
use log::trace;
use nalgebra::Vector3;
use zerocopy::AsBytes;

/// The three table-building passes, in the order they must run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LutStage {
    Transmittance,
    MultiScattering,
    SkyView,
}

impl LutStage {
    pub const ALL: [LutStage; 3] = [Self::Transmittance, Self::MultiScattering, Self::SkyView];

    pub fn kernel_name(self) -> &'static str {
        match self {
            Self::Transmittance => "compute_transmittance",
            Self::MultiScattering => "compute_multi_scattering",
            Self::SkyView => "compute_sky_view",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Transmittance => "transmittance-lut-pass",
            Self::MultiScattering => "multi-scattering-lut-pass",
            Self::SkyView => "sky-view-lut-pass",
        }
    }
}

/// Which stages are stale this frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StageFlags {
    pub transmittance: bool,
    pub multi_scattering: bool,
    pub sky_view: bool,
}

impl StageFlags {
    /// Both shared tables are rebuilt together; the view table is rebuilt on
    /// its own schedule.
    pub fn new(shared_stale: bool, view_stale: bool) -> Self {
        Self {
            transmittance: shared_stale,
            multi_scattering: shared_stale,
            sky_view: view_stale,
        }
    }

    pub fn any(&self) -> bool {
        self.transmittance || self.multi_scattering || self.sky_view
    }

    pub fn is_set(&self, stage: LutStage) -> bool {
        match stage {
            LutStage::Transmittance => self.transmittance,
            LutStage::MultiScattering => self.multi_scattering,
            LutStage::SkyView => self.sky_view,
        }
    }

    /// How each table is touched this frame, for the host's scheduler.
    pub fn access(&self) -> LutAccess {
        fn written(stale: bool) -> Access {
            if stale {
                Access::Write
            } else {
                Access::Read
            }
        }
        // Multi-scattering reads transmittance while it is being rebuilt.
        let transmittance = if self.transmittance && self.multi_scattering {
            Access::ReadWrite
        } else {
            written(self.transmittance)
        };
        let multi_scattering = if self.multi_scattering && self.sky_view {
            Access::ReadWrite
        } else {
            written(self.multi_scattering)
        };
        LutAccess {
            transmittance,
            multi_scattering,
            sky_view: written(self.sky_view),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LutAccess {
    pub transmittance: Access,
    pub multi_scattering: Access,
    pub sky_view: Access,
}

/// Number of work groups needed to cover `extent` texels.
pub fn group_count(extent: u32, work_group: u32) -> u32 {
    extent.div_ceil(work_group.max(1))
}

pub fn group_counts(desc: &TextureDesc, work_group: [u32; 3]) -> [u32; 3] {
    [
        group_count(desc.width, work_group[0]),
        group_count(desc.height, work_group[1]),
        1,
    ]
}

#[derive(Copy, Clone, Debug)]
struct Kernel {
    id: KernelId,
    work_group: [u32; 3],
}

/// The table-building kernels, as found on the backend.
#[derive(Copy, Clone, Debug)]
pub struct SkyKernels {
    transmittance: Kernel,
    multi_scattering: Kernel,
    sky_view: Kernel,
}

impl SkyKernels {
    pub fn find(gpu: &dyn ComputeBackend) -> Result<Self, SkyLutError> {
        let find = |stage: LutStage| -> Result<Kernel, SkyLutError> {
            let name = stage.kernel_name();
            let id = gpu
                .find_kernel(name)
                .ok_or_else(|| SkyLutError::missing(format!("compute kernel {}", name)))?;
            Ok(Kernel {
                id,
                work_group: gpu.work_group_size(id),
            })
        };
        Ok(Self {
            transmittance: find(LutStage::Transmittance)?,
            multi_scattering: find(LutStage::MultiScattering)?,
            sky_view: find(LutStage::SkyView)?,
        })
    }

    fn kernel(&self, stage: LutStage) -> Kernel {
        match stage {
            LutStage::Transmittance => self.transmittance,
            LutStage::MultiScattering => self.multi_scattering,
            LutStage::SkyView => self.sky_view,
        }
    }

    pub fn work_group_size(&self, stage: LutStage) -> [u32; 3] {
        self.kernel(stage).work_group
    }
}

/// Everything one view's dispatch needs.
#[derive(Clone, Debug)]
pub struct DispatchInputs<'a> {
    pub parameters: &'a AtmosphereParameters,
    pub shared: &'a SharedLuts,
    pub view: &'a ViewLut,
    pub descriptors: &'a LutDescriptors,
    pub viewer_height: f32,
    pub light_direction: Vector3<f32>,
}

/// What was recorded for one view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchPlan {
    pub flags: StageFlags,
    pub access: LutAccess,
    pub dispatched: Vec<(LutStage, [u32; 3])>,
    pub uploaded_parameters: bool,
}

impl DispatchPlan {
    fn new(flags: StageFlags) -> Self {
        Self {
            flags,
            access: flags.access(),
            dispatched: Vec::new(),
            uploaded_parameters: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty()
    }
}

/// Records the stale stages for a view into the backend's command stream.
#[derive(Debug, Default)]
pub struct DispatchOrchestrator {
    resident_parameters: Option<CacheKey>,
}

impl DispatchOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        gpu: &mut dyn ComputeBackend,
        kernels: &SkyKernels,
        inputs: &DispatchInputs<'_>,
        flags: StageFlags,
    ) -> Result<DispatchPlan> {
        let mut plan = DispatchPlan::new(flags);
        if !flags.any() {
            return Ok(plan);
        }

        if self.resident_parameters != Some(inputs.shared.parameter_key) {
            trace!("uploading atmosphere parameters {}", inputs.shared.parameter_key);
            gpu.upload_parameters(inputs.parameters.uniforms().as_bytes())?;
            self.resident_parameters = Some(inputs.shared.parameter_key);
            plan.uploaded_parameters = true;
        }

        let shared = inputs.shared;
        let view_constants = ViewConstants::new(inputs.viewer_height, &inputs.light_direction);
        for stage in LutStage::ALL {
            if !flags.is_set(stage) {
                continue;
            }
            let (desc, constants, textures): (_, &[u8], Vec<TextureBinding>) = match stage {
                LutStage::Transmittance => (
                    &inputs.descriptors.transmittance,
                    &[],
                    vec![TextureBinding::write(shared.transmittance)],
                ),
                LutStage::MultiScattering => (
                    &inputs.descriptors.multi_scattering,
                    &[],
                    vec![
                        TextureBinding::read(shared.transmittance),
                        TextureBinding::write(shared.multi_scattering),
                    ],
                ),
                LutStage::SkyView => (
                    &inputs.descriptors.sky_view,
                    view_constants.as_bytes(),
                    vec![
                        TextureBinding::read(shared.transmittance),
                        TextureBinding::read(shared.multi_scattering),
                        TextureBinding::write(inputs.view.sky_view),
                    ],
                ),
            };
            let kernel = kernels.kernel(stage);
            let groups = group_counts(desc, kernel.work_group);
            gpu.dispatch(&KernelDispatch {
                label: stage.label(),
                kernel: kernel.id,
                groups,
                constants,
                textures: &textures,
                buffers: &[],
            })?;
            trace!("recorded {:?} with groups {:?}", stage, groups);
            plan.dispatched.push((stage, groups));
        }
        Ok(plan)
    }

    /// Forget which parameters are on the device; the next record uploads.
    pub fn invalidate(&mut self) {
        self.resident_parameters = None;
    }
}
