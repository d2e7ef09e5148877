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

// Sky lookup tables in the style of Hillaire's "A Scalable and Production
// Ready Sky and Atmosphere Rendering Technique": a transmittance table and a
// multiple scattering table shared by every view, plus one sky-view table
// per view. Tables are only rebuilt when the inputs that shape them change.
mod ambient;
mod dispatch;
mod error;
mod keys;
mod opts;
mod parameters;
mod shared_cache;
mod view_cache;

pub use crate::{
    ambient::{
        AmbientLighting, AmbientMode, AmbientProbeUpdater, ShCoefficient, SphericalHarmonicsL2,
        SH_COEFFICIENT_COUNT, SH_KERNEL,
    },
    dispatch::{
        group_count, group_counts, DispatchInputs, DispatchOrchestrator, DispatchPlan, LutAccess,
        LutStage, SkyKernels, StageFlags,
    },
    error::SkyLutError,
    keys::{
        combine, combine3, compute_descriptor_key, compute_parameter_key, compute_view_key,
        quantize, CacheKey, LIGHT_DIRECTION_STEP, VIEWER_HEIGHT_STEP,
    },
    opts::{LutDescriptors, LutExtent, SkyLutConfig, SkyLutOpts},
    parameters::{
        normalize_light_direction, resolve_light_direction, AtmosphereParameters,
        AtmosphereUniforms, LinearColor, DEFAULT_LIGHT_DIRECTION,
    },
    shared_cache::{SharedLutCache, SharedLuts},
    view_cache::{ViewId, ViewLut, ViewLutCache},
};

use anyhow::Result;
use gpu::{ComputeBackend, GlobalTexture, TextureHandle};
use log::{error, trace, warn};
use nalgebra::Vector3;

/// What the host is rendering a view for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ViewKind {
    Game,
    SceneView,
    Preview,
    Overlay,
}

impl ViewKind {
    pub fn renders_sky(self) -> bool {
        matches!(self, Self::Game | Self::SceneView)
    }
}

/// Per-frame description of one view, supplied by the host.
#[derive(Clone, Debug)]
pub struct ViewInputs {
    pub id: ViewId,
    pub kind: ViewKind,
    pub viewer_height: f32,
    /// Direction the sunlight travels. Hosts with both a per-scene and a
    /// global sun should build the view with `with_suns`.
    pub light_direction: Vector3<f32>,
}

impl ViewInputs {
    /// Light the view with the scene's own sun if it has a usable one, else
    /// the global sun, else straight down.
    pub fn with_suns(
        id: ViewId,
        kind: ViewKind,
        viewer_height: f32,
        scene_sun: Option<Vector3<f32>>,
        global_sun: Option<Vector3<f32>>,
    ) -> Self {
        Self {
            id,
            kind,
            viewer_height,
            light_direction: resolve_light_direction(scene_sun, global_sun),
        }
    }
}

/// The tables a view should sample this frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedView {
    pub transmittance: TextureHandle,
    pub multi_scattering: TextureHandle,
    pub sky_view: TextureHandle,
    pub sky_view_key: CacheKey,
    pub plan: DispatchPlan,
}

/// Drives the sky tables through a frame:
///
/// 1. `begin_frame` once, which also sweeps idle views.
/// 2. `render_view` for each view, which records any stale stages.
/// 3. `end_frame` once, which requests the ambient probe for the primary
///    view, submits the frame's work and applies any finished probe.
pub struct SkyLuts {
    config: SkyLutConfig,
    descriptors: LutDescriptors,
    kernels: Option<SkyKernels>,
    shared: SharedLutCache,
    views: ViewLutCache,
    orchestrator: DispatchOrchestrator,
    ambient: AmbientProbeUpdater,
    // Set once the probe kernel is known to be missing.
    ambient_unavailable: bool,
    primary_view: Option<ViewId>,
    current_frame: u64,
}

impl SkyLuts {
    /// Only a bad configuration is an error. Missing kernels disable the
    /// affected features instead.
    pub fn new(config: SkyLutConfig, gpu: &mut dyn ComputeBackend) -> Result<Self> {
        config.validate()?;
        let kernels = match SkyKernels::find(gpu) {
            Ok(kernels) => Some(kernels),
            Err(err) => {
                error!("sky luts disabled: {}", err);
                None
            }
        };
        let mut sky = Self {
            descriptors: config.descriptors(),
            views: ViewLutCache::new(config.keep_frames, config.sweep_interval)?,
            config,
            kernels,
            shared: SharedLutCache::new(),
            orchestrator: DispatchOrchestrator::new(),
            ambient: AmbientProbeUpdater::new(),
            ambient_unavailable: false,
            primary_view: None,
            current_frame: 0,
        };
        sky.ensure_ambient_probe(gpu);
        Ok(sky)
    }

    /// Bring up the probe pipeline if it is wanted and not running. A
    /// missing kernel disables it for good; a failed allocation is retried
    /// on the next frame.
    fn ensure_ambient_probe(&mut self, gpu: &mut dyn ComputeBackend) {
        if !self.config.ambient_probe
            || self.kernels.is_none()
            || self.ambient_unavailable
            || self.ambient.is_initialized()
        {
            return;
        }
        match self.ambient.initialize(gpu) {
            Ok(()) => {}
            Err(err @ SkyLutError::MissingDependency { .. }) => {
                error!("ambient probe disabled: {}", err);
                self.ambient_unavailable = true;
            }
            Err(err) => warn!("ambient probe unavailable this frame: {}", err),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.kernels.is_some()
    }

    pub fn config(&self) -> &SkyLutConfig {
        &self.config
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn begin_frame(&mut self, gpu: &mut dyn ComputeBackend, frame: u64) {
        self.current_frame = frame;
        let evicted = self.views.maybe_evict(gpu, frame);
        if evicted > 0 {
            trace!("evicted {} idle sky views at frame {}", evicted, frame);
        }
    }

    /// Bring the tables for `view` up to date, recording whatever work that
    /// takes. Returns None if the view has no sky or the tables could not be
    /// made ready this frame.
    pub fn render_view(
        &mut self,
        gpu: &mut dyn ComputeBackend,
        parameters: &AtmosphereParameters,
        view: &ViewInputs,
    ) -> Option<ResolvedView> {
        if !view.kind.renders_sky() {
            return None;
        }
        let kernels = self.kernels?;

        let shared = match self.shared.resolve(
            gpu,
            parameters,
            &self.descriptors.transmittance,
            &self.descriptors.multi_scattering,
        ) {
            Ok(shared) => shared,
            Err(err) => {
                warn!("skipping sky for {}: {}", view.id, err);
                return None;
            }
        };

        let light_direction = normalize_light_direction(&view.light_direction);
        let view_key = compute_view_key(shared.key, view.viewer_height, &light_direction);
        let sky_view = match self.views.resolve(
            gpu,
            view.id,
            view_key,
            &self.descriptors.sky_view,
            self.current_frame,
        ) {
            Ok(sky_view) => sky_view,
            Err(err) => {
                warn!("skipping sky for {}: {}", view.id, err);
                if shared.needs_update {
                    self.shared.invalidate();
                }
                return None;
            }
        };

        let flags = StageFlags::new(shared.needs_update, sky_view.needs_update);
        let inputs = DispatchInputs {
            parameters,
            shared: &shared,
            view: &sky_view,
            descriptors: &self.descriptors,
            viewer_height: view.viewer_height,
            light_direction,
        };
        let plan = match self.orchestrator.record(gpu, &kernels, &inputs, flags) {
            Ok(plan) => plan,
            Err(err) => {
                warn!("sky lut dispatch for {} failed: {:#}", view.id, err);
                if flags.transmittance {
                    self.shared.invalidate();
                }
                self.views.invalidate(view.id);
                self.orchestrator.invalidate();
                return None;
            }
        };

        gpu.bind_global_texture(GlobalTexture::TransmittanceLut, shared.transmittance);
        gpu.bind_global_texture(GlobalTexture::MultiScatteringLut, shared.multi_scattering);
        gpu.bind_global_texture(GlobalTexture::SkyViewLut, sky_view.sky_view);

        Some(ResolvedView {
            transmittance: shared.transmittance,
            multi_scattering: shared.multi_scattering,
            sky_view: sky_view.sky_view,
            sky_view_key: sky_view.key,
            plan,
        })
    }

    /// Choose the view the ambient probe is derived from.
    pub fn set_primary_view(&mut self, view: Option<ViewId>) {
        if self.primary_view != view {
            self.primary_view = view;
            self.ambient.invalidate_cache();
        }
    }

    pub fn primary_view(&self) -> Option<ViewId> {
        self.primary_view
    }

    /// The primary view's sky table and its key, if it currently holds
    /// valid contents.
    pub fn primary_sky_view(&self) -> Option<(TextureHandle, CacheKey)> {
        let lut = self.views.get(self.primary_view?)?;
        Some((lut.sky_view, lut.key))
    }

    /// Finish the frame. Returns true if a new ambient probe was published.
    pub fn end_frame(
        &mut self,
        gpu: &mut dyn ComputeBackend,
        ambient: &mut AmbientLighting,
    ) -> bool {
        self.ensure_ambient_probe(gpu);
        if self.ambient.is_initialized() {
            if let Some((sky_view, key)) = self.primary_sky_view() {
                self.ambient.request_compute(gpu, sky_view, key, false);
            }
        }
        gpu.submit();
        self.ambient.poll_and_apply(gpu, ambient)
    }

    pub fn ambient_probe(&self) -> &AmbientProbeUpdater {
        &self.ambient
    }

    pub fn shared_cache(&self) -> &SharedLutCache {
        &self.shared
    }

    pub fn view_cache(&self) -> &ViewLutCache {
        &self.views
    }

    /// Release every GPU resource. The driver can be used again afterwards
    /// and will rebuild from scratch.
    pub fn release(&mut self, gpu: &mut dyn ComputeBackend) {
        self.shared.release(gpu);
        self.views.release(gpu);
        self.ambient.release(gpu);
        self.orchestrator.invalidate();
        self.primary_view = None;
    }
}
