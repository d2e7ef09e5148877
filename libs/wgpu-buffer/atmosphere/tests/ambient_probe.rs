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
use anyhow::{anyhow, Result};
use approx::assert_relative_eq;
use atmosphere::{
    AmbientLighting, AmbientMode, AtmosphereParameters, ShCoefficient, SkyLutConfig, SkyLuts,
    ViewId, ViewInputs, ViewKind, SH_COEFFICIENT_COUNT, SH_KERNEL,
};
use gpu::{ReadbackId, RecordingBackend};
use nalgebra::Vector3;
use zerocopy::AsBytes;

struct Harness {
    gpu: RecordingBackend,
    sky: SkyLuts,
    ambient: AmbientLighting,
    params: AtmosphereParameters,
    frame: u64,
}

impl Harness {
    fn new() -> Result<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut gpu = RecordingBackend::new()
            .with_kernel("compute_transmittance", [8, 8, 1])
            .with_kernel("compute_multi_scattering", [8, 8, 1])
            .with_kernel("compute_sky_view", [8, 8, 1])
            .with_kernel(SH_KERNEL, [64, 1, 1]);
        let sky = SkyLuts::new(SkyLutConfig::default(), &mut gpu)?;
        Ok(Self {
            gpu,
            sky,
            ambient: AmbientLighting::default(),
            params: AtmosphereParameters::default(),
            frame: 0,
        })
    }

    /// Render the given views and finish the frame; returns whether a probe
    /// was published.
    fn run_frame(&mut self, views: &[ViewInputs]) -> bool {
        self.sky.begin_frame(&mut self.gpu, self.frame);
        for view in views {
            self.sky.render_view(&mut self.gpu, &self.params, view);
        }
        self.frame += 1;
        self.sky.end_frame(&mut self.gpu, &mut self.ambient)
    }

    fn probe_requests(&self) -> usize {
        self.gpu.dispatches_of(SH_KERNEL).count()
    }

    fn last_readback(&self) -> Result<ReadbackId> {
        self.gpu.last_readback().ok_or_else(|| anyhow!("no readback requested"))
    }
}

fn view(id: u64, viewer_height: f32) -> ViewInputs {
    ViewInputs {
        id: ViewId(id),
        kind: ViewKind::Game,
        viewer_height,
        light_direction: Vector3::new(0., -1., 0.),
    }
}

fn probe(scale: f32) -> Vec<u8> {
    let coefficients = (0..SH_COEFFICIENT_COUNT)
        .map(|i| ShCoefficient {
            r: scale * i as f32,
            g: scale * (i + 1) as f32,
            b: scale * (i + 2) as f32,
            pad: 0.,
        })
        .collect::<Vec<_>>();
    coefficients.as_slice().as_bytes().to_vec()
}

#[test]
fn test_probe_follows_primary_view() -> Result<()> {
    let mut h = Harness::new()?;
    h.sky.set_primary_view(Some(ViewId(1)));

    // The SH projection is recorded after the tables, in the same submission.
    assert!(!h.run_frame(&[view(1, 100.)]));
    assert_eq!(h.gpu.submissions().len(), 1);
    let kernels = h.gpu.submissions()[0]
        .iter()
        .map(|dispatch| dispatch.kernel.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        kernels,
        vec![
            "compute_transmittance",
            "compute_multi_scattering",
            "compute_sky_view",
            SH_KERNEL
        ]
    );
    assert!(h.sky.ambient_probe().is_readback_pending());

    // Still in flight: nothing applied, nothing new requested.
    assert!(!h.run_frame(&[view(1, 100.)]));
    assert_eq!(h.probe_requests(), 1);

    let readback = h.last_readback()?;
    h.gpu.complete_readback(readback, probe(1.));
    assert!(h.run_frame(&[view(1, 100.)]));
    assert_eq!(h.ambient.mode(), AmbientMode::Custom);
    assert_eq!(h.ambient.revision(), 1);
    assert_relative_eq!(h.ambient.probe().get(0, 2), 2.);
    assert_relative_eq!(h.ambient.probe().get(1, 2), 3.);
    assert_relative_eq!(h.ambient.probe().get(2, 2), 4.);

    // Unchanged sky: debounced.
    assert!(!h.run_frame(&[view(1, 100.)]));
    assert_eq!(h.probe_requests(), 1);
    Ok(())
}

#[test]
fn test_probe_recomputes_when_sky_changes() -> Result<()> {
    let mut h = Harness::new()?;
    h.sky.set_primary_view(Some(ViewId(1)));
    h.run_frame(&[view(1, 100.)]);
    let readback = h.last_readback()?;
    h.gpu.complete_readback(readback, probe(1.));
    assert!(h.run_frame(&[view(1, 100.)]));

    h.run_frame(&[view(1, 5_000.)]);
    assert_eq!(h.probe_requests(), 2);
    let readback = h.last_readback()?;
    h.gpu.complete_readback(readback, probe(2.));
    assert!(h.run_frame(&[view(1, 5_000.)]));
    assert_eq!(h.ambient.revision(), 2);
    assert_relative_eq!(h.ambient.probe().get(0, 1), 2.);
    Ok(())
}

#[test]
fn test_no_primary_view_no_probe() -> Result<()> {
    let mut h = Harness::new()?;
    h.run_frame(&[view(1, 100.)]);
    h.sky.set_primary_view(Some(ViewId(2)));
    h.run_frame(&[view(1, 100.)]);
    assert_eq!(h.probe_requests(), 0);
    assert!(h.gpu.readback_requests().is_empty());
    Ok(())
}

#[test]
fn test_readback_error_keeps_previous_probe() -> Result<()> {
    let mut h = Harness::new()?;
    h.sky.set_primary_view(Some(ViewId(1)));
    h.run_frame(&[view(1, 100.)]);
    let readback = h.last_readback()?;
    h.gpu.complete_readback(readback, probe(1.));
    assert!(h.run_frame(&[view(1, 100.)]));
    let published = *h.ambient.probe();

    h.run_frame(&[view(1, 900.)]);
    let readback = h.last_readback()?;
    h.gpu.fail_readback(readback, "device lost");
    assert!(!h.run_frame(&[view(1, 900.)]));
    assert_eq!(h.ambient.probe(), &published);
    assert_eq!(h.ambient.revision(), 1);

    // The failed source is retried by the next request.
    h.run_frame(&[view(1, 900.)]);
    assert_eq!(h.probe_requests(), 3);
    Ok(())
}

#[test]
fn test_shape_mismatch_is_discarded() -> Result<()> {
    let mut h = Harness::new()?;
    h.sky.set_primary_view(Some(ViewId(1)));
    h.run_frame(&[view(1, 100.)]);
    let readback = h.last_readback()?;
    let mut short = probe(1.);
    short.truncate(short.len() - 16);
    h.gpu.complete_readback(readback, short);
    assert!(!h.run_frame(&[view(1, 100.)]));
    assert_eq!(h.ambient.mode(), AmbientMode::Skybox);
    assert_eq!(h.ambient.revision(), 0);
    Ok(())
}

#[test]
fn test_primary_switch_forces_request() -> Result<()> {
    let mut h = Harness::new()?;
    let views = [view(1, 100.), view(2, 100.)];
    h.sky.set_primary_view(Some(ViewId(1)));
    h.run_frame(&views);
    let readback = h.last_readback()?;
    h.gpu.complete_readback(readback, probe(1.));
    assert!(h.run_frame(&views));
    assert_eq!(h.probe_requests(), 1);

    // Both views see an identical sky, so only the switch itself can force
    // the new request.
    h.sky.set_primary_view(Some(ViewId(2)));
    h.run_frame(&views);
    assert_eq!(h.probe_requests(), 2);
    Ok(())
}

#[test]
fn test_release_frees_everything() -> Result<()> {
    let mut h = Harness::new()?;
    h.sky.set_primary_view(Some(ViewId(1)));
    h.run_frame(&[view(1, 100.), view(2, 50.)]);
    h.sky.release(&mut h.gpu);
    assert_eq!(h.gpu.live_textures(), 0);
    assert_eq!(h.gpu.live_buffers(), 0);
    h.sky.release(&mut h.gpu);
    assert!(h.sky.primary_view().is_none());
    Ok(())
}

#[test]
fn test_probe_resumes_after_release() -> Result<()> {
    let mut h = Harness::new()?;
    h.sky.set_primary_view(Some(ViewId(1)));
    h.run_frame(&[view(1, 100.)]);
    assert_eq!(h.probe_requests(), 1);
    assert_eq!(h.gpu.open_readbacks(), 1);

    // Releasing mid-flight abandons the outstanding readback.
    h.sky.release(&mut h.gpu);
    assert_eq!(h.gpu.open_readbacks(), 0);
    assert!(!h.sky.ambient_probe().is_initialized());

    h.sky.set_primary_view(Some(ViewId(1)));
    h.run_frame(&[view(1, 100.)]);
    assert!(h.sky.ambient_probe().is_initialized());
    assert_eq!(h.probe_requests(), 2);

    let readback = h.last_readback()?;
    h.gpu.complete_readback(readback, probe(1.));
    assert!(h.run_frame(&[view(1, 100.)]));
    assert_eq!(h.ambient.revision(), 1);
    Ok(())
}
