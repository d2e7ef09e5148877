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

// Ambient lighting derived from the sky. A kernel projects the primary
// view's sky table onto second order spherical harmonics; the coefficients
// come back to the CPU asynchronously and are published to the renderer's
// ambient state.
use crate::{error::SkyLutError, keys::CacheKey};
use gpu::{
    BufferHandle, ComputeBackend, KernelDispatch, KernelId, ReadbackId, ReadbackStatus,
    TextureBinding, TextureHandle,
};
use log::{debug, trace, warn};
use static_assertions::const_assert_eq;
use std::mem;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const SH_COEFFICIENT_COUNT: usize = 9;
pub const SH_KERNEL: &str = "compute_ambient_sh";

/// One coefficient for all three color channels, as written by the kernel.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Debug, Default, PartialEq)]
pub struct ShCoefficient {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub pad: f32,
}
const_assert_eq!(mem::size_of::<ShCoefficient>(), 16);

const COEFFICIENT_BUFFER_SIZE: u64 =
    (SH_COEFFICIENT_COUNT * mem::size_of::<ShCoefficient>()) as u64;

/// Second order spherical harmonics in three channels, stored
/// channel-major. Coefficients run L0, then L1 for m = -1..=1, then L2 for
/// m = -2..=2.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SphericalHarmonicsL2 {
    coefficients: [[f32; SH_COEFFICIENT_COUNT]; 3],
}

impl SphericalHarmonicsL2 {
    pub fn from_coefficients(coefficients: &[ShCoefficient; SH_COEFFICIENT_COUNT]) -> Self {
        let mut sh = Self::default();
        for (i, c) in coefficients.iter().enumerate() {
            sh.coefficients[0][i] = c.r;
            sh.coefficients[1][i] = c.g;
            sh.coefficients[2][i] = c.b;
        }
        sh
    }

    pub fn get(&self, channel: usize, coefficient: usize) -> f32 {
        self.coefficients[channel][coefficient]
    }

    pub fn channel(&self, channel: usize) -> &[f32; SH_COEFFICIENT_COUNT] {
        &self.coefficients[channel]
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AmbientMode {
    /// The renderer derives ambient light itself.
    #[default]
    Skybox,
    /// Ambient light comes from an explicitly published probe.
    Custom,
}

/// The renderer's ambient lighting. Owned by the host and handed to
/// `SkyLuts::end_frame`; readers see the last published probe.
#[derive(Clone, Debug, Default)]
pub struct AmbientLighting {
    mode: AmbientMode,
    probe: SphericalHarmonicsL2,
    revision: u64,
}

impl AmbientLighting {
    pub fn mode(&self) -> AmbientMode {
        self.mode
    }

    pub fn probe(&self) -> &SphericalHarmonicsL2 {
        &self.probe
    }

    /// Bumped every time a probe is published.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn publish(&mut self, probe: SphericalHarmonicsL2) {
        self.mode = AmbientMode::Custom;
        self.probe = probe;
        self.revision += 1;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ReadbackState {
    Idle,
    Pending {
        request: ReadbackId,
        source_key: CacheKey,
    },
}

/// Keeps at most one probe computation in flight and applies each finished
/// one exactly once.
#[derive(Debug)]
pub struct AmbientProbeUpdater {
    kernel: Option<KernelId>,
    buffer: Option<BufferHandle>,
    state: ReadbackState,
    last_computed_key: Option<CacheKey>,
    coefficients: [ShCoefficient; SH_COEFFICIENT_COUNT],
}

impl Default for AmbientProbeUpdater {
    fn default() -> Self {
        Self::new()
    }
}

impl AmbientProbeUpdater {
    pub fn new() -> Self {
        Self {
            kernel: None,
            buffer: None,
            state: ReadbackState::Idle,
            last_computed_key: None,
            coefficients: [ShCoefficient::default(); SH_COEFFICIENT_COUNT],
        }
    }

    /// Find the projection kernel and allocate the coefficient buffer.
    pub fn initialize(&mut self, gpu: &mut dyn ComputeBackend) -> Result<(), SkyLutError> {
        if self.is_initialized() {
            return Ok(());
        }
        let kernel = gpu
            .find_kernel(SH_KERNEL)
            .ok_or_else(|| SkyLutError::missing(format!("compute kernel {}", SH_KERNEL)))?;
        let buffer = gpu
            .create_buffer("ambient-sh-coefficients", COEFFICIENT_BUFFER_SIZE)
            .map_err(|err| SkyLutError::allocation("ambient-sh-coefficients", err))?;
        self.kernel = Some(kernel);
        self.buffer = Some(buffer);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.kernel.is_some() && self.buffer.is_some()
    }

    pub fn is_readback_pending(&self) -> bool {
        matches!(self.state, ReadbackState::Pending { .. })
    }

    /// The most recently applied coefficients.
    pub fn coefficients(&self) -> &[ShCoefficient; SH_COEFFICIENT_COUNT] {
        &self.coefficients
    }

    /// Project `sky_view` unless a projection is already in flight or the
    /// same source was already projected. Returns true if work was recorded.
    pub fn request_compute(
        &mut self,
        gpu: &mut dyn ComputeBackend,
        sky_view: TextureHandle,
        source_key: CacheKey,
        force: bool,
    ) -> bool {
        let (kernel, buffer) = match (self.kernel, self.buffer) {
            (Some(kernel), Some(buffer)) => (kernel, buffer),
            _ => return false,
        };
        if self.is_readback_pending() {
            return false;
        }
        if !force && self.last_computed_key == Some(source_key) {
            return false;
        }

        let textures = [TextureBinding::read(sky_view)];
        let buffers = [buffer];
        if let Err(err) = gpu.dispatch(&KernelDispatch {
            label: "ambient-sh-pass",
            kernel,
            groups: [1, 1, 1],
            constants: &[],
            textures: &textures,
            buffers: &buffers,
        }) {
            warn!("ambient probe dispatch failed: {:#}", err);
            return false;
        }
        let request = match gpu.request_readback(buffer) {
            Ok(request) => request,
            Err(err) => {
                warn!("ambient probe readback request failed: {:#}", err);
                return false;
            }
        };
        debug!("ambient probe pending on {} for {}", request, source_key);
        self.state = ReadbackState::Pending {
            request,
            source_key,
        };
        self.last_computed_key = Some(source_key);
        true
    }

    /// Check on the in-flight projection without blocking. Returns true only
    /// when fresh coefficients were published to `ambient`.
    pub fn poll_and_apply(
        &mut self,
        gpu: &mut dyn ComputeBackend,
        ambient: &mut AmbientLighting,
    ) -> bool {
        let (request, source_key) = match self.state {
            ReadbackState::Idle => return false,
            ReadbackState::Pending {
                request,
                source_key,
            } => (request, source_key),
        };
        let bytes = match gpu.poll_readback(request) {
            ReadbackStatus::InFlight => return false,
            ReadbackStatus::Failed(reason) => {
                self.state = ReadbackState::Idle;
                self.discard(SkyLutError::ReadbackFailed { reason }, source_key);
                return false;
            }
            ReadbackStatus::Complete(bytes) => bytes,
        };
        self.state = ReadbackState::Idle;
        match decode_coefficients(&bytes) {
            Ok(coefficients) => {
                self.coefficients = coefficients;
                ambient.publish(SphericalHarmonicsL2::from_coefficients(&coefficients));
                debug!("ambient probe applied for {}", source_key);
                true
            }
            Err(err) => {
                self.discard(err, source_key);
                false
            }
        }
    }

    /// Make sure the next request is not skipped as a repeat.
    pub fn invalidate_cache(&mut self) {
        trace!("ambient probe cache invalidated");
        self.last_computed_key = None;
    }

    /// Free the coefficient buffer, abandoning any projection in flight.
    pub fn release(&mut self, gpu: &mut dyn ComputeBackend) {
        if let ReadbackState::Pending { request, .. } = self.state {
            gpu.cancel_readback(request);
        }
        if let Some(buffer) = self.buffer.take() {
            gpu.release_buffer(buffer);
        }
        *self = Self::new();
    }

    fn discard(&mut self, err: SkyLutError, source_key: CacheKey) {
        warn!("{}", err);
        if self.last_computed_key == Some(source_key) {
            self.last_computed_key = None;
        }
    }
}

fn decode_coefficients(bytes: &[u8]) -> Result<[ShCoefficient; SH_COEFFICIENT_COUNT], SkyLutError> {
    let stride = mem::size_of::<ShCoefficient>();
    let actual = bytes.len() / stride;
    let mismatch = SkyLutError::ShapeMismatch {
        expected: SH_COEFFICIENT_COUNT,
        actual,
    };
    if bytes.len() % stride != 0 || actual != SH_COEFFICIENT_COUNT {
        return Err(mismatch);
    }
    let mut coefficients = [ShCoefficient::default(); SH_COEFFICIENT_COUNT];
    for (coefficient, chunk) in coefficients.iter_mut().zip(bytes.chunks_exact(stride)) {
        *coefficient = match ShCoefficient::read_from(chunk) {
            Some(value) => value,
            None => return Err(mismatch),
        };
    }
    Ok(coefficients)
}
