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
use log::trace;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelInfo {
    name: String,
    work_group_size: [u32; 3],
}

impl KernelInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn work_group_size(&self) -> [u32; 3] {
        self.work_group_size
    }
}

/// Find every compute entry point in a WGSL program, along with the work
/// group size it was declared with.
pub fn reflect_compute_kernels(source: &str) -> Result<Vec<KernelInfo>> {
    let module = naga::front::wgsl::parse_str(source).map_err(|err| {
        anyhow!("failed to parse compute program:\n{}", err.emit_to_string(source))
    })?;
    let kernels = module
        .entry_points
        .iter()
        .filter(|ep| ep.stage == naga::ShaderStage::Compute)
        .map(|ep| {
            trace!("found kernel {} with work group {:?}", ep.name, ep.workgroup_size);
            KernelInfo {
                name: ep.name.clone(),
                work_group_size: ep.workgroup_size,
            }
        })
        .collect();
    Ok(kernels)
}

#[cfg(test)]
mod test {
    use super::*;

    const PROGRAM: &str = r#"
@group(0) @binding(0) var<storage, read_write> values: array<f32>;

@compute @workgroup_size(8, 8, 1)
fn compute_transmittance(@builtin(global_invocation_id) id: vec3<u32>) {
    values[id.x] = 1.0;
}

@compute @workgroup_size(64)
fn compute_ambient_sh(@builtin(global_invocation_id) id: vec3<u32>) {
    values[id.x] = 0.0;
}
"#;

    #[test]
    fn test_reflect_work_groups() -> Result<()> {
        let kernels = reflect_compute_kernels(PROGRAM)?;
        assert_eq!(kernels.len(), 2);
        assert_eq!(kernels[0].name(), "compute_transmittance");
        assert_eq!(kernels[0].work_group_size(), [8, 8, 1]);
        assert_eq!(kernels[1].name(), "compute_ambient_sh");
        assert_eq!(kernels[1].work_group_size(), [64, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_reject_bad_program() {
        assert!(reflect_compute_kernels("fn nope( {").is_err());
    }
}
