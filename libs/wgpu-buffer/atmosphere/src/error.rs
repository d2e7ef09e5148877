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
use thiserror::Error;

/// Everything that can go wrong while keeping the sky tables current. None
/// of these are fatal: the frame driver logs them and tries again later.
#[derive(Debug, Error)]
pub enum SkyLutError {
    #[error("allocation of {label} failed: {reason}")]
    AllocationFailure { label: String, reason: String },

    #[error("ambient probe readback failed: {reason}")]
    ReadbackFailed { reason: String },

    #[error("ambient probe returned {actual} coefficients; expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("missing dependency: {what}")]
    MissingDependency { what: String },
}

impl SkyLutError {
    pub(crate) fn allocation(label: &str, err: anyhow::Error) -> Self {
        Self::AllocationFailure {
            label: label.to_owned(),
            reason: format!("{:#}", err),
        }
    }

    pub(crate) fn missing(what: impl Into<String>) -> Self {
        Self::MissingDependency { what: what.into() }
    }
}
