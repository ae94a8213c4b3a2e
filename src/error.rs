// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use thiserror::Error;

/// Errors produced while building a schedule or running the denoising loop.
///
/// Every variant is fatal to the generation that raised it; any partially denoised latent should be discarded.
#[derive(Error, Debug)]
pub enum DiffusionError {
	/// The scheduler or pipeline was configured with an unsupported or invalid combination of options.
	#[error("configuration error: {0}")]
	Configuration(String),

	/// A step index was used past the end of the inference schedule.
	#[error("step index {index} out of range for a schedule of {len} inference steps")]
	IndexOutOfRange {
		/// The offending step index.
		index: usize,
		/// The number of inference steps in the schedule.
		len: usize
	},

	/// A tensor crossing a component boundary did not have the expected shape.
	#[error("shape mismatch: expected {expected:?}, got {actual:?}")]
	ShapeMismatch {
		/// The shape the receiving component expected.
		expected: Vec<usize>,
		/// The shape that was actually received.
		actual: Vec<usize>
	},

	/// An external model (UNet, text encoder, VAE) failed.
	#[error("model invocation failed: {0:#}")]
	Network(anyhow::Error)
}

impl DiffusionError {
	pub(crate) fn configuration(message: impl Into<String>) -> Self {
		Self::Configuration(message.into())
	}

	pub(crate) fn check_shape(expected: &[usize], actual: &[usize]) -> Result<(), Self> {
		if expected != actual {
			return Err(Self::ShapeMismatch {
				expected: expected.to_vec(),
				actual: actual.to_vec()
			});
		}
		Ok(())
	}
}

/// Shorthand for results carrying a [`DiffusionError`].
pub type Result<T, E = DiffusionError> = std::result::Result<T, E>;
