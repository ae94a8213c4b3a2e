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

//! Diffusion pipelines, and the model interfaces they drive.

use std::fmt::Debug;

use ndarray::{Array3, Array4, ArrayView2, ArrayView3, ArrayView4};

mod convert;
mod denoise;
mod stable_diffusion;

pub use self::convert::{from_rgb_image, to_rgb_image};
pub use self::denoise::DenoiseOptions;
pub use self::stable_diffusion::StableDiffusionPipeline;

/// A denoising network (typically a UNet) that predicts noise, velocity, or a sample from a noisy latent.
pub trait Denoiser {
	/// Runs the network on a `[1, C, H, W]` sample at an integer `timestep`, conditioned on `[1, 77, D]` text
	/// embeddings. The output must have the same shape as `sample`.
	fn predict(&self, sample: ArrayView4<'_, f32>, timestep: i64, conditioning: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>>;
}

/// A text encoder turning `[1, 77]` token IDs into `[1, 77, D]` conditioning embeddings.
pub trait TextEncoder {
	/// Encodes one padded prompt.
	fn encode(&self, token_ids: ArrayView2<'_, i32>) -> anyhow::Result<Array3<f32>>;
}

/// Decodes latents into `[1, 3, H, W]` pixel-space tensors with values in `[0, 1]`.
pub trait LatentDecoder {
	/// Decodes a `[1, C, h, w]` latent.
	fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>>;
}

/// Encodes `[1, 3, H, W]` pixel-space tensors with values in `[0, 1]` into latents; the inverse of [`LatentDecoder`].
pub trait LatentEncoder {
	/// Encodes one image into a `[1, C, H / 8, W / 8]` latent.
	fn encode(&self, pixels: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>>;
}

impl<D: Denoiser + ?Sized> Denoiser for &D {
	fn predict(&self, sample: ArrayView4<'_, f32>, timestep: i64, conditioning: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>> {
		(**self).predict(sample, timestep, conditioning)
	}
}

/// Describes a function to be called on each step of the denoising loop.
///
/// Callbacks return `false` to stop the loop early; the latents reached so far are then returned as the result.
pub enum DenoiseCallback {
	/// A simple callback to be used for e.g. reporting progress updates.
	Progress {
		/// Describes how frequently to call this callback (3 = every 3 steps). The final step is always reported.
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The current step number.
		/// - **`timestep`** (f32): This step's timestep.
		cb: Box<dyn Fn(usize, f32) -> bool>
	},
	/// A callback to receive this step's latents.
	Latents {
		/// Describes how frequently to call this callback (3 = every 3 steps). The final step is always reported.
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The current step number.
		/// - **`timestep`** (f32): This step's timestep.
		/// - **`latents`** (`ArrayView4<f32>`): Scheduler latent outputs for this step.
		cb: Box<dyn Fn(usize, f32, ArrayView4<'_, f32>) -> bool>
	}
}

impl Debug for DenoiseCallback {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("<DenoiseCallback>")
	}
}
