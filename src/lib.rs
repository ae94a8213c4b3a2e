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

//! `onnx-sd-sampler` runs the sampling side of Stable Diffusion: it builds the noise schedule, steps latents with one
//! of the discrete schedulers (Euler-ancestral by default, plus Euler, DDIM, DDPM, Heun and LMS behind `scheduler-*`
//! features), and drives the denoising loop with classifier-free guidance. Models are run through [ONNX Runtime].
//!
//! The denoising loop only needs something implementing [`Denoiser`], so it can be driven without ONNX models:
//! ```
//! # fn main() -> anyhow::Result<()> {
//! use ndarray::{Array3, Array4, ArrayView3, ArrayView4};
//! use onnx_sd_sampler::{DenoiseOptions, Denoiser, EulerAncestralDiscreteScheduler, SchedulerOptimizedDefaults};
//!
//! struct NoOp;
//!
//! impl Denoiser for NoOp {
//! 	fn predict(&self, sample: ArrayView4<'_, f32>, _: i64, _: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>> {
//! 		Ok(Array4::zeros(sample.raw_dim()))
//! 	}
//! }
//!
//! let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default()?;
//! let conditioning = Array3::<f32>::zeros((1, 77, 768));
//! let latents = DenoiseOptions::default()
//! 	.with_steps(5)
//! 	.with_guidance_scale(1.0)
//! 	.with_latent_size(4, 8, 8)
//! 	.run(&NoOp, &mut scheduler, Some(conditioning.view()), None, None)?;
//! assert_eq!(latents.shape(), &[1, 4, 8, 8]);
//! # Ok(())
//! # }
//! ```
//!
//! See [`StableDiffusionPipeline`] for running the full text-to-image and image-to-image pipelines on ONNX models.
//!
//! [ONNX Runtime]: https://onnxruntime.ai/

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

pub mod clip;
pub mod config;
/// Error types returned by schedulers and the denoising loop.
pub mod error;
pub mod onnx;
pub mod pipelines;
pub mod schedulers;
pub mod util;

pub use ort::Environment as OrtEnvironment;

pub use self::config::{DiffusionConfig, SchedulerConfig, SchedulerKind, UNetConfig};
pub use self::error::DiffusionError;
pub use self::onnx::{DiffusionDevice, DiffusionDeviceControl};
pub use self::pipelines::*;
pub use self::schedulers::*;
pub use self::util::random::{AncestralNoise, NoiseSource};
