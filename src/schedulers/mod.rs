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

//! The schedule functions, denoted Schedulers in the library, take in the output of a trained model, a sample which
//! the diffusion process is iterating on, and a step index to return a denoised sample.
//!
//! * Schedulers define the methodology for iteratively updating a sample based on model outputs.
//! * Schedulers are defined by a noise schedule (see [`CumulativeAlphaTable`] and [`InferenceSchedule`]) and an
//!   update rule to solve the differential equation solution.

use ndarray::{Array4, ArrayBase, ArrayView1, ArrayView4, Zip};
use serde::{Deserialize, Serialize};

use crate::{
	error::{DiffusionError, Result},
	util::random::NoiseSource
};

pub mod noise_schedule;
pub use self::noise_schedule::{CumulativeAlphaTable, InferenceSchedule};

cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-euler")] {
		mod euler_discrete;
		pub use self::euler_discrete::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-euler-ancestral")] {
		mod euler_ancestral_discrete;
		pub use self::euler_ancestral_discrete::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-ddim")] {
		mod ddim;
		pub use self::ddim::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-ddpm")] {
		mod ddpm;
		pub use self::ddpm::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-heun")] {
		mod heun_discrete;
		pub use self::heun_discrete::*;
	}
}
cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-lms")] {
		mod lms_discrete;
		pub use self::lms_discrete::*;
	}
}

/// A mapping from a beta range to a sequence of betas for stepping the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BetaSchedule {
	/// Linear beta schedule.
	Linear,
	/// Scaled linear beta schedule; linear in `sqrt(beta)`.
	ScaledLinear,
	/// Squared cosine schedule, with betas capped at `0.999`. The `alpha_bar` curve is picked by [`AlphaTransform`].
	#[serde(rename = "squaredcos-cap-v2")]
	SquaredCosCapV2
}

/// The `alpha_bar` curve used by [`BetaSchedule::SquaredCosCapV2`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlphaTransform {
	/// `cos((t + 0.008) / 1.008 * pi / 2) ^ 2`
	Cosine,
	/// `exp(-12 t)`
	Exp
}

/// What the denoising model predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PredictionType {
	/// The model predicts the noise added to the sample.
	Epsilon,
	/// The model predicts velocity, see [Salimans & Ho (2022)](https://arxiv.org/abs/2202.00512).
	VPrediction,
	/// The model predicts the denoised sample directly. **Not implemented**; rejected when a scheduler is created.
	Sample
}

/// How ancestral steps split the next sigma into a deterministic and a stochastic part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AncestralVariant {
	/// `sigma_down = sqrt(sigma_next^2 - 0^2)`, i.e. the deterministic part always steps all the way to
	/// `sigma_next` and the re-injected noise comes on top of it.
	#[default]
	Reference,
	/// `sigma_down = sqrt(sigma_next^2 - sigma_up^2)`, as in `k-diffusion`'s `get_ancestral_step`.
	Corrected
}

/// The output returned by a scheduler's `step` function.
pub struct SchedulerStepOutput {
	pub(crate) prev_sample: Array4<f32>,
	pub(crate) pred_original_sample: Option<Array4<f32>>,
	pub(crate) derivative: Option<Array4<f32>>
}

impl SchedulerStepOutput {
	/// Computed sample (`x_{t-1}`) of the previous timestep. `prev_sample` should be used as the next model input in
	/// the denoising loop.
	pub fn prev_sample(&self) -> ArrayView4<'_, f32> {
		self.prev_sample.view()
	}

	/// Consumes the output, returning `prev_sample`.
	pub fn into_prev_sample(self) -> Array4<f32> {
		self.prev_sample
	}

	/// The predicted denoised sample (`x_{0}`) based on the model output from the current timestep.
	/// `pred_original_sample` can be used to preview progress or for guidance.
	pub fn pred_original_sample(&self) -> Option<ArrayView4<'_, f32>> {
		self.pred_original_sample.as_ref().map(ArrayBase::view)
	}

	/// Derivative of predicted original image sample (`x_0`).
	pub fn derivative(&self) -> Option<ArrayView4<'_, f32>> {
		self.derivative.as_ref().map(ArrayBase::view)
	}
}

/// A scheduler to be used in diffusion pipelines.
///
/// Step-indexed methods return [`DiffusionError::IndexOutOfRange`] for any `step_index >= len()`; they never clamp.
#[allow(clippy::len_without_is_empty)]
pub trait DiffusionScheduler {
	/// Sets the number of inference steps. This must be called before `step` to compute the sigmas and timesteps.
	fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()>;

	/// Draws the initial noise latent from the scheduler's seeded generator, scaled by [`init_noise_sigma`].
	///
	/// [`init_noise_sigma`]: DiffusionScheduler::init_noise_sigma
	fn initial_noise(&mut self, shape: (usize, usize, usize, usize)) -> Array4<f32>;

	/// Scales the denoising model input by `(sigma**2 + 1) ** 0.5` to match the K-LMS algorithm.
	fn scale_model_input(&self, sample: ArrayView4<'_, f32>, step_index: usize) -> Result<Array4<f32>>;

	/// The timestep to feed the model at `step_index`; the schedule's fractional timestep truncated toward zero.
	fn timestep(&self, step_index: usize) -> Result<i64>;

	/// Predict the sample at the previous timestep by reversing the SDE. Core function to propagate the diffusion
	/// process from the learned model outputs (most often the predicted noise).
	fn step<N: NoiseSource + ?Sized>(
		&mut self,
		model_output: ArrayView4<'_, f32>,
		step_index: usize,
		sample: ArrayView4<'_, f32>,
		noise: &mut N
	) -> Result<SchedulerStepOutput>;

	/// Returns the computed scheduler timesteps. These stay in double precision; [`timestep`] truncates them.
	///
	/// [`timestep`]: DiffusionScheduler::timestep
	fn timesteps(&self) -> ArrayView1<'_, f64>;

	/// Returns the computed sigmas, including the terminal `0`.
	fn sigmas(&self) -> ArrayView1<'_, f64>;

	/// Returns the initial sigma noise value.
	fn init_noise_sigma(&self) -> f32;

	/// Returns the number of inference steps currently scheduled.
	fn len(&self) -> usize;
}

/// Stable Diffusion-specific scheduler presets.
pub trait SchedulerOptimizedDefaults {
	/// Creates the scheduler with the training configuration Stable Diffusion v1 models were trained with.
	fn stable_diffusion_v1_optimized_default() -> Result<Self>
	where
		Self: Sized;
}

/// Converts a model output at noise level `sigma` into a predicted denoised sample.
pub(crate) fn predict_original_sample(
	prediction_type: PredictionType,
	model_output: ArrayView4<'_, f32>,
	sample: ArrayView4<'_, f32>,
	sigma: f32
) -> Result<Array4<f32>> {
	DiffusionError::check_shape(sample.shape(), model_output.shape())?;

	let mut pred = Array4::<f32>::zeros(sample.raw_dim());
	match prediction_type {
		PredictionType::Epsilon => {
			Zip::from(&mut pred).and(&sample).and(&model_output).par_for_each(|p, &x, &e| {
				*p = x - e * sigma;
			});
		}
		PredictionType::VPrediction => {
			let skip_denom = sigma.powi(2) + 1.0;
			let c_out = -sigma / skip_denom.sqrt();
			Zip::from(&mut pred).and(&sample).and(&model_output).par_for_each(|p, &x, &v| {
				*p = x / skip_denom + v * c_out;
			});
		}
		PredictionType::Sample => return Err(DiffusionError::configuration("prediction type `sample` is not implemented"))
	}
	Ok(pred)
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;

	use super::*;

	#[test]
	fn test_epsilon_prediction() {
		let sample = Array4::from_elem((1, 2, 2, 2), 3.0_f32);
		let output = Array4::from_elem((1, 2, 2, 2), 0.5_f32);
		let pred = predict_original_sample(PredictionType::Epsilon, output.view(), sample.view(), 2.0).unwrap();
		assert!(pred.iter().all(|&p| p == 2.0));
	}

	#[test]
	fn test_v_prediction() {
		let sample = Array4::from_elem((1, 1, 2, 2), 2.0_f32);
		let output = Array4::from_elem((1, 1, 2, 2), 1.0_f32);
		let sigma = 3.0_f32;
		let pred = predict_original_sample(PredictionType::VPrediction, output.view(), sample.view(), sigma).unwrap();
		let expected = 2.0 / 10.0 - 3.0 / 10.0_f32.sqrt();
		assert!(pred.iter().all(|&p| (p - expected).abs() < 1e-6));
	}

	#[test]
	fn test_sample_prediction_unimplemented() {
		let sample = Array4::<f32>::zeros((1, 1, 1, 1));
		let result = predict_original_sample(PredictionType::Sample, sample.view(), sample.view(), 1.0);
		assert!(matches!(result, Err(DiffusionError::Configuration(_))));
	}

	#[test]
	fn test_prediction_shape_mismatch() {
		let sample = Array4::<f32>::zeros((1, 4, 8, 8));
		let output = Array4::<f32>::zeros((1, 4, 8, 4));
		let result = predict_original_sample(PredictionType::Epsilon, output.view(), sample.view(), 1.0);
		assert!(matches!(result, Err(DiffusionError::ShapeMismatch { .. })));
	}

	#[test]
	fn test_enum_names() {
		assert_eq!(serde_json::to_string(&BetaSchedule::SquaredCosCapV2).unwrap(), "\"squaredcos-cap-v2\"");
		assert_eq!(serde_json::to_string(&BetaSchedule::ScaledLinear).unwrap(), "\"scaled-linear\"");
		assert_eq!(serde_json::from_str::<PredictionType>("\"v-prediction\"").unwrap(), PredictionType::VPrediction);
	}
}
