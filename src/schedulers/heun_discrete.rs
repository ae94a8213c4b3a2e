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

use ndarray::{Array4, ArrayView1, ArrayView4, Zip};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::{rngs::StdRng, SeedableRng};

use super::{
	predict_original_sample, BetaSchedule, CumulativeAlphaTable, DiffusionScheduler, InferenceSchedule, PredictionType, SchedulerOptimizedDefaults,
	SchedulerStepOutput
};
use crate::{
	config::SchedulerConfig,
	error::{DiffusionError, Result},
	util::random::NoiseSource
};

/// State carried from a first-order step to the second-order correction that follows it.
#[derive(Debug, Clone)]
struct FirstOrderState {
	derivative: Array4<f32>,
	sample: Array4<f32>,
	dt: f32
}

/// Heun's method (Algorithm 1) from [Karras et al. (2022)](https://arxiv.org/abs/2206.00364).
///
/// Every interval but the last is integrated twice: an Euler step, then a correction that averages the derivative at
/// both ends. [`set_timesteps`](DiffusionScheduler::set_timesteps) therefore schedules `2 * steps - 1` model
/// evaluations; even step indices are Euler steps and odd ones are corrections.
#[derive(Debug, Clone)]
pub struct HeunDiscreteScheduler {
	alphas_cumprod: CumulativeAlphaTable,
	schedule: InferenceSchedule,
	prediction_type: PredictionType,
	first_order: Option<FirstOrderState>,
	seed_rng: StdRng
}

impl HeunDiscreteScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Errors
	/// Returns [`DiffusionError::Configuration`] if the config fails [`SchedulerConfig::validate`].
	pub fn new(config: &SchedulerConfig) -> Result<Self> {
		Ok(Self {
			alphas_cumprod: CumulativeAlphaTable::build(config)?,
			schedule: InferenceSchedule::empty(),
			prediction_type: config.prediction_type,
			first_order: None,
			seed_rng: StdRng::seed_from_u64(config.seed)
		})
	}
}

impl DiffusionScheduler for HeunDiscreteScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
		self.schedule = InferenceSchedule::discretize(&self.alphas_cumprod, num_inference_steps)?.interleave_second_order();
		self.first_order = None;
		Ok(())
	}

	fn initial_noise(&mut self, shape: (usize, usize, usize, usize)) -> Array4<f32> {
		Array4::<f32>::random_using(shape, StandardNormal, &mut self.seed_rng) * self.init_noise_sigma()
	}

	fn scale_model_input(&self, sample: ArrayView4<'_, f32>, step_index: usize) -> Result<Array4<f32>> {
		let (sigma, _) = self.schedule.sigma_pair(step_index)?;
		Ok(&sample * (1.0 / (sigma.powi(2) + 1.0).sqrt()) as f32)
	}

	fn timestep(&self, step_index: usize) -> Result<i64> {
		self.schedule.timestep(step_index)
	}

	fn step<N: NoiseSource + ?Sized>(
		&mut self,
		model_output: ArrayView4<'_, f32>,
		step_index: usize,
		sample: ArrayView4<'_, f32>,
		_noise: &mut N
	) -> Result<SchedulerStepOutput> {
		let (sigma, sigma_next) = self.schedule.sigma_pair(step_index)?;

		// 1. compute predicted original sample (x_0) at the noise level the model was evaluated at
		let pred_original_sample = predict_original_sample(self.prediction_type, model_output, sample, sigma as f32)?;

		let sigma_f = sigma as f32;
		let mut derivative = Array4::<f32>::zeros(sample.raw_dim());
		Zip::from(&mut derivative)
			.and(&sample)
			.and(&pred_original_sample)
			.par_for_each(|d, &x, &x0| {
				*d = (x - x0) / sigma_f;
			});

		let mut prev_sample = Array4::<f32>::zeros(sample.raw_dim());
		if step_index % 2 == 0 {
			// 2. first order: an Euler step to the next sigma, remembered for the correction
			let dt = (sigma_next - sigma) as f32;
			Zip::from(&mut prev_sample).and(&sample).and(&derivative).par_for_each(|p, &x, &d| {
				*p = x + d * dt;
			});
			self.first_order = Some(FirstOrderState {
				derivative: derivative.clone(),
				sample: sample.to_owned(),
				dt
			});
			tracing::debug!(step_index, sigma, sigma_next, "heun first-order step");
		} else {
			// 3. second order: average both derivatives and redo the step from the stored sample
			let state = self.first_order.take().ok_or_else(|| {
				DiffusionError::configuration(format!("second-order step {step_index} was not preceded by its first-order step"))
			})?;
			DiffusionError::check_shape(state.sample.shape(), sample.shape())?;
			Zip::from(&mut derivative).and(&state.derivative).par_for_each(|d, &prev| {
				*d = (*d + prev) / 2.0;
			});
			let dt = state.dt;
			Zip::from(&mut prev_sample)
				.and(&state.sample)
				.and(&derivative)
				.par_for_each(|p, &x, &d| {
					*p = x + d * dt;
				});
			tracing::debug!(step_index, sigma, "heun second-order step");
		}

		Ok(SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample),
			derivative: Some(derivative)
		})
	}

	fn timesteps(&self) -> ArrayView1<'_, f64> {
		self.schedule.timesteps()
	}

	fn sigmas(&self) -> ArrayView1<'_, f64> {
		self.schedule.sigmas()
	}

	fn init_noise_sigma(&self) -> f32 {
		self.schedule.max_sigma() as f32
	}

	fn len(&self) -> usize {
		self.schedule.len()
	}
}

impl SchedulerOptimizedDefaults for HeunDiscreteScheduler {
	fn stable_diffusion_v1_optimized_default() -> Result<Self>
	where
		Self: Sized
	{
		Self::new(&SchedulerConfig {
			training_steps: 1000,
			beta_start: 0.00085,
			beta_end: 0.012,
			beta_schedule: BetaSchedule::ScaledLinear,
			..Default::default()
		})
	}
}
