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

use std::collections::VecDeque;

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
	util::{integration::simpson, random::NoiseSource}
};

const INTEGRATION_PIECES: usize = 64;

/// [Linear multistep][lm] scheduler for discrete beta schedules. Based on the [original `k-diffusion`
/// implementation][kdif] by Katherine Crowson.
///
/// Steps must be taken in order; the scheduler keeps the derivatives of the last [`SchedulerConfig::lms_order`]
/// steps and resets them on [`set_timesteps`](DiffusionScheduler::set_timesteps).
///
/// [lm]: https://en.wikipedia.org/wiki/Linear_multistep_method#Adams%E2%80%93Bashforth_methods
/// [kdif]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L181
#[derive(Debug, Clone)]
pub struct LMSDiscreteScheduler {
	alphas_cumprod: CumulativeAlphaTable,
	schedule: InferenceSchedule,
	prediction_type: PredictionType,
	order: usize,
	derivatives: VecDeque<Array4<f32>>,
	seed_rng: StdRng
}

impl LMSDiscreteScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Errors
	/// Returns [`DiffusionError::Configuration`] if the config fails [`SchedulerConfig::validate`].
	pub fn new(config: &SchedulerConfig) -> Result<Self> {
		Ok(Self {
			alphas_cumprod: CumulativeAlphaTable::build(config)?,
			schedule: InferenceSchedule::empty(),
			prediction_type: config.prediction_type,
			order: config.lms_order,
			derivatives: VecDeque::with_capacity(config.lms_order),
			seed_rng: StdRng::seed_from_u64(config.seed)
		})
	}

	/// Computes a linear multistep coefficient: the integral over `[sigma[t], sigma[t + 1]]` of the Lagrange basis
	/// polynomial for the derivative recorded `current_order` steps ago.
	fn get_lms_coefficient(&self, order: usize, t: usize, current_order: usize) -> f64 {
		let sigmas = self.schedule.sigmas();
		let basis = |tau: f64| {
			let mut prod = 1.0_f64;
			for k in 0..order {
				if k == current_order {
					continue;
				}
				prod *= (tau - sigmas[t - k]) / (sigmas[t - current_order] - sigmas[t - k]);
			}
			prod
		};
		simpson(basis, sigmas[t], sigmas[t + 1], INTEGRATION_PIECES)
	}
}

impl DiffusionScheduler for LMSDiscreteScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
		self.schedule = InferenceSchedule::discretize(&self.alphas_cumprod, num_inference_steps)?;
		self.derivatives.clear();
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
		let (sigma, _) = self.schedule.sigma_pair(step_index)?;

		// 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
		let pred_original_sample = predict_original_sample(self.prediction_type, model_output, sample, sigma as f32)?;

		// 2. convert to an ODE derivative
		let sigma_f = sigma as f32;
		let mut derivative = Array4::<f32>::zeros(sample.raw_dim());
		Zip::from(&mut derivative)
			.and(&sample)
			.and(&pred_original_sample)
			.par_for_each(|d, &x, &x0| {
				*d = (x - x0) / sigma_f;
			});
		if let Some(previous) = self.derivatives.front() {
			DiffusionError::check_shape(previous.shape(), derivative.shape())?;
		}

		// newest first
		self.derivatives.push_front(derivative.clone());
		self.derivatives.truncate(self.order);

		// 3. compute linear multistep coefficients
		let order = self.order.min(step_index + 1).min(self.derivatives.len());
		let lms_coeffs: Vec<f32> = (0..order).map(|o| self.get_lms_coefficient(order, step_index, o) as f32).collect();

		// 4. compute previous sample based on the derivatives path
		let mut prev_sample = sample.to_owned();
		for (coeff, derivative) in lms_coeffs.iter().zip(self.derivatives.iter()) {
			Zip::from(&mut prev_sample).and(derivative).par_for_each(|p, &d| {
				*p += d * *coeff;
			});
		}

		tracing::debug!(step_index, sigma, order, ?lms_coeffs, "lms step");

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

impl SchedulerOptimizedDefaults for LMSDiscreteScheduler {
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
