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
	error::Result,
	util::random::NoiseSource
};

/// Euler scheduler (Algorithm 2) from [Karras et al. (2022)](https://arxiv.org/abs/2206.00364), without churn.
///
/// Shares its noise schedule with [`EulerAncestralDiscreteScheduler`](super::EulerAncestralDiscreteScheduler) but
/// never re-injects noise, so a generation is fully determined by the seed.
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd].
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L51
#[derive(Debug, Clone)]
pub struct EulerDiscreteScheduler {
	alphas_cumprod: CumulativeAlphaTable,
	schedule: InferenceSchedule,
	prediction_type: PredictionType,
	seed_rng: StdRng
}

impl EulerDiscreteScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Errors
	/// Returns [`DiffusionError::Configuration`](crate::DiffusionError::Configuration) if the config fails [`SchedulerConfig::validate`].
	pub fn new(config: &SchedulerConfig) -> Result<Self> {
		Ok(Self {
			alphas_cumprod: CumulativeAlphaTable::build(config)?,
			schedule: InferenceSchedule::empty(),
			prediction_type: config.prediction_type,
			seed_rng: StdRng::seed_from_u64(config.seed)
		})
	}
}

impl DiffusionScheduler for EulerDiscreteScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
		self.schedule = InferenceSchedule::discretize(&self.alphas_cumprod, num_inference_steps)?;
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
		let (sigma_from, sigma_to) = self.schedule.sigma_pair(step_index)?;

		let pred_original_sample = predict_original_sample(self.prediction_type, model_output, sample, sigma_from as f32)?;

		let dt = (sigma_to - sigma_from) as f32;
		let sigma = sigma_from as f32;
		let mut derivative = Array4::<f32>::zeros(sample.raw_dim());
		let mut prev_sample = Array4::<f32>::zeros(sample.raw_dim());
		Zip::from(&mut derivative)
			.and(&mut prev_sample)
			.and(&sample)
			.and(&pred_original_sample)
			.par_for_each(|d, p, &x, &x0| {
				*d = (x - x0) / sigma;
				*p = x + *d * dt;
			});

		tracing::debug!(step_index, sigma_from, sigma_to, "euler step");

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

impl SchedulerOptimizedDefaults for EulerDiscreteScheduler {
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
