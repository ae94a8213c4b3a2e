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

/// [Denoising diffusion probabilistic models][ddpm] explores the connections between denoising score matching and
/// Langevin dynamics sampling.
///
/// Each step samples from the posterior `q(x_{t-1} | x_t, x_0)`: its mean blends the current sample and the predicted
/// `x_0`, and fresh noise is added at the posterior's standard deviation until the schedule reaches zero.
///
/// [ddpm]: https://arxiv.org/abs/2006.11239
#[derive(Debug, Clone)]
pub struct DDPMDiscreteScheduler {
	alphas_cumprod: CumulativeAlphaTable,
	schedule: InferenceSchedule,
	prediction_type: PredictionType,
	seed_rng: StdRng
}

impl DDPMDiscreteScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Errors
	/// Returns [`DiffusionError::Configuration`] if the config fails [`SchedulerConfig::validate`].
	pub fn new(config: &SchedulerConfig) -> Result<Self> {
		Ok(Self {
			alphas_cumprod: CumulativeAlphaTable::build(config)?,
			schedule: InferenceSchedule::empty(),
			prediction_type: config.prediction_type,
			seed_rng: StdRng::seed_from_u64(config.seed)
		})
	}

	/// Posterior coefficients `(sample_coeff, original_coeff, std_dev)` for a step from `sigma_from` to `sigma_to`.
	fn posterior(sigma_from: f64, sigma_to: f64) -> (f64, f64, f64) {
		let ratio = sigma_to.powi(2) / sigma_from.powi(2);
		let std_dev = (ratio * (sigma_from.powi(2) - sigma_to.powi(2))).max(0.0).sqrt();
		(ratio, 1.0 - ratio, std_dev)
	}
}

impl DiffusionScheduler for DDPMDiscreteScheduler {
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
		noise: &mut N
	) -> Result<SchedulerStepOutput> {
		let (sigma_from, sigma_to) = self.schedule.sigma_pair(step_index)?;

		// 1. compute predicted original sample from predicted noise, "predicted x_0" of formula (15)
		let pred_original_sample = predict_original_sample(self.prediction_type, model_output, sample, sigma_from as f32)?;

		// 2. compute the predicted previous sample mean, formula (7)
		let (sample_coeff, original_coeff, std_dev) = Self::posterior(sigma_from, sigma_to);
		let (a, b) = (sample_coeff as f32, original_coeff as f32);
		let mut prev_sample = Array4::<f32>::zeros(sample.raw_dim());
		Zip::from(&mut prev_sample)
			.and(&sample)
			.and(&pred_original_sample)
			.par_for_each(|p, &x, &x0| {
				*p = x * a + x0 * b;
			});

		// 3. add noise
		if sigma_to > 0.0 {
			let noise = noise.standard_normal(sample.raw_dim());
			DiffusionError::check_shape(sample.shape(), noise.shape())?;
			let std_dev = std_dev as f32;
			Zip::from(&mut prev_sample).and(&noise).par_for_each(|p, &n| {
				*p += n * std_dev;
			});
		}

		tracing::debug!(step_index, sigma_from, sigma_to, std_dev, "ddpm step");

		Ok(SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample),
			derivative: None
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

impl SchedulerOptimizedDefaults for DDPMDiscreteScheduler {
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
