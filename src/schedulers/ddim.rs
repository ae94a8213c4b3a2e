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

/// [Denoising diffusion implicit models][ddim] is a scheduler that extends the denoising procedure introduced in
/// denoising diffusion probabilistic models (DDPMs) with non-Markovian guidance.
///
/// The update is written in terms of the sigma schedule shared with the Euler schedulers, so latents are scaled the
/// same way and the schedulers can be swapped freely. `eta` (see [`SchedulerConfig::ddim_eta`]) controls how much of
/// the next noise level is re-drawn: `0` is fully deterministic and matches
/// [`EulerDiscreteScheduler`](super::EulerDiscreteScheduler) step for step, `1` is equivalent to
/// [`DDPMDiscreteScheduler`](super::DDPMDiscreteScheduler).
///
/// [ddim]: https://arxiv.org/abs/2010.02502
#[derive(Debug, Clone)]
pub struct DDIMDiscreteScheduler {
	alphas_cumprod: CumulativeAlphaTable,
	schedule: InferenceSchedule,
	prediction_type: PredictionType,
	eta: f64,
	seed_rng: StdRng
}

impl DDIMDiscreteScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Errors
	/// Returns [`DiffusionError::Configuration`] if the config fails [`SchedulerConfig::validate`].
	pub fn new(config: &SchedulerConfig) -> Result<Self> {
		Ok(Self {
			alphas_cumprod: CumulativeAlphaTable::build(config)?,
			schedule: InferenceSchedule::empty(),
			prediction_type: config.prediction_type,
			eta: config.ddim_eta,
			seed_rng: StdRng::seed_from_u64(config.seed)
		})
	}

	/// `sigma_t(eta)` of formula (16), expressed as a noise level.
	fn variance_sigma(&self, sigma_from: f64, sigma_to: f64) -> f64 {
		if self.eta <= 0.0 {
			return 0.0;
		}
		self.eta * (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2)) / sigma_from.powi(2)).max(0.0).sqrt()
	}
}

impl DiffusionScheduler for DDIMDiscreteScheduler {
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

		// 1. compute predicted original sample, "predicted x_0" of formula (12)
		let pred_original_sample = predict_original_sample(self.prediction_type, model_output, sample, sigma_from as f32)?;

		// 2. compute variance: "sigma_t(eta)" of formula (16)
		let std_dev = self.variance_sigma(sigma_from, sigma_to);

		// 3. the direction pointing to x_t keeps what remains of the next noise level
		let direction = (sigma_to.powi(2) - std_dev.powi(2)).max(0.0).sqrt();
		let ratio = (direction / sigma_from) as f32;
		let mut prev_sample = Array4::<f32>::zeros(sample.raw_dim());
		Zip::from(&mut prev_sample)
			.and(&sample)
			.and(&pred_original_sample)
			.par_for_each(|p, &x, &x0| {
				*p = x0 + (x - x0) * ratio;
			});

		// 4. add the random part of formula (12)
		if std_dev > 0.0 {
			let noise = noise.standard_normal(sample.raw_dim());
			DiffusionError::check_shape(sample.shape(), noise.shape())?;
			let std_dev = std_dev as f32;
			Zip::from(&mut prev_sample).and(&noise).par_for_each(|p, &n| {
				*p += n * std_dev;
			});
		}

		tracing::debug!(step_index, sigma_from, sigma_to, std_dev, "ddim step");

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

impl SchedulerOptimizedDefaults for DDIMDiscreteScheduler {
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
