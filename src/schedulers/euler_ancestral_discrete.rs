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
	predict_original_sample, AncestralVariant, BetaSchedule, CumulativeAlphaTable, DiffusionScheduler, InferenceSchedule, PredictionType,
	SchedulerOptimizedDefaults, SchedulerStepOutput
};
use crate::{
	config::SchedulerConfig,
	error::{DiffusionError, Result},
	util::random::NoiseSource
};

/// Ancestral sampling with Euler method steps.
///
/// Based on the original [`k-diffusion` implementation by Katherine Crowson][kd].
///
/// The initial noise comes from a generator seeded with [`SchedulerConfig::seed`]; the noise re-injected by each step
/// comes from the [`NoiseSource`] handed to [`step`](DiffusionScheduler::step), see [`crate::util::random`].
///
/// [kd]: https://github.com/crowsonkb/k-diffusion/blob/481677d114f6ea445aa009cf5bd7a9cdee909e47/k_diffusion/sampling.py#L72
#[derive(Debug, Clone)]
pub struct EulerAncestralDiscreteScheduler {
	alphas_cumprod: CumulativeAlphaTable,
	schedule: InferenceSchedule,
	prediction_type: PredictionType,
	variant: AncestralVariant,
	seed_rng: StdRng
}

impl EulerAncestralDiscreteScheduler {
	/// Creates a new instance of the scheduler. [`set_timesteps`](DiffusionScheduler::set_timesteps) must be called
	/// before stepping.
	///
	/// # Errors
	/// Returns [`DiffusionError::Configuration`] if the config fails [`SchedulerConfig::validate`].
	pub fn new(config: &SchedulerConfig) -> Result<Self> {
		let alphas_cumprod = CumulativeAlphaTable::build(config)?;

		Ok(Self {
			alphas_cumprod,
			schedule: InferenceSchedule::empty(),
			prediction_type: config.prediction_type,
			variant: config.ancestral_variant,
			seed_rng: StdRng::seed_from_u64(config.seed)
		})
	}

	/// The full discretized schedule.
	pub fn schedule(&self) -> &InferenceSchedule {
		&self.schedule
	}

	/// `(sigma_up, sigma_down)` for a step from `sigma_from` to `sigma_to`.
	fn ancestral_sigmas(&self, sigma_from: f64, sigma_to: f64) -> (f64, f64) {
		let sigma_up = sigma_to.min((sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2)) / sigma_from.powi(2)).sqrt());
		let sigma_down = match self.variant {
			AncestralVariant::Reference => (sigma_to.powi(2) - 0.0_f64.powi(2)).sqrt(),
			AncestralVariant::Corrected => (sigma_to.powi(2) - sigma_up.powi(2)).max(0.0).sqrt()
		};
		(sigma_up, sigma_down)
	}
}

impl DiffusionScheduler for EulerAncestralDiscreteScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
		self.schedule = InferenceSchedule::discretize(&self.alphas_cumprod, num_inference_steps)?;
		Ok(())
	}

	fn initial_noise(&mut self, shape: (usize, usize, usize, usize)) -> Array4<f32> {
		let mut noise = Array4::<f32>::random_using(shape, StandardNormal, &mut self.seed_rng);
		noise *= self.init_noise_sigma();
		noise
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

		// 1. compute predicted original sample (x_0) from sigma-scaled predicted noise
		let pred_original_sample = predict_original_sample(self.prediction_type, model_output, sample, sigma_from as f32)?;
		let (sigma_up, sigma_down) = self.ancestral_sigmas(sigma_from, sigma_to);

		// 2. convert to a ODE derivative
		let dt = (sigma_down - sigma_from) as f32;
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

		// 3. re-inject noise, except on the final step
		if sigma_to > 0.0 {
			let noise = noise.standard_normal(sample.raw_dim());
			DiffusionError::check_shape(sample.shape(), noise.shape())?;
			let sigma_up = sigma_up as f32;
			Zip::from(&mut prev_sample).and(&noise).par_for_each(|p, &n| {
				*p += n * sigma_up;
			});
		}

		tracing::debug!(step_index, sigma_from, sigma_to, sigma_up, sigma_down, "euler ancestral step");

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

impl SchedulerOptimizedDefaults for EulerAncestralDiscreteScheduler {
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

#[cfg(test)]
mod tests {
	use ndarray::{Array4, Ix4};

	use super::*;
	use crate::util::random::SeededNoise;

	struct ZeroNoise;

	impl NoiseSource for ZeroNoise {
		fn standard_normal(&mut self, shape: Ix4) -> Array4<f32> {
			Array4::zeros(shape)
		}
	}

	struct ForbiddenNoise;

	impl NoiseSource for ForbiddenNoise {
		fn standard_normal(&mut self, _: Ix4) -> Array4<f32> {
			panic!("no noise should be drawn on the final step");
		}
	}

	fn scheduler(steps: usize) -> EulerAncestralDiscreteScheduler {
		let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		scheduler.set_timesteps(steps).unwrap();
		scheduler
	}

	#[test]
	fn test_timesteps_truncate() {
		let scheduler = scheduler(3);
		let timesteps: Vec<i64> = (0..3).map(|i| scheduler.timestep(i).unwrap()).collect();
		assert_eq!(timesteps, vec![999, 499, 0]);
	}

	#[test]
	fn test_timestep_truncates_double_precision_value() {
		let scheduler = scheduler(100);
		assert_eq!(scheduler.timestep(77).unwrap(), (999.0_f64 - 999.0 / 99.0 * 77.0) as i64);
		assert_eq!(scheduler.timestep(77).unwrap(), 221);
	}

	#[test]
	fn test_out_of_range() {
		let mut scheduler = scheduler(3);
		let sample = Array4::<f32>::zeros((1, 4, 8, 8));
		for index in [3, 4, 100] {
			assert!(matches!(scheduler.timestep(index), Err(DiffusionError::IndexOutOfRange { len: 3, .. })));
			assert!(matches!(scheduler.scale_model_input(sample.view(), index), Err(DiffusionError::IndexOutOfRange { len: 3, .. })));
			assert!(matches!(
				scheduler.step(sample.view(), index, sample.view(), &mut ZeroNoise),
				Err(DiffusionError::IndexOutOfRange { len: 3, .. })
			));
		}
	}

	#[test]
	fn test_unscheduled_is_out_of_range() {
		let scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		assert_eq!(scheduler.len(), 0);
		assert!(matches!(scheduler.timestep(0), Err(DiffusionError::IndexOutOfRange { index: 0, len: 0 })));
	}

	#[test]
	fn test_scale_model_input() {
		let scheduler = scheduler(3);
		let sample = Array4::from_elem((1, 1, 2, 2), 2.0_f32);
		let sigma = scheduler.sigmas()[1];
		let scaled = scheduler.scale_model_input(sample.view(), 1).unwrap();
		let expected = (2.0 / (sigma * sigma + 1.0).sqrt()) as f32;
		assert!(scaled.iter().all(|&s| (s - expected).abs() < 1e-6));
	}

	#[test]
	fn test_initial_noise_is_seeded() {
		let mut a = scheduler(3);
		let mut b = scheduler(3);
		let noise_a = a.initial_noise((1, 4, 8, 8));
		assert_eq!(noise_a, b.initial_noise((1, 4, 8, 8)));

		let mut rng = StdRng::seed_from_u64(SchedulerConfig::default().seed);
		let raw = Array4::<f32>::random_using((1, 4, 8, 8), StandardNormal, &mut rng);
		assert_eq!(noise_a, raw * a.init_noise_sigma());

		let mut other = EulerAncestralDiscreteScheduler::new(&SchedulerConfig { seed: 1234, ..Default::default() }).unwrap();
		other.set_timesteps(3).unwrap();
		assert_ne!(noise_a, other.initial_noise((1, 4, 8, 8)));
	}

	#[test]
	fn test_final_step_draws_no_noise() {
		let mut scheduler = scheduler(3);
		let sample = Array4::from_shape_fn((1, 2, 3, 3), |(_, c, h, w)| (c * 9 + h * 3 + w) as f32 * 0.1 - 0.5);
		let output = Array4::from_elem((1, 2, 3, 3), 0.25_f32);

		let out = scheduler.step(output.view(), 2, sample.view(), &mut ForbiddenNoise).unwrap();

		let sigma = scheduler.sigmas()[2] as f32;
		let pred = &sample - &(&output * sigma);
		let derivative = (&sample - &pred) / sigma;
		let expected = &sample + &(&derivative * (0.0 - sigma));
		assert_eq!(out.prev_sample(), expected.view());
	}

	#[test]
	fn test_zero_output_keeps_deterministic_part() {
		let mut scheduler = scheduler(3);
		let sample = Array4::from_elem((1, 4, 8, 8), 1.5_f32);
		let output = Array4::<f32>::zeros((1, 4, 8, 8));
		for i in 0..3 {
			let out = scheduler.step(output.view(), i, sample.view(), &mut ZeroNoise).unwrap();
			assert_eq!(out.prev_sample(), sample.view());
			assert!(out.derivative().unwrap().iter().all(|&d| d == 0.0));
		}
	}

	#[test]
	fn test_reference_sigma_down_is_sigma_next() {
		let mut scheduler = scheduler(3);
		let sample = Array4::from_elem((1, 1, 2, 2), 1.0_f32);
		let output = Array4::from_elem((1, 1, 2, 2), 0.5_f32);
		let (sigma_from, sigma_to) = (scheduler.sigmas()[0], scheduler.sigmas()[1]);

		let out = scheduler.step(output.view(), 0, sample.view(), &mut ZeroNoise).unwrap();
		// derivative is exactly the model output under epsilon prediction
		let expected = (1.0 + 0.5 * (sigma_to - sigma_from)) as f32;
		assert!(out.prev_sample().iter().all(|&p| (p - expected).abs() < 1e-4));
	}

	#[test]
	fn test_corrected_variant_steps_further() {
		let config = SchedulerConfig {
			ancestral_variant: AncestralVariant::Corrected,
			..Default::default()
		};
		let mut corrected = EulerAncestralDiscreteScheduler::new(&config).unwrap();
		corrected.set_timesteps(3).unwrap();
		let mut reference = scheduler(3);

		let sample = Array4::from_elem((1, 1, 2, 2), 1.0_f32);
		let output = Array4::from_elem((1, 1, 2, 2), 0.5_f32);
		let a = corrected.step(output.view(), 0, sample.view(), &mut ZeroNoise).unwrap();
		let b = reference.step(output.view(), 0, sample.view(), &mut ZeroNoise).unwrap();
		assert!(a.prev_sample()[[0, 0, 0, 0]] < b.prev_sample()[[0, 0, 0, 0]]);
	}

	#[test]
	fn test_seeded_ancestral_noise_is_reproducible() {
		let sample = Array4::from_elem((1, 4, 8, 8), 1.0_f32);
		let output = Array4::from_elem((1, 4, 8, 8), 0.1_f32);
		let run = || {
			let mut scheduler = scheduler(3);
			let mut noise = SeededNoise::new(99);
			scheduler.step(output.view(), 0, sample.view(), &mut noise).unwrap().into_prev_sample()
		};
		assert_eq!(run(), run());
	}

	#[test]
	fn test_shape_mismatch() {
		let mut scheduler = scheduler(3);
		let sample = Array4::<f32>::zeros((1, 4, 8, 8));
		let output = Array4::<f32>::zeros((1, 4, 4, 4));
		assert!(matches!(
			scheduler.step(output.view(), 0, sample.view(), &mut ZeroNoise),
			Err(DiffusionError::ShapeMismatch { .. })
		));
	}

	#[test]
	fn test_sample_prediction_rejected() {
		let config = SchedulerConfig {
			prediction_type: PredictionType::Sample,
			..Default::default()
		};
		assert!(matches!(EulerAncestralDiscreteScheduler::new(&config), Err(DiffusionError::Configuration(_))));
	}
}
