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

use ndarray::{Array4, ArrayView3, ArrayView4, Zip};

use super::{DenoiseCallback, Denoiser};
use crate::{
	config::{SchedulerConfig, UNetConfig},
	error::{DiffusionError, Result},
	schedulers::DiffusionScheduler,
	util::random::{AncestralNoise, NoiseSource}
};

/// Options for the denoising loop, which turns noise into a clean latent by repeatedly running a [`Denoiser`] and
/// stepping a [`DiffusionScheduler`].
#[derive(Debug)]
pub struct DenoiseOptions {
	/// `(batch, channels, height, width)` of the latent. Batch must be 1.
	pub latent_shape: (usize, usize, usize, usize),
	/// Classifier-free guidance scale. Guidance is only applied when this is greater than 1.
	pub guidance_scale: f32,
	/// The number of inference steps.
	pub steps: usize,
	/// Source of the noise re-injected by ancestral schedulers.
	pub ancestral_noise: AncestralNoise,
	/// Called after each step; see [`DenoiseCallback`].
	pub callback: Option<DenoiseCallback>
}

impl Default for DenoiseOptions {
	fn default() -> Self {
		Self::from_config(&UNetConfig::default(), &SchedulerConfig::default())
	}
}

// builder for options
impl DenoiseOptions {
	/// Creates options matching a UNet and scheduler configuration.
	pub fn from_config(unet: &UNetConfig, scheduler: &SchedulerConfig) -> Self {
		Self {
			latent_shape: unet.latent_shape(),
			guidance_scale: unet.guidance_scale,
			steps: unet.inference_steps,
			ancestral_noise: scheduler.ancestral_noise,
			callback: None
		}
	}
	/// The number of steps to take to generate the latent. More steps typically yields higher quality images.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps;
		self
	}
	/// The 'guidance scale' for classifier-free guidance. A lower guidance scale gives the model more freedom, but the
	/// output may not match the prompt. A higher guidance scale mean the model will match the prompt(s) more strictly,
	/// but may introduce artifacts; `7.5` is a good balance. Scales of `1` or less disable guidance.
	pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
		self.guidance_scale = guidance_scale;
		self
	}
	/// Set the latent size.
	pub fn with_latent_size(mut self, channels: usize, height: usize, width: usize) -> Self {
		self.latent_shape = (1, channels, height, width);
		self
	}
	/// Seed the ancestral noise too, so that each run with the same seed generates the same image.
	pub fn with_ancestral_seed(mut self, seed: u64) -> Self {
		self.ancestral_noise = AncestralNoise::Seeded(seed);
		self
	}
}

// builder for callbacks
impl DenoiseOptions {
	/// Calls `callback(step, timestep)` every `frequency` steps.
	pub fn callback_progress<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, f32) -> bool + 'static
	{
		self.callback = Some(DenoiseCallback::Progress { frequency, cb: Box::new(callback) });
		self
	}
	/// Calls `callback(step, timestep, latents)` every `frequency` steps.
	pub fn callback_latents<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, f32, ArrayView4<'_, f32>) -> bool + 'static
	{
		self.callback = Some(DenoiseCallback::Latents { frequency, cb: Box::new(callback) });
		self
	}
}

impl DenoiseOptions {
	/// Runs the denoising loop.
	///
	/// - `positive` is the prompt conditioning; it is required.
	/// - `negative` is the unconditional (or negative prompt) conditioning; it is required when `guidance_scale > 1`.
	/// - `initial_latent` is added to the initial noise; zeros are used if it is `None`.
	///
	/// Empty conditioning arrays are treated as absent.
	///
	/// # Errors
	/// - [`DiffusionError::Configuration`] if a required conditioning is missing or the scheduler rejects `steps`
	/// - [`DiffusionError::ShapeMismatch`] if `initial_latent` or a model output does not match `latent_shape`
	/// - [`DiffusionError::Network`] if the denoiser fails
	///
	/// Errors abort the whole generation; no partial latent is returned.
	pub fn run<S, D>(
		&self,
		unet: &D,
		scheduler: &mut S,
		positive: Option<ArrayView3<'_, f32>>,
		negative: Option<ArrayView3<'_, f32>>,
		initial_latent: Option<ArrayView4<'_, f32>>
	) -> Result<Array4<f32>>
	where
		S: DiffusionScheduler,
		D: Denoiser + ?Sized
	{
		let mut noise = self.ancestral_noise.source();
		self.run_with_noise(unet, scheduler, positive, negative, initial_latent, noise.as_mut())
	}

	/// Like [`DenoiseOptions::run`], but draws ancestral noise from `noise` instead of
	/// [`DenoiseOptions::ancestral_noise`].
	pub fn run_with_noise<S, D, N>(
		&self,
		unet: &D,
		scheduler: &mut S,
		positive: Option<ArrayView3<'_, f32>>,
		negative: Option<ArrayView3<'_, f32>>,
		initial_latent: Option<ArrayView4<'_, f32>>,
		noise: &mut N
	) -> Result<Array4<f32>>
	where
		S: DiffusionScheduler,
		D: Denoiser + ?Sized,
		N: NoiseSource + ?Sized
	{
		let positive = positive
			.filter(|c| !c.is_empty())
			.ok_or_else(|| DiffusionError::configuration("positive conditioning is required"))?;
		let negative = negative.filter(|c| !c.is_empty());
		let do_classifier_free_guidance = self.guidance_scale > 1.0;
		if do_classifier_free_guidance && negative.is_none() {
			return Err(DiffusionError::configuration(format!(
				"guidance scale {} requires negative conditioning",
				self.guidance_scale
			)));
		}

		let shape = self.latent_shape;
		if shape.0 != 1 {
			return Err(DiffusionError::configuration(format!("batch size {} is not supported, must be 1", shape.0)));
		}

		let _span = tracing::info_span!("denoise", steps = self.steps, guidance_scale = self.guidance_scale).entered();

		scheduler.set_timesteps(self.steps)?;

		let mut latents = match initial_latent {
			Some(latent) => {
				DiffusionError::check_shape(&[shape.0, shape.1, shape.2, shape.3], latent.shape())?;
				latent.to_owned()
			}
			None => Array4::zeros(shape)
		};
		latents = latents + scheduler.initial_noise(shape);

		let timesteps = scheduler.timesteps().to_owned();
		let last_step = timesteps.len().saturating_sub(1);

		for (i, t) in timesteps.indexed_iter() {
			let latent_model_input = scheduler.scale_model_input(latents.view(), i)?;
			let timestep = scheduler.timestep(i)?;

			let noise_pred_text = predict(unet, latent_model_input.view(), timestep, positive)?;
			let noise_pred_uncond = negative
				.map(|negative| predict(unet, latent_model_input.view(), timestep, negative))
				.transpose()?;

			let noise_pred = match noise_pred_uncond {
				Some(uncond) if do_classifier_free_guidance => guide(&noise_pred_text, &uncond, self.guidance_scale),
				_ => noise_pred_text
			};

			latents = scheduler.step(noise_pred.view(), i, latents.view(), noise)?.into_prev_sample();
			tracing::debug!(step = i, timestep, "denoised");

			if let Some(callback) = self.callback.as_ref() {
				let due = |frequency: usize| i == last_step || i % frequency.max(1) == 0;
				let t = *t as f32;
				let keep_going = match callback {
					DenoiseCallback::Progress { frequency, cb } if due(*frequency) => cb(i, t),
					DenoiseCallback::Latents { frequency, cb } if due(*frequency) => cb(i, t, latents.view()),
					_ => true
				};
				if !keep_going {
					tracing::info!(step = i, "denoising stopped by callback");
					break;
				}
			}
		}

		Ok(latents)
	}
}

fn predict<D: Denoiser + ?Sized>(unet: &D, sample: ArrayView4<'_, f32>, timestep: i64, conditioning: ArrayView3<'_, f32>) -> Result<Array4<f32>> {
	let output = unet.predict(sample, timestep, conditioning).map_err(DiffusionError::Network)?;
	DiffusionError::check_shape(sample.shape(), output.shape())?;
	Ok(output)
}

/// `positive * scale + negative * (1 - scale)`; with `scale > 1` this extrapolates away from `negative`.
pub(crate) fn guide(positive: &Array4<f32>, negative: &Array4<f32>, scale: f32) -> Array4<f32> {
	let mut guided = Array4::<f32>::zeros(positive.raw_dim());
	Zip::from(&mut guided).and(positive).and(negative).par_for_each(|g, &p, &n| {
		*g = p * scale + n * (1.0 - scale);
	});
	guided
}

#[cfg(test)]
mod tests {
	use std::cell::{Cell, RefCell};

	use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Ix4};

	use super::*;
	use crate::{
		schedulers::{EulerAncestralDiscreteScheduler, SchedulerOptimizedDefaults},
		util::random::NoiseSource
	};

	/// Returns the conditioning's first element as a constant prediction, and records every call.
	struct ConstantUNet {
		calls: RefCell<Vec<(i64, f32)>>
	}

	impl ConstantUNet {
		fn new() -> Self {
			Self { calls: RefCell::new(Vec::new()) }
		}
	}

	impl Denoiser for ConstantUNet {
		fn predict(&self, sample: ArrayView4<'_, f32>, timestep: i64, conditioning: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>> {
			let value = conditioning[[0, 0, 0]];
			self.calls.borrow_mut().push((timestep, value));
			Ok(Array4::from_elem(sample.raw_dim(), value))
		}
	}

	struct BrokenUNet;

	impl Denoiser for BrokenUNet {
		fn predict(&self, _: ArrayView4<'_, f32>, _: i64, _: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>> {
			anyhow::bail!("session exploded")
		}
	}

	struct WrongShapeUNet;

	impl Denoiser for WrongShapeUNet {
		fn predict(&self, _: ArrayView4<'_, f32>, _: i64, _: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>> {
			Ok(Array4::zeros((1, 4, 2, 2)))
		}
	}

	struct ZeroNoise;

	impl NoiseSource for ZeroNoise {
		fn standard_normal(&mut self, shape: Ix4) -> Array4<f32> {
			Array4::zeros(shape)
		}
	}

	fn conditioning(value: f32) -> Array3<f32> {
		Array3::from_elem((1, 77, 8), value)
	}

	fn options() -> DenoiseOptions {
		DenoiseOptions::default().with_latent_size(4, 8, 8).with_steps(3).with_ancestral_seed(3)
	}

	#[test]
	fn test_guidance_blend() {
		let positive = Array4::from_elem((1, 1, 1, 2), 2.0_f32);
		let negative = Array4::from_elem((1, 1, 1, 2), 1.0_f32);
		let guided = guide(&positive, &negative, 7.5);
		assert!(guided.iter().all(|&g| (g - (2.0 * 7.5 + 1.0 * -6.5)).abs() < 1e-6));
	}

	#[test]
	fn test_calls_network_per_conditioning() {
		let unet = ConstantUNet::new();
		let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		let (pos, neg) = (conditioning(0.5), conditioning(0.25));
		options()
			.with_guidance_scale(7.5)
			.run(&unet, &mut scheduler, Some(pos.view()), Some(neg.view()), None)
			.unwrap();
		let calls = unet.calls.borrow();
		assert_eq!(
			*calls,
			vec![(999, 0.5), (999, 0.25), (499, 0.5), (499, 0.25), (0, 0.5), (0, 0.25)]
		);
	}

	#[test]
	fn test_no_guidance_uses_positive_prediction() {
		// with guidance disabled, the negative prediction must not leak into the step
		let unet = ConstantUNet::new();
		let (pos, neg) = (conditioning(0.5), conditioning(-3.0));
		let run = |negative| {
			let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
			options().with_guidance_scale(1.0).run(&unet, &mut scheduler, Some(pos.view()), negative, None).unwrap()
		};
		assert_eq!(run(Some(neg.view())), run(None));
	}

	#[test]
	#[cfg(feature = "scheduler-euler")]
	fn test_guidance_below_one_steps_on_positive_prediction() {
		use crate::schedulers::EulerDiscreteScheduler;

		let unet = ConstantUNet::new();
		let (pos, neg) = (conditioning(0.5), conditioning(-3.0));
		let mut scheduler = EulerDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		let looped = options()
			.with_guidance_scale(0.5)
			.run_with_noise(&unet, &mut scheduler, Some(pos.view()), Some(neg.view()), None, &mut ZeroNoise)
			.unwrap();

		let mut scheduler = EulerDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		scheduler.set_timesteps(3).unwrap();
		let mut latents = Array4::<f32>::zeros((1, 4, 8, 8)) + scheduler.initial_noise((1, 4, 8, 8));
		let positive_only = Array4::from_elem((1, 4, 8, 8), 0.5_f32);
		for i in 0..3 {
			latents = scheduler.step(positive_only.view(), i, latents.view(), &mut ZeroNoise).unwrap().into_prev_sample();
		}
		assert_eq!(looped, latents);

		// a blend at 0.5 would have stepped on -1.25 instead
		let blended = guide(&positive_only, &Array4::from_elem((1, 4, 8, 8), -3.0_f32), 0.5);
		assert!(blended.iter().all(|&b| (b + 1.25).abs() < 1e-6));
		assert_eq!(unet.calls.borrow().len(), 6);
	}

	#[test]
	fn test_progress_reports_schedule_timesteps() {
		let unet = ConstantUNet::new();
		let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		let pos = conditioning(0.0);
		let timesteps = std::rc::Rc::new(RefCell::new(Vec::new()));
		let timesteps_cb = timesteps.clone();
		options()
			.with_guidance_scale(1.0)
			.callback_progress(1, move |_, t| {
				timesteps_cb.borrow_mut().push(t);
				true
			})
			.run_with_noise(&unet, &mut scheduler, Some(pos.view()), None, None, &mut ZeroNoise)
			.unwrap();
		assert_eq!(*timesteps.borrow(), vec![999.0, 499.5, 0.0]);
	}

	#[test]
	fn test_missing_conditioning() {
		let unet = ConstantUNet::new();
		let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		let pos = conditioning(0.5);
		let empty = Array3::<f32>::zeros((0, 0, 0));

		let result = options().run(&unet, &mut scheduler, Some(empty.view()), None, None);
		assert!(matches!(result, Err(DiffusionError::Configuration(_))));

		let result = options().with_guidance_scale(7.5).run(&unet, &mut scheduler, Some(pos.view()), None, None);
		assert!(matches!(result, Err(DiffusionError::Configuration(_))));
		assert!(unet.calls.borrow().is_empty());
	}

	#[test]
	fn test_network_failure_aborts() {
		let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		let pos = conditioning(0.5);
		let result = options().with_guidance_scale(1.0).run(&BrokenUNet, &mut scheduler, Some(pos.view()), None, None);
		match result {
			Err(DiffusionError::Network(e)) => assert!(e.to_string().contains("session exploded")),
			other => panic!("expected a network error, got {other:?}")
		}
	}

	#[test]
	fn test_network_shape_mismatch() {
		let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		let pos = conditioning(0.5);
		let result = options().with_guidance_scale(1.0).run(&WrongShapeUNet, &mut scheduler, Some(pos.view()), None, None);
		assert!(matches!(result, Err(DiffusionError::ShapeMismatch { .. })));
	}

	#[test]
	fn test_initial_latent_shape_checked() {
		let unet = ConstantUNet::new();
		let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		let pos = conditioning(0.5);
		let latent = Array4::<f32>::zeros((1, 4, 16, 16));
		let result = options().with_guidance_scale(1.0).run(&unet, &mut scheduler, Some(pos.view()), None, Some(latent.view()));
		assert!(matches!(result, Err(DiffusionError::ShapeMismatch { .. })));
	}

	#[test]
	fn test_callback_stops_early() {
		let unet = ConstantUNet::new();
		let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		let pos = conditioning(0.0);
		let seen = std::rc::Rc::new(Cell::new(0));
		let seen_cb = seen.clone();
		options()
			.with_guidance_scale(1.0)
			.callback_progress(1, move |step, _| {
				seen_cb.set(step + 1);
				step < 1
			})
			.run(&unet, &mut scheduler, Some(pos.view()), None, None)
			.unwrap();
		assert_eq!(seen.get(), 2);
		assert_eq!(unet.calls.borrow().len(), 2);
	}

	#[test]
	fn test_scheduler_matches_manual_loop() {
		let unet = ConstantUNet::new();
		let pos = conditioning(0.125);
		let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		let looped = options().with_guidance_scale(1.0).run(&unet, &mut scheduler, Some(pos.view()), None, None).unwrap();

		let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		scheduler.set_timesteps(3).unwrap();
		let mut latents = Array4::<f32>::zeros((1, 4, 8, 8)) + scheduler.initial_noise((1, 4, 8, 8));
		let mut noise = AncestralNoise::Seeded(3).source();
		for i in 0..3 {
			let output = Array4::from_elem((1, 4, 8, 8), 0.125_f32);
			latents = scheduler.step(output.view(), i, latents.view(), noise.as_mut()).unwrap().into_prev_sample();
		}
		assert_eq!(looped, latents);
	}

	#[test]
	fn test_latents_callback_reports_final_step() {
		let unet = ConstantUNet::new();
		let mut scheduler = EulerAncestralDiscreteScheduler::stable_diffusion_v1_optimized_default().unwrap();
		let pos = conditioning(0.0);
		let steps = std::rc::Rc::new(RefCell::new(Vec::new()));
		let steps_cb = steps.clone();
		let latents = options()
			.with_steps(5)
			.with_guidance_scale(1.0)
			.callback_latents(3, move |step, _, latents| {
				assert_eq!(latents.shape(), &[1, 4, 8, 8]);
				steps_cb.borrow_mut().push(step);
				true
			})
			.run_with_noise(&unet, &mut scheduler, Some(pos.view()), None, None, &mut ZeroNoise)
			.unwrap();
		assert_eq!(*steps.borrow(), vec![0, 3, 4]);
		assert!(latents.iter().all(|v| v.is_finite()));
	}
}
