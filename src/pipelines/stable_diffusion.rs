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

use std::{path::PathBuf, sync::Arc};

use image::RgbImage;
use ndarray::{Array3, Array4, ArrayView4};
use ort::Environment;

use super::{from_rgb_image, to_rgb_image, DenoiseOptions, Denoiser, LatentDecoder, LatentEncoder, TextEncoder};
use crate::{
	clip,
	config::{DiffusionConfig, SchedulerKind},
	error::DiffusionError,
	onnx::{DiffusionDeviceControl, OnnxTextEncoder, OnnxUNet, OnnxVaeDecoder, OnnxVaeEncoder},
	schedulers::DiffusionScheduler
};

/// Ratio between pixel and latent resolution of the Stable Diffusion VAE.
const VAE_SCALE_FACTOR: usize = 8;

/// A [Stable Diffusion](https://github.com/CompVis/stable-diffusion) text-to-image and image-to-image pipeline.
///
/// ```ignore
/// use onnx_sd_sampler::{DiffusionDeviceControl, OrtEnvironment, StableDiffusionPipeline};
///
/// let environment = OrtEnvironment::default().into_arc();
/// let pipeline = StableDiffusionPipeline::from_root(&environment, "./stable-diffusion-v1-5/", DiffusionDeviceControl::default())?;
/// let image = pipeline.txt2img(&[320, 2368, 530, 518, 1573], None)?;
/// image.save("result.png")?;
/// ```
pub struct StableDiffusionPipeline<T = OnnxTextEncoder, U = OnnxUNet, V = OnnxVaeDecoder, E = OnnxVaeEncoder> {
	config: DiffusionConfig,
	text_encoder: T,
	unet: U,
	vae_decoder: V,
	vae_encoder: Option<E>
}

impl StableDiffusionPipeline {
	/// Name of the JSON configuration file read by [`StableDiffusionPipeline::from_root`].
	pub const CONFIG_FILE: &'static str = "diffusion.json";

	/// Creates a new Stable Diffusion pipeline, loading models from `root` at the paths given in `config`.
	///
	/// The VAE encoder is optional; if its model file does not exist, the pipeline only supports text-to-image.
	pub fn new(environment: &Arc<Environment>, root: impl Into<PathBuf>, config: DiffusionConfig, devices: DiffusionDeviceControl) -> anyhow::Result<Self> {
		let root: PathBuf = root.into();
		config.scheduler.validate()?;

		let text_encoder = OnnxTextEncoder::new(environment, &devices.text_encoder, root.join(&config.models.text_encoder))?;
		let unet = OnnxUNet::new(environment, &devices.unet, root.join(&config.models.unet))?;
		let vae_decoder = OnnxVaeDecoder::new(environment, &devices.vae_decoder, root.join(&config.models.vae_decoder), config.vae.decode_scale_strength)?;
		let vae_encoder_path = root.join(&config.models.vae_encoder);
		let vae_encoder = if vae_encoder_path.exists() {
			Some(OnnxVaeEncoder::new(environment, &devices.vae_encoder, vae_encoder_path, config.vae.decode_scale_strength)?)
		} else {
			tracing::info!(path = %vae_encoder_path.display(), "no vae encoder found, img2img is disabled");
			None
		};
		tracing::info!(root = %root.display(), "loaded stable diffusion models");

		let pipeline = Self::from_parts(config, text_encoder, unet, vae_decoder);
		Ok(match vae_encoder {
			Some(encoder) => pipeline.with_vae_encoder(encoder),
			None => pipeline
		})
	}

	/// Creates a new Stable Diffusion pipeline configured by `root`/[`diffusion.json`](Self::CONFIG_FILE).
	pub fn from_root(environment: &Arc<Environment>, root: impl Into<PathBuf>, devices: DiffusionDeviceControl) -> anyhow::Result<Self> {
		let root: PathBuf = root.into();
		let config = DiffusionConfig::from_file(root.join(Self::CONFIG_FILE))?;
		Self::new(environment, root, config, devices)
	}
}

impl<T, U, V, E> StableDiffusionPipeline<T, U, V, E>
where
	T: TextEncoder,
	U: Denoiser,
	V: LatentDecoder,
	E: LatentEncoder
{
	/// Assembles a text-to-image pipeline from already-loaded models.
	pub fn from_parts(config: DiffusionConfig, text_encoder: T, unet: U, vae_decoder: V) -> Self {
		Self {
			config,
			text_encoder,
			unet,
			vae_decoder,
			vae_encoder: None
		}
	}

	/// Adds a VAE encoder, enabling [`StableDiffusionPipeline::img2img`].
	pub fn with_vae_encoder(mut self, vae_encoder: E) -> Self {
		self.vae_encoder = Some(vae_encoder);
		self
	}

	/// The configuration this pipeline runs with.
	pub fn config(&self) -> &DiffusionConfig {
		&self.config
	}

	/// Generates an image from an already-tokenized prompt.
	///
	/// `negative_tokens` defaults to the empty prompt. Use [`StableDiffusionPipeline::txt2img_with`] to tweak the
	/// denoising options.
	pub fn txt2img(&self, positive_tokens: &[i32], negative_tokens: Option<&[i32]>) -> anyhow::Result<RgbImage> {
		let options = DenoiseOptions::from_config(&self.config.unet, &self.config.scheduler);
		self.txt2img_with(positive_tokens, negative_tokens, &options)
	}

	/// Generates an image from an already-tokenized prompt with the given denoising options.
	pub fn txt2img_with(&self, positive_tokens: &[i32], negative_tokens: Option<&[i32]>, options: &DenoiseOptions) -> anyhow::Result<RgbImage> {
		let latents = self.txt2latents(positive_tokens, negative_tokens, options)?;
		self.decode(latents.view())
	}

	/// Runs the text encoder and denoising loop, returning the final latent without decoding it.
	pub fn txt2latents(&self, positive_tokens: &[i32], negative_tokens: Option<&[i32]>, options: &DenoiseOptions) -> anyhow::Result<Array4<f32>> {
		self.generate(positive_tokens, negative_tokens, options, None)
	}

	/// Generates an image starting from `image` instead of pure noise.
	///
	/// The image is resized to the configured latent size times 8, encoded by the VAE encoder, and the resulting latent
	/// has the initial noise added to it before denoising.
	pub fn img2img(&self, image: &RgbImage, positive_tokens: &[i32], negative_tokens: Option<&[i32]>) -> anyhow::Result<RgbImage> {
		let options = DenoiseOptions::from_config(&self.config.unet, &self.config.scheduler);
		self.img2img_with(image, positive_tokens, negative_tokens, &options)
	}

	/// [`StableDiffusionPipeline::img2img`] with the given denoising options.
	pub fn img2img_with(&self, image: &RgbImage, positive_tokens: &[i32], negative_tokens: Option<&[i32]>, options: &DenoiseOptions) -> anyhow::Result<RgbImage> {
		let latents = self.img2latents(image, positive_tokens, negative_tokens, options)?;
		self.decode(latents.view())
	}

	/// Encodes `image` and runs the denoising loop from it, returning the final latent without decoding it.
	///
	/// # Errors
	/// Returns [`DiffusionError::Configuration`] if the pipeline has no VAE encoder.
	pub fn img2latents(&self, image: &RgbImage, positive_tokens: &[i32], negative_tokens: Option<&[i32]>, options: &DenoiseOptions) -> anyhow::Result<Array4<f32>> {
		let vae_encoder = self
			.vae_encoder
			.as_ref()
			.ok_or_else(|| DiffusionError::configuration("img2img requires a vae encoder"))?;
		let (_, _, height, width) = options.latent_shape;
		let pixels = from_rgb_image(image, (width * VAE_SCALE_FACTOR) as u32, (height * VAE_SCALE_FACTOR) as u32);
		let encoded = vae_encoder.encode(pixels.view())?;
		tracing::debug!(shape = ?encoded.shape(), "encoded reference image");
		self.generate(positive_tokens, negative_tokens, options, Some(encoded.view()))
	}

	fn generate(
		&self,
		positive_tokens: &[i32],
		negative_tokens: Option<&[i32]>,
		options: &DenoiseOptions,
		initial_latent: Option<ArrayView4<'_, f32>>
	) -> anyhow::Result<Array4<f32>> {
		let positive = self.text_encoder.encode(clip::pad_tokens(positive_tokens)?.view())?;
		// the unconditional prediction is only needed for guidance
		let negative = if options.guidance_scale > 1.0 {
			Some(match negative_tokens {
				Some(tokens) => self.text_encoder.encode(clip::pad_tokens(tokens)?.view())?,
				None => self.text_encoder.encode(clip::unconditional_tokens().view())?
			})
		} else {
			None
		};
		let negative = negative.as_ref();
		let scheduler = &self.config.scheduler;

		#[allow(unreachable_patterns)]
		let latents = match self.config.scheduler_kind {
			#[cfg(feature = "scheduler-euler-ancestral")]
			SchedulerKind::EulerAncestral => {
				let mut scheduler = crate::schedulers::EulerAncestralDiscreteScheduler::new(scheduler)?;
				self.denoise(&mut scheduler, options, &positive, negative, initial_latent)?
			}
			#[cfg(feature = "scheduler-euler")]
			SchedulerKind::Euler => {
				let mut scheduler = crate::schedulers::EulerDiscreteScheduler::new(scheduler)?;
				self.denoise(&mut scheduler, options, &positive, negative, initial_latent)?
			}
			#[cfg(feature = "scheduler-ddim")]
			SchedulerKind::Ddim => {
				let mut scheduler = crate::schedulers::DDIMDiscreteScheduler::new(scheduler)?;
				self.denoise(&mut scheduler, options, &positive, negative, initial_latent)?
			}
			#[cfg(feature = "scheduler-ddpm")]
			SchedulerKind::Ddpm => {
				let mut scheduler = crate::schedulers::DDPMDiscreteScheduler::new(scheduler)?;
				self.denoise(&mut scheduler, options, &positive, negative, initial_latent)?
			}
			#[cfg(feature = "scheduler-heun")]
			SchedulerKind::Heun => {
				let mut scheduler = crate::schedulers::HeunDiscreteScheduler::new(scheduler)?;
				self.denoise(&mut scheduler, options, &positive, negative, initial_latent)?
			}
			#[cfg(feature = "scheduler-lms")]
			SchedulerKind::Lms => {
				let mut scheduler = crate::schedulers::LMSDiscreteScheduler::new(scheduler)?;
				self.denoise(&mut scheduler, options, &positive, negative, initial_latent)?
			}
			kind => return Err(DiffusionError::configuration(format!("scheduler {kind:?} is not enabled in this build")).into())
		};
		Ok(latents)
	}

	fn denoise<S: DiffusionScheduler>(
		&self,
		scheduler: &mut S,
		options: &DenoiseOptions,
		positive: &Array3<f32>,
		negative: Option<&Array3<f32>>,
		initial_latent: Option<ArrayView4<'_, f32>>
	) -> anyhow::Result<Array4<f32>> {
		Ok(options.run(&self.unet, scheduler, Some(positive.view()), negative.map(|n| n.view()), initial_latent)?)
	}

	fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<RgbImage> {
		let pixels = self.vae_decoder.decode(latents)?;
		to_rgb_image(pixels.view())
	}
}

#[cfg(test)]
mod tests {
	use std::cell::Cell;

	use ndarray::{Array3, Array4, ArrayView2, ArrayView3, ArrayView4};

	use super::*;
	use crate::config::UNetConfig;

	#[derive(Default)]
	struct FakeEncoder {
		calls: Cell<usize>
	}

	impl TextEncoder for FakeEncoder {
		fn encode(&self, token_ids: ArrayView2<'_, i32>) -> anyhow::Result<Array3<f32>> {
			assert_eq!(token_ids.shape(), &[1, clip::MODEL_MAX_LENGTH]);
			self.calls.set(self.calls.get() + 1);
			Ok(Array3::from_elem((1, clip::MODEL_MAX_LENGTH, 8), token_ids[[0, 1]] as f32 / 49407.0))
		}
	}

	struct FakeUNet;

	impl Denoiser for FakeUNet {
		fn predict(&self, sample: ArrayView4<'_, f32>, _: i64, conditioning: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>> {
			Ok(&sample * 0.1 + conditioning[[0, 0, 0]])
		}
	}

	struct ZeroUNet;

	impl Denoiser for ZeroUNet {
		fn predict(&self, sample: ArrayView4<'_, f32>, _: i64, _: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>> {
			Ok(Array4::zeros(sample.raw_dim()))
		}
	}

	struct FakeDecoder;

	impl LatentDecoder for FakeDecoder {
		fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
			let (_, _, h, w) = latents.dim();
			Ok(Array4::from_elem((1, 3, h * 8, w * 8), 0.5))
		}
	}

	/// Averages each channel of the image into a constant latent channel.
	struct FakeVaeEncoder;

	impl LatentEncoder for FakeVaeEncoder {
		fn encode(&self, pixels: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
			let (_, channels, h, w) = pixels.dim();
			assert_eq!(channels, 3);
			let mean = pixels.mean().unwrap_or_default();
			Ok(Array4::from_elem((1, 4, h / 8, w / 8), mean))
		}
	}

	fn config(kind: SchedulerKind) -> DiffusionConfig {
		let mut config = DiffusionConfig {
			scheduler_kind: kind,
			unet: UNetConfig {
				width: 4,
				height: 4,
				inference_steps: 4,
				..Default::default()
			},
			..Default::default()
		};
		config.scheduler.ancestral_noise = crate::util::random::AncestralNoise::Seeded(1);
		config
	}

	fn pipeline(kind: SchedulerKind) -> StableDiffusionPipeline<FakeEncoder, FakeUNet, FakeDecoder, FakeVaeEncoder> {
		StableDiffusionPipeline::from_parts(config(kind), FakeEncoder::default(), FakeUNet, FakeDecoder).with_vae_encoder(FakeVaeEncoder)
	}

	#[test]
	fn test_txt2img_size() {
		let image = pipeline(SchedulerKind::EulerAncestral).txt2img(&[320, 2368], None).unwrap();
		assert_eq!(image.dimensions(), (32, 32));
		assert!(image.pixels().all(|p| p.0 == [128, 128, 128]));
	}

	#[test]
	#[cfg(feature = "common-schedulers")]
	fn test_txt2latents_is_reproducible_when_seeded() {
		for kind in [
			SchedulerKind::EulerAncestral,
			SchedulerKind::Euler,
			SchedulerKind::Ddim,
			SchedulerKind::Ddpm,
			SchedulerKind::Heun
		] {
			let pipeline = pipeline(kind);
			let options = DenoiseOptions::from_config(&pipeline.config().unet, &pipeline.config().scheduler);
			let a = pipeline.txt2latents(&[320], Some(&[2368][..]), &options).unwrap();
			let b = pipeline.txt2latents(&[320], Some(&[2368][..]), &options).unwrap();
			assert_eq!(a, b, "{kind:?}");
			assert_eq!(a.shape(), &[1, 4, 4, 4]);
			assert!(a.iter().all(|v| v.is_finite()), "{kind:?}");
		}
	}

	#[test]
	#[cfg(not(feature = "scheduler-lms"))]
	fn test_disabled_scheduler_is_rejected() {
		let pipeline = pipeline(SchedulerKind::Lms);
		let options = DenoiseOptions::from_config(&pipeline.config().unet, &pipeline.config().scheduler);
		let err = pipeline.txt2latents(&[320], None, &options).unwrap_err();
		assert!(matches!(err.downcast_ref::<DiffusionError>(), Some(DiffusionError::Configuration(_))));
	}

	#[test]
	fn test_negative_prompt_skipped_without_guidance() {
		let pipeline = pipeline(SchedulerKind::Euler);
		let options = DenoiseOptions::from_config(&pipeline.config().unet, &pipeline.config().scheduler);

		pipeline.txt2latents(&[320], Some(&[2368][..]), &options.with_guidance_scale(1.0)).unwrap();
		assert_eq!(pipeline.text_encoder.calls.get(), 1);

		let options = DenoiseOptions::from_config(&pipeline.config().unet, &pipeline.config().scheduler);
		pipeline.txt2latents(&[320], None, &options.with_guidance_scale(7.5)).unwrap();
		assert_eq!(pipeline.text_encoder.calls.get(), 3);
	}

	#[test]
	fn test_img2latents_starts_from_encoded_image() {
		let pipeline =
			StableDiffusionPipeline::from_parts(config(SchedulerKind::Euler), FakeEncoder::default(), ZeroUNet, FakeDecoder).with_vae_encoder(FakeVaeEncoder);
		let options = DenoiseOptions::from_config(&pipeline.config().unet, &pipeline.config().scheduler);
		let image = RgbImage::from_pixel(32, 32, image::Rgb([255, 255, 255]));

		// a zero prediction makes every euler step the identity, leaving encoded image + initial noise
		let from_noise = pipeline.txt2latents(&[320], None, &options).unwrap();
		let from_image = pipeline.img2latents(&image, &[320], None, &options).unwrap();
		for (noise, started) in from_noise.iter().zip(from_image.iter()) {
			assert!((started - noise - 1.0).abs() < 1e-4);
		}
		assert_eq!(pipeline.img2img(&image, &[320], None).unwrap().dimensions(), (32, 32));
	}

	#[test]
	fn test_img2img_requires_encoder() {
		let pipeline: StableDiffusionPipeline<_, _, _, FakeVaeEncoder> =
			StableDiffusionPipeline::from_parts(config(SchedulerKind::Euler), FakeEncoder::default(), FakeUNet, FakeDecoder);
		let image = RgbImage::new(32, 32);
		let err = pipeline.img2img(&image, &[320], None).unwrap_err();
		assert!(matches!(err.downcast_ref::<DiffusionError>(), Some(DiffusionError::Configuration(_))));
	}

	#[test]
	fn test_prompt_too_long() {
		assert!(pipeline(SchedulerKind::Euler).txt2img(&[1; 100], None).is_err());
	}
}
