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

//! Serializable configuration for schedulers and the denoising pipeline.

use std::{fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
	error::{DiffusionError, Result},
	schedulers::{AlphaTransform, AncestralVariant, BetaSchedule, PredictionType},
	util::random::AncestralNoise
};

/// Training-time hyperparameters a scheduler derives its noise schedule from.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerConfig {
	/// Number of diffusion steps the model was trained with. Must be at least 2.
	pub training_steps: usize,
	/// First beta of the training schedule.
	pub beta_start: f64,
	/// Last beta of the training schedule.
	pub beta_end: f64,
	/// How betas are spread between `beta_start` and `beta_end`.
	pub beta_schedule: BetaSchedule,
	/// The `alpha_bar` curve; only read by [`BetaSchedule::SquaredCosCapV2`].
	pub alpha_transform: AlphaTransform,
	/// What the denoising model predicts.
	pub prediction_type: PredictionType,
	/// Seed for the initial noise.
	pub seed: u64,
	/// Where the per-step ancestral noise comes from. Defaults to fresh entropy on every step.
	#[serde(default)]
	pub ancestral_noise: AncestralNoise,
	/// Which `sigma_down` formula the ancestral update uses.
	#[serde(default)]
	pub ancestral_variant: AncestralVariant,
	/// How much noise DDIM re-draws each step, from `0` (deterministic) to `1` (equivalent to DDPM).
	#[serde(default)]
	pub ddim_eta: f64,
	/// How many past derivatives the LMS scheduler combines.
	#[serde(default = "default_lms_order")]
	pub lms_order: usize
}

fn default_lms_order() -> usize {
	4
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			training_steps: 1000,
			beta_start: 0.00085,
			beta_end: 0.012,
			beta_schedule: BetaSchedule::ScaledLinear,
			alpha_transform: AlphaTransform::Cosine,
			prediction_type: PredictionType::Epsilon,
			seed: 42,
			ancestral_noise: AncestralNoise::default(),
			ancestral_variant: AncestralVariant::default(),
			ddim_eta: 0.0,
			lms_order: default_lms_order()
		}
	}
}

impl SchedulerConfig {
	/// Checks the configuration before any table is built.
	///
	/// # Errors
	/// Returns [`DiffusionError::Configuration`] if:
	/// - `training_steps` is less than 2
	/// - `beta_start` or `beta_end` is outside `(0, 1)`
	/// - `beta_start` is not strictly less than `beta_end`
	/// - `prediction_type` is [`PredictionType::Sample`], which is not implemented
	/// - `ddim_eta` is outside `[0, 1]`
	/// - `lms_order` is 0
	pub fn validate(&self) -> Result<()> {
		if self.training_steps < 2 {
			return Err(DiffusionError::configuration(format!("training_steps ({}) must be >= 2", self.training_steps)));
		}
		let in_unit_range = |beta: f64| beta > 0.0 && beta < 1.0;
		if !in_unit_range(self.beta_start) || !in_unit_range(self.beta_end) {
			return Err(DiffusionError::configuration(format!(
				"beta_start ({}) and beta_end ({}) must both lie in (0, 1)",
				self.beta_start, self.beta_end
			)));
		}
		if self.beta_start >= self.beta_end {
			return Err(DiffusionError::configuration(format!("beta_start ({}) must be < beta_end ({})", self.beta_start, self.beta_end)));
		}
		if self.prediction_type == PredictionType::Sample {
			return Err(DiffusionError::configuration("prediction type `sample` is not implemented"));
		}
		if !(0.0..=1.0).contains(&self.ddim_eta) {
			return Err(DiffusionError::configuration(format!("ddim_eta ({}) must lie in [0, 1]", self.ddim_eta)));
		}
		if self.lms_order == 0 {
			return Err(DiffusionError::configuration("lms_order must be >0"));
		}
		Ok(())
	}
}

/// Which update rule drives the denoising loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
	/// Euler steps with ancestral noise re-injection.
	#[default]
	EulerAncestral,
	/// Plain deterministic Euler steps.
	Euler,
	/// Denoising diffusion implicit models; see [`SchedulerConfig::ddim_eta`].
	Ddim,
	/// Denoising diffusion probabilistic models.
	Ddpm,
	/// Heun's second-order method; evaluates the model about twice per step.
	Heun,
	/// Linear multistep; see [`SchedulerConfig::lms_order`].
	Lms
}

/// Shape and guidance settings for the UNet denoising loop. Sizes are in latent space (1/8 of pixel size for SD).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UNetConfig {
	/// Latent width.
	pub width: usize,
	/// Latent height.
	pub height: usize,
	/// Latent channels.
	pub channels: usize,
	/// Classifier-free guidance scale. Guidance is only applied when this is greater than 1.
	pub guidance_scale: f32,
	/// Number of denoising steps.
	pub inference_steps: usize
}

impl Default for UNetConfig {
	fn default() -> Self {
		Self {
			width: 64,
			height: 64,
			channels: 4,
			guidance_scale: 7.5,
			inference_steps: 25
		}
	}
}

impl UNetConfig {
	/// The `(batch, channels, height, width)` shape of the latent this configuration produces.
	pub fn latent_shape(&self) -> (usize, usize, usize, usize) {
		(1, self.channels, self.height, self.width)
	}
}

/// Scaling between the VAE's latent space and the latents the UNet works on.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VAEConfig {
	/// Latents are multiplied by the reciprocal of this before decoding, and encoded images are multiplied by it.
	pub decode_scale_strength: f32
}

impl Default for VAEConfig {
	fn default() -> Self {
		Self { decode_scale_strength: 0.18215 }
	}
}

/// Paths to the ONNX models, relative to the model root.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModelPaths {
	/// The CLIP text encoder.
	pub text_encoder: String,
	/// The denoising UNet.
	pub unet: String,
	/// The VAE decoder, latents to pixels.
	pub vae_decoder: String,
	/// The VAE encoder, pixels to latents. Only loaded for image-to-image.
	#[serde(default = "default_vae_encoder")]
	pub vae_encoder: String
}

fn default_vae_encoder() -> String {
	"vae_encoder/model.onnx".to_string()
}

impl Default for ModelPaths {
	fn default() -> Self {
		Self {
			text_encoder: "text_encoder/model.onnx".to_string(),
			unet: "unet/model.onnx".to_string(),
			vae_decoder: "vae_decoder/model.onnx".to_string(),
			vae_encoder: default_vae_encoder()
		}
	}
}

/// Full configuration for a text-to-image run.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiffusionConfig {
	/// Which scheduler the pipeline steps latents with.
	#[serde(default)]
	pub scheduler_kind: SchedulerKind,
	/// The training schedule and sampler settings.
	pub scheduler: SchedulerConfig,
	/// Latent shape, guidance and step count.
	pub unet: UNetConfig,
	/// VAE latent scaling.
	#[serde(default)]
	pub vae: VAEConfig,
	/// Model locations relative to the model root.
	#[serde(default)]
	pub models: ModelPaths
}

impl DiffusionConfig {
	/// Reads a JSON configuration file.
	pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
		let path = path.as_ref();
		let contents = fs::read_to_string(path).with_context(|| format!("failed to read config from {}", path.display()))?;
		let config: DiffusionConfig = serde_json::from_str(&contents).with_context(|| format!("failed to parse config {}", path.display()))?;
		config.scheduler.validate()?;
		if config.unet.inference_steps == 0 {
			anyhow::bail!("unet.inference-steps must be >0");
		}
		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_is_valid() {
		assert!(SchedulerConfig::default().validate().is_ok());
	}

	#[test]
	fn test_rejects_bad_configs() {
		let bad = [
			SchedulerConfig { training_steps: 1, ..Default::default() },
			SchedulerConfig { beta_start: 0.02, beta_end: 0.01, ..Default::default() },
			SchedulerConfig { beta_end: 1.5, ..Default::default() },
			SchedulerConfig { prediction_type: PredictionType::Sample, ..Default::default() },
			SchedulerConfig { ddim_eta: 1.5, ..Default::default() },
			SchedulerConfig { lms_order: 0, ..Default::default() }
		];
		for config in bad {
			assert!(matches!(config.validate(), Err(DiffusionError::Configuration(_))), "{config:?} should be rejected");
		}
	}

	#[test]
	fn test_parse_json() {
		let config: DiffusionConfig = serde_json::from_str(
			r#"{
				"scheduler": {
					"training-steps": 1000,
					"beta-start": 0.00085,
					"beta-end": 0.012,
					"beta-schedule": "scaled-linear",
					"alpha-transform": "cosine",
					"prediction-type": "v-prediction",
					"seed": 15
				},
				"unet": { "width": 64, "height": 64, "channels": 4, "guidance-scale": 1.0, "inference-steps": 3 }
			}"#
		)
		.unwrap();
		assert_eq!(config.scheduler_kind, SchedulerKind::EulerAncestral);
		assert_eq!(config.scheduler.prediction_type, PredictionType::VPrediction);
		assert_eq!(config.scheduler.ancestral_noise, AncestralNoise::Ambient);
		assert_eq!(config.unet.latent_shape(), (1, 4, 64, 64));
		assert_eq!(config.vae.decode_scale_strength, 0.18215);
		assert_eq!(config.scheduler.lms_order, 4);
		assert_eq!(config.models.vae_encoder, "vae_encoder/model.onnx");
	}

	#[test]
	fn test_betas_parse_in_double_precision() {
		let config: SchedulerConfig = serde_json::from_str(
			r#"{
				"training-steps": 1000,
				"beta-start": 0.00085,
				"beta-end": 0.012,
				"beta-schedule": "linear",
				"alpha-transform": "exp",
				"prediction-type": "epsilon",
				"seed": 0,
				"ddim-eta": 0.5
			}"#
		)
		.unwrap();
		assert_eq!(config.beta_start, 0.00085_f64);
		assert_eq!(config.beta_end, 0.012_f64);
		assert_eq!(config.ddim_eta, 0.5);
	}

	#[test]
	fn test_scheduler_kind_names() {
		for (name, kind) in [
			("\"euler-ancestral\"", SchedulerKind::EulerAncestral),
			("\"euler\"", SchedulerKind::Euler),
			("\"ddim\"", SchedulerKind::Ddim),
			("\"ddpm\"", SchedulerKind::Ddpm),
			("\"heun\"", SchedulerKind::Heun),
			("\"lms\"", SchedulerKind::Lms)
		] {
			assert_eq!(serde_json::from_str::<SchedulerKind>(name).unwrap(), kind);
		}
	}
}
