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

//! [ONNX Runtime] implementations of the pipeline's model interfaces, and device placement for them.
//!
//! [ONNX Runtime]: https://onnxruntime.ai/

use std::{path::Path, sync::Arc};

use ndarray::{Array, Array1, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Dimension, IxDyn};
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor},
	Environment, ExecutionProvider, Session, SessionBuilder
};

use crate::pipelines::{Denoiser, LatentDecoder, LatentEncoder, TextEncoder};

/// The strategy to use for extending the device memory arena.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ArenaExtendStrategy {
	/// Subsequent memory allocations extend by larger amounts (multiplied by powers of two)
	#[default]
	PowerOfTwo,
	/// Memory allocations extend only by the requested amount.
	SameAsRequested
}

impl From<ArenaExtendStrategy> for String {
	fn from(val: ArenaExtendStrategy) -> Self {
		match val {
			ArenaExtendStrategy::PowerOfTwo => "kNextPowerOfTwo".to_string(),
			ArenaExtendStrategy::SameAsRequested => "kSameAsRequested".to_string()
		}
	}
}

/// Device options for the CUDA execution provider.
///
/// On low-VRAM devices, cap each session and grow the arena only as needed:
/// ```ignore
/// CUDADeviceOptions {
/// 	memory_limit: Some(3000000000),
/// 	arena_extend_strategy: Some(ArenaExtendStrategy::SameAsRequested)
/// }
/// ```
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CUDADeviceOptions {
	/// The strategy to use for extending the device memory arena. See [`ArenaExtendStrategy`] for more info.
	pub arena_extend_strategy: Option<ArenaExtendStrategy>,
	/// Per-session (aka per-model) memory limit. Models may use all available VRAM if a memory limit is not set.
	pub memory_limit: Option<usize>
}

impl From<CUDADeviceOptions> for ExecutionProvider {
	fn from(val: CUDADeviceOptions) -> Self {
		let mut ep = ExecutionProvider::cuda();
		if let Some(arena_extend_strategy) = val.arena_extend_strategy {
			ep = ep.with("arena_extend_strategy", arena_extend_strategy);
		}
		if let Some(memory_limit) = val.memory_limit {
			ep = ep.with("gpu_mem_limit", memory_limit.to_string());
		}
		ep
	}
}

/// A device to place a model on.
///
/// If a configured execution provider is not available, ONNX Runtime falls back to the CPU.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// Use the CPU as a device. **This is the default device unless another device is specified.**
	CPU,
	/// Use NVIDIA CUDA as a device. First value is the device ID, second value is additional execution provider
	/// parameters; see [`CUDADeviceOptions`].
	CUDA(usize, Option<CUDADeviceOptions>),
	/// Use NVIDIA TensorRT as a device.
	TensorRT,
	/// Custom execution provider w/ options.
	Custom(ExecutionProvider)
}

impl From<DiffusionDevice> for ExecutionProvider {
	fn from(value: DiffusionDevice) -> Self {
		match value {
			DiffusionDevice::CPU => ExecutionProvider::cpu(),
			DiffusionDevice::CUDA(device, options) => {
				let ep: ExecutionProvider = options.unwrap_or_default().into();
				ep.with("device_id", device.to_string())
			}
			DiffusionDevice::TensorRT => ExecutionProvider::tensorrt(),
			DiffusionDevice::Custom(ep) => ep
		}
	}
}

/// Select which device each model should be placed on.
///
/// On GPUs with little VRAM, it may be favorable to keep the text encoder and VAE decoder on the CPU and only place the
/// UNet on the GPU:
/// ```ignore
/// DiffusionDeviceControl {
/// 	unet: DiffusionDevice::CUDA(0, None),
/// 	..Default::default()
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DiffusionDeviceControl {
	/// The device on which to place the text encoder (CLIP).
	pub text_encoder: DiffusionDevice,
	/// The device on which to place the UNet.
	pub unet: DiffusionDevice,
	/// The device on which to place the variational autoencoder decoder.
	pub vae_decoder: DiffusionDevice,
	/// The device on which to place the variational autoencoder encoder, used for image-to-image.
	pub vae_encoder: DiffusionDevice
}

impl DiffusionDeviceControl {
	/// Constructs [`DiffusionDeviceControl`] with all models on the same device.
	///
	/// Note that a `memory_limit` set in [`CUDADeviceOptions`] applies **per session** (aka per model), NOT to the
	/// entire pipeline.
	pub fn all(device: DiffusionDevice) -> Self {
		Self {
			text_encoder: device.clone(),
			unet: device.clone(),
			vae_decoder: device.clone(),
			vae_encoder: device
		}
	}
}

impl Default for DiffusionDeviceControl {
	fn default() -> Self {
		DiffusionDeviceControl::all(DiffusionDevice::CPU)
	}
}

fn load_session(environment: &Arc<Environment>, device: &DiffusionDevice, path: &Path) -> anyhow::Result<Session> {
	tracing::debug!(path = %path.display(), ?device, "loading onnx session");
	Ok(SessionBuilder::new(environment)?
		.with_execution_providers([device.clone().into()])?
		.with_model_from_file(path)?)
}

fn extract<D: Dimension>(session: &Session, inputs: Vec<InputTensor>) -> anyhow::Result<Array<f32, D>> {
	let outputs = session.run(inputs)?;
	let output: OrtOwnedTensor<'_, f32, IxDyn> = outputs[0].try_extract()?;
	Ok(output.view().to_owned().into_dimensionality()?)
}

/// A UNet exported with inputs `sample`, `timestep` (int64 `[1]`), and `encoder_hidden_states`.
pub struct OnnxUNet {
	session: Session
}

impl OnnxUNet {
	/// Loads the UNet from an ONNX file.
	pub fn new(environment: &Arc<Environment>, device: &DiffusionDevice, path: impl AsRef<Path>) -> anyhow::Result<Self> {
		Ok(Self {
			session: load_session(environment, device, path.as_ref())?
		})
	}
}

impl Denoiser for OnnxUNet {
	fn predict(&self, sample: ArrayView4<'_, f32>, timestep: i64, conditioning: ArrayView3<'_, f32>) -> anyhow::Result<Array4<f32>> {
		extract(
			&self.session,
			vec![
				InputTensor::from_array(sample.to_owned().into_dyn()),
				InputTensor::from_array(Array1::from_elem(1, timestep).into_dyn()),
				InputTensor::from_array(conditioning.to_owned().into_dyn()),
			]
		)
	}
}

/// A CLIP text encoder taking `[1, 77]` int32 token IDs.
pub struct OnnxTextEncoder {
	session: Session
}

impl OnnxTextEncoder {
	/// Loads the text encoder from an ONNX file.
	pub fn new(environment: &Arc<Environment>, device: &DiffusionDevice, path: impl AsRef<Path>) -> anyhow::Result<Self> {
		Ok(Self {
			session: load_session(environment, device, path.as_ref())?
		})
	}
}

impl TextEncoder for OnnxTextEncoder {
	fn encode(&self, token_ids: ArrayView2<'_, i32>) -> anyhow::Result<Array3<f32>> {
		extract(&self.session, vec![InputTensor::from_array(token_ids.to_owned().into_dyn())])
	}
}

/// A VAE decoder. Latents are divided by `scale_strength` before decoding, and outputs are mapped from `[-1, 1]` to
/// `[0, 1]`.
pub struct OnnxVaeDecoder {
	session: Session,
	scale_strength: f32
}

impl OnnxVaeDecoder {
	/// Loads the decoder from an ONNX file.
	pub fn new(environment: &Arc<Environment>, device: &DiffusionDevice, path: impl AsRef<Path>, scale_strength: f32) -> anyhow::Result<Self> {
		if scale_strength <= 0.0 {
			anyhow::bail!("vae decode scale strength must be >0, got {scale_strength}");
		}
		Ok(Self {
			session: load_session(environment, device, path.as_ref())?,
			scale_strength
		})
	}
}

impl LatentDecoder for OnnxVaeDecoder {
	fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let latents = 1.0 / self.scale_strength * &latents;
		let image: Array4<f32> = extract(&self.session, vec![InputTensor::from_array(latents.into_dyn())])?;
		Ok(image / 2.0 + 0.5)
	}
}

/// A VAE encoder. Pixels are mapped from `[0, 1]` to `[-1, 1]` before encoding, and the resulting latents are
/// multiplied by `scale_strength`.
pub struct OnnxVaeEncoder {
	session: Session,
	scale_strength: f32
}

impl OnnxVaeEncoder {
	/// Loads the encoder from an ONNX file.
	pub fn new(environment: &Arc<Environment>, device: &DiffusionDevice, path: impl AsRef<Path>, scale_strength: f32) -> anyhow::Result<Self> {
		if scale_strength <= 0.0 {
			anyhow::bail!("vae scale strength must be >0, got {scale_strength}");
		}
		Ok(Self {
			session: load_session(environment, device, path.as_ref())?,
			scale_strength
		})
	}
}

impl LatentEncoder for OnnxVaeEncoder {
	fn encode(&self, pixels: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let pixels = &pixels * 2.0 - 1.0;
		let latents: Array4<f32> = extract(&self.session, vec![InputTensor::from_array(pixels.into_dyn())])?;
		Ok(latents * self.scale_strength)
	}
}
