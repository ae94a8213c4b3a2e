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

//! Usage: `txt2img <model dir> <comma-separated prompt token ids> [output.png]`
//!
//! The model directory must contain a `diffusion.json` configuration and the ONNX models it points to.

use std::{cell::RefCell, env};

use anyhow::Context;
use kdam::{tqdm, BarExt};
use onnx_sd_sampler::{DenoiseOptions, DiffusionDeviceControl, OrtEnvironment, StableDiffusionPipeline};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

	let mut args = env::args().skip(1);
	let root = args.next().context("expected a path to a model as the first argument")?;
	let tokens = args
		.next()
		.context("expected prompt token ids as the second argument")?
		.split(',')
		.map(|t| t.trim().parse::<i32>())
		.collect::<Result<Vec<_>, _>>()
		.context("prompt token ids must be integers")?;
	let output = args.next().unwrap_or_else(|| "result.png".to_string());

	let environment = OrtEnvironment::default().into_arc();
	let pipeline = StableDiffusionPipeline::from_root(&environment, &root, DiffusionDeviceControl::default())?;

	let config = pipeline.config();
	let steps = config.unet.inference_steps;
	let pb = RefCell::new(tqdm!(total = steps, desc = "generating"));
	let options = DenoiseOptions::from_config(&config.unet, &config.scheduler).callback_progress(1, move |step, _| {
		pb.borrow_mut().update_to(step + 1);
		true
	});

	let image = pipeline.txt2img_with(&tokens, None, &options)?;
	image.save(&output)?;
	tracing::info!(%output, "saved image");

	Ok(())
}
