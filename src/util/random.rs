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

//! Random sources used while sampling.
//!
//! Sampling uses randomness in two distinct roles:
//! - the **reproducible seed source**, a [`StdRng`] seeded from the scheduler config, which only ever produces the
//!   initial noise latent;
//! - the **ancestral noise source**, a [`NoiseSource`] that supplies the noise re-injected by ancestral steps.
//!
//! By default the ancestral source is [`AmbientNoise`], which draws from fresh OS entropy on every step, so two runs
//! with the same seed start from the same noise but do **not** produce the same image. Callers that need fully
//! reproducible generation should configure [`AncestralNoise::Seeded`].

use ndarray::{Array4, Ix4};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

/// A source of standard-normal noise for ancestral sampling steps.
pub trait NoiseSource {
	/// Draws a tensor of independent standard-normal values with the given shape.
	fn standard_normal(&mut self, shape: Ix4) -> Array4<f32>;
}

/// Draws every tensor from a freshly entropy-seeded generator. Not reproducible.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmbientNoise;

impl NoiseSource for AmbientNoise {
	fn standard_normal(&mut self, shape: Ix4) -> Array4<f32> {
		let mut rng = StdRng::from_entropy();
		Array4::random_using(shape, StandardNormal, &mut rng)
	}
}

/// Draws from a single seeded generator, so a whole generation can be replayed.
#[derive(Debug, Clone)]
pub struct SeededNoise(StdRng);

impl SeededNoise {
	/// Creates a noise source whose draws are fully determined by `seed`.
	pub fn new(seed: u64) -> Self {
		Self(StdRng::seed_from_u64(seed))
	}
}

impl NoiseSource for SeededNoise {
	fn standard_normal(&mut self, shape: Ix4) -> Array4<f32> {
		Array4::random_using(shape, StandardNormal, &mut self.0)
	}
}

/// Configures which [`NoiseSource`] the denoising loop uses for ancestral steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AncestralNoise {
	/// Fresh entropy on every step; see [`AmbientNoise`].
	#[default]
	Ambient,
	/// A dedicated generator seeded with the given value; see [`SeededNoise`].
	Seeded(u64)
}

impl AncestralNoise {
	/// Creates the noise source this setting describes.
	pub fn source(&self) -> Box<dyn NoiseSource> {
		match self {
			AncestralNoise::Ambient => Box::new(AmbientNoise),
			AncestralNoise::Seeded(seed) => Box::new(SeededNoise::new(*seed))
		}
	}
}
