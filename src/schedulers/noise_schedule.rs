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

//! Training-time noise tables and their discretization into inference steps.

use std::f64::consts::PI;

use ndarray::{Array1, ArrayView1};
use num_traits::ToPrimitive;

use super::{AlphaTransform, BetaSchedule};
use crate::{
	config::SchedulerConfig,
	error::{DiffusionError, Result},
	util::interpolation::LogLinearInterpolator
};

const SQUARED_COS_MAX_BETA: f64 = 0.999;

impl AlphaTransform {
	/// `alpha_bar(t)` for `t` in `[0, 1]`.
	fn alpha_bar(&self, t: f64) -> f64 {
		match self {
			AlphaTransform::Cosine => ((t + 0.008) / 1.008 * PI / 2.0).cos().powi(2),
			AlphaTransform::Exp => (t * -12.0).exp()
		}
	}
}

/// Per-training-step noise magnitudes, `sqrt((1 - alpha_cumprod) / alpha_cumprod)`.
///
/// Entry `i` is the sigma of training step `i`; values grow with the step index.
#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeAlphaTable {
	sigmas: Array1<f64>
}

impl CumulativeAlphaTable {
	/// Builds the table for `config` in a single pass.
	///
	/// # Errors
	/// Returns [`DiffusionError::Configuration`] if `config` does not pass [`SchedulerConfig::validate`].
	pub fn build(config: &SchedulerConfig) -> Result<Self> {
		config.validate()?;

		let n = config.training_steps;
		let (beta_start, beta_end) = (config.beta_start, config.beta_end);

		let betas: Array1<f64> = match config.beta_schedule {
			BetaSchedule::Linear => Array1::from_shape_fn(n, |i| beta_start + (beta_end - beta_start) * (i as f64 / (n - 1) as f64)),
			BetaSchedule::ScaledLinear => {
				let (start, end) = (beta_start.sqrt(), beta_end.sqrt());
				Array1::from_shape_fn(n, |i| (start + (end - start) * (i as f64 / (n - 1) as f64)).powi(2))
			}
			BetaSchedule::SquaredCosCapV2 => {
				let alpha = config.alpha_transform;
				Array1::from_shape_fn(n, |i| {
					let t1 = i as f64 / n as f64;
					let t2 = (i + 1) as f64 / n as f64;
					(1.0 - alpha.alpha_bar(t2) / alpha.alpha_bar(t1)).min(SQUARED_COS_MAX_BETA)
				})
			}
		};

		let sigmas = betas
			.iter()
			.scan(1.0, |prod: &mut f64, beta| {
				*prod *= 1.0 - *beta;
				Some(((1.0 - *prod) / *prod).sqrt())
			})
			.collect::<Array1<f64>>();

		tracing::trace!(training_steps = n, first = sigmas[0], last = sigmas[n - 1], "built cumulative alpha table");

		Ok(Self { sigmas })
	}

	/// The sigma of every training step, in ascending order.
	pub fn view(&self) -> ArrayView1<'_, f64> {
		self.sigmas.view()
	}

	/// Number of training steps.
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.sigmas.len()
	}
}

/// Timesteps and sigmas for a fixed number of inference steps.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceSchedule {
	timesteps: Array1<f64>,
	sigmas: Array1<f64>,
	max_sigma: f64
}

impl InferenceSchedule {
	/// A schedule with no steps; every indexed lookup on it is out of range.
	pub(crate) fn empty() -> Self {
		Self {
			timesteps: Array1::zeros(0),
			sigmas: Array1::zeros(1),
			max_sigma: 0.0
		}
	}

	/// Picks `inference_steps` evenly spaced, descending (possibly fractional) training timesteps from `table`, and
	/// their sigmas interpolated in log space. A terminal sigma of `0` is appended.
	///
	/// # Errors
	/// Returns [`DiffusionError::Configuration`] if `inference_steps` is 0.
	pub fn discretize(table: &CumulativeAlphaTable, inference_steps: usize) -> Result<Self> {
		if inference_steps == 0 {
			return Err(DiffusionError::configuration("inference_steps must be >0"));
		}

		let end = (table.len() - 1) as f64;
		let gap = if inference_steps > 1 { end / (inference_steps - 1) as f64 } else { end };

		let interpolator = LogLinearInterpolator::new(table.view());
		let mut timesteps = Array1::zeros(inference_steps);
		let mut sigmas = Array1::zeros(inference_steps + 1);
		let mut max_sigma = 0.0_f64;
		for i in 0..inference_steps {
			// last step can land a hair below zero for some step counts
			let t = (end - gap * i as f64).max(0.0);
			let sigma = interpolator
				.eval(t)
				.ok_or_else(|| DiffusionError::configuration(format!("timestep {t} falls outside the training schedule")))?;
			timesteps[i] = t;
			sigmas[i] = sigma;
			max_sigma = max_sigma.max(sigma);
		}
		sigmas[inference_steps] = 0.0;

		tracing::trace!(inference_steps, max_sigma, ?timesteps, ?sigmas, "discretized schedule");

		Ok(Self { timesteps, sigmas, max_sigma })
	}

	/// The (possibly fractional) training timestep of each inference step, in descending order.
	pub fn timesteps(&self) -> ArrayView1<'_, f64> {
		self.timesteps.view()
	}

	/// Sigmas for each step, plus the terminal `0`.
	pub fn sigmas(&self) -> ArrayView1<'_, f64> {
		self.sigmas.view()
	}

	/// The largest sigma of the schedule, which is the first one.
	pub fn max_sigma(&self) -> f64 {
		self.max_sigma
	}

	/// Number of inference steps.
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.timesteps.len()
	}

	/// Checks `step_index` against the schedule.
	pub(crate) fn check_index(&self, step_index: usize) -> Result<()> {
		if step_index >= self.len() {
			return Err(DiffusionError::IndexOutOfRange {
				index: step_index,
				len: self.len()
			});
		}
		Ok(())
	}

	/// `(sigma[step_index], sigma[step_index + 1])`.
	pub(crate) fn sigma_pair(&self, step_index: usize) -> Result<(f64, f64)> {
		self.check_index(step_index)?;
		Ok((self.sigmas[step_index], self.sigmas[step_index + 1]))
	}

	/// The training timestep of `step_index`, truncated toward zero.
	pub(crate) fn timestep(&self, step_index: usize) -> Result<i64> {
		self.check_index(step_index)?;
		let t = self.timesteps[step_index];
		t.to_i64().ok_or_else(|| DiffusionError::configuration(format!("timestep {t} does not fit in an i64")))
	}

	/// Repeats every step after the first, so a second-order solver can evaluate the model twice per interval.
	///
	/// Timesteps `[t0, t1, .., tn]` become `[t0, t1, t1, .., tn, tn]` and sigmas `[s0, s1, .., sn, 0]` become
	/// `[s0, s1, s1, .., sn, sn, 0]`.
	#[cfg(feature = "scheduler-heun")]
	pub(crate) fn interleave_second_order(&self) -> Self {
		let repeat = |values: ArrayView1<'_, f64>| {
			let mut out = Vec::with_capacity(values.len() * 2);
			for (i, v) in values.iter().enumerate() {
				out.push(*v);
				if i > 0 {
					out.push(*v);
				}
			}
			out
		};
		let timesteps = Array1::from(repeat(self.timesteps.view()));
		let n = self.len();
		let mut sigmas = repeat(self.sigmas.slice(ndarray::s![..n]));
		sigmas.push(0.0);
		Self {
			timesteps,
			sigmas: Array1::from(sigmas),
			max_sigma: self.max_sigma
		}
	}
}
