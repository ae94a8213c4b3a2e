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

use ndarray::ArrayView1;

/// Interpolates a table sampled at integer positions `0, 1, .., len-1` at a fractional position, linearly in log
/// space: `exp((1 - w) * ln(y[floor(x)]) + w * ln(y[ceil(x)]))`.
pub struct LogLinearInterpolator<'y> {
	y: ArrayView1<'y, f64>
}

impl<'y> LogLinearInterpolator<'y> {
	/// Wraps a table of strictly positive values.
	pub fn new(y: ArrayView1<'y, f64>) -> Self {
		Self { y }
	}

	/// Returns `None` if `x` is negative, not finite, or beyond the last table position.
	pub fn eval(&self, x: f64) -> Option<f64> {
		if !x.is_finite() || x < 0.0 || x > (self.y.len() as f64 - 1.0) {
			return None;
		}

		let low = x.floor();
		let high = x.ceil();
		let w = x - low;
		let y_l = self.y[low as usize].ln();
		let y_h = self.y[high as usize].ln();
		Some(((1.0 - w) * y_l + w * y_h).exp())
	}
}
