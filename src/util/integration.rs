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


/// Integrates `f` over `[a, b]` with the composite Simpson rule on `pieces` subintervals (rounded up to even).
///
/// Exact for polynomials up to degree 3, which covers the Lagrange bases of a fourth-order linear multistep method.
pub fn simpson<F: Fn(f64) -> f64>(f: F, a: f64, b: f64, pieces: usize) -> f64 {
	let pieces = (pieces.max(2) + 1) & !1;
	let h = (b - a) / pieces as f64;
	let mut sum = f(a) + f(b);
	for i in 1..pieces {
		let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
		sum += weight * f(a + h * i as f64);
	}
	sum * h / 3.0
}
