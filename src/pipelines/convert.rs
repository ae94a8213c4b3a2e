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

use image::{imageops::FilterType, RgbImage};
use ndarray::{Array4, ArrayView4};

/// Converts a decoded `[1, 3, H, W]` pixel tensor with values in `[0, 1]` into an 8-bit RGB image.
///
/// Values outside `[0, 1]` are clamped.
pub fn to_rgb_image(pixels: ArrayView4<'_, f32>) -> anyhow::Result<RgbImage> {
	let (batch, channels, height, width) = pixels.dim();
	if batch != 1 {
		anyhow::bail!("expected a single image, got a batch of {batch}");
	}
	if channels != 3 {
		anyhow::bail!("expected 3 color channels, got {channels}");
	}

	// NCHW -> NHWC, then row-major pixel order
	let buf = pixels
		.permuted_axes([0, 2, 3, 1])
		.iter()
		.map(|f| (f.clamp(0.0, 1.0) * 255.0).round() as u8)
		.collect::<Vec<_>>();
	RgbImage::from_raw(width as _, height as _, buf).ok_or_else(|| anyhow::anyhow!("failed to construct image"))
}

/// Converts an RGB image into a `[1, 3, height, width]` pixel tensor with values in `[0, 1]`, resizing it first if its
/// dimensions differ.
pub fn from_rgb_image(image: &RgbImage, width: u32, height: u32) -> Array4<f32> {
	let resized;
	let image = if image.dimensions() == (width, height) {
		image
	} else {
		resized = image::imageops::resize(image, width, height, FilterType::Lanczos3);
		&resized
	};
	// HWC -> NCHW
	Array4::from_shape_fn((1, 3, height as usize, width as usize), |(_, c, y, x)| {
		f32::from(image.get_pixel(x as u32, y as u32).0[c]) / 255.0
	})
}

#[cfg(test)]
mod tests {
	use image::Rgb;

	use super::*;

	#[test]
	fn test_to_rgb_image() {
		let mut pixels = Array4::<f32>::zeros((1, 3, 2, 3));
		pixels[[0, 0, 0, 0]] = 1.0;
		pixels[[0, 1, 1, 2]] = 0.5;
		pixels[[0, 2, 1, 2]] = 7.0;
		pixels[[0, 2, 0, 1]] = -1.0;

		let image = to_rgb_image(pixels.view()).unwrap();
		assert_eq!(image.dimensions(), (3, 2));
		assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0]);
		assert_eq!(image.get_pixel(2, 1).0, [0, 128, 255]);
		assert_eq!(image.get_pixel(1, 0).0, [0, 0, 0]);
	}

	#[test]
	fn test_from_rgb_image() {
		let mut image = RgbImage::new(3, 2);
		image.put_pixel(0, 0, Rgb([255, 0, 0]));
		image.put_pixel(2, 1, Rgb([0, 51, 255]));

		let pixels = from_rgb_image(&image, 3, 2);
		assert_eq!(pixels.shape(), &[1, 3, 2, 3]);
		assert_eq!(pixels[[0, 0, 0, 0]], 1.0);
		assert_eq!(pixels[[0, 1, 1, 2]], 0.2);
		assert_eq!(pixels[[0, 2, 1, 2]], 1.0);
		assert_eq!(pixels[[0, 2, 0, 1]], 0.0);

		// back to the same image
		assert_eq!(to_rgb_image(pixels.view()).unwrap(), image);
	}

	#[test]
	fn test_from_rgb_image_resizes() {
		let image = RgbImage::from_pixel(5, 7, Rgb([255, 255, 255]));
		let pixels = from_rgb_image(&image, 16, 8);
		assert_eq!(pixels.shape(), &[1, 3, 8, 16]);
		assert!(pixels.iter().all(|p| (p - 1.0).abs() < 0.02));
	}

	#[test]
	fn test_rejects_bad_layouts() {
		assert!(to_rgb_image(Array4::<f32>::zeros((2, 3, 4, 4)).view()).is_err());
		assert!(to_rgb_image(Array4::<f32>::zeros((1, 4, 4, 4)).view()).is_err());
	}
}
