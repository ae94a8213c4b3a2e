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

//! Fixed-length [CLIP](https://arxiv.org/abs/2103.00020) token layouts for the text encoder.
//!
//! Tokenization itself happens outside this crate; these helpers only frame already-tokenized prompts the way the
//! Stable Diffusion v1 text encoder expects them.

use ndarray::Array2;

use crate::error::{DiffusionError, Result};

/// Maximum number of tokens (including BOS and EOS) the text encoder accepts.
pub const MODEL_MAX_LENGTH: usize = 77;
/// Beginning-of-string token ID.
pub const BOS_TOKEN: i32 = 49406;
/// Padding token ID; doubles as the end-of-string token.
pub const PAD_TOKEN: i32 = 49407;

/// Frames prompt token IDs as `[BOS, ids.., EOS, PAD..]` in a `[1, 77]` array.
///
/// ```
/// # use onnx_sd_sampler::clip::{pad_tokens, BOS_TOKEN, PAD_TOKEN};
/// // "a cat in the water at sunset"
/// let tokens = pad_tokens(&[320, 2368, 530, 518, 1573, 536, 3424]).unwrap();
/// assert_eq!(tokens.shape(), &[1, 77]);
/// assert_eq!(tokens[[0, 0]], BOS_TOKEN);
/// assert_eq!(tokens[[0, 8]], PAD_TOKEN);
/// ```
///
/// # Errors
/// Returns [`DiffusionError::Configuration`] if `ids` does not fit between BOS and EOS.
pub fn pad_tokens(ids: &[i32]) -> Result<Array2<i32>> {
	if ids.len() > MODEL_MAX_LENGTH - 2 {
		return Err(DiffusionError::configuration(format!(
			"prompt has {} tokens, but at most {} fit in the text encoder",
			ids.len(),
			MODEL_MAX_LENGTH - 2
		)));
	}

	let mut tokens = Array2::from_elem((1, MODEL_MAX_LENGTH), PAD_TOKEN);
	tokens[[0, 0]] = BOS_TOKEN;
	for (i, id) in ids.iter().enumerate() {
		tokens[[0, i + 1]] = *id;
	}
	Ok(tokens)
}

/// Tokens for the empty prompt, used for unconditional (negative) guidance.
pub fn unconditional_tokens() -> Array2<i32> {
	let mut tokens = Array2::from_elem((1, MODEL_MAX_LENGTH), PAD_TOKEN);
	tokens[[0, 0]] = BOS_TOKEN;
	tokens
}
