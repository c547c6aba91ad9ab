//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use ndarray::{Array4, Array5, ArrayD, Axis, Ix5};

use crate::ErrPack;

pub mod conv3d;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TensorOpError {
	ShapeMismatch,
	InvalidShape,
	InvalidValue,
	IOError,
}

impl TensorOpError {
	#[cold]
	#[inline(never)]
	pub fn shape_mismatch(message: String) -> ErrPack<Self> {
		ErrPack::new(Self::ShapeMismatch, message)
	}

	#[cold]
	#[inline(never)]
	pub fn invalid_shape(message: String) -> ErrPack<Self> {
		ErrPack::new(Self::InvalidShape, message)
	}

	#[cold]
	#[inline(never)]
	pub fn invalid_value(message: String) -> ErrPack<Self> {
		ErrPack::new(Self::InvalidValue, message)
	}
}

impl From<ndarray::ShapeError> for ErrPack<TensorOpError> {
	fn from(err: ndarray::ShapeError) -> Self {
		Self::nested(TensorOpError::InvalidShape, "array shape error", Box::new(err))
	}
}

impl From<std::io::Error> for ErrPack<TensorOpError> {
	fn from(err: std::io::Error) -> Self {
		Self::nested(TensorOpError::IOError, "IO error occurred", Box::new(err))
	}
}

//--------------------------------------------------------------------------------------------------

/// Reinterprets a dynamic-rank tensor as a `(batch, depth, height, width, channel)` volume.
pub fn vol(t: ArrayD<f32>) -> Result<Array5<f32>, ErrPack<TensorOpError>> {
	let ndim = t.ndim();
	t.into_dimensionality::<Ix5>().map_err(|_| {
		TensorOpError::invalid_shape(format!(
			"expected a 5-dimensional (batch, depth, height, width, channel) volume, got {ndim} dimensions"
		))
	})
}

/// Numerically stable softmax along the last (class) axis.
pub fn softmax_last_axis(logits: &Array5<f32>) -> Array5<f32> {
	let mut out = logits.clone();
	for mut lane in out.lanes_mut(Axis(4)) {
		let max = lane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
		let mut sum = 0.0_f32;
		for v in &mut lane {
			*v = (*v - max).exp();
			sum += *v;
		}
		for v in &mut lane {
			*v /= sum;
		}
	}
	out
}

/// Index of the largest class score per voxel. Ties resolve to the lowest index.
pub fn argmax_last_axis(logits: &Array5<f32>) -> Array4<i64> {
	let (b, d, h, w, _) = logits.dim();
	let mut out = Array4::<i64>::zeros((b, d, h, w));
	for (idx, lane) in logits.lanes(Axis(4)).into_iter().enumerate() {
		let mut best = 0_usize;
		let mut best_v = f32::NEG_INFINITY;
		for (i, &v) in lane.iter().enumerate() {
			if v > best_v {
				best_v = v;
				best = i;
			}
		}
		let x = idx % w;
		let y = (idx / w) % h;
		let z = (idx / (w * h)) % d;
		let n = idx / (w * h * d);
		#[allow(clippy::indexing_slicing)]
		{
			out[[n, z, y, x]] = best as i64;
		}
	}
	out
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use assert_approx_eq::assert_approx_eq;
	use ndarray::Array5;

	use super::*;
	use crate::rng::Rng;

	#[test]
	fn softmax_rows_sum_to_one() {
		let mut rng = Rng::from_seed(11);
		let logits = vol(rng.randn_array(&[2, 3, 3, 3, 5])).unwrap();
		let probs = softmax_last_axis(&logits);
		for lane in probs.lanes(Axis(4)) {
			let sum: f32 = lane.iter().sum();
			assert_approx_eq!(sum, 1.0, 1e-5);
			for &p in &lane {
				assert!(p >= 0.0);
			}
		}
	}

	#[test]
	fn argmax_matches_largest_logit() {
		let mut logits = Array5::<f32>::zeros((1, 1, 1, 2, 3));
		logits[[0, 0, 0, 0, 2]] = 4.0;
		logits[[0, 0, 0, 1, 1]] = 2.5;
		let ids = argmax_last_axis(&logits);
		assert_eq!(ids[[0, 0, 0, 0]], 2);
		assert_eq!(ids[[0, 0, 0, 1]], 1);
	}

	#[test]
	fn vol_rejects_wrong_rank() {
		let t = ndarray::ArrayD::<f32>::zeros(vec![2, 2, 2]);
		assert!(vol(t).is_err());
	}
}
