//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// Dilated 3D convolution with same-padding, NDHWC layout.
//
//     input:  [batch, depth, height, width, c_in]
//     kernel: [kd, kh, kw, c_in, c_out]
//     output: [batch, depth, height, width, c_out]
//
// The spatial size is preserved for any dilation rate; a tap that falls
// outside the volume contributes zero.

use ndarray::Array5;

use crate::ErrPack;

use super::TensorOpError;

//--------------------------------------------------------------------------------------------------

fn check_geometry(
	inp_dim: (usize, usize, usize, usize, usize),
	kernel_dim: (usize, usize, usize, usize, usize),
	dilation: (usize, usize, usize),
) -> Result<(), ErrPack<TensorOpError>> {
	let (_, _, _, _, ci) = inp_dim;
	let (kz, ky, kx, kci, _) = kernel_dim;
	if kci != ci {
		return Err(TensorOpError::shape_mismatch(format!(
			"kernel expects {kci} input channels but the volume has {ci}"
		)));
	}
	if kz == 0 || ky == 0 || kx == 0 {
		return Err(TensorOpError::invalid_shape(format!(
			"kernel spatial dims must be positive, got ({kz}, {ky}, {kx})"
		)));
	}
	// Same-padding is only well defined for odd taps.
	if kz % 2 == 0 || ky % 2 == 0 || kx % 2 == 0 {
		return Err(TensorOpError::invalid_shape(format!(
			"kernel spatial dims must be odd for same-padding, got ({kz}, {ky}, {kx})"
		)));
	}
	let (dz, dy, dx) = dilation;
	if dz == 0 || dy == 0 || dx == 0 {
		return Err(TensorOpError::invalid_value(format!(
			"dilation rates must be positive, got ({dz}, {dy}, {dx})"
		)));
	}
	Ok(())
}

fn padding(
	kernel_dim: (usize, usize, usize, usize, usize),
	dilation: (usize, usize, usize),
) -> (usize, usize, usize) {
	let (kz, ky, kx, _, _) = kernel_dim;
	let (dz, dy, dx) = dilation;
	((kz - 1) / 2 * dz, (ky - 1) / 2 * dy, (kx - 1) / 2 * dx)
}

//--------------------------------------------------------------------------------------------------

#[allow(clippy::indexing_slicing)]
pub fn conv3d(
	inp: &Array5<f32>,
	kernel: &Array5<f32>,
	dilation: (usize, usize, usize),
) -> Result<Array5<f32>, ErrPack<TensorOpError>> {
	check_geometry(inp.dim(), kernel.dim(), dilation)?;
	let (bn, zd, yd, xd, ci) = inp.dim();
	let (kz, ky, kx, _, co) = kernel.dim();
	let (dz, dy, dx) = dilation;
	let (pz, py, px) = padding(kernel.dim(), dilation);

	let mut out = Array5::<f32>::zeros((bn, zd, yd, xd, co));
	for b in 0..bn {
		for z in 0..zd {
			for y in 0..yd {
				for x in 0..xd {
					for a in 0..kz {
						let iz = z + a * dz;
						if iz < pz || iz - pz >= zd {
							continue;
						}
						let iz = iz - pz;
						for c in 0..ky {
							let iy = y + c * dy;
							if iy < py || iy - py >= yd {
								continue;
							}
							let iy = iy - py;
							for e in 0..kx {
								let ix = x + e * dx;
								if ix < px || ix - px >= xd {
									continue;
								}
								let ix = ix - px;
								for i in 0..ci {
									let v = inp[[b, iz, iy, ix, i]];
									for o in 0..co {
										out[[b, z, y, x, o]] += v * kernel[[a, c, e, i, o]];
									}
								}
							}
						}
					}
				}
			}
		}
	}
	Ok(out)
}

/// Gradient of `conv3d` with respect to the input volume.
#[allow(clippy::indexing_slicing)]
pub fn conv3d_grad_input(
	d_out: &Array5<f32>,
	kernel: &Array5<f32>,
	dilation: (usize, usize, usize),
	inp_dim: (usize, usize, usize, usize, usize),
) -> Result<Array5<f32>, ErrPack<TensorOpError>> {
	check_geometry(inp_dim, kernel.dim(), dilation)?;
	let (bn, zd, yd, xd, ci) = inp_dim;
	let (kz, ky, kx, _, co) = kernel.dim();
	let (dz, dy, dx) = dilation;
	let (pz, py, px) = padding(kernel.dim(), dilation);

	let mut d_inp = Array5::<f32>::zeros(inp_dim);
	for b in 0..bn {
		for z in 0..zd {
			for y in 0..yd {
				for x in 0..xd {
					for a in 0..kz {
						let iz = z + a * dz;
						if iz < pz || iz - pz >= zd {
							continue;
						}
						let iz = iz - pz;
						for c in 0..ky {
							let iy = y + c * dy;
							if iy < py || iy - py >= yd {
								continue;
							}
							let iy = iy - py;
							for e in 0..kx {
								let ix = x + e * dx;
								if ix < px || ix - px >= xd {
									continue;
								}
								let ix = ix - px;
								for i in 0..ci {
									let mut acc = 0.0_f32;
									for o in 0..co {
										acc += d_out[[b, z, y, x, o]] * kernel[[a, c, e, i, o]];
									}
									d_inp[[b, iz, iy, ix, i]] += acc;
								}
							}
						}
					}
				}
			}
		}
	}
	Ok(d_inp)
}

/// Gradient of `conv3d` with respect to the kernel.
#[allow(clippy::indexing_slicing)]
pub fn conv3d_grad_kernel(
	inp: &Array5<f32>,
	d_out: &Array5<f32>,
	kernel_dim: (usize, usize, usize, usize, usize),
	dilation: (usize, usize, usize),
) -> Result<Array5<f32>, ErrPack<TensorOpError>> {
	check_geometry(inp.dim(), kernel_dim, dilation)?;
	let (bn, zd, yd, xd, ci) = inp.dim();
	let (kz, ky, kx, _, co) = kernel_dim;
	let (dz, dy, dx) = dilation;
	let (pz, py, px) = padding(kernel_dim, dilation);

	let mut d_kernel = Array5::<f32>::zeros(kernel_dim);
	for b in 0..bn {
		for z in 0..zd {
			for y in 0..yd {
				for x in 0..xd {
					for a in 0..kz {
						let iz = z + a * dz;
						if iz < pz || iz - pz >= zd {
							continue;
						}
						let iz = iz - pz;
						for c in 0..ky {
							let iy = y + c * dy;
							if iy < py || iy - py >= yd {
								continue;
							}
							let iy = iy - py;
							for e in 0..kx {
								let ix = x + e * dx;
								if ix < px || ix - px >= xd {
									continue;
								}
								let ix = ix - px;
								for i in 0..ci {
									let v = inp[[b, iz, iy, ix, i]];
									for o in 0..co {
										d_kernel[[a, c, e, i, o]] += v * d_out[[b, z, y, x, o]];
									}
								}
							}
						}
					}
				}
			}
		}
	}
	Ok(d_kernel)
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use assert_approx_eq::assert_approx_eq;
	use ndarray::Array5;

	use super::*;
	use crate::rng::Rng;
	use crate::tensor::vol;

	#[test]
	fn pointwise_identity_kernel() {
		let mut rng = Rng::from_seed(5);
		let inp = vol(rng.randn_array(&[1, 4, 4, 4, 1])).unwrap();
		let mut kernel = Array5::<f32>::zeros((1, 1, 1, 1, 1));
		kernel[[0, 0, 0, 0, 0]] = 1.0;
		let out = conv3d(&inp, &kernel, (1, 1, 1)).unwrap();
		for (a, b) in inp.iter().zip(out.iter()) {
			assert_approx_eq!(a, b, 1e-6);
		}
	}

	#[test]
	fn known_values_along_one_axis() {
		// input [1, 10, 100] on the width axis, kernel taps [1, 2, 3]
		let mut inp = Array5::<f32>::zeros((1, 1, 1, 3, 1));
		inp[[0, 0, 0, 0, 0]] = 1.0;
		inp[[0, 0, 0, 1, 0]] = 10.0;
		inp[[0, 0, 0, 2, 0]] = 100.0;
		let mut kernel = Array5::<f32>::zeros((1, 1, 3, 1, 1));
		kernel[[0, 0, 0, 0, 0]] = 1.0;
		kernel[[0, 0, 1, 0, 0]] = 2.0;
		kernel[[0, 0, 2, 0, 0]] = 3.0;
		let out = conv3d(&inp, &kernel, (1, 1, 1)).unwrap();
		assert_approx_eq!(out[[0, 0, 0, 0, 0]], 2.0 * 1.0 + 3.0 * 10.0, 1e-6);
		assert_approx_eq!(out[[0, 0, 0, 1, 0]], 1.0 + 2.0 * 10.0 + 3.0 * 100.0, 1e-6);
		assert_approx_eq!(out[[0, 0, 0, 2, 0]], 10.0 + 2.0 * 100.0, 1e-6);
	}

	#[test]
	fn dilation_spreads_the_taps() {
		// with dilation 2, the center output sees positions 0, 2 and 4
		let mut inp = Array5::<f32>::zeros((1, 1, 1, 5, 1));
		for x in 0..5 {
			inp[[0, 0, 0, x, 0]] = 10.0_f32.powi(x as i32);
		}
		let mut kernel = Array5::<f32>::zeros((1, 1, 3, 1, 1));
		kernel[[0, 0, 0, 0, 0]] = 1.0;
		kernel[[0, 0, 1, 0, 0]] = 1.0;
		kernel[[0, 0, 2, 0, 0]] = 1.0;
		let out = conv3d(&inp, &kernel, (1, 1, 2)).unwrap();
		assert_approx_eq!(out[[0, 0, 0, 2, 0]], 1.0 + 100.0 + 10_000.0, 1e-3);
	}

	#[test]
	fn same_padding_preserves_shape_for_all_dilations() {
		let mut rng = Rng::from_seed(17);
		let inp = vol(rng.randn_array(&[2, 8, 8, 8, 3])).unwrap();
		let kernel = vol(rng.randn_array(&[3, 3, 3, 3, 4])).unwrap();
		for d in [1_usize, 2, 4, 8] {
			let out = conv3d(&inp, &kernel, (d, d, d)).unwrap();
			assert_eq!(out.dim(), (2, 8, 8, 8, 4));
		}
	}

	#[test]
	fn rejects_channel_mismatch_and_even_kernels() {
		let inp = Array5::<f32>::zeros((1, 2, 2, 2, 3));
		let kernel = Array5::<f32>::zeros((3, 3, 3, 2, 4));
		assert!(conv3d(&inp, &kernel, (1, 1, 1)).is_err());
		let kernel = Array5::<f32>::zeros((2, 3, 3, 3, 4));
		assert!(conv3d(&inp, &kernel, (1, 1, 1)).is_err());
		let kernel = Array5::<f32>::zeros((3, 3, 3, 3, 4));
		assert!(conv3d(&inp, &kernel, (0, 1, 1)).is_err());
	}

	// loss = sum(conv3d(inp, kernel) * r) so that d_out = r
	fn weighted_sum(inp: &Array5<f32>, kernel: &Array5<f32>, r: &Array5<f32>) -> f64 {
		let out = conv3d(inp, kernel, (1, 1, 2)).unwrap();
		out.iter().zip(r.iter()).map(|(&o, &w)| f64::from(o) * f64::from(w)).sum()
	}

	#[test]
	fn kernel_gradient_matches_finite_differences() {
		let mut rng = Rng::from_seed(23);
		let inp = vol(rng.randn_array(&[1, 3, 3, 4, 2])).unwrap();
		let mut kernel = vol(rng.randn_array(&[3, 3, 3, 2, 2])).unwrap();
		let r = vol(rng.randn_array(&[1, 3, 3, 4, 2])).unwrap();

		let d_kernel = conv3d_grad_kernel(&inp, &r, kernel.dim(), (1, 1, 2)).unwrap();

		let h = 1e-2_f32;
		for idx in [[0, 0, 0, 0, 0], [1, 2, 0, 1, 1], [2, 1, 1, 0, 1]] {
			let orig = kernel[idx];
			kernel[idx] = orig + h;
			let up = weighted_sum(&inp, &kernel, &r);
			kernel[idx] = orig - h;
			let down = weighted_sum(&inp, &kernel, &r);
			kernel[idx] = orig;
			let numeric = (up - down) / (2.0 * f64::from(h));
			assert_approx_eq!(f64::from(d_kernel[idx]), numeric, 5e-2);
		}
	}

	#[test]
	fn input_gradient_matches_finite_differences() {
		let mut rng = Rng::from_seed(29);
		let mut inp = vol(rng.randn_array(&[1, 3, 3, 4, 2])).unwrap();
		let kernel = vol(rng.randn_array(&[3, 3, 3, 2, 2])).unwrap();
		let r = vol(rng.randn_array(&[1, 3, 3, 4, 2])).unwrap();

		let d_inp = conv3d_grad_input(&r, &kernel, (1, 1, 2), inp.dim()).unwrap();

		let h = 1e-2_f32;
		for idx in [[0, 0, 0, 0, 0], [0, 1, 2, 3, 1], [0, 2, 0, 1, 0]] {
			let orig = inp[idx];
			inp[idx] = orig + h;
			let up = weighted_sum(&inp, &kernel, &r);
			inp[idx] = orig - h;
			let down = weighted_sum(&inp, &kernel, &r);
			inp[idx] = orig;
			let numeric = (up - down) / (2.0 * f64::from(h));
			assert_approx_eq!(f64::from(d_inp[idx]), numeric, 5e-2);
		}
	}
}
