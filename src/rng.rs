//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use ndarray::ArrayD;

// State initialization constant ("expand 32-byte k")
const CONST: [u32; 4] = [0x_6170_7865, 0x_3320_646e, 0x_7962_2d32, 0x_6b20_6574];

const STATE_WORDS: usize = 16;

pub struct Rng {
	state: [u32; STATE_WORDS],
}

impl Default for Rng {
	fn default() -> Self {
		Self::from_seed(0x_0a69_ee79_fb23_8e49)
	}
}

#[allow(clippy::indexing_slicing)]
impl Rng {
	pub fn new(seed: &[u8; 48]) -> Self {
		let c0 = CONST[0];
		let c1 = CONST[1];
		let c2 = CONST[2];
		let c3 = CONST[3];
		let mut w = [0_u32; 12];
		for i in 0..12 {
			w[i] = u32::from_le_bytes([
				seed[4 * i],
				seed[4 * i + 1],
				seed[4 * i + 2],
				seed[4 * i + 3],
			]);
		}
		#[rustfmt::skip]
		let state = [
			c0, c1, c2, c3,
			w[0], w[1], w[2], w[3],
			w[4], w[5], w[6], w[7],
			w[8], w[9], w[10], w[11],
		];
		Self { state }
	}

	/// Expands a 64-bit seed into the full 48-byte key/counter block.
	pub fn from_seed(seed: u64) -> Self {
		// splitmix64
		let mut x = seed;
		let mut seed_bytes = [0_u8; 48];
		for chunk in seed_bytes.chunks_exact_mut(8) {
			x = x.wrapping_add(0x_9e37_79b9_7f4a_7c15);
			let mut z = x;
			z = (z ^ (z >> 30)).wrapping_mul(0x_bf58_476d_1ce4_e5b9);
			z = (z ^ (z >> 27)).wrapping_mul(0x_94d0_49bb_1331_11eb);
			z ^= z >> 31;
			chunk.copy_from_slice(&z.to_le_bytes());
		}
		Self::new(&seed_bytes)
	}

	// generates a block of random numbers
	#[inline(never)]
	fn get_block(&mut self) -> [u32; STATE_WORDS] {
		let mut result = self.state;

		// do 7 double rounds, i.e. 14 rounds
		for _ in 0..7 {
			Self::quarter_round(0, 4, 8, 12, &mut result);
			Self::quarter_round(1, 5, 9, 13, &mut result);
			Self::quarter_round(2, 6, 10, 14, &mut result);
			Self::quarter_round(3, 7, 11, 15, &mut result);

			Self::quarter_round(0, 5, 10, 15, &mut result);
			Self::quarter_round(1, 6, 11, 12, &mut result);
			Self::quarter_round(2, 7, 8, 13, &mut result);
			Self::quarter_round(3, 4, 9, 14, &mut result);
		}

		// add original state
		#[allow(clippy::needless_range_loop)]
		for i in 0..STATE_WORDS {
			result[i] = result[i].wrapping_add(self.state[i]);
		}

		// increment counter
		let (t, c) = self.state[12].overflowing_add(1);
		self.state[12] = t;
		self.state[13] = self.state[13].wrapping_add(u32::from(c));

		result
	}

	// internal function used by get_block()
	#[inline(always)]
	fn quarter_round(a: usize, b: usize, c: usize, d: usize, state: &mut [u32; STATE_WORDS]) {
		state[a] = state[a].wrapping_add(state[b]);
		state[d] ^= state[a];
		state[d] = state[d].rotate_left(16);

		state[c] = state[c].wrapping_add(state[d]);
		state[b] ^= state[c];
		state[b] = state[b].rotate_left(12);

		state[a] = state[a].wrapping_add(state[b]);
		state[d] ^= state[a];
		state[d] = state[d].rotate_left(8);

		state[c] = state[c].wrapping_add(state[d]);
		state[b] ^= state[c];
		state[b] = state[b].rotate_left(7);
	}

	/// Generates a uniform sample in the open interval (0.0, 1.0).
	/// Both endpoints are excluded so the value is always safe to pass
	/// through `ln(u)` and `ln(1 - u)`.
	pub fn get_uniform(&mut self) -> f64 {
		let block = self.get_block();
		let v: f64 = block[0].into();
		(v + 0.5) * (1.0 / 4_294_967_296.0)
	}

	/// Generates a float with normal distribution with mean 0 and variance 1.
	/// The generated values are guaranteed to be in the range (-10.0, 10.0)
	pub fn get_normal_clamped(&mut self) -> f64 {
		let block = self.get_block();
		let x: f64 = f64::from(block[0]) * (1.0 / 4_294_967_296.0);
		let y: f64 = f64::from(block[1]) * (1.0 / 4_294_967_296.0);

		// box mueller transform
		let x = 1.0 - x; // (0.0, 1.0]
		let r = (-2.0 * x.ln()).sqrt();
		let theta = std::f64::consts::TAU * y;
		let result = r * theta.cos();

		if result.abs() > 10.0 {
			log::warn!("Rng::get_normal_clamped(): clamping {result} to (-10.0, 10.0)");
			return 0.0;
		}

		result
	}

	pub fn randn(&mut self, out: &mut [f32]) {
		for v in out.iter_mut() {
			*v = self.get_normal_clamped() as f32;
		}
	}

	pub fn uniform(&mut self, out: &mut [f32]) {
		for v in out.iter_mut() {
			*v = self.get_uniform() as f32;
		}
	}

	pub fn randn_array(&mut self, shape: &[usize]) -> ArrayD<f32> {
		let mut data = vec![0.0_f32; shape.iter().product()];
		self.randn(&mut data);
		#[allow(clippy::unwrap_used)] // data length matches the shape by construction
		ArrayD::from_shape_vec(shape, data).unwrap()
	}

	pub fn uniform_array(&mut self, shape: &[usize]) -> ArrayD<f32> {
		let mut data = vec![0.0_f32; shape.iter().product()];
		self.uniform(&mut data);
		#[allow(clippy::unwrap_used)] // data length matches the shape by construction
		ArrayD::from_shape_vec(shape, data).unwrap()
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn same_seed_same_stream() {
		let mut a = Rng::from_seed(7);
		let mut b = Rng::from_seed(7);
		for _ in 0..32 {
			assert_eq!(a.get_block(), b.get_block());
		}
	}

	#[test]
	fn different_seeds_diverge() {
		let mut a = Rng::from_seed(1);
		let mut b = Rng::from_seed(2);
		assert_ne!(a.get_block(), b.get_block());
	}

	#[test]
	fn uniform_stays_in_open_interval() {
		let mut rng = Rng::from_seed(99);
		let mut buf = [0.0_f32; 4096];
		rng.uniform(&mut buf);
		for &u in &buf {
			assert!(u > 0.0 && u < 1.0);
		}
	}

	#[test]
	fn randn_has_roughly_unit_moments() {
		let mut rng = Rng::from_seed(3);
		let mut buf = [0.0_f32; 8192];
		rng.randn(&mut buf);
		let n = buf.len() as f64;
		let mean = buf.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
		let var = buf.iter().map(|&v| (f64::from(v) - mean).powi(2)).sum::<f64>() / n;
		assert!(mean.abs() < 0.05, "mean = {mean}");
		assert!((var - 1.0).abs() < 0.1, "var = {var}");
	}
}
