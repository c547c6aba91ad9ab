//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// Concrete dropout.
//
//     Gal, Hron, Kendall: https://arxiv.org/abs/1705.07832
//
// The dropout probability is a learned per-channel parameter, stored as a
// logit so the probability stays inside (0, 1) by construction. The
// stochastic path applies the concrete (continuous) relaxation of the
// Bernoulli mask, which lets the data path carry gradient into the logit.
// The deterministic path is the identity; the stochastic path uses inverted
// scaling `1 / (1 - p)`, so its expectation is the identity as well.

use std::cell::RefCell;
use std::rc::Rc;

use ndarray::{Array5, ArrayD};

use crate::ErrPack;
use crate::autograd::{Autograd, AutogradNode, BackwardFn, StraightThroughBackwardFn};
use crate::nn::param::Param;
use crate::rng::Rng;
use crate::tensor::{TensorOpError, vol};

use super::super::Layer;

/// Relaxation temperature of the concrete Bernoulli.
pub const TEMPERATURE: f64 = 0.1;

/// Initial dropout probability.
pub const INIT_P: f64 = 0.1;

/// Post-step clamp for the logit; keeps `p` away from 0 and 1 so the
/// logarithms in the mask and in the Bernoulli-KL stay finite.
pub const LOGIT_LIMIT: f32 = 8.0;

pub struct ConcreteDropout {
	p_logit: Rc<RefCell<Param>>, // shape: `[filters]`
	filters: usize,
	is_mc: bool,
	rng: Rc<RefCell<Rng>>,
}

impl ConcreteDropout {
	pub fn new(filters: usize, is_mc: bool, rng: Rc<RefCell<Rng>>) -> Self {
		let logit0 = (INIT_P / (1.0 - INIT_P)).ln() as f32;
		Self {
			p_logit: Param::new(ArrayD::from_elem(vec![filters], logit0)),
			filters,
			is_mc,
			rng,
		}
	}

	pub fn p_logit(&self) -> Rc<RefCell<Param>> {
		self.p_logit.clone()
	}

	/// Current per-channel dropout probabilities, `sigmoid(p_logit)`.
	pub fn p(&self) -> Vec<f32> {
		self.p_logit.borrow().value().iter().map(|&l| sigmoid(l)).collect()
	}

	/// Update action composed by the controller after an optimizer step.
	pub fn clamp_logit(&self) {
		let mut p_logit = self.p_logit.borrow_mut();
		p_logit.value_mut().mapv_inplace(|v| v.clamp(-LOGIT_LIMIT, LOGIT_LIMIT));
	}
}

fn sigmoid(x: f32) -> f32 {
	1.0 / (1.0 + (-x).exp())
}

impl Layer for ConcreteDropout {
	fn collect_params(&self, f: &mut dyn FnMut(Rc<RefCell<Param>>)) {
		f(self.p_logit.clone());
	}

	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		f(format!("{prefix}.p_logit"), self.p_logit.clone());
	}

	#[allow(clippy::indexing_slicing)]
	fn forward(&self, inp_node: AutogradNode) -> Result<AutogradNode, ErrPack<TensorOpError>> {
		let (inp, inp_backward) = inp_node.take();

		if !self.is_mc {
			let backward_fn = inp_backward.map(|inp_backward| {
				Box::new(StraightThroughBackwardFn::new(inp_backward)) as Box<dyn BackwardFn>
			});
			return Ok(AutogradNode::new(inp, backward_fn));
		}

		let x = vol(inp)?;
		let (bn, zd, yd, xd, ci) = x.dim();
		if ci != self.filters {
			return Err(TensorOpError::shape_mismatch(format!(
				"dropout expects {} channels but the volume has {ci}",
				self.filters
			)));
		}

		let p = self.p();
		let t = TEMPERATURE as f32;
		let mut u = Array5::<f32>::zeros(x.dim());
		{
			let mut rng = self.rng.borrow_mut();
			#[allow(clippy::unwrap_used)] // freshly allocated, contiguous
			rng.uniform(u.as_slice_mut().unwrap());
		}

		// concrete relaxation of the Bernoulli drop mask
		let mut s = Array5::<f32>::zeros(x.dim());
		let mut out = Array5::<f32>::zeros(x.dim());
		for b in 0..bn {
			for z in 0..zd {
				for y in 0..yd {
					for xx in 0..xd {
						for c in 0..ci {
							let pc = p[c];
							let uv = u[[b, z, y, xx, c]];
							let a = (pc.ln() - (1.0 - pc).ln() + uv.ln() - (1.0 - uv).ln()) / t;
							let sv = sigmoid(a);
							s[[b, z, y, xx, c]] = sv;
							out[[b, z, y, xx, c]] =
								x[[b, z, y, xx, c]] * (1.0 - sv) / (1.0 - pc);
						}
					}
				}
			}
		}

		let backward_fn = if inp_backward.is_some() || self.p_logit.borrow().requires_grad() {
			Some(Box::new(ConcreteDropoutBackwardFn {
				p_logit: self.p_logit.clone(),
				x,
				s,
				p,
				inp_backward,
			}) as Box<dyn BackwardFn>)
		} else {
			None
		};

		Ok(AutogradNode::new(out.into_dyn(), backward_fn))
	}
}

pub struct ConcreteDropoutBackwardFn {
	p_logit: Rc<RefCell<Param>>,
	x: Array5<f32>,
	s: Array5<f32>,
	p: Vec<f32>,
	inp_backward: Option<Box<dyn BackwardFn>>,
}

impl BackwardFn for ConcreteDropoutBackwardFn {
	#[allow(clippy::indexing_slicing)]
	fn backward(
		self: Box<Self>,
		d_out: ArrayD<f32>,
		autograd: &mut Autograd,
	) -> Result<(), ErrPack<TensorOpError>> {
		let Self { p_logit, x, s, p, inp_backward } = *self;

		let d_out = vol(d_out)?;
		let (bn, zd, yd, xd, ci) = x.dim();
		let t = TEMPERATURE as f32;

		let mut d_logit = vec![0.0_f32; ci];
		let mut d_x = Array5::<f32>::zeros(x.dim());
		for b in 0..bn {
			for z in 0..zd {
				for y in 0..yd {
					for xx in 0..xd {
						for c in 0..ci {
							let pc = p[c];
							let one_m_p = 1.0 - pc;
							let sv = s[[b, z, y, xx, c]];
							let retain = 1.0 - sv;
							let g = d_out[[b, z, y, xx, c]];
							d_x[[b, z, y, xx, c]] = g * retain / one_m_p;
							// d out / d logit, already chained through
							// p = sigmoid(logit)
							d_logit[c] += g
								* x[[b, z, y, xx, c]]
								* (retain * pc / one_m_p - sv * (1.0 - sv) / (t * one_m_p));
						}
					}
				}
			}
		}

		{
			let mut p_logit = p_logit.borrow_mut();
			if p_logit.requires_grad() {
				p_logit.acc_grad(ArrayD::from_shape_vec(vec![ci], d_logit)?)?;
			}
		}

		if let Some(inp_backward) = inp_backward {
			autograd.set_grad(inp_backward, d_x.into_dyn());
		}

		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------
