//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// Variational weight-noise 3D convolution.
//
// The kernel is a random variable with an explicit per-weight mean `m` and
// variance source `sigma`. The deterministic path convolves with `m`; the
// stochastic path draws `w = m + sigma * eps`, `eps ~ N(0, 1)`, fresh per
// forward pass. Both parameters are exposed so a loss can compare them
// against prior tensors.

use std::cell::RefCell;
use std::rc::Rc;

use ndarray::Array5;

use crate::ErrPack;
use crate::autograd::{Autograd, AutogradNode, BackwardFn};
use crate::nn::param::Param;
use crate::rng::Rng;
use crate::tensor::conv3d::{conv3d, conv3d_grad_input, conv3d_grad_kernel};
use crate::tensor::{TensorOpError, vol};

use super::super::Layer;

pub struct VwnConv3d {
	m: Rc<RefCell<Param>>,
	sigma: Rc<RefCell<Param>>,
	kernel_dim: (usize, usize, usize, usize, usize),
	dilation: (usize, usize, usize),
	is_mc: bool,
	rng: Rc<RefCell<Rng>>,
}

impl VwnConv3d {
	pub const SIGMA_INIT: f32 = 0.1;

	pub fn new(
		in_channels: usize,
		filters: usize,
		kernel_size: usize,
		dilation: usize,
		is_mc: bool,
		rng: Rc<RefCell<Rng>>,
	) -> Self {
		let kernel_dim = (kernel_size, kernel_size, kernel_size, in_channels, filters);
		let shape = [kernel_size, kernel_size, kernel_size, in_channels, filters];

		// He initialization over the kernel fan-in
		let fan_in = (kernel_size * kernel_size * kernel_size * in_channels) as f64;
		let std = (2.0 / fan_in).sqrt() as f32;
		let mut m_init = rng.borrow_mut().randn_array(&shape);
		m_init.mapv_inplace(|v| v * std);

		let sigma_init = ndarray::ArrayD::from_elem(shape.to_vec(), Self::SIGMA_INIT);

		Self {
			m: Param::new(m_init),
			sigma: Param::new(sigma_init),
			kernel_dim,
			dilation: (dilation, dilation, dilation),
			is_mc,
			rng,
		}
	}

	pub fn m(&self) -> Rc<RefCell<Param>> {
		self.m.clone()
	}

	pub fn sigma(&self) -> Rc<RefCell<Param>> {
		self.sigma.clone()
	}
}

impl Layer for VwnConv3d {
	fn collect_params(&self, f: &mut dyn FnMut(Rc<RefCell<Param>>)) {
		f(self.m.clone());
		f(self.sigma.clone());
	}

	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		f(format!("{prefix}.m"), self.m.clone());
		f(format!("{prefix}.sigma"), self.sigma.clone());
	}

	fn forward(&self, inp_node: AutogradNode) -> Result<AutogradNode, ErrPack<TensorOpError>> {
		let (inp, inp_backward) = inp_node.take();
		let inp = vol(inp)?;

		let m = self.m.borrow();
		let (w, eps) = if self.is_mc {
			let eps = self.rng.borrow_mut().randn_array(m.shape());
			let sigma = self.sigma.borrow();
			let w = m.value() + &(sigma.value() * &eps);
			(vol(w)?, Some(eps))
		} else {
			(vol(m.value().clone())?, None)
		};

		let out = conv3d(&inp, &w, self.dilation)?;

		let kernel_grads = m.requires_grad() || self.sigma.borrow().requires_grad();
		let backward_fn = if inp_backward.is_some() || kernel_grads {
			Some(Box::new(VwnConv3dBackwardFn {
				m: self.m.clone(),
				sigma: self.sigma.clone(),
				inp_dim: inp.dim(),
				inp: if kernel_grads { Some(inp) } else { None },
				w: if inp_backward.is_some() { Some(w) } else { None },
				eps,
				kernel_dim: self.kernel_dim,
				dilation: self.dilation,
				inp_backward,
			}) as Box<dyn BackwardFn>)
		} else {
			None
		};

		Ok(AutogradNode::new(out.into_dyn(), backward_fn))
	}
}

pub struct VwnConv3dBackwardFn {
	m: Rc<RefCell<Param>>,
	sigma: Rc<RefCell<Param>>,

	inp_dim: (usize, usize, usize, usize, usize),

	/// should be `Some` if we should compute `d_m` / `d_sigma`
	inp: Option<Array5<f32>>,

	/// should be `Some` if we should compute `d_inp`
	w: Option<Array5<f32>>,

	/// noise drawn in the forward pass; `None` on the deterministic path
	eps: Option<ndarray::ArrayD<f32>>,

	kernel_dim: (usize, usize, usize, usize, usize),
	dilation: (usize, usize, usize),

	inp_backward: Option<Box<dyn BackwardFn>>,
}

impl BackwardFn for VwnConv3dBackwardFn {
	fn backward(
		self: Box<Self>,
		d_out: ndarray::ArrayD<f32>,
		autograd: &mut Autograd,
	) -> Result<(), ErrPack<TensorOpError>> {
		let Self {
			m,
			sigma,
			inp_dim,
			inp,
			w,
			eps,
			kernel_dim,
			dilation,
			inp_backward,
		} = *self;

		let d_out = vol(d_out)?;

		// d_m and d_sigma
		if let Some(inp) = &inp {
			let d_w = conv3d_grad_kernel(inp, &d_out, kernel_dim, dilation)?.into_dyn();
			if let Some(eps) = &eps {
				let mut sigma = sigma.borrow_mut();
				if sigma.requires_grad() {
					sigma.acc_grad(&d_w * eps)?;
				}
			}
			let mut m = m.borrow_mut();
			if m.requires_grad() {
				m.acc_grad(d_w)?;
			}
		}

		// d_inp
		if let Some(inp_backward) = inp_backward {
			#[allow(clippy::unwrap_used)] // saved in forward whenever inp_backward is set
			let w = w.unwrap();
			let d_inp = conv3d_grad_input(&d_out, &w, dilation, inp_dim)?;
			autograd.set_grad(inp_backward, d_inp.into_dyn());
		}

		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use assert_approx_eq::assert_approx_eq;
	use ndarray::ArrayD;

	use super::*;

	fn rng() -> Rc<RefCell<Rng>> {
		Rc::new(RefCell::new(Rng::from_seed(101)))
	}

	#[test]
	fn deterministic_path_convolves_with_the_mean() {
		let rng = rng();
		let layer = VwnConv3d::new(2, 3, 3, 1, false, rng.clone());
		let inp = vol(rng.borrow_mut().randn_array(&[1, 4, 4, 4, 2])).unwrap();

		let node = AutogradNode::new(inp.clone().into_dyn(), None);
		let out = layer.forward(node).unwrap();

		let m = vol(layer.m().borrow().value().clone()).unwrap();
		let expected = conv3d(&inp, &m, (1, 1, 1)).unwrap();
		for (a, b) in vol(out.value).unwrap().iter().zip(expected.iter()) {
			assert_approx_eq!(a, b, 1e-6);
		}
	}

	#[test]
	fn stochastic_path_reduces_to_mean_when_sigma_is_zero() {
		let rng = rng();
		let layer = VwnConv3d::new(1, 2, 3, 2, true, rng.clone());
		layer.sigma().borrow_mut().value_mut().fill(0.0);
		let inp = vol(rng.borrow_mut().randn_array(&[1, 5, 5, 5, 1])).unwrap();

		let out = layer.forward(AutogradNode::new(inp.clone().into_dyn(), None)).unwrap();
		let m = vol(layer.m().borrow().value().clone()).unwrap();
		let expected = conv3d(&inp, &m, (2, 2, 2)).unwrap();
		for (a, b) in vol(out.value).unwrap().iter().zip(expected.iter()) {
			assert_approx_eq!(a, b, 1e-6);
		}
	}

	#[test]
	fn backward_accumulates_mean_gradient() {
		let rng = rng();
		let layer = VwnConv3d::new(1, 1, 3, 1, false, rng.clone());
		let inp = vol(rng.borrow_mut().randn_array(&[1, 3, 3, 3, 1])).unwrap();

		let out = layer.forward(AutogradNode::new(inp.clone().into_dyn(), None)).unwrap();
		let (value, backward_fn) = out.take();
		let d_out = ArrayD::from_elem(value.shape(), 1.0_f32);
		Autograd::run(backward_fn, d_out.clone()).unwrap();

		let expected = conv3d_grad_kernel(
			&inp,
			&vol(d_out).unwrap(),
			(3, 3, 3, 1, 1),
			(1, 1, 1),
		)
		.unwrap();
		let m = layer.m();
		let m = m.borrow();
		let grad = m.grad().unwrap();
		for (a, b) in grad.iter().zip(expected.iter()) {
			assert_approx_eq!(a, b, 1e-5);
		}
		// deterministic path leaves sigma untouched
		assert!(layer.sigma().borrow().grad().is_none());
	}

	#[test]
	fn stochastic_backward_reaches_sigma() {
		let rng = rng();
		let layer = VwnConv3d::new(1, 2, 3, 1, true, rng.clone());
		let inp = vol(rng.borrow_mut().randn_array(&[1, 3, 3, 3, 1])).unwrap();

		let out = layer.forward(AutogradNode::new(inp.into_dyn(), None)).unwrap();
		let (value, backward_fn) = out.take();
		let d_out = ArrayD::from_elem(value.shape(), 1.0_f32);
		Autograd::run(backward_fn, d_out).unwrap();

		assert!(layer.sigma().borrow().grad().is_some());
		assert!(layer.m().borrow().grad().is_some());
	}
}
