//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::rc::Rc;

use ndarray::ArrayD;

use crate::ErrPack;
use crate::autograd::{Autograd, AutogradNode, BackwardFn};
use crate::nn::param::Param;
use crate::tensor::TensorOpError;

use super::super::Layer;

/// Rectified-linear activation. Parameterless.
pub struct Relu;

impl Layer for Relu {
	fn collect_params(&self, _f: &mut dyn FnMut(Rc<RefCell<Param>>)) {
	}

	fn collect_named_params(&self, _prefix: &str, _f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
	}

	fn forward(&self, inp_node: AutogradNode) -> Result<AutogradNode, ErrPack<TensorOpError>> {
		let (inp, inp_backward) = inp_node.take();
		let out = inp.mapv(|v| v.max(0.0));

		let backward_fn = inp_backward.map(|inp_backward| {
			Box::new(ReluBackwardFn { out: out.clone(), inp_backward }) as Box<dyn BackwardFn>
		});

		Ok(AutogradNode::new(out, backward_fn))
	}
}

pub struct ReluBackwardFn {
	/// forward output; positive entries mark where the gradient passes
	out: ArrayD<f32>,
	inp_backward: Box<dyn BackwardFn>,
}

impl BackwardFn for ReluBackwardFn {
	fn backward(
		self: Box<Self>,
		d_out: ArrayD<f32>,
		autograd: &mut Autograd,
	) -> Result<(), ErrPack<TensorOpError>> {
		let Self { out, inp_backward } = *self;
		if d_out.shape() != out.shape() {
			return Err(TensorOpError::shape_mismatch(format!(
				"relu gradient shape {:?} does not match activation shape {:?}",
				d_out.shape(),
				out.shape()
			)));
		}
		let mut d_inp = d_out;
		ndarray::Zip::from(&mut d_inp).and(&out).for_each(|d, &o| {
			if o <= 0.0 {
				*d = 0.0;
			}
		});
		autograd.set_grad(inp_backward, d_inp);
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------
