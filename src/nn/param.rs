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
use crate::tensor::TensorOpError;

use super::optimizer::OptState;

pub struct Param {
	pub(crate) value: ArrayD<f32>,
	pub(crate) grad: Option<ArrayD<f32>>,
	pub(crate) requires_grad: bool,
	pub(crate) opt_state: Option<OptState>,
}

impl Param {
	pub fn new(value: ArrayD<f32>) -> Rc<RefCell<Param>> {
		Rc::new(RefCell::new(Param {
			value,
			grad: None,
			requires_grad: true,
			opt_state: None,
		}))
	}

	pub fn value(&self) -> &ArrayD<f32> {
		&self.value
	}

	pub fn value_mut(&mut self) -> &mut ArrayD<f32> {
		&mut self.value
	}

	pub fn shape(&self) -> &[usize] {
		self.value.shape()
	}

	pub fn requires_grad(&self) -> bool {
		self.requires_grad
	}

	pub fn grad(&self) -> Option<&ArrayD<f32>> {
		self.grad.as_ref()
	}

	pub fn zero_grad(&mut self) {
		self.grad = None;
	}

	/// Adds `delta` into the accumulated gradient.
	pub fn acc_grad(&mut self, delta: ArrayD<f32>) -> Result<(), ErrPack<TensorOpError>> {
		if delta.shape() != self.value.shape() {
			return Err(TensorOpError::shape_mismatch(format!(
				"gradient shape {:?} does not match parameter shape {:?}",
				delta.shape(),
				self.value.shape()
			)));
		}
		if let Some(grad) = &mut self.grad {
			*grad += &delta;
		} else {
			self.grad = Some(delta);
		}
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use ndarray::ArrayD;

	use super::*;

	#[test]
	fn grad_accumulates_and_clears() {
		let p = Param::new(ArrayD::zeros(vec![2, 2]));
		let delta = ArrayD::from_elem(vec![2, 2], 1.5_f32);
		p.borrow_mut().acc_grad(delta.clone()).unwrap();
		p.borrow_mut().acc_grad(delta).unwrap();
		assert_eq!(p.borrow().grad().unwrap()[[0, 0]], 3.0);
		p.borrow_mut().zero_grad();
		assert!(p.borrow().grad().is_none());
	}

	#[test]
	fn grad_shape_is_checked() {
		let p = Param::new(ArrayD::zeros(vec![2, 2]));
		let bad = ArrayD::zeros(vec![3]);
		assert!(p.borrow_mut().acc_grad(bad).is_err());
	}
}
