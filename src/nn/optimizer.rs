//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// Adam: https://arxiv.org/abs/1412.6980
//
// The moment estimates are kept without bias correction; with the small
// decay horizon used here the warmup bias washes out within a few steps.

use ndarray::{ArrayD, Zip};

use crate::ErrPack;

use super::param::Param;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum OptimizerError {
	UnknownName,
	MissingLearningRate,
}

impl OptimizerError {
	#[cold]
	#[inline(never)]
	pub fn unknown_name(name: &str) -> ErrPack<Self> {
		ErrPack::new(Self::UnknownName, format!("unknown optimizer name: {name:?}"))
	}

	#[cold]
	#[inline(never)]
	pub fn missing_learning_rate(name: &str) -> ErrPack<Self> {
		ErrPack::new(
			Self::MissingLearningRate,
			format!("optimizer {name:?} was given by name, so a learning rate is required"),
		)
	}
}

//--------------------------------------------------------------------------------------------------

pub struct OptCoef {
	pub(crate) m_decay: f64,       // beta1
	pub(crate) v_decay: f64,       // beta2
	pub(crate) eps: f64,           // epsilon
	pub(crate) learning_rate: f64, // alpha
}

impl Default for OptCoef {
	fn default() -> Self {
		Self {
			m_decay: 0.9,
			v_decay: 0.99,
			eps: 1e-8,
			learning_rate: 0.001,
		}
	}
}

pub(crate) struct OptState {
	pub(crate) m: ArrayD<f32>, // first moment estimate
	pub(crate) v: ArrayD<f32>, // second moment estimate
}

impl OptState {
	fn new(shape: &[usize]) -> Self {
		Self {
			m: ArrayD::zeros(shape),
			v: ArrayD::zeros(shape),
		}
	}
}

//--------------------------------------------------------------------------------------------------

enum Kind {
	Adam,
	GradientDescent,
}

pub struct Optimizer {
	kind: Kind,
	coef: OptCoef,
}

impl Optimizer {
	pub fn adam(coef: OptCoef) -> Self {
		Self { kind: Kind::Adam, coef }
	}

	pub fn gradient_descent(learning_rate: f64) -> Self {
		Self {
			kind: Kind::GradientDescent,
			coef: OptCoef { learning_rate, ..OptCoef::default() },
		}
	}

	/// Resolves an optimizer from a name string plus learning rate, the way
	/// callers configure it from the params bundle.
	pub fn from_name(
		name: &str,
		learning_rate: Option<f64>,
	) -> Result<Self, ErrPack<OptimizerError>> {
		let Some(lr) = learning_rate else {
			return Err(OptimizerError::missing_learning_rate(name));
		};
		match name.to_ascii_lowercase().as_str() {
			"adam" => Ok(Self::adam(OptCoef { learning_rate: lr, ..OptCoef::default() })),
			"sgd" | "gradientdescent" => Ok(Self::gradient_descent(lr)),
			_ => Err(OptimizerError::unknown_name(name)),
		}
	}

	pub fn learning_rate(&self) -> f64 {
		self.coef.learning_rate
	}

	/// Applies one update to the parameter from its accumulated gradient.
	/// A parameter with no gradient is left untouched.
	pub fn step(&self, param: &mut Param) {
		if !param.requires_grad {
			return;
		}
		let Some(grad) = param.grad.take() else {
			return;
		};

		match self.kind {
			Kind::GradientDescent => {
				let lr = self.coef.learning_rate as f32;
				Zip::from(&mut param.value).and(&grad).for_each(|value, &g| {
					*value -= lr * g;
				});
			},
			Kind::Adam => {
				let m_decay = self.coef.m_decay as f32;
				let v_decay = self.coef.v_decay as f32;
				let eps = self.coef.eps as f32;
				let lr = self.coef.learning_rate as f32;

				let state = param
					.opt_state
					.get_or_insert_with(|| OptState::new(grad.shape()));

				Zip::from(&mut state.m).and(&grad).for_each(|m, &g| {
					*m = m_decay * *m + (1.0 - m_decay) * g;
				});
				Zip::from(&mut state.v).and(&grad).for_each(|v, &g| {
					*v = v_decay * *v + (1.0 - v_decay) * g * g;
				});
				Zip::from(&mut param.value)
					.and(&state.m)
					.and(&state.v)
					.for_each(|value, &m, &v| {
						*value -= lr * m / (v.sqrt() + eps);
					});
			},
		}
	}
}

//--------------------------------------------------------------------------------------------------
