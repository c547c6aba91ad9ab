//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::ErrPack;
use crate::nn::optimizer::OptimizerError;
use crate::tensor::TensorOpError;

pub mod estimator;
pub mod loss;
pub mod meshnet;
pub mod prior;

pub use estimator::{EstimatorOptions, MeshNetEstimator, Mode, OptimizerSpec, Prediction};
pub use loss::LossReport;
pub use meshnet::{DILATION_RATES, MeshNet, VariationalRegistry};
pub use prior::PriorSet;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ModelError {
	Config,
	Prior,
	Tensor,
}

impl ModelError {
	#[cold]
	#[inline(never)]
	pub fn config(message: String) -> ErrPack<Self> {
		ErrPack::new(Self::Config, message)
	}

	#[cold]
	#[inline(never)]
	pub fn prior(message: String) -> ErrPack<Self> {
		ErrPack::new(Self::Prior, message)
	}
}

impl From<ErrPack<TensorOpError>> for ErrPack<ModelError> {
	fn from(err: ErrPack<TensorOpError>) -> Self {
		Self::nested(ModelError::Tensor, "tensor operation failed", Box::new(err))
	}
}

impl From<ErrPack<OptimizerError>> for ErrPack<ModelError> {
	fn from(err: ErrPack<OptimizerError>) -> Self {
		Self::nested(ModelError::Config, "invalid optimizer configuration", Box::new(err))
	}
}
