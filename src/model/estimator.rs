//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// The model controller.
//
// Predict / evaluate / train are distinct entry points sharing the network
// assembly. The parameter cells live in the estimator and persist across
// invocations; every invocation re-runs the forward graph with a noise
// stream derived from `(seed, global_step)`, so repeated evaluations at
// the same step are bit-identical.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use ndarray::{Array4, Array5};

use crate::ErrPack;
use crate::autograd::Autograd;
use crate::nn::Layer;
use crate::nn::optimizer::Optimizer;
use crate::rng::Rng;
use crate::tensor::{argmax_last_axis, softmax_last_axis, vol, TensorOpError};

use super::loss::{self, LossReport};
use super::meshnet::MeshNet;
use super::prior::PriorSet;
use super::ModelError;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
	Predict,
	Evaluate,
	Train,
}

/// Parses the stringly-typed `is_mc` configuration value.
pub fn str2bool(value: &str) -> Result<bool, ErrPack<ModelError>> {
	match value {
		"True" | "true" | "TRUE" | "1" => Ok(true),
		"False" | "false" | "FALSE" | "0" => Ok(false),
		_ => Err(ModelError::config(format!(
			"cannot interpret {value:?} as a boolean, expected \"True\" or \"False\""
		))),
	}
}

//--------------------------------------------------------------------------------------------------

/// An optimizer instance, or a name to resolve one from.
pub enum OptimizerSpec {
	Instance(Optimizer),
	Name(String),
}

/// Configuration surface of the estimator.
pub struct EstimatorOptions {
	pub n_classes: Option<usize>,
	pub optimizer: Option<OptimizerSpec>,
	/// required when the optimizer is given by name
	pub learning_rate: Option<f64>,
	pub n_filters: Option<usize>,
	/// scale factor dividing the regularization terms
	pub n_examples: f64,
	pub prior_path: Option<PathBuf>,
	/// reserved; carried in the params bundle but not consumed
	pub n_prior_samples: f64,
	pub only_kld: bool,
	pub is_mc: String,
	pub multi_gpu: bool,
	pub seed: u64,
}

impl Default for EstimatorOptions {
	fn default() -> Self {
		Self {
			n_classes: None,
			optimizer: None,
			learning_rate: None,
			n_filters: None,
			n_examples: 1.0,
			prior_path: None,
			n_prior_samples: 1.0,
			only_kld: false,
			is_mc: "True".to_string(),
			multi_gpu: false,
			seed: 0x_5eed_0000_0000_0001,
		}
	}
}

/// Validated params bundle handed to the model-level code.
pub struct ModelParams {
	pub n_classes: usize,
	pub n_filters: Option<usize>,
	pub n_examples: f64,
	pub prior_path: Option<PathBuf>,
	pub n_prior_samples: f64,
	pub only_kld: bool,
	pub is_mc: bool,
	pub seed: u64,
}

impl ModelParams {
	/// Fallback used when the model is built without the controller.
	pub const DEFAULT_N_FILTERS: usize = 96;

	pub fn n_filters(&self) -> usize {
		self.n_filters.unwrap_or(Self::DEFAULT_N_FILTERS)
	}
}

//--------------------------------------------------------------------------------------------------

pub struct Prediction {
	pub class_ids: Array4<i64>,
	pub probabilities: Array5<f32>,
	pub logits: Array5<f32>,
}

pub struct MeshNetEstimator {
	params: ModelParams,
	optimizer: Option<Optimizer>,
	model: Option<MeshNet>,
	priors: Option<PriorSet>,
	rng: Rc<RefCell<Rng>>,
	global_step: u64,
}

impl MeshNetEstimator {
	/// The controller's own filter default. The model-level fallback is
	/// [`ModelParams::DEFAULT_N_FILTERS`]; the two values differ on purpose.
	pub const DEFAULT_N_FILTERS: usize = 64;

	pub fn new(options: EstimatorOptions) -> Result<Self, ErrPack<ModelError>> {
		let Some(n_classes) = options.n_classes else {
			return Err(ModelError::config("n_classes is required".to_string()));
		};

		let optimizer = match options.optimizer {
			Some(OptimizerSpec::Instance(optimizer)) => Some(optimizer),
			Some(OptimizerSpec::Name(name)) => {
				Some(Optimizer::from_name(&name, options.learning_rate)?)
			},
			None => None,
		};

		if options.multi_gpu {
			log::warn!("multi_gpu replication is not supported; running on a single device");
		}

		let params = ModelParams {
			n_classes,
			n_filters: Some(options.n_filters.unwrap_or(Self::DEFAULT_N_FILTERS)),
			n_examples: options.n_examples,
			prior_path: options.prior_path,
			n_prior_samples: options.n_prior_samples,
			only_kld: options.only_kld,
			is_mc: str2bool(&options.is_mc)?,
			seed: options.seed,
		};

		log::debug!(
			"Parameters for model: n_classes={} n_filters={} n_examples={} only_kld={} is_mc={} prior_path={:?}",
			params.n_classes,
			params.n_filters(),
			params.n_examples,
			params.only_kld,
			params.is_mc,
			params.prior_path,
		);

		let rng = Rc::new(RefCell::new(Rng::from_seed(params.seed)));
		Ok(Self {
			params,
			optimizer,
			model: None,
			priors: None,
			rng,
			global_step: 0,
		})
	}

	pub fn params(&self) -> &ModelParams {
		&self.params
	}

	pub fn global_step(&self) -> u64 {
		self.global_step
	}

	pub fn model(&self) -> Option<&MeshNet> {
		self.model.as_ref()
	}

	fn model_ref(&self) -> Result<&MeshNet, ErrPack<ModelError>> {
		self.model
			.as_ref()
			.ok_or_else(|| ModelError::config("model has not been assembled yet".to_string()))
	}

	fn priors_ref(&self) -> Result<&PriorSet, ErrPack<ModelError>> {
		self.priors
			.as_ref()
			.ok_or_else(|| ModelError::config("priors have not been built yet".to_string()))
	}

	/// Assembles the network on first use; later calls only re-check the
	/// input channel count.
	fn build_model(&mut self, in_channels: usize) -> Result<(), ErrPack<ModelError>> {
		if let Some(model) = &self.model {
			if model.in_channels() != in_channels {
				return Err(TensorOpError::shape_mismatch(format!(
					"estimator was assembled for {} input channels but the volume has {in_channels}",
					model.in_channels()
				))
				.into());
			}
			return Ok(());
		}

		// parameter initializers draw from the seed stream
		*self.rng.borrow_mut() = Rng::from_seed(self.params.seed);
		let model = MeshNet::new(
			in_channels,
			self.params.n_classes,
			self.params.n_filters(),
			self.params.is_mc,
			self.rng.clone(),
		);
		self.model = Some(model);
		Ok(())
	}

	/// Prior tensors are built once, after the registry is complete.
	fn ensure_priors(&mut self) -> Result<(), ErrPack<ModelError>> {
		if self.priors.is_some() {
			return Ok(());
		}
		let priors = {
			let model = self.model_ref()?;
			PriorSet::build(self.params.prior_path.as_deref(), model.registry())?
		};
		self.priors = Some(priors);
		Ok(())
	}

	/// The forward noise stream is a pure function of `(seed, global_step)`.
	fn reseed(&self) {
		let step_mix = self.global_step.wrapping_mul(0x_9e37_79b9_7f4a_7c15);
		*self.rng.borrow_mut() = Rng::from_seed(self.params.seed ^ step_mix);
	}

	pub fn predict(&mut self, volume: &Array5<f32>) -> Result<Prediction, ErrPack<ModelError>> {
		log::debug!("building {:?} graph", Mode::Predict);
		self.build_model(volume.dim().4)?;
		self.reseed();

		let node = self.model_ref()?.forward_volume(volume)?;
		let logits = vol(node.value).map_err(ErrPack::<ModelError>::from)?;
		Ok(Prediction {
			class_ids: argmax_last_axis(&logits),
			probabilities: softmax_last_axis(&logits),
			logits,
		})
	}

	pub fn evaluate(
		&mut self,
		volume: &Array5<f32>,
		labels: &Array4<i64>,
	) -> Result<LossReport, ErrPack<ModelError>> {
		self.run(Mode::Evaluate, volume, labels)
	}

	pub fn train_step(
		&mut self,
		volume: &Array5<f32>,
		labels: &Array4<i64>,
	) -> Result<LossReport, ErrPack<ModelError>> {
		if self.optimizer.is_none() {
			return Err(ModelError::config(
				"an optimizer is required for train mode".to_string(),
			));
		}
		self.run(Mode::Train, volume, labels)
	}

	fn run(
		&mut self,
		mode: Mode,
		volume: &Array5<f32>,
		labels: &Array4<i64>,
	) -> Result<LossReport, ErrPack<ModelError>> {
		log::debug!("building {mode:?} graph");
		self.build_model(volume.dim().4)?;
		self.ensure_priors()?;
		self.reseed();

		let train = mode == Mode::Train;
		let model = self.model_ref()?;
		let priors = self.priors_ref()?;

		if train {
			for param in model.params() {
				param.borrow_mut().zero_grad();
			}
		}

		let node = model.forward_volume(volume)?;
		let (logits, backward_fn) = node.take();
		let logits = vol(logits).map_err(ErrPack::<ModelError>::from)?;

		let (report, d_logits) = loss::assemble(
			&logits,
			labels,
			model.registry(),
			priors,
			self.params.is_mc,
			self.params.only_kld,
			self.params.n_examples,
			train,
		)?;
		report.emit();

		if train {
			if let Some(d_logits) = d_logits {
				Autograd::run(backward_fn, d_logits.into_dyn())
					.map_err(ErrPack::<ModelError>::from)?;
			}
			let optimizer = self
				.optimizer
				.as_ref()
				.ok_or_else(|| ModelError::config("optimizer disappeared".to_string()))?;
			for param in model.params() {
				optimizer.step(&mut param.borrow_mut());
			}
			model.post_step_updates();
			self.global_step += 1;
		}

		Ok(report)
	}
}

//--------------------------------------------------------------------------------------------------
