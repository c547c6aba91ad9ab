//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// Smoke demo: assemble a small segmentation estimator, take a few training
// steps on random data, then run a prediction.

use ndarray::Array4;

use x17mesh::ErrPack;
use x17mesh::model::{EstimatorOptions, MeshNetEstimator, ModelError, OptimizerSpec};
use x17mesh::rng::Rng;
use x17mesh::tensor::vol;

fn main() -> Result<(), ErrPack<ModelError>> {
	stderrlog::new().verbosity(3).init().ok();

	let mut estimator = MeshNetEstimator::new(EstimatorOptions {
		n_classes: Some(2),
		optimizer: Some(OptimizerSpec::Name("Adam".to_string())),
		learning_rate: Some(1e-3),
		n_filters: Some(4),
		..EstimatorOptions::default()
	})?;

	let mut rng = Rng::from_seed(42);
	let volume = vol(rng.randn_array(&[1, 8, 8, 8, 1])).map_err(ErrPack::<ModelError>::from)?;
	let mut labels = Array4::<i64>::zeros((1, 8, 8, 8));
	labels.mapv_inplace(|_| i64::from(rng.get_uniform() > 0.5));

	for _ in 0..3 {
		let report = estimator.train_step(&volume, &labels)?;
		println!(
			"step {} loss {:.6} (nll {:.6}, l2 {:.3}, b_kld {:.3})",
			estimator.global_step(),
			report.loss,
			report.nll_loss,
			report.l2_loss,
			report.b_kld_loss,
		);
	}

	let prediction = estimator.predict(&volume)?;
	println!("class_ids: {:?}", prediction.class_ids.dim());
	println!("probabilities: {:?}", prediction.probabilities.dim());
	println!("logits: {:?}", prediction.logits.dim());

	Ok(())
}
