//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// The variational loss.
//
// Five scalar terms over the registry:
//
//     nll_loss           mean sparse softmax cross-entropy
//     l2_loss            sum (m - m_prior)^2 / (2 (sigma_prior^2 + EPS))
//     sigma_squared_loss sum sigma^2 / (2 (sigma_prior^2 + EPS))
//     log_sigma_loss     sum ln(sigma + EPS)
//     b_kld_loss         Bernoulli KL of the dropout probabilities
//                        against p_prior = 0.5
//
// Combined as
//
//     nll + (l2 + sigma_squared - log_sigma + b_kld) / n_examples
//
// in full variational mode, as `nll + l2 / n_examples` in deterministic
// mode, and as the plain squared-error calibration
// `mse_m + mse_sigmas` when only_kld is set.
//
// In train mode the assembler also accumulates the analytic gradient of
// every active regularization term straight into the parameter cells; the
// data-fit gradient is returned as the seed for the backward pass.

use ndarray::{Array4, Array5, ArrayD, Zip};

use crate::ErrPack;
use crate::tensor::TensorOpError;

use super::meshnet::VariationalRegistry;
use super::prior::PriorSet;

pub const EPS: f64 = 1e-8;
pub const EPS_P: f64 = 1e-7;
pub const P_PRIOR: f64 = 0.5;

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LossReport {
	pub nll_loss: f64,
	pub l2_loss: f64,
	pub sigma_squared_loss: f64,
	pub log_sigma_loss: f64,
	pub b_kld_loss: f64,
	pub n_examples: f64,
	pub mse_m_loss: Option<f64>,
	pub mse_sigmas_loss: Option<f64>,
	pub loss: f64,
}

impl LossReport {
	/// Emits every named scalar, mirroring the per-step summaries.
	pub fn emit(&self) {
		log::debug!("nll_loss = {}", self.nll_loss);
		log::debug!("l2_loss = {}", self.l2_loss);
		log::debug!("sigma_squared_loss = {}", self.sigma_squared_loss);
		log::debug!("log_sigma_loss = {}", self.log_sigma_loss);
		log::debug!("b_kld_loss = {}", self.b_kld_loss);
		log::debug!("n_examples = {}", self.n_examples);
		if let Some(mse_m_loss) = self.mse_m_loss {
			log::debug!("mse_m_loss = {mse_m_loss}");
		}
		if let Some(mse_sigmas_loss) = self.mse_sigmas_loss {
			log::debug!("mse_sigmas_loss = {mse_sigmas_loss}");
		}
		log::debug!("loss = {}", self.loss);
	}

	pub fn is_finite(&self) -> bool {
		self.loss.is_finite()
	}
}

//--------------------------------------------------------------------------------------------------

/// Mean sparse softmax cross-entropy and its gradient seed,
/// `(softmax - onehot) / n_positions`.
#[allow(clippy::indexing_slicing)]
fn sparse_softmax_cross_entropy(
	logits: &Array5<f32>,
	labels: &Array4<i64>,
) -> Result<(f64, Array5<f32>), ErrPack<TensorOpError>> {
	let (bn, zd, yd, xd, k) = logits.dim();
	if labels.dim() != (bn, zd, yd, xd) {
		return Err(TensorOpError::shape_mismatch(format!(
			"labels shape {:?} does not match logits positions {:?}",
			labels.dim(),
			(bn, zd, yd, xd)
		)));
	}

	let n_positions = (bn * zd * yd * xd) as f64;
	let mut nll = 0.0_f64;
	let mut d_logits = Array5::<f32>::zeros(logits.dim());
	for b in 0..bn {
		for z in 0..zd {
			for y in 0..yd {
				for x in 0..xd {
					let label = labels[[b, z, y, x]];
					if label < 0 || label as usize >= k {
						return Err(TensorOpError::invalid_value(format!(
							"label {label} is outside the class range 0..{k}"
						)));
					}
					let label = label as usize;

					let mut max = f32::NEG_INFINITY;
					for j in 0..k {
						max = max.max(logits[[b, z, y, x, j]]);
					}
					let mut sum = 0.0_f64;
					for j in 0..k {
						sum += f64::from((logits[[b, z, y, x, j]] - max).exp());
					}
					nll += sum.ln() + f64::from(max) - f64::from(logits[[b, z, y, x, label]]);

					for j in 0..k {
						let softmax =
							f64::from((logits[[b, z, y, x, j]] - max).exp()) / sum;
						let onehot = if j == label { 1.0 } else { 0.0 };
						d_logits[[b, z, y, x, j]] = ((softmax - onehot) / n_positions) as f32;
					}
				}
			}
		}
	}
	Ok((nll / n_positions, d_logits))
}

//--------------------------------------------------------------------------------------------------

/// Assembles the combined loss and, in train mode, the gradients.
///
/// With `accumulate_grads` set, the regularization gradients land in the
/// parameter cells and the returned array is the data-fit seed to feed
/// into the network's backward chain (absent in calibration mode, where
/// no data term exists).
#[allow(clippy::too_many_lines)]
pub fn assemble(
	logits: &Array5<f32>,
	labels: &Array4<i64>,
	registry: &VariationalRegistry,
	priors: &PriorSet,
	is_mc: bool,
	only_kld: bool,
	n_examples: f64,
	accumulate_grads: bool,
) -> Result<(LossReport, Option<Array5<f32>>), ErrPack<TensorOpError>> {
	if registry.conv_count() == 0 || registry.dropout_count() == 0 {
		return Err(TensorOpError::invalid_value(
			"cannot reduce loss terms over an empty registry".to_string(),
		));
	}
	if priors.ms().len() != registry.conv_count()
		|| priors.sigmas().len() != registry.conv_count()
	{
		return Err(TensorOpError::shape_mismatch(format!(
			"prior set holds {}/{} entries for {} registered convolutions",
			priors.ms().len(),
			priors.sigmas().len(),
			registry.conv_count()
		)));
	}

	let (nll_loss, d_logits) = sparse_softmax_cross_entropy(logits, labels)?;

	let mut l2_loss = 0.0_f64;
	let mut sigma_squared_loss = 0.0_f64;
	let mut log_sigma_loss = 0.0_f64;
	let mut mse_m_loss = 0.0_f64;
	let mut mse_sigmas_loss = 0.0_f64;

	for (conv, (m_prior, sigma_prior)) in registry
		.convs()
		.iter()
		.zip(priors.ms().iter().zip(priors.sigmas()))
	{
		let m = conv.m.borrow();
		let sigma = conv.sigma.borrow();

		Zip::from(m.value())
			.and(sigma.value())
			.and(m_prior)
			.and(sigma_prior)
			.for_each(|&m, &s, &mp, &sp| {
				let m = f64::from(m);
				let s = f64::from(s);
				let mp = f64::from(mp);
				let sp = f64::from(sp);
				let denom = 2.0 * (sp * sp + EPS);
				l2_loss += (m - mp).powi(2) / denom;
				sigma_squared_loss += s * s / denom;
				log_sigma_loss += (s + EPS).ln();
				if only_kld {
					mse_m_loss += (m - mp).powi(2);
					mse_sigmas_loss += (s - sp).powi(2);
				}
			});
	}

	let mut b_kld_loss = 0.0_f64;
	for dropout in registry.dropouts() {
		let p_logit = dropout.p_logit.borrow();
		for &logit in p_logit.value() {
			let p = f64::from(sigmoid(logit));
			b_kld_loss += p * ((p + EPS_P).ln() - P_PRIOR.ln())
				+ (1.0 - p) * ((1.0 - p + EPS_P).ln() - (1.0 - P_PRIOR).ln());
		}
	}

	let loss = if only_kld {
		mse_m_loss + mse_sigmas_loss
	} else if is_mc {
		nll_loss + (l2_loss + sigma_squared_loss - log_sigma_loss + b_kld_loss) / n_examples
	} else {
		nll_loss + l2_loss / n_examples
	};

	if accumulate_grads {
		accumulate_reg_grads(registry, priors, is_mc, only_kld, n_examples)?;
	}

	let report = LossReport {
		nll_loss,
		l2_loss,
		sigma_squared_loss,
		log_sigma_loss,
		b_kld_loss,
		n_examples,
		mse_m_loss: only_kld.then_some(mse_m_loss),
		mse_sigmas_loss: only_kld.then_some(mse_sigmas_loss),
		loss,
	};

	let d_logits = (accumulate_grads && !only_kld).then_some(d_logits);
	Ok((report, d_logits))
}

/// Analytic gradients of the active regularization terms, with the same
/// `1 / n_examples` scaling the combined loss applies.
fn accumulate_reg_grads(
	registry: &VariationalRegistry,
	priors: &PriorSet,
	is_mc: bool,
	only_kld: bool,
	n_examples: f64,
) -> Result<(), ErrPack<TensorOpError>> {
	let scale = (1.0 / n_examples) as f32;

	for (conv, (m_prior, sigma_prior)) in registry
		.convs()
		.iter()
		.zip(priors.ms().iter().zip(priors.sigmas()))
	{
		let d_m: ArrayD<f32> = if only_kld {
			Zip::from(conv.m.borrow().value())
				.and(m_prior)
				.map_collect(|&m, &mp| 2.0 * (m - mp))
		} else {
			Zip::from(conv.m.borrow().value())
				.and(m_prior)
				.and(sigma_prior)
				.map_collect(|&m, &mp, &sp| {
					let denom = (f64::from(sp).powi(2) + EPS) as f32;
					scale * (m - mp) / denom
				})
		};
		conv.m.borrow_mut().acc_grad(d_m)?;

		if only_kld {
			let d_sigma: ArrayD<f32> = Zip::from(conv.sigma.borrow().value())
				.and(sigma_prior)
				.map_collect(|&s, &sp| 2.0 * (s - sp));
			conv.sigma.borrow_mut().acc_grad(d_sigma)?;
		} else if is_mc {
			// d/ds of sigma^2 / (2 (sp^2 + EPS)) - ln(s + EPS)
			let d_sigma: ArrayD<f32> = Zip::from(conv.sigma.borrow().value())
				.and(sigma_prior)
				.map_collect(|&s, &sp| {
					let denom = (f64::from(sp).powi(2) + EPS) as f32;
					scale * (s / denom - 1.0 / (s + EPS as f32))
				});
			conv.sigma.borrow_mut().acc_grad(d_sigma)?;
		}
	}

	// The Bernoulli KL only enters the combined loss in full variational mode.
	if !only_kld && is_mc {
		for dropout in registry.dropouts() {
			let d_logit: ArrayD<f32> =
				dropout.p_logit.borrow().value().mapv(|logit| {
					let p = f64::from(sigmoid(logit));
					let d_p = (p + EPS_P).ln() - (1.0 - p + EPS_P).ln() + p / (p + EPS_P)
						- (1.0 - p) / (1.0 - p + EPS_P);
					(d_p * p * (1.0 - p) / n_examples) as f32
				});
			dropout.p_logit.borrow_mut().acc_grad(d_logit)?;
		}
	}

	Ok(())
}

fn sigmoid(x: f32) -> f32 {
	1.0 / (1.0 + (-x).exp())
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::rc::Rc;

	use assert_approx_eq::assert_approx_eq;
	use ndarray::Array4;

	use super::*;
	use crate::model::meshnet::MeshNet;
	use crate::rng::Rng;
	use crate::tensor::vol;

	fn fixture(is_mc: bool) -> (MeshNet, Array5<f32>, Array4<i64>) {
		let rng = Rc::new(RefCell::new(Rng::from_seed(41)));
		let net = MeshNet::new(1, 2, 2, is_mc, rng.clone());
		let volume = vol(rng.borrow_mut().randn_array(&[1, 4, 4, 4, 1])).unwrap();
		let mut labels = Array4::<i64>::zeros((1, 4, 4, 4));
		labels.mapv_inplace(|_| i64::from(rng.borrow_mut().get_uniform() > 0.5));
		(net, volume, labels)
	}

	#[test]
	fn cross_entropy_of_uniform_logits_is_ln_k() {
		let logits = Array5::<f32>::zeros((1, 1, 1, 1, 2));
		let labels = Array4::<i64>::zeros((1, 1, 1, 1));
		let (nll, d) = sparse_softmax_cross_entropy(&logits, &labels).unwrap();
		assert_approx_eq!(nll, 2.0_f64.ln(), 1e-6);
		assert_approx_eq!(f64::from(d[[0, 0, 0, 0, 0]]), -0.5, 1e-6);
		assert_approx_eq!(f64::from(d[[0, 0, 0, 0, 1]]), 0.5, 1e-6);
	}

	#[test]
	fn cross_entropy_rejects_out_of_range_labels() {
		let logits = Array5::<f32>::zeros((1, 1, 1, 1, 2));
		let mut labels = Array4::<i64>::zeros((1, 1, 1, 1));
		labels[[0, 0, 0, 0]] = 5;
		assert!(sparse_softmax_cross_entropy(&logits, &labels).is_err());
	}

	#[test]
	fn deterministic_mode_is_nll_plus_scaled_l2() {
		let (net, volume, labels) = fixture(false);
		let logits = vol(net.forward_volume(&volume).unwrap().value).unwrap();
		let priors = PriorSet::defaults(net.registry());

		let n_examples = 4.0;
		let (report, _) = assemble(
			&logits,
			&labels,
			net.registry(),
			&priors,
			false,
			false,
			n_examples,
			false,
		)
		.unwrap();

		// l2 against zero-mean, 0.1-sigma priors, computed independently
		let mut expected_l2 = 0.0_f64;
		for conv in net.registry().convs() {
			for &m in conv.m.borrow().value() {
				expected_l2 += f64::from(m).powi(2) / (2.0 * (0.01 + EPS));
			}
		}
		assert_approx_eq!(report.l2_loss, expected_l2, expected_l2.abs() * 1e-6);
		assert_approx_eq!(report.loss, report.nll_loss + report.l2_loss / n_examples, 1e-9);
		assert!(report.mse_m_loss.is_none());
	}

	#[test]
	fn full_variational_mode_combines_all_terms() {
		let (net, volume, labels) = fixture(true);
		let logits = vol(net.forward_volume(&volume).unwrap().value).unwrap();
		let priors = PriorSet::defaults(net.registry());

		let (report, _) = assemble(
			&logits,
			&labels,
			net.registry(),
			&priors,
			true,
			false,
			2.0,
			false,
		)
		.unwrap();

		assert!(report.is_finite());
		let expected = report.nll_loss
			+ (report.l2_loss + report.sigma_squared_loss - report.log_sigma_loss
				+ report.b_kld_loss)
				/ 2.0;
		assert_approx_eq!(report.loss, expected, 1e-9);
	}

	#[test]
	fn calibration_mode_ignores_the_data_term() {
		for is_mc in [false, true] {
			let (net, volume, labels) = fixture(is_mc);
			let logits = vol(net.forward_volume(&volume).unwrap().value).unwrap();
			let priors = PriorSet::defaults(net.registry());

			let (report, d_logits) = assemble(
				&logits,
				&labels,
				net.registry(),
				&priors,
				is_mc,
				true,
				1.0,
				true,
			)
			.unwrap();

			let mse_m = report.mse_m_loss.unwrap();
			let mse_sigmas = report.mse_sigmas_loss.unwrap();
			assert_approx_eq!(report.loss, mse_m + mse_sigmas, 1e-9);
			// no data-fit seed in calibration mode
			assert!(d_logits.is_none());
		}
	}

	#[test]
	fn dropout_prior_of_one_half_zeroes_the_bernoulli_kl() {
		let (net, volume, labels) = fixture(true);
		for dropout in net.registry().dropouts() {
			dropout.p_logit.borrow_mut().value_mut().fill(0.0); // p = 0.5
		}
		let logits = vol(net.forward_volume(&volume).unwrap().value).unwrap();
		let priors = PriorSet::defaults(net.registry());
		let (report, _) = assemble(
			&logits,
			&labels,
			net.registry(),
			&priors,
			true,
			false,
			1.0,
			false,
		)
		.unwrap();
		assert!(report.b_kld_loss.abs() < 1e-4);
	}

	#[test]
	fn calibration_gradient_is_twice_the_deviation() {
		let (net, volume, labels) = fixture(false);
		let logits = vol(net.forward_volume(&volume).unwrap().value).unwrap();
		let priors = PriorSet::defaults(net.registry());

		assemble(&logits, &labels, net.registry(), &priors, false, true, 1.0, true).unwrap();

		let conv = &net.registry().convs()[0];
		let m = conv.m.borrow();
		let grad = m.grad().unwrap();
		for (&g, &v) in grad.iter().zip(m.value()) {
			assert_approx_eq!(f64::from(g), 2.0 * f64::from(v), 1e-5);
		}
		// sigma starts at the default prior value, so its mse gradient vanishes
		let sigma = conv.sigma.borrow();
		for &g in sigma.grad().unwrap() {
			assert!(g.abs() < 1e-6);
		}
	}
}
