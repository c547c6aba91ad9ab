//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// Prior tensors for the variational loss.
//
// One prior per registered mean tensor and one per variance-source tensor,
// in registry order. Without a prior file the means default to zero and
// the variance priors to 0.1 (a variance prior of exactly zero would make
// the loss denominators degenerate). A prior file is a safetensors archive
// with f32 entries named `m.{i}` / `sigma.{i}`; its entry count, shapes
// and dtype are validated against the registry, so a stale or reordered
// file fails fast instead of silently misaligning.

use std::path::Path;

use ndarray::ArrayD;
use safetensors::tensor::{Dtype, SafeTensors};

use crate::ErrPack;

use super::ModelError;
use super::meshnet::VariationalRegistry;

pub const DEFAULT_M_PRIOR: f32 = 0.0;
pub const DEFAULT_SIGMA_PRIOR: f32 = 0.1;

pub struct PriorSet {
	ms: Vec<ArrayD<f32>>,
	sigmas: Vec<ArrayD<f32>>,
}

impl PriorSet {
	/// Builds either the default priors or file-loaded priors.
	pub fn build(
		prior_path: Option<&Path>,
		registry: &VariationalRegistry,
	) -> Result<Self, ErrPack<ModelError>> {
		match prior_path {
			None => Ok(Self::defaults(registry)),
			Some(path) => Self::load(path, registry),
		}
	}

	pub fn defaults(registry: &VariationalRegistry) -> Self {
		let mut ms = Vec::with_capacity(registry.conv_count());
		let mut sigmas = Vec::with_capacity(registry.conv_count());
		for conv in registry.convs() {
			let shape = conv.m.borrow().shape().to_vec();
			ms.push(ArrayD::from_elem(shape.clone(), DEFAULT_M_PRIOR));
			sigmas.push(ArrayD::from_elem(shape, DEFAULT_SIGMA_PRIOR));
		}
		Self { ms, sigmas }
	}

	pub fn load(
		path: &Path,
		registry: &VariationalRegistry,
	) -> Result<Self, ErrPack<ModelError>> {
		let bytes = std::fs::read(path).map_err(|err| {
			ModelError::prior(format!("cannot read prior file {}: {err}", path.display()))
		})?;
		let st = SafeTensors::deserialize(&bytes).map_err(|err| {
			ModelError::prior(format!("cannot parse prior file {}: {err}", path.display()))
		})?;

		let n = registry.conv_count();
		if st.len() != 2 * n {
			return Err(ModelError::prior(format!(
				"prior file {} holds {} tensors, expected {} (m.i and sigma.i for {n} layers)",
				path.display(),
				st.len(),
				2 * n
			)));
		}

		let mut ms = Vec::with_capacity(n);
		let mut sigmas = Vec::with_capacity(n);
		for (i, conv) in registry.convs().iter().enumerate() {
			let shape = conv.m.borrow().shape().to_vec();
			ms.push(load_entry(&st, &format!("m.{i}"), &conv.scope, &shape)?);
			sigmas.push(load_entry(&st, &format!("sigma.{i}"), &conv.scope, &shape)?);
		}
		Ok(Self { ms, sigmas })
	}

	pub fn ms(&self) -> &[ArrayD<f32>] {
		&self.ms
	}

	pub fn sigmas(&self) -> &[ArrayD<f32>] {
		&self.sigmas
	}
}

fn load_entry(
	st: &SafeTensors,
	name: &str,
	scope: &str,
	expected_shape: &[usize],
) -> Result<ArrayD<f32>, ErrPack<ModelError>> {
	let view = st.tensor(name).map_err(|err| {
		ModelError::prior(format!("prior entry {name:?} (layer {scope}) is missing: {err}"))
	})?;
	if view.dtype() != Dtype::F32 {
		return Err(ModelError::prior(format!(
			"prior entry {name:?} (layer {scope}) has dtype {:?}, expected F32",
			view.dtype()
		)));
	}
	if view.shape() != expected_shape {
		return Err(ModelError::prior(format!(
			"prior entry {name:?} (layer {scope}) has shape {:?}, expected {expected_shape:?}",
			view.shape()
		)));
	}
	let data: Vec<f32> = view
		.data()
		.chunks_exact(4)
		.map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
		.collect();
	ArrayD::from_shape_vec(expected_shape.to_vec(), data).map_err(|err| {
		ModelError::prior(format!("prior entry {name:?} (layer {scope}) is malformed: {err}"))
	})
}

//--------------------------------------------------------------------------------------------------
