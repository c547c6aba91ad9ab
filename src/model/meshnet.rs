//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

// MeshNet with variational weights and concrete dropout.
//
//     Fedorov, Johnson, Damaraju, Ozerin, Calhoun, Plis:
//     End-to-end learning of brain tissue segmentation from imperfect
//     labeling. IJCNN 2017. https://arxiv.org/abs/1612.00940
//
// Seven 3x3x3 convolution blocks whose dilation rate first grows and then
// contracts, so the receptive field expands without any pooling, followed
// by a 1x1x1 classification convolution. Every convolution is variational
// (mean + variance-source kernel); every stack block carries concrete
// dropout. All distribution parameters are collected into an explicit
// registry, in construction order, for the prior manager and the loss.

use std::cell::RefCell;
use std::rc::Rc;

use ndarray::Array5;

use crate::ErrPack;
use crate::autograd::AutogradNode;
use crate::nn::layers::{ConcreteDropout, Relu, VwnConv3d};
use crate::nn::param::Param;
use crate::nn::Layer;
use crate::rng::Rng;
use crate::tensor::TensorOpError;

/// Per-layer dilation rates, applied isotropically.
pub const DILATION_RATES: [usize; 7] = [1, 1, 1, 2, 4, 8, 1];

//--------------------------------------------------------------------------------------------------

pub struct ConvVars {
	pub scope: String,
	pub m: Rc<RefCell<Param>>,
	pub sigma: Rc<RefCell<Param>>,
}

pub struct DropoutVars {
	pub scope: String,
	pub p_logit: Rc<RefCell<Param>>,
}

/// Ordered record of every variational quantity in the network.
///
/// Replaces implicit global collections: the assembler appends here in
/// construction order and hands the registry to the prior manager and the
/// loss assembler, which makes the alignment invariant checkable.
#[derive(Default)]
pub struct VariationalRegistry {
	convs: Vec<ConvVars>,
	dropouts: Vec<DropoutVars>,
}

impl VariationalRegistry {
	fn register_conv(&mut self, scope: String, m: Rc<RefCell<Param>>, sigma: Rc<RefCell<Param>>) {
		self.convs.push(ConvVars { scope, m, sigma });
	}

	fn register_dropout(&mut self, scope: String, p_logit: Rc<RefCell<Param>>) {
		self.dropouts.push(DropoutVars { scope, p_logit });
	}

	pub fn convs(&self) -> &[ConvVars] {
		&self.convs
	}

	pub fn dropouts(&self) -> &[DropoutVars] {
		&self.dropouts
	}

	pub fn conv_count(&self) -> usize {
		self.convs.len()
	}

	pub fn dropout_count(&self) -> usize {
		self.dropouts.len()
	}
}

fn scoped(prefix: &str, name: &str) -> String {
	if prefix.is_empty() {
		name.to_string()
	} else {
		format!("{prefix}.{name}")
	}
}

//--------------------------------------------------------------------------------------------------

/// One MeshNet block: variational convolution, concrete dropout, relu.
pub struct MeshLayer {
	scope: String,
	conv: VwnConv3d,
	dropout: ConcreteDropout,
	relu: Relu,
}

impl MeshLayer {
	#[allow(clippy::too_many_arguments)]
	fn new(
		layer_num: usize,
		in_channels: usize,
		filters: usize,
		dilation: usize,
		is_mc_b: bool,
		is_mc_g: bool,
		rng: Rc<RefCell<Rng>>,
		registry: &mut VariationalRegistry,
	) -> Self {
		let scope = format!("layer_{layer_num}");
		let conv = VwnConv3d::new(in_channels, filters, 3, dilation, is_mc_g, rng.clone());
		registry.register_conv(scope.clone(), conv.m(), conv.sigma());
		let dropout = ConcreteDropout::new(filters, is_mc_b, rng);
		registry.register_dropout(scope.clone(), dropout.p_logit());
		Self { scope, conv, dropout, relu: Relu }
	}

	pub fn dropout(&self) -> &ConcreteDropout {
		&self.dropout
	}
}

impl Layer for MeshLayer {
	fn collect_params(&self, f: &mut dyn FnMut(Rc<RefCell<Param>>)) {
		self.conv.collect_params(f);
		self.dropout.collect_params(f);
	}

	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		let scope = scoped(prefix, &self.scope);
		self.conv.collect_named_params(&scope, f);
		self.dropout.collect_named_params(&scope, f);
	}

	fn forward(&self, inp_node: AutogradNode) -> Result<AutogradNode, ErrPack<TensorOpError>> {
		let node = self.conv.forward(inp_node)?;
		let node = self.dropout.forward(node)?;
		self.relu.forward(node)
	}
}

//--------------------------------------------------------------------------------------------------

pub struct MeshNet {
	layers: Vec<MeshLayer>,
	logits: VwnConv3d,
	registry: VariationalRegistry,
	in_channels: usize,
	n_classes: usize,
}

impl MeshNet {
	pub fn new(
		in_channels: usize,
		n_classes: usize,
		n_filters: usize,
		is_mc: bool,
		rng: Rc<RefCell<Rng>>,
	) -> Self {
		let mut registry = VariationalRegistry::default();

		// The weight path always convolves with the mean kernel; only the
		// dropout units follow the monte-carlo flag.
		let is_mc_g = false;

		let mut layers = Vec::with_capacity(DILATION_RATES.len());
		let mut channels = in_channels;
		for (ii, &dilation) in DILATION_RATES.iter().enumerate() {
			layers.push(MeshLayer::new(
				ii + 1,
				channels,
				n_filters,
				dilation,
				is_mc,
				is_mc_g,
				rng.clone(),
				&mut registry,
			));
			channels = n_filters;
		}

		let logits = VwnConv3d::new(channels, n_classes, 1, 1, is_mc_g, rng);
		registry.register_conv("logits".to_string(), logits.m(), logits.sigma());

		Self {
			layers,
			logits,
			registry,
			in_channels,
			n_classes,
		}
	}

	pub fn registry(&self) -> &VariationalRegistry {
		&self.registry
	}

	pub fn in_channels(&self) -> usize {
		self.in_channels
	}

	pub fn n_classes(&self) -> usize {
		self.n_classes
	}

	/// Wraps a raw volume as a leaf node and runs the full stack.
	pub fn forward_volume(
		&self,
		volume: &Array5<f32>,
	) -> Result<AutogradNode, ErrPack<TensorOpError>> {
		let channels = volume.dim().4;
		if channels != self.in_channels {
			return Err(TensorOpError::shape_mismatch(format!(
				"network was built for {} input channels but the volume has {channels}",
				self.in_channels
			)));
		}
		self.forward(AutogradNode::new(volume.clone().into_dyn(), None))
	}

	/// Update actions of the individual units, composed for the controller.
	/// Runs after an optimizer step.
	pub fn post_step_updates(&self) {
		for layer in &self.layers {
			layer.dropout().clamp_logit();
		}
	}
}

impl Layer for MeshNet {
	fn collect_params(&self, f: &mut dyn FnMut(Rc<RefCell<Param>>)) {
		for layer in &self.layers {
			layer.collect_params(f);
		}
		self.logits.collect_params(f);
	}

	fn collect_named_params(&self, prefix: &str, f: &mut dyn FnMut(String, Rc<RefCell<Param>>)) {
		for layer in &self.layers {
			layer.collect_named_params(prefix, f);
		}
		self.logits.collect_named_params(&scoped(prefix, "logits"), f);
	}

	fn forward(&self, inp_node: AutogradNode) -> Result<AutogradNode, ErrPack<TensorOpError>> {
		let mut node = inp_node;
		for layer in &self.layers {
			node = layer.forward(node)?;
		}
		self.logits.forward(node)
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tensor::vol;

	fn rng() -> Rc<RefCell<Rng>> {
		Rc::new(RefCell::new(Rng::from_seed(201)))
	}

	#[test]
	fn registry_has_one_entry_per_unit() {
		let net = MeshNet::new(1, 2, 4, true, rng());
		// 7 stack layers + the logits layer
		assert_eq!(net.registry().conv_count(), 8);
		// only the stack layers carry dropout
		assert_eq!(net.registry().dropout_count(), 7);
		let scopes: Vec<&str> =
			net.registry().convs().iter().map(|c| c.scope.as_str()).collect();
		assert_eq!(
			scopes,
			["layer_1", "layer_2", "layer_3", "layer_4", "layer_5", "layer_6", "layer_7", "logits"]
		);
	}

	#[test]
	fn logits_keep_spatial_dims_and_set_class_channels() {
		let rng = rng();
		let net = MeshNet::new(1, 3, 4, false, rng.clone());
		let volume = vol(rng.borrow_mut().randn_array(&[1, 8, 8, 8, 1])).unwrap();
		let out = net.forward_volume(&volume).unwrap();
		assert_eq!(vol(out.value).unwrap().dim(), (1, 8, 8, 8, 3));
	}

	#[test]
	fn deterministic_network_is_repeatable() {
		let rng = rng();
		let net = MeshNet::new(1, 2, 2, false, rng.clone());
		let volume = vol(rng.borrow_mut().randn_array(&[1, 4, 4, 4, 1])).unwrap();
		let a = net.forward_volume(&volume).unwrap();
		let b = net.forward_volume(&volume).unwrap();
		assert_eq!(a.value, b.value);
	}

	#[test]
	fn channel_mismatch_is_rejected() {
		let rng = rng();
		let net = MeshNet::new(1, 2, 2, false, rng.clone());
		let volume = vol(rng.borrow_mut().randn_array(&[1, 4, 4, 4, 3])).unwrap();
		assert!(net.forward_volume(&volume).is_err());
	}

	#[test]
	fn named_params_follow_the_layer_scopes() {
		let net = MeshNet::new(1, 2, 2, true, rng());
		let names: Vec<String> =
			net.named_params("").into_iter().map(|(name, _)| name).collect();
		assert!(names.contains(&"layer_1.m".to_string()));
		assert!(names.contains(&"layer_7.p_logit".to_string()));
		assert!(names.contains(&"logits.sigma".to_string()));
		// 8 convs * 2 params + 7 dropout logits
		assert_eq!(names.len(), 23);
	}
}
