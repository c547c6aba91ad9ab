//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

pub mod concrete_dropout;
pub mod relu;
pub mod vwn_conv;

pub use concrete_dropout::ConcreteDropout;
pub use relu::Relu;
pub use vwn_conv::VwnConv3d;
