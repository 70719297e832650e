use anyhow::ensure;
use tch::nn::{self, ModuleT};
use tch::Tensor;

use super::leaky_relu_with_slope;
use crate::config::ModelConfig;

pub mod micro_network;

pub use micro_network::{RpnNetwork, RpnOutput};
