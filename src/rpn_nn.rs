use lazy_static::*;
use log::info;
use tch::{Device, Tensor};

pub mod anchor_targets;
pub mod anchors;
pub mod box_ops;
pub mod checkpoint;
pub mod helpers;
pub mod network;
pub mod proposals;
pub mod rpn_loss;
pub mod training;

lazy_static! {
    pub static ref DEVICE: Device = {
        if tch::Cuda::is_available() {
            info!("Using GPU");
            Device::Cuda(0)
        } else {
            info!("Using CPU");
            Device::Cpu
        }
    };
}

pub fn leaky_relu_with_slope(t1: &Tensor) -> Tensor {
    let t2 = t1 * 0.1;
    t1.maximum(&t2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaky_relu_keeps_a_tenth_of_negatives() {
        let out = leaky_relu_with_slope(&Tensor::from_slice(&[-2f32, 0., 3.]));
        let out: Vec<f32> = Vec::try_from(&out).unwrap();
        assert_eq!(out, vec![-0.2, 0., 3.]);
    }
}
