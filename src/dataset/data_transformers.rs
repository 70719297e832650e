pub mod gtsdb;
pub mod img2tensor;
