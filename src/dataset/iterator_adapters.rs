pub mod batching;
pub mod shuffling;

pub use batching::*;
pub use shuffling::*;
