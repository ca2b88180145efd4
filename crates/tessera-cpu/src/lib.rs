#![doc = include_str!("../README.md")]

pub mod engine;
pub mod model;

pub use engine::{CPU_DEVICE, CpuEngine};
pub use model::{InputDescription, ModelDescription, Op, OutputDescription};
