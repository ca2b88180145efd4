#![doc = include_str!("../README.md")]

pub mod backend;
pub mod convert;
pub mod error;
pub mod model;
pub mod task;
pub mod types;

pub use error::{EngineError, Result};
