#![doc = include_str!("../README.md")]

#[cfg(feature = "ort-runtime")]
mod onnx;
#[cfg(not(feature = "ort-runtime"))]
#[path = "onnx_stub.rs"]
mod onnx;

pub use onnx::{ORT_CPU_DEVICE, OrtEngine};
