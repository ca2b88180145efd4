//! Inference engine contract: network loading, compilation and request
//! execution.
//!
//! The scheduler never touches an engine directly; it holds boxed trait
//! objects so the reference CPU engine and the ONNX Runtime engine are
//! interchangeable.  Teardown is `Drop` of the owning values.

use std::path::Path;

use crate::error::{BindingKind, EngineError, Result};
use crate::types::{DataType, Layout, PortDesc, Precision, TensorDesc};

// ─── Blobs ───────────────────────────────────────────────────────────────────

/// Read-only view of a request's bound buffer.
///
/// `dims` are NCHW regardless of `layout`.
#[derive(Debug)]
pub struct Blob<'a> {
    pub dims: [usize; 4],
    pub precision: Precision,
    pub layout: Layout,
    pub data: &'a [u8],
}

/// Writable view of a request's bound buffer.
#[derive(Debug)]
pub struct BlobMut<'a> {
    pub dims: [usize; 4],
    pub precision: Precision,
    pub layout: Layout,
    pub data: &'a mut [u8],
}

/// Bytes of one batch row for NCHW `dims`.
#[inline]
pub fn row_bytes(dims: &[usize; 4], precision: Precision) -> usize {
    dims[1] * dims[2] * dims[3] * precision.size()
}

impl Blob<'_> {
    pub fn desc(&self) -> Result<TensorDesc> {
        TensorDesc::from_nchw(self.dims, self.precision)
    }

    #[inline]
    pub fn row_bytes(&self) -> usize {
        row_bytes(&self.dims, self.precision)
    }
}

impl BlobMut<'_> {
    pub fn desc(&self) -> Result<TensorDesc> {
        TensorDesc::from_nchw(self.dims, self.precision)
    }

    #[inline]
    pub fn row_bytes(&self) -> usize {
        row_bytes(&self.dims, self.precision)
    }
}

// ─── Engine traits ───────────────────────────────────────────────────────────

/// Entry point of an inference backend.
pub trait InferenceEngine: Send + Sync + 'static {
    /// Short backend identifier (`"cpu"`, `"onnxruntime"`).
    fn name(&self) -> &str;

    /// Parse a model file into an uncompiled network.
    fn read_network(&self, path: &Path) -> Result<Box<dyn Network>>;

    /// Device names accepted by [`Network::compile`].
    fn available_devices(&self) -> Vec<String>;
}

/// An uncompiled network whose shape, layout and precision may still change.
pub trait Network: Send + Sync {
    fn name(&self) -> &str;
    fn inputs(&self) -> Vec<PortDesc>;
    fn outputs(&self) -> Vec<PortDesc>;

    /// Set the batch dimension of every input.
    fn reshape_batch(&mut self, batch: usize) -> Result<()>;

    /// Set the spatial size of one input.
    fn reshape_input(&mut self, name: &str, height: usize, width: usize) -> Result<()>;

    fn set_input_layout(&mut self, name: &str, layout: Layout) -> Result<()>;
    fn set_output_layout(&mut self, name: &str, layout: Layout) -> Result<()>;
    fn set_input_precision(&mut self, name: &str, precision: Precision) -> Result<()>;

    /// Compile for `device`.
    fn compile(&self, device: &str) -> Result<Box<dyn ExecutableNetwork>>;
}

/// A compiled network bound to one device.
pub trait ExecutableNetwork: Send + Sync {
    /// Create an execution handle with its own input/output buffers.
    fn create_request(&self) -> Result<Box<dyn InferRequest>>;
}

/// Completion callback for [`InferRequest::infer_async`].
///
/// Invoked exactly once, on an engine-owned thread, with the request handed
/// back and the run outcome.
pub type AsyncCompletion = Box<dyn FnOnce(Box<dyn InferRequest>, Result<()>) + Send + 'static>;

/// An async dispatch the engine refused; the request comes back untouched.
pub struct DispatchRejected {
    pub request: Box<dyn InferRequest>,
    pub error: EngineError,
}

impl std::fmt::Debug for DispatchRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// One reusable execution handle.
pub trait InferRequest: Send + 'static {
    fn input_blob(&mut self, name: &str) -> Result<BlobMut<'_>>;
    fn output_blob(&self, name: &str) -> Result<Blob<'_>>;

    /// Run to completion on the calling thread.
    fn infer(&mut self) -> Result<()>;

    /// Start a run and return immediately.
    ///
    /// On success the engine owns the request until `on_complete` hands it
    /// back.  On rejection the request is returned with the error and
    /// `on_complete` is dropped without being called.
    fn infer_async(
        self: Box<Self>,
        on_complete: AsyncCompletion,
    ) -> std::result::Result<(), DispatchRejected>;
}

// ─── Port lookup ─────────────────────────────────────────────────────────────

/// Space-separated port names, as listed in binding errors.
pub fn port_names(ports: &[PortDesc]) -> String {
    ports
        .iter()
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Find `name` among `ports`, or fail listing every available name.
pub fn find_port<'a>(ports: &'a [PortDesc], kind: BindingKind, name: &str) -> Result<&'a PortDesc> {
    ports
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| missing_binding(ports, kind, name))
}

pub fn missing_binding(ports: &[PortDesc], kind: BindingKind, name: &str) -> EngineError {
    EngineError::MissingBinding {
        kind,
        name: name.to_string(),
        available: port_names(ports),
    }
}

/// Element type of a port, rejecting precisions the scheduler cannot route.
pub fn port_dtype(port: &PortDesc) -> Result<DataType> {
    DataType::try_from(port.precision)
}
