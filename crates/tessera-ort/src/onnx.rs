//! ONNX Runtime engine (CPU execution provider).
//!
//! # Shapes
//!
//! ONNX models are natively NCHW.  Request buffers follow the layout and
//! precision negotiated on the [`Network`]; conversion to the session's own
//! NCHW tensors happens per run.  Dynamic input dimensions must be pinned
//! by reshaping before compile, except batch which falls back to 1.  Output
//! shapes are learned from one zero-filled warm-up run at compile time.
//!
//! # Threading
//!
//! Each request owns its own `Session`.  Async runs are executed by one
//! dispatcher thread per compiled network, in submission order.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};
use tracing::{debug, info};

use tessera_core::backend::{
    AsyncCompletion, Blob, BlobMut, DispatchRejected, ExecutableNetwork, InferRequest,
    InferenceEngine, Network, missing_binding,
};
use tessera_core::error::{BindingKind, EngineError, Result};
use tessera_core::types::{Layout, PortDesc, Precision};

/// Device name accepted by [`Network::compile`].
pub const ORT_CPU_DEVICE: &str = "CPU";

fn ort_error(context: &'static str) -> impl Fn(ort::Error) -> EngineError {
    move |e| EngineError::Inference(format!("{context}: {e}"))
}

fn open_session(path: &Path) -> Result<Session> {
    fn build(path: &Path) -> ort::Result<Session> {
        Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(path)
    }
    build(path).map_err(|e| EngineError::ModelRead(format!("{}: {e}", path.display())))
}

fn precision_of(ty: TensorElementType) -> Result<Precision> {
    match ty {
        TensorElementType::Float32 => Ok(Precision::Fp32),
        TensorElementType::Uint8 => Ok(Precision::U8),
        other => Err(EngineError::UnsupportedPrecision(format!("{other:?}"))),
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct OrtEngine;

impl OrtEngine {
    pub fn new() -> Self {
        Self
    }
}

impl InferenceEngine for OrtEngine {
    fn name(&self) -> &str {
        "onnxruntime"
    }

    fn read_network(&self, path: &Path) -> Result<Box<dyn Network>> {
        let session = open_session(path)?;
        let mut inputs = Vec::new();
        for input in session.inputs() {
            let (shape, ty) = match input.dtype() {
                ValueType::Tensor { shape, ty, .. } => (shape.clone(), *ty),
                other => {
                    return Err(EngineError::ModelRead(format!(
                        "input \"{}\" is not a tensor: {other:?}",
                        input.name()
                    )));
                }
            };
            if shape.len() != 4 {
                return Err(EngineError::ModelRead(format!(
                    "input \"{}\" must be 4D (NCHW), got {}D",
                    input.name(),
                    shape.len()
                )));
            }
            inputs.push(Port {
                name: input.name().to_string(),
                shape: [shape[0], shape[1], shape[2], shape[3]],
                model_precision: precision_of(ty)?,
                precision: precision_of(ty)?,
                layout: Layout::Nchw,
            });
        }
        let mut outputs = Vec::new();
        for output in session.outputs() {
            let ty = match output.dtype() {
                ValueType::Tensor { ty, .. } => *ty,
                other => {
                    return Err(EngineError::ModelRead(format!(
                        "output \"{}\" is not a tensor: {other:?}",
                        output.name()
                    )));
                }
            };
            outputs.push((output.name().to_string(), precision_of(ty)?, Layout::Nchw));
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".into());
        debug!(model = %name, inputs = inputs.len(), outputs = outputs.len(), "ONNX network parsed");
        Ok(Box::new(OrtNetwork {
            name,
            path: path.to_path_buf(),
            inputs,
            outputs,
        }))
    }

    fn available_devices(&self) -> Vec<String> {
        vec![ORT_CPU_DEVICE.to_string()]
    }
}

// ─── Network ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct Port {
    name: String,
    /// Model shape; `-1` for dynamic dimensions.
    shape: [i64; 4],
    model_precision: Precision,
    precision: Precision,
    layout: Layout,
}

impl Port {
    fn dims(&self) -> [usize; 4] {
        self.shape.map(|d| usize::try_from(d).unwrap_or(0))
    }

    fn desc(&self) -> PortDesc {
        PortDesc {
            name: self.name.clone(),
            dims: self.dims(),
            precision: self.precision,
        }
    }

    fn set(&mut self, axis: usize, value: usize) -> Result<()> {
        let current = self.shape[axis];
        let value = i64::try_from(value)
            .map_err(|_| EngineError::DimensionMismatch(format!("{value} overflows")))?;
        if current >= 0 && current != value {
            return Err(EngineError::UnsupportedFeature(format!(
                "input \"{}\" has a fixed dimension {axis} of {current}, cannot reshape to {value}",
                self.name
            )));
        }
        self.shape[axis] = value;
        Ok(())
    }
}

#[derive(Debug)]
struct OrtNetwork {
    name: String,
    path: PathBuf,
    inputs: Vec<Port>,
    outputs: Vec<(String, Precision, Layout)>,
}

impl OrtNetwork {
    fn input_mut(&mut self, name: &str) -> Result<&mut Port> {
        match self.inputs.iter().position(|p| p.name == name) {
            Some(i) => Ok(&mut self.inputs[i]),
            None => Err(missing_binding(&self.inputs(), BindingKind::Input, name)),
        }
    }
}

impl Network for OrtNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<PortDesc> {
        self.inputs.iter().map(Port::desc).collect()
    }

    /// Output dims are unknown before compile and reported as zeros.
    fn outputs(&self) -> Vec<PortDesc> {
        self.outputs
            .iter()
            .map(|(name, precision, _)| PortDesc {
                name: name.clone(),
                dims: [0; 4],
                precision: *precision,
            })
            .collect()
    }

    fn reshape_batch(&mut self, batch: usize) -> Result<()> {
        for port in &mut self.inputs {
            port.set(0, batch)?;
        }
        Ok(())
    }

    fn reshape_input(&mut self, name: &str, height: usize, width: usize) -> Result<()> {
        let port = self.input_mut(name)?;
        port.set(2, height)?;
        port.set(3, width)
    }

    fn set_input_layout(&mut self, name: &str, layout: Layout) -> Result<()> {
        self.input_mut(name)?.layout = layout;
        Ok(())
    }

    fn set_output_layout(&mut self, name: &str, layout: Layout) -> Result<()> {
        match self.outputs.iter_mut().find(|(n, _, _)| n == name) {
            Some((_, _, l)) => {
                *l = layout;
                Ok(())
            }
            None => Err(missing_binding(&self.outputs(), BindingKind::Output, name)),
        }
    }

    fn set_input_precision(&mut self, name: &str, precision: Precision) -> Result<()> {
        if !matches!(precision, Precision::Fp32 | Precision::U8) {
            return Err(EngineError::UnsupportedPrecision(format!("{precision:?}")));
        }
        self.input_mut(name)?.precision = precision;
        Ok(())
    }

    fn compile(&self, device: &str) -> Result<Box<dyn ExecutableNetwork>> {
        if device != ORT_CPU_DEVICE {
            return Err(EngineError::Compile(format!("unknown device \"{device}\"")));
        }
        let mut inputs = self.inputs.clone();
        for port in &mut inputs {
            if port.shape[0] < 0 {
                port.shape[0] = 1;
            }
            if port.shape.iter().any(|&d| d < 0) {
                return Err(EngineError::Compile(format!(
                    "input \"{}\" still has dynamic dimensions {:?}; reshape before compile",
                    port.name, port.shape
                )));
            }
        }

        // Warm-up run to learn output shapes.
        let mut session =
            open_session(&self.path).map_err(|e| EngineError::Compile(e.to_string()))?;
        let zeros: Vec<Vec<u8>> = inputs
            .iter()
            .map(|p| vec![0u8; tensor_bytes(&p.dims(), p.precision)])
            .collect();
        let shapes = run_session(&mut session, &inputs, &zeros, &[])?;
        let mut outputs = Vec::with_capacity(self.outputs.len());
        for ((name, precision, layout), shape) in self.outputs.iter().zip(shapes) {
            outputs.push(OutPort {
                name: name.clone(),
                dims: shape,
                precision: *precision,
                layout: *layout,
            });
        }

        let dispatcher = Dispatcher::start(&self.name)?;
        info!(model = %self.name, device, "ONNX network compiled");
        Ok(Box::new(OrtExecutable {
            model: Arc::new(Compiled {
                name: self.name.clone(),
                path: self.path.clone(),
                inputs,
                outputs,
            }),
            dispatcher,
        }))
    }
}

// ─── Executable network & requests ───────────────────────────────────────────

#[derive(Clone, Debug)]
struct OutPort {
    name: String,
    dims: [usize; 4],
    precision: Precision,
    layout: Layout,
}

impl OutPort {
    fn desc(&self) -> PortDesc {
        PortDesc {
            name: self.name.clone(),
            dims: self.dims,
            precision: self.precision,
        }
    }
}

#[derive(Debug)]
struct Compiled {
    name: String,
    path: PathBuf,
    inputs: Vec<Port>,
    outputs: Vec<OutPort>,
}

struct Job {
    request: Box<OrtRequest>,
    on_complete: AsyncCompletion,
}

struct Dispatcher {
    tx: Sender<Job>,
}

impl Dispatcher {
    fn start(model: &str) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name(format!("tessera-ort-{model}"))
            .spawn(move || {
                while let Ok(Job {
                    mut request,
                    on_complete,
                }) = rx.recv()
                {
                    let outcome = request.infer();
                    on_complete(request, outcome);
                }
            })
            .map_err(|e| EngineError::Compile(format!("spawn ONNX dispatcher: {e}")))?;
        Ok(Arc::new(Self { tx }))
    }
}

struct OrtExecutable {
    model: Arc<Compiled>,
    dispatcher: Arc<Dispatcher>,
}

impl ExecutableNetwork for OrtExecutable {
    fn create_request(&self) -> Result<Box<dyn InferRequest>> {
        let session = open_session(&self.model.path)?;
        Ok(Box::new(OrtRequest {
            inputs: self
                .model
                .inputs
                .iter()
                .map(|p| vec![0u8; tensor_bytes(&p.dims(), p.precision)])
                .collect(),
            outputs: self
                .model
                .outputs
                .iter()
                .map(|p| vec![0u8; tensor_bytes(&p.dims, p.precision)])
                .collect(),
            session,
            model: Arc::clone(&self.model),
            dispatcher: Arc::clone(&self.dispatcher),
        }))
    }
}

struct OrtRequest {
    model: Arc<Compiled>,
    session: Session,
    inputs: Vec<Vec<u8>>,
    outputs: Vec<Vec<u8>>,
    dispatcher: Arc<Dispatcher>,
}

impl InferRequest for OrtRequest {
    fn input_blob(&mut self, name: &str) -> Result<BlobMut<'_>> {
        let Some(i) = self.model.inputs.iter().position(|p| p.name == name) else {
            let descs: Vec<_> = self.model.inputs.iter().map(Port::desc).collect();
            return Err(missing_binding(&descs, BindingKind::Input, name));
        };
        let port = &self.model.inputs[i];
        Ok(BlobMut {
            dims: port.dims(),
            precision: port.precision,
            layout: port.layout,
            data: &mut self.inputs[i],
        })
    }

    fn output_blob(&self, name: &str) -> Result<Blob<'_>> {
        let Some(i) = self.model.outputs.iter().position(|p| p.name == name) else {
            let descs: Vec<_> = self.model.outputs.iter().map(OutPort::desc).collect();
            return Err(missing_binding(&descs, BindingKind::Output, name));
        };
        let port = &self.model.outputs[i];
        Ok(Blob {
            dims: port.dims,
            precision: port.precision,
            layout: port.layout,
            data: &self.outputs[i],
        })
    }

    fn infer(&mut self) -> Result<()> {
        let model = Arc::clone(&self.model);
        let mut sinks: Vec<Sink<'_>> = model
            .outputs
            .iter()
            .zip(self.outputs.iter_mut())
            .map(|(port, buffer)| Sink { port, buffer })
            .collect();
        run_session(&mut self.session, &model.inputs, &self.inputs, &mut sinks)?;
        Ok(())
    }

    fn infer_async(
        self: Box<Self>,
        on_complete: AsyncCompletion,
    ) -> std::result::Result<(), DispatchRejected> {
        let tx = self.dispatcher.tx.clone();
        tx.send(Job {
            request: self,
            on_complete,
        })
        .map_err(|mpsc::SendError(job)| DispatchRejected {
            error: EngineError::Dispatch(format!(
                "ONNX dispatcher for \"{}\" has stopped",
                job.request.model.name
            )),
            request: job.request,
        })
    }
}

// ─── Tensor plumbing ─────────────────────────────────────────────────────────

fn tensor_bytes(dims: &[usize; 4], precision: Precision) -> usize {
    dims.iter().product::<usize>() * precision.size()
}

/// NCHW ⇄ request-layout element index.
#[inline]
fn offset(layout: Layout, dims: &[usize; 4], nchw: usize) -> usize {
    match layout {
        Layout::Nchw => nchw,
        Layout::Nhwc => {
            let [_, c, h, w] = *dims;
            let x = nchw % w;
            let y = (nchw / w) % h;
            let ch = (nchw / (w * h)) % c;
            let b = nchw / (w * h * c);
            ((b * h + y) * w + x) * c + ch
        }
    }
}

fn load(data: &[u8], precision: Precision, i: usize) -> f32 {
    match precision {
        Precision::U8 => f32::from(data[i]),
        _ => {
            let o = i * 4;
            f32::from_ne_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]])
        }
    }
}

fn store(data: &mut [u8], precision: Precision, i: usize, v: f32) {
    match precision {
        Precision::U8 => data[i] = v.round().clamp(0.0, 255.0) as u8,
        _ => data[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes()),
    }
}

/// Destination for one output of a run.
struct Sink<'a> {
    port: &'a OutPort,
    buffer: &'a mut Vec<u8>,
}

/// Run `session` once; returns each output's NCHW dims and copies the data
/// into `sinks` when given.
fn run_session(
    session: &mut Session,
    inputs: &[Port],
    buffers: &[Vec<u8>],
    sinks: &mut [Sink<'_>],
) -> Result<Vec<[usize; 4]>> {
    let mut feeds = Vec::with_capacity(inputs.len());
    for (port, data) in inputs.iter().zip(buffers) {
        let dims = port.dims();
        let shape: Vec<i64> = port.shape.to_vec();
        let count = dims.iter().product::<usize>();
        let value = match port.model_precision {
            Precision::U8 => {
                let mut nchw = vec![0u8; count];
                for (i, v) in nchw.iter_mut().enumerate() {
                    *v = load(data, port.precision, offset(port.layout, &dims, i))
                        .round()
                        .clamp(0.0, 255.0) as u8;
                }
                Tensor::from_array((shape, nchw))
                    .map_err(ort_error("input tensor"))?
                    .into_dyn()
            }
            _ => {
                let mut nchw = vec![0f32; count];
                for (i, v) in nchw.iter_mut().enumerate() {
                    *v = load(data, port.precision, offset(port.layout, &dims, i));
                }
                Tensor::from_array((shape, nchw))
                    .map_err(ort_error("input tensor"))?
                    .into_dyn()
            }
        };
        feeds.push((port.name.clone(), value));
    }

    let results = session.run(feeds).map_err(ort_error("run"))?;

    let mut shapes = Vec::with_capacity(results.len());
    for (index, (_, value)) in results.iter().enumerate() {
        let (shape, values): (Vec<i64>, Vec<f32>) = match value.try_extract_tensor::<f32>() {
            Ok((shape, data)) => (shape.to_vec(), data.to_vec()),
            Err(_) => {
                let (shape, data) = value
                    .try_extract_tensor::<u8>()
                    .map_err(ort_error("extract output"))?;
                (shape.to_vec(), data.iter().map(|&b| f32::from(b)).collect())
            }
        };
        if shape.len() != 4 {
            return Err(EngineError::DimensionMismatch(format!(
                "output {index} must be 4D (NCHW), got {shape:?}"
            )));
        }
        let dims = [0, 1, 2, 3].map(|i| usize::try_from(shape[i]).unwrap_or(0));
        if let Some(sink) = sinks.get_mut(index) {
            if sink.port.dims != dims {
                return Err(EngineError::DimensionMismatch(format!(
                    "output \"{}\" changed shape: compiled {:?}, got {dims:?}",
                    sink.port.name, sink.port.dims
                )));
            }
            for (i, v) in values.iter().enumerate() {
                store(
                    sink.buffer,
                    sink.port.precision,
                    offset(sink.port.layout, &dims, i),
                    *v,
                );
            }
        }
        shapes.push(dims);
    }
    Ok(shapes)
}
