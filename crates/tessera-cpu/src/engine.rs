//! Reference CPU engine.
//!
//! Networks are JSON [`ModelDescription`]s.  Compiling one starts a small
//! pool of worker threads that run asynchronous requests; synchronous runs
//! execute on the calling thread.  Workers exit once the executable network
//! and every request created from it are dropped.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use tessera_core::backend::{
    AsyncCompletion, Blob, BlobMut, DispatchRejected, ExecutableNetwork, InferRequest,
    InferenceEngine, Network, missing_binding,
};
use tessera_core::error::{BindingKind, EngineError, Result};
use tessera_core::types::{Layout, PortDesc, Precision};

use crate::model::{ModelDescription, Op};

/// Device name accepted by [`Network::compile`].
pub const CPU_DEVICE: &str = "CPU";

// ─── Engine ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct CpuEngine {
    workers: usize,
}

impl CpuEngine {
    /// One worker per available core.
    pub fn new() -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { workers }
    }

    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn load_description(&self, desc: ModelDescription) -> Box<dyn Network> {
        Box::new(CpuNetwork::new(desc, self.workers))
    }
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine for CpuEngine {
    fn name(&self) -> &str {
        "cpu"
    }

    fn read_network(&self, path: &Path) -> Result<Box<dyn Network>> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| EngineError::ModelRead(format!("{}: {e}", path.display())))?;
        let desc = ModelDescription::from_json(&json)?;
        debug!(model = %desc.name, path = %path.display(), "CPU network parsed");
        Ok(self.load_description(desc))
    }

    fn available_devices(&self) -> Vec<String> {
        vec![CPU_DEVICE.to_string()]
    }
}

// ─── Network ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct Port {
    name: String,
    dims: [usize; 4],
    precision: Precision,
    layout: Layout,
}

impl Port {
    fn desc(&self) -> PortDesc {
        PortDesc {
            name: self.name.clone(),
            dims: self.dims,
            precision: self.precision,
        }
    }

    fn bytes(&self) -> usize {
        self.dims.iter().product::<usize>() * self.precision.size()
    }
}

#[derive(Debug)]
struct CpuNetwork {
    name: String,
    inputs: Vec<Port>,
    outputs: Vec<(OutputDef, Layout)>,
    latency: Duration,
    workers: usize,
}

#[derive(Clone, Debug)]
struct OutputDef {
    name: String,
    precision: Precision,
    op: Op,
}

impl CpuNetwork {
    fn new(desc: ModelDescription, workers: usize) -> Self {
        Self {
            name: desc.name,
            inputs: desc
                .inputs
                .into_iter()
                .map(|p| Port {
                    name: p.name,
                    dims: p.dims,
                    precision: p.precision,
                    layout: Layout::Nchw,
                })
                .collect(),
            outputs: desc
                .outputs
                .into_iter()
                .map(|o| {
                    (
                        OutputDef {
                            name: o.name,
                            precision: o.precision,
                            op: o.op,
                        },
                        Layout::Nchw,
                    )
                })
                .collect(),
            latency: Duration::from_millis(desc.latency_ms),
            workers,
        }
    }

    fn source_dims(&self) -> [usize; 4] {
        self.inputs.first().map(|p| p.dims).unwrap_or([0; 4])
    }

    fn output_ports(&self) -> Vec<Port> {
        let src = self.source_dims();
        self.outputs
            .iter()
            .map(|(def, layout)| Port {
                name: def.name.clone(),
                dims: def.op.output_dims(src),
                precision: def.precision,
                layout: *layout,
            })
            .collect()
    }

    fn input_mut(&mut self, name: &str) -> Result<&mut Port> {
        let i = port_index(&self.inputs, BindingKind::Input, name)?;
        Ok(&mut self.inputs[i])
    }
}

impl Network for CpuNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<PortDesc> {
        self.inputs.iter().map(Port::desc).collect()
    }

    fn outputs(&self) -> Vec<PortDesc> {
        self.output_ports().iter().map(Port::desc).collect()
    }

    fn reshape_batch(&mut self, batch: usize) -> Result<()> {
        if batch == 0 {
            return Err(EngineError::DimensionMismatch("batch must be positive".into()));
        }
        for port in &mut self.inputs {
            port.dims[0] = batch;
        }
        Ok(())
    }

    fn reshape_input(&mut self, name: &str, height: usize, width: usize) -> Result<()> {
        if height == 0 || width == 0 {
            return Err(EngineError::DimensionMismatch(format!(
                "cannot reshape \"{name}\" to {width}x{height}"
            )));
        }
        let port = self.input_mut(name)?;
        port.dims[2] = height;
        port.dims[3] = width;
        Ok(())
    }

    fn set_input_layout(&mut self, name: &str, layout: Layout) -> Result<()> {
        self.input_mut(name)?.layout = layout;
        Ok(())
    }

    fn set_output_layout(&mut self, name: &str, layout: Layout) -> Result<()> {
        match self.outputs.iter_mut().find(|(def, _)| def.name == name) {
            Some((_, l)) => {
                *l = layout;
                Ok(())
            }
            None => Err(missing_binding(&self.outputs(), BindingKind::Output, name)),
        }
    }

    fn set_input_precision(&mut self, name: &str, precision: Precision) -> Result<()> {
        self.input_mut(name)?.precision = precision;
        Ok(())
    }

    fn compile(&self, device: &str) -> Result<Box<dyn ExecutableNetwork>> {
        if device != CPU_DEVICE {
            return Err(EngineError::Compile(format!("unknown device \"{device}\"")));
        }
        let model = Arc::new(CompiledModel {
            name: self.name.clone(),
            inputs: self.inputs.clone(),
            outputs: self.output_ports(),
            ops: self.outputs.iter().map(|(def, _)| def.op).collect(),
            latency: self.latency,
        });
        let workers = WorkerPool::start(&self.name, self.workers)?;
        info!(
            model = %self.name,
            workers = self.workers,
            input_dims = ?self.source_dims(),
            "CPU network compiled"
        );
        Ok(Box::new(CpuExecutable { model, workers }))
    }
}

// ─── Workers ─────────────────────────────────────────────────────────────────

struct Job {
    request: Box<CpuRequest>,
    on_complete: AsyncCompletion,
}

#[derive(Debug)]
struct WorkerPool {
    tx: Sender<Job>,
}

impl WorkerPool {
    fn start(model: &str, count: usize) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..count {
            let rx = Arc::clone(&rx);
            thread::Builder::new()
                .name(format!("tessera-cpu-{model}-{i}"))
                .spawn(move || worker_loop(&rx))
                .map_err(|e| EngineError::Compile(format!("spawn CPU worker: {e}")))?;
        }
        Ok(Arc::new(Self { tx }))
    }
}

fn worker_loop(rx: &Mutex<Receiver<Job>>) {
    loop {
        let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(Job {
            mut request,
            on_complete,
        }) = next
        else {
            break;
        };
        let outcome = request.infer();
        on_complete(request, outcome);
    }
}

// ─── Executable network & requests ───────────────────────────────────────────

#[derive(Debug)]
struct CompiledModel {
    name: String,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    ops: Vec<Op>,
    latency: Duration,
}

struct CpuExecutable {
    model: Arc<CompiledModel>,
    workers: Arc<WorkerPool>,
}

impl ExecutableNetwork for CpuExecutable {
    fn create_request(&self) -> Result<Box<dyn InferRequest>> {
        let alloc = |ports: &[Port]| -> Result<Vec<Vec<u8>>> {
            ports
                .iter()
                .map(|p| {
                    let mut buf = Vec::new();
                    buf.try_reserve_exact(p.bytes()).map_err(|e| {
                        EngineError::Allocation(format!("buffer for \"{}\": {e}", p.name))
                    })?;
                    buf.resize(p.bytes(), 0);
                    Ok(buf)
                })
                .collect()
        };
        Ok(Box::new(CpuRequest {
            inputs: alloc(&self.model.inputs)?,
            outputs: alloc(&self.model.outputs)?,
            model: Arc::clone(&self.model),
            workers: Arc::clone(&self.workers),
        }))
    }
}

struct CpuRequest {
    model: Arc<CompiledModel>,
    inputs: Vec<Vec<u8>>,
    outputs: Vec<Vec<u8>>,
    workers: Arc<WorkerPool>,
}

fn port_index(ports: &[Port], kind: BindingKind, name: &str) -> Result<usize> {
    ports.iter().position(|p| p.name == name).ok_or_else(|| {
        let descs: Vec<_> = ports.iter().map(Port::desc).collect();
        missing_binding(&descs, kind, name)
    })
}

impl InferRequest for CpuRequest {
    fn input_blob(&mut self, name: &str) -> Result<BlobMut<'_>> {
        let i = port_index(&self.model.inputs, BindingKind::Input, name)?;
        let port = &self.model.inputs[i];
        Ok(BlobMut {
            dims: port.dims,
            precision: port.precision,
            layout: port.layout,
            data: &mut self.inputs[i],
        })
    }

    fn output_blob(&self, name: &str) -> Result<Blob<'_>> {
        let i = port_index(&self.model.outputs, BindingKind::Output, name)?;
        let port = &self.model.outputs[i];
        Ok(Blob {
            dims: port.dims,
            precision: port.precision,
            layout: port.layout,
            data: &self.outputs[i],
        })
    }

    fn infer(&mut self) -> Result<()> {
        if !self.model.latency.is_zero() {
            thread::sleep(self.model.latency);
        }
        let model = &self.model;
        let src = &model.inputs[0];
        for ((dst, op), out) in model.outputs.iter().zip(&model.ops).zip(&mut self.outputs) {
            run_op(*op, src, &self.inputs[0], dst, out)?;
        }
        Ok(())
    }

    fn infer_async(
        self: Box<Self>,
        on_complete: AsyncCompletion,
    ) -> std::result::Result<(), DispatchRejected> {
        let tx = self.workers.tx.clone();
        tx.send(Job {
            request: self,
            on_complete,
        })
        .map_err(|mpsc::SendError(job)| DispatchRejected {
            error: EngineError::Dispatch(format!(
                "CPU workers for \"{}\" have stopped",
                job.request.model.name
            )),
            request: job.request,
        })
    }
}

// ─── Compute ─────────────────────────────────────────────────────────────────

#[inline]
fn index(layout: Layout, dims: &[usize; 4], b: usize, c: usize, y: usize, x: usize) -> usize {
    let [_, ch, h, w] = *dims;
    match layout {
        Layout::Nchw => ((b * ch + c) * h + y) * w + x,
        Layout::Nhwc => ((b * h + y) * w + x) * ch + c,
    }
}

fn read(data: &[u8], precision: Precision, i: usize) -> Result<f32> {
    match precision {
        Precision::U8 => Ok(f32::from(data[i])),
        Precision::Fp32 => {
            let o = i * 4;
            Ok(f32::from_ne_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]))
        }
        other => Err(EngineError::Inference(format!(
            "CPU engine cannot compute on {other:?}"
        ))),
    }
}

fn write(data: &mut [u8], precision: Precision, i: usize, v: f32) -> Result<()> {
    match precision {
        Precision::U8 => data[i] = v.round().clamp(0.0, 255.0) as u8,
        Precision::Fp32 => data[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes()),
        other => {
            return Err(EngineError::Inference(format!(
                "CPU engine cannot compute on {other:?}"
            )));
        }
    }
    Ok(())
}

fn run_op(op: Op, src: &Port, input: &[u8], dst: &Port, output: &mut [u8]) -> Result<()> {
    let [n, c, h, w] = src.dims;
    let [_, oc, oh, ow] = dst.dims;
    let gain = match op {
        Op::Gain { factor } => factor,
        _ => 1.0,
    };
    for b in 0..n {
        for ch in 0..oc {
            if let Op::ChannelMean = op {
                let mut sum = 0.0f32;
                for y in 0..h {
                    for x in 0..w {
                        sum += read(input, src.precision, index(src.layout, &src.dims, b, ch, y, x))?;
                    }
                }
                let i = index(dst.layout, &dst.dims, b, ch, 0, 0);
                write(output, dst.precision, i, sum / (h * w) as f32)?;
                continue;
            }
            for y in 0..oh {
                let sy = y * h / oh;
                for x in 0..ow {
                    let sx = x * w / ow;
                    let v = read(input, src.precision, index(src.layout, &src.dims, b, ch % c, sy, sx))?;
                    write(output, dst.precision, index(dst.layout, &dst.dims, b, ch, y, x), v * gain)?;
                }
            }
        }
    }
    Ok(())
}
