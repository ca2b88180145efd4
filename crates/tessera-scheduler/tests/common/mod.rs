#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tessera_core::backend::{
    AsyncCompletion, Blob, BlobMut, DispatchRejected, ExecutableNetwork, InferRequest,
    InferenceEngine, Network,
};
use tessera_core::convert::TensorSlice;
use tessera_core::error::{EngineError, Result};
use tessera_core::model::ModelHooks;
use tessera_core::task::{PollResult, Task};
use tessera_core::types::{
    Classification, DetectionBox, DetectionSideData, Frame, FunctionKind, Layout, PixelFormat,
    PortDesc, Precision,
};
use tessera_cpu::CpuEngine;
use tessera_scheduler::{Scheduler, SchedulerConfig};

/// Gray 4×4 in, same out.
pub const IDENTITY_GRAY: &str = r#"{
    "name": "identity",
    "inputs": [{"name": "x", "dims": [1, 1, 4, 4], "precision": "fp32"}],
    "outputs": [{"name": "y", "precision": "fp32"}]
}"#;

/// Colour 4×4 in, 2× nearest upscale out.
pub const UPSAMPLE_BGR: &str = r#"{
    "name": "upsample",
    "inputs": [{"name": "x", "dims": [1, 3, 4, 4], "precision": "fp32"}],
    "outputs": [{"name": "y", "precision": "fp32", "op": {"kind": "upsample", "scale": 2}}]
}"#;

/// Colour 2×2 crop in, per-channel mean out.
pub const CLASSIFIER: &str = r#"{
    "name": "classifier",
    "inputs": [{"name": "x", "dims": [1, 3, 2, 2], "precision": "fp32"}],
    "outputs": [{"name": "scores", "precision": "fp32", "op": {"kind": "channel_mean"}}]
}"#;

/// Colour 2×2 frame in, per-channel mean out; read as one detection per row.
pub const DETECTOR: &str = r#"{
    "name": "detector",
    "inputs": [{"name": "x", "dims": [1, 3, 2, 2], "precision": "fp32"}],
    "outputs": [{"name": "det", "precision": "fp32", "op": {"kind": "channel_mean"}}]
}"#;

pub fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "tessera_sched_{label}_{}_{}",
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn write_model(dir: &Path, json: &str) -> PathBuf {
    let path = dir.join("model.json");
    fs::write(&path, json).expect("write model");
    path
}

/// Same description with a simulated per-run latency.
pub fn with_latency(json: &str, ms: u64) -> String {
    let trimmed = json.trim_end().trim_end_matches('}');
    format!("{trimmed}, \"latency_ms\": {ms}}}")
}

pub fn config(batch_size: usize, nireq: usize) -> SchedulerConfig {
    SchedulerConfig {
        batch_size,
        nireq,
        ..SchedulerConfig::default()
    }
}

pub fn load(
    label: &str,
    model: &str,
    kind: FunctionKind,
    config: SchedulerConfig,
    hooks: ModelHooks,
) -> Scheduler {
    load_with(Arc::new(CpuEngine::with_workers(2)), label, model, kind, config, hooks)
}

pub fn load_with(
    engine: Arc<dyn InferenceEngine>,
    label: &str,
    model: &str,
    kind: FunctionKind,
    config: SchedulerConfig,
    hooks: ModelHooks,
) -> Scheduler {
    let dir = unique_temp_dir(label);
    let path = write_model(&dir, model);
    let scheduler = Scheduler::load(engine, &path, kind, config, hooks).expect("load model");
    let _ = fs::remove_dir_all(dir);
    scheduler
}

pub fn gray_frame(value: u8) -> Frame {
    Frame::from_data(4, 4, PixelFormat::Gray8, vec![value; 16]).expect("gray frame")
}

pub fn gray_task(value: u8) -> Task {
    Task::new("x", "y", gray_frame(value), Frame::placeholder(0, 0, PixelFormat::Gray8))
}

/// 16×16 BGR frame carrying `boxes`.
pub fn frame_with_boxes(boxes: Vec<DetectionBox>) -> Frame {
    Frame::new(16, 16, PixelFormat::Bgr24).with_detections(DetectionSideData {
        source: "detector".into(),
        boxes,
    })
}

pub fn classify_task(in_frame: Frame) -> Task {
    Task::new("x", "scores", in_frame, Frame::placeholder(0, 0, PixelFormat::Bgr24))
}

/// Uniform 2×2 BGR frame for the detector.
pub fn detect_task(value: u8) -> Task {
    let frame = Frame::from_data(2, 2, PixelFormat::Bgr24, vec![value; 12]).expect("bgr frame");
    Task::new("x", "det", frame, Frame::placeholder(0, 0, PixelFormat::Bgr24))
}

/// One whole-frame box per result, labelled with the first channel mean.
pub fn mean_detection_hooks() -> ModelHooks {
    ModelHooks::default().with_post_process(
        |slice: &TensorSlice<'_>, frame: &mut Frame, region: Option<usize>| {
            if region.is_some() {
                return Err(EngineError::InvariantViolation("detection with a region".into()));
            }
            let values = slice.to_f32()?;
            let (w, h) = (frame.width as i32, frame.height as i32);
            frame
                .detections
                .get_or_insert_with(|| DetectionSideData {
                    source: "detector".into(),
                    boxes: Vec::new(),
                })
                .boxes
                .push(DetectionBox::new(0, 0, w, h, format!("mean_{}", values[0].round() as u32)));
            Ok(())
        },
    )
}

/// Attach the strongest channel of each result to its box.
pub fn classify_hooks() -> ModelHooks {
    ModelHooks::default().with_post_process(
        |slice: &TensorSlice<'_>, frame: &mut Frame, region: Option<usize>| {
            let values = slice.to_f32()?;
            let (channel, confidence) = values
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::MIN), |best, (i, v)| if v > best.1 { (i, v) } else { best });
            let index = region.ok_or_else(|| EngineError::InvariantViolation("no region".into()))?;
            let target = frame
                .detections
                .as_mut()
                .and_then(|d| d.boxes.get_mut(index))
                .ok_or_else(|| EngineError::InvariantViolation("box gone".into()))?;
            target.classifications.push(Classification {
                label: format!("channel_{channel}"),
                confidence,
            });
            Ok(())
        },
    )
}

/// Poll until something other than `NotReady` comes back.
pub async fn next_result(scheduler: &Scheduler) -> PollResult {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match scheduler.poll_completed() {
            PollResult::NotReady if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            other => return other,
        }
    }
}

pub async fn expect_done(scheduler: &Scheduler) -> Task {
    match next_result(scheduler).await {
        PollResult::Done(task) => task,
        other => panic!("expected a completed task, got {other:?}"),
    }
}

// ─── Engine that refuses async dispatches ────────────────────────────────────

/// Wraps the CPU engine; the first `rejections` async dispatches are refused.
pub struct FlakyEngine {
    inner: CpuEngine,
    rejections: Arc<AtomicUsize>,
}

impl FlakyEngine {
    pub fn new(rejections: usize) -> Self {
        Self {
            inner: CpuEngine::with_workers(1),
            rejections: Arc::new(AtomicUsize::new(rejections)),
        }
    }
}

impl InferenceEngine for FlakyEngine {
    fn name(&self) -> &str {
        "flaky"
    }

    fn read_network(&self, path: &Path) -> Result<Box<dyn Network>> {
        Ok(Box::new(FlakyNetwork {
            inner: self.inner.read_network(path)?,
            rejections: Arc::clone(&self.rejections),
        }))
    }

    fn available_devices(&self) -> Vec<String> {
        self.inner.available_devices()
    }
}

struct FlakyNetwork {
    inner: Box<dyn Network>,
    rejections: Arc<AtomicUsize>,
}

impl Network for FlakyNetwork {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn inputs(&self) -> Vec<PortDesc> {
        self.inner.inputs()
    }
    fn outputs(&self) -> Vec<PortDesc> {
        self.inner.outputs()
    }
    fn reshape_batch(&mut self, batch: usize) -> Result<()> {
        self.inner.reshape_batch(batch)
    }
    fn reshape_input(&mut self, name: &str, height: usize, width: usize) -> Result<()> {
        self.inner.reshape_input(name, height, width)
    }
    fn set_input_layout(&mut self, name: &str, layout: Layout) -> Result<()> {
        self.inner.set_input_layout(name, layout)
    }
    fn set_output_layout(&mut self, name: &str, layout: Layout) -> Result<()> {
        self.inner.set_output_layout(name, layout)
    }
    fn set_input_precision(&mut self, name: &str, precision: Precision) -> Result<()> {
        self.inner.set_input_precision(name, precision)
    }
    fn compile(&self, device: &str) -> Result<Box<dyn ExecutableNetwork>> {
        Ok(Box::new(FlakyExecutable {
            inner: self.inner.compile(device)?,
            rejections: Arc::clone(&self.rejections),
        }))
    }
}

struct FlakyExecutable {
    inner: Box<dyn ExecutableNetwork>,
    rejections: Arc<AtomicUsize>,
}

impl ExecutableNetwork for FlakyExecutable {
    fn create_request(&self) -> Result<Box<dyn InferRequest>> {
        Ok(Box::new(FlakyRequest {
            inner: self.inner.create_request()?,
            rejections: Arc::clone(&self.rejections),
        }))
    }
}

struct FlakyRequest {
    inner: Box<dyn InferRequest>,
    rejections: Arc<AtomicUsize>,
}

impl InferRequest for FlakyRequest {
    fn input_blob(&mut self, name: &str) -> Result<BlobMut<'_>> {
        self.inner.input_blob(name)
    }

    fn output_blob(&self, name: &str) -> Result<Blob<'_>> {
        self.inner.output_blob(name)
    }

    fn infer(&mut self) -> Result<()> {
        self.inner.infer()
    }

    fn infer_async(
        self: Box<Self>,
        on_complete: AsyncCompletion,
    ) -> std::result::Result<(), DispatchRejected> {
        let refuse = self
            .rejections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(DispatchRejected {
                request: self,
                error: EngineError::Dispatch("injected dispatch failure".into()),
            });
        }
        let FlakyRequest { inner, rejections } = *self;
        let rewrap = Arc::clone(&rejections);
        inner
            .infer_async(Box::new(move |inner, outcome| {
                on_complete(
                    Box::new(FlakyRequest {
                        inner,
                        rejections: rewrap,
                    }),
                    outcome,
                );
            }))
            .map_err(|DispatchRejected { request, error }| DispatchRejected {
                request: Box::new(FlakyRequest {
                    inner: request,
                    rejections,
                }),
                error,
            })
    }
}
