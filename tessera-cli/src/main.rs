//! tessera CLI entrypoint.
//!
//! ```bash
//! tessera run --model sr.json --frames 64 --batch-size 4 --json
//! tessera run --model det.json --kind detect --mode sync
//! tessera inspect --model sr.json --width 320 --height 240
//! tessera devices --json
//! ```

mod hooks;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use tessera_core::backend::InferenceEngine;
use tessera_core::error::{EngineError, Result};
use tessera_core::model::ModelHooks;
use tessera_core::task::{PollResult, Task};
use tessera_core::types::{
    DetectionBox, DetectionSideData, Frame, FunctionKind, PixelFormat, PortDesc,
};
use tessera_cpu::CpuEngine;
use tessera_ort::OrtEngine;
use tessera_scheduler::{MetricsSnapshot, Scheduler, SchedulerConfig, TeardownReport};

#[derive(Parser, Debug)]
#[command(
    name = "tessera",
    version,
    about = "Batched model execution over a pool of inference requests",
    arg_required_else_help = true,
    after_help = "Examples:\n  tessera run --model sr.json --frames 64 --batch-size 4 --json\n  tessera inspect --model sr.json --width 320 --height 240\n  tessera devices --engine onnx --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Push synthetic frames through a model and summarize.
    Run(RunArgs),
    /// Print input info and probed output dims.
    Inspect(InspectArgs),
    /// List devices an engine can compile for.
    Devices(DevicesArgs),
}

#[derive(Args, Debug, Clone)]
struct ModelArgs {
    /// Model file (JSON description for `cpu`, ONNX for `onnx`).
    #[arg(short = 'm', long = "model")]
    model: PathBuf,

    #[arg(long = "engine", value_enum, default_value_t = EngineArg::Cpu)]
    engine: EngineArg,

    #[arg(long = "kind", value_enum, default_value_t = KindArg::Process)]
    kind: KindArg,

    /// JSON scheduler config; flags override its fields.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    #[arg(long = "device")]
    device: Option<String>,

    /// Request slots (0 = derive from host parallelism).
    #[arg(long = "nireq")]
    nireq: Option<usize>,

    #[arg(long = "batch-size")]
    batch_size: Option<usize>,

    /// Report input size as unknown and reshape on output probes.
    #[arg(long = "input-resizable", default_value_t = false)]
    input_resizable: bool,

    /// Input port (default: first).
    #[arg(long = "input")]
    input: Option<String>,

    /// Output port (default: first).
    #[arg(long = "output")]
    output: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    model: ModelArgs,

    #[arg(long = "frames", default_value_t = 16)]
    frames: usize,

    #[arg(long = "width", default_value_t = 64)]
    width: u32,

    #[arg(long = "height", default_value_t = 64)]
    height: u32,

    #[arg(long = "mode", value_enum, default_value_t = ModeArg::Async)]
    mode: ModeArg,

    /// Only classify detection boxes with this label.
    #[arg(long = "target")]
    target: Option<String>,

    /// Minimum detection confidence kept by `--kind detect`.
    #[arg(long = "threshold", default_value_t = 0.5)]
    threshold: f32,

    /// Emit a JSON summary on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct InspectArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Probe output dims for this input width (process models only).
    #[arg(long = "width", requires = "height")]
    width: Option<u32>,

    #[arg(long = "height", requires = "width")]
    height: Option<u32>,

    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct DevicesArgs {
    #[arg(long = "engine", value_enum, default_value_t = EngineArg::Cpu)]
    engine: EngineArg,

    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EngineArg {
    Cpu,
    Onnx,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Process,
    Detect,
    Classify,
}

impl From<KindArg> for FunctionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Process => FunctionKind::ProcessFrame,
            KindArg::Detect => FunctionKind::AnalyticsDetect,
            KindArg::Classify => FunctionKind::AnalyticsClassify,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
enum ModeArg {
    Async,
    Sync,
}

const JSON_SCHEMA_VERSION: u32 = 1;

/// Label given to the synthetic boxes fed to classification runs.
const SYNTHETIC_LABEL: &str = "object";

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Run(args) if args.json => Some("run"),
        Commands::Inspect(args) if args.json => Some("inspect"),
        Commands::Devices(args) if args.json => Some("devices"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Devices(args) => run_devices(args),
        Commands::Run(args) => build_runtime().and_then(|rt| rt.block_on(run(args))),
        Commands::Inspect(args) => build_runtime().and_then(|rt| rt.block_on(run_inspect(args))),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| EngineError::Config(format!("failed to build tokio runtime: {e}")))
}

fn make_engine(engine: EngineArg) -> Arc<dyn InferenceEngine> {
    match engine {
        EngineArg::Cpu => Arc::new(CpuEngine::new()),
        EngineArg::Onnx => Arc::new(OrtEngine::new()),
    }
}

// ─── Config & model loading ──────────────────────────────────────────────────

fn resolve_config(args: &ModelArgs) -> Result<SchedulerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
            SchedulerConfig::from_json_str(&json)?
        }
        None => SchedulerConfig::default(),
    };
    if let Some(device) = &args.device {
        config.device = device.clone();
    }
    if let Some(nireq) = args.nireq {
        config.nireq = nireq;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if args.input_resizable {
        config.input_resizable = true;
    }
    Ok(config)
}

fn model_hooks(kind: FunctionKind, model: &Path, threshold: f32) -> ModelHooks {
    match kind {
        FunctionKind::ProcessFrame => ModelHooks::default(),
        FunctionKind::AnalyticsDetect => {
            let source = model
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            hooks::detection_hooks(&source, threshold)
        }
        FunctionKind::AnalyticsClassify => hooks::classification_hooks(),
    }
}

struct Loaded {
    scheduler: Scheduler,
    input: PortDesc,
    output: PortDesc,
}

fn pick_port(ports: &[PortDesc], wanted: Option<&str>, what: &str) -> Result<PortDesc> {
    let found = match wanted {
        Some(name) => ports.iter().find(|p| p.name == name),
        None => ports.first(),
    };
    found.cloned().ok_or_else(|| {
        EngineError::Config(format!(
            "no {what} \"{}\" in model",
            wanted.unwrap_or("<first>")
        ))
    })
}

fn load(args: &ModelArgs, threshold: f32) -> Result<Loaded> {
    let kind = FunctionKind::from(args.kind);
    let config = resolve_config(args)?;
    let scheduler = Scheduler::load(
        make_engine(args.engine),
        &args.model,
        kind,
        config,
        model_hooks(kind, &args.model, threshold),
    )?;
    let (inputs, outputs) = scheduler.ports()?;
    let input = pick_port(&inputs, args.input.as_deref(), "input")?;
    let output = pick_port(&outputs, args.output.as_deref(), "output")?;
    Ok(Loaded {
        scheduler,
        input,
        output,
    })
}

fn format_for_channels(channels: usize) -> PixelFormat {
    if channels == 1 {
        PixelFormat::Gray8
    } else {
        PixelFormat::Bgr24
    }
}

// ─── run ─────────────────────────────────────────────────────────────────────

/// Diagonal gradient so every frame differs.
fn synthetic_frame(index: usize, width: u32, height: u32, format: PixelFormat) -> Frame {
    let mut frame = Frame::new(width, height, format);
    let channels = format.channels();
    for y in 0..height as usize {
        for x in 0..width as usize {
            let o = (y * width as usize + x) * channels;
            for c in 0..channels {
                frame.data[o + c] = ((x + y + index * 7 + c * 40) % 256) as u8;
            }
        }
    }
    frame
}

/// Two boxes in the frame's top-left and bottom-right quadrants.
fn synthetic_detections(width: u32, height: u32) -> DetectionSideData {
    let (qw, qh) = ((width / 4) as i32, (height / 4) as i32);
    DetectionSideData {
        source: "synthetic".into(),
        boxes: vec![
            DetectionBox::new(1, 1, qw, qh, SYNTHETIC_LABEL),
            DetectionBox::new(2 * qw, 2 * qh, qw, qh, SYNTHETIC_LABEL),
        ],
    }
}

#[derive(Debug, Default, Serialize)]
struct RunTally {
    completed: usize,
    failed: usize,
    detections: usize,
    classifications: usize,
}

impl RunTally {
    fn record(&mut self, task: &Task) {
        self.completed += 1;
        if let Some(side) = &task.in_frame.detections {
            if side.source != "synthetic" {
                self.detections += side.boxes.len();
            }
            self.classifications += side
                .boxes
                .iter()
                .map(|b| b.classifications.len())
                .sum::<usize>();
        }
    }

    fn drain(&mut self, scheduler: &Scheduler) -> bool {
        loop {
            match scheduler.poll_completed() {
                PollResult::Done(task) => self.record(&task),
                PollResult::Failed(task) => {
                    warn!(
                        done = task.inference_done(),
                        todo = task.inference_todo(),
                        "Task failed"
                    );
                    self.failed += 1;
                }
                PollResult::NotReady => return false,
                PollResult::Empty => return true,
            }
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let Loaded {
        scheduler,
        input,
        output,
    } = load(&args.model, args.threshold)?;
    let kind = scheduler.kind();
    let in_format = format_for_channels(input.dims[1]);
    let out_format = format_for_channels(output.dims[1]);
    info!(
        model = scheduler.name(),
        input = %input.name,
        output = %output.name,
        frames = args.frames,
        mode = ?args.mode,
        "Starting run"
    );

    let started = Instant::now();
    let mut tally = RunTally::default();
    let outcome = async {
        for i in 0..args.frames {
            let mut in_frame = synthetic_frame(i, args.width, args.height, in_format);
            if kind == FunctionKind::AnalyticsClassify {
                in_frame = in_frame.with_detections(synthetic_detections(args.width, args.height));
            }
            let mut task = Task::new(
                input.name.clone(),
                output.name.clone(),
                in_frame,
                Frame::placeholder(0, 0, out_format),
            );
            if let Some(target) = &args.target {
                task = task.with_target(target.clone());
            }
            match args.mode {
                ModeArg::Sync => {
                    let done = scheduler.submit_sync(task).await?;
                    tally.record(&done);
                }
                ModeArg::Async => {
                    scheduler.submit_async(task).await?;
                    tally.drain(&scheduler);
                }
            }
        }
        while scheduler.pending_len() > 0 {
            scheduler.flush().await?;
        }
        while !tally.drain(&scheduler) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok::<(), EngineError>(())
    }
    .await;
    let elapsed = started.elapsed();

    let metrics = scheduler.metrics();
    let conservation = scheduler.verify_conservation();
    let teardown = scheduler.teardown().await?;
    outcome?;
    conservation?;

    if args.json {
        println!(
            "{}",
            run_json(&scheduler, &args, &tally, elapsed, &metrics, &teardown)
        );
    } else {
        let fps = args.frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        println!("model={} kind={kind:?} mode={:?}", scheduler.name(), args.mode);
        println!(
            "frames={} completed={} failed={} elapsed_ms={} fps={fps:.1}",
            args.frames,
            tally.completed,
            tally.failed,
            elapsed.as_millis()
        );
        println!(
            "batches={} rows={} avg_inference_us={} peak_busy_slots={}",
            metrics.batches_dispatched,
            metrics.rows_dispatched,
            metrics.avg_inference_us,
            metrics.peak_busy_slots
        );
        if kind != FunctionKind::ProcessFrame {
            println!(
                "detections={} classifications={}",
                tally.detections, tally.classifications
            );
        }
    }
    Ok(())
}

fn run_json(
    scheduler: &Scheduler,
    args: &RunArgs,
    tally: &RunTally,
    elapsed: Duration,
    metrics: &MetricsSnapshot,
    teardown: &TeardownReport,
) -> serde_json::Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": "run",
        "ok": true,
        "model": scheduler.name(),
        "kind": scheduler.kind(),
        "mode": args.mode,
        "config": scheduler.config(),
        "nireq": scheduler.nireq(),
        "frames": args.frames,
        "tally": tally,
        "elapsed_ms": elapsed.as_millis() as u64,
        "metrics": metrics,
        "teardown": teardown,
    })
}

// ─── inspect ─────────────────────────────────────────────────────────────────

async fn run_inspect(args: InspectArgs) -> Result<()> {
    let Loaded {
        scheduler,
        input,
        output,
    } = load(&args.model, 0.5)?;
    let outcome = async {
        let info = scheduler.input_info(&input.name).await?;
        let probed = match (args.width, args.height) {
            (Some(w), Some(h)) => Some(
                scheduler
                    .output_dims(&input.name, w, h, &output.name)
                    .await?,
            ),
            _ => None,
        };
        Ok::<_, EngineError>((info, probed))
    }
    .await;
    scheduler.teardown().await?;
    let (info, probed) = outcome?;
    debug!(?info, ?probed, "Inspected model");

    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "inspect",
                "ok": true,
                "model": scheduler.name(),
                "input": input.name,
                "output": output.name,
                "input_info": info,
                "output_dims": probed.map(|(w, h)| json!({ "width": w, "height": h })),
            })
        );
    } else {
        let dim = |d: Option<usize>| d.map_or_else(|| "?".to_string(), |v| v.to_string());
        println!("model={}", scheduler.name());
        println!(
            "input={} channels={} height={} width={} dtype={:?}",
            input.name,
            info.channels,
            dim(info.height),
            dim(info.width),
            info.dtype
        );
        match probed {
            Some((w, h)) => println!("output={} width={w} height={h}", output.name),
            None => println!("output={}", output.name),
        }
    }
    Ok(())
}

// ─── devices ─────────────────────────────────────────────────────────────────

fn run_devices(args: DevicesArgs) -> Result<()> {
    let engine = make_engine(args.engine);
    let devices = engine.available_devices();
    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "devices",
                "ok": true,
                "engine": engine.name(),
                "devices": devices,
            })
        );
    } else {
        println!("engine={} devices={}", engine.name(), devices.len());
        for device in &devices {
            println!("device={device}");
        }
    }
    Ok(())
}

fn command_error_json(command: &str, err: &EngineError) -> serde_json::Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "code": err.error_code(),
        "error": err.to_string(),
    })
}
