//! Host-resident frame types, detection side data and tensor descriptors.
//!
//! # Ownership model
//!
//! A [`Frame`] owns its pixel bytes.  Tasks own their input and output frames
//! for their whole lifetime; the scheduler only ever lends them to the
//! pre/post-processing hooks.
//!
//! # Invariants
//!
//! 1. `Frame::data.len() == format.byte_size(width, height)` for every frame
//!    built through [`Frame::new`].  Frames are tightly packed, row pitch is
//!    `width × bytes_per_pixel`.
//! 2. [`TensorDesc`] dims are always reported NCHW, whatever memory layout
//!    the engine was asked to use.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ─── Pixel format ────────────────────────────────────────────────────────────

/// Host pixel format of a [`Frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// One byte per pixel, luminance only.
    Gray8,
    /// One `f32` per pixel, luminance in `[0.0, 1.0]`.
    GrayF32,
    /// Interleaved `[R G B]` bytes.
    Rgb24,
    /// Interleaved `[B G R]` bytes.
    Bgr24,
}

impl PixelFormat {
    #[inline]
    pub const fn channels(self) -> usize {
        match self {
            Self::Gray8 | Self::GrayF32 => 1,
            Self::Rgb24 | Self::Bgr24 => 3,
        }
    }

    /// Bytes per channel-element.
    #[inline]
    pub const fn element_bytes(self) -> usize {
        match self {
            Self::GrayF32 => 4,
            Self::Gray8 | Self::Rgb24 | Self::Bgr24 => 1,
        }
    }

    #[inline]
    pub const fn bytes_per_pixel(self) -> usize {
        self.channels() * self.element_bytes()
    }

    #[inline]
    pub const fn byte_size(self, width: u32, height: u32) -> usize {
        (width as usize) * (height as usize) * self.bytes_per_pixel()
    }
}

// ─── Detection side data ─────────────────────────────────────────────────────

/// Upper bound on classifications attached to one detection box.
pub const MAX_CLASSIFICATIONS_PER_BOX: usize = 4;

/// One classification result attached to a detection box.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

/// A region of interest produced by an upstream detector.
///
/// Coordinates are signed so malformed detector output survives until the
/// bounds check rejects it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub label: String,
    pub confidence: f32,
    #[serde(default)]
    pub classifications: Vec<Classification>,
}

impl DetectionBox {
    pub fn new(x: i32, y: i32, w: i32, h: i32, label: impl Into<String>) -> Self {
        Self {
            x,
            y,
            w,
            h,
            label: label.into(),
            confidence: 1.0,
            classifications: Vec::new(),
        }
    }

    /// Whether the box lies strictly inside a `width × height` frame.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        let (width, height) = (i64::from(width), i64::from(height));
        let (x, y, w, h) = (
            i64::from(self.x),
            i64::from(self.y),
            i64::from(self.w),
            i64::from(self.h),
        );
        x >= 0 && w >= 0 && x + w < width && y >= 0 && h >= 0 && y + h < height
    }

    pub fn classifications_full(&self) -> bool {
        self.classifications.len() >= MAX_CLASSIFICATIONS_PER_BOX
    }
}

/// Detection side data attached to a frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSideData {
    /// Name of the model that produced the boxes.
    pub source: String,
    pub boxes: Vec<DetectionBox>,
}

// ─── Frame ───────────────────────────────────────────────────────────────────

/// A single video frame in host memory.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Tightly packed pixel bytes.
    pub data: Vec<u8>,
    /// Boxes attached by an upstream detector, if any.
    pub detections: Option<DetectionSideData>,
}

impl Frame {
    /// Allocate a zeroed frame.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0; format.byte_size(width, height)],
            detections: None,
        }
    }

    /// A frame with dimensions but no pixel storage (used for shape probes).
    pub fn placeholder(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: Vec::new(),
            detections: None,
        }
    }

    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let need = format.byte_size(width, height);
        if data.len() != need {
            return Err(EngineError::DimensionMismatch(format!(
                "{width}x{height} {format:?} frame needs {need} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            detections: None,
        })
    }

    pub fn with_detections(mut self, detections: DetectionSideData) -> Self {
        self.detections = Some(detections);
        self
    }

    /// Whether pixel storage matches the declared geometry.
    pub fn is_allocated(&self) -> bool {
        !self.data.is_empty() && self.data.len() == self.format.byte_size(self.width, self.height)
    }

    /// Resize storage to `width × height`, zeroing it when the geometry changes.
    pub fn ensure_geometry(&mut self, width: u32, height: u32) {
        let need = self.format.byte_size(width, height);
        if self.width != width || self.height != height || self.data.len() != need {
            self.width = width;
            self.height = height;
            self.data.clear();
            self.data.resize(need, 0);
        }
    }
}

// ─── Tensor descriptors ──────────────────────────────────────────────────────

/// Element type the scheduler knows how to route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Float32,
    Uint8,
}

impl DataType {
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Uint8 => 1,
        }
    }
}

/// Element precision as reported by an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    Fp16,
    U8,
    I32,
}

impl Precision {
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Fp32 | Self::I32 => 4,
            Self::Fp16 => 2,
            Self::U8 => 1,
        }
    }
}

impl TryFrom<Precision> for DataType {
    type Error = EngineError;

    fn try_from(precision: Precision) -> Result<Self> {
        match precision {
            Precision::Fp32 => Ok(Self::Float32),
            Precision::U8 => Ok(Self::Uint8),
            other => Err(EngineError::UnsupportedPrecision(format!(
                "{other:?} is not supported yet"
            ))),
        }
    }
}

impl From<DataType> for Precision {
    fn from(dt: DataType) -> Self {
        match dt {
            DataType::Float32 => Self::Fp32,
            DataType::Uint8 => Self::U8,
        }
    }
}

/// Memory layout of a 4-D tensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    #[default]
    Nchw,
    Nhwc,
}

/// Channel order handed to the frame converters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    #[default]
    Bgr,
}

/// Shape of a batched 4-D tensor plus its element type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub dtype: DataType,
}

impl TensorDesc {
    /// Build from NCHW dims and an engine precision.
    pub fn from_nchw(dims: [usize; 4], precision: Precision) -> Result<Self> {
        Ok(Self {
            batch: dims[0],
            channels: dims[1],
            height: dims[2],
            width: dims[3],
            dtype: DataType::try_from(precision)?,
        })
    }

    /// Elements in one batch row.
    #[inline]
    pub const fn sample_elements(&self) -> usize {
        self.width * self.height * self.channels
    }

    /// Bytes in one batch row: `width × height × channels × elementSize`.
    #[inline]
    pub const fn sample_bytes(&self) -> usize {
        self.sample_elements() * self.dtype.size()
    }
}

/// Port description returned by an engine network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortDesc {
    pub name: String,
    /// NCHW.
    pub dims: [usize; 4],
    pub precision: Precision,
}

/// What a caller needs to know about a model input before building frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct InputInfo {
    pub channels: usize,
    /// `None` when the input is resizable.
    pub height: Option<usize>,
    /// `None` when the input is resizable.
    pub width: Option<usize>,
    pub dtype: DataType,
}

/// Function category of a model; decides decomposition and conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    /// Frame in, frame out (super-resolution, denoise).
    ProcessFrame,
    /// Whole frame in, detections out.
    AnalyticsDetect,
    /// One inference per detection box.
    AnalyticsClassify,
}
