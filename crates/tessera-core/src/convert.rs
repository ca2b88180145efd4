//! Default frame ↔ tensor conversions.
//!
//! Used whenever a model installs no custom hook.  Scaling is
//! nearest-neighbour.  `Float32` tensors hold values normalized to
//! `[0.0, 1.0]`; `Uint8` tensors hold raw 0..=255 samples.
//!
//! Tensors are a single batch row; `layout` decides whether channels are
//! planar (NCHW) or interleaved (NHWC).

use crate::error::{EngineError, Result};
use crate::types::{ChannelOrder, DataType, DetectionBox, Frame, Layout, PixelFormat, TensorDesc};

/// Read-only view of one batch row.
#[derive(Debug)]
pub struct TensorSlice<'a> {
    pub desc: TensorDesc,
    pub layout: Layout,
    pub data: &'a [u8],
}

/// Writable view of one batch row.
#[derive(Debug)]
pub struct TensorSliceMut<'a> {
    pub desc: TensorDesc,
    pub layout: Layout,
    pub data: &'a mut [u8],
}

impl TensorSlice<'_> {
    /// Element values in planar (CHW) order, whatever the buffer layout.
    pub fn to_f32(&self) -> Result<Vec<f32>> {
        let desc = self.desc;
        check_row(self.data.len(), &desc)?;
        let mut out = Vec::with_capacity(desc.sample_elements());
        for c in 0..desc.channels {
            for y in 0..desc.height {
                for x in 0..desc.width {
                    let i = element_index(self.layout, &desc, c, y, x);
                    out.push(read_element(self.data, desc.dtype, i));
                }
            }
        }
        Ok(out)
    }
}

// ─── Element access ──────────────────────────────────────────────────────────

#[inline]
fn element_index(layout: Layout, desc: &TensorDesc, c: usize, y: usize, x: usize) -> usize {
    match layout {
        Layout::Nchw => (c * desc.height + y) * desc.width + x,
        Layout::Nhwc => (y * desc.width + x) * desc.channels + c,
    }
}

#[inline]
fn read_element(data: &[u8], dtype: DataType, i: usize) -> f32 {
    match dtype {
        DataType::Uint8 => f32::from(data[i]),
        DataType::Float32 => {
            let o = i * 4;
            f32::from_ne_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]])
        }
    }
}

#[inline]
fn write_element(data: &mut [u8], dtype: DataType, i: usize, v: f32) {
    match dtype {
        DataType::Uint8 => data[i] = v.round().clamp(0.0, 255.0) as u8,
        DataType::Float32 => {
            let o = i * 4;
            data[o..o + 4].copy_from_slice(&v.to_ne_bytes());
        }
    }
}

/// Frame channel holding tensor channel `c` under `order`.
#[inline]
fn frame_channel(format: PixelFormat, order: ChannelOrder, c: usize) -> usize {
    let native = match format {
        PixelFormat::Rgb24 => ChannelOrder::Rgb,
        PixelFormat::Bgr24 => ChannelOrder::Bgr,
        PixelFormat::Gray8 | PixelFormat::GrayF32 => return c,
    };
    if native == order { c } else { 2 - c }
}

/// Sample value on a 0..=255 scale.
#[inline]
fn read_pixel(frame: &Frame, x: usize, y: usize, ch: usize) -> f32 {
    let bpp = frame.format.bytes_per_pixel();
    let o = (y * frame.width as usize + x) * bpp;
    match frame.format {
        PixelFormat::GrayF32 => {
            let d = &frame.data;
            f32::from_ne_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]]) * 255.0
        }
        _ => f32::from(frame.data[o + ch]),
    }
}

#[inline]
fn write_pixel(frame: &mut Frame, x: usize, y: usize, ch: usize, v: f32) {
    let bpp = frame.format.bytes_per_pixel();
    let o = (y * frame.width as usize + x) * bpp;
    match frame.format {
        PixelFormat::GrayF32 => {
            frame.data[o..o + 4].copy_from_slice(&(v / 255.0).to_ne_bytes());
        }
        _ => frame.data[o + ch] = v.round().clamp(0.0, 255.0) as u8,
    }
}

fn check_channels(frame: &Frame, desc: &TensorDesc) -> Result<()> {
    if frame.format.channels() != desc.channels {
        return Err(EngineError::DimensionMismatch(format!(
            "{:?} frame has {} channel(s), tensor expects {}",
            frame.format,
            frame.format.channels(),
            desc.channels
        )));
    }
    Ok(())
}

fn check_row(len: usize, desc: &TensorDesc) -> Result<()> {
    if len < desc.sample_bytes() {
        return Err(EngineError::DimensionMismatch(format!(
            "tensor row needs {} bytes, buffer has {len}",
            desc.sample_bytes()
        )));
    }
    Ok(())
}

// ─── Conversions ─────────────────────────────────────────────────────────────

/// Scale the `rw × rh` rectangle at `(rx, ry)` into `dst`.
fn rect_to_tensor(
    frame: &Frame,
    (rx, ry, rw, rh): (usize, usize, usize, usize),
    dst: &mut TensorSliceMut<'_>,
    order: ChannelOrder,
) -> Result<()> {
    if !frame.is_allocated() {
        return Err(EngineError::DimensionMismatch(
            "input frame has no pixel storage".into(),
        ));
    }
    let desc = dst.desc;
    check_channels(frame, &desc)?;
    check_row(dst.data.len(), &desc)?;
    let (rw, rh) = (rw.max(1), rh.max(1));

    for y in 0..desc.height {
        let sy = ry + y * rh / desc.height;
        for x in 0..desc.width {
            let sx = rx + x * rw / desc.width;
            for c in 0..desc.channels {
                let v = read_pixel(frame, sx, sy, frame_channel(frame.format, order, c));
                let v = match desc.dtype {
                    DataType::Float32 => v / 255.0,
                    DataType::Uint8 => v,
                };
                write_element(dst.data, desc.dtype, element_index(dst.layout, &desc, c, y, x), v);
            }
        }
    }
    Ok(())
}

/// Scale a whole frame into one tensor row.
pub fn frame_to_tensor(frame: &Frame, dst: &mut TensorSliceMut<'_>, order: ChannelOrder) -> Result<()> {
    let rect = (0, 0, frame.width as usize, frame.height as usize);
    rect_to_tensor(frame, rect, dst, order)
}

/// Crop `region` out of `frame` and scale it into one tensor row.
pub fn region_to_tensor(
    frame: &Frame,
    region: &DetectionBox,
    dst: &mut TensorSliceMut<'_>,
    order: ChannelOrder,
) -> Result<()> {
    if !region.fits_within(frame.width, frame.height) {
        return Err(EngineError::DimensionMismatch(format!(
            "region {}x{}+{}+{} exceeds {}x{} frame",
            region.w, region.h, region.x, region.y, frame.width, frame.height
        )));
    }
    // fits_within guarantees non-negative coordinates.
    let rect = (
        region.x as usize,
        region.y as usize,
        region.w as usize,
        region.h as usize,
    );
    rect_to_tensor(frame, rect, dst, order)
}

/// Write one tensor row into `frame`, resizing the frame to the tensor's
/// spatial size.
pub fn tensor_to_frame(src: &TensorSlice<'_>, frame: &mut Frame, order: ChannelOrder) -> Result<()> {
    let desc = src.desc;
    check_channels(frame, &desc)?;
    check_row(src.data.len(), &desc)?;
    frame.ensure_geometry(desc.width as u32, desc.height as u32);

    for y in 0..desc.height {
        for x in 0..desc.width {
            for c in 0..desc.channels {
                let v = read_element(src.data, desc.dtype, element_index(src.layout, &desc, c, y, x));
                let v = match desc.dtype {
                    DataType::Float32 => v * 255.0,
                    DataType::Uint8 => v,
                };
                let ch = frame_channel(frame.format, order, c);
                write_pixel(frame, x, y, ch, v);
            }
        }
    }
    Ok(())
}
