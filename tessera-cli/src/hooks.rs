//! Analytics post-processing installed by `tessera run`.

use tessera_core::convert::TensorSlice;
use tessera_core::error::{EngineError, Result};
use tessera_core::model::ModelHooks;
use tessera_core::types::{Classification, DetectionBox, DetectionSideData, Frame};

/// Values per detection row: `[image_id, label, confidence, x_min, y_min,
/// x_max, y_max]`, coordinates normalized to `[0, 1]`.
pub const DETECTION_FIELDS: usize = 7;

/// Decode detection rows; a negative image id terminates the list.
pub fn decode_detections(values: &[f32], width: u32, height: u32, threshold: f32) -> Vec<DetectionBox> {
    let (fw, fh) = (width as f32, height as f32);
    values
        .chunks_exact(DETECTION_FIELDS)
        .take_while(|row| row[0] >= 0.0)
        .filter(|row| row[2] >= threshold)
        .map(|row| {
            let x0 = (row[3].clamp(0.0, 1.0) * fw) as i32;
            let y0 = (row[4].clamp(0.0, 1.0) * fh) as i32;
            let x1 = (row[5].clamp(0.0, 1.0) * fw) as i32;
            let y1 = (row[6].clamp(0.0, 1.0) * fh) as i32;
            let mut b = DetectionBox::new(
                x0,
                y0,
                (x1 - x0).max(0),
                (y1 - y0).max(0),
                format!("class_{}", row[1] as i64),
            );
            b.confidence = row[2];
            b
        })
        .collect()
}

/// Highest-scoring class of one classification row.
pub fn top_class(values: &[f32]) -> Option<Classification> {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(class, &confidence)| Classification {
            label: format!("class_{class}"),
            confidence,
        })
}

pub fn detection_hooks(source: &str, threshold: f32) -> ModelHooks {
    let source = source.to_string();
    ModelHooks::default().with_post_process(
        move |slice: &TensorSlice<'_>, frame: &mut Frame, _region: Option<usize>| {
            let values = slice.to_f32()?;
            let boxes = decode_detections(&values, frame.width, frame.height, threshold);
            frame
                .detections
                .get_or_insert_with(|| DetectionSideData {
                    source: source.clone(),
                    boxes: Vec::new(),
                })
                .boxes
                .extend(boxes);
            Ok(())
        },
    )
}

pub fn classification_hooks() -> ModelHooks {
    ModelHooks::default().with_post_process(
        |slice: &TensorSlice<'_>, frame: &mut Frame, region: Option<usize>| -> Result<()> {
            let index = region.ok_or_else(|| {
                EngineError::InvariantViolation("classification result without a region".into())
            })?;
            let target = frame
                .detections
                .as_mut()
                .and_then(|side| side.boxes.get_mut(index))
                .ok_or_else(|| {
                    EngineError::InvariantViolation(format!("detection box {index} is gone"))
                })?;
            if target.classifications_full() {
                return Ok(());
            }
            if let Some(class) = top_class(&slice.to_f32()?) {
                target.classifications.push(class);
            }
            Ok(())
        },
    )
}
