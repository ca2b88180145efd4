//! Pending sub-inference queue and task decomposition.

use std::collections::VecDeque;

use tessera_core::error::{EngineError, Result};
use tessera_core::task::Task;
use tessera_core::types::{Frame, FunctionKind};

use crate::task_table::TaskId;

/// Atomic unit of model execution derived from a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubInference {
    pub task: TaskId,
    /// Detection box index for per-region classification.
    pub region: Option<usize>,
}

/// FIFO of sub-inferences awaiting a slot.
///
/// Unbounded unless built with a limit; pushes past the limit fail like an
/// allocation failure.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    items: VecDeque<SubInference>,
    limit: Option<usize>,
}

impl PendingQueue {
    #[cfg(test)]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            limit: Some(limit),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn front(&self) -> Option<&SubInference> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<SubInference> {
        self.items.pop_front()
    }

    pub fn push_back(&mut self, item: SubInference) -> Result<()> {
        if self.limit.is_some_and(|limit| self.items.len() >= limit) {
            return Err(EngineError::Allocation(format!(
                "pending queue is full ({} item(s))",
                self.items.len()
            )));
        }
        self.items
            .try_reserve(1)
            .map_err(|e| EngineError::Allocation(format!("pending queue: {e}")))?;
        self.items.push_back(item);
        Ok(())
    }

    /// Remove every queued sub-inference of `task`; returns how many.
    pub fn retract(&mut self, task: TaskId) -> usize {
        let before = self.items.len();
        self.items.retain(|s| s.task != task);
        before - self.items.len()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }
}

/// Whether every attached detection box can be classified.
///
/// False when side data is missing or empty, when any box leaves the frame,
/// or when any box already carries the maximum number of classifications.
pub fn has_valid_detections(frame: &Frame) -> bool {
    let Some(side) = frame.detections.as_ref() else {
        return false;
    };
    if side.boxes.is_empty() {
        return false;
    }
    side.boxes
        .iter()
        .all(|b| b.fits_within(frame.width, frame.height) && !b.classifications_full())
}

/// Region indices a task decomposes into; `None` is a whole-frame unit.
pub fn plan_regions(kind: FunctionKind, task: &Task) -> Vec<Option<usize>> {
    match kind {
        FunctionKind::ProcessFrame | FunctionKind::AnalyticsDetect => vec![None],
        FunctionKind::AnalyticsClassify => {
            if !has_valid_detections(&task.in_frame) {
                return Vec::new();
            }
            let boxes = task
                .in_frame
                .detections
                .as_ref()
                .map(|d| d.boxes.as_slice())
                .unwrap_or_default();
            boxes
                .iter()
                .enumerate()
                .filter(|(_, b)| {
                    task.target
                        .as_deref()
                        .is_none_or(|t| b.label.eq_ignore_ascii_case(t))
                })
                .map(|(i, _)| Some(i))
                .collect()
        }
    }
}

/// Append one sub-inference per region.
///
/// A failure after at least one push leaves the earlier items queued and is
/// reported as [`EngineError::PartialSubmission`].
pub(crate) fn enqueue_regions(
    queue: &mut PendingQueue,
    task: TaskId,
    regions: &[Option<usize>],
) -> Result<usize> {
    for (queued, &region) in regions.iter().enumerate() {
        if let Err(e) = queue.push_back(SubInference { task, region }) {
            if queued == 0 {
                return Err(e);
            }
            return Err(EngineError::PartialSubmission {
                queued,
                reason: e.to_string(),
            });
        }
    }
    Ok(regions.len())
}
