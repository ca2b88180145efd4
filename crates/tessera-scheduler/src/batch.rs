//! Fill and demultiplex: packing sub-inferences into a slot's input rows and
//! routing its output rows back to their tasks.
//!
//! Row `i` of a batched buffer starts at `i × row_bytes`, where
//! `row_bytes = width × height × channels × element_size` from the bound
//! buffer's NCHW dims.  Unpacking walks the occupants in pack order.

use tracing::{debug, warn};

use tessera_core::backend::InferRequest;
use tessera_core::convert::{self, TensorSlice, TensorSliceMut};
use tessera_core::error::{EngineError, Result};
use tessera_core::model::ModelHooks;
use tessera_core::types::{ChannelOrder, FunctionKind, TensorDesc};

use crate::metrics::SchedulerMetrics;
use crate::pool::RequestSlot;
use crate::queue::{PendingQueue, SubInference};
use crate::task_table::{TaskId, TaskTable};

/// Channel order models of the supported zoo expect.
pub const MODEL_CHANNEL_ORDER: ChannelOrder = ChannelOrder::Bgr;

/// Per-model conversion settings shared by fill and completion.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Routing<'a> {
    pub kind: FunctionKind,
    pub hooks: &'a ModelHooks,
    pub batch_size: usize,
}

#[inline]
fn row_desc(desc: TensorDesc) -> TensorDesc {
    TensorDesc { batch: 1, ..desc }
}

// ─── Fill ────────────────────────────────────────────────────────────────────

/// Pop up to `batch_size` sub-inferences into consecutive input rows.
///
/// Returns the occupancy.  An empty queue leaves the slot untouched.  On a
/// conversion error the items popped so far stay in `slot.occupants` for the
/// caller to drop.
pub(crate) fn fill_slot(
    routing: Routing<'_>,
    slot: &mut RequestSlot,
    pending: &mut PendingQueue,
    tasks: &TaskTable,
) -> Result<usize> {
    let Some(front) = pending.front() else {
        return Ok(0);
    };
    let input_name = tasks.get(front.task)?.task.input_name.clone();

    let RequestSlot {
        request, occupants, ..
    } = slot;
    let mut blob = request.input_blob(&input_name)?;
    let desc = row_desc(blob.desc()?);
    let row = blob.row_bytes();
    let layout = blob.layout;
    let rows_available = if row == 0 { 0 } else { blob.data.len() / row };
    let limit = routing.batch_size.min(rows_available);

    for i in 0..limit {
        let Some(item) = pending.pop_front() else {
            break;
        };
        occupants.push(item);

        let entry = tasks.get(item.task)?;
        let task = &entry.task;
        let mut dst = TensorSliceMut {
            desc,
            layout,
            data: &mut blob.data[i * row..(i + 1) * row],
        };
        match routing.kind {
            FunctionKind::ProcessFrame => {
                if task.do_ioproc {
                    match &routing.hooks.pre_process {
                        Some(pre) => pre(&task.in_frame, &mut dst)?,
                        None => convert::frame_to_tensor(&task.in_frame, &mut dst, MODEL_CHANNEL_ORDER)?,
                    }
                }
            }
            FunctionKind::AnalyticsDetect => {
                convert::frame_to_tensor(&task.in_frame, &mut dst, MODEL_CHANNEL_ORDER)?;
            }
            FunctionKind::AnalyticsClassify => {
                let region = item
                    .region
                    .and_then(|r| task.in_frame.detections.as_ref()?.boxes.get(r))
                    .ok_or_else(|| {
                        EngineError::InvariantViolation(format!(
                            "classification unit of task {} has no region",
                            item.task
                        ))
                    })?;
                convert::region_to_tensor(&task.in_frame, region, &mut dst, MODEL_CHANNEL_ORDER)?;
            }
        }
    }
    Ok(occupants.len())
}

// ─── Completion ──────────────────────────────────────────────────────────────

/// Route every output row of a finished slot to its task.
///
/// Whole-batch contract violations return `Err` with `occupants` untouched.
/// Per-row post-processing failures mark the task failed and are returned in
/// the list; `occupants` is empty on `Ok`.
pub(crate) fn complete_batch(
    routing: Routing<'_>,
    request: &dyn InferRequest,
    occupants: &mut Vec<SubInference>,
    tasks: &mut TaskTable,
    metrics: &SchedulerMetrics,
) -> Result<Vec<(TaskId, EngineError)>> {
    let occupancy = occupants.len();
    let Some(first) = occupants.first() else {
        return Err(EngineError::InvariantViolation(
            "completion for an empty slot".into(),
        ));
    };
    let output_name = tasks.get(first.task)?.task.single_output()?.to_string();

    let blob = request.output_blob(&output_name)?;
    if blob.dims[0] < occupancy {
        return Err(EngineError::BatchUnderflow {
            occupancy,
            rows: blob.dims[0],
        });
    }
    let desc = row_desc(blob.desc()?);
    let row = blob.row_bytes();
    if blob.data.len() < occupancy * row {
        return Err(EngineError::DimensionMismatch(format!(
            "output \"{output_name}\" holds {} bytes, {occupancy} row(s) need {}",
            blob.data.len(),
            occupancy * row
        )));
    }

    let mut failures = Vec::new();
    for (i, item) in occupants.drain(..).enumerate() {
        let slice = TensorSlice {
            desc,
            layout: blob.layout,
            data: &blob.data[i * row..(i + 1) * row],
        };
        let entry = tasks.get_mut(item.task)?;
        entry.outstanding = entry.outstanding.saturating_sub(1);

        let routed = post_process(routing, &slice, &mut entry.task, item.region)
            .and_then(|()| entry.task.record_done());
        match routed {
            Ok(()) => SchedulerMetrics::add(&metrics.sub_inferences_completed, 1),
            Err(e) => {
                warn!(task = item.task, region = ?item.region, error = %e, "Post-processing failed");
                entry.failed = true;
                SchedulerMetrics::add(&metrics.sub_inferences_dropped, 1);
                failures.push((item.task, e));
            }
        }
    }
    debug!(occupancy, output = %output_name, "Batch demultiplexed");
    Ok(failures)
}

fn post_process(
    routing: Routing<'_>,
    slice: &TensorSlice<'_>,
    task: &mut tessera_core::task::Task,
    region: Option<usize>,
) -> Result<()> {
    let hook = routing.hooks.post_process.as_ref();
    match routing.kind {
        FunctionKind::ProcessFrame => {
            if !task.do_ioproc {
                task.out_frame.width = slice.desc.width as u32;
                task.out_frame.height = slice.desc.height as u32;
                return Ok(());
            }
            match hook {
                Some(post) => post(slice, &mut task.out_frame, None),
                None => convert::tensor_to_frame(slice, &mut task.out_frame, MODEL_CHANNEL_ORDER),
            }
        }
        FunctionKind::AnalyticsDetect | FunctionKind::AnalyticsClassify => {
            let post = hook.ok_or_else(|| {
                EngineError::Config(format!("{:?} models need a post-processing hook", routing.kind))
            })?;
            post(slice, &mut task.in_frame, region)
        }
    }
}

/// Discard packed sub-inferences whose batch will never complete.
pub(crate) fn drop_occupants(
    occupants: &mut Vec<SubInference>,
    tasks: &mut TaskTable,
    metrics: &SchedulerMetrics,
) -> usize {
    let n = occupants.len();
    for item in occupants.drain(..) {
        if let Ok(entry) = tasks.get_mut(item.task) {
            entry.outstanding = entry.outstanding.saturating_sub(1);
            entry.failed = true;
        }
    }
    SchedulerMetrics::add(&metrics.sub_inferences_dropped, n);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::backend::{AsyncCompletion, Blob, BlobMut, DispatchRejected};
    use tessera_core::task::{ExecMode, Task};
    use tessera_core::types::{Frame, Layout, PixelFormat, Precision};

    /// In-memory request with `[batch, 1, 1, 2]` u8 input and output.
    struct EchoRequest {
        batch: usize,
        input: Vec<u8>,
        output: Vec<u8>,
    }

    impl EchoRequest {
        fn new(batch: usize) -> Self {
            Self {
                batch,
                input: vec![0; batch * 2],
                output: vec![0; batch * 2],
            }
        }
    }

    impl InferRequest for EchoRequest {
        fn input_blob(&mut self, _name: &str) -> Result<BlobMut<'_>> {
            Ok(BlobMut {
                dims: [self.batch, 1, 1, 2],
                precision: Precision::U8,
                layout: Layout::Nhwc,
                data: &mut self.input,
            })
        }
        fn output_blob(&self, _name: &str) -> Result<Blob<'_>> {
            Ok(Blob {
                dims: [self.batch, 1, 1, 2],
                precision: Precision::U8,
                layout: Layout::Nhwc,
                data: &self.output,
            })
        }
        fn infer(&mut self) -> Result<()> {
            self.output.copy_from_slice(&self.input);
            Ok(())
        }
        fn infer_async(
            self: Box<Self>,
            on_complete: AsyncCompletion,
        ) -> std::result::Result<(), DispatchRejected> {
            on_complete(self, Ok(()));
            Ok(())
        }
    }

    fn gray_task(pixels: [u8; 2]) -> Task {
        let frame = Frame::from_data(2, 1, PixelFormat::Gray8, pixels.to_vec()).unwrap();
        let mut t = Task::new("x", "y", frame, Frame::placeholder(0, 0, PixelFormat::Gray8));
        t.begin(ExecMode::Async, 1);
        t
    }

    fn enqueue(tasks: &mut TaskTable, pending: &mut PendingQueue, task: Task) -> TaskId {
        let id = tasks.insert(task, true).unwrap();
        tasks.get_mut(id).unwrap().outstanding = 1;
        pending.push_back(SubInference { task: id, region: None }).unwrap();
        id
    }

    #[test]
    fn fill_packs_min_of_queue_and_batch_in_order() {
        let hooks = ModelHooks::default();
        let routing = Routing {
            kind: FunctionKind::ProcessFrame,
            hooks: &hooks,
            batch_size: 2,
        };
        let mut tasks = TaskTable::default();
        let mut pending = PendingQueue::default();
        for px in [[1, 2], [3, 4], [5, 6]] {
            enqueue(&mut tasks, &mut pending, gray_task(px));
        }
        let mut slot = RequestSlot {
            id: 0,
            request: Box::new(EchoRequest::new(2)),
            occupants: Vec::new(),
        };

        assert_eq!(fill_slot(routing, &mut slot, &mut pending, &tasks).unwrap(), 2);
        assert_eq!(pending.len(), 1);
        let ids: Vec<_> = slot.occupants.iter().map(|s| s.task).collect();
        assert_eq!(ids, vec![0, 1]);
        let blob = slot.request.input_blob("x").unwrap();
        assert_eq!(&*blob.data, &[1u8, 2, 3, 4][..]);
    }

    #[test]
    fn completion_routes_rows_and_empties_occupants() {
        let hooks = ModelHooks::default();
        let routing = Routing {
            kind: FunctionKind::ProcessFrame,
            hooks: &hooks,
            batch_size: 2,
        };
        let mut tasks = TaskTable::default();
        let mut pending = PendingQueue::default();
        let a = enqueue(&mut tasks, &mut pending, gray_task([7, 8]));
        let b = enqueue(&mut tasks, &mut pending, gray_task([9, 10]));
        let mut slot = RequestSlot {
            id: 0,
            request: Box::new(EchoRequest::new(2)),
            occupants: Vec::new(),
        };
        fill_slot(routing, &mut slot, &mut pending, &tasks).unwrap();
        slot.request.infer().unwrap();

        let metrics = SchedulerMetrics::new();
        let failures =
            complete_batch(routing, slot.request.as_ref(), &mut slot.occupants, &mut tasks, &metrics)
                .unwrap();
        assert!(failures.is_empty());
        assert!(slot.occupants.is_empty());
        assert_eq!(tasks.get(a).unwrap().task.out_frame.data, vec![7, 8]);
        assert_eq!(tasks.get(b).unwrap().task.out_frame.data, vec![9, 10]);
        assert!(tasks.get(b).unwrap().is_settled());
    }

    #[test]
    fn output_batch_smaller_than_occupancy_is_a_contract_violation() {
        let hooks = ModelHooks::default();
        let routing = Routing {
            kind: FunctionKind::ProcessFrame,
            hooks: &hooks,
            batch_size: 2,
        };
        let mut tasks = TaskTable::default();
        let mut pending = PendingQueue::default();
        let a = enqueue(&mut tasks, &mut pending, gray_task([1, 1]));
        let b = enqueue(&mut tasks, &mut pending, gray_task([2, 2]));
        let mut occupants = vec![
            pending.pop_front().unwrap(),
            pending.pop_front().unwrap(),
        ];
        let request = EchoRequest::new(1);
        let metrics = SchedulerMetrics::new();
        let err = complete_batch(routing, &request, &mut occupants, &mut tasks, &metrics)
            .expect_err("one output row for two occupants");
        assert!(matches!(err, EngineError::BatchUnderflow { occupancy: 2, rows: 1 }));
        assert_eq!(occupants.len(), 2);

        assert_eq!(drop_occupants(&mut occupants, &mut tasks, &metrics), 2);
        assert!(tasks.get(a).unwrap().failed && tasks.get(b).unwrap().is_settled());
    }

    #[test]
    fn probe_without_ioproc_only_records_output_size() {
        let hooks = ModelHooks::default();
        let routing = Routing {
            kind: FunctionKind::ProcessFrame,
            hooks: &hooks,
            batch_size: 1,
        };
        let mut tasks = TaskTable::default();
        let mut probe = Task::new(
            "x",
            "y",
            Frame::placeholder(2, 1, PixelFormat::Gray8),
            Frame::placeholder(0, 0, PixelFormat::Gray8),
        )
        .with_ioproc(false);
        probe.begin(ExecMode::Sync, 1);
        let mut pending = PendingQueue::default();
        let id = enqueue(&mut tasks, &mut pending, probe);
        let mut slot = RequestSlot {
            id: 0,
            request: Box::new(EchoRequest::new(1)),
            occupants: Vec::new(),
        };
        fill_slot(routing, &mut slot, &mut pending, &tasks).unwrap();
        let metrics = SchedulerMetrics::new();
        complete_batch(routing, slot.request.as_ref(), &mut slot.occupants, &mut tasks, &metrics)
            .unwrap();
        let out = &tasks.get(id).unwrap().task.out_frame;
        assert_eq!((out.width, out.height), (2, 1));
        assert!(out.data.is_empty());
    }
}
