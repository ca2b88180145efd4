//! Caller-level unit of work and the poll protocol.

use crate::error::{EngineError, Result};
use crate::types::Frame;

/// How a task's slot is dispatched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecMode {
    #[default]
    Sync,
    Async,
}

/// One input sample plus the outputs expected from it.
///
/// `inference_done` only ever grows and never passes `inference_todo`; the
/// task is complete exactly when they are equal.
#[derive(Debug)]
pub struct Task {
    pub input_name: String,
    pub output_names: Vec<String>,
    pub in_frame: Frame,
    pub out_frame: Frame,
    /// Convert frames to and from tensors around the engine call.
    pub do_ioproc: bool,
    /// Case-insensitive label filter applied to detection boxes.
    pub target: Option<String>,
    mode: ExecMode,
    inference_todo: u32,
    inference_done: u32,
}

impl Task {
    pub fn new(
        input_name: impl Into<String>,
        output_name: impl Into<String>,
        in_frame: Frame,
        out_frame: Frame,
    ) -> Self {
        Self {
            input_name: input_name.into(),
            output_names: vec![output_name.into()],
            in_frame,
            out_frame,
            do_ioproc: true,
            target: None,
            mode: ExecMode::Sync,
            inference_todo: 0,
            inference_done: 0,
        }
    }

    pub fn with_ioproc(mut self, do_ioproc: bool) -> Self {
        self.do_ioproc = do_ioproc;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_outputs(mut self, names: Vec<String>) -> Self {
        self.output_names = names;
        self
    }

    #[inline]
    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    #[inline]
    pub fn inference_todo(&self) -> u32 {
        self.inference_todo
    }

    #[inline]
    pub fn inference_done(&self) -> u32 {
        self.inference_done
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.inference_done == self.inference_todo
    }

    /// Reset counters for a fresh submission.
    pub fn begin(&mut self, mode: ExecMode, inference_todo: u32) {
        self.mode = mode;
        self.inference_todo = inference_todo;
        self.inference_done = 0;
    }

    /// Record one finished sub-inference.
    pub fn record_done(&mut self) -> Result<()> {
        if self.inference_done >= self.inference_todo {
            return Err(EngineError::InvariantViolation(format!(
                "inference_done would exceed inference_todo ({})",
                self.inference_todo
            )));
        }
        self.inference_done += 1;
        Ok(())
    }

    /// The single output binding, rejecting multi-output tasks.
    pub fn single_output(&self) -> Result<&str> {
        match self.output_names.as_slice() {
            [name] => Ok(name),
            [] => Err(EngineError::Config("task names no output".into())),
            _ => Err(EngineError::UnsupportedFeature(
                "multiple outputs per task".into(),
            )),
        }
    }
}

/// Outcome of polling the completed-task queue.
#[derive(Debug)]
pub enum PollResult {
    /// Nothing was submitted asynchronously, or everything was retrieved.
    Empty,
    /// The oldest task is still running.
    NotReady,
    Done(Task),
    /// The task lost sub-inferences to a dispatch or post-processing failure.
    Failed(Task),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    fn task() -> Task {
        Task::new(
            "x",
            "y",
            Frame::new(2, 2, PixelFormat::Gray8),
            Frame::new(2, 2, PixelFormat::Gray8),
        )
    }

    #[test]
    fn done_never_exceeds_todo() {
        let mut t = task();
        t.begin(ExecMode::Async, 2);
        assert!(!t.is_complete());
        t.record_done().unwrap();
        t.record_done().unwrap();
        assert!(t.is_complete());
        let err = t.record_done().expect_err("third increment must fail");
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert_eq!(t.inference_done(), 2);
    }

    #[test]
    fn zero_todo_is_trivially_complete() {
        let mut t = task();
        t.begin(ExecMode::Async, 0);
        assert!(t.is_complete());
    }

    #[test]
    fn multiple_outputs_are_unsupported() {
        let t = task().with_outputs(vec!["a".into(), "b".into()]);
        let err = t.single_output().expect_err("two outputs");
        assert!(matches!(err, EngineError::UnsupportedFeature(_)));
    }
}
