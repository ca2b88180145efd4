//! Caller-facing model contract and the pre/post-processing hooks a filter
//! may install.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::convert::{TensorSlice, TensorSliceMut};
use crate::error::Result;
use crate::task::{PollResult, Task};
use crate::types::{Frame, InputInfo};

/// Custom frame → tensor conversion for whole-frame models.
pub type PreProcessFn = Arc<dyn Fn(&Frame, &mut TensorSliceMut<'_>) -> Result<()> + Send + Sync>;

/// Tensor → frame routing.
///
/// The frame is the task's output frame for frame-processing models and its
/// input frame for analytics models (where results land in side data).  The
/// region index is set for per-box classification.
pub type PostProcessFn =
    Arc<dyn Fn(&TensorSlice<'_>, &mut Frame, Option<usize>) -> Result<()> + Send + Sync>;

/// Optional conversion overrides.
///
/// Hooks run while the scheduler holds its task table, on the caller's task
/// for fills and synchronous runs and on the completion path otherwise.  A
/// hook must not call back into the model that owns it (`poll_result`,
/// `execute`, ...); doing so deadlocks.
#[derive(Clone, Default)]
pub struct ModelHooks {
    pub pre_process: Option<PreProcessFn>,
    pub post_process: Option<PostProcessFn>,
}

impl ModelHooks {
    pub fn with_pre_process(
        mut self,
        f: impl Fn(&Frame, &mut TensorSliceMut<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.pre_process = Some(Arc::new(f));
        self
    }

    pub fn with_post_process(
        mut self,
        f: impl Fn(&TensorSlice<'_>, &mut Frame, Option<usize>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.post_process = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ModelHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHooks")
            .field("pre_process", &self.pre_process.is_some())
            .field("post_process", &self.post_process.is_some())
            .finish()
    }
}

/// A loaded model that executes tasks.
///
/// Synchronous execution returns the finished task; asynchronous tasks are
/// retrieved in submission order through [`poll_result`](Self::poll_result).
#[async_trait]
pub trait DnnModel: Send + Sync {
    /// Shape and element type of a named input.
    async fn input_info(&self, input_name: &str) -> Result<InputInfo>;

    /// Output `(width, height)` produced for a `width × height` input.
    async fn output_dims(
        &self,
        input_name: &str,
        width: u32,
        height: u32,
        output_name: &str,
    ) -> Result<(u32, u32)>;

    async fn execute(&self, task: Task) -> Result<Task>;
    async fn execute_async(&self, task: Task) -> Result<()>;
    fn poll_result(&self) -> PollResult;

    /// Dispatch whatever is pending, even a partial batch.
    async fn flush(&self) -> Result<()>;
}
