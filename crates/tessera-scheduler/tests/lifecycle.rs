mod common;

use std::time::Duration;

use tessera_core::error::EngineError;
use tessera_core::model::ModelHooks;
use tessera_core::task::PollResult;
use tessera_core::types::{DataType, DetectionBox, FunctionKind};
use tessera_scheduler::{ModelState, SchedulerConfig};

use common::*;

#[tokio::test]
async fn resizable_input_probe_reports_scaled_output() {
    let scheduler = load(
        "probe",
        UPSAMPLE_BGR,
        FunctionKind::ProcessFrame,
        SchedulerConfig {
            input_resizable: true,
            nireq: 1,
            ..SchedulerConfig::default()
        },
        ModelHooks::default(),
    );
    let info = scheduler.input_info("x").await.unwrap();
    assert_eq!(info.channels, 3);
    assert_eq!((info.height, info.width), (None, None));
    assert_eq!(info.dtype, DataType::Float32);
    assert_eq!(scheduler.state(), ModelState::Initialized);

    let dims = scheduler.output_dims("x", 8, 6, "y").await.unwrap();
    assert_eq!(dims, (16, 12));
    assert_eq!(scheduler.state(), ModelState::Ready);
    // The probe is not a caller task.
    assert!(matches!(scheduler.poll_completed(), PollResult::Empty));
    scheduler.verify_conservation().unwrap();
}

#[tokio::test]
async fn fixed_input_reports_its_size() {
    let scheduler = load(
        "fixed",
        UPSAMPLE_BGR,
        FunctionKind::ProcessFrame,
        config(1, 1),
        ModelHooks::default(),
    );
    let info = scheduler.input_info("x").await.unwrap();
    assert_eq!((info.height, info.width), (Some(4), Some(4)));
    assert_eq!(scheduler.output_dims("x", 100, 100, "y").await.unwrap(), (8, 8));
}

#[tokio::test]
async fn output_probe_is_for_frame_models_only() {
    let scheduler = load(
        "probe_classify",
        CLASSIFIER,
        FunctionKind::AnalyticsClassify,
        config(1, 1),
        classify_hooks(),
    );
    let err = scheduler
        .output_dims("x", 8, 8, "scores")
        .await
        .expect_err("classifier has no frame output");
    assert!(matches!(err, EngineError::UnsupportedFeature(_)));
    assert_eq!(scheduler.state(), ModelState::Initialized);
}

#[tokio::test]
async fn unsupported_sync_combinations_are_rejected_before_engine_work() {
    let batched = load(
        "sync_batch",
        IDENTITY_GRAY,
        FunctionKind::ProcessFrame,
        config(2, 1),
        ModelHooks::default(),
    );
    let err = batched.submit_sync(gray_task(1)).await.expect_err("batch > 1");
    assert!(matches!(err, EngineError::UnsupportedFeature(_)));
    assert_eq!(batched.state(), ModelState::Initialized);

    let classifier = load(
        "sync_classify",
        CLASSIFIER,
        FunctionKind::AnalyticsClassify,
        config(1, 1),
        classify_hooks(),
    );
    let task = classify_task(frame_with_boxes(vec![DetectionBox::new(1, 1, 2, 2, "a")]));
    let err = classifier.submit_sync(task).await.expect_err("sync classify");
    assert!(matches!(err, EngineError::UnsupportedFeature(_)));
    assert_eq!(classifier.metrics().tasks_submitted, 0);
}

#[tokio::test]
async fn multiple_outputs_per_task_are_rejected() {
    let scheduler = load(
        "multi_out",
        IDENTITY_GRAY,
        FunctionKind::ProcessFrame,
        config(1, 1),
        ModelHooks::default(),
    );
    let task = gray_task(1).with_outputs(vec!["y".into(), "z".into()]);
    let err = scheduler.submit_async(task).await.expect_err("two outputs");
    assert!(matches!(err, EngineError::UnsupportedFeature(_)));
}

#[tokio::test]
async fn analytics_models_need_a_post_hook() {
    let dir = unique_temp_dir("no_hook");
    let path = write_model(&dir, CLASSIFIER);
    let err = tessera_scheduler::Scheduler::load(
        std::sync::Arc::new(tessera_cpu::CpuEngine::with_workers(1)),
        &path,
        FunctionKind::AnalyticsDetect,
        config(1, 1),
        ModelHooks::default(),
    )
    .expect_err("detect without a hook");
    assert!(matches!(err, EngineError::Config(_)));

    let err = tessera_scheduler::Scheduler::load(
        std::sync::Arc::new(tessera_cpu::CpuEngine::with_workers(1)),
        &path,
        FunctionKind::ProcessFrame,
        config(0, 1),
        ModelHooks::default(),
    )
    .expect_err("batch 0");
    assert!(matches!(err, EngineError::Config(_)));
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn unknown_input_fails_initialization_for_good() {
    let scheduler = load(
        "bad_input",
        IDENTITY_GRAY,
        FunctionKind::ProcessFrame,
        config(1, 1),
        ModelHooks::default(),
    );
    let mut task = gray_task(1);
    task.input_name = "data".into();
    let err = scheduler.submit_async(task).await.expect_err("no such input");
    match err {
        EngineError::MissingBinding {
            name, available, ..
        } => {
            assert_eq!(name, "data");
            assert_eq!(available, "x");
        }
        other => panic!("unexpected error variant: {other:?}"),
    }
    assert_eq!(scheduler.state(), ModelState::Failed);

    let err = scheduler
        .submit_async(gray_task(1))
        .await
        .expect_err("model is unusable");
    assert!(matches!(err, EngineError::ModelUnusable));
}

#[tokio::test]
async fn compile_failure_lists_available_devices() {
    let scheduler = load(
        "bad_device",
        IDENTITY_GRAY,
        FunctionKind::ProcessFrame,
        SchedulerConfig {
            device: "NPU".into(),
            nireq: 1,
            ..SchedulerConfig::default()
        },
        ModelHooks::default(),
    );
    let err = scheduler.submit_sync(gray_task(1)).await.expect_err("no NPU");
    match err {
        EngineError::Compile(msg) => {
            assert!(msg.contains("\"NPU\""), "{msg}");
            assert!(msg.contains("\"CPU\""), "{msg}");
        }
        other => panic!("unexpected error variant: {other:?}"),
    }
    assert_eq!(scheduler.state(), ModelState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn teardown_waits_for_in_flight_batches() {
    let scheduler = load(
        "teardown",
        &with_latency(IDENTITY_GRAY, 30),
        FunctionKind::ProcessFrame,
        config(1, 2),
        ModelHooks::default(),
    );
    scheduler.submit_async(gray_task(1)).await.unwrap();
    scheduler.submit_async(gray_task(2)).await.unwrap();

    let report = scheduler.teardown().await.unwrap();
    assert_eq!(report.slots_released, 2);
    assert_eq!(report.sub_inferences_dropped, 0);
    // Completed but never polled.
    assert_eq!(report.tasks_dropped, 2);
    assert_eq!(scheduler.state(), ModelState::Closed);

    let m = scheduler.metrics();
    assert_eq!(m.sub_inferences_completed, 2);
    scheduler.verify_conservation().unwrap();

    let err = scheduler.submit_async(gray_task(3)).await.expect_err("closed");
    assert!(matches!(err, EngineError::Closed));
    let err = scheduler.teardown().await.expect_err("already closed");
    assert!(matches!(err, EngineError::Closed));
}

#[tokio::test]
async fn teardown_drops_queued_work() {
    let scheduler = load(
        "teardown_pending",
        IDENTITY_GRAY,
        FunctionKind::ProcessFrame,
        config(4, 1),
        ModelHooks::default(),
    );
    scheduler.submit_async(gray_task(1)).await.unwrap();
    scheduler.submit_async(gray_task(2)).await.unwrap();
    assert_eq!(scheduler.pending_len(), 2);

    let report = scheduler.teardown().await.unwrap();
    assert_eq!(report.sub_inferences_dropped, 2);
    assert_eq!(report.tasks_dropped, 2);
    assert_eq!(report.slots_released, 1);
    assert_eq!(scheduler.metrics().sub_inferences_dropped, 2);
    scheduler.verify_conservation().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_sync_run_still_returns_its_slot() {
    let scheduler = load(
        "sync_cancel",
        &with_latency(IDENTITY_GRAY, 200),
        FunctionKind::ProcessFrame,
        config(1, 1),
        ModelHooks::default(),
    );
    let first =
        tokio::time::timeout(Duration::from_millis(20), scheduler.submit_sync(gray_task(1))).await;
    assert!(first.is_err(), "first run should outlive the timeout");

    let done = tokio::time::timeout(Duration::from_secs(3), scheduler.submit_sync(gray_task(2)))
        .await
        .expect("slot was returned")
        .expect("second run");
    assert!(done.out_frame.data.iter().all(|&p| p == 2));
    assert_eq!(scheduler.idle_slots(), 1);

    let m = scheduler.metrics();
    assert_eq!(m.batches_dispatched, 2);
    assert_eq!(m.sub_inferences_completed, 2);
    scheduler.verify_conservation().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_task_cancelled_while_waiting_for_a_slot_is_withdrawn() {
    let scheduler = load(
        "sync_wait_cancel",
        &with_latency(IDENTITY_GRAY, 200),
        FunctionKind::ProcessFrame,
        config(1, 1),
        ModelHooks::default(),
    );
    scheduler.submit_async(gray_task(1)).await.unwrap();
    let waited =
        tokio::time::timeout(Duration::from_millis(20), scheduler.submit_sync(gray_task(2))).await;
    assert!(waited.is_err(), "the only slot is busy");
    assert_eq!(scheduler.pending_len(), 0);

    let done = expect_done(&scheduler).await;
    assert_eq!(done.in_frame.data[0], 1);
    let m = scheduler.metrics();
    assert_eq!(m.tasks_failed, 1);
    assert_eq!(m.sub_inferences_dropped, 1);
    scheduler.verify_conservation().unwrap();

    let again = scheduler.submit_sync(gray_task(3)).await.unwrap();
    assert_eq!(again.out_frame.data[0], 3);
    assert_eq!(scheduler.idle_slots(), 1);
}
