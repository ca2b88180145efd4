use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "tessera_cli_{label}_{}_{}",
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_upsample_model(dir: &Path) -> PathBuf {
    let path = dir.join("sr.json");
    fs::write(
        &path,
        r#"{
            "name": "sr",
            "inputs": [{"name": "x", "dims": [1, 3, 4, 4], "precision": "fp32"}],
            "outputs": [{"name": "y", "precision": "fp32", "op": {"kind": "upsample", "scale": 2}}]
        }"#,
    )
    .expect("write model");
    path
}

fn tessera(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tessera"))
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .expect("run tessera")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|e| {
        panic!(
            "stdout is not a single JSON object ({e}): {stdout}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
}

#[test]
fn help_lists_subcommands() {
    let output = tessera(&["help"]);
    assert!(
        output.status.success(),
        "tessera help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["run", "inspect", "devices"] {
        assert!(stdout.contains(command), "missing {command} in help output");
    }
}

#[test]
fn devices_json_lists_cpu() {
    let output = tessera(&["devices", "--json"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["command"], "devices");
    assert_eq!(value["engine"], "cpu");
    assert_eq!(value["devices"], serde_json::json!(["CPU"]));
}

#[test]
fn async_batched_run_completes_every_frame() {
    let dir = unique_temp_dir("run_async");
    let model = write_upsample_model(&dir);
    let output = tessera(&[
        "run",
        "--model",
        model.to_str().expect("utf8 path"),
        "--frames",
        "5",
        "--width",
        "16",
        "--height",
        "16",
        "--batch-size",
        "2",
        "--nireq",
        "2",
        "--json",
    ]);
    assert!(
        output.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["ok"], true);
    assert_eq!(value["mode"], "async");
    assert_eq!(value["tally"]["completed"], 5);
    assert_eq!(value["tally"]["failed"], 0);
    let metrics = &value["metrics"];
    assert_eq!(metrics["rows_dispatched"], 5);
    // Two full batches, then one flushed partial batch.
    assert_eq!(metrics["batches_dispatched"], 3);
    assert!(metrics["peak_busy_slots"].as_u64().expect("peak") <= 2);
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn config_file_is_overridden_by_flags() {
    let dir = unique_temp_dir("run_config");
    let model = write_upsample_model(&dir);
    let config = dir.join("config.json");
    fs::write(&config, r#"{"nireq": 1, "batch_size": 4}"#).expect("write config");
    let output = tessera(&[
        "run",
        "--model",
        model.to_str().expect("utf8 path"),
        "--config",
        config.to_str().expect("utf8 path"),
        "--batch-size",
        "1",
        "--mode",
        "sync",
        "--frames",
        "3",
        "--json",
    ]);
    assert!(
        output.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = stdout_json(&output);
    assert_eq!(value["config"]["nireq"], 1);
    assert_eq!(value["config"]["batch_size"], 1);
    assert_eq!(value["tally"]["completed"], 3);
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn sync_run_with_batching_exits_with_error_code() {
    let dir = unique_temp_dir("run_sync_batch");
    let model = write_upsample_model(&dir);
    let output = tessera(&[
        "run",
        "--model",
        model.to_str().expect("utf8 path"),
        "--mode",
        "sync",
        "--batch-size",
        "2",
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(401));
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["ok"], false);
    assert_eq!(value["code"], 401);
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn missing_model_exits_with_read_error() {
    let dir = unique_temp_dir("run_missing");
    let output = tessera(&[
        "run",
        "--model",
        dir.join("absent.json").to_str().expect("utf8 path"),
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(300));
    let value = stdout_json(&output);
    assert_eq!(value["command"], "run");
    assert_eq!(value["ok"], false);
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn inspect_probes_resized_output() {
    let dir = unique_temp_dir("inspect");
    let model = write_upsample_model(&dir);
    let output = tessera(&[
        "inspect",
        "--model",
        model.to_str().expect("utf8 path"),
        "--input-resizable",
        "--width",
        "8",
        "--height",
        "6",
        "--json",
    ]);
    assert!(
        output.status.success(),
        "inspect failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["input"], "x");
    assert_eq!(value["input_info"]["channels"], 3);
    assert!(value["input_info"]["height"].is_null());
    assert_eq!(value["output_dims"]["width"], 16);
    assert_eq!(value["output_dims"]["height"], 12);
    let _ = fs::remove_dir_all(dir);
}
