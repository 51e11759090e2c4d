//! Worker facade tests with a shell-script runtime.

mod common;

use std::fs;
use std::path::Path;

use img::executor::{Meta, RootfsMode};
use img::{ImgError, ImgOptions, StepRequest, Worker};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::fake_runtime;

fn options(state: &Path, runtime: &Path) -> ImgOptions {
    ImgOptions {
        runtime: runtime.display().to_string(),
        rootless: true,
        rootfs_mode: Some(RootfsMode::Direct),
        ..ImgOptions::with_state_dir(state)
    }
}

fn step(parent: &str, name: &str, script: &str) -> StepRequest {
    StepRequest {
        meta: Meta {
            args: vec!["/bin/sh".into(), "-c".into(), script.into()],
            ..Default::default()
        },
        parent: parent.into(),
        name: name.into(),
        ..Default::default()
    }
}

/// Runtime that appends its step's last argument to `$root/log`.
fn logging_runtime(dir: &Path) -> std::path::PathBuf {
    fake_runtime(dir, "echo \"$9\" >> \"$root/log\"\nexit 0")
}

#[tokio::test]
async fn test_run_step_commits_and_describes() {
    let temp = TempDir::new().unwrap();
    let runtime = logging_runtime(temp.path());
    let worker = Worker::new(options(&temp.path().join("state"), &runtime)).unwrap();

    let base = worker
        .run_step(CancellationToken::new(), step("", "base", "echo a"))
        .await
        .unwrap();
    assert_eq!(base, "base");

    let top = worker
        .run_step(CancellationToken::new(), step("base", "top", "echo b"))
        .await
        .unwrap();

    let dir = worker.snapshotter().committed_dir(&top).unwrap();
    assert_eq!(fs::read_to_string(dir.join("log")).unwrap().lines().count(), 2);

    let description = worker.describe("top").await.unwrap();
    assert_eq!(
        description,
        "top: exec /bin/sh -c echo b\nbase: exec /bin/sh -c echo a"
    );

    let names: Vec<String> = worker
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(names.len(), 2);
}

#[tokio::test]
async fn test_failed_step_leaves_nothing() {
    let temp = TempDir::new().unwrap();
    let runtime = fake_runtime(temp.path(), "exit 2");
    let worker = Worker::new(options(&temp.path().join("state"), &runtime)).unwrap();

    let err = worker
        .run_step(CancellationToken::new(), step("", "", "false"))
        .await
        .unwrap_err();
    assert!(matches!(err, ImgError::ExecutionFailed { code: 2 }));
    assert!(worker.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disk_usage_and_prune() {
    let temp = TempDir::new().unwrap();
    let runtime = logging_runtime(temp.path());
    let worker = Worker::new(options(&temp.path().join("state"), &runtime)).unwrap();

    for (parent, name) in [("", "l1"), ("l1", "l2"), ("l2", "l3")] {
        worker
            .run_step(CancellationToken::new(), step(parent, name, "true"))
            .await
            .unwrap();
    }
    worker.snapshotter().prepare("wip", "l1").unwrap();

    let all = worker.disk_usage::<&str>(&[]).await.unwrap();
    assert_eq!(all.len(), 4);
    let l1 = all.iter().find(|r| r.id == "l1").unwrap();
    assert!(l1.in_use);
    assert!(l1.size > 0);
    assert!(l1.description.as_deref().unwrap().starts_with("exec "));

    let reclaimable = worker.disk_usage(&["reclaimable=true"]).await.unwrap();
    assert_eq!(
        reclaimable.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
        vec!["l3"]
    );
    let mutable = worker.disk_usage(&["mutable=true"]).await.unwrap();
    assert_eq!(mutable[0].id, "wip");
    assert!(worker.disk_usage(&["bogus=1"]).await.is_err());

    let pruned: Vec<String> = worker
        .prune()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(pruned, vec!["l3", "l2"]);

    let left: Vec<String> = worker
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(left.len(), 2);
    assert!(left.contains(&"l1".to_string()));
    assert!(left.contains(&"wip".to_string()));
}

#[tokio::test]
async fn test_export_and_apply_layer() {
    let temp = TempDir::new().unwrap();
    let runtime = fake_runtime(
        temp.path(),
        "mkdir -p \"$root/opt\"\necho hi > \"$root/opt/hello\"\nexit 0",
    );
    let worker = Worker::new(options(&temp.path().join("state"), &runtime)).unwrap();
    worker
        .run_step(CancellationToken::new(), step("", "built", "true"))
        .await
        .unwrap();

    let layer_path = temp.path().join("layer.tar.gz");
    let file = fs::File::create(&layer_path).unwrap();
    let desc = worker.export_diff("built", file).await.unwrap();
    assert!(desc.digest.starts_with("sha256:"));
    assert_eq!(desc.size, fs::metadata(&layer_path).unwrap().len());

    let applied = worker
        .apply_layer("", "imported", fs::File::open(&layer_path).unwrap())
        .await
        .unwrap();
    assert_eq!(applied.name, "imported");
    assert!(applied.entries >= 2);

    let dir = worker.snapshotter().committed_dir("imported").unwrap();
    assert_eq!(fs::read_to_string(dir.join("opt/hello")).unwrap(), "hi\n");
    assert_eq!(worker.describe("imported").await.unwrap(), "imported: apply layer");
}

#[tokio::test]
async fn test_state_dir_is_locked() {
    let temp = TempDir::new().unwrap();
    let runtime = logging_runtime(temp.path());
    let state = temp.path().join("state");
    let _worker = Worker::new(options(&state, &runtime)).unwrap();

    let err = Worker::new(options(&state, &runtime)).unwrap_err();
    assert!(matches!(err, ImgError::Config(_)));
}

#[tokio::test]
async fn test_unknown_backend_has_context() {
    let temp = TempDir::new().unwrap();
    let runtime = logging_runtime(temp.path());
    let mut opts = options(&temp.path().join("state"), &runtime);
    opts.backend = "overlayfs".into();

    let err = Worker::new(opts).unwrap_err();
    assert!(
        err.to_string()
            .contains("creating overlayfs snapshotter failed")
    );
}
