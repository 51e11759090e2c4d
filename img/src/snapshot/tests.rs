use std::fs;
use std::path::Path;

use tempfile::TempDir;

use super::*;

fn snapshotter() -> (TempDir, Snapshotter) {
    let temp = TempDir::new().unwrap();
    let sn = Snapshotter::new(temp.path(), DiffStrategy::DirectCompare).unwrap();
    (temp, sn)
}

fn snapshot_entries(sn: &Snapshotter) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(sn.snapshots_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Prepare `key` on `parent`, write `files` into it and commit it as `name`.
fn commit_with(sn: &Snapshotter, key: &str, parent: &str, name: &str, files: &[(&str, &str)]) {
    let mounts = sn.prepare(key, parent).unwrap();
    for (path, content) in files {
        let target = mounts[0].source.join(path);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(target, content).unwrap();
    }
    sn.commit(name, key).unwrap();
}

#[test]
fn test_prepare_root_creates_active_dir() {
    let (_temp, sn) = snapshotter();
    let mounts = sn.prepare("k1", "").unwrap();

    assert_eq!(mounts.len(), 1);
    assert!(!mounts[0].is_readonly());
    assert!(mounts[0].source.is_dir());
    let name = mounts[0].source.file_name().unwrap().to_string_lossy();
    assert!(name.starts_with("active-"));
    assert_eq!(sn.stat("k1").unwrap().kind, Kind::Active);
}

#[test]
fn test_child_sees_parent_content() {
    let (_temp, sn) = snapshotter();
    commit_with(&sn, "k1", "", "base", &[("etc/hostname", "box")]);

    let mounts = sn.prepare("k2", "base").unwrap();
    let hostname = mounts[0].source.join("etc/hostname");
    assert_eq!(fs::read_to_string(&hostname).unwrap(), "box");

    // Writes in the child never reach the parent.
    fs::write(&hostname, "changed").unwrap();
    let base = sn.committed_dir("base").unwrap();
    assert_eq!(fs::read_to_string(base.join("etc/hostname")).unwrap(), "box");
}

#[test]
fn test_view_is_readonly_and_points_at_parent() {
    let (_temp, sn) = snapshotter();
    commit_with(&sn, "k1", "", "base", &[("a", "1")]);

    let mounts = sn.view("v1", "base").unwrap();
    assert!(mounts[0].is_readonly());
    assert_eq!(mounts[0].source, sn.committed_dir("base").unwrap());

    let empty = sn.view("v2", "").unwrap();
    assert!(empty[0].is_readonly());
    assert!(empty[0].source.is_dir());
}

#[test]
fn test_mounts_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let first = {
        let sn = Snapshotter::new(temp.path(), DiffStrategy::DirectCompare).unwrap();
        sn.prepare("k1", "").unwrap()
    };
    let sn = Snapshotter::new(temp.path(), DiffStrategy::DirectCompare).unwrap();
    assert_eq!(sn.mounts("k1").unwrap(), first);
}

#[test]
fn test_mounts_of_committed_is_invalid() {
    let (_temp, sn) = snapshotter();
    commit_with(&sn, "k1", "", "base", &[]);
    assert!(matches!(sn.mounts("base"), Err(ImgError::InvalidState(_))));
}

#[test]
fn test_commit_renames_and_records_usage() {
    let (_temp, sn) = snapshotter();
    commit_with(&sn, "k1", "", "base", &[("f", "12345")]);

    assert!(matches!(sn.stat("k1"), Err(ImgError::NotFound(_))));
    let info = sn.stat("base").unwrap();
    assert_eq!(info.kind, Kind::Committed);

    let usage = sn.usage("base").unwrap();
    assert_eq!(usage.size, 5);
    assert_eq!(usage.inodes, 2);
    assert!(snapshot_entries(&sn).iter().all(|n| !n.starts_with("active-")));
}

#[test]
fn test_commit_is_atomic_when_store_fails() {
    let (_temp, sn) = snapshotter();
    let mounts = sn.prepare("k1", "").unwrap();
    fs::write(mounts[0].source.join("f"), "x").unwrap();
    let before = snapshot_entries(&sn);

    sn.store().fail_next_commit();
    let err = sn.commit("base", "k1").unwrap_err();
    assert!(matches!(err, ImgError::TransactionFailed(_)));

    assert!(matches!(sn.stat("base"), Err(ImgError::NotFound(_))));
    assert_eq!(sn.stat("k1").unwrap().kind, Kind::Active);
    assert_eq!(snapshot_entries(&sn), before);
    assert!(mounts[0].source.join("f").exists());

    // The snapshot is still usable afterwards.
    sn.commit("base", "k1").unwrap();
}

#[test]
fn test_commit_of_view_is_invalid() {
    let (_temp, sn) = snapshotter();
    sn.view("v1", "").unwrap();
    assert!(matches!(sn.commit("x", "v1"), Err(ImgError::InvalidState(_))));
}

#[test]
fn test_prepare_errors_leave_no_temp_dirs() {
    let (_temp, sn) = snapshotter();
    sn.prepare("k1", "").unwrap();

    assert!(matches!(sn.prepare("k1", ""), Err(ImgError::AlreadyExists(_))));
    assert!(matches!(sn.prepare("k2", "missing"), Err(ImgError::NotFound(_))));
    assert!(matches!(sn.prepare("k3", "k1"), Err(ImgError::InvalidState(_))));

    assert!(snapshot_entries(&sn).iter().all(|n| !n.starts_with("new-")));
}

#[test]
fn test_prepare_failed_commit_cleans_up() {
    let (_temp, sn) = snapshotter();
    sn.store().fail_next_commit();
    assert!(sn.prepare("k1", "").is_err());
    assert!(matches!(sn.stat("k1"), Err(ImgError::NotFound(_))));
    assert!(snapshot_entries(&sn).is_empty());
}

#[test]
fn test_remove_deletes_dir_and_second_remove_is_not_found() {
    let (_temp, sn) = snapshotter();
    let mounts = sn.prepare("k1", "").unwrap();

    sn.remove("k1").unwrap();
    assert!(!mounts[0].source.exists());
    assert!(snapshot_entries(&sn).is_empty());
    assert!(matches!(sn.remove("k1"), Err(ImgError::NotFound(_))));
}

#[test]
fn test_remove_with_children_fails() {
    let (_temp, sn) = snapshotter();
    commit_with(&sn, "k1", "", "base", &[]);
    sn.prepare("k2", "base").unwrap();

    assert!(matches!(sn.remove("base"), Err(ImgError::HasChildren(_))));
    assert!(sn.committed_dir("base").unwrap().is_dir());
}

#[test]
fn test_remove_failed_commit_restores_dir() {
    let (_temp, sn) = snapshotter();
    let mounts = sn.prepare("k1", "").unwrap();
    fs::write(mounts[0].source.join("keep"), "x").unwrap();

    sn.store().fail_next_commit();
    assert!(sn.remove("k1").is_err());

    assert!(mounts[0].source.join("keep").exists());
    assert_eq!(sn.stat("k1").unwrap().kind, Kind::Active);
    assert!(snapshot_entries(&sn).iter().all(|n| !n.starts_with("removed-")));
}

#[test]
fn test_remove_parented_view_keeps_parent_dir() {
    let (_temp, sn) = snapshotter();
    commit_with(&sn, "k1", "", "base", &[("a", "1")]);
    sn.view("v1", "base").unwrap();

    sn.remove("v1").unwrap();
    assert!(sn.committed_dir("base").unwrap().join("a").exists());
}

#[test]
fn test_walk_and_parent_chain() {
    let (_temp, sn) = snapshotter();
    commit_with(&sn, "k1", "", "l1", &[("a", "1")]);
    commit_with(&sn, "k2", "l1", "l2", &[("b", "2")]);
    sn.prepare("k3", "l2").unwrap();

    let mut names = Vec::new();
    sn.walk(|info| {
        names.push(info.name.clone());
        Ok(())
    })
    .unwrap();
    assert_eq!(names, vec!["l1", "l2"]);

    let chain: Vec<String> = sn
        .parent_chain("k3")
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(chain, vec!["l2", "l1"]);
}

#[test]
fn test_usage_of_active_is_live() {
    let (_temp, sn) = snapshotter();
    let mounts = sn.prepare("k1", "").unwrap();
    assert_eq!(sn.usage("k1").unwrap().size, 0);

    fs::write(mounts[0].source.join("f"), vec![0u8; 64]).unwrap();
    assert_eq!(sn.usage("k1").unwrap().size, 64);
}

#[test]
fn test_update_labels() {
    let (_temp, sn) = snapshotter();
    sn.prepare("k1", "").unwrap();

    let mut info = sn.stat("k1").unwrap();
    info.labels.insert("stage".into(), "build".into());
    let updated = sn.update(&info, &["labels.stage"]).unwrap();
    assert_eq!(updated.labels.get("stage").map(String::as_str), Some("build"));
    assert_eq!(sn.stat("k1").unwrap().labels, updated.labels);
}

fn touch_dir(root: &Path, name: &str) {
    fs::create_dir(root.join(name)).unwrap();
}

#[test]
fn test_reconcile_sweeps_leftovers() {
    let (_temp, sn) = snapshotter();
    let mounts = sn.prepare("k1", "").unwrap();
    commit_with(&sn, "k2", "", "base", &[]);

    let snapshots = sn.snapshots_dir();
    touch_dir(&snapshots, "new-abc123");
    touch_dir(&snapshots, "removed-99");
    touch_dir(&snapshots, "active-77");
    fs::write(snapshots.join("stray"), "").unwrap();

    let report = sn.reconcile().unwrap();
    assert_eq!(report.removed.len(), 4);
    assert!(report.restored.is_empty());
    assert!(mounts[0].source.is_dir());
    assert!(sn.committed_dir("base").unwrap().is_dir());
    assert_eq!(snapshot_entries(&sn).len(), 2);
}

#[test]
fn test_reconcile_restores_interrupted_commit() {
    let (_temp, sn) = snapshotter();
    let mounts = sn.prepare("k1", "").unwrap();
    let active = mounts[0].source.clone();
    let id = active
        .file_name()
        .unwrap()
        .to_string_lossy()
        .trim_start_matches("active-")
        .to_string();

    // Directory renamed but the record never committed.
    fs::rename(&active, sn.snapshot_dir(&id)).unwrap();

    let report = sn.reconcile().unwrap();
    assert_eq!(report.restored, vec![active.clone()]);
    assert!(active.is_dir());
    sn.commit("base", "k1").unwrap();
}

#[test]
fn test_concurrent_steps_on_distinct_keys() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 10;

    let (_temp, sn) = snapshotter();
    commit_with(&sn, "k0", "", "base", &[("etc/os-release", "ID=test")]);

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let sn = &sn;
            scope.spawn(move || {
                for r in 0..ROUNDS {
                    let key = format!("step-{}-{}", t, r);
                    let name = format!("layer-{}-{}", t, r);
                    let mounts = sn.prepare(&key, "base").unwrap();
                    assert!(mounts[0].source.join("etc/os-release").is_file());
                    fs::write(mounts[0].source.join("step"), name.as_bytes()).unwrap();
                    sn.commit(&name, &key).unwrap();
                    // Keep the last layer of every thread.
                    if r + 1 < ROUNDS {
                        sn.remove(&name).unwrap();
                    }
                }
            });
        }
    });

    let mut committed = Vec::new();
    sn.walk(|info| {
        committed.push(info.name.clone());
        Ok(())
    })
    .unwrap();
    committed.sort();
    assert_eq!(committed.len(), THREADS + 1);
    assert!(committed.contains(&"base".to_string()));
    assert!(committed.contains(&format!("layer-0-{}", ROUNDS - 1)));

    let report = sn.reconcile().unwrap();
    assert!(report.removed.is_empty());
    assert!(report.restored.is_empty());
    assert_eq!(snapshot_entries(&sn).len(), THREADS + 1);
}
