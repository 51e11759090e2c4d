//! Process-wide registry of live mount targets.
//!
//! Every [`MountGuard`](super::MountGuard) registers its target here while it
//! holds mounts. [`install_shutdown_hook`] starts a thread that waits for a
//! terminating signal, releases every registered target and exits with
//! status 1, so an interrupted build does not leak kernel mounts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use img_shared::{ImgError, ImgResult};

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::default);

static HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Default, Clone, Copy)]
struct Entry {
    /// Live guards on the target.
    guards: usize,
    /// Mounts stacked on the target across those guards.
    depth: usize,
}

#[derive(Debug, Default)]
struct Registry {
    entries: Mutex<HashMap<PathBuf, Entry>>,
}

impl Registry {
    fn register(&self, target: &Path) {
        self.entries
            .lock()
            .entry(target.to_path_buf())
            .or_default()
            .guards += 1;
    }

    fn unregister(&self, target: &Path) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(target) {
            entry.guards = entry.guards.saturating_sub(1);
            if entry.guards == 0 {
                entries.remove(target);
            }
        }
    }

    fn adjust_depth(&self, target: &Path, mounted: bool) {
        if let Some(entry) = self.entries.lock().get_mut(target) {
            if mounted {
                entry.depth += 1;
            } else {
                entry.depth = entry.depth.saturating_sub(1);
            }
        }
    }

    fn targets(&self) -> Vec<PathBuf> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Take every target off the registry and unmount it as many times as
    /// mounts are stacked on it, deepest path first.
    fn release_with(&self, mut unmount: impl FnMut(&Path) -> ImgResult<()>) -> usize {
        let mut targets: Vec<(PathBuf, usize)> = self
            .entries
            .lock()
            .drain()
            .map(|(target, entry)| (target, entry.depth))
            .collect();
        targets.sort_by_key(|(t, _)| std::cmp::Reverse(t.components().count()));

        let mut released = 0;
        for (target, depth) in targets {
            let mut ok = true;
            for _ in 0..depth {
                if let Err(e) = unmount(&target) {
                    tracing::error!(target = %target.display(), error = %e, "Shutdown unmount failed");
                    ok = false;
                    break;
                }
            }
            if ok {
                released += 1;
            }
        }
        released
    }
}

pub(crate) fn register(target: &Path) {
    REGISTRY.register(target);
}

pub(crate) fn unregister(target: &Path) {
    REGISTRY.unregister(target);
}

pub(crate) fn record_mount(target: &Path) {
    REGISTRY.adjust_depth(target, true);
}

pub(crate) fn record_unmount(target: &Path) {
    REGISTRY.adjust_depth(target, false);
}

/// Targets currently held by a guard.
pub fn registered_targets() -> Vec<PathBuf> {
    REGISTRY.targets()
}

/// Unmount every registered target, once per stacked mount. Returns the
/// number of targets fully released.
pub fn release_all() -> usize {
    REGISTRY.release_with(super::unmount)
}

/// Install the signal thread that releases all mounts on SIGINT, SIGTERM,
/// SIGHUP or SIGQUIT. Calling it again is a no-op.
pub fn install_shutdown_hook() -> ImgResult<()> {
    if HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP, SIGQUIT]).map_err(|e| {
        HOOK_INSTALLED.store(false, Ordering::SeqCst);
        ImgError::Internal(format!("failed to register signal handlers: {}", e))
    })?;

    std::thread::Builder::new()
        .name("img-shutdown".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                let released = release_all();
                tracing::info!(signal, released, "Received signal, released mounts");
                std::process::exit(1);
            }
        })
        .map_err(|e| ImgError::Internal(format!("failed to spawn shutdown thread: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_refcounted() {
        let target = PathBuf::from("/nonexistent/img-test/refcount");
        register(&target);
        register(&target);
        unregister(&target);
        assert!(registered_targets().contains(&target));
        unregister(&target);
        assert!(!registered_targets().contains(&target));
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        unregister(Path::new("/nonexistent/img-test/unknown"));
    }

    #[test]
    fn test_release_unmounts_every_stacked_mount() {
        let registry = Registry::default();
        let stacked = PathBuf::from("/run/img/a");
        let nested = PathBuf::from("/run/img/a/b/c");
        registry.register(&stacked);
        registry.register(&stacked);
        for _ in 0..3 {
            registry.adjust_depth(&stacked, true);
        }
        registry.register(&nested);
        registry.adjust_depth(&nested, true);

        let mut calls = Vec::new();
        let released = registry.release_with(|t| {
            calls.push(t.to_path_buf());
            Ok(())
        });

        assert_eq!(released, 2);
        assert_eq!(calls, vec![nested, stacked.clone(), stacked.clone(), stacked]);
        assert!(registry.targets().is_empty());
    }

    #[test]
    fn test_release_stops_on_failed_unmount() {
        let registry = Registry::default();
        let target = PathBuf::from("/run/img/busy");
        registry.register(&target);
        registry.adjust_depth(&target, true);
        registry.adjust_depth(&target, true);
        registry.adjust_depth(&target, false);

        let mut calls = 0;
        let released = registry.release_with(|_| {
            calls += 1;
            Err(ImgError::MountFailed("busy".into()))
        });
        assert_eq!((released, calls), (0, 1));
    }
}
