pub mod process;

use std::path::{Path, PathBuf};

use img_shared::{ImgError, ImgResult};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Locate an executable.
///
/// A name containing a `/` is taken as a path and only checked for
/// existence. A bare name is searched for on `PATH`.
pub fn find_binary(binary_name: &str) -> ImgResult<PathBuf> {
    if binary_name.contains('/') {
        let path = PathBuf::from(binary_name);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(ImgError::Config(format!(
            "binary '{}' not found or not executable",
            binary_name
        )));
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    let candidates: Vec<PathBuf> = std::env::split_paths(&search)
        .map(|dir| dir.join(binary_name))
        .collect();

    for candidate in &candidates {
        if is_executable(candidate) {
            tracing::debug!(binary = %candidate.display(), "Found binary");
            return Ok(candidate.clone());
        }
    }

    let locations = candidates
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ImgError::Config(format!(
        "binary '{}' not found.\nSearched locations:\n{}",
        binary_name, locations
    )))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}

/// Install the stderr subscriber. `RUST_LOG` wins unless `debug` is set.
///
/// Keep the returned guard alive for the life of the process, dropping it
/// flushes and stops the writer thread.
pub fn init_logging(debug: bool) -> WorkerGuard {
    let env_filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
    register_to_tracing(non_blocking, env_filter);
    guard
}
