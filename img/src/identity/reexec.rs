//! One-time re-exec of the current binary inside a new user and mount
//! namespace.
//!
//! The child unshares in its pre-exec hook, reports its pid over a pipe and
//! blocks on a second pipe until the parent has written its uid and gid maps
//! with `newuidmap`/`newgidmap`. Only then does it exec.
//!
//! # Safety
//!
//! The hook runs between `fork()` and `exec()` and is restricted to
//! async-signal-safe calls: no allocation, no locks, no logging.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use img_shared::constants::envs;
use img_shared::{ImgError, ImgResult};

use super::{IdMap, IdMapping, resolve_identity};
use crate::util::find_binary;

const SELF_EXE: &str = "/proc/self/exe";

/// Command for the in-memory copy of the running binary, marked as already
/// inside the namespace.
pub fn command<I, S>(args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(SELF_EXE);
    if let Some(arg0) = std::env::args_os().next() {
        cmd.arg0(arg0);
    }
    cmd.args(args);
    cmd.env(envs::IN_UNSHARE, "1");
    cmd
}

/// Spawn `cmd` in new user and mount namespaces with `mapping` applied.
pub fn spawn(mut cmd: Command, mapping: &IdMapping) -> ImgResult<Child> {
    let newuidmap = find_binary("newuidmap")?;
    let newgidmap = find_binary("newgidmap")?;

    let (ready_r, ready_w) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| ImgError::Internal(format!("failed to create pipe: {}", e)))?;
    let (go_r, go_w) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| ImgError::Internal(format!("failed to create pipe: {}", e)))?;

    let ready_r_fd = ready_r.as_raw_fd();
    let ready_w_fd = ready_w.as_raw_fd();
    let go_r_fd = go_r.as_raw_fd();
    let go_w_fd = go_w.as_raw_fd();

    // SAFETY: the hook only uses async-signal-safe syscalls.
    unsafe {
        cmd.pre_exec(move || {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            libc::close(ready_r_fd);
            libc::close(go_w_fd);

            if libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNS) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            let pid = libc::getpid().to_ne_bytes();
            if libc::write(ready_w_fd, pid.as_ptr().cast(), pid.len()) != pid.len() as isize {
                return Err(std::io::Error::last_os_error());
            }
            libc::close(ready_w_fd);

            let mut status = 0u8;
            let n = libc::read(go_r_fd, (&mut status as *mut u8).cast(), 1);
            libc::close(go_r_fd);
            if n != 1 || status != 1 {
                return Err(std::io::Error::from_raw_os_error(libc::EPERM));
            }
            Ok(())
        });
    }

    let uid_args = map_args(&mapping.uids);
    let gid_args = map_args(&mapping.gids);

    // `spawn` only returns once the child has exec'd, so the maps are
    // written from a helper thread while it blocks.
    let helper = std::thread::Builder::new()
        .name("img-idmap".into())
        .spawn(move || -> ImgResult<()> {
            let mut ready = File::from(ready_r);
            let mut go = File::from(go_w);

            let mut pid = [0u8; 4];
            ready.read_exact(&mut pid).map_err(|e| {
                ImgError::Identity(format!("child exited before unsharing: {}", e))
            })?;
            let pid = i32::from_ne_bytes(pid).to_string();

            let result = write_map(&newuidmap, &pid, &uid_args)
                .and_then(|()| write_map(&newgidmap, &pid, &gid_args));
            let status = if result.is_ok() { 1u8 } else { 0u8 };
            if let Err(e) = go.write_all(&[status]) {
                tracing::warn!(error = %e, "Failed to release re-exec child");
            }
            result
        })
        .map_err(|e| ImgError::Internal(format!("failed to spawn id map thread: {}", e)))?;

    let spawned = cmd.spawn();
    drop(ready_w);
    drop(go_r);

    let mapped = helper
        .join()
        .map_err(|_| ImgError::Internal("id map thread panicked".into()))?;

    match (spawned, mapped) {
        (Ok(child), Ok(())) => {
            tracing::debug!(pid = child.id(), "Re-executed inside user namespace");
            Ok(child)
        }
        (Ok(mut child), Err(e)) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(e)
        }
        (Err(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(ImgError::Internal(format!("re-exec failed: {}", e))),
    }
}

fn map_args(maps: &[IdMap]) -> Vec<String> {
    maps.iter()
        .flat_map(|m| {
            [
                m.container_id.to_string(),
                m.host_id.to_string(),
                m.size.to_string(),
            ]
        })
        .collect()
}

fn write_map(binary: &std::path::Path, pid: &str, args: &[String]) -> ImgResult<()> {
    let output = Command::new(binary)
        .arg(pid)
        .args(args)
        .output()
        .map_err(|e| ImgError::Identity(format!("failed to run {}: {}", binary.display(), e)))?;
    if !output.status.success() {
        return Err(ImgError::Identity(format!(
            "{} failed: {}",
            binary.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Re-launch the current process inside a user namespace unless it already
/// runs as root or inside one. Returns the child's exit status when it did.
pub fn maybe_reexec() -> ImgResult<Option<ExitStatus>> {
    if nix::unistd::geteuid().is_root() || std::env::var_os(envs::IN_UNSHARE).is_some() {
        return Ok(None);
    }

    let identity = resolve_identity()?;
    let mapping = identity.mapping()?;
    let mut child = spawn(command(std::env::args_os().skip(1)), &mapping)?;
    let status = child
        .wait()
        .map_err(|e| ImgError::Internal(format!("failed to wait for re-exec child: {}", e)))?;
    Ok(Some(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_targets_self_exe() {
        let cmd = command(["du", "--debug"]);
        assert_eq!(cmd.get_program(), SELF_EXE);
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, vec!["du", "--debug"]);
        assert!(
            cmd.get_envs()
                .any(|(k, v)| k == envs::IN_UNSHARE && v == Some(OsStr::new("1")))
        );
    }

    #[test]
    fn test_map_args() {
        let maps = [
            IdMap { container_id: 0, host_id: 100000, size: 65536 },
            IdMap { container_id: 65536, host_id: 300000, size: 10 },
        ];
        assert_eq!(
            map_args(&maps),
            vec!["0", "100000", "65536", "65536", "300000", "10"]
        );
    }
}
