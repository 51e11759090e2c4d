//! `resolv.conf` and `hosts` files bind-mounted into every step.

use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use img_shared::constants::{dns, sandbox};
use img_shared::{ImgError, ImgResult};

pub const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";
const RESOLV_CONF: &str = "resolv.conf";
const HOSTS: &str = "hosts";

/// Generated `{root}/resolv.conf` derived from the host's file.
pub fn resolv_conf(root: &Path) -> ImgResult<PathBuf> {
    resolv_conf_with_host(root, Path::new(HOST_RESOLV_CONF))
}

/// Like [`resolv_conf`] with an explicit host file.
///
/// The file is regenerated only when it is missing or older than the host
/// file. Localhost nameservers are unreachable from the step and are
/// dropped; when none remain the public defaults are used.
pub fn resolv_conf_with_host(root: &Path, host: &Path) -> ImgResult<PathBuf> {
    let path = root.join(RESOLV_CONF);

    let host_mtime = fs::metadata(host).and_then(|m| m.modified()).ok();
    let generated_mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
    let stale = match (generated_mtime, host_mtime) {
        (None, _) => true,
        (Some(generated), Some(host)) => host > generated,
        (Some(_), None) => false,
    };
    if !stale {
        return Ok(path);
    }

    let content = match fs::read_to_string(host) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(ImgError::Storage(format!(
                "failed to read {}: {}",
                host.display(),
                e
            )));
        }
    };

    write_atomic(root, &path, &filter_resolv_conf(&content))?;
    tracing::debug!(path = %path.display(), "Generated resolv.conf");
    Ok(path)
}

/// Generated `{root}/hosts`, written once.
pub fn hosts_file(root: &Path) -> ImgResult<PathBuf> {
    let path = root.join(HOSTS);
    if path.exists() {
        return Ok(path);
    }
    let content = format!(
        "127.0.0.1\tlocalhost {}\n::1\tlocalhost ip6-localhost ip6-loopback\n",
        sandbox::HOSTNAME
    );
    write_atomic(root, &path, &content)?;
    Ok(path)
}

fn filter_resolv_conf(content: &str) -> String {
    let mut out = String::new();
    let mut nameservers = 0;
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some("nameserver") {
            match fields.next().and_then(|a| a.parse::<IpAddr>().ok()) {
                Some(addr) if addr.is_loopback() => continue,
                Some(_) => nameservers += 1,
                None => continue,
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    if nameservers == 0 {
        for server in dns::DEFAULT_NAMESERVERS {
            out.push_str(&format!("nameserver {}\n", server));
        }
    }
    out
}

/// Write through a temp file in `dir` so concurrent readers never see a
/// partial file.
fn write_atomic(dir: &Path, path: &Path, content: &str) -> ImgResult<()> {
    fs::create_dir_all(dir)
        .map_err(|e| ImgError::Storage(format!("failed to create {}: {}", dir.display(), e)))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| ImgError::Storage(format!("failed to create temp file: {}", e)))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| ImgError::Storage(format!("failed to write {}: {}", path.display(), e)))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o644))
        .map_err(|e| ImgError::Storage(format!("failed to chmod {}: {}", path.display(), e)))?;
    tmp.persist(path)
        .map_err(|e| ImgError::Storage(format!("failed to persist {}: {}", path.display(), e)))?;
    Ok(())
}
