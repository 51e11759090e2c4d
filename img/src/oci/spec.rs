//! OCI runtime specification builder
//!
//! Produces the `config.json` a build step runs under. The base spec is a
//! conventional privileged container; when the step runs as a non-root user
//! or the engine itself is unprivileged it is converted to the rootless
//! variant (own user namespace, no network namespace, no cgroup path).

use std::fs::{self, File};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use oci_spec::runtime::{
    Linux, LinuxBuilder, LinuxCapabilitiesBuilder, LinuxDeviceCgroupBuilder, LinuxIdMapping,
    LinuxIdMappingBuilder, LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType,
    LinuxResourcesBuilder, Mount as OciMount, MountBuilder, PosixRlimitBuilder, PosixRlimitType,
    Process, ProcessBuilder, Root, RootBuilder, Spec, SpecBuilder, UserBuilder,
};

use img_shared::constants::sandbox;
use img_shared::{ImgError, ImgResult};

use super::capabilities::default_capabilities;
use super::path::root_path;
use super::seccomp;
use super::user::{ExecUser, resolve_user};
use crate::executor::Meta;
use crate::identity::{IdMap, IdMapping};
use crate::mount::Mount;

const OCI_VERSION: &str = "1.0.2";

const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// A mount requested by the step, already resolved to a descriptor.
#[derive(Debug, Clone)]
pub struct SpecMount {
    pub destination: PathBuf,
    pub mount: Mount,
}

/// Settings that come from the executor rather than the step.
#[derive(Debug, Clone, Default)]
pub struct SpecOptions {
    /// Host path of the container root, as the runtime will see it.
    pub rootfs: PathBuf,
    /// Mount the root read-only.
    pub readonly: bool,
    /// Force the rootless transformation even for uid 0.
    pub rootless: bool,
    /// Mapping for the rootless user namespace. Defaults to container root
    /// mapped onto the caller's effective ids.
    pub id_mapping: Option<IdMapping>,
}

/// Resources held open while the spec is in use.
///
/// Keeps the resolv.conf and hosts snapshots pinned until the bundle is torn
/// down. Dropping has the same effect as [`SpecCleanup::release`].
#[derive(Debug, Default)]
pub struct SpecCleanup {
    files: Vec<File>,
}

impl SpecCleanup {
    pub fn release(mut self) {
        self.files.clear();
    }
}

/// Build the runtime spec for `meta` in bundle `bundle_id`.
///
/// `meta.user` is resolved against the user database inside
/// `opts.rootfs`, so the root must already be in place. The working
/// directory is created inside the root as a side effect.
pub fn build_spec(
    meta: &Meta,
    mounts: &[SpecMount],
    bundle_id: &str,
    resolv_conf: &Path,
    hosts: &Path,
    opts: &SpecOptions,
) -> ImgResult<(Spec, SpecCleanup)> {
    let mut cleanup = SpecCleanup::default();
    for path in [resolv_conf, hosts] {
        let file = File::open(path).map_err(|e| {
            ImgError::SpecBuild(format!("failed to open {}: {}", path.display(), e))
        })?;
        cleanup.files.push(file);
    }

    let user = resolve_user(&opts.rootfs, &meta.user)?;
    let cwd = if meta.cwd.is_empty() { "/" } else { meta.cwd.as_str() };
    ensure_cwd(&opts.rootfs, cwd)?;

    let mut all_mounts = build_standard_mounts(resolv_conf, hosts)?;
    for extra in mounts {
        all_mounts.push(build_bind_mount(
            &extra.destination,
            &extra.mount.source,
            extra.mount.options.clone(),
        )?);
    }

    let process = build_process_spec(meta, cwd, &user)?;
    let root = build_root_spec(&opts.rootfs, opts.readonly)?;
    let linux = build_linux_spec(bundle_id)?;

    let mut spec = SpecBuilder::default()
        .version(OCI_VERSION)
        .hostname(sandbox::HOSTNAME)
        .root(root)
        .mounts(all_mounts)
        .process(process)
        .linux(linux)
        .build()
        .map_err(|e| ImgError::SpecBuild(format!("Failed to build OCI spec: {}", e)))?;

    if opts.rootless || user.uid != 0 {
        let mapping = match &opts.id_mapping {
            Some(mapping) => mapping.clone(),
            None => IdMapping::single(
                nix::unistd::geteuid().as_raw(),
                nix::unistd::getegid().as_raw(),
            ),
        };
        to_rootless(&mut spec, &mapping)?;
    }

    tracing::debug!(
        bundle_id,
        uid = user.uid,
        gid = user.gid,
        readonly = opts.readonly,
        mounts = mounts.len(),
        "Built OCI spec"
    );
    Ok((spec, cleanup))
}

/// Convert `spec` so an unprivileged runtime can start it.
pub fn to_rootless(spec: &mut Spec, mapping: &IdMapping) -> ImgResult<()> {
    let mut linux: Linux = spec
        .linux()
        .clone()
        .ok_or_else(|| ImgError::SpecBuild("spec has no linux section".into()))?;

    let mut namespaces: Vec<LinuxNamespace> = linux
        .namespaces()
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|ns| {
            !matches!(
                ns.typ(),
                LinuxNamespaceType::Network | LinuxNamespaceType::User
            )
        })
        .collect();
    namespaces.push(build_namespace(LinuxNamespaceType::User)?);
    linux.set_namespaces(Some(namespaces));
    linux.set_uid_mappings(Some(build_id_mappings(&mapping.uids)?));
    linux.set_gid_mappings(Some(build_id_mappings(&mapping.gids)?));
    linux.set_cgroups_path(None);
    linux.set_resources(None);
    spec.set_linux(Some(linux));

    let mut mounts: Vec<OciMount> = Vec::new();
    for mut m in spec.mounts().clone().unwrap_or_default() {
        if m.destination().starts_with("/sys") {
            continue;
        }
        if let Some(options) = m.options().clone() {
            let options = options
                .into_iter()
                .filter(|o| !o.starts_with("uid=") && !o.starts_with("gid="))
                .collect();
            m.set_options(Some(options));
        }
        mounts.push(m);
    }
    mounts.push(build_bind_mount(
        Path::new("/sys"),
        Path::new("/sys"),
        ["rbind", "nosuid", "noexec", "nodev", "ro"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    )?);
    spec.set_mounts(Some(mounts));
    Ok(())
}

fn ensure_cwd(rootfs: &Path, cwd: &str) -> ImgResult<()> {
    let dir = root_path(rootfs, cwd)?;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(&dir)
        .map_err(|e| {
            ImgError::SpecBuild(format!(
                "failed to create working directory {}: {}",
                dir.display(),
                e
            ))
        })
}

fn build_process_spec(meta: &Meta, cwd: &str, user: &ExecUser) -> ImgResult<Process> {
    let mut user_builder = UserBuilder::default().uid(user.uid).gid(user.gid);
    if !user.additional_gids.is_empty() {
        user_builder = user_builder.additional_gids(user.additional_gids.clone());
    }
    let spec_user = user_builder
        .build()
        .map_err(|e| ImgError::SpecBuild(format!("Failed to build user spec: {}", e)))?;

    let caps = default_capabilities();
    let capabilities = LinuxCapabilitiesBuilder::default()
        .bounding(caps.clone())
        .effective(caps.clone())
        .permitted(caps)
        .build()
        .map_err(|e| ImgError::SpecBuild(format!("Failed to build capabilities: {}", e)))?;

    let rlimits = vec![
        PosixRlimitBuilder::default()
            .typ(PosixRlimitType::RlimitNofile)
            .hard(sandbox::RLIMIT_NOFILE_HARD)
            .soft(sandbox::RLIMIT_NOFILE_SOFT)
            .build()
            .map_err(|e| ImgError::SpecBuild(format!("Failed to build rlimit: {}", e)))?,
    ];

    ProcessBuilder::default()
        .terminal(false)
        .user(spec_user)
        .args(meta.args.clone())
        .env(with_default_path(&meta.env))
        .cwd(cwd)
        .capabilities(capabilities)
        .rlimits(rlimits)
        .no_new_privileges(true)
        .build()
        .map_err(|e| ImgError::SpecBuild(format!("Failed to build process spec: {}", e)))
}

fn with_default_path(env: &[String]) -> Vec<String> {
    let mut env = env.to_vec();
    if !env.iter().any(|e| e.starts_with("PATH=")) {
        env.insert(0, format!("PATH={}", sandbox::DEFAULT_PATH));
    }
    env
}

fn build_root_spec(rootfs: &Path, readonly: bool) -> ImgResult<Root> {
    RootBuilder::default()
        .path(rootfs)
        .readonly(readonly)
        .build()
        .map_err(|e| ImgError::SpecBuild(format!("Failed to build root spec: {}", e)))
}

fn build_linux_spec(bundle_id: &str) -> ImgResult<Linux> {
    let namespaces = [
        LinuxNamespaceType::Pid,
        LinuxNamespaceType::Ipc,
        LinuxNamespaceType::Uts,
        LinuxNamespaceType::Mount,
        LinuxNamespaceType::Network,
    ]
    .into_iter()
    .map(build_namespace)
    .collect::<ImgResult<Vec<_>>>()?;

    let deny_devices = LinuxDeviceCgroupBuilder::default()
        .allow(false)
        .access("rwm")
        .build()
        .map_err(|e| ImgError::SpecBuild(format!("Failed to build device rule: {}", e)))?;
    let resources = LinuxResourcesBuilder::default()
        .devices(vec![deny_devices])
        .build()
        .map_err(|e| ImgError::SpecBuild(format!("Failed to build resources: {}", e)))?;

    LinuxBuilder::default()
        .namespaces(namespaces)
        .masked_paths(MASKED_PATHS.iter().map(|p| p.to_string()).collect::<Vec<_>>())
        .readonly_paths(READONLY_PATHS.iter().map(|p| p.to_string()).collect::<Vec<_>>())
        .cgroups_path(PathBuf::from(format!(
            "{}/{}",
            sandbox::CGROUP_PARENT,
            bundle_id
        )))
        .resources(resources)
        .seccomp(seccomp::default_profile()?)
        .build()
        .map_err(|e| ImgError::SpecBuild(format!("Failed to build linux spec: {}", e)))
}

fn build_namespace(typ: LinuxNamespaceType) -> ImgResult<LinuxNamespace> {
    LinuxNamespaceBuilder::default()
        .typ(typ)
        .build()
        .map_err(|e| ImgError::SpecBuild(format!("Failed to build {:?} namespace: {}", typ, e)))
}

fn build_id_mappings(maps: &[IdMap]) -> ImgResult<Vec<LinuxIdMapping>> {
    maps.iter()
        .map(|m| {
            LinuxIdMappingBuilder::default()
                .container_id(m.container_id)
                .host_id(m.host_id)
                .size(m.size)
                .build()
                .map_err(|e| ImgError::SpecBuild(format!("Failed to build id mapping: {}", e)))
        })
        .collect()
}

fn build_standard_mounts(resolv_conf: &Path, hosts: &Path) -> ImgResult<Vec<OciMount>> {
    let opts = |o: &[&str]| o.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    let fs_mount = |dest: &str, typ: &str, source: &str, options: Vec<String>| {
        MountBuilder::default()
            .destination(dest)
            .typ(typ)
            .source(source)
            .options(options)
            .build()
            .map_err(|e| ImgError::SpecBuild(format!("Failed to build {} mount: {}", dest, e)))
    };

    Ok(vec![
        fs_mount("/proc", "proc", "proc", opts(&["nosuid", "noexec", "nodev"]))?,
        fs_mount(
            "/dev",
            "tmpfs",
            "tmpfs",
            opts(&["nosuid", "strictatime", "mode=755", "size=65536k"]),
        )?,
        fs_mount(
            "/dev/pts",
            "devpts",
            "devpts",
            opts(&[
                "nosuid",
                "noexec",
                "newinstance",
                "ptmxmode=0666",
                "mode=0620",
                "gid=5",
            ]),
        )?,
        fs_mount(
            "/dev/shm",
            "tmpfs",
            "shm",
            opts(&["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]),
        )?,
        fs_mount(
            "/dev/mqueue",
            "mqueue",
            "mqueue",
            opts(&["nosuid", "noexec", "nodev"]),
        )?,
        fs_mount(
            "/sys",
            "sysfs",
            "sysfs",
            opts(&["nosuid", "noexec", "nodev", "ro"]),
        )?,
        build_bind_mount(
            Path::new("/etc/resolv.conf"),
            resolv_conf,
            opts(&["rbind", "ro"]),
        )?,
        build_bind_mount(Path::new("/etc/hosts"), hosts, opts(&["rbind", "ro"]))?,
    ])
}

fn build_bind_mount(destination: &Path, source: &Path, options: Vec<String>) -> ImgResult<OciMount> {
    MountBuilder::default()
        .destination(destination)
        .typ("bind")
        .source(source)
        .options(options)
        .build()
        .map_err(|e| {
            ImgError::SpecBuild(format!(
                "Failed to build bind mount {} → {}: {}",
                source.display(),
                destination.display(),
                e
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        rootfs: PathBuf,
        resolv: PathBuf,
        hosts: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(
            rootfs.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1001::/home/app:/bin/sh\n",
        )
        .unwrap();
        fs::write(rootfs.join("etc/group"), "root:x:0:\napp:x:1001:\n").unwrap();
        let resolv = temp.path().join("resolv.conf");
        let hosts = temp.path().join("hosts");
        fs::write(&resolv, "nameserver 8.8.8.8\n").unwrap();
        fs::write(&hosts, "127.0.0.1\tlocalhost\n").unwrap();
        Fixture {
            _temp: temp,
            rootfs,
            resolv,
            hosts,
        }
    }

    fn meta(user: &str) -> Meta {
        Meta {
            args: vec!["/bin/sh".into(), "-c".into(), "true".into()],
            env: vec!["FOO=bar".into()],
            cwd: "/work/dir".into(),
            user: user.into(),
        }
    }

    fn build(f: &Fixture, meta: &Meta, mounts: &[SpecMount], opts: SpecOptions) -> Value {
        let opts = SpecOptions {
            rootfs: f.rootfs.clone(),
            ..opts
        };
        let (spec, cleanup) = build_spec(meta, mounts, "b1", &f.resolv, &f.hosts, &opts).unwrap();
        cleanup.release();
        serde_json::to_value(&spec).unwrap()
    }

    fn namespace_types(spec: &Value) -> Vec<String> {
        spec["linux"]["namespaces"]
            .as_array()
            .unwrap()
            .iter()
            .map(|ns| ns["type"].as_str().unwrap().to_string())
            .collect()
    }

    fn mount_for<'a>(spec: &'a Value, dest: &str) -> Option<&'a Value> {
        spec["mounts"]
            .as_array()
            .unwrap()
            .iter()
            .find(|m| m["destination"] == dest)
    }

    #[test]
    fn test_root_spec() {
        let f = fixture();
        let extra = SpecMount {
            destination: PathBuf::from("/cache"),
            mount: Mount::bind("/snapshots/7", true),
        };
        let spec = build(&f, &meta(""), &[extra], SpecOptions::default());

        assert_eq!(spec["ociVersion"], "1.0.2");
        assert_eq!(spec["hostname"], "imgsandbox");
        assert_eq!(spec["process"]["user"]["uid"], 0);
        assert_eq!(spec["process"]["cwd"], "/work/dir");
        assert_eq!(spec["process"]["noNewPrivileges"], true);
        assert_eq!(spec["linux"]["cgroupsPath"], "/img/b1");
        assert!(namespace_types(&spec).contains(&"network".to_string()));
        assert!(!namespace_types(&spec).contains(&"user".to_string()));
        assert_eq!(spec["root"]["readonly"], false);

        let resolv = mount_for(&spec, "/etc/resolv.conf").unwrap();
        assert_eq!(resolv["source"], f.resolv.display().to_string());
        let cache = mount_for(&spec, "/cache").unwrap();
        assert_eq!(cache["options"], serde_json::json!(["ro", "rbind"]));
        assert_eq!(mount_for(&spec, "/sys").unwrap()["type"], "sysfs");

        assert!(f.rootfs.join("work/dir").is_dir());
    }

    #[test]
    fn test_non_root_user_is_rootless() {
        let f = fixture();
        let spec = build(&f, &meta("app"), &[], SpecOptions::default());

        assert_eq!(spec["process"]["user"]["uid"], 1000);
        assert_eq!(spec["process"]["user"]["gid"], 1001);
        assert!(spec["linux"].get("cgroupsPath").is_none());
        assert!(spec["linux"].get("resources").is_none());

        let namespaces = namespace_types(&spec);
        assert!(namespaces.contains(&"user".to_string()));
        assert!(!namespaces.contains(&"network".to_string()));

        let uid_map = &spec["linux"]["uidMappings"][0];
        assert_eq!(uid_map["containerID"], 0);
        assert_eq!(uid_map["hostID"], nix::unistd::geteuid().as_raw());
        assert_eq!(uid_map["size"], 1);

        let sys = mount_for(&spec, "/sys").unwrap();
        assert_eq!(sys["type"], "bind");
        let devpts = mount_for(&spec, "/dev/pts").unwrap();
        assert!(
            !devpts["options"]
                .as_array()
                .unwrap()
                .iter()
                .any(|o| o.as_str().unwrap().starts_with("gid="))
        );
    }

    #[test]
    fn test_rootless_uses_given_mapping() {
        let f = fixture();
        let mapping = IdMapping {
            uids: vec![IdMap { container_id: 0, host_id: 100000, size: 65536 }],
            gids: vec![IdMap { container_id: 0, host_id: 200000, size: 65536 }],
        };
        let spec = build(
            &f,
            &meta(""),
            &[],
            SpecOptions {
                rootless: true,
                id_mapping: Some(mapping),
                ..Default::default()
            },
        );

        assert_eq!(spec["process"]["user"]["uid"], 0);
        assert_eq!(spec["linux"]["uidMappings"][0]["hostID"], 100000);
        assert_eq!(spec["linux"]["gidMappings"][0]["hostID"], 200000);
        assert!(spec["linux"].get("cgroupsPath").is_none());
    }

    #[test]
    fn test_readonly_root_and_default_path() {
        let f = fixture();
        let spec = build(
            &f,
            &meta("0"),
            &[],
            SpecOptions {
                readonly: true,
                ..Default::default()
            },
        );
        assert_eq!(spec["root"]["readonly"], true);
        let env = spec["process"]["env"].as_array().unwrap();
        assert_eq!(env[0], format!("PATH={}", sandbox::DEFAULT_PATH));
        assert_eq!(env[1], "FOO=bar");
    }

    #[test]
    fn test_explicit_path_is_kept() {
        let env = with_default_path(&["PATH=/opt/bin".to_string()]);
        assert_eq!(env, vec!["PATH=/opt/bin".to_string()]);
    }

    #[test]
    fn test_unknown_user_fails() {
        let f = fixture();
        let opts = SpecOptions {
            rootfs: f.rootfs.clone(),
            ..Default::default()
        };
        let err = build_spec(&meta("nobody"), &[], "b1", &f.resolv, &f.hosts, &opts).unwrap_err();
        assert!(matches!(err, ImgError::SpecBuild(_)));
    }

    #[test]
    fn test_missing_resolv_conf_fails() {
        let f = fixture();
        let opts = SpecOptions {
            rootfs: f.rootfs.clone(),
            ..Default::default()
        };
        let missing = f.rootfs.join("nope");
        let err = build_spec(&meta(""), &[], "b1", &missing, &f.hosts, &opts).unwrap_err();
        assert!(matches!(err, ImgError::SpecBuild(_)));
    }
}
