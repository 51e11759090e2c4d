//! Shared constants
//!
//! Values the engine and the CLI must agree on.

/// Environment variables
pub mod envs {
    /// Overrides the state directory.
    pub const STATE_DIR: &str = "IMG_STATE_DIR";

    /// Overrides the container runtime binary.
    pub const RUNTIME: &str = "IMG_RUNTIME";

    /// Set in the re-executed child once it runs inside the user namespace.
    pub const IN_UNSHARE: &str = "IMG_IN_UNSHARE";
}

/// Sandbox defaults for build steps
pub mod sandbox {
    /// Hostname inside every build step
    pub const HOSTNAME: &str = "imgsandbox";

    /// Default RLIMIT_NOFILE soft limit
    pub const RLIMIT_NOFILE_SOFT: u64 = 1024;

    /// Default RLIMIT_NOFILE hard limit
    pub const RLIMIT_NOFILE_HARD: u64 = 1024;

    /// PATH used when the step does not set one
    pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

    /// Prefix for the cgroup path of privileged steps
    pub const CGROUP_PARENT: &str = "/img";
}

/// DNS fallbacks when the host only lists loopback resolvers
pub mod dns {
    pub const DEFAULT_NAMESERVERS: &[&str] = &["8.8.8.8", "8.8.4.4"];
}

/// Container runtime
pub mod runtime {
    /// Binary looked up on PATH when none is configured
    pub const DEFAULT_BINARY: &str = "runc";

    /// Name of the executor directory level in the state layout
    pub const EXECUTOR_NAME: &str = "runc";
}

/// Snapshot backends
pub mod backends {
    /// Eager copy of the parent at prepare time
    pub const NATIVE: &str = "native";
}
