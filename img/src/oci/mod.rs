//! OCI runtime configuration for build steps.
//!
//! Everything the executor needs to turn a step into a bundle: user lookup
//! inside the rootfs, a symlink-safe path join, resolver files, the seccomp
//! profile and the spec itself.

pub mod capabilities;
pub mod network;
pub mod path;
pub mod seccomp;
pub mod spec;
pub mod user;

pub use network::{hosts_file, resolv_conf};
pub use path::root_path;
pub use spec::{SpecCleanup, SpecMount, SpecOptions, build_spec};
pub use user::{ExecUser, resolve_user};
