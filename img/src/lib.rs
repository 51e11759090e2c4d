//! img - daemon-less, unprivileged container image build engine.
//!
//! The engine executes build steps as isolated processes over
//! copy-on-write filesystem snapshots:
//!
//! - [`snapshot::Snapshotter`] tracks a parent-linked graph of filesystem
//!   states in a transactional [`metadata::MetaStore`].
//! - [`mount`] composes snapshots into bind mounts and guarantees they are
//!   released.
//! - [`identity`] resolves subordinate id ranges and re-launches the process
//!   inside a user namespace.
//! - [`oci`] builds the runtime spec for one step.
//! - [`executor::RuncExecutor`] runs a step under an OCI runtime binary.
//! - [`worker::Worker`] wires everything together.

pub mod diff;
pub mod executor;
pub mod identity;
pub mod metadata;
pub mod mount;
pub mod oci;
pub mod snapshot;
pub mod util;
pub mod worker;

pub use img_shared::{ImgError, ImgResult};

pub use executor::{
    ExecMount, Executor, ExecutorOptions, Meta, Mountable, ProcessIo, RootfsMode, RuncExecutor,
};
pub use metadata::{Kind, SnapshotInfo, Usage};
pub use mount::{DiffStrategy, Mount, MountGuard};
pub use snapshot::{SnapshotRef, Snapshotter};
pub use worker::{ImgOptions, StepRequest, UsageRecord, Worker};
