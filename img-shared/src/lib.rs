//! img shared - types used by both the engine library and the CLI
//!
//! This crate contains the error taxonomy, common constants and the
//! persisted state directory layout.

pub mod constants;
pub mod errors;
pub mod layout;

pub use errors::{ImgError, ImgResult};
pub use layout::StateLayout;
