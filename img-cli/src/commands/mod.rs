pub mod apply;
pub mod diff;
pub mod du;
pub mod ls;
pub mod prune;
pub mod reconcile;
pub mod rm;
pub mod run;
pub mod version;
