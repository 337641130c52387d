//! Accelerator resource accounting
//!
//! See [`tracker::ResourceTracker`] for the budget and
//! [`sweeper::IdleSweeper`] for idle unloading.

pub mod sweeper;
pub mod tracker;

pub use sweeper::{IdleSweeper, UnloadRequest};
pub use tracker::{
    EvictionPlan, LoadedModel, ModelRecord, ModelStatus, ResourceSnapshot, ResourceTracker,
};
