//! Shared data model for the converge control plane.

pub mod config;
pub mod deployment;
pub mod instance;
pub mod replicaset;
pub mod template;
pub mod validate;
