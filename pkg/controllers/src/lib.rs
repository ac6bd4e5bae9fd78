//! Control loops that drive observed cluster state toward desired state.
//!
//! Each controller runs an independent level-triggered loop, woken by a
//! periodic tick or a state-store watch event. The ReplicaSet reconciler is
//! the single writer of pod instances; the rollout and autoscale controllers
//! act on it by writing desired replica counts through the store.

pub mod autoscale;
pub mod replicaset;
pub mod rollout;
