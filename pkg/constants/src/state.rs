//! State store key layout and watch constants.

/// etcd-style key prefix for Deployment records.
pub const DEPLOYMENTS_PREFIX: &str = "/registry/deployments/";

/// etcd-style key prefix for ReplicaSet records.
pub const REPLICASETS_PREFIX: &str = "/registry/replicasets/";

/// etcd-style key prefix for PodInstance records.
pub const INSTANCES_PREFIX: &str = "/registry/instances/";

/// How many recent watch events the event log retains for replay.
pub const EVENT_LOG_CAPACITY: usize = 1024;
