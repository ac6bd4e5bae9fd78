//! The pod-runtime boundary: the async interface controllers call to
//! create, observe, and terminate workload instances.

pub mod backend;
pub mod simulated;

pub use backend::{InstanceObservation, InstanceRuntime};
pub use simulated::SimulatedRuntime;
