//! Orchestration engine: the dependency-aware task graph, the scheduler
//! that drives agents against the shared workspace, and the run registry
//! consumed by progress reporting.

pub mod graph;
pub mod registry;
pub mod scheduler;
