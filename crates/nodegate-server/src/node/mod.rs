//! Node slots handed to worker processes.

pub mod pool;

pub use pool::{Node, NodeLease, NodePool};
