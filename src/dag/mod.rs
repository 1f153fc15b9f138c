//! Generic DAG infrastructure.
//!
//! - [`ContentHash`]: 32-byte SHA3-256 content address for any node
//! - [`DagNodeOps`]: trait for types that can participate in DAG operations
//! - [`compute_partial_dag`]: split a sync page into admissible and
//!   unresolved nodes

mod hash;
pub mod ops;

pub use hash::{ContentHash, HASH_SIZE};
pub use ops::{compute_partial_dag, DagNodeOps, PartialDag};
