//! Hot-zone knowledge base and density estimation.
//!
//! Some ID sub-ranges of a history are orders of magnitude slower to fetch
//! than their neighbors. This module learns those ranges across runs (the
//! persistent slow-range database) and estimates message density up front,
//! so the planner can size chunks before the first worker ever stalls.

pub mod density;
pub mod registry;

pub use density::{chunk_size_for_density, DensityEstimator, DEFAULT_DENSITY};
pub use registry::{HotZone, HotZonesRegistry, SlowChunkRecord};
