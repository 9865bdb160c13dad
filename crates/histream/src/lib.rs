#![doc = include_str!("../README.md")]

pub mod client;
pub mod config;
pub mod coordinator;
pub mod hotzones;
pub mod merge;
pub mod pipeline;
pub mod planner;
pub mod pool;
pub mod retry;
pub mod shutdown;
pub mod stats;
pub mod telemetry;

pub use histream_core::{Error, Result};
// Public re-export so downstream crates can access the contract types via
// `histream::histream_core`
pub use histream_core;
