//! drover member agent library.
//!
//! The agent runs on every server that takes part in a drover cluster. On
//! first start it redeems a join token with the coordinator, then reports
//! liveness and capacity through periodic heartbeats until it is stopped.

pub mod client;
pub mod config;
pub mod heartbeat;
pub mod join;

pub use client::{ClientError, CoordinatorClient};
pub use join::{ensure_joined, Admission};
