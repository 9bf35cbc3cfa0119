//! drover coordinator library.
//!
//! This crate primarily ships a `coordinator` binary, but we expose the
//! coordination components as a library for integration testing and reuse.

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod evacuation;
pub mod events;
pub mod heartbeat;
pub mod join;
pub mod membership;
pub mod migration;
pub mod network;
pub mod operations;
pub mod placement;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod store;

pub use cluster::{Cluster, ClusterSettings, Collaborators};
pub use error::{ClusterError, ClusterResult};
