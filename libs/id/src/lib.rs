//! # drover-id
//!
//! Typed identifiers for drover clusters.
//!
//! Every ID renders as `{prefix}_{ulid}`, for example
//! `mem_01HV4Z2WQXKJNM8GPQY6VBKC3D` or `op_01HV4Z4NYPLTRS0JTUA8XDME5F`, and
//! parses strictly back from that form. Member and group *names* are
//! operator-chosen labels and are not IDs.
//!
//! [`ResourceId`] covers anything placeable (instances and volumes) and
//! dispatches on the prefix.

mod error;
mod macros;
mod types;

pub use error::IdError;
#[doc(hidden)]
pub use macros::split_prefixed;
pub use types::*;

pub use ulid::Ulid;
