//! graphsync-core: Shared types, configuration, and error handling for graphsync.
//!
//! This crate provides the foundational types used across all graphsync crates:
//! - Source and graph identities, property values, and feed positions
//! - Change events decoded from the MongoDB oplog
//! - The typed `Mutation` and the `MutationExecutor` boundary
//! - Translation configuration and its startup validation
//! - Common error types

pub mod config;
pub mod error;
pub mod events;
pub mod mutation;
pub mod types;

pub use config::{SyncConfig, SyncSettings};
pub use error::CoreError;
pub use events::{ChangeEvent, ChangeOp};
pub use mutation::{Ack, EdgeEndpoints, EntityKey, EntityKind, ExecError, Mutation, MutationExecutor};
pub use types::{EntityIdentity, FeedPosition, Properties, PropertyValue, SourceId};
