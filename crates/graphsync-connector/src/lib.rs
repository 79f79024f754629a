//! graphsync-connector: MongoDB oplog to property graph sync.
//!
//! Routes change events by namespace, translates them into idempotent
//! graph mutations, applies them through a `MutationExecutor`, and tracks
//! a resumable checkpoint.

pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod feed;
pub mod identity;
pub mod memory;
pub mod pipeline;
pub mod projection;
pub mod router;

pub use builder::MutationBuilder;
pub use checkpoint::{CheckpointStore, CheckpointTracker, FileCheckpointStore, MemoryCheckpointStore};
pub use config::PipelineConfig;
pub use error::{IdentityError, ProjectionError, SyncError, TranslationError};
pub use feed::{ChangeFeed, FeedError, IterFeed, JsonLinesFeed};
pub use identity::IdentityMapper;
pub use memory::{GraphSnapshot, MemoryGraph};
pub use pipeline::{EventOutcome, EventReport, Pipeline, SyncContext, SyncStats};
pub use projection::FieldProjector;
pub use router::{route, ChangeRouter, RoutingDecision};
