//! Error types for the graphsync-connector crate.
//!
//! `IdentityError`, `ProjectionError` and `TranslationError` are scoped to a
//! single event: the pipeline records them and moves on. `SyncError` ends
//! the run.

use graphsync_core::{CoreError, ExecError};
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::feed::FeedError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    #[error("Document has no {field} field")]
    Missing { field: String },

    #[error("Unsupported identifier shape: {shape}")]
    Unsupported { shape: &'static str },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProjectionError {
    #[error("Field {field:?} in {collection} holds a non-scalar value ({shape})")]
    NonScalar {
        collection: String,
        field: String,
        shape: &'static str,
    },

    #[error("Field {field:?} in {collection} has an unusable value: {reason}")]
    InvalidValue {
        collection: String,
        field: String,
        reason: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslationError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),

    #[error("Edge in {collection} is missing its {endpoint} endpoint field {field:?}")]
    MissingEndpoint {
        collection: String,
        endpoint: &'static str,
        field: String,
    },

    #[error("Edge in {collection} has no label: no type tag configured and no {field:?} field")]
    MissingEdgeLabel { collection: String, field: String },

    #[error("{op} event on {namespace} carries no previous identity")]
    MissingPreviousIdentity { op: &'static str, namespace: String },
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Graph error: {0}")]
    Graph(#[from] graphsync_graph::GraphError),

    #[error("Executor unavailable: {failures} consecutive events exhausted their retries (last: {last})")]
    ExecutorUnavailable { failures: u32, last: ExecError },

    #[error("Apply task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
