//! Typed graph mutations and the executor boundary.
//!
//! The translator never builds query text. It hands a `Mutation` to a
//! `MutationExecutor`, which owns all query construction for its store.
//! Every executor must apply mutations idempotently: upserts merge by
//! identity, deletes of missing entities succeed.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{EntityIdentity, Properties};

/// Endpoint identities of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeEndpoints {
    pub source: EntityIdentity,
    pub target: EntityIdentity,
}

/// A self-describing, idempotent graph change.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Find-or-create the vertex, then merge `properties` into it.
    UpsertVertex {
        identity: EntityIdentity,
        vertex_type: Option<String>,
        properties: Properties,
    },
    /// Find-or-create the vertex, then make `properties` its whole property
    /// set. Fields missing from `properties` are removed.
    ReplaceVertex {
        identity: EntityIdentity,
        vertex_type: Option<String>,
        properties: Properties,
    },
    DeleteVertex {
        identity: EntityIdentity,
    },
    /// Find the edge by identity and merge `properties`. When absent it is
    /// created between `endpoints` with type `edge_type`, which is also
    /// stamped as its `edgeType` property; without both a missing edge is a
    /// no-op. The type and endpoints of an existing edge never change.
    UpsertEdge {
        identity: EntityIdentity,
        edge_type: Option<String>,
        endpoints: Option<EdgeEndpoints>,
        properties: Properties,
    },
    /// Like `UpsertEdge`, but an existing edge's properties are replaced by
    /// `properties`. Its `uid` and `edgeType` are kept.
    ReplaceEdge {
        identity: EntityIdentity,
        edge_type: Option<String>,
        endpoints: Option<EdgeEndpoints>,
        properties: Properties,
    },
    DeleteEdge {
        identity: EntityIdentity,
    },
}

impl Mutation {
    pub fn identity(&self) -> &EntityIdentity {
        match self {
            Self::UpsertVertex { identity, .. }
            | Self::ReplaceVertex { identity, .. }
            | Self::DeleteVertex { identity }
            | Self::UpsertEdge { identity, .. }
            | Self::ReplaceEdge { identity, .. }
            | Self::DeleteEdge { identity } => identity,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpsertVertex { .. } => "upsert_vertex",
            Self::ReplaceVertex { .. } => "replace_vertex",
            Self::DeleteVertex { .. } => "delete_vertex",
            Self::UpsertEdge { .. } => "upsert_edge",
            Self::ReplaceEdge { .. } => "replace_edge",
            Self::DeleteEdge { .. } => "delete_edge",
        }
    }

    /// Every graph entity this mutation may write. An edge upsert can create
    /// stub endpoint vertices, so it touches them too.
    pub fn touched(&self) -> Vec<EntityKey> {
        match self {
            Self::UpsertVertex { identity, .. }
            | Self::ReplaceVertex { identity, .. }
            | Self::DeleteVertex { identity } => vec![EntityKey::vertex(identity)],
            Self::UpsertEdge {
                identity,
                endpoints,
                ..
            }
            | Self::ReplaceEdge {
                identity,
                endpoints,
                ..
            } => {
                let mut keys = vec![EntityKey::edge(identity)];
                if let Some(ep) = endpoints {
                    keys.push(EntityKey::vertex(&ep.source));
                    if ep.target != ep.source {
                        keys.push(EntityKey::vertex(&ep.target));
                    }
                }
                keys
            }
            Self::DeleteEdge { identity } => vec![EntityKey::edge(identity)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Vertex,
    Edge,
}

/// A graph entity address. Vertex and edge identities live in separate spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub identity: EntityIdentity,
}

impl EntityKey {
    pub fn vertex(identity: &EntityIdentity) -> Self {
        Self {
            kind: EntityKind::Vertex,
            identity: identity.clone(),
        }
    }

    pub fn edge(identity: &EntityIdentity) -> Self {
        Self {
            kind: EntityKind::Edge,
            identity: identity.clone(),
        }
    }
}

/// Outcome of a confirmed apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The store changed (or was already in the target state after a merge).
    Applied,
    /// Nothing to do: the target did not exist.
    Noop,
}

/// Failure to apply a mutation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    #[error("Apply timed out after {0:?}")]
    Timeout(Duration),

    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    #[error("Mutation rejected: {0}")]
    Rejected(String),
}

impl ExecError {
    /// Timeouts and transient unavailability are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}

/// A graph store that can apply mutations idempotently.
#[async_trait]
pub trait MutationExecutor: Send + Sync {
    async fn apply(&self, mutation: &Mutation) -> Result<Ack, ExecError>;
}
