//! graphsync-graph: Neo4j executor for graph mutations.
//!
//! This crate is the single place that turns typed `Mutation` values into
//! Cypher. Labels are validated before they are interpolated and every
//! value travels as a query parameter, so nothing from a source document
//! ever becomes query text.

pub mod client;
pub mod mutations;
pub mod queries;

pub use client::{GraphClient, GraphConfig, GraphError};
