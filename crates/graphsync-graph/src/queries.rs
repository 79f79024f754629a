//! Read operations over synced entities.
//!
//! Used to inspect the graph after a sync run and by the live integration
//! tests. Properties come back through `apoc.convert.toJson` so they keep
//! their JSON types.

use neo4rs::query;

use graphsync_core::types::IDENTITY_KEY;
use graphsync_core::EntityIdentity;

use crate::client::{GraphClient, GraphError};

/// A synced vertex as stored in Neo4j.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VertexRecord {
    pub uid: String,
    pub labels: Vec<String>,
    pub properties: serde_json::Value,
}

/// A synced edge as stored in Neo4j.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EdgeRecord {
    pub uid: String,
    pub edge_type: String,
    pub source_uid: String,
    pub target_uid: String,
    pub properties: serde_json::Value,
}

impl GraphClient {
    /// Get a vertex by identity.
    pub async fn get_vertex(
        &self,
        identity: &EntityIdentity,
    ) -> Result<Option<VertexRecord>, GraphError> {
        let cypher = format!(
            "MATCH (n:{label} {{{IDENTITY_KEY}: $uid}})
             RETURN labels(n) AS labels, apoc.convert.toJson(properties(n)) AS props",
            label = self.vertex_label()
        );

        let q = query(&cypher).param("uid", identity.as_str());

        match self.query_one(q).await? {
            Some(row) => {
                let labels: Vec<String> = row.get("labels").unwrap_or_default();
                let props: String = row.get("props").map_err(|e| {
                    GraphError::Serialization(format!("Failed to read vertex properties: {e}"))
                })?;
                Ok(Some(VertexRecord {
                    uid: identity.to_string(),
                    labels,
                    properties: parse_props(&props)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Get an edge by identity, with its endpoints.
    pub async fn get_edge(
        &self,
        identity: &EntityIdentity,
    ) -> Result<Option<EdgeRecord>, GraphError> {
        let cypher = format!(
            "MATCH (a)-[r {{{IDENTITY_KEY}: $uid}}]->(b)
             RETURN type(r) AS rel_type, a.{IDENTITY_KEY} AS source, b.{IDENTITY_KEY} AS target,
                    apoc.convert.toJson(properties(r)) AS props
             LIMIT 1"
        );

        let q = query(&cypher).param("uid", identity.as_str());

        match self.query_one(q).await? {
            Some(row) => {
                let props: String = row.get("props").map_err(|e| {
                    GraphError::Serialization(format!("Failed to read edge properties: {e}"))
                })?;
                Ok(Some(EdgeRecord {
                    uid: identity.to_string(),
                    edge_type: row.get("rel_type").unwrap_or_default(),
                    source_uid: row.get("source").unwrap_or_default(),
                    target_uid: row.get("target").unwrap_or_default(),
                    properties: parse_props(&props)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Count synced vertices, optionally restricted to one type tag.
    pub async fn count_vertices(&self, vertex_type: Option<&str>) -> Result<i64, GraphError> {
        let tag = match vertex_type {
            Some(t) => format!(":{}", crate::client::quote_label(t)?),
            None => String::new(),
        };
        let cypher = format!(
            "MATCH (n:{label}{tag})
             RETURN count(n) AS cnt",
            label = self.vertex_label()
        );

        match self.query_one(query(&cypher)).await? {
            Some(row) => Ok(row.get::<i64>("cnt").unwrap_or(0)),
            None => Ok(0),
        }
    }

    /// Count synced edges (those carrying an identity).
    pub async fn count_edges(&self) -> Result<i64, GraphError> {
        let cypher = format!(
            "MATCH ()-[r]->()
             WHERE r.{IDENTITY_KEY} IS NOT NULL
             RETURN count(r) AS cnt"
        );

        match self.query_one(query(&cypher)).await? {
            Some(row) => Ok(row.get::<i64>("cnt").unwrap_or(0)),
            None => Ok(0),
        }
    }
}

fn parse_props(raw: &str) -> Result<serde_json::Value, GraphError> {
    serde_json::from_str(raw).map_err(|e| GraphError::Serialization(e.to_string()))
}
