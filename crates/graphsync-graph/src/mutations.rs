//! Write operations: one Cypher statement per `Mutation` variant.
//!
//! All writes key on the reserved `uid` property. Vertex upserts MERGE on
//! `(:Vertex {uid})`; edge upserts look the edge up by `uid` alone so
//! parallel edges between the same endpoints stay distinct. Property maps
//! are shipped as JSON and merged with `SET x += map`, which also clears
//! properties whose value is null. Replacements use `SET x = map` and then
//! restore the reserved keys.

use async_trait::async_trait;
use neo4rs::query;

use graphsync_core::types::{EDGE_TYPE_KEY, IDENTITY_KEY};
use graphsync_core::{
    Ack, EdgeEndpoints, EntityIdentity, ExecError, Mutation, MutationExecutor, Properties,
};

use crate::client::{quote_label, GraphClient, GraphError};

impl GraphClient {
    // ── Schema ───────────────────────────────────────────────────

    /// Create the uniqueness constraint backing vertex identity lookups.
    pub async fn ensure_schema(&self) -> Result<(), GraphError> {
        let cypher = format!(
            "CREATE CONSTRAINT graphsync_vertex_uid IF NOT EXISTS
             FOR (n:{label}) REQUIRE n.{IDENTITY_KEY} IS UNIQUE",
            label = self.vertex_label()
        );
        self.run(query(&cypher)).await?;
        tracing::info!("Vertex identity constraint ensured");
        Ok(())
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Apply any mutation variant.
    pub async fn apply_mutation(&self, mutation: &Mutation) -> Result<Ack, GraphError> {
        match mutation {
            Mutation::UpsertVertex {
                identity,
                vertex_type,
                properties,
            } => {
                self.upsert_vertex(identity, vertex_type.as_deref(), properties)
                    .await
            }
            Mutation::ReplaceVertex {
                identity,
                vertex_type,
                properties,
            } => {
                self.replace_vertex(identity, vertex_type.as_deref(), properties)
                    .await
            }
            Mutation::DeleteVertex { identity } => self.delete_vertex(identity).await,
            Mutation::UpsertEdge {
                identity,
                edge_type,
                endpoints,
                properties,
            } => match (edge_type, endpoints) {
                (Some(edge_type), Some(endpoints)) => {
                    self.upsert_edge(identity, edge_type, endpoints, properties)
                        .await
                }
                _ => self.merge_edge_properties(identity, properties).await,
            },
            Mutation::ReplaceEdge {
                identity,
                edge_type,
                endpoints,
                properties,
            } => match (edge_type, endpoints) {
                (Some(edge_type), Some(endpoints)) => {
                    self.replace_edge(identity, edge_type, endpoints, properties)
                        .await
                }
                _ => self.replace_edge_properties(identity, properties).await,
            },
            Mutation::DeleteEdge { identity } => self.delete_edge(identity).await,
        }
    }

    // ── Vertices ─────────────────────────────────────────────────

    /// Find-or-create a vertex and merge properties into it.
    pub async fn upsert_vertex(
        &self,
        identity: &EntityIdentity,
        vertex_type: Option<&str>,
        properties: &Properties,
    ) -> Result<Ack, GraphError> {
        let set_clause = "SET n += apoc.convert.fromJsonMap($props)";
        self.write_vertex(identity, vertex_type, properties, set_clause)
            .await
    }

    /// Find-or-create a vertex and make `properties` its whole property set.
    pub async fn replace_vertex(
        &self,
        identity: &EntityIdentity,
        vertex_type: Option<&str>,
        properties: &Properties,
    ) -> Result<Ack, GraphError> {
        let set_clause = format!("SET n = apoc.convert.fromJsonMap($props), n.{IDENTITY_KEY} = $uid");
        self.write_vertex(identity, vertex_type, properties, &set_clause)
            .await
    }

    async fn write_vertex(
        &self,
        identity: &EntityIdentity,
        vertex_type: Option<&str>,
        properties: &Properties,
        set_clause: &str,
    ) -> Result<Ack, GraphError> {
        let tag_clause = match vertex_type {
            Some(tag) => format!("SET n:{}", quote_label(tag)?),
            None => String::new(),
        };

        let cypher = format!(
            "MERGE (n:{label} {{{IDENTITY_KEY}: $uid}})
             {set_clause}
             {tag_clause}",
            label = self.vertex_label()
        );

        let q = query(&cypher)
            .param("uid", identity.as_str())
            .param("props", props_json(properties)?);

        self.run(q).await?;
        Ok(Ack::Applied)
    }

    /// Delete a vertex and its attached edges. Missing vertices are a no-op.
    pub async fn delete_vertex(&self, identity: &EntityIdentity) -> Result<Ack, GraphError> {
        let cypher = format!(
            "MATCH (n:{label} {{{IDENTITY_KEY}: $uid}})
             DETACH DELETE n
             RETURN count(n) AS cnt",
            label = self.vertex_label()
        );

        let q = query(&cypher).param("uid", identity.as_str());
        self.count_ack(q).await
    }

    // ── Edges ────────────────────────────────────────────────────

    /// Find-or-create an edge by identity.
    ///
    /// When the edge is created, missing endpoint vertices are created as
    /// bare stubs carrying only their identity, so an edge arriving before
    /// its vertices is not lost. An existing edge only has its properties
    /// merged; its type and endpoints never change.
    pub async fn upsert_edge(
        &self,
        identity: &EntityIdentity,
        edge_type: &str,
        endpoints: &EdgeEndpoints,
        properties: &Properties,
    ) -> Result<Ack, GraphError> {
        let clause = edge_merge_clause("existing");
        self.write_edge(identity, edge_type, endpoints, properties, &clause)
            .await
    }

    /// Find-or-create an edge by identity, replacing the properties of an
    /// existing edge instead of merging into them.
    pub async fn replace_edge(
        &self,
        identity: &EntityIdentity,
        edge_type: &str,
        endpoints: &EdgeEndpoints,
        properties: &Properties,
    ) -> Result<Ack, GraphError> {
        let clause = edge_replace_clause("existing");
        self.write_edge(identity, edge_type, endpoints, properties, &clause)
            .await
    }

    async fn write_edge(
        &self,
        identity: &EntityIdentity,
        edge_type: &str,
        endpoints: &EdgeEndpoints,
        properties: &Properties,
        existing_clause: &str,
    ) -> Result<Ack, GraphError> {
        let rel_type = quote_label(edge_type)?;
        let cypher = format!(
            "OPTIONAL MATCH ()-[existing {{{IDENTITY_KEY}: $uid}}]->()
             WITH existing LIMIT 1
             FOREACH (ignored IN CASE WHEN existing IS NULL THEN [1] ELSE [] END |
               MERGE (a:{label} {{{IDENTITY_KEY}: $source}})
               MERGE (b:{label} {{{IDENTITY_KEY}: $target}})
               CREATE (a)-[r:{rel_type} {{{IDENTITY_KEY}: $uid, {EDGE_TYPE_KEY}: $edge_type}}]->(b)
               SET r += apoc.convert.fromJsonMap($props))
             FOREACH (ignored IN CASE WHEN existing IS NULL THEN [] ELSE [1] END |
               {existing_clause})",
            label = self.vertex_label()
        );

        let q = query(&cypher)
            .param("uid", identity.as_str())
            .param("edge_type", edge_type)
            .param("source", endpoints.source.as_str())
            .param("target", endpoints.target.as_str())
            .param("props", props_json(properties)?);

        self.run(q).await?;
        Ok(Ack::Applied)
    }

    /// Merge properties into an existing edge. Missing edges are a no-op.
    pub async fn merge_edge_properties(
        &self,
        identity: &EntityIdentity,
        properties: &Properties,
    ) -> Result<Ack, GraphError> {
        self.write_edge_properties(identity, properties, &edge_merge_clause("r"))
            .await
    }

    /// Replace the properties of an existing edge, keeping its `uid` and
    /// `edgeType`. Missing edges are a no-op.
    pub async fn replace_edge_properties(
        &self,
        identity: &EntityIdentity,
        properties: &Properties,
    ) -> Result<Ack, GraphError> {
        self.write_edge_properties(identity, properties, &edge_replace_clause("r"))
            .await
    }

    async fn write_edge_properties(
        &self,
        identity: &EntityIdentity,
        properties: &Properties,
        set_clause: &str,
    ) -> Result<Ack, GraphError> {
        let cypher = format!(
            "MATCH ()-[r {{{IDENTITY_KEY}: $uid}}]->()
             {set_clause}
             RETURN count(r) AS cnt"
        );

        let q = query(&cypher)
            .param("uid", identity.as_str())
            .param("props", props_json(properties)?);
        self.count_ack(q).await
    }

    /// Delete an edge by identity. Missing edges are a no-op.
    pub async fn delete_edge(&self, identity: &EntityIdentity) -> Result<Ack, GraphError> {
        let cypher = format!(
            "MATCH ()-[r {{{IDENTITY_KEY}: $uid}}]->()
             DELETE r
             RETURN count(r) AS cnt"
        );

        let q = query(&cypher).param("uid", identity.as_str());
        self.count_ack(q).await
    }

    async fn count_ack(&self, q: neo4rs::Query) -> Result<Ack, GraphError> {
        let touched = match self.query_one(q).await? {
            Some(row) => row.get::<i64>("cnt").unwrap_or(0),
            None => 0,
        };
        Ok(if touched > 0 { Ack::Applied } else { Ack::Noop })
    }
}

#[async_trait]
impl MutationExecutor for GraphClient {
    async fn apply(&self, mutation: &Mutation) -> Result<Ack, ExecError> {
        self.apply_mutation(mutation).await.map_err(|e| {
            tracing::debug!(
                kind = mutation.kind(),
                uid = %mutation.identity(),
                error = %e,
                "Neo4j apply failed"
            );
            ExecError::from(e)
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn edge_merge_clause(var: &str) -> String {
    format!("SET {var} += apoc.convert.fromJsonMap($props)")
}

/// Swap an edge's properties wholesale. The identity and type keys are
/// restored from the relationship itself.
fn edge_replace_clause(var: &str) -> String {
    format!(
        "SET {var} = apoc.convert.fromJsonMap($props), \
         {var}.{IDENTITY_KEY} = $uid, {var}.{EDGE_TYPE_KEY} = type({var})"
    )
}

fn props_json(properties: &Properties) -> Result<String, GraphError> {
    serde_json::to_string(properties).map_err(|e| GraphError::Serialization(e.to_string()))
}
