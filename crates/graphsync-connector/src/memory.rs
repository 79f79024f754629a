//! In-memory graph executor.
//!
//! Applies mutations with the same semantics as the Neo4j executor: merge
//! by identity, null clears a property, deletes of missing entities are
//! no-ops, edge upserts create stub endpoints. Backs `--dry-run` and the
//! pipeline tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use graphsync_core::types::{EDGE_TYPE_KEY, IDENTITY_KEY};
use graphsync_core::{
    Ack, EdgeEndpoints, EntityIdentity, ExecError, Mutation, MutationExecutor, Properties,
    PropertyValue,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VertexState {
    /// Type tags the vertex has been given.
    pub labels: BTreeSet<String>,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeState {
    pub edge_type: String,
    pub source: EntityIdentity,
    pub target: EntityIdentity,
    pub properties: Properties,
}

/// A whole graph as plain values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    pub vertices: BTreeMap<EntityIdentity, VertexState>,
    pub edges: BTreeMap<EntityIdentity, EdgeState>,
}

impl GraphSnapshot {
    pub fn apply(&mut self, mutation: &Mutation) -> Ack {
        match mutation {
            Mutation::UpsertVertex {
                identity,
                vertex_type,
                properties,
            } => {
                let vertex = self.vertex_entry(identity);
                if let Some(tag) = vertex_type {
                    vertex.labels.insert(tag.clone());
                }
                merge(&mut vertex.properties, properties);
                Ack::Applied
            }
            Mutation::ReplaceVertex {
                identity,
                vertex_type,
                properties,
            } => {
                let vertex = self.vertex_entry(identity);
                if let Some(tag) = vertex_type {
                    vertex.labels.insert(tag.clone());
                }
                vertex.properties.clear();
                merge(&mut vertex.properties, properties);
                vertex
                    .properties
                    .insert(IDENTITY_KEY.to_string(), identity.as_str().into());
                Ack::Applied
            }
            Mutation::DeleteVertex { identity } => {
                if self.vertices.remove(identity).is_none() {
                    return Ack::Noop;
                }
                self.edges
                    .retain(|_, e| e.source != *identity && e.target != *identity);
                Ack::Applied
            }
            Mutation::UpsertEdge {
                identity,
                edge_type,
                endpoints,
                properties,
            } => {
                if let Some(edge) = self.edges.get_mut(identity) {
                    merge(&mut edge.properties, properties);
                    return Ack::Applied;
                }
                self.create_edge(identity, edge_type.as_deref(), endpoints.as_ref(), properties)
            }
            Mutation::ReplaceEdge {
                identity,
                edge_type,
                endpoints,
                properties,
            } => {
                if let Some(edge) = self.edges.get_mut(identity) {
                    let mut replaced = Properties::new();
                    merge(&mut replaced, properties);
                    replaced.insert(IDENTITY_KEY.to_string(), identity.as_str().into());
                    replaced.insert(EDGE_TYPE_KEY.to_string(), edge.edge_type.as_str().into());
                    edge.properties = replaced;
                    return Ack::Applied;
                }
                self.create_edge(identity, edge_type.as_deref(), endpoints.as_ref(), properties)
            }
            Mutation::DeleteEdge { identity } => match self.edges.remove(identity) {
                Some(_) => Ack::Applied,
                None => Ack::Noop,
            },
        }
    }

    /// Create a missing edge with stub endpoints. Without a type and
    /// endpoints there is nothing to create.
    fn create_edge(
        &mut self,
        identity: &EntityIdentity,
        edge_type: Option<&str>,
        endpoints: Option<&EdgeEndpoints>,
        properties: &Properties,
    ) -> Ack {
        let (Some(edge_type), Some(EdgeEndpoints { source, target })) = (edge_type, endpoints)
        else {
            return Ack::Noop;
        };

        self.vertex_entry(source);
        self.vertex_entry(target);
        let mut edge = EdgeState {
            edge_type: edge_type.to_string(),
            source: source.clone(),
            target: target.clone(),
            properties: Properties::new(),
        };
        edge.properties.insert(EDGE_TYPE_KEY.to_string(), edge_type.into());
        merge(&mut edge.properties, properties);
        self.edges.insert(identity.clone(), edge);
        Ack::Applied
    }

    /// Find-or-create a vertex. New vertices carry only their identity.
    fn vertex_entry(&mut self, identity: &EntityIdentity) -> &mut VertexState {
        self.vertices.entry(identity.clone()).or_insert_with(|| {
            let mut vertex = VertexState::default();
            vertex
                .properties
                .insert(IDENTITY_KEY.to_string(), identity.as_str().into());
            vertex
        })
    }
}

fn merge(target: &mut Properties, update: &Properties) {
    for (key, value) in update {
        match value {
            PropertyValue::Null => {
                target.remove(key);
            }
            v => {
                target.insert(key.clone(), v.clone());
            }
        }
    }
}

/// Thread-safe executor over a `GraphSnapshot`.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: Mutex<GraphSnapshot>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MutationExecutor for MemoryGraph {
    async fn apply(&self, mutation: &Mutation) -> Result<Ack, ExecError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.apply(mutation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, PropertyValue)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn follows(id: &str, endpoints: bool) -> Mutation {
        Mutation::UpsertEdge {
            identity: id.into(),
            edge_type: Some("FOLLOWS".to_string()),
            endpoints: endpoints.then(|| EdgeEndpoints {
                source: "u1".into(),
                target: "u2".into(),
            }),
            properties: props(&[("uid", id.into())]),
        }
    }

    #[test]
    fn every_mutation_is_idempotent() {
        let mutations = [
            Mutation::UpsertVertex {
                identity: "u1".into(),
                vertex_type: Some("User".to_string()),
                properties: props(&[("uid", "u1".into()), ("name", "ada".into())]),
            },
            follows("e1", true),
            Mutation::DeleteEdge {
                identity: "e1".into(),
            },
            Mutation::DeleteVertex {
                identity: "u2".into(),
            },
        ];

        let mut base = GraphSnapshot::default();
        for m in &mutations {
            let mut once = base.clone();
            once.apply(m);
            let mut twice = once.clone();
            twice.apply(m);
            assert_eq!(once, twice, "{}", m.kind());
            base = once;
        }
    }

    #[test]
    fn null_clears_a_property() {
        let mut graph = GraphSnapshot::default();
        graph.apply(&Mutation::UpsertVertex {
            identity: "u1".into(),
            vertex_type: None,
            properties: props(&[("a", 1i64.into()), ("b", 2i64.into())]),
        });
        graph.apply(&Mutation::UpsertVertex {
            identity: "u1".into(),
            vertex_type: None,
            properties: props(&[("b", PropertyValue::Null)]),
        });

        let v = &graph.vertices[&EntityIdentity::from("u1")];
        assert_eq!(v.properties.get("a"), Some(&PropertyValue::Int(1)));
        assert!(!v.properties.contains_key("b"));
    }

    #[test]
    fn edge_upsert_creates_stub_endpoints() {
        let mut graph = GraphSnapshot::default();
        assert_eq!(graph.apply(&follows("e1", true)), Ack::Applied);
        assert_eq!(graph.vertices.len(), 2);
        assert_eq!(
            graph.vertices[&EntityIdentity::from("u2")].properties.get("uid"),
            Some(&"u2".into())
        );

        // Parallel edge between the same endpoints.
        graph.apply(&follows("e2", true));
        assert_eq!(graph.edges.len(), 2);
    }

    #[test]
    fn edge_update_without_endpoints_on_missing_edge_is_noop() {
        let mut graph = GraphSnapshot::default();
        assert_eq!(graph.apply(&follows("e1", false)), Ack::Noop);
        assert!(graph.edges.is_empty());
        assert!(graph.vertices.is_empty());
    }

    #[test]
    fn existing_edge_keeps_its_endpoints() {
        let mut graph = GraphSnapshot::default();
        graph.apply(&follows("e1", true));
        graph.apply(&Mutation::UpsertEdge {
            identity: "e1".into(),
            edge_type: Some("LIKES".to_string()),
            endpoints: Some(EdgeEndpoints {
                source: "u8".into(),
                target: "u9".into(),
            }),
            properties: props(&[("w", 2i64.into())]),
        });

        let e = &graph.edges[&EntityIdentity::from("e1")];
        assert_eq!(e.source, "u1".into());
        assert_eq!(e.edge_type, "FOLLOWS");
        assert_eq!(e.properties.get("edgeType"), Some(&"FOLLOWS".into()));
        assert_eq!(e.properties.get("w"), Some(&PropertyValue::Int(2)));
    }

    #[test]
    fn replace_drops_fields_missing_from_the_new_document() {
        let mut graph = GraphSnapshot::default();
        graph.apply(&Mutation::UpsertVertex {
            identity: "u1".into(),
            vertex_type: Some("User".to_string()),
            properties: props(&[("uid", "u1".into()), ("a", 1i64.into()), ("b", 2i64.into())]),
        });
        graph.apply(&Mutation::ReplaceVertex {
            identity: "u1".into(),
            vertex_type: Some("User".to_string()),
            properties: props(&[("uid", "u1".into()), ("b", 3i64.into())]),
        });

        let v = &graph.vertices[&EntityIdentity::from("u1")];
        assert!(!v.properties.contains_key("a"));
        assert_eq!(v.properties.get("b"), Some(&PropertyValue::Int(3)));
        assert!(v.labels.contains("User"));

        graph.apply(&follows("e1", true));
        graph.apply(&Mutation::UpsertEdge {
            identity: "e1".into(),
            edge_type: None,
            endpoints: None,
            properties: props(&[("w", 1i64.into())]),
        });
        graph.apply(&Mutation::ReplaceEdge {
            identity: "e1".into(),
            edge_type: Some("LIKES".to_string()),
            endpoints: None,
            properties: props(&[("since", 2020i64.into())]),
        });

        let e = &graph.edges[&EntityIdentity::from("e1")];
        assert_eq!(e.edge_type, "FOLLOWS");
        assert!(!e.properties.contains_key("w"));
        assert_eq!(e.properties.get("since"), Some(&PropertyValue::Int(2020)));
        assert_eq!(e.properties.get("uid"), Some(&"e1".into()));
        assert_eq!(e.properties.get("edgeType"), Some(&"FOLLOWS".into()));
    }

    #[test]
    fn deleting_a_vertex_detaches_its_edges() {
        let mut graph = GraphSnapshot::default();
        graph.apply(&follows("e1", true));
        assert_eq!(
            graph.apply(&Mutation::DeleteVertex {
                identity: "u1".into()
            }),
            Ack::Applied
        );
        assert!(graph.edges.is_empty());
        assert_eq!(
            graph.apply(&Mutation::DeleteVertex {
                identity: "u1".into()
            }),
            Ack::Noop
        );
    }

    #[tokio::test]
    async fn memory_graph_applies_through_the_executor_trait() {
        let graph = MemoryGraph::new();
        let ack = graph
            .apply(&Mutation::DeleteVertex {
                identity: "ghost".into(),
            })
            .await
            .unwrap();
        assert_eq!(ack, Ack::Noop);
        assert!(graph.snapshot().vertices.is_empty());
    }
}
