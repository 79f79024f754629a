//! Mutation building: one classified change event to one graph mutation.
//!
//! Vertex and edge collections translate differently, but both paths are
//! pure: the same event always yields the same mutation, so replays are
//! harmless once the executor applies idempotently.

use serde_json::{Map, Value};

use graphsync_core::types::SOURCE_ID_FIELD;
use graphsync_core::{
    ChangeEvent, ChangeOp, EdgeEndpoints, EntityIdentity, Mutation, Properties, SyncSettings,
};

use crate::error::{ProjectionError, TranslationError};
use crate::identity::IdentityMapper;
use crate::projection::FieldProjector;

/// Translates change events on routed collections into mutations.
#[derive(Debug, Clone, Copy)]
pub struct MutationBuilder<'a> {
    settings: &'a SyncSettings,
    mapper: IdentityMapper,
    projector: FieldProjector<'a>,
}

impl<'a> MutationBuilder<'a> {
    pub fn new(settings: &'a SyncSettings, mapper: IdentityMapper) -> Self {
        Self {
            settings,
            mapper,
            projector: FieldProjector::new(settings, mapper),
        }
    }

    /// Translate an event on a vertex collection.
    pub fn build_vertex(
        &self,
        collection: &str,
        event: &ChangeEvent,
    ) -> Result<Mutation, TranslationError> {
        match event.op {
            ChangeOp::Insert => {
                let identity = self.mapper.document_identity(&event.document)?;
                self.upsert_vertex(collection, identity, &event.document)
            }
            ChangeOp::Update if event.replacement => {
                let identity = self.prior_identity(event)?;
                let properties =
                    self.projector.project_vertex(collection, &identity, &event.document)?;
                Ok(Mutation::ReplaceVertex {
                    identity,
                    vertex_type: self.settings.type_tag(collection).map(str::to_string),
                    properties,
                })
            }
            ChangeOp::Update => {
                let identity = self.prior_identity(event)?;
                self.upsert_vertex(collection, identity, &event.document)
            }
            ChangeOp::Delete => Ok(Mutation::DeleteVertex {
                identity: self.prior_identity(event)?,
            }),
        }
    }

    /// Translate an event on an edge collection.
    pub fn build_edge(
        &self,
        collection: &str,
        event: &ChangeEvent,
    ) -> Result<Mutation, TranslationError> {
        match event.op {
            ChangeOp::Insert => {
                let identity = self.mapper.document_identity(&event.document)?;
                let source = self.endpoint(collection, event, "source")?;
                let target = self.endpoint(collection, event, "target")?;
                let edge_type = self.edge_label(collection, &event.document)?.ok_or_else(|| {
                    TranslationError::MissingEdgeLabel {
                        collection: collection.to_string(),
                        field: self.settings.edge_label_field().to_string(),
                    }
                })?;
                self.upsert_edge(
                    collection,
                    identity,
                    Some(edge_type),
                    Some(EdgeEndpoints { source, target }),
                    &event.document,
                )
            }
            ChangeOp::Update => {
                let identity = self.prior_identity(event)?;
                let label = self.edge_label(collection, &event.document)?;
                let endpoints = self.update_endpoints(collection, &identity, event)?;
                self.update_edge(collection, identity, label, endpoints, event)
            }
            ChangeOp::Delete => Ok(Mutation::DeleteEdge {
                identity: self.prior_identity(event)?,
            }),
        }
    }

    fn upsert_vertex(
        &self,
        collection: &str,
        identity: EntityIdentity,
        raw: &Map<String, Value>,
    ) -> Result<Mutation, TranslationError> {
        let properties = self.projector.project_vertex(collection, &identity, raw)?;
        Ok(Mutation::UpsertVertex {
            identity,
            vertex_type: self.settings.type_tag(collection).map(str::to_string),
            properties,
        })
    }

    /// An edge's type is fixed when it is created. An update only carries it
    /// along with restated endpoints, for the case where the edge is missing
    /// and gets created; it never rewrites `edgeType` on an existing edge.
    fn update_edge(
        &self,
        collection: &str,
        identity: EntityIdentity,
        label: Option<String>,
        endpoints: Option<EdgeEndpoints>,
        event: &ChangeEvent,
    ) -> Result<Mutation, TranslationError> {
        let untagged = self.settings.type_tag(collection).is_none();
        if untagged && label.is_some() && endpoints.is_none() {
            tracing::warn!(
                collection,
                identity = %identity,
                "Edge update restates the label without endpoints, ignoring it"
            );
        }

        let edge_type = if endpoints.is_some() { label } else { None };
        let properties = self.edge_properties(collection, &identity, None, &event.document)?;
        if event.replacement {
            return Ok(Mutation::ReplaceEdge {
                identity,
                edge_type,
                endpoints,
                properties,
            });
        }
        Ok(Mutation::UpsertEdge {
            identity,
            edge_type,
            endpoints,
            properties,
        })
    }

    fn upsert_edge(
        &self,
        collection: &str,
        identity: EntityIdentity,
        edge_type: Option<String>,
        endpoints: Option<EdgeEndpoints>,
        raw: &Map<String, Value>,
    ) -> Result<Mutation, TranslationError> {
        let properties = self.edge_properties(collection, &identity, edge_type.as_deref(), raw)?;
        Ok(Mutation::UpsertEdge {
            identity,
            edge_type,
            endpoints,
            properties,
        })
    }

    fn edge_properties(
        &self,
        collection: &str,
        identity: &EntityIdentity,
        label: Option<&str>,
        raw: &Map<String, Value>,
    ) -> Result<Properties, TranslationError> {
        let consumed = [
            self.settings.edge_source_field(),
            self.settings.edge_target_field(),
            self.settings.edge_label_field(),
        ];
        // A configured type tag leaves the label field as ordinary data.
        let consumed = if self.settings.type_tag(collection).is_some() {
            &consumed[..2]
        } else {
            &consumed[..]
        };

        Ok(self
            .projector
            .project_edge(collection, identity, label, raw, consumed)?)
    }

    /// Identity of the document an update or delete applies to.
    fn prior_identity(&self, event: &ChangeEvent) -> Result<EntityIdentity, TranslationError> {
        let id = event
            .previous_identity
            .as_ref()
            .or_else(|| event.document.get(SOURCE_ID_FIELD))
            .ok_or_else(|| TranslationError::MissingPreviousIdentity {
                op: event.op.as_str(),
                namespace: event.namespace.clone(),
            })?;
        Ok(self.mapper.map_value(id)?)
    }

    fn endpoint(
        &self,
        collection: &str,
        event: &ChangeEvent,
        endpoint: &'static str,
    ) -> Result<EntityIdentity, TranslationError> {
        let field = self.endpoint_field(endpoint);
        match event.document.get(field) {
            None | Some(Value::Null) => Err(TranslationError::MissingEndpoint {
                collection: collection.to_string(),
                endpoint,
                field: field.to_string(),
            }),
            Some(value) => Ok(self.mapper.map_value(value)?),
        }
    }

    fn endpoint_field(&self, endpoint: &str) -> &str {
        if endpoint == "source" {
            self.settings.edge_source_field()
        } else {
            self.settings.edge_target_field()
        }
    }

    /// Endpoints restated by an update. They only matter if the edge has to
    /// be created; an existing edge keeps the endpoints it was created with.
    fn update_endpoints(
        &self,
        collection: &str,
        identity: &EntityIdentity,
        event: &ChangeEvent,
    ) -> Result<Option<EdgeEndpoints>, TranslationError> {
        let has = |endpoint: &str| {
            event
                .document
                .get(self.endpoint_field(endpoint))
                .is_some_and(|v| !v.is_null())
        };

        match (has("source"), has("target")) {
            (true, true) => Ok(Some(EdgeEndpoints {
                source: self.endpoint(collection, event, "source")?,
                target: self.endpoint(collection, event, "target")?,
            })),
            (false, false) => Ok(None),
            _ => {
                tracing::warn!(
                    collection,
                    identity = %identity,
                    "Edge update restates only one endpoint, ignoring it"
                );
                Ok(None)
            }
        }
    }

    /// The configured type tag, else the document's label field.
    fn edge_label(
        &self,
        collection: &str,
        document: &Map<String, Value>,
    ) -> Result<Option<String>, TranslationError> {
        if let Some(tag) = self.settings.type_tag(collection) {
            return Ok(Some(tag.to_string()));
        }

        let field = self.settings.edge_label_field();
        match document.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(label)) if !label.is_empty() => Ok(Some(label.clone())),
            Some(_) => Err(ProjectionError::InvalidValue {
                collection: collection.to_string(),
                field: field.to_string(),
                reason: "edge label must be a non-empty string".to_string(),
            }
            .into()),
        }
    }
}
