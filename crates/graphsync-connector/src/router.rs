//! Change routing: classify each event by namespace and dispatch it to the
//! vertex or edge translator.

use std::sync::Arc;

use graphsync_core::{ChangeEvent, Mutation, SyncSettings};

use crate::builder::MutationBuilder;
use crate::error::TranslationError;
use crate::identity::IdentityMapper;

/// Where an event goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision<'e> {
    Vertex { collection: &'e str },
    Edge { collection: &'e str },
    Ignored,
}

/// Classify an event. Total over all namespaces: anything outside the
/// database scope or the configured collections is `Ignored`.
pub fn route<'e>(event: &'e ChangeEvent, settings: &SyncSettings) -> RoutingDecision<'e> {
    match event.collection_in(settings.database()) {
        Some(c) if settings.is_vertex_collection(c) => RoutingDecision::Vertex { collection: c },
        Some(c) if settings.is_edge_collection(c) => RoutingDecision::Edge { collection: c },
        _ => RoutingDecision::Ignored,
    }
}

/// Routes events and translates them into mutations.
#[derive(Debug, Clone)]
pub struct ChangeRouter {
    settings: Arc<SyncSettings>,
    mapper: IdentityMapper,
}

impl ChangeRouter {
    pub fn new(settings: Arc<SyncSettings>, mapper: IdentityMapper) -> Self {
        Self { settings, mapper }
    }

    pub fn route<'e>(&self, event: &'e ChangeEvent) -> RoutingDecision<'e> {
        route(event, &self.settings)
    }

    /// Translate an event. `Ok(None)` means the event is ignored.
    pub fn dispatch(&self, event: &ChangeEvent) -> Result<Option<Mutation>, TranslationError> {
        let builder = MutationBuilder::new(&self.settings, self.mapper);
        let mutation = match self.route(event) {
            RoutingDecision::Vertex { collection } => builder.build_vertex(collection, event)?,
            RoutingDecision::Edge { collection } => builder.build_edge(collection, event)?,
            RoutingDecision::Ignored => return Ok(None),
        };

        tracing::debug!(
            namespace = %event.namespace,
            op = event.op.as_str(),
            kind = mutation.kind(),
            identity = %mutation.identity(),
            "Routed change event"
        );
        Ok(Some(mutation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphsync_core::{FeedPosition, SyncConfig};
    use serde_json::json;

    fn settings() -> SyncSettings {
        SyncConfig {
            database: "app".to_string(),
            vertex_collections: vec!["users".to_string()],
            edge_collections: vec!["follows".to_string()],
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    fn event(ns: &str) -> ChangeEvent {
        ChangeEvent::insert(
            ns,
            FeedPosition::new(1, 0),
            json!({"_id": "x", "src": "a", "dest": "b", "type": "T"})
                .as_object()
                .unwrap()
                .clone(),
        )
    }

    #[test]
    fn routes_by_namespace() {
        let settings = settings();
        assert_eq!(
            route(&event("app.users"), &settings),
            RoutingDecision::Vertex { collection: "users" }
        );
        assert_eq!(
            route(&event("app.follows"), &settings),
            RoutingDecision::Edge {
                collection: "follows"
            }
        );
    }

    #[test]
    fn everything_else_is_ignored() {
        let settings = settings();
        for ns in ["app.orders", "other.users", "app", "appx.users", "admin.$cmd"] {
            assert_eq!(route(&event(ns), &settings), RoutingDecision::Ignored, "{ns}");
        }
    }

    #[test]
    fn routing_is_deterministic() {
        let settings = settings();
        let e = event("app.users");
        assert_eq!(route(&e, &settings), route(&e, &settings));
    }

    #[test]
    fn dispatch_translates_routed_events() {
        let router = ChangeRouter::new(Arc::new(settings()), IdentityMapper::new());
        assert!(matches!(
            router.dispatch(&event("app.users")),
            Ok(Some(Mutation::UpsertVertex { .. }))
        ));
        assert!(matches!(
            router.dispatch(&event("app.follows")),
            Ok(Some(Mutation::UpsertEdge { .. }))
        ));
        assert_eq!(router.dispatch(&event("other.users")), Ok(None));
    }
}
