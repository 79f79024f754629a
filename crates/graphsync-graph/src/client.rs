//! Neo4j connection management and shared graph client.

use graphsync_core::ExecError;
use neo4rs::{ConfigBuilder, Graph, Query};

/// Errors from graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Neo4j connection error: {0}")]
    Connection(String),

    #[error("Neo4j query error: {0}")]
    Query(#[from] neo4rs::Error),

    #[error("Invalid label or relationship type: {0:?}")]
    InvalidLabel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GraphError {
    /// Whether retrying the same statement may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Query(e) => matches!(
                e,
                neo4rs::Error::IOError { .. } | neo4rs::Error::ConnectionError
            ),
            Self::InvalidLabel(_) | Self::Serialization(_) => false,
        }
    }
}

impl From<GraphError> for ExecError {
    fn from(e: GraphError) -> Self {
        if e.is_transient() {
            ExecError::Unavailable(e.to_string())
        } else {
            ExecError::Rejected(e.to_string())
        }
    }
}

/// Configuration for connecting to Neo4j.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
    pub fetch_size: usize,
    /// Label every synced vertex carries; identities are unique under it.
    pub vertex_label: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "graphsync-dev".to_string(),
            max_connections: 16,
            fetch_size: 256,
            vertex_label: "Vertex".to_string(),
        }
    }
}

/// Thread-safe Neo4j graph client with connection pooling.
///
/// Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct GraphClient {
    graph: Graph,
    vertex_label: String,
}

impl GraphClient {
    /// Connect to Neo4j with the given configuration.
    pub async fn connect(config: &GraphConfig) -> Result<Self, GraphError> {
        let vertex_label = quote_label(&config.vertex_label)?;

        let neo_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .max_connections(config.max_connections as usize)
            .fetch_size(config.fetch_size)
            .build()
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        let graph = Graph::connect(neo_config)
            .await
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        tracing::info!(uri = %config.uri, "Connected to Neo4j");
        Ok(Self {
            graph,
            vertex_label,
        })
    }

    /// The quoted base vertex label, ready for interpolation.
    pub(crate) fn vertex_label(&self) -> &str {
        &self.vertex_label
    }

    /// Execute a write-only query (CREATE, MERGE, DELETE, SET).
    pub async fn run(&self, query: Query) -> Result<(), GraphError> {
        self.graph.run(query).await?;
        Ok(())
    }

    /// Execute a query and return the first row, if any.
    pub async fn query_one(&self, query: Query) -> Result<Option<neo4rs::Row>, GraphError> {
        let mut stream = self.graph.execute(query).await?;
        Ok(stream.next().await?)
    }
}

/// Validate a label or relationship type and wrap it in backticks.
pub(crate) fn quote_label(label: &str) -> Result<String, GraphError> {
    let mut chars = label.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(format!("`{label}`"))
    } else {
        Err(GraphError::InvalidLabel(label.to_string()))
    }
}
