//! CQL sessions backed by the ScyllaDB Rust driver

use async_trait::async_trait;
use clusterprobe_core::{ProbeError, ProbeResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use scylla::client::execution_profile::ExecutionProfile;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::policies::host_filter::AllowListHostFilter;
use scylla::statement::{Consistency, Statement};
use scylla::value::Row;

use crate::cluster::{ConsistencyLevel, QuerySession, SessionFactory, TextRow};
use crate::config::CqlConfig;
use crate::node::NodeHandle;

impl From<ConsistencyLevel> for Consistency {
    fn from(level: ConsistencyLevel) -> Self {
        match level {
            ConsistencyLevel::Any => Consistency::Any,
            ConsistencyLevel::One => Consistency::One,
            ConsistencyLevel::Two => Consistency::Two,
            ConsistencyLevel::Quorum => Consistency::Quorum,
            ConsistencyLevel::All => Consistency::All,
        }
    }
}

/// Opens sessions that only ever route to the node they were opened against
pub struct ScyllaSessionFactory {
    config: CqlConfig,
}

impl ScyllaSessionFactory {
    pub fn new(config: CqlConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for ScyllaSessionFactory {
    async fn connect(&self, node: &NodeHandle, keyspace: Option<&str>) -> ProbeResult<Arc<dyn QuerySession>> {
        let contact_point = node.native_address();
        info!("Opening exclusive CQL session to {}", contact_point);

        let filter = AllowListHostFilter::new([contact_point.as_str()]).map_err(|e| {
            ProbeError::query(format!("Invalid contact point {}: {}", contact_point, e))
        })?;

        let mut builder = SessionBuilder::new()
            .known_node(&contact_point)
            .host_filter(Arc::new(filter))
            .connection_timeout(Duration::from_millis(self.config.connection_timeout_ms))
            .default_execution_profile_handle(
                ExecutionProfile::builder()
                    .request_timeout(Some(Duration::from_millis(self.config.request_timeout_ms)))
                    .build()
                    .into_handle(),
            );

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            builder = builder.user(username, password);
        }

        if let Some(keyspace) = keyspace {
            builder = builder.use_keyspace(keyspace, false);
        }

        let session = builder.build().await.map_err(|e| {
            ProbeError::query(format!("Failed to open session to {}: {}", node.name(), e))
        })?;

        Ok(Arc::new(ScyllaSession {
            node: node.name().to_string(),
            session,
        }))
    }
}

/// One driver session
pub struct ScyllaSession {
    node: String,
    session: Session,
}

impl ScyllaSession {
    fn statement(cql: &str, consistency: ConsistencyLevel) -> Statement {
        let mut statement = Statement::new(cql);
        statement.set_consistency(consistency.into());
        statement
    }
}

#[async_trait]
impl QuerySession for ScyllaSession {
    async fn execute(&self, cql: &str, consistency: ConsistencyLevel) -> ProbeResult<()> {
        debug!("{} @ {}: {}", self.node, consistency, cql);
        self.session
            .query_unpaged(Self::statement(cql, consistency), ())
            .await
            .map_err(|e| ProbeError::query(format!("{} failed on {}: {}", cql, self.node, e)))?;
        Ok(())
    }

    async fn select_text(&self, cql: &str, consistency: ConsistencyLevel) -> ProbeResult<Vec<TextRow>> {
        debug!("{} @ {}: {}", self.node, consistency, cql);
        let result = self
            .session
            .query_unpaged(Self::statement(cql, consistency), ())
            .await
            .map_err(|e| ProbeError::query(format!("{} failed on {}: {}", cql, self.node, e)))?;

        let rows_result = result
            .into_rows_result()
            .map_err(|e| ProbeError::query(format!("Failed to parse rows result: {:?}", e)))?;

        let rows_iter = rows_result
            .rows::<Row>()
            .map_err(|e| ProbeError::query(format!("Failed to deserialize rows: {:?}", e)))?;

        let mut rows = Vec::new();
        for row in rows_iter {
            let row = row.map_err(|e| ProbeError::query(format!("Failed to deserialize row: {:?}", e)))?;
            rows.push(
                row.columns
                    .into_iter()
                    .map(|cell| cell.and_then(|value| value.as_text().cloned()))
                    .collect(),
            );
        }

        Ok(rows)
    }
}
