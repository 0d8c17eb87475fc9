//! Schema and row helpers for the key/c1/c2 test table

use clusterprobe_core::{ProbeError, ProbeResult};
use tracing::debug;

use crate::cluster::{ConsistencyLevel, QuerySession};

/// Row state observed when reading back a written key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowPresence {
    Present,
    Missing,
}

pub async fn create_keyspace(
    session: &dyn QuerySession,
    keyspace: &str,
    replication_factor: usize,
) -> ProbeResult<()> {
    let cql = format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
        keyspace, replication_factor
    );
    session.execute(&cql, ConsistencyLevel::All).await?;
    session
        .execute(&format!("USE {}", keyspace), ConsistencyLevel::One)
        .await
}

pub async fn alter_replication(
    session: &dyn QuerySession,
    keyspace: &str,
    replication_factor: usize,
) -> ProbeResult<()> {
    let cql = format!(
        "ALTER KEYSPACE {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
        keyspace, replication_factor
    );
    session.execute(&cql, ConsistencyLevel::All).await
}

/// Create `table (key varchar PRIMARY KEY, c1 text, c2 text)`
pub async fn create_c1c2_table(
    session: &dyn QuerySession,
    table: &str,
    compaction: Option<&str>,
) -> ProbeResult<()> {
    let mut cql = format!(
        "CREATE TABLE IF NOT EXISTS {} (key varchar PRIMARY KEY, c1 text, c2 text)",
        table
    );
    if let Some(strategy) = compaction {
        cql.push_str(&format!(" WITH compaction = {{'class': '{}'}}", strategy));
    }
    session.execute(&cql, ConsistencyLevel::All).await
}

/// Write `k{start}..k{end}` with `c1='value1', c2='value2'`
pub async fn insert_c1c2(
    session: &dyn QuerySession,
    table: &str,
    keys: std::ops::Range<usize>,
    consistency: ConsistencyLevel,
) -> ProbeResult<()> {
    debug!("Inserting {} rows into {} at {}", keys.len(), table, consistency);
    for k in keys {
        let cql = format!(
            "UPDATE {} SET c1='value1', c2='value2' WHERE key='k{}'",
            table, k
        );
        session.execute(&cql, consistency).await?;
    }
    Ok(())
}

/// Read back key `k{k}` and classify it
pub async fn query_c1c2(
    session: &dyn QuerySession,
    table: &str,
    k: usize,
    consistency: ConsistencyLevel,
) -> ProbeResult<RowPresence> {
    let cql = format!("SELECT c1, c2 FROM {} WHERE key='k{}'", table, k);
    let rows = session.select_text(&cql, consistency).await?;

    match rows.as_slice() {
        [] => Ok(RowPresence::Missing),
        [row] if row.len() == 2 => {
            let expected = [Some("value1"), Some("value2")];
            let actual: Vec<Option<&str>> = row.iter().map(|c| c.as_deref()).collect();
            if actual == expected {
                Ok(RowPresence::Present)
            } else {
                Err(ProbeError::query(format!(
                    "key k{} in {} holds unexpected values {:?}",
                    k, table, row
                )))
            }
        }
        other => Err(ProbeError::query(format!(
            "expected at most one row for key k{} in {}, got {}",
            k,
            table,
            other.len()
        ))),
    }
}
