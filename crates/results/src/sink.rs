use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, params};

use crate::record::InvocationResult;

/// Batch write failure. The pipeline logs it and drops the batch.
#[derive(Debug)]
pub struct SinkError {
    message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SinkError {}

impl From<rusqlite::Error> for SinkError {
    fn from(err: rusqlite::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Append-only destination for invocation result batches. Must tolerate
/// arbitrary-size batches; no ordering guarantees across calls.
pub trait ResultSink: Send + Sync {
    fn write(&self, batch: &[InvocationResult]) -> Result<(), SinkError>;
}

/// Durable sink backed by SQLite. Each write is one transaction; rows
/// older than the retention window are pruned after every write.
pub struct SqliteSink {
    db_path: PathBuf,
    retention_days: u64,
}

impl SqliteSink {
    pub fn new(db_path: PathBuf, retention_days: u64) -> Self {
        Self {
            db_path,
            retention_days,
        }
    }

    pub fn fetch_recent(&self, limit: usize) -> Result<Vec<InvocationResult>, SinkError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT function_id, deployment_id, cpu_time_us, memory_bytes, received_bytes, sent_bytes, status_code, timestamp_ms
             FROM invocation_results
             ORDER BY timestamp_ms DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(InvocationResult {
                function_id: row.get(0)?,
                deployment_id: row.get(1)?,
                cpu_time_us: row.get::<_, i64>(2)? as u64,
                memory_bytes: row.get::<_, i64>(3)? as u64,
                received_bytes: row.get::<_, i64>(4)? as u64,
                sent_bytes: row.get::<_, i64>(5)? as u64,
                status_code: row.get::<_, i64>(6)? as u16,
                timestamp_ms: row.get::<_, i64>(7)? as u64,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS invocation_results (
                function_id TEXT NOT NULL,
                deployment_id TEXT NOT NULL,
                cpu_time_us INTEGER NOT NULL,
                memory_bytes INTEGER NOT NULL,
                received_bytes INTEGER NOT NULL,
                sent_bytes INTEGER NOT NULL,
                status_code INTEGER NOT NULL,
                timestamp_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS invocation_results_timestamp
            ON invocation_results(timestamp_ms DESC);",
        )?;
        Ok(conn)
    }

    fn prune(&self, conn: &Connection) -> rusqlite::Result<()> {
        if self.retention_days == 0 {
            return Ok(());
        }

        let cutoff = now_millis().saturating_sub(
            Duration::from_secs(self.retention_days * 24 * 60 * 60).as_millis() as u64,
        );

        conn.execute(
            "DELETE FROM invocation_results WHERE timestamp_ms < ?1",
            params![cutoff as i64],
        )?;
        Ok(())
    }
}

impl ResultSink for SqliteSink {
    fn write(&self, batch: &[InvocationResult]) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.connect()?;
        {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO invocation_results
                    (function_id, deployment_id, cpu_time_us, memory_bytes, received_bytes, sent_bytes, status_code, timestamp_ms)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;

                for result in batch {
                    stmt.execute(params![
                        result.function_id,
                        result.deployment_id,
                        result.cpu_time_us as i64,
                        result.memory_bytes as i64,
                        result.received_bytes as i64,
                        result.sent_bytes as i64,
                        result.status_code as i64,
                        result.timestamp_ms as i64,
                    ])?;
                }
            }
            tx.commit()?;
        }
        self.prune(&conn)?;
        Ok(())
    }
}

/// In-memory sink for tests. Can be armed to fail the next write.
#[derive(Default)]
pub struct MemorySink {
    writes: Mutex<Vec<Vec<InvocationResult>>>,
    fail_next: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_write(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }

    pub fn writes(&self) -> Vec<Vec<InvocationResult>> {
        self.writes.lock().expect("sink lock").clone()
    }

    pub fn total_results(&self) -> usize {
        self.writes
            .lock()
            .expect("sink lock")
            .iter()
            .map(Vec::len)
            .sum()
    }
}

impl ResultSink for MemorySink {
    fn write(&self, batch: &[InvocationResult]) -> Result<(), SinkError> {
        if self.fail_next.swap(false, Ordering::Relaxed) {
            return Err(SinkError::new("sink unavailable"));
        }
        self.writes.lock().expect("sink lock").push(batch.to_vec());
        Ok(())
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("{}_{}.db", prefix, nonce))
    }

    fn result(deployment_id: &str, status: u16) -> InvocationResult {
        InvocationResult {
            function_id: "fn_a".to_string(),
            deployment_id: deployment_id.to_string(),
            cpu_time_us: 1200,
            memory_bytes: 4096,
            received_bytes: 10,
            sent_bytes: 20,
            status_code: status,
            timestamp_ms: now_millis(),
        }
    }

    #[test]
    fn sqlite_sink_round_trips_a_batch() {
        let sink = SqliteSink::new(temp_db("results_roundtrip"), 7);
        let batch = vec![result("dep_1", 200), result("dep_2", 500)];

        sink.write(&batch).expect("write");

        let stored = sink.fetch_recent(10).expect("fetch");
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().any(|r| r.deployment_id == "dep_1" && r.status_code == 200));
        assert!(stored.iter().any(|r| r.deployment_id == "dep_2" && r.status_code == 500));
    }

    #[test]
    fn sqlite_sink_prunes_rows_past_retention() {
        let sink = SqliteSink::new(temp_db("results_prune"), 1);
        let mut stale = result("dep_old", 200);
        stale.timestamp_ms = now_millis().saturating_sub(3 * 24 * 60 * 60 * 1000);

        sink.write(&[stale]).expect("write stale");
        // The next write prunes everything older than the retention window.
        sink.write(&[result("dep_new", 200)]).expect("write fresh");

        let stored = sink.fetch_recent(10).expect("fetch");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].deployment_id, "dep_new");
    }

    #[test]
    fn memory_sink_fails_once_when_armed() {
        let sink = MemorySink::new();
        sink.fail_next_write();

        assert!(sink.write(&[result("dep_1", 200)]).is_err());
        assert!(sink.write(&[result("dep_1", 200)]).is_ok());
        assert_eq!(sink.total_results(), 1);
    }
}
