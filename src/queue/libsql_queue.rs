//! libSQL-backed task queue sharing the job store's connection.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DatabaseError, QueueError};
use crate::jobs::TaskMessage;
use crate::queue::{QueueMessage, QueueStats, TaskQueue};
use crate::store::libsql_backend::ts;
use crate::store::{RetryPolicy, with_retry};

/// Queue stored in the `queue_messages` table.
pub struct LibSqlQueue {
    conn: Connection,
    retry: RetryPolicy,
}

impl LibSqlQueue {
    pub fn new(conn: Connection, retry: RetryPolicy) -> Self {
        Self { conn, retry }
    }
}

#[async_trait]
impl TaskQueue for LibSqlQueue {
    async fn enqueue(&self, task: &TaskMessage) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(task)
            .map_err(|e| DatabaseError::Serialization(format!("enqueue: {e}")))?;
        let now = ts(&Utc::now());
        let conn = &self.conn;
        let params = vec![
            Value::Text(id.clone()),
            Value::Text(body),
            Value::Text(now.clone()),
            Value::Text(now),
        ];

        with_retry(self.retry, "enqueue", move || {
            let params = params.clone();
            async move {
                conn.execute(
                    "INSERT INTO queue_messages (id, body, created_at, visible_at, receive_count) VALUES (?1, ?2, ?3, ?4, 0)",
                    params,
                )
                .await
                .map_err(|e| DatabaseError::from_libsql("enqueue", e))
            }
        })
        .await?;

        debug!(message_id = %id, job_id = %task.job_id, task_type = %task.task_type, "Task enqueued");
        Ok(id)
    }

    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(visibility_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let conn = &self.conn;
        let params = vec![Value::Text(ts(&now)), Value::Text(ts(&(now + lease)))];

        // One statement claims the message, so concurrent pollers never
        // lease the same message twice.
        let claimed = with_retry(self.retry, "dequeue", move || {
            let params = params.clone();
            async move {
                let mut rows = conn
                    .query(
                        "UPDATE queue_messages SET visible_at = ?2, receive_count = receive_count + 1 WHERE id = (SELECT id FROM queue_messages WHERE visible_at <= ?1 ORDER BY created_at, id LIMIT 1) RETURNING id, body, receive_count",
                        params,
                    )
                    .await
                    .map_err(|e| DatabaseError::from_libsql("dequeue", e))?;
                match rows
                    .next()
                    .await
                    .map_err(|e| DatabaseError::from_libsql("dequeue", e))?
                {
                    Some(row) => {
                        let id: String = row
                            .get(0)
                            .map_err(|e| DatabaseError::Query(format!("dequeue: {e}")))?;
                        let body: String = row
                            .get(1)
                            .map_err(|e| DatabaseError::Query(format!("dequeue: {e}")))?;
                        let receive_count: i64 = row.get(2).unwrap_or(1);
                        Ok(Some((id, body, receive_count.max(0) as u32)))
                    }
                    None => Ok(None),
                }
            }
        })
        .await?;

        let Some((id, body, receive_count)) = claimed else {
            return Ok(None);
        };

        let task: TaskMessage = serde_json::from_str(&body).map_err(|e| QueueError::Malformed {
            id: id.clone(),
            reason: e.to_string(),
        })?;

        Ok(Some(QueueMessage {
            id,
            task,
            receive_count,
        }))
    }

    async fn ack(&self, id: &str) -> Result<(), QueueError> {
        let conn = &self.conn;
        let params = vec![Value::Text(id.to_string())];
        with_retry(self.retry, "ack", move || {
            let params = params.clone();
            async move {
                conn.execute("DELETE FROM queue_messages WHERE id = ?1", params)
                    .await
                    .map_err(|e| DatabaseError::from_libsql("ack", e))
            }
        })
        .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let conn = &self.conn;
        let params = vec![Value::Text(ts(&Utc::now()))];
        let stats = with_retry(self.retry, "queue_stats", move || {
            let params = params.clone();
            async move {
                let mut rows = conn
                    .query(
                        "SELECT COALESCE(SUM(CASE WHEN visible_at <= ?1 THEN 1 ELSE 0 END), 0), COALESCE(SUM(CASE WHEN visible_at > ?1 THEN 1 ELSE 0 END), 0) FROM queue_messages",
                        params,
                    )
                    .await
                    .map_err(|e| DatabaseError::from_libsql("queue_stats", e))?;
                match rows
                    .next()
                    .await
                    .map_err(|e| DatabaseError::from_libsql("queue_stats", e))?
                {
                    Some(row) => {
                        let pending: i64 = row.get(0).unwrap_or(0);
                        let in_flight: i64 = row.get(1).unwrap_or(0);
                        Ok(QueueStats {
                            pending: pending.max(0) as u64,
                            in_flight: in_flight.max(0) as u64,
                        })
                    }
                    None => Ok(QueueStats::default()),
                }
            }
        })
        .await?;
        Ok(stats)
    }
}
