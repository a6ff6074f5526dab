use anyhow::{Result, Context};
use redis::{Client, aio::MultiplexedConnection};
use tracing::{debug, warn};
use tokio::sync::Mutex;
use std::sync::Arc;

use crate::cli::config::QueueSettings;
use crate::crawler::task::RawTask;

/// Redis list holding raw tasks waiting for intake
///
/// Producers `LPUSH` JSON-encoded tasks; the crawler pops them from the
/// other end so tasks are processed in submission order.
pub struct TaskQueue {
    /// Name of the Redis list
    queue_name: String,

    /// Seconds a blocking pop waits for a task
    poll_timeout_secs: u64,

    /// Shared connection
    conn: Arc<Mutex<MultiplexedConnection>>,
}

impl TaskQueue {
    /// Connect to the queue described by the settings
    pub async fn connect(config: &QueueSettings) -> Result<Self> {
        let client = Client::open(config.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", config.redis_url))?;

        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            queue_name: config.queue_name.clone(),
            poll_timeout_secs: config.poll_timeout_secs.max(1),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Push a task to the queue
    pub async fn push_task(&self, task: &RawTask) -> Result<()> {
        let task_json = serde_json::to_string(task)
            .context("Failed to serialize task")?;

        let mut conn = self.conn.lock().await;

        redis::cmd("LPUSH")
            .arg(&self.queue_name)
            .arg(&task_json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push task to Redis queue")?;

        debug!("Pushed task to queue: {}", task.url);

        Ok(())
    }

    /// Wait up to the poll timeout for the next task
    ///
    /// Returns `Ok(None)` when the timeout expires with the queue empty.
    /// Entries that do not decode as a task are logged and skipped.
    pub async fn pop_task(&self) -> Result<Option<RawTask>> {
        let mut conn = self.conn.lock().await;

        loop {
            let popped: Option<(String, String)> = redis::cmd("BRPOP")
                .arg(&self.queue_name)
                .arg(self.poll_timeout_secs)
                .query_async(&mut *conn)
                .await
                .context("Failed to pop task from Redis queue")?;

            let Some((_, task_json)) = popped else {
                return Ok(None);
            };

            match serde_json::from_str::<RawTask>(&task_json) {
                Ok(task) => {
                    debug!("Popped task from queue: {}", task.url);
                    return Ok(Some(task));
                }
                Err(e) => warn!("Skipping malformed queue entry: {}", e),
            }
        }
    }

    /// Number of tasks still waiting
    pub async fn pending_count(&self) -> Result<usize> {
        let mut conn = self.conn.lock().await;

        let count: usize = redis::cmd("LLEN")
            .arg(&self.queue_name)
            .query_async(&mut *conn)
            .await
            .context("Failed to get queue length")?;

        Ok(count)
    }
}
