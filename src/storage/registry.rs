//! Per-host cache of remote storage connections
//!
//! The registry map is only locked to look up or insert a host's slot; the
//! connection itself is established outside that lock, through the slot's
//! `OnceCell`, so a slow or unreachable host never blocks other hosts.
//! Concurrent first use of the same host waits on the one in-progress
//! connect instead of opening a second connection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{MutexGuard, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::storage::backoff::Backoff;
use crate::storage::remote::RemoteHost;
use crate::storage::StorageError;

/// An established remote storage channel
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Copy the local directory `local_dir` into `remote_parent` on the host
    async fn upload(&self, local_dir: &Path, remote_parent: &str) -> Result<(), StorageError>;

    async fn close(&self) -> Result<(), StorageError>;
}

/// Establishes connections to remote hosts
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, host: &RemoteHost) -> Result<Box<dyn RemoteConnection>, StorageError>;
}

/// One live connection plus the lock serializing its use
pub struct ConnectionEntry {
    host: RemoteHost,
    conn: tokio::sync::Mutex<Box<dyn RemoteConnection>>,
}

impl ConnectionEntry {
    pub fn host(&self) -> &RemoteHost {
        &self.host
    }

    /// Take exclusive use of the connection
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn RemoteConnection>> {
        self.conn.lock().await
    }
}

type Slot = Arc<OnceCell<Arc<ConnectionEntry>>>;

pub struct ConnectionRegistry {
    connector: Arc<dyn RemoteConnector>,
    backoff: Backoff,
    entries: Mutex<HashMap<String, Slot>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn RemoteConnector>, backoff: Backoff) -> Self {
        Self {
            connector,
            backoff,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The connection for `host`, connecting first if there is none yet
    ///
    /// Connection failures are retried with backoff for as long as the
    /// pipeline runs; only cancellation makes this return an error.
    pub async fn acquire(
        &self,
        host: &RemoteHost,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConnectionEntry>, StorageError> {
        let slot = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.entry(host.key()).or_default().clone()
        };

        let entry = slot.get_or_try_init(|| async {
            let what = format!("Connecting to {}", host.key());
            let conn = self.backoff
                .retry_forever(&what, cancel, || self.connector.connect(host))
                .await?;
            info!("Created new connection to {}", host.key());
            Ok::<_, StorageError>(Arc::new(ConnectionEntry {
                host: host.clone(),
                conn: tokio::sync::Mutex::new(conn),
            }))
        }).await?;

        Ok(entry.clone())
    }

    /// Number of hosts with an established connection
    pub fn connected_hosts(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|slot| slot.initialized()).count()
    }

    /// Close every established connection
    pub async fn close_all(&self) {
        let slots: Vec<Slot> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.drain().map(|(_, slot)| slot).collect()
        };

        for slot in slots {
            if let Some(entry) = slot.get() {
                if let Err(e) = entry.lock().await.close().await {
                    warn!("Failed to close connection to {}: {}", entry.host.key(), e);
                }
            }
        }
    }
}
