//! The durable list of approved page origins.

use std::sync::Arc;

use anyhow::Result;
use shared::domain::{Connection, Origin};
use storage::{load_json, store_json, KeyValueStore};
use tokio::sync::Mutex;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{info, warn};

pub const CONNECTIONS_KEY: &str = "connectedDApps";

/// Result of an idempotent connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Created(Connection),
    Existing(Connection),
}

impl Registration {
    pub fn connection(&self) -> &Connection {
        match self {
            Registration::Created(connection) | Registration::Existing(connection) => connection,
        }
    }

    pub fn into_connection(self) -> Connection {
        match self {
            Registration::Created(connection) | Registration::Existing(connection) => connection,
        }
    }
}

pub struct ConnectionRegistry {
    store: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn list(&self) -> Result<Vec<Connection>> {
        Ok(load_json(self.store.as_ref(), CONNECTIONS_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn find(&self, origin: &Origin) -> Result<Option<Connection>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|connection| &connection.origin == origin))
    }

    /// Appends `candidate` unless its origin is already connected, in which case the
    /// stored connection wins and is returned unchanged.
    pub async fn connect(&self, candidate: Connection) -> Result<Registration> {
        let _guard = self.write_lock.lock().await;
        let mut connections = self.list().await?;
        if let Some(existing) = connections
            .iter()
            .find(|connection| connection.origin == candidate.origin)
        {
            info!(origin = %existing.origin, "registry: origin already connected");
            return Ok(Registration::Existing(existing.clone()));
        }

        connections.push(candidate.clone());
        store_json(self.store.as_ref(), CONNECTIONS_KEY, &connections).await?;
        info!(
            origin = %candidate.origin,
            address = %candidate.selected_address,
            "registry: origin connected"
        );
        Ok(Registration::Created(candidate))
    }

    /// Returns whether a connection was removed.
    pub async fn disconnect(&self, origin: &Origin) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut connections = self.list().await?;
        let before = connections.len();
        connections.retain(|connection| &connection.origin != origin);
        if connections.len() == before {
            return Ok(false);
        }

        store_json(self.store.as_ref(), CONNECTIONS_KEY, &connections).await?;
        info!(origin = %origin, "registry: origin disconnected");
        Ok(true)
    }

    /// Snapshots of the registry after every change, from any writer of the shared store.
    pub fn watch(&self) -> impl Stream<Item = Vec<Connection>> + Send + 'static {
        BroadcastStream::new(self.store.subscribe()).filter_map(|change| {
            let change = match change {
                Ok(change) => change,
                Err(err) => {
                    warn!(%err, "registry: change notifications lagged");
                    return None;
                }
            };
            if change.key != CONNECTIONS_KEY {
                return None;
            }
            match change.new_value {
                None => Some(Vec::new()),
                Some(raw) => match serde_json::from_value(raw) {
                    Ok(connections) => Some(connections),
                    Err(err) => {
                        warn!(%err, "registry: ignoring malformed registry snapshot");
                        None
                    }
                },
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
