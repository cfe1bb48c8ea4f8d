//! Keyed connection pool: `(host, port) -> Connection`, lazy construction
//! on first use, no cross-pool sharing. Direct `Connection::with_transport`
//! construction bypasses this registry entirely (spec §4.7), which is what
//! the test suite uses to splice in an in-memory transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::catalog::RegisterCatalog;
use crate::config::Config;
use crate::connection::{ConnState, Connection};

/// Process-wide registry of live connections keyed by `(host, port)`.
pub struct Pool {
    config: Config,
    catalog: Arc<dyn RegisterCatalog>,
    connections: Mutex<HashMap<(String, u16), Arc<Connection>>>,
}

impl Pool {
    pub fn new(config: Config, catalog: Arc<dyn RegisterCatalog>) -> Self {
        Self {
            config,
            catalog,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Return the existing connection for `(host, port)` if it's still
    /// usable, otherwise lazily construct and register a fresh one. The
    /// new connection is not dialed yet; dialing happens on first job.
    pub async fn get(
        &self,
        host: &str,
        port: u16,
        cache_ttl: Duration,
        cache_max: usize,
    ) -> Arc<Connection> {
        let key = (host.to_string(), port);
        let mut connections = self.connections.lock().await;

        if let Some(existing) = connections.get(&key) {
            if existing.state().await != ConnState::Closed {
                return Arc::clone(existing);
            }
        }

        let conn = Connection::new(
            host,
            port,
            self.config.clone(),
            Arc::clone(&self.catalog),
            cache_ttl,
            cache_max,
        );
        conn.spawn_idle_watcher();
        connections.insert(key, Arc::clone(&conn));
        conn
    }

    /// Close and remove the connection for `(host, port)`, if any is
    /// registered.
    pub async fn close(&self, host: &str, port: u16) {
        let key = (host.to_string(), port);
        let removed = self.connections.lock().await.remove(&key);
        if let Some(conn) = removed {
            conn.close().await;
        }
    }

    /// Close every pooled connection and empty the registry.
    pub async fn shutdown(&self) {
        let mut connections = self.connections.lock().await;
        for (_, conn) in connections.drain() {
            conn.close().await;
        }
    }
}
