//! Reference-counted broker connections.
//!
//! Several channels to the same broker address share one connection. The
//! pool hands out [`PooledConnection`] handles; each handle holds one
//! reference and the connection closes when the last one is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use corelib::Result;

use crate::broker::{BrokerConnection, BrokerConnector};

struct PoolEntry {
    connection: Arc<dyn BrokerConnection>,
    ref_count: usize,
}

struct PoolShared {
    connector: Arc<dyn BrokerConnector>,
    entries: Mutex<HashMap<String, PoolEntry>>,
}

impl PoolShared {
    fn release(&self, address: &str, connection: &Arc<dyn BrokerConnection>) {
        let to_close = {
            let mut entries = self.entries.lock();
            match entries.get_mut(address) {
                Some(entry) if Arc::ptr_eq(&entry.connection, connection) => {
                    entry.ref_count -= 1;
                    if entry.ref_count == 0 {
                        entries.remove(address).map(|e| e.connection)
                    } else {
                        None
                    }
                }
                // replaced after it was found closed; this handle was its last user
                _ => Some(Arc::clone(connection)),
            }
        };
        if let Some(connection) = to_close {
            debug!(address, "Closing pooled connection");
            connection.close();
        }
    }
}

/// Pool of broker connections keyed by address.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                connector,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Borrow a connection to `address`, opening one if none is pooled.
    pub fn acquire(&self, address: &str) -> Result<PooledConnection> {
        let mut entries = self.shared.entries.lock();
        if let Some(entry) = entries.get_mut(address) {
            if !entry.connection.is_closed() {
                entry.ref_count += 1;
                return Ok(PooledConnection::new(address, Arc::clone(&entry.connection), &self.shared));
            }
            entries.remove(address);
        }
        let connection = self.shared.connector.connect(address)?;
        entries.insert(
            address.to_string(),
            PoolEntry {
                connection: Arc::clone(&connection),
                ref_count: 1,
            },
        );
        debug!(address, "Opened pooled connection");
        Ok(PooledConnection::new(address, connection, &self.shared))
    }

    /// Number of live handles for `address`.
    pub fn ref_count(&self, address: &str) -> usize {
        self.shared.entries.lock().get(address).map_or(0, |e| e.ref_count)
    }
}

/// Borrowed connection handle. Released exactly once, either explicitly or
/// on drop.
pub struct PooledConnection {
    address: String,
    connection: Arc<dyn BrokerConnection>,
    pool: Arc<PoolShared>,
    released: AtomicBool,
}

impl PooledConnection {
    fn new(address: &str, connection: Arc<dyn BrokerConnection>, pool: &Arc<PoolShared>) -> Self {
        Self {
            address: address.to_string(),
            connection,
            pool: Arc::clone(pool),
            released: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    /// Give the reference back. Later calls are no-ops.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.pool.release(&self.address, &self.connection);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBrokerRegistry;

    fn pool() -> (MemoryBrokerRegistry, ConnectionPool) {
        let registry = MemoryBrokerRegistry::new();
        registry.create_broker("mem://a");
        let pool = ConnectionPool::new(Arc::new(registry.clone()));
        (registry, pool)
    }

    #[test]
    fn test_handles_share_connection() {
        let (_registry, pool) = pool();
        let first = pool.acquire("mem://a").unwrap();
        let second = pool.acquire("mem://a").unwrap();
        assert!(Arc::ptr_eq(first.connection(), second.connection()));
        assert_eq!(pool.ref_count("mem://a"), 2);

        first.release();
        first.release();
        assert_eq!(pool.ref_count("mem://a"), 1);
        assert!(!second.connection().is_closed());

        let connection = Arc::clone(second.connection());
        drop(second);
        assert_eq!(pool.ref_count("mem://a"), 0);
        assert!(connection.is_closed());
    }

    #[test]
    fn test_closed_connection_is_replaced() {
        let (_registry, pool) = pool();
        let first = pool.acquire("mem://a").unwrap();
        first.connection().close();
        let second = pool.acquire("mem://a").unwrap();
        assert!(!Arc::ptr_eq(first.connection(), second.connection()));
        assert_eq!(pool.ref_count("mem://a"), 1);
        drop(first);
        assert_eq!(pool.ref_count("mem://a"), 1);
        assert!(!second.connection().is_closed());
    }

    #[test]
    fn test_refused_connection() {
        let (_registry, pool) = pool();
        assert!(pool.acquire("mem://nowhere").is_err());
        assert_eq!(pool.ref_count("mem://nowhere"), 0);
    }
}
