//! Live connection tracking.
//!
//! Every accepted socket is served by its own task. The registry keeps an
//! abort handle per task so a restart or stop can tear all of them down at
//! once. Aborting the task drops the sockets it owns, which closes them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// Identifier assigned to a registered connection.
pub type ConnectionId = u64;

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: AtomicU64,
    live: Mutex<HashMap<ConnectionId, AbortHandle>>,
}

/// Set of currently open connections.
///
/// Cheap to clone; clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the task serving a connection and registers it.
    ///
    /// The connection unregisters itself when the task finishes, whether it
    /// completed, failed, or was aborted.
    pub fn register<F>(&self, connection: F) -> ConnectionId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            registry: self.clone(),
            id,
        };

        // The task waits for its entry to exist so it cannot unregister first.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _registration = registration;
            if ready_rx.await.is_ok() {
                connection.await;
            }
        });

        self.inner.live.lock().insert(id, handle.abort_handle());
        if ready_tx.send(()).is_err() || handle.is_finished() {
            // Dropped before it could start, e.g. during runtime shutdown.
            self.unregister(id);
        }
        id
    }

    /// Removes a connection from the set.
    ///
    /// Returns false if it was already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        self.inner.live.lock().remove(&id).is_some()
    }

    /// Forcibly closes every tracked connection and clears the set.
    ///
    /// Returns how many connections were closed.
    pub fn destroy_all(&self) -> usize {
        let drained: Vec<(ConnectionId, AbortHandle)> = self.inner.live.lock().drain().collect();
        for (_, handle) in &drained {
            handle.abort();
        }
        drained.len()
    }

    /// Returns the number of open connections.
    pub fn len(&self) -> usize {
        self.inner.live.lock().len()
    }

    /// Returns true if no connection is open.
    pub fn is_empty(&self) -> bool {
        self.inner.live.lock().is_empty()
    }
}

struct Registration {
    registry: ConnectionRegistry,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_until_empty(registry: &ConnectionRegistry) {
        for _ in 0..100 {
            if registry.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry still holds {} connections", registry.len());
    }

    #[tokio::test]
    async fn finished_connection_unregisters_itself() {
        let registry = ConnectionRegistry::new();
        registry.register(async {});
        wait_until_empty(&registry).await;
    }

    #[tokio::test]
    async fn destroy_all_aborts_pending_connections() {
        let registry = ConnectionRegistry::new();
        let (dropped_tx, dropped_rx) = oneshot::channel::<()>();

        registry.register(async move {
            let _dropped_tx = dropped_tx;
            std::future::pending::<()>().await;
        });
        registry.register(std::future::pending());
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.destroy_all(), 2);
        assert!(registry.is_empty());

        // The sender is dropped with the aborted task.
        let result = tokio::time::timeout(Duration::from_secs(1), dropped_rx).await;
        assert!(matches!(result, Ok(Err(_))));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let id = registry.register(async move {
            let _ = release_rx.await;
        });
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert_eq!(registry.destroy_all(), 0);

        // The task still ends on its own once released.
        release_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let a = registry.register(std::future::pending());
        let b = registry.register(std::future::pending());
        assert_ne!(a, b);
        registry.destroy_all();
    }
}
