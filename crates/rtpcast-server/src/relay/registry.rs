//! Session registry
//!
//! Holds a non-owning reference to every live viewer session. All mutation
//! and iteration happen under one lock. Eviction of closed sessions never
//! waits on that lock: after a bounded number of attempts it is handed to a
//! janitor task that retries after a fixed delay.

use super::ViewerSession;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Lock attempts made by one eviction pass before deferring
    pub max_clean_attempts: u32,
    /// Delay before a deferred eviction pass runs
    pub retry_backoff: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_clean_attempts: 25,
            retry_backoff: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// The scan ran; `evicted` sessions were removed
    Completed { evicted: usize },
    /// The registry stayed busy; a retry has been scheduled
    Deferred,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Weak<ViewerSession>>>,
    config: RegistryConfig,
    /// Wakes the janitor for a deferred eviction pass
    retry_tx: mpsc::UnboundedSender<()>,
}

impl SessionRegistry {
    /// Create the registry and spawn its janitor task
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            retry_tx,
        });

        tokio::spawn(run_janitor(Arc::downgrade(&registry), retry_rx, config.retry_backoff));

        registry
    }

    pub async fn add(&self, session: &Arc<ViewerSession>) {
        let count = {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(session.id(), Arc::downgrade(session));
            sessions.len()
        };
        tracing::info!("Viewer {} registered ({} connections)", session.id(), count);
    }

    /// Deregister one session; removing an absent session is a no-op
    pub async fn remove(&self, session_id: Uuid) -> bool {
        let removed = self.sessions.lock().await.remove(&session_id).is_some();
        if removed {
            tracing::info!("Viewer {} deregistered", session_id);
        }
        removed
    }

    /// Evict every session whose transport reached the closed state.
    ///
    /// Sessions already dropped by their owning task are evicted as well.
    pub async fn remove_closed(&self) -> EvictionOutcome {
        for attempt in 0..self.config.max_clean_attempts {
            if let Ok(mut sessions) = self.sessions.try_lock() {
                let before = sessions.len();
                sessions.retain(|_, session| {
                    session
                        .upgrade()
                        .is_some_and(|session| !session.is_closed())
                });
                let evicted = before - sessions.len();
                if evicted > 0 {
                    tracing::info!(
                        "Evicted {} closed sessions ({} connections)",
                        evicted,
                        sessions.len()
                    );
                }
                return EvictionOutcome::Completed { evicted };
            }

            tracing::trace!("Registry busy on eviction attempt {}", attempt + 1);
            tokio::task::yield_now().await;
        }

        tracing::warn!(
            "Registry busy after {} attempts, retrying eviction in {:?}",
            self.config.max_clean_attempts,
            self.config.retry_backoff
        );
        let _ = self.retry_tx.send(());
        EvictionOutcome::Deferred
    }

    /// Visit every live session under the registry lock.
    ///
    /// `f` must not call back into the registry.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<ViewerSession>),
    {
        let sessions = self.sessions.lock().await;
        for session in sessions.values().filter_map(Weak::upgrade) {
            f(&session);
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Re-runs eviction passes that were deferred under contention
async fn run_janitor(
    registry: Weak<SessionRegistry>,
    mut retry_rx: mpsc::UnboundedReceiver<()>,
    backoff: Duration,
) {
    while retry_rx.recv().await.is_some() {
        tokio::time::sleep(backoff).await;
        // Requests that piled up during the delay are served by this pass
        while retry_rx.try_recv().is_ok() {}

        let Some(registry) = registry.upgrade() else {
            break;
        };
        let outcome = registry.remove_closed().await;
        tracing::debug!("Deferred eviction pass finished: {:?}", outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::tests::MockTransport;
    use crate::relay::SessionState;
    use tokio::sync::mpsc;

    fn session() -> Arc<ViewerSession> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(ViewerSession::new(
            Uuid::new_v4(),
            Arc::new(MockTransport::default()),
            tx,
        ))
    }

    #[tokio::test]
    async fn test_remove_absent_session_is_noop() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let kept = session();
        registry.add(&kept).await;

        assert!(!registry.remove(Uuid::new_v4()).await);
        assert_eq!(registry.count().await, 1);

        assert!(registry.remove(kept.id()).await);
        assert!(!registry.remove(kept.id()).await);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_adds_then_evict_all_closed() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let sessions: Vec<_> = (0..32).map(|_| session()).collect();

        let handles: Vec<_> = sessions
            .iter()
            .cloned()
            .map(|session| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.add(&session).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.count().await, 32);

        for session in &sessions {
            session.set_state(SessionState::Closed);
        }
        assert_eq!(
            registry.remove_closed().await,
            EvictionOutcome::Completed { evicted: 32 }
        );
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_eviction_uses_transport_state() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let open = session();
        let transport = Arc::new(MockTransport::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let closed = Arc::new(ViewerSession::new(Uuid::new_v4(), transport.clone(), tx));
        registry.add(&open).await;
        registry.add(&closed).await;

        transport.set_state(crate::signaling::TransportState::Closed);

        assert_eq!(
            registry.remove_closed().await,
            EvictionOutcome::Completed { evicted: 1 }
        );
        let mut remaining = Vec::new();
        registry.for_each(|s| remaining.push(s.id())).await;
        assert_eq!(remaining, vec![open.id()]);
    }

    #[tokio::test]
    async fn test_dropped_sessions_are_evicted() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        registry.add(&session()).await;

        assert_eq!(
            registry.remove_closed().await,
            EvictionOutcome::Completed { evicted: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_eviction_is_deferred() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let closed = session();
        registry.add(&closed).await;
        closed.set_state(SessionState::Closed);

        let guard = registry.sessions.lock().await;
        assert_eq!(registry.remove_closed().await, EvictionOutcome::Deferred);
        drop(guard);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.count().await, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.count().await, 0);
    }
}
