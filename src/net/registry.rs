//! Process-wide index of checked-in identities and relay tokens.
//!
//! Lookups take the read lock; check-in, relay registration and teardown take
//! the write lock. A relay is reachable by both of its tokens, and both
//! entries always point at the same relay object.

use crate::net::session::Session;
use crate::relay::Relay;
use crate::types::{IdentityId, RelayToken};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct Inner {
    online: HashMap<IdentityId, Arc<Session>>,
    relays: HashMap<RelayToken, Arc<Relay>>,
}

#[derive(Default)]
pub struct ClientRegistry {
    inner: RwLock<Inner>,
}

#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub online: usize,
    pub relay_tokens: usize,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a checked-in identity to its session. A newer check-in replaces
    /// the previous one; the replaced session is returned for disconnection.
    pub async fn check_in(
        &self,
        identity: IdentityId,
        session: Arc<Session>,
    ) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let replaced = inner.online.insert(identity, session);
        if replaced.is_some() {
            debug!(
                "identity {} checked in again, replacing previous session",
                crate::crypto::fingerprint(&identity)
            );
        }
        replaced
    }

    /// Remove the identity binding, but only if it still points at this
    /// session (a replacement check-in must not be undone by the old
    /// session's cleanup).
    pub async fn uncheck(&self, identity: &IdentityId, session_id: u64) {
        let mut inner = self.inner.write().await;
        if inner
            .online
            .get(identity)
            .is_some_and(|s| s.id == session_id)
        {
            inner.online.remove(identity);
        }
    }

    pub async fn online(&self, identity: &IdentityId) -> Option<Arc<Session>> {
        self.inner.read().await.online.get(identity).cloned()
    }

    pub async fn is_online(&self, identity: &IdentityId) -> bool {
        self.inner.read().await.online.contains_key(identity)
    }

    /// Register a relay under both of its tokens.
    pub async fn register_relay(&self, relay: Arc<Relay>) {
        let mut inner = self.inner.write().await;
        inner.relays.insert(relay.caller_token, relay.clone());
        inner.relays.insert(relay.callee_token, relay);
    }

    pub async fn relay_by_token(&self, token: &RelayToken) -> Option<Arc<Relay>> {
        self.inner.read().await.relays.get(token).cloned()
    }

    /// Remove both token entries of a relay.
    pub async fn remove_relay(&self, relay: &Arc<Relay>) {
        let mut inner = self.inner.write().await;
        inner.relays.remove(&relay.caller_token);
        inner.relays.remove(&relay.callee_token);
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        RegistryStats {
            online: inner.online.len(),
            relay_tokens: inner.relays.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ROLE_CLIENT_CUSTOMER;
    use tokio::sync::mpsc;

    fn session(id: u64) -> Arc<Session> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(Session::new(
            id,
            "127.0.0.1:1".parse().unwrap(),
            ROLE_CLIENT_CUSTOMER,
            tx,
        ))
    }

    #[tokio::test]
    async fn test_check_in_replaces() {
        let registry = ClientRegistry::new();
        let identity = [1u8; 32];

        assert!(registry.check_in(identity, session(1)).await.is_none());
        let replaced = registry.check_in(identity, session(2)).await.unwrap();
        assert_eq!(replaced.id, 1);
        assert_eq!(registry.online(&identity).await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_uncheck_ignores_stale_session() {
        let registry = ClientRegistry::new();
        let identity = [1u8; 32];

        registry.check_in(identity, session(1)).await;
        registry.check_in(identity, session(2)).await;

        // The old session's cleanup must not evict the new binding.
        registry.uncheck(&identity, 1).await;
        assert!(registry.is_online(&identity).await);

        registry.uncheck(&identity, 2).await;
        assert!(!registry.is_online(&identity).await);
    }

    #[tokio::test]
    async fn test_relay_tokens_point_at_same_relay() {
        let registry = ClientRegistry::new();
        let relay = {
            // Construct via the call path helpers is overkill here; tokens
            // are all the registry cares about.
            use crate::relay::Relay;
            Arc::new(Relay::for_tests("chat".into(), [1u8; 32], [2u8; 32]))
        };

        registry.register_relay(relay.clone()).await;
        let a = registry.relay_by_token(&relay.caller_token).await.unwrap();
        let b = registry.relay_by_token(&relay.callee_token).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        registry.remove_relay(&relay).await;
        assert!(registry.relay_by_token(&relay.caller_token).await.is_none());
        assert!(registry.relay_by_token(&relay.callee_token).await.is_none());
        assert_eq!(registry.stats().await.relay_tokens, 0);
    }
}
