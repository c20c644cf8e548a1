use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Per-session cancellation tokens. A run registers a fresh token when it
/// starts; an abort request cancels it without needing a handle to the
/// running future.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for `session_id`. Any previous token for the
    /// same session is cancelled first so a stale handle cannot linger.
    pub async fn create(&self, session_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut tokens = self.tokens.write().await;
        if let Some(old) = tokens.insert(session_id.to_string(), token.clone()) {
            old.cancel();
        }
        token
    }

    /// Fire the token for `session_id`. Returns false when no run is
    /// registered under that session.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let tokens = self.tokens.read().await;
        match tokens.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, session_id: &str) {
        self.tokens.write().await.remove(session_id);
    }

    pub async fn is_registered(&self, session_id: &str) -> bool {
        self.tokens.read().await.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_fires_registered_token() {
        let registry = CancellationRegistry::new();
        let token = registry.create("s1").await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel("s1").await);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_unknown_session_is_noop() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("missing").await);
    }

    #[tokio::test]
    async fn create_replaces_and_cancels_previous_token() {
        let registry = CancellationRegistry::new();
        let first = registry.create("s1").await;
        let second = registry.create("s1").await;
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[tokio::test]
    async fn remove_unregisters_session() {
        let registry = CancellationRegistry::new();
        registry.create("s1").await;
        registry.remove("s1").await;
        assert!(!registry.is_registered("s1").await);
    }
}
