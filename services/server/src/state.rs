//! Shared application state.
//!
//! Everything the handlers need rides in [`AppState`]; there are no process
//! globals.  The local session registry is the in-process half of the
//! presence story: it maps (account, device) to the mpsc handle a live
//! socket drains, so the sender can write ephemeral envelopes straight into
//! a session on this instance.

use courier_protocol::Envelope;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::CacheCluster;
use crate::config::ServerConfig;
use crate::limits::RateLimiter;
use crate::messages::MessagesManager;
use crate::presence::PresenceRegistry;
use crate::push::PushScheduler;
use crate::sender::MessageSender;

struct LocalSession {
    session: Uuid,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Live sockets held by this instance, keyed by (account, device).
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<(Uuid, u32), LocalSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        account: Uuid,
        device: u32,
        session: Uuid,
        tx: mpsc::UnboundedSender<Envelope>,
    ) {
        self.inner
            .lock()
            .expect("session registry lock poisoned")
            .insert((account, device), LocalSession { session, tx });
    }

    /// Remove the registration, but only if it still belongs to `session`.
    pub fn unregister(&self, account: Uuid, device: u32, session: Uuid) {
        let mut inner = self.inner.lock().expect("session registry lock poisoned");
        if inner
            .get(&(account, device))
            .is_some_and(|s| s.session == session)
        {
            inner.remove(&(account, device));
        }
    }

    /// Hand an envelope straight to a local socket; `false` when no session
    /// is attached here (or its channel already closed).
    pub fn deliver(&self, account: Uuid, device: u32, envelope: Envelope) -> bool {
        let inner = self.inner.lock().expect("session registry lock poisoned");
        match inner.get(&(account, device)) {
            Some(session) => session.tx.send(envelope).is_ok(),
            None => false,
        }
    }

    pub fn is_attached(&self, account: Uuid, device: u32) -> bool {
        self.inner
            .lock()
            .expect("session registry lock poisoned")
            .contains_key(&(account, device))
    }
}

/// Pipeline counters the components report into.
#[derive(Default)]
pub struct Counters {
    pub displaced_sessions: AtomicU64,
    pub ephemeral_dropped: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub pool: PgPool,
    pub cache: Arc<CacheCluster>,
    pub messages: Arc<MessagesManager>,
    pub presence: Arc<PresenceRegistry>,
    pub push: Arc<PushScheduler>,
    pub sender: Arc<MessageSender>,
    pub sessions: Arc<SessionRegistry>,
    pub limiter: Arc<dyn RateLimiter>,
    pub counters: Arc<Counters>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::EnvelopeKind;

    fn envelope(account: Uuid, device: u32) -> Envelope {
        Envelope {
            guid: Uuid::new_v4(),
            server_timestamp: 1,
            client_timestamp: 1,
            kind: EnvelopeKind::Ciphertext,
            source_uuid: None,
            source_device: None,
            destination_uuid: account,
            destination_device: device,
            content: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn deliver_reaches_registered_session() {
        let registry = SessionRegistry::new();
        let account = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(account, 1, Uuid::new_v4(), tx);

        assert!(registry.deliver(account, 1, envelope(account, 1)));
        assert!(rx.recv().await.is_some());
        assert!(!registry.deliver(account, 2, envelope(account, 2)));
    }

    #[tokio::test]
    async fn unregister_ignores_stale_session_id() {
        let registry = SessionRegistry::new();
        let account = Uuid::new_v4();
        let old_session = Uuid::new_v4();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        registry.register(account, 1, old_session, old_tx);

        let new_session = Uuid::new_v4();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        registry.register(account, 1, new_session, new_tx);

        // The displaced session's teardown must not evict its successor.
        registry.unregister(account, 1, old_session);
        assert!(registry.deliver(account, 1, envelope(account, 1)));
        assert!(new_rx.recv().await.is_some());
    }
}
