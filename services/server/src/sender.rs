//! Send policy: live socket, remote wake, or store-and-notify.
//!
//! `online` submissions are ephemeral — written through a live socket or
//! dropped, never enqueued.  Durable submissions always enqueue first; the
//! insert script's publish on the queue channel wakes whichever instance
//! holds the socket, and only a fully absent device falls back to a
//! platform push.

use courier_protocol::Envelope;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::cache::CacheError;
use crate::messages::{MessagesError, MessagesManager};
use crate::presence::PresenceRegistry;
use crate::push::scheduler::push_target;
use crate::push::PushScheduler;
use crate::repo;
use crate::state::SessionRegistry;

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Messages(#[from] MessagesError),

    #[error("device lookup: {0}")]
    Table(#[from] sqlx::Error),
}

/// What the policy decided to do with one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    DeliveredLocally,
    WokeRemote,
    DroppedEphemeral,
    StoredAndNotified,
    StoredAndPushScheduled,
    Stored,
}

pub struct MessageSender {
    pool: PgPool,
    messages: Arc<MessagesManager>,
    presence: Arc<PresenceRegistry>,
    push: Arc<PushScheduler>,
    sessions: Arc<SessionRegistry>,
}

impl MessageSender {
    pub fn new(
        pool: PgPool,
        messages: Arc<MessagesManager>,
        presence: Arc<PresenceRegistry>,
        push: Arc<PushScheduler>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            pool,
            messages,
            presence,
            push,
            sessions,
        }
    }

    /// Accept one envelope for (account, device).
    ///
    /// Assigns the GUID and server timestamp exactly once — callers hand in
    /// an envelope with a nil GUID and zero server timestamp.
    pub async fn send(&self, mut envelope: Envelope, online: bool) -> Result<Dispatch, SendError> {
        finalize(&mut envelope);
        let account = envelope.destination_uuid;
        let device = envelope.destination_device;

        if online {
            // Ephemeral path: never enqueue.
            if self.sessions.deliver(account, device, envelope.clone()) {
                return Ok(Dispatch::DeliveredLocally);
            }
            let holder = self.presence.holder(account, device).await?;
            return match holder {
                Some(_) => {
                    self.messages.queues().publish_ephemeral(&envelope).await?;
                    Ok(Dispatch::WokeRemote)
                }
                None => {
                    debug!(%account, device, "dropping ephemeral envelope for absent device");
                    Ok(Dispatch::DroppedEphemeral)
                }
            };
        }

        // Durable path: enqueue first.  The insert script publishes the
        // new-message event, which reaches the socket holder wherever it is.
        self.messages.insert(&envelope).await?;

        if self.presence.holder(account, device).await?.is_some() {
            return Ok(Dispatch::StoredAndNotified);
        }

        match repo::accounts::get_device(&self.pool, account, device).await? {
            Some(record) if push_target(&record).is_some() => {
                let now = chrono::Utc::now().timestamp_millis();
                self.push.schedule(account, device, now).await?;
                Ok(Dispatch::StoredAndPushScheduled)
            }
            _ => Ok(Dispatch::Stored),
        }
    }
}

/// Assign GUID and server timestamp if the envelope does not carry them yet.
/// Both are assigned at most once per envelope lifetime.
pub fn finalize(envelope: &mut Envelope) {
    if envelope.guid.is_nil() {
        envelope.guid = Uuid::new_v4();
    }
    if envelope.server_timestamp == 0 {
        envelope.server_timestamp = chrono::Utc::now().timestamp_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::EnvelopeKind;

    fn blank_envelope() -> Envelope {
        Envelope {
            guid: Uuid::nil(),
            server_timestamp: 0,
            client_timestamp: 77,
            kind: EnvelopeKind::Ciphertext,
            source_uuid: None,
            source_device: None,
            destination_uuid: Uuid::new_v4(),
            destination_device: 1,
            content: vec![9],
        }
    }

    #[test]
    fn finalize_assigns_guid_and_timestamp_once() {
        let mut envelope = blank_envelope();
        finalize(&mut envelope);
        assert!(!envelope.guid.is_nil());
        assert!(envelope.server_timestamp > 0);

        let guid = envelope.guid;
        let ts = envelope.server_timestamp;
        finalize(&mut envelope);
        assert_eq!(envelope.guid, guid);
        assert_eq!(envelope.server_timestamp, ts);
    }
}
