//! Cluster-wide presence registry.
//!
//! `presence::<acct>::<dev>` maps a connected device to the front-end
//! instance holding its socket.  The stored value is `instance#session` so
//! a reconnect to the same instance still displaces the exact prior session
//! and nothing else.  Records carry a TTL refreshed by the heartbeat task
//! while the socket lives; a crashed front-end's records age out and the
//! expiry keyspace event tells any interested party.
//!
//! Displacement is coordinated over pub/sub: the registering script
//! publishes the prior value on the key's displacement channel, and the
//! instance named in it signals its local session.

use deadpool_redis::redis::{self, Script};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::keyspace::{EventHandler, KeyspaceEvent};
use crate::cache::{CacheCluster, CacheError};

/// Signals delivered to the session owning a presence record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSignal {
    /// A newer session registered for the same (account, device).
    Displaced,
    /// The record expired or was deleted out from under the session.
    Expired,
}

const SET_PRESENT: &str = r#"
local prior = redis.call("GET", KEYS[1])
redis.call("SET", KEYS[1], ARGV[1], "EX", ARGV[2])
if prior and prior ~= ARGV[1] then
    redis.call("PUBLISH", ARGV[3], prior)
    return prior
end
return false
"#;

const CLEAR_PRESENT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("DEL", KEYS[1])
    return 1
end
return 0
"#;

const REFRESH_PRESENT: &str = r#"
local current = redis.call("GET", KEYS[1])
if current == ARGV[1] then
    redis.call("EXPIRE", KEYS[1], ARGV[2])
    return 1
elseif not current then
    redis.call("SET", KEYS[1], ARGV[1], "EX", ARGV[2])
    return 1
end
return 0
"#;

pub fn presence_key(account: Uuid, device: u32) -> String {
    format!("presence::{account}::{device}")
}

pub fn displacement_channel(account: Uuid, device: u32) -> String {
    format!("presence::displaced::{account}::{device}")
}

fn parse_presence_key(key: &str) -> Option<(Uuid, u32)> {
    let inner = key.strip_prefix("presence::")?;
    let (account, device) = inner.split_once("::")?;
    Some((account.parse().ok()?, device.parse().ok()?))
}

fn parse_displacement_channel(channel: &str) -> Option<(Uuid, u32)> {
    let inner = channel.strip_prefix("presence::displaced::")?;
    let (account, device) = inner.split_once("::")?;
    Some((account.parse().ok()?, device.parse().ok()?))
}

struct LocalSession {
    session: Uuid,
    tx: mpsc::UnboundedSender<PresenceSignal>,
}

pub struct PresenceRegistry {
    cache: Arc<CacheCluster>,
    instance_id: String,
    ttl: Duration,
    refresh_interval: Duration,
    local: Mutex<HashMap<(Uuid, u32), LocalSession>>,
    set_present: Script,
    clear_present: Script,
    refresh_present: Script,
}

impl PresenceRegistry {
    pub fn new(
        cache: Arc<CacheCluster>,
        instance_id: String,
        ttl: Duration,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            cache,
            instance_id,
            ttl,
            refresh_interval,
            local: Mutex::new(HashMap::new()),
            set_present: Script::new(SET_PRESENT),
            clear_present: Script::new(CLEAR_PRESENT),
            refresh_present: Script::new(REFRESH_PRESENT),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn value_for(&self, session: Uuid) -> String {
        format!("{}#{}", self.instance_id, session)
    }

    /// Register presence for a locally-held socket.
    ///
    /// A prior session on this process is displaced synchronously; a prior
    /// session elsewhere learns through the displacement channel publish
    /// performed by the script.
    pub async fn set_present(
        &self,
        account: Uuid,
        device: u32,
        session: Uuid,
        signals: mpsc::UnboundedSender<PresenceSignal>,
    ) -> Result<(), CacheError> {
        let previous = self
            .local
            .lock()
            .expect("presence lock poisoned")
            .insert((account, device), LocalSession { session, tx: signals });
        if let Some(previous) = previous {
            let _ = previous.tx.send(PresenceSignal::Displaced);
        }

        let mut invocation = self.set_present.prepare_invoke();
        invocation
            .key(presence_key(account, device))
            .arg(self.value_for(session))
            .arg(self.ttl.as_secs().max(1))
            .arg(displacement_channel(account, device));
        let displaced: Option<String> = self.cache.run_script(&invocation).await?;
        if let Some(prior) = displaced {
            debug!(%account, device, prior = %prior, "presence displaced prior holder");
        }
        Ok(())
    }

    /// Which instance currently holds the socket, if any.
    pub async fn holder(&self, account: Uuid, device: u32) -> Result<Option<String>, CacheError> {
        let value: Option<String> = self
            .cache
            .run(redis::cmd("GET").arg(presence_key(account, device)))
            .await?;
        Ok(value.map(|v| v.split('#').next().unwrap_or_default().to_owned()))
    }

    pub async fn is_present_locally(
        &self,
        account: Uuid,
        device: u32,
    ) -> Result<bool, CacheError> {
        Ok(self
            .holder(account, device)
            .await?
            .is_some_and(|instance| instance == self.instance_id))
    }

    /// Clear presence, but only when this session still owns the record.
    pub async fn clear_presence(
        &self,
        account: Uuid,
        device: u32,
        session: Uuid,
    ) -> Result<(), CacheError> {
        {
            let mut local = self.local.lock().expect("presence lock poisoned");
            if local
                .get(&(account, device))
                .is_some_and(|s| s.session == session)
            {
                local.remove(&(account, device));
            }
        }
        let mut invocation = self.clear_present.prepare_invoke();
        invocation
            .key(presence_key(account, device))
            .arg(self.value_for(session));
        self.cache.run_script::<i64>(&invocation).await?;
        Ok(())
    }

    /// Handler for `presence::displaced::*` channels.
    pub fn displacement_handler(self: &Arc<Self>) -> EventHandler {
        let registry = Arc::clone(self);
        Arc::new(move |event: KeyspaceEvent| {
            let Some((account, device)) = parse_displacement_channel(&event.channel) else {
                return;
            };
            // Payload is the displaced value: instance#session.
            let Some((instance, session)) = event.payload.split_once('#') else {
                return;
            };
            if instance != registry.instance_id {
                return;
            }
            let Ok(session) = session.parse::<Uuid>() else {
                return;
            };
            registry.signal_local(account, device, session, PresenceSignal::Displaced);
        })
    }

    /// Handler for `__keyevent@0__:expired` / `__keyevent@0__:del`; the
    /// payload is the key that went away.
    pub fn expiry_handler(self: &Arc<Self>) -> EventHandler {
        let registry = Arc::clone(self);
        Arc::new(move |event: KeyspaceEvent| {
            let Some((account, device)) = parse_presence_key(&event.payload) else {
                return;
            };
            let session = {
                let local = registry.local.lock().expect("presence lock poisoned");
                local.get(&(account, device)).map(|s| s.session)
            };
            if let Some(session) = session {
                registry.signal_local(account, device, session, PresenceSignal::Expired);
            }
        })
    }

    fn signal_local(&self, account: Uuid, device: u32, session: Uuid, signal: PresenceSignal) {
        let mut local = self.local.lock().expect("presence lock poisoned");
        let matches = local
            .get(&(account, device))
            .is_some_and(|s| s.session == session);
        if !matches {
            return;
        }
        if signal == PresenceSignal::Displaced {
            let removed = local.remove(&(account, device));
            if let Some(removed) = removed {
                let _ = removed.tx.send(signal);
            }
        } else if let Some(holder) = local.get(&(account, device)) {
            let _ = holder.tx.send(signal);
        }
    }

    /// Periodic TTL refresh for every locally-held record.  A record another
    /// instance took over is not stolen back; its session gets displaced.
    pub fn spawn_heartbeat(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                self.refresh_all().await;
            }
        })
    }

    async fn refresh_all(&self) {
        let sessions: Vec<((Uuid, u32), Uuid)> = {
            let local = self.local.lock().expect("presence lock poisoned");
            local
                .iter()
                .map(|(key, session)| (*key, session.session))
                .collect()
        };
        for ((account, device), session) in sessions {
            let mut invocation = self.refresh_present.prepare_invoke();
            invocation
                .key(presence_key(account, device))
                .arg(self.value_for(session))
                .arg(self.ttl.as_secs().max(1));
            match self.cache.run_script::<i64>(&invocation).await {
                Ok(1) => {}
                Ok(_) => {
                    self.signal_local(account, device, session, PresenceSignal::Displaced);
                }
                Err(e) => {
                    warn!(%account, device, error = %e, "presence refresh failed");
                }
            }
        }
    }

    #[cfg(test)]
    fn register_local(
        &self,
        account: Uuid,
        device: u32,
        session: Uuid,
    ) -> mpsc::UnboundedReceiver<PresenceSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self
            .local
            .lock()
            .expect("presence lock poisoned")
            .insert((account, device), LocalSession { session, tx });
        if let Some(previous) = previous {
            let _ = previous.tx.send(PresenceSignal::Displaced);
        }
        rx
    }
}
