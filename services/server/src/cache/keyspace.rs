//! Keyspace notification listener.
//!
//! One dedicated pub/sub connection per process carries every notification
//! the pipeline consumes: queue-event channels published by the queue
//! scripts, displacement channels published by the presence registry, and
//! the server-generated `__keyevent@…` expiry channels.  Routes are fixed at
//! construction; dynamic per-queue interest is handled in-process by the
//! components that own the route handlers.
//!
//! The connection re-subscribes every route after a reconnect, with a
//! doubling backoff capped at 30 seconds.

use deadpool_redis::redis;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A single received notification.
#[derive(Debug, Clone)]
pub struct KeyspaceEvent {
    pub channel: String,
    pub payload: String,
}

pub type EventHandler = Arc<dyn Fn(KeyspaceEvent) + Send + Sync>;

struct Route {
    pattern: String,
    handler: EventHandler,
}

/// Fixed-route pub/sub listener; build with [`KeyspaceListener::route`],
/// then [`KeyspaceListener::spawn`].
#[derive(Default)]
pub struct KeyspaceListener {
    routes: Vec<Route>,
}

impl KeyspaceListener {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn route(mut self, pattern: impl Into<String>, handler: EventHandler) -> Self {
        self.routes.push(Route {
            pattern: pattern.into(),
            handler,
        });
        self
    }

    pub fn spawn(self, client: redis::Client) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(client).await })
    }

    async fn run(self, client: redis::Client) {
        let mut delay = Duration::from_secs(1);
        loop {
            match self.session(&client).await {
                Ok(()) => {
                    // Normal stream end: the server closed the connection.
                    delay = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(error = %e, "keyspace listener connection failed");
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(30));
        }
    }

    async fn session(&self, client: &redis::Client) -> Result<(), redis::RedisError> {
        let mut pubsub = client.get_async_pubsub().await?;
        for route in &self.routes {
            pubsub.psubscribe(&route.pattern).await?;
        }
        debug!(routes = self.routes.len(), "keyspace listener subscribed");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_owned();
            let payload: String = msg.get_payload().unwrap_or_default();
            for route in &self.routes {
                if pattern_matches(&route.pattern, &channel) {
                    (route.handler)(KeyspaceEvent {
                        channel: channel.clone(),
                        payload: payload.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Glob match supporting `*` only — the subset of redis pub/sub patterns we
/// subscribe with.
fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let p = pattern.as_bytes();
    let t = channel.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;
    while ti < t.len() {
        if pi < p.len() && p[pi] != b'*' && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_exactly() {
        assert!(pattern_matches("__keyevent@0__:expired", "__keyevent@0__:expired"));
        assert!(!pattern_matches("__keyevent@0__:expired", "__keyevent@0__:del"));
    }

    #[test]
    fn prefix_wildcard_matches_suffix() {
        assert!(pattern_matches(
            "__keyspace@0__:user_queue::*",
            "__keyspace@0__:user_queue::{abc::1}"
        ));
        assert!(!pattern_matches(
            "__keyspace@0__:user_queue::*",
            "__keyspace@0__:presence::abc::1"
        ));
    }

    #[test]
    fn infix_wildcard_requires_both_ends() {
        assert!(pattern_matches("presence::*::displaced", "presence::abc::displaced"));
        assert!(!pattern_matches("presence::*::displaced", "presence::abc::expired"));
    }
}
