pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod http;
pub mod limits;
pub mod messages;
pub mod persister;
pub mod presence;
pub mod push;
pub mod queue;
pub mod repo;
pub mod sender;
pub mod state;
pub mod submit;
pub mod ws_client;

pub use state::AppState;

use std::sync::Arc;

use axum::routing::{get, put};
use axum::Router;
use deadpool_redis::redis;
use sqlx::PgPool;

use crate::cache::keyspace::KeyspaceListener;
use crate::cache::{CacheCluster, CacheError};
use crate::config::ServerConfig;
use crate::limits::Unlimited;
use crate::messages::MessagesManager;
use crate::persister::MessagePersister;
use crate::presence::PresenceRegistry;
use crate::push::{ApnSender, FcmSender, PushProvider, PushScheduler};
use crate::queue::DeviceQueues;
use crate::sender::MessageSender;
use crate::state::{Counters, SessionRegistry};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/clients", get(ws_client::ws_client_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/v1/messages/", get(http::messages::get_messages))
        .route(
            "/v1/messages/:id",
            put(http::messages::put_messages).delete(http::messages::delete_message),
        )
        .route(
            "/v1/messages/:source/:timestamp",
            axum::routing::delete(http::messages::delete_message_by_sender),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Assemble the full delivery pipeline around an existing Postgres pool.
pub fn build_state(config: ServerConfig, pool: PgPool) -> Result<AppState, CacheError> {
    let config = Arc::new(config);
    let cache = Arc::new(CacheCluster::new(&config.cache)?);
    let queues = Arc::new(DeviceQueues::new(
        Arc::clone(&cache),
        config.messages.remove_scan_cap,
    ));
    let messages = Arc::new(MessagesManager::new(
        pool.clone(),
        Arc::clone(&queues),
        config.messages.retention,
    ));
    let presence = Arc::new(PresenceRegistry::new(
        Arc::clone(&cache),
        config.server.instance_id.clone(),
        config.presence.ttl,
        config.presence.refresh_interval,
    ));

    let http_client = reqwest::Client::new();
    let apn: Option<Arc<dyn PushProvider>> = config
        .push
        .apn
        .clone()
        .map(|cfg| Arc::new(ApnSender::new(http_client.clone(), cfg)) as Arc<dyn PushProvider>);
    let fcm: Option<Arc<dyn PushProvider>> = config
        .push
        .fcm
        .clone()
        .map(|cfg| Arc::new(FcmSender::new(http_client.clone(), cfg)) as Arc<dyn PushProvider>);
    let push = Arc::new(PushScheduler::new(
        Arc::clone(&cache),
        pool.clone(),
        config.push.clone(),
        apn,
        fcm,
    ));

    let sessions = Arc::new(SessionRegistry::new());
    let sender = Arc::new(MessageSender::new(
        pool.clone(),
        Arc::clone(&messages),
        Arc::clone(&presence),
        Arc::clone(&push),
        Arc::clone(&sessions),
    ));

    Ok(AppState {
        config,
        pool,
        cache,
        messages,
        presence,
        push,
        sender,
        sessions,
        limiter: Arc::new(Unlimited),
        counters: Arc::new(Counters::default()),
    })
}

/// Expiry/del keyevent notifications feed the presence registry; queue and
/// displacement events are explicit publishes and need no server config.
pub async fn enable_keyspace_notifications(cache: &CacheCluster) -> Result<(), CacheError> {
    cache
        .run::<()>(
            redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("Egx"),
        )
        .await
}

/// Spawn the long-running pipeline tasks: keyspace listener, presence
/// heartbeat, persister, push pump.
pub fn spawn_background(state: &AppState) -> Result<Vec<tokio::task::JoinHandle<()>>, CacheError> {
    let listener = KeyspaceListener::new()
        .route(
            "__keyspace@0__:user_queue::*",
            state.messages.event_handler(),
        )
        .route(
            "presence::displaced::*",
            state.presence.displacement_handler(),
        )
        .route("__keyevent@0__:expired", state.presence.expiry_handler())
        .route("__keyevent@0__:del", state.presence.expiry_handler());
    let listener_handle = listener.spawn(state.cache.pubsub_client()?);

    let persister = Arc::new(MessagePersister::new(
        Arc::clone(&state.cache),
        Arc::clone(state.messages.queues()),
        state.pool.clone(),
        state.config.persister.clone(),
        state.config.messages.persist_delay,
        state.config.messages.retention,
        state.config.server.instance_id.clone(),
    ));

    Ok(vec![
        listener_handle,
        Arc::clone(&state.presence).spawn_heartbeat(),
        persister.spawn(),
        Arc::clone(&state.push).spawn(),
    ])
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
