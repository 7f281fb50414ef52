//! Callback HTTP server: URL verification, message intake and poll continuations.

use crate::agents::{AgentResolver, StaticAgentResolver};
use crate::cache::{BeginOutcome, ConversationKey, StreamMessageCache};
use crate::channels::{InboundContent, InboundMessage};
use crate::config::{self, Config};
use crate::crypto::{CryptoEnvelope, CryptoError};
use crate::dedup::DedupGuard;
use crate::gateway::protocol::{
    welcome_card, CallbackBody, CallbackQuery, EncryptedReply, StreamReply,
};
use crate::llm::{DifyClient, DifyStreamClient};
use crate::media::{HttpMediaFetcher, MediaFetcher};
use crate::orchestrator::{BackgroundOrchestrator, Turn, TurnSettings};
use crate::parser::ImageSettings;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How long shutdown waits for running turns to write their terminal chunk.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long a redelivery waits for the first delivery's reply to be recorded.
const REPLAY_WAIT: Duration = Duration::from_secs(2);

const EVENT_ENTER_CHAT: &str = "enter_chat";

/// Plain-text acknowledgement for callbacks that need no reply.
const ACK_BODY: &str = "success";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("signature verification failed")]
    Signature,
    #[error("decryption failed: {0}")]
    Decryption(#[source] CryptoError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("encryption failed: {0}")]
    Encryption(#[source] CryptoError),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Signature => StatusCode::FORBIDDEN,
            Self::Decryption(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Encryption(e) => {
                log::error!("gateway: reply encryption failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Shared state for all callback handlers.
#[derive(Clone)]
pub struct GatewayState {
    config: Arc<Config>,
    envelope: Arc<CryptoEnvelope>,
    resolver: Arc<dyn AgentResolver>,
    cache: Arc<StreamMessageCache>,
    dedup: Arc<DedupGuard>,
    orchestrator: BackgroundOrchestrator,
    tracker: TaskTracker,
}

impl GatewayState {
    pub fn new(
        config: Config,
        envelope: CryptoEnvelope,
        resolver: Arc<dyn AgentResolver>,
        upstream: Arc<dyn DifyStreamClient>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Self {
        let envelope = Arc::new(envelope);
        let cache = Arc::new(StreamMessageCache::new(config.stream.cache_ttl()));
        let dedup = Arc::new(DedupGuard::new(config.stream.dedup_ttl()));
        let orchestrator = BackgroundOrchestrator::new(
            Arc::clone(&cache),
            upstream,
            fetcher,
            Arc::clone(&envelope),
            ImageSettings::from_config(&config),
            TurnSettings::from_config(&config),
        );
        Self {
            config: Arc::new(config),
            envelope,
            resolver,
            cache,
            dedup,
            orchestrator,
            tracker: TaskTracker::new(),
        }
    }

    /// Build production collaborators from config. Fails when platform credentials are missing or invalid.
    pub fn from_config(config: Config) -> Result<Self> {
        let token = config::resolve_wecom_token(&config)
            .context("callback token not configured (set wecom.token or WECOM_TOKEN)")?;
        let aes_key = config::resolve_encoding_aes_key(&config).context(
            "encoding aes key not configured (set wecom.encodingAesKey or WECOM_ENCODING_AES_KEY)",
        )?;
        let receive_id = config::resolve_receive_id(&config);
        let envelope = CryptoEnvelope::new(&token, &aes_key, &receive_id)
            .context("invalid encoding aes key")?;
        let resolver = StaticAgentResolver::from_config(&config);
        if resolver.is_empty() {
            log::warn!("no bots mapped and no fallback agent; every message will get the unknown-agent reply");
        } else {
            log::info!("{} bot mapping(s) loaded", resolver.len());
        }
        let fetcher = HttpMediaFetcher::new(&config.media, config.stream.max_image_bytes);
        Ok(Self::new(
            config,
            envelope,
            Arc::new(resolver),
            Arc::new(DifyClient::new()),
            Arc::new(fetcher),
        ))
    }

    pub fn cache(&self) -> &Arc<StreamMessageCache> {
        &self.cache
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// One eviction pass over the stream cache and the dedup records.
    pub fn sweep(&self) -> (usize, usize) {
        (self.cache.sweep(), self.dedup.sweep())
    }

    fn seal(&self, plaintext: &str, query: &CallbackQuery) -> Result<String, GatewayError> {
        let reply = EncryptedReply::seal(&self.envelope, plaintext, &query.timestamp, &query.nonce)
            .map_err(GatewayError::Encryption)?;
        Ok(serde_json::to_string(&reply).unwrap_or_default())
    }

    fn check_signature(&self, query: &CallbackQuery, ciphertext: &str) -> Result<(), GatewayError> {
        let signature = query.msg_signature.as_deref().unwrap_or("");
        if self
            .envelope
            .verify(&query.timestamp, &query.nonce, ciphertext, signature)
        {
            Ok(())
        } else {
            Err(GatewayError::Signature)
        }
    }

    /// Plaintext reply for a message seen for the first time; None means plain acknowledgement.
    fn reply_for(&self, msg: &InboundMessage) -> Option<String> {
        match &msg.content {
            InboundContent::Stream { id, cursor } => Some(self.poll(&msg.conversation_key(), id, *cursor)),
            InboundContent::Event { event_type } if event_type == EVENT_ENTER_CHAT => {
                let name = self
                    .resolver
                    .resolve(&msg.aibotid)
                    .and_then(|a| a.name)
                    .unwrap_or_else(|| "AI助手".to_string());
                log::info!("gateway: {} entered chat with bot {}", msg.sender_id, msg.aibotid);
                Some(welcome_card(&name))
            }
            InboundContent::Event { event_type } => {
                log::debug!("gateway: ignoring event {}", event_type);
                None
            }
            InboundContent::Unsupported { msgtype } => {
                log::warn!("gateway: unsupported msgtype {}", msgtype);
                None
            }
            InboundContent::Text { .. } | InboundContent::Image { .. } | InboundContent::Mixed { .. } => {
                self.start_turn(msg)
            }
        }
    }

    /// Start a turn for a user message, or attach to the one already streaming for its conversation.
    fn start_turn(&self, msg: &InboundMessage) -> Option<String> {
        let Some(agent) = self.resolver.resolve(&msg.aibotid) else {
            log::warn!("gateway: no agent for aibotid={} msgid={}", msg.aibotid, msg.msgid);
            let id = uuid::Uuid::new_v4().simple().to_string();
            return Some(StreamReply::text(&id, &self.config.stream.unknown_agent_text, true, 0).to_json());
        };
        let (query, image_urls) = msg.query()?;
        let key = msg.conversation_key();
        match self.cache.begin(&key, &self.config.stream.placeholder_text) {
            BeginOutcome::Started(ticket) => {
                let stream_id = ticket.stream_id.clone();
                log::info!(
                    "gateway: new turn for {} msgid={} stream_id={} images={}",
                    key,
                    msg.msgid,
                    stream_id,
                    image_urls.len()
                );
                self.orchestrator.spawn(
                    &self.tracker,
                    Turn {
                        key,
                        agent,
                        query,
                        user: msg.sender_id.clone(),
                        image_urls,
                        ticket,
                    },
                );
                Some(StreamReply::text(&stream_id, &self.config.stream.placeholder_text, false, 0).to_json())
            }
            BeginOutcome::Attached { stream_id } => {
                log::info!(
                    "gateway: msgid={} attached to running stream {} for {}",
                    msg.msgid,
                    stream_id,
                    key
                );
                Some(self.poll(&key, &stream_id, 0))
            }
        }
    }

    /// Continuation reply for `stream_id`; the expired marker when its entry is gone.
    fn poll(&self, key: &ConversationKey, stream_id: &str, cursor: u64) -> String {
        match self.cache.read_stream(key, stream_id, cursor) {
            Ok(snapshot) => StreamReply::from_snapshot(&snapshot, cursor).to_json(),
            Err(_) => {
                log::debug!("gateway: poll for expired stream {} of {}", stream_id, key);
                StreamReply::text(stream_id, &self.config.stream.expired_text, true, cursor).to_json()
            }
        }
    }

    /// Reply for a redelivered msgid: the body recorded for the first delivery, or the
    /// conversation's current poll reply when none is recorded within [`REPLAY_WAIT`].
    async fn replay(&self, msg: &InboundMessage, query: &CallbackQuery) -> Result<Response, GatewayError> {
        if let Some(body) = self.dedup.wait_response(&msg.msgid, REPLAY_WAIT).await {
            log::info!("gateway: replaying recorded reply for msgid={}", msg.msgid);
            return Ok(body_response(body));
        }
        log::info!("gateway: duplicate msgid={} without a recorded reply, serving poll", msg.msgid);
        let key = msg.conversation_key();
        let stream_id = match &msg.content {
            InboundContent::Stream { id, .. } => id.clone(),
            _ => self.cache.stream_id(&key).unwrap_or_default(),
        };
        let plaintext = self.poll(&key, &stream_id, 0);
        Ok(body_response(self.seal(&plaintext, query)?))
    }
}

/// Wrap a recorded reply body; the acknowledgement is plain text, sealed replies are JSON.
fn body_response(body: String) -> Response {
    if body == ACK_BODY {
        ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
    } else {
        ([(header::CONTENT_TYPE, "application/json")], body).into_response()
    }
}

/// GET callback: URL verification. Echoes the decrypted challenge, unencrypted.
async fn verify_url(
    State(state): State<GatewayState>,
    Query(query): Query<CallbackQuery>,
) -> Result<String, GatewayError> {
    let echostr = query
        .echostr
        .as_deref()
        .ok_or_else(|| GatewayError::BadRequest("missing echostr".to_string()))?;
    state.check_signature(&query, echostr)?;
    let plain = state.envelope.decrypt(echostr).map_err(GatewayError::Decryption)?;
    log::info!("gateway: url verification succeeded");
    Ok(plain)
}

/// POST callback: verify, decrypt, dedup, then answer with an encrypted reply.
async fn receive(
    State(state): State<GatewayState>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let body: CallbackBody = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::BadRequest(format!("invalid body: {}", e)))?;
    state.check_signature(&query, &body.encrypt)?;
    let plaintext = state
        .envelope
        .decrypt(&body.encrypt)
        .map_err(GatewayError::Decryption)?;
    let msg = match InboundMessage::parse(&plaintext) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("gateway: unparsable callback payload: {}", e);
            return Ok(body_response(ACK_BODY.to_string()));
        }
    };
    if state.dedup.seen(&msg.msgid) {
        return state.replay(&msg, &query).await;
    }
    let body = match state.reply_for(&msg) {
        Some(plain) => state.seal(&plain, &query)?,
        None => ACK_BODY.to_string(),
    };
    state.dedup.record_response(&msg.msgid, &body);
    Ok(body_response(body))
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
        "conversations": state.cache.len(),
    }))
}

/// Routes: `GET /`, and GET/POST on the callback path with an optional `/{botid}` suffix.
pub fn router(state: GatewayState) -> Router {
    let path = normalize_path(&state.config.gateway.callback_path);
    let with_bot = format!("{}/:botid", path.trim_end_matches('/'));
    Router::new()
        .route("/", get(health_http))
        .route(&path, get(verify_url).post(receive))
        .route(&with_bot, get(verify_url).post(receive))
        .with_state(state)
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/callback".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Periodic eviction until `shutdown` fires.
async fn sweep_loop(state: GatewayState, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let (entries, records) = state.sweep();
                if entries > 0 || records > 0 {
                    log::debug!("sweep: evicted {} conversation(s), {} dedup record(s)", entries, records);
                }
            }
        }
    }
}

/// Run the callback server until SIGINT/SIGTERM.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    log::info!("using config {}", config_path.display());
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        log::warn!("gateway binding to non-loopback address {}; callbacks are authenticated by signature only", bind);
    }
    let port = config.gateway.port;
    let sweep_interval = config.stream.sweep_interval();
    let state = GatewayState::from_config(config)?;

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(sweep_loop(state.clone(), sweep_interval, shutdown.clone()));

    let app = router(state.clone());
    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;

    shutdown.cancel();
    let _ = sweeper.await;
    state.cache.cancel_all();
    state.tracker.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, state.tracker.wait()).await.is_err() {
        log::warn!("{} turn(s) still running at shutdown", state.tracker.len());
    }
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining requests and cancelling running turns");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_callback_paths() {
        assert_eq!(normalize_path("/wecom/callback/"), "/wecom/callback");
        assert_eq!(normalize_path("hook"), "/hook");
        assert_eq!(normalize_path(""), "/callback");
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(GatewayError::Signature.into_response().status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::Decryption(CryptoError::Padding).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::BadRequest("x".to_string()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
