//! Background driver for one upstream answer per conversation turn.
//!
//! A turn runs `Init -> Streaming -> Complete | Failed`. Every exit path leaves the cache entry
//! completed with all image slots settled, including cancellation and panics, so a poller is
//! never left waiting on a turn that no longer runs.

use crate::cache::{CacheError, ChunkContent, ConversationKey, StreamMessageCache, TurnTicket};
use crate::config::{AgentConfig, Config};
use crate::crypto::CryptoEnvelope;
use crate::llm::{DifyStreamClient, StreamEvent, StreamRequest, UploadedFile, UpstreamError};
use crate::media::{self, MediaFetcher};
use crate::parser::{ContentParser, ImageSettings};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Init,
    Streaming,
    Complete,
    Failed,
}

#[derive(Debug, thiserror::Error)]
enum TurnError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Timeouts and texts for running turns.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    /// Longest wait for the next upstream event.
    pub idle_timeout: Duration,
    /// Longest a whole turn may stream.
    pub total_timeout: Duration,
    /// Content of the terminal error chunk.
    pub error_text: String,
    /// Query sent when the user sent only images.
    pub image_prompt: String,
}

impl TurnSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: config.stream.upstream_idle_timeout(),
            total_timeout: config.stream.upstream_total_timeout(),
            error_text: config.stream.upstream_error_text.clone(),
            image_prompt: config.stream.image_prompt.clone(),
        }
    }
}

/// One user message that owns a freshly started cache entry.
#[derive(Debug, Clone)]
pub struct Turn {
    pub key: ConversationKey,
    pub agent: AgentConfig,
    pub query: String,
    /// Upstream user identity.
    pub user: String,
    /// Images the user attached; downloaded and uploaded before the answer starts.
    pub image_urls: Vec<String>,
    pub ticket: TurnTicket,
}

/// Settles the entry as failed unless the turn completed normally.
struct TerminalGuard {
    cache: Arc<StreamMessageCache>,
    key: ConversationKey,
    error_text: String,
    fallback_text: String,
    armed: bool,
}

impl TerminalGuard {
    fn complete(mut self) -> Result<bool, CacheError> {
        self.armed = false;
        self.cache.mark_complete(&self.key)
    }

    fn fail(mut self) {
        self.armed = false;
        self.settle_failed();
    }

    fn settle_failed(&self) {
        let res = self
            .cache
            .fill_pending(&self.key, ChunkContent::Text(self.fallback_text.clone()))
            .and_then(|_| self.cache.append(&self.key, ChunkContent::Error(self.error_text.clone())))
            .and_then(|_| self.cache.mark_complete(&self.key));
        match res {
            Ok(_) => {}
            Err(CacheError::UnknownKey) => {
                log::debug!("orchestrator: {} already evicted, nothing to settle", self.key)
            }
            Err(e) => log::warn!("orchestrator: could not settle {}: {}", self.key, e),
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if self.armed {
            self.settle_failed();
        }
    }
}

/// Shared collaborators for all turns; cheap to clone.
#[derive(Clone)]
pub struct BackgroundOrchestrator {
    cache: Arc<StreamMessageCache>,
    upstream: Arc<dyn DifyStreamClient>,
    fetcher: Arc<dyn MediaFetcher>,
    envelope: Arc<CryptoEnvelope>,
    images: Arc<ImageSettings>,
    settings: Arc<TurnSettings>,
}

impl BackgroundOrchestrator {
    pub fn new(
        cache: Arc<StreamMessageCache>,
        upstream: Arc<dyn DifyStreamClient>,
        fetcher: Arc<dyn MediaFetcher>,
        envelope: Arc<CryptoEnvelope>,
        images: ImageSettings,
        settings: TurnSettings,
    ) -> Self {
        Self {
            cache,
            upstream,
            fetcher,
            envelope,
            images: Arc::new(images),
            settings: Arc::new(settings),
        }
    }

    /// Run `turn` detached from the caller, supervised by `tracker`.
    pub fn spawn(&self, tracker: &TaskTracker, turn: Turn) {
        let this = self.clone();
        tracker.spawn(async move {
            let key = turn.key.clone();
            let state = this.run(turn).await;
            log::debug!("orchestrator: turn for {} ended {:?}", key, state);
        });
    }

    /// Drive one turn to a terminal state.
    pub async fn run(&self, turn: Turn) -> TurnState {
        let guard = TerminalGuard {
            cache: Arc::clone(&self.cache),
            key: turn.key.clone(),
            error_text: self.settings.error_text.clone(),
            fallback_text: self.images.fallback_text.clone(),
            armed: true,
        };
        let mut parser = ContentParser::new(
            turn.key.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.envelope),
            Arc::clone(&self.images),
        );
        let cancel = turn.ticket.cancel.clone();
        let mut task_id: Option<String> = None;
        log::info!(
            "orchestrator: starting turn for {} stream_id={} agent={}",
            turn.key,
            turn.ticket.stream_id,
            turn.agent.agent_id
        );

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            res = tokio::time::timeout(
                self.settings.total_timeout,
                self.stream(&turn, &mut parser, &mut task_id),
            ) => Some(res.unwrap_or(Err(TurnError::Upstream(UpstreamError::Timeout)))),
        };

        match outcome {
            Some(Ok(conversation_id)) => {
                if let Some(id) = conversation_id {
                    let _ = self.cache.set_upstream_conversation_id(&turn.key, id);
                }
                let finished = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(None),
                    res = parser.finish() => res.map_err(Some),
                };
                match finished.and_then(|_| guard.complete().map_err(Some)) {
                    Ok(_) => TurnState::Complete,
                    Err(Some(CacheError::UnknownKey)) => {
                        log::debug!("orchestrator: {} evicted before completion", turn.key);
                        TurnState::Failed
                    }
                    Err(e) => {
                        if let Some(e) = e {
                            log::warn!("orchestrator: completing {} failed: {}", turn.key, e);
                        }
                        parser.abort();
                        TurnState::Failed
                    }
                }
            }
            Some(Err(TurnError::Cache(e))) => {
                // entry gone or closed underneath us; nobody will read further output
                log::info!("orchestrator: abandoning {}: {}", turn.key, e);
                parser.abort();
                self.stop_upstream(&turn, task_id.as_deref()).await;
                guard.fail();
                TurnState::Failed
            }
            Some(Err(TurnError::Upstream(e))) => {
                log::warn!("orchestrator: upstream failed for {}: {}", turn.key, e);
                let _ = parser.flush();
                parser.abort();
                if matches!(e, UpstreamError::Timeout) {
                    self.stop_upstream(&turn, task_id.as_deref()).await;
                }
                guard.fail();
                TurnState::Failed
            }
            None => {
                log::info!("orchestrator: turn for {} cancelled", turn.key);
                let _ = parser.flush();
                parser.abort();
                self.stop_upstream(&turn, task_id.as_deref()).await;
                guard.fail();
                TurnState::Failed
            }
        }
    }

    /// Upload attachments, open the stream and feed deltas until it ends.
    async fn stream(
        &self,
        turn: &Turn,
        parser: &mut ContentParser,
        task_id: &mut Option<String>,
    ) -> Result<Option<String>, TurnError> {
        let files = self.upload_images(turn).await;
        let query = if turn.query.trim().is_empty() {
            self.settings.image_prompt.clone()
        } else {
            turn.query.clone()
        };
        let request = StreamRequest {
            query,
            user: turn.user.clone(),
            conversation_id: turn.ticket.upstream_conversation_id.clone(),
            files,
        };
        let mut events = self.upstream.open_stream(&turn.agent, request).await?;
        log::debug!("orchestrator: streaming {}", turn.key);
        loop {
            let next = tokio::time::timeout(self.settings.idle_timeout, events.next())
                .await
                .map_err(|_| UpstreamError::Timeout)?;
            match next {
                None => {
                    log::debug!("orchestrator: upstream closed without end event for {}", turn.key);
                    return Ok(None);
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(StreamEvent::Started { task_id: id })) => *task_id = Some(id),
                Some(Ok(StreamEvent::Delta(text))) => parser.push(&text)?,
                Some(Ok(StreamEvent::Done { conversation_id })) => return Ok(conversation_id),
                Some(Ok(StreamEvent::Error(message))) => {
                    return Err(UpstreamError::Stream(message).into())
                }
            }
        }
    }

    /// Download each attached image and upload it to the upstream. Failures are skipped.
    async fn upload_images(&self, turn: &Turn) -> Vec<UploadedFile> {
        let mut files = Vec::new();
        for url in &turn.image_urls {
            let key = media::is_encrypted_source(url, &self.images.encrypted_hosts)
                .then_some(self.envelope.as_ref());
            let fetched =
                tokio::time::timeout(self.images.fetch_timeout, self.fetcher.fetch(url, key)).await;
            let data = match fetched {
                Ok(Ok(data)) => data,
                Ok(Err(e)) => {
                    log::warn!("orchestrator: inbound image download failed for {}: {}", turn.key, e);
                    continue;
                }
                Err(_) => {
                    log::warn!("orchestrator: inbound image download timed out for {}", turn.key);
                    continue;
                }
            };
            match self.upstream.upload_image(&turn.agent, &turn.user, data).await {
                Ok(file) => files.push(file),
                Err(e) => log::warn!("orchestrator: image upload failed for {}: {}", turn.key, e),
            }
        }
        files
    }

    async fn stop_upstream(&self, turn: &Turn, task_id: Option<&str>) {
        let Some(task_id) = task_id else {
            return;
        };
        match self.upstream.stop(&turn.agent, task_id, &turn.user).await {
            Ok(()) => log::debug!("orchestrator: stopped upstream task {} for {}", task_id, turn.key),
            Err(e) => log::debug!("orchestrator: upstream stop failed for {}: {}", turn.key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BeginOutcome, ChunkKind};
    use crate::llm::EventStream;
    use crate::parser::tests::{test_envelope, DelayedFetcher};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed script of events; counts opened streams and stop calls.
    struct ScriptedUpstream {
        script: Vec<Result<StreamEvent, UpstreamError>>,
        /// Keep the stream open (pending) after the script.
        hang: bool,
        opened: AtomicUsize,
        stopped: AtomicUsize,
        requests: Mutex<Vec<StreamRequest>>,
        /// Entry checked on every stop call; records whether it was already completed.
        watch: Mutex<Option<(Arc<StreamMessageCache>, ConversationKey)>>,
        completed_at_stop: Mutex<Vec<Option<bool>>>,
    }

    impl ScriptedUpstream {
        fn new(script: Vec<Result<StreamEvent, UpstreamError>>) -> Self {
            Self {
                script,
                hang: false,
                opened: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                watch: Mutex::new(None),
                completed_at_stop: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DifyStreamClient for ScriptedUpstream {
        async fn open_stream(
            &self,
            _agent: &AgentConfig,
            request: StreamRequest,
        ) -> Result<EventStream, UpstreamError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request);
            let events: Vec<Result<StreamEvent, UpstreamError>> = self
                .script
                .iter()
                .map(|e| match e {
                    Ok(ev) => Ok(ev.clone()),
                    Err(e) => Err(UpstreamError::Stream(e.to_string())),
                })
                .collect();
            let head = futures_util::stream::iter(events);
            if self.hang {
                Ok(head.chain(futures_util::stream::pending()).boxed())
            } else {
                Ok(head.boxed())
            }
        }

        async fn stop(&self, _agent: &AgentConfig, _task_id: &str, _user: &str) -> Result<(), UpstreamError> {
            if let Some((cache, key)) = self.watch.lock().as_ref() {
                self.completed_at_stop.lock().push(cache.is_completed(key));
            }
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn agent() -> AgentConfig {
        AgentConfig {
            agent_id: "a1".to_string(),
            base_url: "http://upstream".to_string(),
            api_key: String::new(),
            name: None,
        }
    }

    fn settings(idle_ms: u64) -> TurnSettings {
        TurnSettings {
            idle_timeout: Duration::from_millis(idle_ms),
            total_timeout: Duration::from_secs(5),
            error_text: "upstream error".to_string(),
            image_prompt: "describe".to_string(),
        }
    }

    fn orchestrator(upstream: Arc<ScriptedUpstream>, idle_ms: u64) -> (BackgroundOrchestrator, Arc<StreamMessageCache>) {
        let cache = Arc::new(StreamMessageCache::new(Duration::from_secs(60)));
        let o = BackgroundOrchestrator::new(
            Arc::clone(&cache),
            upstream,
            Arc::new(DelayedFetcher { delays: HashMap::new() }),
            test_envelope(),
            ImageSettings {
                encrypted_hosts: Vec::new(),
                fetch_timeout: Duration::from_secs(1),
                fallback_text: "[image unavailable]".to_string(),
            },
            settings(idle_ms),
        );
        (o, cache)
    }

    fn turn(cache: &StreamMessageCache, query: &str) -> Turn {
        let key = ConversationKey::new("bot", None, "alice");
        let BeginOutcome::Started(ticket) = cache.begin(&key, "thinking") else {
            panic!("expected fresh entry");
        };
        Turn {
            key,
            agent: agent(),
            query: query.to_string(),
            user: "alice".to_string(),
            image_urls: Vec::new(),
            ticket,
        }
    }

    fn contents(cache: &StreamMessageCache, key: &ConversationKey) -> (Vec<ChunkContent>, bool) {
        let snap = cache.read(key, 0).unwrap();
        (snap.chunks.into_iter().map(|c| c.content).collect(), snap.completed)
    }

    #[tokio::test]
    async fn streams_text_and_images_to_completion() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Ok(StreamEvent::Started { task_id: "t1".to_string() }),
            Ok(StreamEvent::Delta("Hi ![pic](http://x/u1)".to_string())),
            Ok(StreamEvent::Delta(" there".to_string())),
            Ok(StreamEvent::Done { conversation_id: Some("conv-7".to_string()) }),
        ]));
        let (o, cache) = orchestrator(Arc::clone(&upstream), 1000);
        let t = turn(&cache, "hello");
        let key = t.key.clone();
        assert_eq!(o.run(t).await, TurnState::Complete);
        let (chunks, completed) = contents(&cache, &key);
        assert!(completed);
        assert_eq!(
            chunks,
            vec![
                ChunkContent::Text("Hi ".to_string()),
                ChunkContent::Image(b"bytes-of-http://x/u1".to_vec()),
                ChunkContent::Text(" there".to_string()),
            ]
        );
        // next turn continues the upstream conversation
        let next = turn(&cache, "again");
        assert_eq!(next.ticket.upstream_conversation_id.as_deref(), Some("conv-7"));
        assert_eq!(upstream.stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stream_error_leaves_error_chunk_and_completes() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Ok(StreamEvent::Delta("Processing".to_string())),
            Err(UpstreamError::Stream("connection reset".to_string())),
        ]));
        let (o, cache) = orchestrator(upstream, 1000);
        let t = turn(&cache, "hello");
        let key = t.key.clone();
        assert_eq!(o.run(t).await, TurnState::Failed);
        let (chunks, completed) = contents(&cache, &key);
        assert!(completed);
        assert_eq!(
            chunks,
            vec![
                ChunkContent::Text("Processing".to_string()),
                ChunkContent::Error("upstream error".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn upstream_error_event_fails_turn() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![Ok(StreamEvent::Error("quota".to_string()))]));
        let (o, cache) = orchestrator(upstream, 1000);
        let t = turn(&cache, "hello");
        let key = t.key.clone();
        assert_eq!(o.run(t).await, TurnState::Failed);
        let (chunks, completed) = contents(&cache, &key);
        assert!(completed);
        assert_eq!(chunks.last().map(|c| c.kind()), Some(ChunkKind::Error));
    }

    #[tokio::test]
    async fn idle_upstream_times_out_and_is_stopped() {
        let mut scripted = ScriptedUpstream::new(vec![
            Ok(StreamEvent::Started { task_id: "t9".to_string() }),
            Ok(StreamEvent::Delta("partial ![im".to_string())),
        ]);
        scripted.hang = true;
        let upstream = Arc::new(scripted);
        let (o, cache) = orchestrator(Arc::clone(&upstream), 30);
        let t = turn(&cache, "hello");
        let key = t.key.clone();
        assert_eq!(o.run(t).await, TurnState::Failed);
        let (chunks, completed) = contents(&cache, &key);
        assert!(completed);
        assert_eq!(
            chunks,
            vec![
                ChunkContent::Text("partial ".to_string()),
                ChunkContent::Text("![im".to_string()),
                ChunkContent::Error("upstream error".to_string()),
            ]
        );
        assert_eq!(upstream.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_settles_entry_and_stops_upstream() {
        let mut scripted = ScriptedUpstream::new(vec![
            Ok(StreamEvent::Started { task_id: "t2".to_string() }),
            Ok(StreamEvent::Delta("so far".to_string())),
        ]);
        scripted.hang = true;
        let upstream = Arc::new(scripted);
        let (o, cache) = orchestrator(Arc::clone(&upstream), 10_000);
        let t = turn(&cache, "hello");
        let key = t.key.clone();
        *upstream.watch.lock() = Some((Arc::clone(&cache), key.clone()));
        let cancel = t.ticket.cancel.clone();
        let handle = tokio::spawn({
            let o = o.clone();
            async move { o.run(t).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), TurnState::Failed);
        let (chunks, completed) = contents(&cache, &key);
        assert!(completed);
        assert_eq!(chunks.last().map(|c| c.kind()), Some(ChunkKind::Error));
        assert_eq!(upstream.stopped.load(Ordering::SeqCst), 1);
        // the entry stays open until the upstream was told to stop, so no second stream can start
        assert_eq!(*upstream.completed_at_stop.lock(), vec![Some(false)]);
    }

    #[tokio::test]
    async fn image_only_message_uses_prompt() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![Ok(StreamEvent::Done { conversation_id: None })]));
        let (o, cache) = orchestrator(Arc::clone(&upstream), 1000);
        let mut t = turn(&cache, "  ");
        // stub upstream has no upload support, so the image is skipped
        t.image_urls.push("http://x/in.png".to_string());
        assert_eq!(o.run(t).await, TurnState::Complete);
        let requests = upstream.requests.lock();
        assert_eq!(requests[0].query, "describe");
        assert!(requests[0].files.is_empty());
    }

    #[tokio::test]
    async fn concurrent_messages_open_one_stream() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Ok(StreamEvent::Delta("answer".to_string())),
            Ok(StreamEvent::Done { conversation_id: None }),
        ]));
        let (o, cache) = orchestrator(Arc::clone(&upstream), 1000);
        let tracker = TaskTracker::new();
        let key = ConversationKey::new("bot", None, "alice");
        for _ in 0..5 {
            if let BeginOutcome::Started(ticket) = cache.begin(&key, "thinking") {
                o.spawn(
                    &tracker,
                    Turn {
                        key: key.clone(),
                        agent: agent(),
                        query: "q".to_string(),
                        user: "alice".to_string(),
                        image_urls: Vec::new(),
                        ticket,
                    },
                );
            }
        }
        tracker.close();
        tracker.wait().await;
        assert_eq!(upstream.opened.load(Ordering::SeqCst), 1);
        assert!(cache.read(&key, 0).unwrap().completed);
    }
}
