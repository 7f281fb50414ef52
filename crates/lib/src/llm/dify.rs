//! Dify chat-messages API client (`{base}/chat-messages`, `response_mode: streaming`).
//! The response is server-sent events; each `data:` line carries one JSON event.

use crate::config::AgentConfig;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream api error: {status} {message}")]
    Api { status: u16, message: String },
    #[error("upstream timed out")]
    Timeout,
    #[error("upstream stream error: {0}")]
    Stream(String),
}

/// One event surfaced to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Upstream task id, emitted once before the first delta; used to stop generation.
    Started { task_id: String },
    /// Incremental answer text.
    Delta(String),
    /// Normal end of the answer.
    Done { conversation_id: Option<String> },
    /// Upstream reported an error mid-stream.
    Error(String),
}

pub type EventStream = BoxStream<'static, Result<StreamEvent, UpstreamError>>;

/// File previously uploaded to the upstream, attached to a chat request as an image input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub query: String,
    pub user: String,
    /// Upstream conversation to continue, if any.
    pub conversation_id: Option<String>,
    pub files: Vec<UploadedFile>,
}

/// Opens answer streams against the upstream service. Dropping the returned stream cancels it.
#[async_trait]
pub trait DifyStreamClient: Send + Sync {
    async fn open_stream(
        &self,
        agent: &AgentConfig,
        request: StreamRequest,
    ) -> Result<EventStream, UpstreamError>;

    /// Upload an image for use as a chat input.
    async fn upload_image(
        &self,
        _agent: &AgentConfig,
        _user: &str,
        _data: Vec<u8>,
    ) -> Result<UploadedFile, UpstreamError> {
        Err(UpstreamError::Stream("image upload not supported".to_string()))
    }

    /// Ask the upstream to stop generating for `task_id`. Best effort.
    async fn stop(&self, _agent: &AgentConfig, _task_id: &str, _user: &str) -> Result<(), UpstreamError> {
        Ok(())
    }
}

/// Raw Dify SSE event (subset of fields we use).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DifyEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// message_file: file type ("image").
    #[serde(default, rename = "type")]
    pub file_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub belongs_to: Option<String>,
}

/// Parse one SSE block (lines separated by `\n`); returns None for comments, pings and bad JSON.
pub fn parse_sse_block(block: &str) -> Option<DifyEvent> {
    let data: Vec<&str> = block
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|l| l.strip_prefix(' ').unwrap_or(l))
        .collect();
    if data.is_empty() {
        return None;
    }
    let joined = data.join("\n");
    match serde_json::from_str(&joined) {
        Ok(ev) => Some(ev),
        Err(e) => {
            log::debug!("dify: skipping unparsable sse data ({}): {}", e, joined);
            None
        }
    }
}

/// Translate a Dify event into orchestrator events. Returns true when the stream is finished.
fn translate(ev: DifyEvent, task_seen: &mut bool, out: &mut VecDeque<StreamEvent>) -> bool {
    if !*task_seen {
        if let Some(task_id) = ev.task_id.as_ref().filter(|t| !t.is_empty()) {
            *task_seen = true;
            out.push_back(StreamEvent::Started {
                task_id: task_id.clone(),
            });
        }
    }
    match ev.event.as_str() {
        "message" | "agent_message" => {
            if let Some(answer) = ev.answer.filter(|a| !a.is_empty()) {
                out.push_back(StreamEvent::Delta(answer));
            }
            false
        }
        "message_file" => {
            let is_image = ev.file_type.as_deref() == Some("image");
            let from_user = ev.belongs_to.as_deref() == Some("user");
            if let (true, false, Some(url)) = (is_image, from_user, ev.url) {
                out.push_back(StreamEvent::Delta(format!("![]({})", url)));
            }
            false
        }
        "message_end" => {
            out.push_back(StreamEvent::Done {
                conversation_id: ev.conversation_id.filter(|c| !c.is_empty()),
            });
            true
        }
        "error" => {
            out.push_back(StreamEvent::Error(
                ev.message.unwrap_or_else(|| "upstream error".to_string()),
            ));
            true
        }
        _ => false,
    }
}

struct SseState {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    buffer: Vec<u8>,
    queue: VecDeque<StreamEvent>,
    task_seen: bool,
    finished: bool,
}

impl SseState {
    /// Move every complete `\n\n`-terminated block from the buffer into the queue.
    fn drain_blocks(&mut self) {
        while !self.finished {
            let Some(i) = find_block_end(&self.buffer) else {
                break;
            };
            let block_bytes: Vec<u8> = self.buffer.drain(..i).collect();
            let sep = if self.buffer.starts_with(b"\r\n\r\n") { 4 } else { 2 };
            self.buffer.drain(..sep.min(self.buffer.len()));
            let block = String::from_utf8_lossy(&block_bytes);
            if let Some(ev) = parse_sse_block(&block) {
                self.finished = translate(ev, &mut self.task_seen, &mut self.queue);
            }
        }
    }

    /// Body ended: a last block may lack its terminating blank line.
    fn drain_tail(&mut self) {
        if self.finished || self.buffer.is_empty() {
            return;
        }
        let rest = std::mem::take(&mut self.buffer);
        if let Some(ev) = parse_sse_block(&String::from_utf8_lossy(&rest)) {
            self.finished = translate(ev, &mut self.task_seen, &mut self.queue);
        }
    }
}

fn find_block_end(buf: &[u8]) -> Option<usize> {
    let lf = buf.windows(2).position(|w| w == b"\n\n");
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    query: &'a str,
    inputs: serde_json::Value,
    response_mode: &'static str,
    user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    files: Vec<ChatFile<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatFile<'a> {
    #[serde(rename = "type")]
    typ: &'static str,
    transfer_method: &'static str,
    upload_file_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for Dify apps. One instance serves every agent; base url and key come per call.
#[derive(Clone)]
pub struct DifyClient {
    client: reqwest::Client,
}

impl Default for DifyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DifyClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn url(agent: &AgentConfig, path: &str) -> String {
        format!("{}/{}", agent.base_url.trim_end_matches('/'), path)
    }

    fn authorized(agent: &AgentConfig, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if agent.api_key.trim().is_empty() {
            req
        } else {
            req.bearer_auth(agent.api_key.trim())
        }
    }

    async fn api_error(res: reqwest::Response) -> UpstreamError {
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or(body);
        UpstreamError::Api { status, message }
    }
}

#[async_trait]
impl DifyStreamClient for DifyClient {
    /// POST /chat-messages with response_mode streaming.
    async fn open_stream(
        &self,
        agent: &AgentConfig,
        request: StreamRequest,
    ) -> Result<EventStream, UpstreamError> {
        let body = ChatRequest {
            query: &request.query,
            inputs: serde_json::json!({}),
            response_mode: "streaming",
            user: if request.user.is_empty() { "anonymous" } else { &request.user },
            conversation_id: request.conversation_id.as_deref(),
            files: request
                .files
                .iter()
                .map(|f| ChatFile {
                    typ: "image",
                    transfer_method: "local_file",
                    upload_file_id: &f.id,
                })
                .collect(),
        };
        let req = self.client.post(Self::url(agent, "chat-messages")).json(&body);
        let res = Self::authorized(agent, req).send().await?;
        if !res.status().is_success() {
            return Err(Self::api_error(res).await);
        }
        let state = SseState {
            body: res.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            buffer: Vec::new(),
            queue: VecDeque::new(),
            task_seen: false,
            finished: false,
        };
        let stream = futures_util::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(ev) = st.queue.pop_front() {
                    return Some((Ok(ev), st));
                }
                if st.finished {
                    return None;
                }
                match st.body.next().await {
                    Some(Ok(bytes)) => {
                        st.buffer.extend_from_slice(&bytes);
                        st.drain_blocks();
                    }
                    Some(Err(e)) => {
                        st.finished = true;
                        return Some((Err(UpstreamError::Request(e)), st));
                    }
                    None => {
                        st.drain_tail();
                        st.finished = true;
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    /// POST /files/upload (multipart: file + user).
    async fn upload_image(
        &self,
        agent: &AgentConfig,
        user: &str,
        data: Vec<u8>,
    ) -> Result<UploadedFile, UpstreamError> {
        let ext = crate::media::image_extension(&data);
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(format!("image.{}", ext))
            .mime_str(&format!("image/{}", if ext == "jpg" { "jpeg" } else { ext }))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("user", user.to_string());
        let req = self
            .client
            .post(Self::url(agent, "files/upload"))
            .multipart(form);
        let res = Self::authorized(agent, req).send().await?;
        if !res.status().is_success() {
            return Err(Self::api_error(res).await);
        }
        let data: UploadResponse = res.json().await?;
        Ok(UploadedFile { id: data.id })
    }

    /// POST /chat-messages/{task_id}/stop.
    async fn stop(&self, agent: &AgentConfig, task_id: &str, user: &str) -> Result<(), UpstreamError> {
        let url = Self::url(agent, &format!("chat-messages/{}/stop", task_id));
        let req = self.client.post(url).json(&serde_json::json!({ "user": user }));
        let res = Self::authorized(agent, req).send().await?;
        if !res.status().is_success() {
            return Err(Self::api_error(res).await);
        }
        Ok(())
    }
}
