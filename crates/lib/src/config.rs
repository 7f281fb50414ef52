//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.relay/config.json`) and environment.
//! Platform secrets and the fallback upstream key can be supplied by env instead of the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Chat platform callback credentials.
    #[serde(default)]
    pub wecom: WecomConfig,

    /// Bot id to upstream agent mapping.
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Stream cache, dedup and timeout tuning plus user-facing texts.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Media download settings.
    #[serde(default)]
    pub media: MediaConfig,
}

/// Gateway bind, port and callback route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 15180).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Route the platform posts callbacks to (default "/wecom/callback"). A `/{botid}` suffix is also accepted.
    #[serde(default = "default_callback_path")]
    pub callback_path: String,
}

fn default_gateway_port() -> u16 {
    15180
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_callback_path() -> String {
    "/wecom/callback".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            callback_path: default_callback_path(),
        }
    }
}

/// Callback token, EncodingAESKey and receive id as configured in the platform admin console.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WecomConfig {
    /// Overridden by WECOM_TOKEN env.
    pub token: Option<String>,
    /// 43-character base64 key. Overridden by WECOM_ENCODING_AES_KEY env.
    pub encoding_aes_key: Option<String>,
    /// Expected trailing receive id in decrypted payloads. AI bots use the empty string. Overridden by WECOM_RECEIVE_ID env.
    #[serde(default)]
    pub receive_id: String,
}

/// One upstream agent (Dify app) reachable with its own API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub agent_id: String,
    /// Upstream API root, e.g. "http://dify.local/v1".
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Display name used in the welcome card.
    #[serde(default)]
    pub name: Option<String>,
}

/// Mapping of platform bot ids to upstream agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    /// aibotid -> agent.
    #[serde(default)]
    pub bots: HashMap<String, AgentConfig>,
    /// Agent used for bot ids that are not in `bots`. When absent, unmapped bots get an immediate notice.
    #[serde(default)]
    pub fallback: Option<AgentConfig>,
}

/// Cache lifetimes, timeouts and the fixed texts shown to end users.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    #[serde(default = "default_placeholder_text")]
    pub placeholder_text: String,
    #[serde(default = "default_expired_text")]
    pub expired_text: String,
    #[serde(default = "default_unknown_agent_text")]
    pub unknown_agent_text: String,
    #[serde(default = "default_upstream_error_text")]
    pub upstream_error_text: String,
    #[serde(default = "default_image_fallback_text")]
    pub image_fallback_text: String,
    /// Prompt sent upstream when the user only sent images.
    #[serde(default = "default_image_prompt")]
    pub image_prompt: String,
    /// Idle TTL for conversation entries, regardless of completion.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    /// Max wait for the next upstream event.
    #[serde(default = "default_upstream_idle_timeout_secs")]
    pub upstream_idle_timeout_secs: u64,
    /// Max duration of one upstream answer.
    #[serde(default = "default_upstream_total_timeout_secs")]
    pub upstream_total_timeout_secs: u64,
    #[serde(default = "default_image_fetch_timeout_secs")]
    pub image_fetch_timeout_secs: u64,
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
}

fn default_placeholder_text() -> String {
    "正在思考中...".to_string()
}

fn default_expired_text() -> String {
    "this conversation has expired, please send your message again.".to_string()
}

fn default_unknown_agent_text() -> String {
    "this bot is not connected to an assistant yet.".to_string()
}

fn default_upstream_error_text() -> String {
    "抱歉，处理请求时发生错误，请稍后再试。".to_string()
}

fn default_image_fallback_text() -> String {
    "[image unavailable]".to_string()
}

fn default_image_prompt() -> String {
    "请分析这张图片".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_dedup_ttl_secs() -> u64 {
    300
}

fn default_upstream_idle_timeout_secs() -> u64 {
    60
}

fn default_upstream_total_timeout_secs() -> u64 {
    300
}

fn default_image_fetch_timeout_secs() -> u64 {
    15
}

fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            placeholder_text: default_placeholder_text(),
            expired_text: default_expired_text(),
            unknown_agent_text: default_unknown_agent_text(),
            upstream_error_text: default_upstream_error_text(),
            image_fallback_text: default_image_fallback_text(),
            image_prompt: default_image_prompt(),
            cache_ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            upstream_idle_timeout_secs: default_upstream_idle_timeout_secs(),
            upstream_total_timeout_secs: default_upstream_total_timeout_secs(),
            image_fetch_timeout_secs: default_image_fetch_timeout_secs(),
            max_image_bytes: default_max_image_bytes(),
        }
    }
}

impl StreamConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn upstream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_idle_timeout_secs)
    }

    pub fn upstream_total_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_total_timeout_secs)
    }

    pub fn image_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.image_fetch_timeout_secs)
    }
}

/// Where images come from and which ones need the platform key to decrypt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConfig {
    /// Host suffixes whose assets are AES-encrypted with the callback key.
    #[serde(default = "default_encrypted_hosts")]
    pub encrypted_hosts: Vec<String>,
    /// When set, platform COS URLs are rewritten to `{proxyBase}/cos-image?path=<path>`.
    #[serde(default)]
    pub proxy_base: Option<String>,
}

fn default_encrypted_hosts() -> Vec<String> {
    vec!["cos.ap-guangzhou.myqcloud.com".to_string()]
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            encrypted_hosts: default_encrypted_hosts(),
            proxy_base: None,
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the callback token: env WECOM_TOKEN overrides config.
pub fn resolve_wecom_token(config: &Config) -> Option<String> {
    env_nonempty("WECOM_TOKEN").or_else(|| {
        config
            .wecom
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the EncodingAESKey: env WECOM_ENCODING_AES_KEY overrides config.
pub fn resolve_encoding_aes_key(config: &Config) -> Option<String> {
    env_nonempty("WECOM_ENCODING_AES_KEY").or_else(|| {
        config
            .wecom
            .encoding_aes_key
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the receive id: env WECOM_RECEIVE_ID overrides config (empty string is valid).
pub fn resolve_receive_id(config: &Config) -> String {
    env_nonempty("WECOM_RECEIVE_ID").unwrap_or_else(|| config.wecom.receive_id.clone())
}

/// Resolve the fallback agent: env DIFY_API_KEY replaces its key (and DIFY_API_BASE_URL its base url).
/// When only env is set, a fallback agent is created from it.
pub fn resolve_fallback_agent(config: &Config) -> Option<AgentConfig> {
    let key = env_nonempty("DIFY_API_KEY");
    let base = env_nonempty("DIFY_API_BASE_URL");
    match (config.agents.fallback.clone(), key, base) {
        (Some(mut agent), key, base) => {
            if let Some(k) = key {
                agent.api_key = k;
            }
            if let Some(b) = base {
                agent.base_url = b;
            }
            Some(agent)
        }
        (None, Some(key), Some(base)) => Some(AgentConfig {
            agent_id: "default".to_string(),
            base_url: base,
            api_key: key,
            name: None,
        }),
        _ => None,
    }
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".relay").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or RELAY_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
