//! Incremental split of streamed answer text into prose and markdown images.
//!
//! Deltas arrive in arbitrary fragments, so an image link may straddle several of them. Text
//! that could still turn into `![alt](url)` is held back until it either completes or can no
//! longer match. Each completed link reserves a cache slot and its download runs concurrently;
//! the slot is always filled, with the image or with a fallback marker.

use crate::cache::{CacheError, ChunkContent, ConversationKey, StreamMessageCache};
use crate::config::Config;
use crate::crypto::CryptoEnvelope;
use crate::media::{self, MediaFetcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Longest partial link kept back before it is released as literal text.
const MAX_HELD_MARKUP: usize = 2048;

/// Image download behaviour shared by every parser.
#[derive(Debug, Clone)]
pub struct ImageSettings {
    /// Hosts whose assets are encrypted with the platform key.
    pub encrypted_hosts: Vec<String>,
    pub fetch_timeout: Duration,
    /// Filled into a slot whose image could not be fetched.
    pub fallback_text: String,
}

impl ImageSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            encrypted_hosts: config.media.encrypted_hosts.clone(),
            fetch_timeout: config.stream.image_fetch_timeout(),
            fallback_text: config.stream.image_fallback_text.clone(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Piece {
    Text(String),
    Image(String),
}

/// Scan `buf`, returning complete pieces and leaving an incomplete link prefix in `buf`.
fn split_pieces(buf: &mut String, at_end: bool) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut rest = std::mem::take(buf);
    loop {
        let Some(bang) = rest.find('!') else {
            text.push_str(&rest);
            rest.clear();
            break;
        };
        match scan_link(&rest[bang..]) {
            Scan::Link { url, len } => {
                text.push_str(&rest[..bang]);
                if !text.is_empty() {
                    pieces.push(Piece::Text(std::mem::take(&mut text)));
                }
                pieces.push(Piece::Image(url));
                rest = rest[bang + len..].to_string();
            }
            Scan::Literal(len) => {
                text.push_str(&rest[..bang + len]);
                rest = rest[bang + len..].to_string();
            }
            Scan::Partial if at_end || rest.len() - bang > MAX_HELD_MARKUP => {
                // cannot complete any more; release the `!` and rescan after it
                text.push_str(&rest[..bang + 1]);
                rest = rest[bang + 1..].to_string();
            }
            Scan::Partial => {
                text.push_str(&rest[..bang]);
                rest = rest[bang..].to_string();
                break;
            }
        }
    }
    if !text.is_empty() {
        pieces.push(Piece::Text(text));
    }
    *buf = rest;
    pieces
}

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// Complete link of `len` bytes.
    Link { url: String, len: usize },
    /// The first `len` bytes can never be part of a link.
    Literal(usize),
    /// Might still complete with more input.
    Partial,
}

/// Classify the text starting at a `!`.
fn scan_link(s: &str) -> Scan {
    let bytes = s.as_bytes();
    match bytes.get(1) {
        None => return Scan::Partial,
        Some(b'[') => {}
        Some(_) => return Scan::Literal(1),
    }
    let Some(close) = s[2..].find(']').map(|i| i + 2) else {
        return Scan::Partial;
    };
    match bytes.get(close + 1) {
        None => return Scan::Partial,
        Some(b'(') => {}
        Some(_) => return Scan::Literal(close + 1),
    }
    let url_start = close + 2;
    let Some(end) = s[url_start..].find(')').map(|i| i + url_start) else {
        if s[url_start..].contains(char::is_whitespace) {
            return Scan::Literal(url_start);
        }
        return Scan::Partial;
    };
    let url = s[url_start..end].trim();
    if url.is_empty() || url.contains(char::is_whitespace) {
        return Scan::Literal(end + 1);
    }
    Scan::Link {
        url: url.to_string(),
        len: end + 1,
    }
}

/// Feeds one turn's answer text into the cache.
pub struct ContentParser {
    key: ConversationKey,
    cache: Arc<StreamMessageCache>,
    fetcher: Arc<dyn MediaFetcher>,
    envelope: Arc<CryptoEnvelope>,
    settings: Arc<ImageSettings>,
    held: String,
    fetches: JoinSet<()>,
}

impl ContentParser {
    pub fn new(
        key: ConversationKey,
        cache: Arc<StreamMessageCache>,
        fetcher: Arc<dyn MediaFetcher>,
        envelope: Arc<CryptoEnvelope>,
        settings: Arc<ImageSettings>,
    ) -> Self {
        Self {
            key,
            cache,
            fetcher,
            envelope,
            settings,
            held: String::new(),
            fetches: JoinSet::new(),
        }
    }

    /// Consume one delta. Prose is appended right away; links reserve a slot and start a fetch.
    pub fn push(&mut self, delta: &str) -> Result<(), CacheError> {
        self.held.push_str(delta);
        let pieces = split_pieces(&mut self.held, false);
        self.emit(pieces)
    }

    /// Release held-back partial markup as plain text.
    pub fn flush(&mut self) -> Result<(), CacheError> {
        let pieces = split_pieces(&mut self.held, true);
        self.emit(pieces)
    }

    /// Flush held-back text and wait for every image fetch to fill its slot.
    pub async fn finish(&mut self) -> Result<(), CacheError> {
        self.flush()?;
        self.wait_fetches().await;
        Ok(())
    }

    /// Drop held text and stop outstanding fetches. Their slots stay reserved for the caller to settle.
    pub fn abort(&mut self) {
        self.held.clear();
        self.fetches.abort_all();
    }

    pub fn pending_fetches(&self) -> usize {
        self.fetches.len()
    }

    async fn wait_fetches(&mut self) {
        while let Some(res) = self.fetches.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    log::error!("parser: image fetch task panicked for {}", self.key);
                }
            }
        }
    }

    fn emit(&mut self, pieces: Vec<Piece>) -> Result<(), CacheError> {
        for piece in pieces {
            match piece {
                Piece::Text(text) => {
                    self.cache.append(&self.key, ChunkContent::Text(text))?;
                }
                Piece::Image(url) => {
                    let seq = self.cache.reserve(&self.key)?;
                    self.spawn_fetch(seq, url);
                }
            }
        }
        Ok(())
    }

    fn spawn_fetch(&mut self, seq: u64, url: String) {
        let key = self.key.clone();
        let cache = Arc::clone(&self.cache);
        let fetcher = Arc::clone(&self.fetcher);
        let envelope = media::is_encrypted_source(&url, &self.settings.encrypted_hosts)
            .then(|| Arc::clone(&self.envelope));
        let settings = Arc::clone(&self.settings);
        log::debug!("parser: fetching image seq={} for {} url={}", seq, key, url);
        self.fetches.spawn(async move {
            let fetched =
                tokio::time::timeout(settings.fetch_timeout, fetcher.fetch(&url, envelope.as_deref()))
                    .await;
            let content = match fetched {
                Ok(Ok(bytes)) if !bytes.is_empty() => ChunkContent::Image(bytes),
                Ok(Ok(_)) => {
                    log::warn!("parser: image at {} is empty", url);
                    ChunkContent::Text(settings.fallback_text.clone())
                }
                Ok(Err(e)) => {
                    log::warn!("parser: image fetch failed for {}: {}", url, e);
                    ChunkContent::Text(settings.fallback_text.clone())
                }
                Err(_) => {
                    log::warn!("parser: image fetch timed out for {}", url);
                    ChunkContent::Text(settings.fallback_text.clone())
                }
            };
            if let Err(e) = cache.fill(&key, seq, content) {
                log::debug!("parser: could not fill seq={} for {}: {}", seq, key, e);
            }
        });
    }
}
