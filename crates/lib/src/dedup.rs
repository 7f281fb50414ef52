//! Short-TTL record of recently seen message ids.
//!
//! The platform redelivers a webhook when it does not get an answer in time. A redelivered
//! `msgid` must not start a second upstream call; it is answered with the body recorded for
//! the first delivery, waiting for it when the first delivery is still being handled.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug)]
struct DedupRecord {
    seen_at: Instant,
    response: watch::Sender<Option<String>>,
}

impl DedupRecord {
    fn new(seen_at: Instant) -> Self {
        let (response, _) = watch::channel(None);
        Self { seen_at, response }
    }
}

/// Concurrent msgid set with per-record locking (dashmap shards).
#[derive(Debug)]
pub struct DedupGuard {
    records: DashMap<String, DedupRecord>,
    ttl: Duration,
}

impl DedupGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    /// True if `msgid` was observed within the TTL window; otherwise records it and returns false.
    /// An empty msgid is never considered seen.
    pub fn seen(&self, msgid: &str) -> bool {
        self.seen_at(msgid, Instant::now())
    }

    fn seen_at(&self, msgid: &str, now: Instant) -> bool {
        if msgid.is_empty() {
            return false;
        }
        match self.records.entry(msgid.to_string()) {
            Entry::Occupied(mut e) => {
                if now.saturating_duration_since(e.get().seen_at) < self.ttl {
                    true
                } else {
                    e.insert(DedupRecord::new(now));
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(DedupRecord::new(now));
                false
            }
        }
    }

    /// Remember the response body sent for the first delivery of `msgid`.
    pub fn record_response(&self, msgid: &str, body: &str) {
        if let Some(r) = self.records.get(msgid) {
            r.response.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(body.to_string());
                true
            });
        }
    }

    /// Body recorded for `msgid`, if the first delivery already answered.
    pub fn cached_response(&self, msgid: &str) -> Option<String> {
        let record = self.records.get(msgid)?;
        let body = record.response.borrow().clone();
        body
    }

    /// Body recorded for `msgid`, waiting up to `within` for the first delivery to answer.
    /// None when nothing was recorded in time or the record is gone.
    pub async fn wait_response(&self, msgid: &str, within: Duration) -> Option<String> {
        let mut rx = self.records.get(msgid)?.response.subscribe();
        let waited = tokio::time::timeout(within, rx.wait_for(Option::is_some)).await;
        let body = match waited {
            Ok(Ok(body)) => (*body).clone(),
            Ok(Err(_)) | Err(_) => None,
        };
        body
    }

    /// Drop records older than the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| now.saturating_duration_since(r.seen_at) < self.ttl);
        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
