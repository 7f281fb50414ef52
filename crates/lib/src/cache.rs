//! Ordered per-conversation buffer of streamed output.
//!
//! Each [`ConversationKey`] owns one entry behind its own mutex; entries for different keys
//! never contend. Sequence numbers start at 1 and are allocated in stream order, either filled
//! immediately (`append`) or reserved for content that arrives later (`reserve` + `fill`).
//! Readers only ever see the contiguous filled prefix, so chunk n is never visible before n-1.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Identity of one ongoing exchange: the bot plus the group chat, or the sender in a single chat.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConversationKey {
    pub aibotid: String,
    pub scope: String,
}

impl ConversationKey {
    pub fn new(aibotid: &str, chatid: Option<&str>, sender_id: &str) -> Self {
        let scope = match chatid.map(str::trim).filter(|c| !c.is_empty()) {
            Some(chat) => format!("group:{}", chat),
            None => format!("single:{}", sender_id.trim()),
        };
        Self {
            aibotid: aibotid.trim().to_string(),
            scope,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aibotid, self.scope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Text,
    Image,
    Error,
}

/// Payload of one chunk. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkContent {
    Text(String),
    Image(Vec<u8>),
    Error(String),
}

impl ChunkContent {
    pub fn kind(&self) -> ChunkKind {
        match self {
            ChunkContent::Text(_) => ChunkKind::Text,
            ChunkContent::Image(_) => ChunkKind::Image,
            ChunkContent::Error(_) => ChunkKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: u64,
    pub content: ChunkContent,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("no cache entry for conversation")]
    UnknownKey,
    #[error("seq {0} is not a reserved placeholder")]
    NotReserved(u64),
    #[error("seq {0} is already filled")]
    AlreadyFilled(u64),
    #[error("entry is already completed")]
    Completed,
}

#[derive(Debug)]
enum Slot {
    Reserved,
    Filled(ChunkContent),
}

#[derive(Debug)]
struct CacheEntry {
    stream_id: String,
    slots: Vec<Slot>,
    pending: usize,
    complete_requested: bool,
    completed: bool,
    placeholder: String,
    upstream_conversation_id: Option<String>,
    cancel: CancellationToken,
    created_at: Instant,
    last_access: Instant,
    drained_at: Option<Instant>,
}

impl CacheEntry {
    fn new(placeholder: &str, upstream_conversation_id: Option<String>, now: Instant) -> Self {
        Self {
            stream_id: uuid::Uuid::new_v4().simple().to_string(),
            slots: Vec::new(),
            pending: 0,
            complete_requested: false,
            completed: false,
            placeholder: placeholder.to_string(),
            upstream_conversation_id,
            cancel: CancellationToken::new(),
            created_at: now,
            last_access: now,
            drained_at: None,
        }
    }

    fn next_seq(&self) -> u64 {
        self.slots.len() as u64 + 1
    }

    fn push(&mut self, slot: Slot) -> Result<u64, CacheError> {
        if self.completed || self.complete_requested {
            return Err(CacheError::Completed);
        }
        let seq = self.next_seq();
        if matches!(slot, Slot::Reserved) {
            self.pending += 1;
        }
        self.slots.push(slot);
        Ok(seq)
    }

    fn fill(&mut self, seq: u64, content: ChunkContent) -> Result<(), CacheError> {
        let idx = seq
            .checked_sub(1)
            .map(|i| i as usize)
            .filter(|i| *i < self.slots.len())
            .ok_or(CacheError::NotReserved(seq))?;
        match self.slots[idx] {
            Slot::Filled(_) => return Err(CacheError::AlreadyFilled(seq)),
            Slot::Reserved => self.slots[idx] = Slot::Filled(content),
        }
        self.pending -= 1;
        self.try_complete();
        Ok(())
    }

    fn try_complete(&mut self) -> bool {
        if self.complete_requested && self.pending == 0 && !self.completed {
            self.completed = true;
        }
        self.completed
    }

    /// Filled chunks after `from_seq` up to the first reserved slot.
    fn visible_after(&self, from_seq: u64) -> Vec<Chunk> {
        let start = from_seq.min(self.slots.len() as u64) as usize;
        self.slots[start..]
            .iter()
            .enumerate()
            .map_while(|(i, slot)| match slot {
                Slot::Filled(content) => Some(Chunk {
                    seq: (start + i) as u64 + 1,
                    content: content.clone(),
                }),
                Slot::Reserved => None,
            })
            .collect()
    }
}

/// What a new inbound message gets when it reaches the cache.
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// A fresh entry was created; the caller must start the background stream for it.
    Started(TurnTicket),
    /// A stream is already running for this conversation; the message attaches as a reader.
    Attached { stream_id: String },
}

/// Everything the background stream needs to own a freshly created entry.
#[derive(Debug, Clone)]
pub struct TurnTicket {
    pub stream_id: String,
    pub cancel: CancellationToken,
    pub upstream_conversation_id: Option<String>,
}

/// Consistent view of one entry for a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub stream_id: String,
    pub chunks: Vec<Chunk>,
    pub completed: bool,
    pub placeholder: String,
}

/// Ordered, per-conversation chunk cache with idle-TTL eviction.
///
/// A completed entry replaced by a new turn moves to `retired`, keyed by its stream id, and
/// stays readable there until the sweep removes it.
pub struct StreamMessageCache {
    entries: DashMap<ConversationKey, Arc<Mutex<CacheEntry>>>,
    retired: DashMap<(ConversationKey, String), Arc<Mutex<CacheEntry>>>,
    ttl: Duration,
    drain_grace: Duration,
}

/// How long a completed entry whose final response was served stays around for redelivered polls.
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(60);

impl StreamMessageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retired: DashMap::new(),
            ttl,
            drain_grace: DEFAULT_DRAIN_GRACE.min(ttl),
        }
    }

    fn entry(&self, key: &ConversationKey) -> Result<Arc<Mutex<CacheEntry>>, CacheError> {
        self.entries
            .get(key)
            .map(|e| Arc::clone(e.value()))
            .ok_or(CacheError::UnknownKey)
    }

    /// Create the entry for a new turn, or attach to the turn still streaming for `key`.
    /// A completed entry is retired under its stream id; its upstream conversation id carries over.
    pub fn begin(&self, key: &ConversationKey, placeholder: &str) -> BeginOutcome {
        let now = Instant::now();
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let (carried, old_stream_id) = {
                    let mut entry = occupied.get().lock();
                    if !entry.completed {
                        entry.last_access = now;
                        return BeginOutcome::Attached {
                            stream_id: entry.stream_id.clone(),
                        };
                    }
                    (entry.upstream_conversation_id.clone(), entry.stream_id.clone())
                };
                let fresh = CacheEntry::new(placeholder, carried, now);
                let ticket = ticket_for(&fresh);
                let previous = occupied.insert(Arc::new(Mutex::new(fresh)));
                self.retired.insert((key.clone(), old_stream_id), previous);
                BeginOutcome::Started(ticket)
            }
            Entry::Vacant(vacant) => {
                let fresh = CacheEntry::new(placeholder, None, now);
                let ticket = ticket_for(&fresh);
                vacant.insert(Arc::new(Mutex::new(fresh)));
                BeginOutcome::Started(ticket)
            }
        }
    }

    /// Assign the next sequence number to `content` and append it at the tail.
    pub fn append(&self, key: &ConversationKey, content: ChunkContent) -> Result<u64, CacheError> {
        let entry = self.entry(key)?;
        let mut entry = entry.lock();
        entry.push(Slot::Filled(content))
    }

    /// Allocate a placeholder seq whose content is filled later.
    pub fn reserve(&self, key: &ConversationKey) -> Result<u64, CacheError> {
        let entry = self.entry(key)?;
        let mut entry = entry.lock();
        entry.push(Slot::Reserved)
    }

    /// Fill a reserved placeholder in place. Completes the entry if this was the last
    /// outstanding placeholder and completion was already requested.
    pub fn fill(
        &self,
        key: &ConversationKey,
        seq: u64,
        content: ChunkContent,
    ) -> Result<(), CacheError> {
        let entry = self.entry(key)?;
        let mut entry = entry.lock();
        entry.fill(seq, content)
    }

    /// Fill every outstanding placeholder with `content`. Returns how many were filled.
    pub fn fill_pending(&self, key: &ConversationKey, content: ChunkContent) -> Result<usize, CacheError> {
        let entry = self.entry(key)?;
        let mut entry = entry.lock();
        let reserved: Vec<u64> = entry
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Slot::Reserved))
            .map(|(i, _)| i as u64 + 1)
            .collect();
        for seq in &reserved {
            entry.fill(*seq, content.clone())?;
        }
        Ok(reserved.len())
    }

    /// Request completion. Takes effect immediately when no placeholder is outstanding,
    /// otherwise when the last one is filled. Returns whether the entry is now completed.
    pub fn mark_complete(&self, key: &ConversationKey) -> Result<bool, CacheError> {
        let entry = self.entry(key)?;
        let mut entry = entry.lock();
        entry.complete_requested = true;
        Ok(entry.try_complete())
    }

    /// Chunks with seq greater than `from_seq` (contiguous filled prefix only) plus the completion flag.
    /// Counts as activity for the idle TTL.
    pub fn read(&self, key: &ConversationKey, from_seq: u64) -> Result<Snapshot, CacheError> {
        let entry = self.entry(key)?;
        Ok(Self::snapshot(&entry, from_seq))
    }

    /// Like [`read`](Self::read), for a specific stream: the live entry when its stream id
    /// matches (or `stream_id` is empty), otherwise a retired entry of the same conversation.
    pub fn read_stream(
        &self,
        key: &ConversationKey,
        stream_id: &str,
        from_seq: u64,
    ) -> Result<Snapshot, CacheError> {
        if let Ok(entry) = self.entry(key) {
            if stream_id.is_empty() || entry.lock().stream_id == stream_id {
                return Ok(Self::snapshot(&entry, from_seq));
            }
        }
        let retired = self
            .retired
            .get(&(key.clone(), stream_id.to_string()))
            .map(|e| Arc::clone(e.value()))
            .ok_or(CacheError::UnknownKey)?;
        Ok(Self::snapshot(&retired, from_seq))
    }

    fn snapshot(entry: &Mutex<CacheEntry>, from_seq: u64) -> Snapshot {
        let mut entry = entry.lock();
        let now = Instant::now();
        entry.last_access = now;
        let chunks = entry.visible_after(from_seq);
        if entry.completed && entry.drained_at.is_none() {
            entry.drained_at = Some(now);
        }
        Snapshot {
            stream_id: entry.stream_id.clone(),
            chunks,
            completed: entry.completed,
            placeholder: entry.placeholder.clone(),
        }
    }

    pub fn stream_id(&self, key: &ConversationKey) -> Option<String> {
        self.entry(key).ok().map(|e| e.lock().stream_id.clone())
    }

    pub fn is_completed(&self, key: &ConversationKey) -> Option<bool> {
        self.entry(key).ok().map(|e| e.lock().completed)
    }

    pub fn set_upstream_conversation_id(
        &self,
        key: &ConversationKey,
        id: impl Into<String>,
    ) -> Result<(), CacheError> {
        let entry = self.entry(key)?;
        entry.lock().upstream_conversation_id = Some(id.into());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict idle entries (and drained ones past the grace period). An entry whose lock is
    /// currently held by a writer is skipped. Evicted entries have their cancel token fired.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut evicted = 0;
        self.entries.retain(|key, entry| {
            let Some(guard) = entry.try_lock() else {
                return true;
            };
            if !self.expired(&guard, now) {
                return true;
            }
            log::debug!(
                "cache: evicting {} stream_id={} completed={} age={:?}",
                key,
                guard.stream_id,
                guard.completed,
                now.saturating_duration_since(guard.created_at)
            );
            guard.cancel.cancel();
            evicted += 1;
            false
        });
        self.retired.retain(|(key, stream_id), entry| {
            let Some(guard) = entry.try_lock() else {
                return true;
            };
            if !self.expired(&guard, now) {
                return true;
            }
            log::debug!("cache: evicting retired {} stream_id={}", key, stream_id);
            evicted += 1;
            false
        });
        evicted
    }

    /// Idle past the TTL, or drained and past the grace period.
    fn expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        let idle = now.saturating_duration_since(entry.last_access) >= self.ttl;
        let drained = entry
            .drained_at
            .map(|t| now.saturating_duration_since(t) >= self.drain_grace)
            .unwrap_or(false);
        idle || drained
    }

    /// Fire every entry's cancel token (process shutdown).
    pub fn cancel_all(&self) {
        for e in self.entries.iter() {
            e.value().lock().cancel.cancel();
        }
    }
}

fn ticket_for(entry: &CacheEntry) -> TurnTicket {
    TurnTicket {
        stream_id: entry.stream_id.clone(),
        cancel: entry.cancel.clone(),
        upstream_conversation_id: entry.upstream_conversation_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConversationKey {
        ConversationKey::new("bot", None, "alice")
    }

    fn started(cache: &StreamMessageCache, key: &ConversationKey) -> TurnTicket {
        match cache.begin(key, "thinking") {
            BeginOutcome::Started(t) => t,
            BeginOutcome::Attached { .. } => panic!("expected a fresh entry"),
        }
    }

    fn text(s: &str) -> ChunkContent {
        ChunkContent::Text(s.to_string())
    }

    #[test]
    fn key_uses_chat_for_groups_and_sender_otherwise() {
        assert_eq!(ConversationKey::new("b", Some("g1"), "u1").scope, "group:g1");
        assert_eq!(ConversationKey::new("b", Some(" "), "u1").scope, "single:u1");
        assert_eq!(ConversationKey::new("b", None, "u1").to_string(), "b/single:u1");
    }

    #[test]
    fn append_assigns_increasing_seq_from_one() {
        let cache = StreamMessageCache::new(Duration::from_secs(60));
        let k = key();
        started(&cache, &k);
        assert_eq!(cache.append(&k, text("a")).unwrap(), 1);
        assert_eq!(cache.append(&k, text("b")).unwrap(), 2);
        let snap = cache.read(&k, 0).unwrap();
        assert_eq!(snap.chunks.len(), 2);
        assert_eq!(snap.chunks[1].seq, 2);
        assert_eq!(cache.read(&k, 1).unwrap().chunks, vec![Chunk { seq: 2, content: text("b") }]);
        assert!(cache.read(&k, 5).unwrap().chunks.is_empty());
    }

    #[test]
    fn reserved_slot_hides_later_chunks_until_filled() {
        let cache = StreamMessageCache::new(Duration::from_secs(60));
        let k = key();
        started(&cache, &k);
        cache.append(&k, text("before")).unwrap();
        let img = cache.reserve(&k).unwrap();
        cache.append(&k, text("after")).unwrap();
        let snap = cache.read(&k, 0).unwrap();
        assert_eq!(snap.chunks.len(), 1);

        cache.fill(&k, img, ChunkContent::Image(vec![1, 2])).unwrap();
        let kinds: Vec<ChunkKind> = cache
            .read(&k, 0)
            .unwrap()
            .chunks
            .iter()
            .map(|c| c.content.kind())
            .collect();
        assert_eq!(kinds, vec![ChunkKind::Text, ChunkKind::Image, ChunkKind::Text]);
    }

    #[test]
    fn fill_rejects_unknown_and_double_fill() {
        let cache = StreamMessageCache::new(Duration::from_secs(60));
        let k = key();
        started(&cache, &k);
        let t = cache.append(&k, text("a")).unwrap();
        let r = cache.reserve(&k).unwrap();
        assert_eq!(cache.fill(&k, t, text("x")), Err(CacheError::AlreadyFilled(t)));
        assert_eq!(cache.fill(&k, 0, text("x")), Err(CacheError::NotReserved(0)));
        assert_eq!(cache.fill(&k, 9, text("x")), Err(CacheError::NotReserved(9)));
        cache.fill(&k, r, text("x")).unwrap();
        assert_eq!(cache.fill(&k, r, text("y")), Err(CacheError::AlreadyFilled(r)));
    }

    #[test]
    fn completion_waits_for_last_placeholder() {
        let cache = StreamMessageCache::new(Duration::from_secs(60));
        let k = key();
        started(&cache, &k);
        let a = cache.reserve(&k).unwrap();
        let b = cache.reserve(&k).unwrap();
        assert!(!cache.mark_complete(&k).unwrap());
        assert_eq!(cache.append(&k, text("late")), Err(CacheError::Completed));
        cache.fill(&k, b, text("b")).unwrap();
        assert!(!cache.read(&k, 0).unwrap().completed);
        cache.fill(&k, a, text("a")).unwrap();
        let snap = cache.read(&k, 0).unwrap();
        assert!(snap.completed);
        assert_eq!(snap.chunks.len(), 2);
    }

    #[test]
    fn fill_pending_settles_every_placeholder() {
        let cache = StreamMessageCache::new(Duration::from_secs(60));
        let k = key();
        started(&cache, &k);
        cache.reserve(&k).unwrap();
        cache.append(&k, text("t")).unwrap();
        cache.reserve(&k).unwrap();
        assert_eq!(cache.fill_pending(&k, text("fallback")).unwrap(), 2);
        assert!(cache.mark_complete(&k).unwrap());
        assert_eq!(cache.read(&k, 0).unwrap().chunks.len(), 3);
    }

    #[test]
    fn second_begin_attaches_while_streaming_and_restarts_after_completion() {
        let cache = StreamMessageCache::new(Duration::from_secs(60));
        let k = key();
        let first = started(&cache, &k);
        match cache.begin(&k, "thinking") {
            BeginOutcome::Attached { stream_id } => assert_eq!(stream_id, first.stream_id),
            BeginOutcome::Started(_) => panic!("second stream started"),
        }
        cache.set_upstream_conversation_id(&k, "conv-1").unwrap();
        cache.mark_complete(&k).unwrap();
        let second = started(&cache, &k);
        assert_ne!(second.stream_id, first.stream_id);
        assert_eq!(second.upstream_conversation_id.as_deref(), Some("conv-1"));
        assert!(cache.read(&k, 0).unwrap().chunks.is_empty());
    }

    #[test]
    fn undelivered_answer_stays_readable_after_next_turn_starts() {
        let cache = StreamMessageCache::new(Duration::from_secs(600));
        let k = key();
        let first = started(&cache, &k);
        cache.append(&k, text("answer one")).unwrap();
        cache.mark_complete(&k).unwrap();

        let second = started(&cache, &k);
        cache.append(&k, text("answer two")).unwrap();

        let old = cache.read_stream(&k, &first.stream_id, 0).unwrap();
        assert_eq!(old.stream_id, first.stream_id);
        assert!(old.completed);
        assert_eq!(old.chunks, vec![Chunk { seq: 1, content: text("answer one") }]);
        let live = cache.read_stream(&k, &second.stream_id, 0).unwrap();
        assert_eq!(live.chunks, vec![Chunk { seq: 1, content: text("answer two") }]);
        assert_eq!(cache.read_stream(&k, "other", 0), Err(CacheError::UnknownKey));
        assert_eq!(cache.len(), 1);

        // the retired entry drained on that read and goes after the grace period
        assert_eq!(cache.sweep_at(Instant::now()), 0);
        assert_eq!(
            cache.sweep_at(Instant::now() + DEFAULT_DRAIN_GRACE + Duration::from_secs(1)),
            1
        );
        assert_eq!(cache.read_stream(&k, &first.stream_id, 0), Err(CacheError::UnknownKey));
    }

    #[test]
    fn sweep_evicts_idle_entries_and_cancels_them() {
        let cache = StreamMessageCache::new(Duration::from_secs(10));
        let k = key();
        let ticket = started(&cache, &k);
        assert_eq!(cache.sweep_at(Instant::now() + Duration::from_secs(5)), 0);
        assert_eq!(cache.sweep_at(Instant::now() + Duration::from_secs(11)), 1);
        assert!(ticket.cancel.is_cancelled());
        assert_eq!(cache.read(&k, 0), Err(CacheError::UnknownKey));
        assert_eq!(cache.append(&k, text("x")), Err(CacheError::UnknownKey));
    }

    #[test]
    fn sweep_skips_entry_held_by_writer() {
        let cache = StreamMessageCache::new(Duration::from_secs(1));
        let k = key();
        started(&cache, &k);
        let held = cache.entry(&k).unwrap();
        let guard = held.lock();
        assert_eq!(cache.sweep_at(Instant::now() + Duration::from_secs(5)), 0);
        drop(guard);
        assert_eq!(cache.sweep_at(Instant::now() + Duration::from_secs(5)), 1);
    }

    #[test]
    fn drained_entry_is_evicted_after_grace() {
        let cache = StreamMessageCache::new(Duration::from_secs(600));
        let k = key();
        started(&cache, &k);
        cache.append(&k, text("done")).unwrap();
        cache.mark_complete(&k).unwrap();
        assert!(cache.read(&k, 0).unwrap().completed);
        assert_eq!(cache.sweep_at(Instant::now()), 0);
        assert_eq!(
            cache.sweep_at(Instant::now() + DEFAULT_DRAIN_GRACE + Duration::from_secs(1)),
            1
        );
    }

    #[test]
    fn different_keys_are_independent() {
        let cache = StreamMessageCache::new(Duration::from_secs(60));
        let a = ConversationKey::new("bot", Some("g1"), "u1");
        let b = ConversationKey::new("bot", Some("g2"), "u1");
        started(&cache, &a);
        started(&cache, &b);
        let held = cache.entry(&a).unwrap();
        let _guard = held.lock();
        assert_eq!(cache.append(&b, text("free")).unwrap(), 1);
        assert_eq!(cache.len(), 2);
    }
}
