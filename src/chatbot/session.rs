//! One chat room: the ordered message log, duplicate consolidation and fan-out.
//!
//! Several bots sitting in the same group each receive their own copy of every
//! inbound message, sometimes with different metadata. The first copy to
//! arrive waits a short window for its siblings, merges them, and appends the
//! result to the log exactly once. Every append is then pushed to all
//! subscribed personas.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chatbot::message::{ChatIdentity, ChatMessage};
use crate::chatbot::timing::Clock;

/// The log is trimmed once it grows past this many messages...
pub const LOG_CAP: usize = 500;
/// ...back down to this many.
pub const LOG_FLOOR: usize = 200;
/// How long the first copy of a message waits for duplicates.
pub const CONSOLIDATION_WINDOW: Duration = Duration::from_secs(2);
/// Messages older than session start minus this are platform backlog.
const STALE_GRACE_SECS: i64 = 30;
const CLOSE_GRACE: Duration = Duration::from_millis(100);
/// Appended ids remembered for duplicate rejection.
const LEDGER_CAPACITY: usize = 4096;

/// Chooses one message out of several copies of the same inbound event.
pub trait MergePolicy: Send + Sync {
    /// `copies` are in arrival order. Returns `None` only when empty.
    fn merge(&self, copies: Vec<ChatMessage>) -> Option<ChatMessage>;
}

/// Prefer a copy that knows what it replies to, else the most recent one.
pub struct PreferReplyTarget;

impl MergePolicy for PreferReplyTarget {
    fn merge(&self, copies: Vec<ChatMessage>) -> Option<ChatMessage> {
        let with_target = copies
            .iter()
            .filter(|m| m.reply_to_id.is_some())
            .max_by_key(|m| m.timestamp);
        with_target
            .or_else(|| copies.iter().max_by_key(|m| m.timestamp))
            .cloned()
    }
}

/// Long-term storage for appended messages.
pub trait MessageArchive: Send + Sync {
    fn archive(&self, chat: &ChatIdentity, message: &ChatMessage) -> Result<(), String>;
}

/// Handle returned by [`ChatSession::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    name: String,
    tx: mpsc::UnboundedSender<ChatMessage>,
}

#[derive(Default)]
struct MessageLog {
    /// Sorted by timestamp, oldest first.
    messages: Vec<ChatMessage>,
    ledger: HashSet<String>,
    ledger_order: VecDeque<String>,
}

impl MessageLog {
    fn contains(&self, id: &str) -> bool {
        self.ledger.contains(id)
    }

    /// Returns false if the id was already appended.
    fn insert(&mut self, message: ChatMessage) -> bool {
        if !self.ledger.insert(message.id.clone()) {
            return false;
        }
        self.ledger_order.push_back(message.id.clone());
        while self.ledger_order.len() > LEDGER_CAPACITY {
            if let Some(old) = self.ledger_order.pop_front() {
                self.ledger.remove(&old);
            }
        }

        let pos = self.messages.partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(pos, message);

        if self.messages.len() > LOG_CAP {
            let excess = self.messages.len() - LOG_FLOOR;
            self.messages.drain(..excess);
            debug!("Trimmed {} old messages", excess);
        }
        true
    }
}

pub struct ChatSession {
    identity: ChatIdentity,
    created_at: DateTime<Utc>,
    merge: Arc<dyn MergePolicy>,
    archive: Option<Arc<dyn MessageArchive>>,
    log: RwLock<MessageLog>,
    /// Copies collected per message id while its consolidation window is open.
    pending: Mutex<HashMap<String, Vec<ChatMessage>>>,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
    next_subscription: AtomicU64,
    closed: AtomicBool,
    closing: CancellationToken,
}

impl ChatSession {
    pub fn new(identity: ChatIdentity, clock: &dyn Clock) -> Self {
        Self {
            identity,
            created_at: clock.now(),
            merge: Arc::new(PreferReplyTarget),
            archive: None,
            log: RwLock::new(MessageLog::default()),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closing: CancellationToken::new(),
        }
    }

    pub fn with_merge_policy(mut self, merge: Arc<dyn MergePolicy>) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn MessageArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Seed the log with earlier history. Nothing is broadcast or archived.
    pub fn with_history(self, history: Vec<ChatMessage>) -> Self {
        {
            let mut log = self.write_log();
            for message in history {
                log.insert(message);
            }
        }
        self
    }

    pub fn identity(&self) -> &ChatIdentity {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Accept a message delivered by the platform.
    ///
    /// Returns the merged message if this call appended it, `None` if the
    /// message was dropped or another concurrent call owns its consolidation.
    pub async fn handle_inbound(&self, message: ChatMessage) -> Option<ChatMessage> {
        if self.is_closed() {
            return None;
        }
        if message.timestamp < self.created_at - TimeDelta::seconds(STALE_GRACE_SECS) {
            debug!("Dropping stale message {} in {}", message.id, self.identity);
            return None;
        }
        if self.read_log().contains(&message.id) {
            debug!("Message {} already in {}", message.id, self.identity);
            return None;
        }

        let id = message.id.clone();
        {
            let mut pending = lock(&self.pending);
            let copies = pending.entry(id.clone()).or_default();
            copies.push(message);
            if copies.len() > 1 {
                return None;
            }
        }

        tokio::select! {
            _ = self.closing.cancelled() => {
                lock(&self.pending).remove(&id);
                return None;
            }
            _ = sleep(CONSOLIDATION_WINDOW) => {}
        }

        let copies = lock(&self.pending).remove(&id).unwrap_or_default();
        if copies.len() > 1 {
            debug!("Consolidated {} copies of {} in {}", copies.len(), id, self.identity);
        }
        let merged = self.merge.merge(copies)?;
        if self.append(merged.clone()) {
            Some(merged)
        } else {
            None
        }
    }

    /// Append a message directly (a persona's own answer) and broadcast it.
    ///
    /// Returns false if the session is closed or the id is already logged.
    pub fn append(&self, message: ChatMessage) -> bool {
        {
            let mut log = self.write_log();
            if self.is_closed() || !log.insert(message.clone()) {
                return false;
            }
            // Broadcast under the log lock so delivery order matches log order.
            self.broadcast(&message);
        }

        if let Some(ref archive) = self.archive
            && let Err(e) = archive.archive(&self.identity, &message)
        {
            warn!("Failed to archive message {}: {}", message.id, e);
        }
        true
    }

    /// Copy of the log, ordered by timestamp.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.read_log().messages.clone()
    }

    /// Receive every message appended from now on.
    pub fn subscribe(&self, name: &str) -> (SubscriptionId, mpsc::UnboundedReceiver<ChatMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        lock(&self.subscribers).insert(
            id,
            Subscriber {
                name: name.to_string(),
                tx,
            },
        );
        debug!("{} subscribed to {}", name, self.identity);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(sub) = lock(&self.subscribers).remove(&id) {
            debug!("{} unsubscribed from {}", sub.name, self.identity);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Stop accepting messages. Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closing.cancel();
            lock(&self.subscribers).clear();
            info!("Closed chat session {}", self.identity);
        }
        sleep(CLOSE_GRACE).await;
    }

    fn broadcast(&self, message: &ChatMessage) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|_, sub| {
            let delivered = sub.tx.send(message.clone()).is_ok();
            if !delivered {
                debug!("Dropping closed subscriber {}", sub.name);
            }
            delivered
        });
    }

    fn read_log(&self) -> RwLockReadGuard<'_, MessageLog> {
        self.log.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_log(&self) -> RwLockWriteGuard<'_, MessageLog> {
        self.log.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chatbot::timing::TokioClock;

    fn session() -> (Arc<ChatSession>, TokioClock) {
        let clock = TokioClock::new();
        let session = Arc::new(ChatSession::new(ChatIdentity::group("-100"), &clock));
        (session, clock)
    }

    fn msg(id: &str, text: &str, clock: &TokioClock) -> ChatMessage {
        ChatMessage::user(id, "Arthur", text, clock.now())
    }

    #[derive(Default)]
    struct RecordingArchive {
        archived: Mutex<Vec<String>>,
    }

    impl MessageArchive for RecordingArchive {
        fn archive(&self, _chat: &ChatIdentity, message: &ChatMessage) -> Result<(), String> {
            lock(&self.archived).push(message.id.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consolidates_concurrent_copies() {
        let (session, clock) = session();
        let (_, mut rx) = session.subscribe("watcher");

        let plain = msg("42", "hi", &clock);
        let targeted = plain.clone().replying_to("bot-2");
        let (a, b, c, d) = tokio::join!(
            session.handle_inbound(plain.clone()),
            session.handle_inbound(targeted.clone()),
            session.handle_inbound(plain.clone()),
            session.handle_inbound(plain.clone()),
        );

        let results: Vec<_> = [a, b, c, d].into_iter().flatten().collect();
        assert_eq!(results, vec![targeted.clone()]);
        assert_eq!(session.snapshot(), vec![targeted.clone()]);
        assert_eq!(rx.try_recv().unwrap(), targeted);
        assert!(rx.try_recv().is_err());
    }

    /// Joins the texts of all copies and records what it was given.
    #[derive(Default)]
    struct JoiningMerge {
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl MergePolicy for JoiningMerge {
        fn merge(&self, copies: Vec<ChatMessage>) -> Option<ChatMessage> {
            let texts: Vec<String> = copies.iter().map(|m| m.text.clone()).collect();
            lock(&self.calls).push(texts.clone());
            let mut merged = copies.into_iter().next()?;
            merged.text = texts.join(" | ");
            Some(merged)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_merge_policy_decides_the_logged_copy() {
        let clock = TokioClock::new();
        let policy = Arc::new(JoiningMerge::default());
        let session = ChatSession::new(ChatIdentity::group("-100"), &clock).with_merge_policy(policy.clone());
        let (_, mut rx) = session.subscribe("watcher");

        let (a, b, c) = tokio::join!(
            session.handle_inbound(msg("7", "seen by one", &clock)),
            session.handle_inbound(msg("7", "seen by two", &clock)),
            session.handle_inbound(msg("7", "seen by three", &clock)),
        );

        assert_eq!(
            *lock(&policy.calls),
            vec![vec!["seen by one", "seen by two", "seen by three"]]
        );
        let results: Vec<_> = [a, b, c].into_iter().flatten().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "seen by one | seen by two | seen by three");

        assert_eq!(session.snapshot(), results);
        assert_eq!(rx.try_recv().unwrap(), results[0]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consolidation_waits_for_window() {
        let (session, clock) = session();
        let start = tokio::time::Instant::now();
        let merged = session.handle_inbound(msg("1", "hello", &clock)).await;
        assert!(merged.is_some());
        assert!(start.elapsed() >= CONSOLIDATION_WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_duplicate_is_ignored() {
        let (session, clock) = session();
        let m = msg("1", "hello", &clock);
        assert!(session.handle_inbound(m.clone()).await.is_some());
        assert!(session.handle_inbound(m.clone()).await.is_none());
        assert!(!session.append(m));
        assert_eq!(session.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_messages_are_dropped() {
        let (session, clock) = session();
        let old = ChatMessage::user("1", "Arthur", "from yesterday", clock.now() - TimeDelta::hours(24));
        assert!(session.handle_inbound(old).await.is_none());

        let recent = ChatMessage::user("2", "Arthur", "just now", clock.now() - TimeDelta::seconds(5));
        assert!(session.handle_inbound(recent).await.is_some());
        assert_eq!(session.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_is_trimmed_to_floor() {
        let (session, clock) = session();
        let base = clock.now();
        for i in 0..LOG_CAP {
            let m = ChatMessage::user(format!("{i}"), "Arthur", "x", base + TimeDelta::seconds(i as i64));
            assert!(session.append(m));
        }
        assert_eq!(session.snapshot().len(), LOG_CAP);

        let last = ChatMessage::user("last", "Arthur", "x", base + TimeDelta::seconds(LOG_CAP as i64));
        session.append(last);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.len(), LOG_FLOOR);
        assert_eq!(snapshot.first().unwrap().id, format!("{}", LOG_CAP + 1 - LOG_FLOOR));
        assert_eq!(snapshot.last().unwrap().id, "last");
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_is_ordered_by_timestamp() {
        let (session, clock) = session();
        let now = clock.now();
        session.append(ChatMessage::user("b", "Arthur", "second", now + TimeDelta::seconds(2)));
        session.append(ChatMessage::user("a", "Arthur", "first", now + TimeDelta::seconds(1)));
        session.append(ChatMessage::user("c", "Arthur", "third", now + TimeDelta::seconds(3)));
        let ids: Vec<_> = session.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_rejects_everything() {
        let (session, clock) = session();
        let (_, mut rx) = session.subscribe("watcher");
        session.close().await;
        session.close().await;

        assert!(session.is_closed());
        assert!(session.handle_inbound(msg("1", "hi", &clock)).await.is_none());
        assert!(!session.append(msg("2", "hi", &clock)));
        assert!(session.snapshot().is_empty());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_aborts_pending_consolidation() {
        let (session, clock) = session();
        let waiting = tokio::spawn({
            let session = session.clone();
            let m = msg("1", "hi", &clock);
            async move { session.handle_inbound(m).await }
        });
        tokio::task::yield_now().await;
        session.close().await;
        assert!(waiting.await.unwrap().is_none());
        assert!(session.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_reaches_every_subscriber() {
        let (session, clock) = session();
        let (_, mut rx1) = session.subscribe("one");
        let (id2, rx2) = session.subscribe("two");
        let (_, mut rx3) = session.subscribe("three");
        drop(rx2);

        session.append(msg("1", "hi", &clock));
        assert_eq!(rx1.try_recv().unwrap().id, "1");
        assert_eq!(rx3.try_recv().unwrap().id, "1");
        // The dropped receiver was pruned without affecting the others.
        assert_eq!(session.subscriber_count(), 2);
        session.unsubscribe(id2);
        assert_eq!(session.subscriber_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_restored_silently() {
        let clock = TokioClock::new();
        let archive = Arc::new(RecordingArchive::default());
        let history = vec![
            ChatMessage::user("h1", "Arthur", "old", clock.now() - TimeDelta::days(1)),
            ChatMessage::user("h2", "Ford", "older", clock.now() - TimeDelta::days(2)),
        ];
        let session = ChatSession::new(ChatIdentity::group("-1"), &clock)
            .with_archive(archive.clone())
            .with_history(history);

        let ids: Vec<_> = session.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["h2", "h1"]);
        assert!(lock(&archive.archived).is_empty());

        session.append(msg("n1", "new", &clock));
        assert_eq!(*lock(&archive.archived), vec!["n1".to_string()]);
    }

    #[test]
    fn test_merge_prefers_reply_target_then_recency() {
        let clock = crate::chatbot::timing::ManualClock::new(Utc::now());
        let early = ChatMessage::user("1", "A", "a", clock.now());
        clock.advance(TimeDelta::seconds(1));
        let late = ChatMessage::user("1", "A", "b", clock.now());
        let targeted = early.clone().replying_to("bot");

        let merged = PreferReplyTarget.merge(vec![early.clone(), late.clone()]).unwrap();
        assert_eq!(merged, late);
        let merged = PreferReplyTarget.merge(vec![late.clone(), targeted.clone(), early]).unwrap();
        assert_eq!(merged, targeted);
        assert!(PreferReplyTarget.merge(vec![]).is_none());
    }
}
