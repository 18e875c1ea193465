use super::stomp::StompFrame;
use crate::error::Result;
use log::*;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A decoded MESSAGE frame, as handed to subscription handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub message_id: Option<String>,
    pub body: Value,
}

pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync + 'static>;

/// Anything that can put a frame on the wire for the current session.
pub trait FrameSink {
    fn send_frame(&self, frame: &StompFrame) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Requested while no session was ready.
    Pending,
    /// SUBSCRIBE sent on the live session.
    Active,
    /// Was active on a session that has since been torn down.
    NeedsResubscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    AlreadyActive,
    AlreadyQueued,
    Queued,
    Sent,
}

struct SubscriptionEntry {
    id: String,
    topic: String,
    handler: MessageHandler,
    state: SubscriptionState,
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("state", &self.state)
            .finish()
    }
}

impl SubscriptionEntry {
    fn activate(&mut self, sink: &dyn FrameSink) -> Result<()> {
        sink.send_frame(&StompFrame::subscribe(&self.id, &self.topic))?;
        self.state = SubscriptionState::Active;
        Ok(())
    }
}

/// Topic subscriptions in request order, one entry per distinct topic.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<SubscriptionEntry>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `topic`.
    ///
    /// With no `sink` (not connected) the request is queued unless the topic
    /// is already known. With a sink the SUBSCRIBE frame goes out right away.
    /// A topic that is already active is left untouched.
    pub fn subscribe(
        &mut self,
        topic: &str,
        handler: MessageHandler,
        sink: Option<&dyn FrameSink>,
    ) -> SubscribeOutcome {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.topic == topic) {
            return match (entry.state, sink) {
                (SubscriptionState::Active, _) => SubscribeOutcome::AlreadyActive,
                (_, None) => SubscribeOutcome::AlreadyQueued,
                (_, Some(sink)) => match entry.activate(sink) {
                    Ok(()) => SubscribeOutcome::Sent,
                    Err(e) => {
                        warn!("Failed to send SUBSCRIBE for '{}': {}", topic, e);
                        SubscribeOutcome::AlreadyQueued
                    }
                },
            };
        }

        self.next_id += 1;
        let mut entry = SubscriptionEntry {
            id: format!("sub-{}", self.next_id),
            topic: topic.to_string(),
            handler,
            state: SubscriptionState::Pending,
        };
        let outcome = match sink {
            Some(sink) => match entry.activate(sink) {
                Ok(()) => SubscribeOutcome::Sent,
                Err(e) => {
                    warn!(
                        "Failed to send SUBSCRIBE for '{}': {}. Queued for next connection.",
                        topic, e
                    );
                    SubscribeOutcome::Queued
                }
            },
            None => SubscribeOutcome::Queued,
        };
        debug!("Subscription {} for '{}': {:?}", entry.id, topic, outcome);
        self.entries.push(entry);
        outcome
    }

    /// Sends SUBSCRIBE for every entry that is not active, in request order.
    ///
    /// Stops at the first send failure, leaving the rest queued.
    pub fn flush_pending(&mut self, sink: &dyn FrameSink) -> usize {
        let mut flushed = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.state != SubscriptionState::Active)
        {
            if let Err(e) = entry.activate(sink) {
                warn!(
                    "Failed to flush subscription '{}': {}. Remaining entries stay queued.",
                    entry.topic, e
                );
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            info!("Flushed {} pending subscriptions.", flushed);
        }
        flushed
    }

    /// Session teardown: every active entry must be replayed on the next session.
    pub fn mark_needs_resubscribe(&mut self) {
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.state == SubscriptionState::Active)
        {
            entry.state = SubscriptionState::NeedsResubscribe;
        }
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    /// Drops `topic` whatever its state. Returns whether it was present.
    pub fn unsubscribe(&mut self, topic: &str, sink: Option<&dyn FrameSink>) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.topic == topic) else {
            return false;
        };
        let entry = self.entries.remove(pos);
        if let (SubscriptionState::Active, Some(sink)) = (entry.state, sink) {
            if let Err(e) = sink.send_frame(&StompFrame::unsubscribe(&entry.id)) {
                warn!("Failed to send UNSUBSCRIBE for '{}': {}", topic, e);
            }
        }
        true
    }

    /// Finds the handler for a MESSAGE frame, by subscription id first and
    /// then by destination.
    pub fn handler_for(
        &self,
        subscription_id: Option<&str>,
        destination: Option<&str>,
    ) -> Option<(String, MessageHandler)> {
        subscription_id
            .and_then(|id| self.entries.iter().find(|e| e.id == id))
            .or_else(|| destination.and_then(|d| self.entries.iter().find(|e| e.topic == d)))
            .map(|e| (e.topic.clone(), Arc::clone(&e.handler)))
    }

    pub fn state_of(&self, topic: &str) -> Option<SubscriptionState> {
        self.entries
            .iter()
            .find(|e| e.topic == topic)
            .map(|e| e.state)
    }

    /// Topics and states in request order.
    pub fn snapshot(&self) -> Vec<(String, SubscriptionState)> {
        self.entries
            .iter()
            .map(|e| (e.topic.clone(), e.state))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RealtimeError;
    use crate::websocket::stomp::Command;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<StompFrame>>,
        fail_after: Option<usize>,
    }

    impl RecordingSink {
        fn destinations(&self, command: Command) -> Vec<String> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.command == command)
                .filter_map(|f| {
                    f.get_header("destination")
                        .or_else(|| f.get_header("id"))
                        .map(String::from)
                })
                .collect()
        }
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: &StompFrame) -> Result<()> {
            let mut frames = self.frames.lock().unwrap();
            if self.fail_after.map_or(false, |n| frames.len() >= n) {
                return Err(RealtimeError::SendRejected("sink closed".to_string()));
            }
            frames.push(frame.clone());
            Ok(())
        }
    }

    fn noop() -> MessageHandler {
        Arc::new(|_| {})
    }

    #[test]
    fn test_duplicate_pending_subscribe_is_queued_once() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(
            registry.subscribe("/topic/a", noop(), None),
            SubscribeOutcome::Queued
        );
        assert_eq!(
            registry.subscribe("/topic/a", noop(), None),
            SubscribeOutcome::AlreadyQueued
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.state_of("/topic/a"),
            Some(SubscriptionState::Pending)
        );
    }

    #[test]
    fn test_flush_is_fifo_without_loss_or_duplication() {
        let mut registry = SubscriptionRegistry::new();
        for topic in ["/topic/c", "/topic/a", "/topic/b", "/topic/a"] {
            registry.subscribe(topic, noop(), None);
        }
        let sink = RecordingSink::default();

        assert_eq!(registry.flush_pending(&sink), 3);
        assert_eq!(
            sink.destinations(Command::Subscribe),
            vec!["/topic/c", "/topic/a", "/topic/b"]
        );
        assert!(registry
            .snapshot()
            .iter()
            .all(|(_, s)| *s == SubscriptionState::Active));

        // Nothing left to flush.
        assert_eq!(registry.flush_pending(&sink), 0);
        assert_eq!(sink.destinations(Command::Subscribe).len(), 3);
    }

    #[test]
    fn test_subscribe_when_connected_sends_immediately() {
        let mut registry = SubscriptionRegistry::new();
        let sink = RecordingSink::default();
        assert_eq!(
            registry.subscribe("/topic/a", noop(), Some(&sink)),
            SubscribeOutcome::Sent
        );
        assert_eq!(
            registry.subscribe("/topic/a", noop(), Some(&sink)),
            SubscribeOutcome::AlreadyActive
        );
        assert_eq!(sink.destinations(Command::Subscribe), vec!["/topic/a"]);
    }

    #[test]
    fn test_teardown_requeues_active_entries() {
        let mut registry = SubscriptionRegistry::new();
        let first = RecordingSink::default();
        registry.subscribe("/topic/a", noop(), Some(&first));
        registry.subscribe("/topic/b", noop(), None);

        registry.mark_needs_resubscribe();
        assert_eq!(
            registry.snapshot(),
            vec![
                ("/topic/a".to_string(), SubscriptionState::NeedsResubscribe),
                ("/topic/b".to_string(), SubscriptionState::Pending),
            ]
        );
        assert_eq!(
            registry.subscribe("/topic/a", noop(), None),
            SubscribeOutcome::AlreadyQueued
        );

        let second = RecordingSink::default();
        assert_eq!(registry.flush_pending(&second), 2);
        assert_eq!(
            second.destinations(Command::Subscribe),
            vec!["/topic/a", "/topic/b"]
        );
    }

    #[test]
    fn test_flush_stops_on_send_failure() {
        let mut registry = SubscriptionRegistry::new();
        for topic in ["/topic/a", "/topic/b", "/topic/c"] {
            registry.subscribe(topic, noop(), None);
        }
        let sink = RecordingSink {
            fail_after: Some(1),
            ..Default::default()
        };
        assert_eq!(registry.flush_pending(&sink), 1);
        assert_eq!(registry.state_of("/topic/a"), Some(SubscriptionState::Active));
        assert_eq!(registry.state_of("/topic/b"), Some(SubscriptionState::Pending));
        assert_eq!(registry.state_of("/topic/c"), Some(SubscriptionState::Pending));
    }

    #[test]
    fn test_unsubscribe_removes_from_any_state() {
        let mut registry = SubscriptionRegistry::new();
        let sink = RecordingSink::default();
        registry.subscribe("/topic/pending", noop(), None);
        registry.subscribe("/topic/active", noop(), Some(&sink));

        assert!(registry.unsubscribe("/topic/pending", Some(&sink)));
        assert!(registry.unsubscribe("/topic/active", Some(&sink)));
        assert!(!registry.unsubscribe("/topic/missing", Some(&sink)));
        assert!(registry.is_empty());
        // Only the active entry needed an UNSUBSCRIBE on the wire.
        assert_eq!(sink.destinations(Command::Unsubscribe), vec!["sub-2"]);
    }

    #[test]
    fn test_handler_lookup_by_id_then_destination() {
        let mut registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        registry.subscribe(
            "/topic/a",
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );

        let (topic, handler) = registry.handler_for(Some("sub-1"), None).unwrap();
        assert_eq!(topic, "/topic/a");
        handler(InboundMessage {
            topic,
            message_id: None,
            body: Value::Null,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(registry.handler_for(Some("sub-9"), Some("/topic/a")).is_some());
        assert!(registry.handler_for(Some("sub-9"), Some("/topic/z")).is_none());
    }
}
