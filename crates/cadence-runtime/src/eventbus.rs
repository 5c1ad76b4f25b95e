//! Event bus collaborator (component L, §4.L): an append-only ordered log
//! with consumer-group semantics, specified only as a collaborator interface
//! (spec.md §1 non-goal: "the event-publish log ... is specified only as a
//! collaborator interface"). The in-memory implementation here exists so
//! `publish_event` and event-kind task triggers are runnable end to end; a
//! durable, partitioned, Redis-Streams-compatible implementation is
//! explicitly out of scope.
//!
//! Grounded on the teacher's `EventStore`/`SequencedEvent` append-log shape
//! (`oris_runtime::kernel::event_store::InMemoryEventStore`): one monotonic
//! `Seq` per append, `scan`/`poll` returning everything at-or-after a given
//! sequence. This generalizes that single-run log to many named topics, and
//! adds named consumer-group offsets on top.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use cadence_kernel::{KernelError, Seq, Value};

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Appends `payload` to `topic`'s log, returning its assigned sequence.
    async fn publish(&self, topic: &str, payload: Value) -> Result<Seq, KernelError>;

    /// Returns up to `max` entries for `group`'s unacknowledged position in
    /// `topic`, oldest first.
    async fn poll(&self, group: &str, topic: &str, max: usize) -> Result<Vec<(Seq, Value)>, KernelError>;

    /// Advances `group`'s offset in `topic` past `seq`.
    async fn ack(&self, group: &str, topic: &str, seq: Seq) -> Result<(), KernelError>;
}

#[derive(Default)]
struct TopicLog {
    entries: Vec<(Seq, Value)>,
}

/// Reference `EventBus`, durable only for the lifetime of the process.
#[derive(Default)]
pub struct InMemoryEventBus {
    topics: Mutex<HashMap<String, TopicLog>>,
    /// `(group, topic) -> next unacked seq`.
    offsets: Mutex<HashMap<(String, String), Seq>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<Seq, KernelError> {
        let mut topics = self.topics.lock().unwrap();
        let log = topics.entry(topic.to_string()).or_default();
        let seq = log.entries.last().map(|(s, _)| s.next()).unwrap_or(Seq(1));
        log.entries.push((seq, payload));
        Ok(seq)
    }

    async fn poll(&self, group: &str, topic: &str, max: usize) -> Result<Vec<(Seq, Value)>, KernelError> {
        let topics = self.topics.lock().unwrap();
        let Some(log) = topics.get(topic) else {
            return Ok(Vec::new());
        };
        let offsets = self.offsets.lock().unwrap();
        let from = offsets.get(&(group.to_string(), topic.to_string())).copied().unwrap_or(Seq(1));
        Ok(log
            .entries
            .iter()
            .filter(|(seq, _)| *seq >= from)
            .take(max)
            .cloned()
            .collect())
    }

    async fn ack(&self, group: &str, topic: &str, seq: Seq) -> Result<(), KernelError> {
        let mut offsets = self.offsets.lock().unwrap();
        offsets.insert((group.to_string(), topic.to_string()), seq.next());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_assigns_monotonically_increasing_seq() {
        let bus = InMemoryEventBus::new();
        let s1 = bus.publish("events.task", json!({"n": 1})).await.unwrap();
        let s2 = bus.publish("events.task", json!({"n": 2})).await.unwrap();
        assert_eq!(s1, Seq(1));
        assert_eq!(s2, Seq(2));
    }

    #[tokio::test]
    async fn poll_without_ack_replays_from_group_start() {
        let bus = InMemoryEventBus::new();
        bus.publish("t", json!(1)).await.unwrap();
        bus.publish("t", json!(2)).await.unwrap();

        let first_poll = bus.poll("g1", "t", 10).await.unwrap();
        assert_eq!(first_poll.len(), 2);

        let second_poll = bus.poll("g1", "t", 10).await.unwrap();
        assert_eq!(second_poll, first_poll, "no ack yet, same entries replay");
    }

    #[tokio::test]
    async fn ack_advances_group_offset_past_acked_entry() {
        let bus = InMemoryEventBus::new();
        let s1 = bus.publish("t", json!(1)).await.unwrap();
        bus.publish("t", json!(2)).await.unwrap();

        bus.ack("g1", "t", s1).await.unwrap();
        let remaining = bus.poll("g1", "t", 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1, json!(2));
    }

    #[tokio::test]
    async fn independent_consumer_groups_track_independent_offsets() {
        let bus = InMemoryEventBus::new();
        let s1 = bus.publish("t", json!(1)).await.unwrap();
        bus.publish("t", json!(2)).await.unwrap();

        bus.ack("g1", "t", s1).await.unwrap();
        assert_eq!(bus.poll("g1", "t", 10).await.unwrap().len(), 1);
        assert_eq!(bus.poll("g2", "t", 10).await.unwrap().len(), 2, "g2 never acked");
    }
}
