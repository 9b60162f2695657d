// Copyright 2026 The Parapet Project
// SPDX-License-Identifier: Apache-2.0

// Event broker: one logical channel per in-flight message.
//
// Responsibilities:
// - Append published events to the channel backlog in publish order
// - Fan out to every attached subscriber; late subscribers replay the
//   backlog and then follow live without gaps or duplicates
// - Track terminal state (`completed` / `error`); later publishes are no-ops
// - Retire terminal channels after the last subscriber leaves or the grace
//   period elapses
// - Deliver heartbeats live only; they never enter the backlog

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::event::{codes, Message, StatusState, StreamEvent};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("channel already exists for message {0}")]
    AlreadyExists(String),

    #[error("no channel for message {0}")]
    UnknownChannel(String),
}

/// Result of a heartbeat attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    Sent,
    /// Channel open but nobody is listening.
    Idle,
    Terminal,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

struct ChannelState {
    backlog: Vec<StreamEvent>,
    terminal: bool,
    subscribers: usize,
    heartbeats: u64,
}

struct Channel {
    message_id: String,
    request_id: String,
    state: Mutex<ChannelState>,
    /// Bumped after every append or heartbeat.
    notify: watch::Sender<u64>,
    /// Cancelled once the channel turns terminal.
    finished: CancellationToken,
}

impl Channel {
    fn new(message: &Message) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            message_id: message.message_id.clone(),
            request_id: message.request_id.to_string(),
            state: Mutex::new(ChannelState {
                backlog: Vec::new(),
                terminal: false,
                subscribers: 0,
                heartbeats: 0,
            }),
            notify,
            finished: CancellationToken::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append under the channel lock. Returns false once terminal.
    fn append(&self, event: StreamEvent) -> bool {
        let terminal = event.is_terminal();
        {
            let mut state = self.state();
            if state.terminal {
                return false;
            }
            state.backlog.push(event);
            state.terminal = terminal;
        }
        self.notify.send_modify(|version| *version += 1);
        if terminal {
            self.finished.cancel();
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Owns every live channel, keyed by message id. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    channels: Arc<DashMap<String, Arc<Channel>>>,
    retire_grace: Duration,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("channels", &self.channels.len())
            .field("retire_grace", &self.retire_grace)
            .finish()
    }
}

impl Broker {
    pub fn new(retire_grace: Duration) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            retire_grace,
        }
    }

    /// Open a channel for a freshly accepted message and publish
    /// `status{queued}` into it.
    pub fn create_channel(&self, message: &Message) -> Result<Publisher, BrokerError> {
        let channel = match self.channels.entry(message.message_id.clone()) {
            Entry::Occupied(_) => {
                return Err(BrokerError::AlreadyExists(message.message_id.clone()))
            }
            Entry::Vacant(slot) => {
                let channel = Arc::new(Channel::new(message));
                slot.insert(Arc::clone(&channel));
                channel
            }
        };
        tracing::debug!(message_id = %message.message_id, "channel created");

        let publisher = Publisher {
            broker: self.clone(),
            channel,
        };
        publisher.publish(StreamEvent::Status {
            state: StatusState::Queued,
        });
        Ok(publisher)
    }

    /// Publish by message id. Silently ignored once the channel is terminal.
    pub fn publish(&self, message_id: &str, event: StreamEvent) -> Result<(), BrokerError> {
        let channel = self.lookup(message_id)?;
        self.append(&channel, event);
        Ok(())
    }

    /// Attach a subscriber: backlog first, then live events until terminal.
    pub fn subscribe(&self, message_id: &str) -> Result<Subscription, BrokerError> {
        let channel = self.lookup(message_id)?;
        let heartbeats = {
            let mut state = channel.state();
            state.subscribers += 1;
            state.heartbeats
        };
        let cursor = Cursor {
            notified: channel.notify.subscribe(),
            attachment: Attachment {
                broker: self.clone(),
                channel,
            },
            next: 0,
            heartbeats,
        };
        Ok(Subscription {
            inner: stream::unfold(cursor, Cursor::step).boxed(),
        })
    }

    /// Forced teardown. Publishes a cancellation error if the channel has not
    /// terminated yet, then retires it.
    pub fn close(&self, message_id: &str) -> Result<(), BrokerError> {
        let (_, channel) = self
            .channels
            .remove(message_id)
            .ok_or_else(|| BrokerError::UnknownChannel(message_id.to_string()))?;
        let cancelled = channel.append(StreamEvent::Error {
            error: "message cancelled".into(),
            code: codes::CANCELLED.into(),
            request_id: channel.request_id.clone(),
        });
        tracing::info!(message_id, cancelled, "channel closed");
        Ok(())
    }

    /// Deliver a heartbeat to current subscribers without recording it.
    pub fn heartbeat(&self, message_id: &str) -> Result<Beat, BrokerError> {
        let channel = self.lookup(message_id)?;
        {
            let mut state = channel.state();
            if state.terminal {
                return Ok(Beat::Terminal);
            }
            if state.subscribers == 0 {
                return Ok(Beat::Idle);
            }
            state.heartbeats += 1;
        }
        channel.notify.send_modify(|version| *version += 1);
        Ok(Beat::Sent)
    }

    /// Token cancelled when the channel turns terminal.
    pub fn finished(&self, message_id: &str) -> Result<CancellationToken, BrokerError> {
        Ok(self.lookup(message_id)?.finished.clone())
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.channels.contains_key(message_id)
    }

    pub fn is_terminal(&self, message_id: &str) -> Result<bool, BrokerError> {
        Ok(self.lookup(message_id)?.state().terminal)
    }

    pub fn subscriber_count(&self, message_id: &str) -> Result<usize, BrokerError> {
        Ok(self.lookup(message_id)?.state().subscribers)
    }

    /// Copy of everything published so far.
    pub fn backlog(&self, message_id: &str) -> Result<Vec<StreamEvent>, BrokerError> {
        Ok(self.lookup(message_id)?.state().backlog.clone())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn lookup(&self, message_id: &str) -> Result<Arc<Channel>, BrokerError> {
        self.channels
            .get(message_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BrokerError::UnknownChannel(message_id.to_string()))
    }

    fn append(&self, channel: &Arc<Channel>, event: StreamEvent) -> bool {
        let terminal = event.is_terminal();
        let name = event.name();
        if !channel.append(event) {
            tracing::debug!(message_id = %channel.message_id, event = name, "publish after terminal ignored");
            return false;
        }
        if terminal {
            tracing::debug!(message_id = %channel.message_id, event = name, "channel terminal");
            self.schedule_retire(channel);
        }
        true
    }

    fn schedule_retire(&self, channel: &Arc<Channel>) {
        if self.retire_grace.is_zero() {
            self.retire(channel);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let broker = self.clone();
                let channel = Arc::clone(channel);
                let grace = self.retire_grace;
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    broker.retire(&channel);
                });
            }
            Err(_) => self.retire(channel),
        }
    }

    /// Remove the channel from the map. Attached subscribers keep draining
    /// through their own handle.
    fn retire(&self, channel: &Arc<Channel>) {
        let removed = self
            .channels
            .remove_if(&channel.message_id, |_, current| Arc::ptr_eq(current, channel));
        if removed.is_some() {
            tracing::debug!(message_id = %channel.message_id, "channel retired");
        }
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Write handle held by the message's producer.
pub struct Publisher {
    broker: Broker,
    channel: Arc<Channel>,
}

impl Publisher {
    pub fn message_id(&self) -> &str {
        &self.channel.message_id
    }

    pub fn request_id(&self) -> &str {
        &self.channel.request_id
    }

    /// Returns false when the event was dropped because the channel had
    /// already terminated.
    pub fn publish(&self, event: StreamEvent) -> bool {
        self.broker.append(&self.channel, event)
    }

    pub fn is_terminal(&self) -> bool {
        self.channel.state().terminal
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Subscriber side of a channel. Dropping it detaches the subscriber.
pub struct Subscription {
    inner: BoxStream<'static, StreamEvent>,
}

impl futures_util::Stream for Subscription {
    type Item = StreamEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Counts the subscriber for as long as it is alive.
struct Attachment {
    broker: Broker,
    channel: Arc<Channel>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let retire = {
            let mut state = self.channel.state();
            state.subscribers = state.subscribers.saturating_sub(1);
            state.terminal && state.subscribers == 0
        };
        if retire {
            self.broker.retire(&self.channel);
        }
    }
}

enum Step {
    Event(StreamEvent),
    Heartbeat(u64),
    End,
    Wait,
}

struct Cursor {
    notified: watch::Receiver<u64>,
    attachment: Attachment,
    next: usize,
    heartbeats: u64,
}

impl Cursor {
    async fn step(mut self) -> Option<(StreamEvent, Self)> {
        loop {
            // Mark seen before reading state so no append slips between
            // the read and the wait.
            self.notified.borrow_and_update();

            let step = {
                let state = self.attachment.channel.state();
                if let Some(event) = state.backlog.get(self.next) {
                    Step::Event(event.clone())
                } else if state.terminal {
                    Step::End
                } else if state.heartbeats > self.heartbeats {
                    Step::Heartbeat(state.heartbeats)
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Event(event) => {
                    self.next += 1;
                    return Some((event, self));
                }
                Step::Heartbeat(count) => {
                    self.heartbeats = count;
                    return Some((StreamEvent::Heartbeat, self));
                }
                Step::End => return None,
                Step::Wait => {
                    if self.notified.changed().await.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn message() -> Message {
        Message::new("u1", Uuid::new_v4())
    }

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::FinalDelta { text: text.into() }
    }

    fn completed() -> StreamEvent {
        StreamEvent::Completed {
            reply: "ok".into(),
            request_id: "r".into(),
            diagnostics: vec![],
        }
    }

    #[tokio::test]
    async fn create_publishes_queued_status() {
        let broker = Broker::new(Duration::from_secs(30));
        let msg = message();
        broker.create_channel(&msg).unwrap();
        assert_eq!(
            broker.backlog(&msg.message_id).unwrap(),
            vec![StreamEvent::Status {
                state: StatusState::Queued
            }]
        );
    }

    #[tokio::test]
    async fn duplicate_channel_rejected() {
        let broker = Broker::new(Duration::from_secs(30));
        let msg = message();
        let _publisher = broker.create_channel(&msg).unwrap();
        assert_eq!(
            broker.create_channel(&msg).err(),
            Some(BrokerError::AlreadyExists(msg.message_id.clone()))
        );
    }

    #[tokio::test]
    async fn unknown_channel_is_not_created() {
        let broker = Broker::new(Duration::from_secs(30));
        assert!(matches!(
            broker.publish("missing", delta("x")),
            Err(BrokerError::UnknownChannel(_))
        ));
        assert!(matches!(
            broker.subscribe("missing"),
            Err(BrokerError::UnknownChannel(_))
        ));
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn late_subscriber_gets_backlog_then_live() {
        let broker = Broker::new(Duration::from_secs(30));
        let msg = message();
        let publisher = broker.create_channel(&msg).unwrap();
        publisher.publish(delta("a"));

        let mut sub = broker.subscribe(&msg.message_id).unwrap();
        assert!(matches!(sub.next().await, Some(StreamEvent::Status { .. })));
        assert_eq!(sub.next().await, Some(delta("a")));

        publisher.publish(delta("b"));
        publisher.publish(completed());
        assert_eq!(sub.next().await, Some(delta("b")));
        assert_eq!(sub.next().await, Some(completed()));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn publish_after_terminal_is_noop() {
        let broker = Broker::new(Duration::from_secs(30));
        let msg = message();
        let publisher = broker.create_channel(&msg).unwrap();
        assert!(publisher.publish(completed()));
        assert!(!publisher.publish(delta("late")));
        broker.publish(&msg.message_id, delta("later")).unwrap();

        let backlog = broker.backlog(&msg.message_id).unwrap();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog.last(), Some(&completed()));
        assert!(broker.is_terminal(&msg.message_id).unwrap());
        assert!(broker.finished(&msg.message_id).unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn subscribers_see_identical_sequences() {
        let broker = Broker::new(Duration::from_secs(30));
        let msg = message();
        let publisher = broker.create_channel(&msg).unwrap();
        let first = broker.subscribe(&msg.message_id).unwrap();

        let producer = tokio::spawn(async move {
            for i in 0..50 {
                publisher.publish(delta(&i.to_string()));
                tokio::task::yield_now().await;
            }
            publisher.publish(completed());
        });

        let second = broker.subscribe(&msg.message_id).unwrap();
        let (a, b) = tokio::join!(first.collect::<Vec<_>>(), second.collect::<Vec<_>>());
        producer.await.unwrap();

        assert_eq!(a.len(), 52);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn last_detach_after_terminal_retires() {
        let broker = Broker::new(Duration::from_secs(30));
        let msg = message();
        let publisher = broker.create_channel(&msg).unwrap();
        let sub = broker.subscribe(&msg.message_id).unwrap();
        assert_eq!(broker.subscriber_count(&msg.message_id).unwrap(), 1);

        publisher.publish(completed());
        assert!(broker.contains(&msg.message_id));
        let events: Vec<_> = sub.collect().await;
        assert_eq!(events.len(), 2);
        assert!(!broker.contains(&msg.message_id));
    }

    #[tokio::test]
    async fn detach_before_terminal_keeps_channel() {
        let broker = Broker::new(Duration::from_secs(30));
        let msg = message();
        let _publisher = broker.create_channel(&msg).unwrap();
        drop(broker.subscribe(&msg.message_id).unwrap());
        assert!(broker.contains(&msg.message_id));
        assert_eq!(broker.subscriber_count(&msg.message_id).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_channel_retired_after_grace() {
        let broker = Broker::new(Duration::from_secs(30));
        let msg = message();
        let publisher = broker.create_channel(&msg).unwrap();
        publisher.publish(completed());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(broker.contains(&msg.message_id));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!broker.contains(&msg.message_id));
    }

    #[tokio::test]
    async fn close_publishes_cancellation() {
        let broker = Broker::new(Duration::from_secs(30));
        let msg = message();
        let publisher = broker.create_channel(&msg).unwrap();
        let sub = broker.subscribe(&msg.message_id).unwrap();

        broker.close(&msg.message_id).unwrap();
        assert!(!broker.contains(&msg.message_id));
        assert!(publisher.is_terminal());
        assert!(!publisher.publish(delta("late")));

        let events: Vec<_> = sub.collect().await;
        match events.last() {
            Some(StreamEvent::Error {
                code, request_id, ..
            }) => {
                assert_eq!(code, codes::CANCELLED);
                assert_eq!(request_id, &msg.request_id.to_string());
            }
            other => panic!("expected cancellation error, got {other:?}"),
        }
        assert_eq!(
            broker.close(&msg.message_id),
            Err(BrokerError::UnknownChannel(msg.message_id.clone()))
        );
    }

    #[tokio::test]
    async fn heartbeats_are_live_only() {
        let broker = Broker::new(Duration::from_secs(30));
        let msg = message();
        let publisher = broker.create_channel(&msg).unwrap();
        assert_eq!(broker.heartbeat(&msg.message_id).unwrap(), Beat::Idle);

        let mut sub = broker.subscribe(&msg.message_id).unwrap();
        assert!(matches!(sub.next().await, Some(StreamEvent::Status { .. })));
        assert_eq!(broker.heartbeat(&msg.message_id).unwrap(), Beat::Sent);
        assert_eq!(sub.next().await, Some(StreamEvent::Heartbeat));

        // A later subscriber never replays it
        let late: Vec<_> = {
            let late = broker.subscribe(&msg.message_id).unwrap();
            publisher.publish(completed());
            late.collect().await
        };
        assert!(!late.contains(&StreamEvent::Heartbeat));
        assert_eq!(broker.heartbeat(&msg.message_id).unwrap(), Beat::Terminal);
    }
}
