//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others. Publishing never waits: a slow subscriber lags and loses the
//! oldest events instead of holding up the poller.
//!
//! # Topics
//!
//! Each event is routed to exactly one [`Topic`], chosen from its payload:
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Attributes`] | Polled values that moved beyond their epsilon |
//! | [`Topic::Faults`] | Communication faults and restorations, stuck transitions |
//! | [`Topic::Commands`] | Command tasks reaching a terminal status |
//! | [`Topic::State`] | Programming-state changes |
//!
//! Every event is also delivered on the global channel returned by
//! [`EventBus::subscribe`].

use tilemon_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Attributes,
    Faults,
    Commands,
    State,
}

impl Topic {
    pub fn of(payload: &EventPayload) -> Topic {
        match payload {
            EventPayload::AttributeChanged { .. } => Topic::Attributes,
            EventPayload::CommunicationFault { .. }
            | EventPayload::CommunicationRestored { .. }
            | EventPayload::StuckTransition { .. } => Topic::Faults,
            EventPayload::CommandFinished { .. } => Topic::Commands,
            EventPayload::ProgrammingStateChanged { .. } => Topic::State,
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    all: broadcast::Sender<Event>,
    attributes: broadcast::Sender<Event>,
    faults: broadcast::Sender<Event>,
    commands: broadcast::Sender<Event>,
    state: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity, applied to every
    /// channel independently.
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        let (attributes, _) = broadcast::channel(capacity);
        let (faults, _) = broadcast::channel(capacity);
        let (commands, _) = broadcast::channel(capacity);
        let (state, _) = broadcast::channel(capacity);
        Self {
            all,
            attributes,
            faults,
            commands,
            state,
        }
    }

    /// Publish `event` on its topic and on the global channel.
    ///
    /// Returns the number of receivers handed the event. Zero subscribers is
    /// a normal condition, not an error.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::of(&event.payload);
        trace!(?topic, device = %event.device(), "publish");
        let on_topic = self.topic_sender(topic).send(event.clone()).unwrap_or(0);
        on_topic + self.all.send(event).unwrap_or(0)
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Attributes => &self.attributes,
            Topic::Faults => &self.faults,
            Topic::Commands => &self.commands,
            Topic::State => &self.state,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilemon_types::{AttributeValue, CommandStatus, ProgrammingState};

    fn changed(device: &str) -> Event {
        Event::new(
            "tilemon-runtime::poller",
            EventPayload::AttributeChanged {
                device: device.into(),
                attribute: "board_temperature".into(),
                value: AttributeValue::Float(45.0),
            },
        )
    }

    fn fault(device: &str) -> Event {
        Event::new(
            "tilemon-runtime::poller",
            EventPayload::CommunicationFault {
                device: device.into(),
                consecutive_failures: 3,
                details: "connection refused".into(),
            },
        )
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(changed("tile1")), 0);
    }

    #[test]
    fn payloads_route_to_their_topic() {
        let finished = EventPayload::CommandFinished {
            device: "tile1".into(),
            task_id: tilemon_types::TaskId::nil(),
            command: "Initialise".into(),
            status: CommandStatus::Completed,
        };
        assert_eq!(Topic::of(&finished), Topic::Commands);
        let moved = EventPayload::ProgrammingStateChanged {
            device: "tile1".into(),
            from: ProgrammingState::Programmed,
            to: ProgrammingState::Initialised,
        };
        assert_eq!(Topic::of(&moved), Topic::State);
    }

    #[tokio::test]
    async fn topic_and_global_subscribers_both_receive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut faults = bus.subscribe_to(Topic::Faults);
        let mut all = bus.subscribe();

        let event = fault("tile2");
        assert_eq!(bus.publish(event.clone()), 2);

        assert_eq!(faults.recv().await?.id, event.id);
        assert_eq!(all.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn topic_subscriber_does_not_receive_other_topics() {
        let bus = EventBus::default();
        let mut faults = bus.subscribe_to(Topic::Faults);
        bus.publish(changed("tile1"));

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), faults.recv()).await;
        assert!(result.is_err(), "fault subscriber must not see attribute changes");
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::Attributes);
        for _ in 0..1_000 {
            bus.publish(changed("tile1"));
        }
        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
