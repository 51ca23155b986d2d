//! This module provides the [`Federation`]'s `Event`s, `EventSubscriber` and `EventPublisher`
//! types.
//!
//! [`Federation`]: crate::federation::Federation

use futures::{stream, Stream};
use tokio::sync::watch;

use crate::round::RoundPhase;

/// An event emitted by the federation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<E> {
    /// Metadata that associates this event to the round in which it is
    /// emitted. Round `0` stands for the genesis of the ledger.
    pub round_id: u64,
    /// The event itself
    pub event: E,
}

/// Global model update event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelUpdate {
    pub version: u64,
    /// The hash of the global model as anchored in the ledger.
    pub hash: String,
}

/// A convenience type to emit any federation event.
#[derive(Debug)]
pub struct EventPublisher {
    phase_tx: EventBroadcaster<RoundPhase>,
    model_tx: EventBroadcaster<ModelUpdate>,
}

/// The `EventSubscriber` hands out `EventListener`s for any
/// federation event.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    phase_rx: EventListener<RoundPhase>,
    model_rx: EventListener<ModelUpdate>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial events.
    pub fn init(round_id: u64, phase: RoundPhase, model: ModelUpdate) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel::<Event<RoundPhase>>(Event {
            round_id,
            event: phase,
        });

        let (model_tx, model_rx) = watch::channel::<Event<ModelUpdate>>(Event {
            round_id,
            event: model,
        });

        let publisher = EventPublisher {
            phase_tx: phase_tx.into(),
            model_tx: model_tx.into(),
        };

        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            model_rx: model_rx.into(),
        };

        (publisher, subscriber)
    }

    /// Emit a phase event
    pub fn broadcast_phase(&self, round_id: u64, phase: RoundPhase) {
        self.phase_tx.broadcast(Event {
            round_id,
            event: phase,
        });
    }

    /// Emit a model event
    pub fn broadcast_model(&self, round_id: u64, update: ModelUpdate) {
        self.model_tx.broadcast(Event {
            round_id,
            event: update,
        });
    }

    /// Get a new subscriber for the events of this publisher.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            phase_rx: self.phase_tx.0.subscribe().into(),
            model_rx: self.model_tx.0.subscribe().into(),
        }
    }
}

impl EventSubscriber {
    /// Get a listener for new phase events
    pub fn phase_listener(&self) -> EventListener<RoundPhase> {
        self.phase_rx.clone()
    }

    /// Get a listener for new model events
    pub fn model_listener(&self) -> EventListener<ModelUpdate> {
        self.model_rx.clone()
    }
}

/// A listener for federation events. It can be used to either
/// retrieve the latest `Event<E>` emitted by the federation (with
/// `EventListener::get_latest`) or to wait for events (with
/// `EventListener::changed` or as a stream).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for the next event and returns it. Returns `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow().clone())
    }

    /// Turns the listener into a stream of the events that happen from now on.
    pub fn into_stream(self) -> impl Stream<Item = Event<E>> {
        stream::unfold(self, |mut listener| async move {
            let event = listener.changed().await?;
            Some((event, listener))
        })
    }
}

/// A channel to send `Event<E>` to all the `EventListener<E>`.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Send `event` to all the `EventListener<E>`
    fn broadcast(&self, event: Event<E>) {
        // We don't care whether there's a listener or not
        self.0.send_replace(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn genesis() -> ModelUpdate {
        ModelUpdate {
            version: 0,
            hash: "genesis".into(),
        }
    }

    #[tokio::test]
    async fn test_latest_event() {
        let (publisher, subscriber) = EventPublisher::init(0, RoundPhase::Completed, genesis());
        let listener = subscriber.phase_listener();
        assert_eq!(listener.get_latest().event, RoundPhase::Completed);

        publisher.broadcast_phase(1, RoundPhase::InProgress);
        let latest = listener.get_latest();
        assert_eq!(latest.round_id, 1);
        assert_eq!(latest.event, RoundPhase::InProgress);
    }

    #[tokio::test]
    async fn test_stream_of_events() {
        let (publisher, subscriber) = EventPublisher::init(0, RoundPhase::Completed, genesis());
        let mut models = subscriber.model_listener().into_stream().boxed();
        publisher.broadcast_model(
            1,
            ModelUpdate {
                version: 1,
                hash: "model-1".into(),
            },
        );
        let event = models.next().await.unwrap();
        assert_eq!(event.round_id, 1);
        assert_eq!(event.event.hash, "model-1");

        drop(publisher);
        assert!(models.next().await.is_none());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_the_latest_event() {
        let (publisher, _) = EventPublisher::init(0, RoundPhase::Completed, genesis());
        publisher.broadcast_phase(3, RoundPhase::Aggregating);
        let subscriber = publisher.subscribe();
        assert_eq!(
            subscriber.phase_listener().get_latest(),
            Event {
                round_id: 3,
                event: RoundPhase::Aggregating,
            },
        );
    }
}
