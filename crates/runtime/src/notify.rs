//! Aggregate update notifications.
//!
//! After canonical events persist, the runtime broadcasts one update per
//! touched aggregate so read-side consumers (projections, UI refresh) know
//! to rebuild. Queued (speculative) saves never notify; only promotion to
//! the canonical stream does.

use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use cqrskit_core::Event;

/// Notification that an aggregate gained canonical events.
///
/// Carries the last event persisted for that aggregate in the save, which is
/// enough to know the uuid, type, and new version without a store round trip.
#[derive(Debug, Clone)]
pub struct AggregateUpdated {
    pub event: Event,
}

/// Receiving end of an update subscription.
pub struct UpdateSubscription {
    receiver: Receiver<AggregateUpdated>,
}

impl UpdateSubscription {
    /// Blocks until an update arrives or every sender is gone.
    pub fn recv(&self) -> Result<AggregateUpdated, RecvError> {
        self.receiver.recv()
    }

    /// Returns immediately with an update if one is already buffered.
    pub fn try_recv(&self) -> Result<AggregateUpdated, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Blocks up to `timeout` for an update.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<AggregateUpdated, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Fan-out channel for [`AggregateUpdated`] notifications.
///
/// Subscribers with a dropped receiver are pruned on the next publish.
#[derive(Debug, Default)]
pub struct UpdateChannel {
    subscribers: Mutex<Vec<Sender<AggregateUpdated>>>,
}

impl UpdateChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> UpdateSubscription {
        let (tx, rx) = mpsc::channel();
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        UpdateSubscription { receiver: rx }
    }

    pub fn publish(&self, update: AggregateUpdated) {
        let mut subs = match self.subscribers.lock() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrskit_core::{AggregateId, CommandId, TypeTag};
    use serde_json::json;

    fn update() -> AggregateUpdated {
        AggregateUpdated {
            event: Event {
                event_type: TypeTag::from("page.created"),
                aggregate_type: TypeTag::from("page"),
                aggregate_uuid: AggregateId::new(),
                command_uuid: CommandId::new(),
                version: 1,
                user: None,
                payload: json!({}),
                message: "Page Created".into(),
            },
        }
    }

    #[test]
    fn subscribers_each_receive_published_updates() {
        let channel = UpdateChannel::new();
        let first = channel.subscribe();
        let second = channel.subscribe();

        channel.publish(update());

        assert_eq!(first.recv().unwrap().event.version, 1);
        assert_eq!(second.recv().unwrap().event.version, 1);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let channel = UpdateChannel::new();
        let kept = channel.subscribe();
        drop(channel.subscribe());

        channel.publish(update());
        channel.publish(update());

        assert!(kept.try_recv().is_ok());
        assert!(kept.try_recv().is_ok());
        assert!(kept.try_recv().is_err());
    }
}
