//! Per-room publish/subscribe fan-out
//!
//! Each subscriber owns a bounded inbox. Publishing never blocks: when an
//! inbox is full the event is dropped for that subscriber only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::constants::EVENT_INBOX_CAPACITY;
use crate::core::events::Event;

/// Receiving end of a subscription
pub struct Inbox {
    subscriber_id: String,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Event>>,
}

impl Inbox {
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Wait for the next event; `None` once the subscription is closed and drained
    pub async fn recv(&self) -> Option<Event> {
        self.receiver.lock().await.recv().await
    }

    /// Take an event if one is already queued
    pub async fn try_recv(&self) -> Option<Event> {
        self.receiver.lock().await.try_recv().ok()
    }
}

struct Subscriber {
    sender: mpsc::Sender<Event>,
    inbox: Arc<Inbox>,
}

pub struct EventBus {
    name: String,
    capacity: usize,
    subscribers: Mutex<HashMap<String, Subscriber>>,
}

impl EventBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, EVENT_INBOX_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    // A poisoned map is still structurally valid; keep serving it
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the subscriber's inbox, or return the existing one
    pub fn subscribe(&self, subscriber_id: &str) -> Arc<Inbox> {
        let mut subscribers = self.lock();
        if let Some(existing) = subscribers.get(subscriber_id) {
            return existing.inbox.clone();
        }

        let (sender, receiver) = mpsc::channel(self.capacity);
        let inbox = Arc::new(Inbox {
            subscriber_id: subscriber_id.to_string(),
            receiver: tokio::sync::Mutex::new(receiver),
        });
        subscribers.insert(
            subscriber_id.to_string(),
            Subscriber {
                sender,
                inbox: inbox.clone(),
            },
        );
        debug!("{}: subscribed {}", self.name, subscriber_id);
        inbox
    }

    /// Close and remove a subscriber's inbox. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        // Dropping the sender closes the inbox once queued events are drained
        let removed = self.lock().remove(subscriber_id).is_some();
        if removed {
            debug!("{}: unsubscribed {}", self.name, subscriber_id);
        }
        removed
    }

    /// Best-effort delivery to every subscriber; returns how many inboxes took the event
    pub fn publish(&self, event: Event) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subscribers = self.lock();
            for (id, subscriber) in subscribers.iter() {
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        trace!("{}: inbox of {} full, dropping {}", self.name, id, event.name());
                    }
                    Err(TrySendError::Closed(_)) => closed.push(id.clone()),
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.lock();
            for id in closed {
                subscribers.remove(&id);
            }
        }

        trace!("{}: {} delivered to {} subscribers", self.name, event.name(), delivered);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_subscribed(&self, subscriber_id: &str) -> bool {
        self.lock().contains_key(subscriber_id)
    }
}

/// Unsubscribes when dropped, so waiters never leak a subscription
pub struct Subscription<'a> {
    bus: &'a EventBus,
    inbox: Arc<Inbox>,
}

impl<'a> Subscription<'a> {
    pub fn new(bus: &'a EventBus, subscriber_id: &str) -> Self {
        let inbox = bus.subscribe(subscriber_id);
        Self { bus, inbox }
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.inbox.subscriber_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::user::UserRef;

    fn joined(id: &str) -> Event {
        Event::UserJoined(UserRef {
            id: id.to_string(),
            nickname: id.to_string(),
            color: "#000000".to_string(),
            room_id: "lobby".to_string(),
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new("lobby");
        let a = bus.subscribe("a");
        let b = bus.subscribe("b");

        assert_eq!(bus.publish(joined("x")), 2);
        assert!(matches!(a.recv().await, Some(Event::UserJoined(u)) if u.id == "x"));
        assert!(matches!(b.recv().await, Some(Event::UserJoined(u)) if u.id == "x"));
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let bus = EventBus::new("lobby");
        let first = bus.subscribe("a");
        let second = bus.subscribe("a");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_full_inbox_drops_instead_of_blocking() {
        let bus = EventBus::with_capacity("lobby", 2);
        let slow = bus.subscribe("slow");

        assert_eq!(bus.publish(joined("1")), 1);
        assert_eq!(bus.publish(joined("2")), 1);
        assert_eq!(bus.publish(joined("3")), 0);

        assert!(matches!(slow.recv().await, Some(Event::UserJoined(u)) if u.id == "1"));
        assert!(matches!(slow.recv().await, Some(Event::UserJoined(u)) if u.id == "2"));
        assert!(slow.try_recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_inbox() {
        let bus = EventBus::new("lobby");
        let inbox = bus.subscribe("a");
        bus.publish(joined("x"));

        assert!(bus.unsubscribe("a"));
        assert!(!bus.unsubscribe("a"));

        // Queued events are still drained before the close is observed
        assert!(inbox.recv().await.is_some());
        assert!(inbox.recv().await.is_none());
        assert_eq!(bus.publish(joined("y")), 0);
    }

    #[tokio::test]
    async fn test_subscription_guard_unsubscribes() {
        let bus = EventBus::new("lobby");
        {
            let _sub = Subscription::new(&bus, "poll-1");
            assert!(bus.is_subscribed("poll-1"));
        }
        assert!(!bus.is_subscribed("poll-1"));
    }

    #[tokio::test]
    async fn test_concurrent_publish_and_subscribe() {
        let bus = Arc::new(EventBus::with_capacity("lobby", 1024));
        let mut handles = Vec::new();

        for i in 0..8 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("sub{}", i);
                let inbox = bus.subscribe(&id);
                bus.publish(joined(&id));
                let got = inbox.try_recv().await.is_some();
                bus.unsubscribe(&id);
                got
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(bus.subscriber_count(), 0);
    }
}
