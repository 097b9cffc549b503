//! Topic-based fan-out of outward events.
//!
//! The multiplexer publishes decrypted requests and link notices here; the
//! host application subscribes per topic. Each topic keeps its subscribers in
//! subscription order and every published event is delivered to them in that
//! order.
//!
//! # Lifetime
//!
//! Subscriptions end explicitly: [`Subscription::cancel`] removes one
//! subscriber, [`EventBus::clear`] ends all of them (their `recv` returns
//! `None`). A subscriber whose receiver was dropped is pruned on the next
//! publish to its topic.
//!
//! ```text
//!   Dispatcher ──publish(Request)──► EventBus ──► [sub#1, sub#4]   (Requests)
//!              ──publish(Notice)───►          ──► [sub#2]          (Notices)
//! ```

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::models::{HostRequest, LinkNotice};

/// Outward stream a subscriber can listen to.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Topic {
    /// De-duplicated decrypted requests.
    Requests,
    /// Session and transport notices.
    Notices,
}

/// Event carried on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A decrypted request.
    Request(HostRequest),
    /// A session or transport notice.
    Notice(LinkNotice),
}

impl BusEvent {
    /// Topic this event is published on.
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::Request(_) => Topic::Requests,
            Self::Notice(_) => Topic::Notices,
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<BusEvent>,
}

#[derive(Debug, Default)]
struct BusState {
    next_id: u64,
    topics: HashMap<Topic, Vec<Subscriber>>,
}

/// Topic → ordered subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a subscriber at the end of `topic`'s list.
    pub fn subscribe(self: &Arc<Self>, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut id = 0;
        if let Ok(mut state) = self.state.lock() {
            id = state.next_id;
            state.next_id += 1;
            state
                .topics
                .entry(topic)
                .or_default()
                .push(Subscriber { id, tx });
        }

        Subscription {
            id,
            topic,
            rx,
            bus: Arc::downgrade(self),
        }
    }

    /// Deliver `event` to every live subscriber of its topic.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: BusEvent) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let Some(subscribers) = state.topics.get_mut(&event.topic()) else {
            return 0;
        };

        subscribers.retain(|sub| sub.tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// Remove one subscriber. Returns `true` if it was registered.
    pub fn unsubscribe(&self, topic: Topic, id: u64) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let Some(subscribers) = state.topics.get_mut(&topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|sub| sub.id != id);
        subscribers.len() != before
    }

    /// End every subscription on every topic.
    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.topics.clear();
        }
    }

    /// Number of subscribers currently registered on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.state
            .lock()
            .map(|state| state.topics.get(&topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

/// Receiving end of one bus subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: mpsc::UnboundedReceiver<BusEvent>,
    bus: Weak<EventBus>,
}

impl Subscription {
    /// Wait for the next event; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }

    /// Topic this subscription listens to.
    #[must_use]
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Unregister from the bus. Already-queued events are discarded.
    pub fn cancel(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.topic, self.id);
        }
    }
}

/// Typed view over a [`Topic::Requests`] subscription.
#[derive(Debug)]
pub struct RequestSubscription(Subscription);

impl RequestSubscription {
    pub(crate) fn new(inner: Subscription) -> Self {
        Self(inner)
    }

    /// Wait for the next de-duplicated request.
    pub async fn recv(&mut self) -> Option<HostRequest> {
        loop {
            if let BusEvent::Request(request) = self.0.recv().await? {
                return Some(request);
            }
        }
    }

    /// Take the next request if one is queued.
    pub fn try_recv(&mut self) -> Option<HostRequest> {
        while let Some(event) = self.0.try_recv() {
            if let BusEvent::Request(request) = event {
                return Some(request);
            }
        }
        None
    }

    /// Unregister from the bus.
    pub fn cancel(self) {
        self.0.cancel();
    }
}

/// Typed view over a [`Topic::Notices`] subscription.
#[derive(Debug)]
pub struct NoticeSubscription(Subscription);

impl NoticeSubscription {
    pub(crate) fn new(inner: Subscription) -> Self {
        Self(inner)
    }

    /// Wait for the next notice.
    pub async fn recv(&mut self) -> Option<LinkNotice> {
        loop {
            if let BusEvent::Notice(notice) = self.0.recv().await? {
                return Some(notice);
            }
        }
    }

    /// Take the next notice if one is queued.
    pub fn try_recv(&mut self) -> Option<LinkNotice> {
        while let Some(event) = self.0.try_recv() {
            if let BusEvent::Notice(notice) = event {
                return Some(notice);
            }
        }
        None
    }

    /// Unregister from the bus.
    pub fn cancel(self) {
        self.0.cancel();
    }
}
