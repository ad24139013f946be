//! Best-effort fan-out of live payloads to connected observers.
//!
//! Delivery works on a snapshot of the subscriber list taken under the lock,
//! so connects and disconnects never wait on a slow delivery. Any subscriber
//! whose delivery fails is pruned once the broadcast has reached everyone else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use log::debug;
use serde::Serialize;

pub type SubscriberId = u64;

/// A live observer channel.
pub trait Subscriber: Send + Sync {
    /// Deliver one serialized payload. An error marks the subscriber dead.
    fn deliver(&self, payload: &Arc<str>) -> Result<()>;
}

/// Subscriber backed by an mpsc channel. Dropping the receiver disconnects it.
pub struct ChannelSubscriber {
    tx: Mutex<Sender<Arc<str>>>,
}

impl ChannelSubscriber {
    pub fn pair() -> (Arc<Self>, Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn deliver(&self, payload: &Arc<str>) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| anyhow!("subscriber lock poisoned"))?;
        tx.send(Arc::clone(payload))
            .map_err(|_| anyhow!("subscriber disconnected"))
    }
}

/// Outcome of one broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: usize,
}

#[derive(Default)]
pub struct Broadcaster {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriberId, Arc<dyn Subscriber>)>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, subscriber));
        debug!("subscriber {} connected", id);
        id
    }

    /// Convenience: register a channel subscriber and hand back its receiver.
    pub fn subscribe_channel(&self) -> (SubscriberId, Receiver<Arc<str>>) {
        let (sub, rx) = ChannelSubscriber::pair();
        (self.subscribe(sub), rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subs = self.lock();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        before != subs.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize `payload` once and deliver it to every current subscriber.
    pub fn broadcast<T: Serialize>(&self, payload: &T) -> Result<BroadcastReport> {
        let text: Arc<str> = serde_json::to_string(payload)
            .context("serialize live payload")?
            .into();
        Ok(self.broadcast_raw(&text))
    }

    pub fn broadcast_raw(&self, payload: &Arc<str>) -> BroadcastReport {
        let snapshot: Vec<(SubscriberId, Arc<dyn Subscriber>)> = self.lock().clone();

        let mut dead = Vec::new();
        let mut delivered = 0;
        for (id, sub) in &snapshot {
            match sub.deliver(payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!("pruning subscriber {}: {:#}", id, e);
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            self.lock().retain(|(id, _)| !dead.contains(id));
        }
        BroadcastReport {
            delivered,
            pruned: dead.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriberId, Arc<dyn Subscriber>)>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Flaky {
        broken: AtomicBool,
        seen: Mutex<Vec<String>>,
    }

    impl Subscriber for Flaky {
        fn deliver(&self, payload: &Arc<str>) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(anyhow!("socket closed"));
            }
            self.seen.lock().unwrap().push(payload.to_string());
            Ok(())
        }
    }

    #[test]
    fn failed_subscriber_is_pruned_after_delivery_to_others() {
        let bus = Broadcaster::new();
        let (_a, rx_a) = bus.subscribe_channel();
        let flaky = Arc::new(Flaky {
            broken: AtomicBool::new(true),
            seen: Mutex::new(Vec::new()),
        });
        bus.subscribe(flaky.clone());
        let (_c, rx_c) = bus.subscribe_channel();
        assert_eq!(bus.len(), 3);

        let report = bus.broadcast(&serde_json::json!({"n": 1})).unwrap();
        assert_eq!(report, BroadcastReport { delivered: 2, pruned: 1 });
        assert_eq!(&*rx_a.recv().unwrap(), r#"{"n":1}"#);
        assert_eq!(&*rx_c.recv().unwrap(), r#"{"n":1}"#);
        assert_eq!(bus.len(), 2);

        bus.broadcast(&serde_json::json!({"n": 2})).unwrap();
        assert!(flaky.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn dropped_receiver_disconnects() {
        let bus = Broadcaster::new();
        let (_id, rx) = bus.subscribe_channel();
        drop(rx);
        let report = bus.broadcast(&1).unwrap();
        assert_eq!(report.pruned, 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn subscribers_see_broadcasts_in_order() {
        let bus = Broadcaster::new();
        let (_id, rx) = bus.subscribe_channel();
        for n in 0..5 {
            bus.broadcast(&n).unwrap();
        }
        let got: Vec<String> = rx.try_iter().map(|s| s.to_string()).collect();
        assert_eq!(got, vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn unsubscribe_removes() {
        let bus = Broadcaster::new();
        let (id, _rx) = bus.subscribe_channel();
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
    }
}
