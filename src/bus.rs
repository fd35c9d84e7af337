//! Mutation/invalidation bus.
//!
//! Writers call [`MutationBus::publish`] after changing a key; readers that
//! subscribed to the key are told it changed and re-resolve it themselves.
//! Notifications carry no data.
//!
//! Publishes are queued and delivered by whichever caller is currently
//! draining the queue, so notifications are delivered in publish order and a
//! callback that publishes again never re-enters delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::trace;

use crate::cache::CacheKey;

type Callback = Arc<dyn Fn(&CacheKey) + Send + Sync>;

#[derive(Default)]
struct BusInner {
  subscribers: Mutex<HashMap<CacheKey, Vec<(u64, Callback)>>>,
  queue: Mutex<VecDeque<CacheKey>>,
  draining: AtomicBool,
  next_id: AtomicU64,
}

impl BusInner {
  fn subscribers(&self) -> MutexGuard<'_, HashMap<CacheKey, Vec<(u64, Callback)>>> {
    self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn queue(&self) -> MutexGuard<'_, VecDeque<CacheKey>> {
    self.queue.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn unsubscribe(&self, key: &CacheKey, id: u64) {
    let mut subscribers = self.subscribers();
    if let Some(list) = subscribers.get_mut(key) {
      list.retain(|(sub_id, _)| *sub_id != id);
      if list.is_empty() {
        subscribers.remove(key);
      }
    }
  }
}

/// Registry of per-key change callbacks.
#[derive(Clone, Default)]
pub struct MutationBus {
  inner: Arc<BusInner>,
}

impl MutationBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `callback` for changes to `key`.
  ///
  /// The callback stays registered until the returned [`Subscription`] is
  /// dropped or explicitly unsubscribed.
  pub fn subscribe<F>(&self, key: &CacheKey, callback: F) -> Subscription
  where
    F: Fn(&CacheKey) + Send + Sync + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .inner
      .subscribers()
      .entry(key.clone())
      .or_default()
      .push((id, Arc::new(callback)));

    Subscription {
      bus: Arc::downgrade(&self.inner),
      key: key.clone(),
      id,
    }
  }

  /// Notify every current subscriber of `key` that it changed.
  pub fn publish(&self, key: &CacheKey) {
    self.inner.queue().push_back(key.clone());
    self.drain();
  }

  /// Publish every key with a subscriber whose name starts with `prefix`.
  pub fn publish_prefix(&self, prefix: &str) {
    let mut keys: Vec<CacheKey> = self
      .inner
      .subscribers()
      .keys()
      .filter(|key| key.starts_with(prefix))
      .cloned()
      .collect();
    keys.sort();
    for key in keys {
      self.publish(&key);
    }
  }

  pub fn subscriber_count(&self, key: &CacheKey) -> usize {
    self.inner.subscribers().get(key).map_or(0, Vec::len)
  }

  fn drain(&self) {
    if self.inner.draining.swap(true, Ordering::AcqRel) {
      // Another caller is delivering and will pick our key up
      return;
    }

    loop {
      let next = self.inner.queue().pop_front();
      match next {
        Some(key) => self.deliver(&key),
        None => {
          self.inner.draining.store(false, Ordering::Release);
          // A publish may have queued between the pop and the store
          if self.inner.queue().is_empty() || self.inner.draining.swap(true, Ordering::AcqRel) {
            return;
          }
        }
      }
    }
  }

  fn deliver(&self, key: &CacheKey) {
    let callbacks: Vec<Callback> = self
      .inner
      .subscribers()
      .get(key)
      .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
      .unwrap_or_default();

    trace!(key = %key, subscribers = callbacks.len(), "delivering invalidation");
    for callback in callbacks {
      callback(key);
    }
  }
}

/// Handle returned by [`MutationBus::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  bus: Weak<BusInner>,
  key: CacheKey,
  id: u64,
}

impl Subscription {
  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(bus) = self.bus.upgrade() {
      bus.unsubscribe(&self.key, self.id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&CacheKey) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |key: &CacheKey| {
      sink.lock().unwrap().push(key.to_string())
    })
  }

  #[test]
  fn test_publish_reaches_subscriber() {
    let bus = MutationBus::new();
    let key = CacheKey::new("territories");
    let (seen, callback) = recorder();
    let _sub = bus.subscribe(&key, callback);

    bus.publish(&key);
    bus.publish(&CacheKey::new("groups"));

    assert_eq!(*seen.lock().unwrap(), vec!["territories".to_string()]);
  }

  #[test]
  fn test_dropping_subscription_unsubscribes() {
    let bus = MutationBus::new();
    let key = CacheKey::new("territories");
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let sub = bus.subscribe(&key, move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    });

    bus.publish(&key);
    sub.unsubscribe();
    bus.publish(&key);

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(bus.subscriber_count(&key), 0);
  }

  #[test]
  fn test_reentrant_publish_is_delivered_after_current() {
    let bus = MutationBus::new();
    let a = CacheKey::new("a");
    let b = CacheKey::new("b");
    let order = Arc::new(Mutex::new(Vec::new()));

    let bus_clone = bus.clone();
    let b_clone = b.clone();
    let order_a = order.clone();
    let _sub_a = bus.subscribe(&a, move |_| {
      order_a.lock().unwrap().push("a-start");
      bus_clone.publish(&b_clone);
      order_a.lock().unwrap().push("a-end");
    });
    let order_b = order.clone();
    let _sub_b = bus.subscribe(&b, move |_| order_b.lock().unwrap().push("b"));

    bus.publish(&a);

    assert_eq!(*order.lock().unwrap(), vec!["a-start", "a-end", "b"]);
  }

  #[test]
  fn test_publish_prefix() {
    let bus = MutationBus::new();
    let (seen, callback) = recorder();
    let callback = Arc::new(callback);
    let subs: Vec<Subscription> = ["houses/t1", "houses/t2", "territories"]
      .into_iter()
      .map(|k| {
        let cb = callback.clone();
        bus.subscribe(&CacheKey::new(k), move |key| cb(key))
      })
      .collect();

    bus.publish_prefix("houses/");

    assert_eq!(
      *seen.lock().unwrap(),
      vec!["houses/t1".to_string(), "houses/t2".to_string()]
    );
    drop(subs);
  }
}
