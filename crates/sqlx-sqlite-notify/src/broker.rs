//! Event fan-out: ordered callbacks plus a broadcast channel

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::stream::EventStream;

/// Handle returned by [`EventBroker::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Delivers each published event to every registered callback, in
/// subscription order, and then to every broadcast receiver.
///
/// Callbacks run synchronously on the publishing thread. They may subscribe
/// or unsubscribe (the registry is not locked while they run), but must not
/// block.
pub struct EventBroker<E> {
   sender: broadcast::Sender<E>,
   subscribers: RwLock<Vec<(SubscriptionId, Callback<E>)>>,
   next_id: AtomicU64,
}

impl<E> EventBroker<E>
where
   E: Clone + Send + 'static,
{
   /// Create a broker whose broadcast channel buffers `channel_capacity`
   /// events per slow receiver before it starts lagging.
   pub fn new(channel_capacity: usize) -> Self {
      let (sender, _) = broadcast::channel(channel_capacity.max(1));
      Self {
         sender,
         subscribers: RwLock::new(Vec::new()),
         next_id: AtomicU64::new(1),
      }
   }

   /// Register a callback. Callbacks are invoked in the order they were
   /// registered.
   pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
   where
      F: Fn(&E) + Send + Sync + 'static,
   {
      let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
      self.subscribers.write().push((id, Arc::new(callback)));
      debug!(subscription = id.0, "Subscriber registered");
      id
   }

   /// Remove a callback. Returns `false` if the id was not registered.
   pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
      let mut subscribers = self.subscribers.write();
      let before = subscribers.len();
      subscribers.retain(|(existing, _)| *existing != id);
      let removed = subscribers.len() != before;
      if removed {
         debug!(subscription = id.0, "Subscriber removed");
      }
      removed
   }

   pub fn subscriber_count(&self) -> usize {
      self.subscribers.read().len()
   }

   /// A raw broadcast receiver for events published from now on.
   pub fn receiver(&self) -> broadcast::Receiver<E> {
      self.sender.subscribe()
   }

   /// A `Stream` of events published from now on.
   pub fn stream(&self) -> EventStream<E> {
      EventStream::new(self.sender.subscribe())
   }

   /// Deliver `event` to callbacks, then to broadcast receivers.
   pub fn publish(&self, event: E) {
      let callbacks: Vec<Callback<E>> = self
         .subscribers
         .read()
         .iter()
         .map(|(_, callback)| Arc::clone(callback))
         .collect();

      for callback in callbacks {
         callback(&event);
      }

      // No receivers is normal; the channel only matters to streams
      if self.sender.send(event).is_err() {
         trace!("No stream receivers for event");
      }
   }
}

impl<E> fmt::Debug for EventBroker<E> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("EventBroker")
         .field("subscribers", &self.subscribers.read().len())
         .field("receivers", &self.sender.receiver_count())
         .finish()
   }
}
