use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

/// Item yielded by an [`EventStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<E> {
   /// A published event that passed the stream's filter.
   Event(E),
   /// The receiver fell behind and this many events were dropped.
   Lagged(u64),
}

type Filter<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// A filtered stream of broker events.
///
/// Wraps a `BroadcastStream` with an optional predicate. Uses proper async
/// wakeups instead of busy-polling.
pub struct EventStream<E> {
   inner: BroadcastStream<E>,
   filter: Option<Filter<E>>,
}

impl<E> EventStream<E>
where
   E: Clone + Send + 'static,
{
   pub fn new(rx: broadcast::Receiver<E>) -> Self {
      Self {
         inner: BroadcastStream::new(rx),
         filter: None,
      }
   }

   /// Only yield events for which `predicate` returns true. Lag notices are
   /// always yielded.
   pub fn filter<F>(mut self, predicate: F) -> Self
   where
      F: Fn(&E) -> bool + Send + Sync + 'static,
   {
      self.filter = Some(Arc::new(predicate));
      self
   }
}

impl<E> Stream for EventStream<E>
where
   E: Clone + Send + 'static,
{
   type Item = StreamEvent<E>;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      loop {
         // BroadcastStream is Unpin, so we can safely create a pinned reference
         let inner = Pin::new(&mut self.inner);

         match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => {
               if let Some(ref filter) = self.filter
                  && !filter(&event)
               {
                  continue;
               }
               return Poll::Ready(Some(StreamEvent::Event(event)));
            }
            Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(count)))) => {
               warn!(
                  missed = count,
                  "Event stream lagged; missed notifications. Consider a larger channel capacity."
               );
               return Poll::Ready(Some(StreamEvent::Lagged(count)));
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => return Poll::Pending,
         }
      }
   }
}

impl<E> fmt::Debug for EventStream<E> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("EventStream")
         .field("filtered", &self.filter.is_some())
         .finish()
   }
}
