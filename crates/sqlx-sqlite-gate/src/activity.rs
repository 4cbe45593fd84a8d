//! Reader/writer activity counters with an explicit notification hook

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

/// What happened at a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateActivityKind {
   ReadStarted,
   ReadEnded,
   WriteStarted,
   WriteEnded,
}

/// A gate acquisition or release, with the active counts after the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateActivity {
   pub kind: GateActivityKind,
   pub active_readers: usize,
   pub active_writers: usize,
}

/// Receives a call after every gate acquisition and release.
///
/// Called synchronously on the acquiring or releasing task, so
/// implementations should return quickly.
pub trait ActivityListener: Send + Sync {
   fn on_activity(&self, activity: GateActivity);
}

/// Counts active readers and writers and reports each change to an
/// optional listener.
#[derive(Default)]
pub struct ActivityTracker {
   readers: AtomicUsize,
   writers: AtomicUsize,
   listener: Option<Arc<dyn ActivityListener>>,
}

impl ActivityTracker {
   pub fn new(listener: Option<Arc<dyn ActivityListener>>) -> Self {
      Self {
         readers: AtomicUsize::new(0),
         writers: AtomicUsize::new(0),
         listener,
      }
   }

   /// Number of readers currently holding the read gate.
   pub fn active_readers(&self) -> usize {
      self.readers.load(Ordering::Acquire)
   }

   /// Number of writers currently holding the write gate (0 or 1).
   pub fn active_writers(&self) -> usize {
      self.writers.load(Ordering::Acquire)
   }

   pub(crate) fn read_started(&self) {
      self.readers.fetch_add(1, Ordering::AcqRel);
      self.notify(GateActivityKind::ReadStarted);
   }

   pub(crate) fn read_ended(&self) {
      self.readers.fetch_sub(1, Ordering::AcqRel);
      self.notify(GateActivityKind::ReadEnded);
   }

   pub(crate) fn write_started(&self) {
      self.writers.fetch_add(1, Ordering::AcqRel);
      self.notify(GateActivityKind::WriteStarted);
   }

   pub(crate) fn write_ended(&self) {
      self.writers.fetch_sub(1, Ordering::AcqRel);
      self.notify(GateActivityKind::WriteEnded);
   }

   fn notify(&self, kind: GateActivityKind) {
      let activity = GateActivity {
         kind,
         active_readers: self.active_readers(),
         active_writers: self.active_writers(),
      };

      trace!(
         ?kind,
         readers = activity.active_readers,
         writers = activity.active_writers,
         "Gate activity"
      );

      if let Some(listener) = &self.listener {
         listener.on_activity(activity);
      }
   }
}

impl fmt::Debug for ActivityTracker {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ActivityTracker")
         .field("readers", &self.active_readers())
         .field("writers", &self.active_writers())
         .field("listener", &self.listener.is_some())
         .finish()
   }
}
