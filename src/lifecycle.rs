//! Connection state machine with serialized transitions

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sqlx_sqlite_notify::EventBroker;
use time::OffsetDateTime;
use tracing::debug;

use crate::events::CoordinatorEvent;
use crate::{Error, Result};

/// Where the coordinator's connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
   Disconnected,
   Connecting,
   Connected,
   /// The engine reported structural damage.
   Corrupted,
   /// Terminal.
   Disposed,
}

impl ConnectionState {
   /// Whether the state machine has an edge from `self` to `next`.
   pub fn can_transition_to(self, next: ConnectionState) -> bool {
      use ConnectionState::*;

      matches!(
         (self, next),
         (Disconnected, Connecting)
            | (Connecting, Connected | Disconnected | Corrupted)
            | (Connected, Disconnected | Corrupted)
            | (Corrupted, Disconnected)
            | (Disconnected | Connecting | Connected | Corrupted, Disposed)
      )
   }
}

impl fmt::Display for ConnectionState {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         ConnectionState::Disconnected => "disconnected",
         ConnectionState::Connecting => "connecting",
         ConnectionState::Connected => "connected",
         ConnectionState::Corrupted => "corrupted",
         ConnectionState::Disposed => "disposed",
      };
      f.write_str(name)
   }
}

/// Point-in-time copy of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
   pub state: ConnectionState,
   #[serde(with = "time::serde::rfc3339::option")]
   pub last_connected_at: Option<OffsetDateTime>,
   #[serde(with = "time::serde::rfc3339::option")]
   pub last_activity_at: Option<OffsetDateTime>,
}

impl Default for ConnectionSnapshot {
   fn default() -> Self {
      Self {
         state: ConnectionState::Disconnected,
         last_connected_at: None,
         last_activity_at: None,
      }
   }
}

/// Outcome of [`ConnectionLifecycle::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
   pub from: ConnectionState,
   pub to: ConnectionState,
   /// False when the lifecycle was already in `to`.
   pub changed: bool,
}

/// Owns the connection state and its timestamps.
///
/// Transitions are serialized by `transition_lock`; the snapshot itself sits
/// behind a separate lock held only long enough to copy or update it, so
/// readers never wait on a transition's notifications.
#[derive(Debug)]
pub struct ConnectionLifecycle {
   transition_lock: Mutex<()>,
   snapshot: RwLock<ConnectionSnapshot>,
   events: Arc<EventBroker<CoordinatorEvent>>,
}

impl ConnectionLifecycle {
   pub fn new(events: Arc<EventBroker<CoordinatorEvent>>) -> Self {
      Self {
         transition_lock: Mutex::new(()),
         snapshot: RwLock::new(ConnectionSnapshot::default()),
         events,
      }
   }

   pub fn snapshot(&self) -> ConnectionSnapshot {
      *self.snapshot.read()
   }

   pub fn state(&self) -> ConnectionState {
      self.snapshot.read().state
   }

   /// Move to `next`.
   ///
   /// Re-entering the current state succeeds with `changed == false` and
   /// publishes nothing. Entering `Connected` refreshes both timestamps.
   /// State-changed events are published while the transition lock is
   /// held, so subscribers see transitions in the order they happened and
   /// must not call back into `transition`.
   pub fn transition(&self, next: ConnectionState) -> Result<Transition> {
      let _guard = self.transition_lock.lock();

      let from = self.snapshot.read().state;
      if from == next {
         return Ok(Transition {
            from,
            to: next,
            changed: false,
         });
      }

      if !from.can_transition_to(next) {
         return Err(Error::InvalidTransition { from, to: next });
      }

      {
         let mut snapshot = self.snapshot.write();
         snapshot.state = next;
         if next == ConnectionState::Connected {
            let now = OffsetDateTime::now_utc();
            snapshot.last_connected_at = Some(now);
            snapshot.last_activity_at = Some(now);
         }
      }

      debug!(%from, to = %next, "Connection state changed");
      self
         .events
         .publish(CoordinatorEvent::StateChanged { from, to: next });

      Ok(Transition {
         from,
         to: next,
         changed: true,
      })
   }

   /// Record that an operation just completed against the engine.
   pub fn touch(&self) {
      self.snapshot.write().last_activity_at = Some(OffsetDateTime::now_utc());
   }
}
