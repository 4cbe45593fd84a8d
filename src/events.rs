use sqlx_sqlite_gate::GateActivity;

use crate::lifecycle::ConnectionState;

/// Everything a coordinator publishes to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorEvent {
   /// The connection lifecycle moved between two different states.
   StateChanged {
      from: ConnectionState,
      to: ConnectionState,
   },

   /// A reader or writer entered or left its gate.
   Gate(GateActivity),
}

impl CoordinatorEvent {
   pub fn is_state_change(&self) -> bool {
      matches!(self, CoordinatorEvent::StateChanged { .. })
   }
}

impl From<GateActivity> for CoordinatorEvent {
   fn from(activity: GateActivity) -> Self {
      CoordinatorEvent::Gate(activity)
   }
}
