//! Integration with sqlx-sqlite-gate crate.
//!
//! Lets an [`EventBroker`] stand in as a gate [`ActivityListener`], so
//! read/write start and end notices reach the same subscribers as every
//! other event. Enable with the `gate` feature.

use sqlx_sqlite_gate::{ActivityListener, GateActivity};

use crate::broker::EventBroker;

impl<E> ActivityListener for EventBroker<E>
where
   E: From<GateActivity> + Clone + Send + Sync + 'static,
{
   fn on_activity(&self, activity: GateActivity) {
      self.publish(E::from(activity));
   }
}
