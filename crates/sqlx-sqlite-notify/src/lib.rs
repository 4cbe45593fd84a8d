//! # sqlx-sqlite-notify
//!
//! Ordered, explicit event delivery for SQLite connection coordinators.
//!
//! An [`EventBroker`] keeps a registry of callbacks, each identified by the
//! [`SubscriptionId`] returned from `subscribe`. Published events go to the
//! callbacks in subscription order and then to a broadcast channel that
//! backs any number of [`EventStream`]s.
//!
//! # Example
//!
//! ```
//! use sqlx_sqlite_notify::EventBroker;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! enum Event {
//!     Opened,
//!     Closed,
//! }
//!
//! let broker = EventBroker::<Event>::new(16);
//! let id = broker.subscribe(|event| println!("saw {event:?}"));
//!
//! broker.publish(Event::Opened);
//! assert!(broker.unsubscribe(id));
//! broker.publish(Event::Closed);
//! ```
//!
//! With the `gate` feature, any `EventBroker<E>` where
//! `E: From<sqlx_sqlite_gate::GateActivity>` can be handed to
//! `SqliteDatabase::connect_with_listener` to publish gate activity.

mod broker;
#[cfg(feature = "gate")]
mod gate;
mod stream;

pub use broker::{EventBroker, SubscriptionId};
pub use stream::{EventStream, StreamEvent};
