//! The coordinator: one database, its lifecycle, gates and subscribers

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sqlx::migrate::Migrator;
use sqlx_sqlite_gate::{
   ActivityListener, DatabaseLocation, ReadGuard, SqliteDatabase, SqliteDatabaseConfig, WriteGuard,
};
use sqlx_sqlite_notify::{EventBroker, EventStream, SubscriptionId};
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::authorization::{AuthorizationGate, AuthorizationPolicy};
use crate::config::CoordinatorConfig;
use crate::entity::{Entity, EntityDescriptor, EntityRegistry, StatementCache};
use crate::events::CoordinatorEvent;
use crate::lifecycle::{ConnectionLifecycle, ConnectionSnapshot, ConnectionState};
use crate::{Error, Result};

/// Statement used to verify the engine can read the database. Touches the
/// schema so a damaged or foreign file is reported at connect time.
pub(crate) const PROBE_SQL: &str = "SELECT count(*) FROM sqlite_master";

/// Builder for a [`Coordinator`].
///
/// ```no_run
/// use sqlite_access_coordinator::{AuthorizationProfile, Coordinator, CoordinatorConfig};
///
/// # async fn run() -> sqlite_access_coordinator::Result<()> {
/// let coordinator = Coordinator::builder("app.db")
///     .config(CoordinatorConfig {
///         authorization: AuthorizationProfile::ReadOnly,
///         ..Default::default()
///     })
///     .build()?;
///
/// coordinator.create().await?;
/// assert!(coordinator.is_connected());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CoordinatorBuilder {
   location: DatabaseLocation,
   config: CoordinatorConfig,
   descriptors: Vec<&'static EntityDescriptor>,
   migrator: Option<Migrator>,
   policy: Option<Arc<dyn AuthorizationPolicy>>,
}

impl CoordinatorBuilder {
   pub fn config(mut self, config: CoordinatorConfig) -> Self {
      self.config = config;
      self
   }

   /// Add an entity kind to the registry.
   pub fn register<E: Entity>(mut self) -> Self {
      self.descriptors.push(E::descriptor());
      self
   }

   pub fn register_descriptor(mut self, descriptor: &'static EntityDescriptor) -> Self {
      self.descriptors.push(descriptor);
      self
   }

   /// Run these migrations from [`Coordinator::create`] instead of the
   /// registered kinds' DDL.
   pub fn migrator(mut self, migrator: Migrator) -> Self {
      self.migrator = Some(migrator);
      self
   }

   /// Use a custom policy instead of `config.authorization`.
   pub fn authorization(mut self, policy: impl AuthorizationPolicy + 'static) -> Self {
      self.policy = Some(Arc::new(policy));
      self
   }

   /// Validate the registry and assemble the coordinator. Nothing is
   /// opened until `connect` or `create`.
   pub fn build(self) -> Result<Coordinator> {
      let mut registry = EntityRegistry::new();
      for descriptor in self.descriptors {
         registry.register_descriptor(descriptor)?;
      }
      registry.validate()?;

      let authorization = match self.policy {
         Some(policy) => AuthorizationGate::new(policy),
         None => AuthorizationGate::from_profile(self.config.authorization.clone()),
      };

      let events = Arc::new(EventBroker::new(self.config.event_channel_capacity));

      Ok(Coordinator {
         gate_config: self.config.database_config(),
         lifecycle: ConnectionLifecycle::new(Arc::clone(&events)),
         location: self.location,
         config: self.config,
         registry,
         migrator: self.migrator,
         authorization,
         events,
         database: RwLock::new(None),
         statements: StatementCache::default(),
         connect_lock: AsyncMutex::new(()),
      })
   }
}

/// Coordinates every caller's access to one SQLite database.
///
/// Share it behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct Coordinator {
   pub(crate) location: DatabaseLocation,
   pub(crate) config: CoordinatorConfig,
   pub(crate) gate_config: SqliteDatabaseConfig,
   pub(crate) registry: EntityRegistry,
   pub(crate) migrator: Option<Migrator>,
   pub(crate) authorization: AuthorizationGate,
   pub(crate) lifecycle: ConnectionLifecycle,
   pub(crate) events: Arc<EventBroker<CoordinatorEvent>>,
   /// Present exactly while a connection is open. Never held across await.
   pub(crate) database: RwLock<Option<Arc<SqliteDatabase>>>,
   pub(crate) statements: StatementCache,
   /// Serializes connect, disconnect, dispose and delete.
   pub(crate) connect_lock: AsyncMutex<()>,
}

impl Coordinator {
   pub fn builder(location: impl Into<DatabaseLocation>) -> CoordinatorBuilder {
      CoordinatorBuilder {
         location: location.into(),
         config: CoordinatorConfig::default(),
         descriptors: Vec::new(),
         migrator: None,
         policy: None,
      }
   }

   pub fn location(&self) -> &DatabaseLocation {
      &self.location
   }

   pub fn config(&self) -> &CoordinatorConfig {
      &self.config
   }

   pub fn registry(&self) -> &EntityRegistry {
      &self.registry
   }

   pub fn authorization(&self) -> &AuthorizationGate {
      &self.authorization
   }

   pub fn snapshot(&self) -> ConnectionSnapshot {
      self.lifecycle.snapshot()
   }

   pub fn state(&self) -> ConnectionState {
      self.lifecycle.state()
   }

   pub fn is_connected(&self) -> bool {
      self.state() == ConnectionState::Connected
   }

   pub fn last_activity_at(&self) -> Option<OffsetDateTime> {
      self.snapshot().last_activity_at
   }

   pub fn last_connected_at(&self) -> Option<OffsetDateTime> {
      self.snapshot().last_connected_at
   }

   /// Readers currently holding the read gate (0 when not connected).
   pub fn active_readers(&self) -> usize {
      self
         .database
         .read()
         .as_ref()
         .map_or(0, |db| db.activity().active_readers())
   }

   /// Writers currently holding the write gate (0 or 1).
   pub fn active_writers(&self) -> usize {
      self
         .database
         .read()
         .as_ref()
         .map_or(0, |db| db.activity().active_writers())
   }

   /// Number of entity kinds with cached statements.
   pub fn cached_statement_count(&self) -> usize {
      self.statements.len()
   }

   /// Register a callback for every event. Callbacks run synchronously, in
   /// subscription order, on the task that caused the event.
   pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
   where
      F: Fn(&CoordinatorEvent) + Send + Sync + 'static,
   {
      self.events.subscribe(callback)
   }

   pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
      self.events.unsubscribe(id)
   }

   /// Stream of every event published from now on.
   pub fn events(&self) -> EventStream<CoordinatorEvent> {
      self.events.stream()
   }

   /// Stream of state changes published from now on.
   pub fn state_changes(&self) -> EventStream<CoordinatorEvent> {
      self.events.stream().filter(CoordinatorEvent::is_state_change)
   }

   /// Open the database and verify it with a probe statement.
   ///
   /// Already connected is a no-op. A failure leaves the state
   /// `Disconnected`, or `Corrupted` when the engine reports damage, and
   /// is returned as `Err`.
   pub async fn connect(&self) -> Result<()> {
      let _guard = self.connect_lock.lock().await;

      match self.state() {
         ConnectionState::Connected => return Ok(()),
         ConnectionState::Disposed => return Err(Error::Disposed),
         ConnectionState::Corrupted => {
            self.release_database().await;
            self.lifecycle.transition(ConnectionState::Disconnected)?;
         }
         ConnectionState::Disconnected | ConnectionState::Connecting => {}
      }

      self.lifecycle.transition(ConnectionState::Connecting)?;

      match self.open_and_probe().await {
         Ok(db) => {
            *self.database.write() = Some(db);
            self.lifecycle.transition(ConnectionState::Connected)?;
            debug!(location = ?self.location, "Coordinator connected");
            Ok(())
         }
         Err(e) => {
            let next = if e.is_corruption() {
               ConnectionState::Corrupted
            } else {
               ConnectionState::Disconnected
            };
            warn!(error = %e, state = %next, "Connection attempt failed");
            if let Err(transition_err) = self.lifecycle.transition(next) {
               debug!(error = %transition_err, "State moved during failed connect");
            }
            Err(e)
         }
      }
   }

   async fn open_and_probe(&self) -> Result<Arc<SqliteDatabase>> {
      let listener: Arc<dyn ActivityListener> = self.events.clone();
      let db = SqliteDatabase::connect_with_listener(
         self.location.clone(),
         Some(self.gate_config.clone()),
         Some(listener),
      )
      .await?;

      if let Err(e) = probe(&db).await {
         if let Err(close_err) = db.close().await {
            warn!(error = %close_err, "Closing after failed probe");
         }
         return Err(e);
      }

      Ok(db)
   }

   /// Flush and close the connection.
   ///
   /// The WAL checkpoint and `PRAGMA optimize` before close are best
   /// effort; their failures are logged and the close proceeds.
   pub async fn disconnect(&self) -> Result<()> {
      let _guard = self.connect_lock.lock().await;

      match self.state() {
         ConnectionState::Disposed => return Err(Error::Disposed),
         ConnectionState::Disconnected => return Ok(()),
         _ => {}
      }

      self.release_database().await;
      self.lifecycle.transition(ConnectionState::Disconnected)?;
      Ok(())
   }

   /// Drop cached entity statements and re-probe the engine. The state is
   /// left alone unless the probe reports corruption.
   pub async fn refresh(&self) -> Result<()> {
      self.statements.clear();
      let db = self.database()?;
      let result = probe(&db).await;
      self.observe(result)
   }

   /// Disconnect (best effort) and enter the terminal `Disposed` state.
   pub async fn dispose(&self) -> Result<()> {
      let _guard = self.connect_lock.lock().await;

      if self.state() == ConnectionState::Disposed {
         return Ok(());
      }

      self.release_database().await;
      self.lifecycle.transition(ConnectionState::Disposed)?;
      Ok(())
   }

   /// Clear cached statements, take the database out and close it.
   pub(crate) async fn release_database(&self) {
      self.statements.clear();

      let db = self.database.write().take();
      if let Some(db) = db
         && let Err(e) = db.close().await
      {
         warn!(error = %e, "Error while closing database");
      }
   }

   /// The open database, or why there is none.
   pub(crate) fn database(&self) -> Result<Arc<SqliteDatabase>> {
      match self.state() {
         ConnectionState::Disposed => Err(Error::Disposed),
         ConnectionState::Connected => self
            .database
            .read()
            .clone()
            .ok_or(Error::NotConnected(ConnectionState::Connected)),
         other => Err(Error::NotConnected(other)),
      }
   }

   pub(crate) fn descriptor<E: Entity>(&self) -> Result<&'static EntityDescriptor> {
      self.registry.get(E::descriptor().kind)
   }

   /// Take the write gate, waiting at most the configured write timeout.
   pub async fn acquire_writer(&self) -> Result<WriteGuard> {
      self.acquire_writer_timeout(self.config.write_timeout()).await
   }

   /// Take the write gate, waiting at most `timeout`. A zero timeout fails
   /// immediately with [`Error::LockTimeout`] if the gate is held.
   pub async fn acquire_writer_timeout(&self, timeout: Duration) -> Result<WriteGuard> {
      let db = self.database()?;
      Ok(db.acquire_writer_timeout(timeout).await?)
   }

   /// Take a slot at the read gate.
   pub async fn acquire_reader(&self) -> Result<ReadGuard> {
      let db = self.database()?;
      Ok(db.acquire_reader().await?)
   }

   /// Current values of the concurrency pragmas.
   pub async fn concurrency_pragmas(&self) -> Result<BTreeMap<String, String>> {
      let db = self.database()?;
      let result = db.pragma_snapshot().await.map_err(Error::from);
      self.observe(result)
   }

   /// Fold the write-ahead log back into the main file.
   pub async fn checkpoint(&self) -> Result<()> {
      let db = self.database()?;
      let result = db.checkpoint().await.map_err(Error::from);
      self.observe(result)
   }

   /// Book-keeping after an engine round trip: success refreshes the
   /// activity timestamp, a corruption report moves the state to
   /// `Corrupted`.
   pub(crate) fn observe<T>(&self, result: Result<T>) -> Result<T> {
      match &result {
         Ok(_) => self.lifecycle.touch(),
         Err(e) if e.is_corruption() => self.mark_corrupted(e),
         Err(_) => {}
      }
      result
   }

   pub(crate) fn mark_corrupted(&self, error: &Error) {
      warn!(error = %error, "Engine reported corruption");
      if let Err(e) = self.lifecycle.transition(ConnectionState::Corrupted) {
         debug!(error = %e, "Could not mark connection corrupted");
      }
   }
}

/// Run the probe statement through the read gate.
pub(crate) async fn probe(db: &SqliteDatabase) -> Result<()> {
   let reader = db.acquire_reader().await?;
   sqlx::query(PROBE_SQL).fetch_one(reader.pool()).await?;
   Ok(())
}
