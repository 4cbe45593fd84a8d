//! Creating, migrating and deleting the database on disk

use sqlx_sqlite_gate::{DatabaseFileInfo, DatabaseLocation, remove_database_files};
use tracing::{debug, info};

use crate::coordinator::Coordinator;
use crate::lifecycle::ConnectionState;
use crate::{Error, Result};

impl Coordinator {
   /// Make sure the database exists with its schema, then connect.
   ///
   /// Creates the containing directory if needed. With a migrator
   /// configured, pending migrations are applied. Otherwise a fresh
   /// database gets the registered kinds' tables, created in dependency
   /// order, and an existing file is left as it is.
   pub async fn create(&self) -> Result<()> {
      if self.state() == ConnectionState::Disposed {
         return Err(Error::Disposed);
      }

      let fresh = !self.location.file_exists();

      if let Some(parent) = self.location.path().and_then(|path| path.parent())
         && !parent.as_os_str().is_empty()
      {
         tokio::fs::create_dir_all(parent).await?;
      }

      self.connect().await?;

      if let Some(migrator) = &self.migrator {
         let mut writer = self.acquire_writer().await?;
         migrator.run(&mut *writer).await?;
         drop(writer);
         debug!(location = ?self.location, "Migrations applied");
      } else if fresh {
         let order = self.registry.creation_order()?;
         let statements: Vec<&str> = order.iter().map(|descriptor| descriptor.create_sql).collect();
         if !statements.is_empty() {
            self.execute_schema(&statements).await?;
         }
      } else {
         debug!(location = ?self.location, "Existing database, schema left unchanged");
      }

      self.lifecycle.touch();
      Ok(())
   }

   /// Close the database and delete the main file with its `-wal`, `-shm`
   /// and `-journal` siblings.
   ///
   /// In-memory databases fail with [`Error::InMemoryDatabase`] and are
   /// left untouched. Deleting a database that was never opened removes
   /// whatever files are present.
   pub async fn delete_current(&self) -> Result<()> {
      let _guard = self.connect_lock.lock().await;

      if self.state() == ConnectionState::Disposed {
         return Err(Error::Disposed);
      }
      let path = match &self.location {
         DatabaseLocation::File(path) => path.clone(),
         DatabaseLocation::Memory => return Err(Error::InMemoryDatabase),
      };

      self.statements.clear();

      let db = self.database.write().take();
      let removed = match db {
         Some(db) => db.remove().await,
         None => remove_database_files(&path, self.gate_config.delete_retry).await,
      };

      if self.state() != ConnectionState::Disconnected {
         self.lifecycle.transition(ConnectionState::Disconnected)?;
      }

      removed?;
      info!(path = %path.display(), "Deleted database files");
      Ok(())
   }

   /// Existence and sizes of the database files right now.
   pub fn file_info(&self) -> DatabaseFileInfo {
      match &self.location {
         DatabaseLocation::File(path) => DatabaseFileInfo::collect(path),
         DatabaseLocation::Memory => DatabaseFileInfo::in_memory(),
      }
   }
}
