//! On-disk layout of a database: the main file and its sidecars

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{Error, Result};

/// Suffix of the write-ahead log file.
pub const WAL_SUFFIX: &str = "-wal";
/// Suffix of the shared-memory index file.
pub const SHM_SUFFIX: &str = "-shm";
/// Suffix of the rollback journal file.
pub const JOURNAL_SUFFIX: &str = "-journal";

/// Returns `<path><suffix>`, e.g. `app.db` + `-wal` = `app.db-wal`.
pub fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
   let mut name = OsString::from(path.as_os_str());
   name.push(suffix);
   PathBuf::from(name)
}

/// The main file followed by its WAL, shared-memory and journal siblings.
pub fn database_files(path: &Path) -> [PathBuf; 4] {
   [
      path.to_path_buf(),
      sidecar_path(path, WAL_SUFFIX),
      sidecar_path(path, SHM_SUFFIX),
      sidecar_path(path, JOURNAL_SUFFIX),
   ]
}

/// Existence and size of a database's files at one point in time.
///
/// For in-memory databases every file field is zero/false.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseFileInfo {
   pub in_memory: bool,
   pub path: Option<PathBuf>,
   pub exists: bool,
   pub size_bytes: u64,
   pub wal_exists: bool,
   pub wal_size_bytes: u64,
   pub shm_exists: bool,
   pub shm_size_bytes: u64,
}

impl DatabaseFileInfo {
   pub fn in_memory() -> Self {
      Self {
         in_memory: true,
         ..Default::default()
      }
   }

   /// Stat the main file and its sidecars. Missing files report as absent
   /// with size zero.
   pub fn collect(path: &Path) -> Self {
      let (exists, size_bytes) = file_size(path);
      let (wal_exists, wal_size_bytes) = file_size(&sidecar_path(path, WAL_SUFFIX));
      let (shm_exists, shm_size_bytes) = file_size(&sidecar_path(path, SHM_SUFFIX));

      Self {
         in_memory: false,
         path: Some(path.to_path_buf()),
         exists,
         size_bytes,
         wal_exists,
         wal_size_bytes,
         shm_exists,
         shm_size_bytes,
      }
   }
}

fn file_size(path: &Path) -> (bool, u64) {
   match std::fs::metadata(path) {
      Ok(meta) if meta.is_file() => (true, meta.len()),
      _ => (false, 0),
   }
}

/// Delete one file, retrying while another handle keeps it locked.
///
/// A file that does not exist counts as deleted. Only the final attempt's
/// failure is returned.
pub async fn remove_file_with_retry(path: &Path, policy: RetryPolicy) -> Result<()> {
   let attempts = policy.attempts.max(1);

   for attempt in 1..=attempts {
      match tokio::fs::remove_file(path).await {
         Ok(()) => {
            debug!(path = %path.display(), attempt, "Deleted database file");
            return Ok(());
         }
         Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
         Err(e) if attempt < attempts => {
            let delay = policy.delay_after(attempt);
            warn!(
               path = %path.display(),
               attempt,
               error = %e,
               ?delay,
               "Database file still locked, retrying"
            );
            tokio::time::sleep(delay).await;
         }
         Err(e) => {
            return Err(Error::FileLocked {
               path: path.to_path_buf(),
               attempts,
               source: e,
            });
         }
      }
   }

   Ok(())
}

/// Delete the main database file and its `-wal`, `-shm` and `-journal`
/// siblings.
pub async fn remove_database_files(path: &Path, policy: RetryPolicy) -> Result<()> {
   for file in database_files(path) {
      remove_file_with_retry(&file, policy).await?;
   }
   Ok(())
}
