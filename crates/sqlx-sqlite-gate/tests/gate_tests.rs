use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sqlx::Row;
use sqlx_sqlite_gate::{
   ActivityListener, DatabaseLocation, Error, GateActivity, GateActivityKind, ReadGateMode,
   RetryPolicy, SqliteDatabase, SqliteDatabaseConfig, database_files,
};
use tempfile::TempDir;

async fn create_test_db(config: Option<SqliteDatabaseConfig>) -> (Arc<SqliteDatabase>, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let db_path = temp_dir.path().join("test.db");
   let db = SqliteDatabase::connect(db_path, config)
      .await
      .expect("Failed to connect to test database");

   (db, temp_dir)
}

fn fast_delete_config() -> SqliteDatabaseConfig {
   SqliteDatabaseConfig {
      delete_retry: RetryPolicy {
         attempts: 5,
         backoff: Duration::from_millis(5),
      },
      handle_release_delay: Duration::from_millis(5),
      ..Default::default()
   }
}

#[tokio::test]
async fn test_pragmas_applied_on_connect() {
   let (db, _temp) = create_test_db(None).await;

   let pragmas = db.pragma_snapshot().await.unwrap();
   assert_eq!(pragmas.get("journal_mode").map(String::as_str), Some("wal"));
   assert_eq!(pragmas.get("busy_timeout").map(String::as_str), Some("5000"));
   assert_eq!(pragmas.get("foreign_keys").map(String::as_str), Some("1"));
   assert_eq!(pragmas.get("cache_size").map(String::as_str), Some("-20000"));

   db.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_keeps_wal() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("reconnect.db");

   let db = SqliteDatabase::connect(path.clone(), None).await.unwrap();
   db.close().await.unwrap();
   assert!(db.is_closed());

   let db = SqliteDatabase::connect(path, None).await.unwrap();
   let pragmas = db.pragma_snapshot().await.unwrap();
   assert_eq!(pragmas.get("journal_mode").map(String::as_str), Some("wal"));
   assert_eq!(pragmas.get("busy_timeout").map(String::as_str), Some("5000"));

   db.close().await.unwrap();
}

#[tokio::test]
async fn test_zero_timeout_fails_fast_while_writer_held() {
   let (db, _temp) = create_test_db(None).await;

   let held = db.acquire_writer().await.unwrap();

   let started = Instant::now();
   let err = db
      .acquire_writer_timeout(Duration::ZERO)
      .await
      .err()
      .expect("second writer must not be admitted");
   assert!(matches!(err, Error::WriteGateTimeout(_)));
   assert!(started.elapsed() < Duration::from_millis(250));

   drop(held);

   let writer = db.acquire_writer_timeout(Duration::ZERO).await;
   assert!(writer.is_ok(), "gate should be free after release");
}

#[tokio::test]
async fn test_bounded_wait_times_out() {
   let config = SqliteDatabaseConfig {
      write_timeout: Duration::from_millis(50),
      ..Default::default()
   };
   let (db, _temp) = create_test_db(Some(config)).await;

   let _held = db.acquire_writer().await.unwrap();

   let started = Instant::now();
   let err = db.acquire_writer().await.err().unwrap();
   let waited = started.elapsed();

   assert!(matches!(err, Error::WriteGateTimeout(t) if t == Duration::from_millis(50)));
   assert!(waited >= Duration::from_millis(50));
   assert!(waited < Duration::from_secs(2));
}

#[tokio::test]
async fn test_writer_waits_for_release() {
   let (db, _temp) = create_test_db(None).await;

   let held = db.acquire_writer().await.unwrap();

   let waiter = {
      let db = Arc::clone(&db);
      tokio::spawn(async move { db.acquire_writer().await.map(|_| ()) })
   };

   tokio::time::sleep(Duration::from_millis(20)).await;
   assert!(!waiter.is_finished());

   drop(held);
   waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_discarded_writer_connection_is_replaced() {
   let (db, _temp) = create_test_db(None).await;

   let mut writer = db.acquire_writer().await.unwrap();
   assert!(format!("{writer:?}").contains("writers: 1"));
   sqlx::query("CREATE TEMP TABLE scratch (id INTEGER)")
      .execute(&mut *writer)
      .await
      .unwrap();
   writer.discard_connection();
   drop(writer);

   // Temp tables live and die with their connection
   let mut writer = db.acquire_writer().await.unwrap();
   let found: i64 =
      sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_temp_master WHERE name = 'scratch'")
         .fetch_one(&mut *writer)
         .await
         .unwrap();
   assert_eq!(found, 0);

   let reader = db.acquire_reader().await.unwrap();
   assert!(format!("{reader:?}").starts_with("ReadGuard"));
}

#[tokio::test]
async fn test_concurrent_readers_admitted() {
   let (db, _temp) = create_test_db(None).await;

   let first = db.acquire_reader().await.unwrap();
   let second = tokio::time::timeout(Duration::from_millis(200), db.acquire_reader())
      .await
      .expect("concurrent read gate admits a second reader")
      .unwrap();

   assert_eq!(db.activity().active_readers(), 2);
   drop(first);
   drop(second);
   assert_eq!(db.activity().active_readers(), 0);
}

#[tokio::test]
async fn test_serialized_readers() {
   let config = SqliteDatabaseConfig {
      read_gate: ReadGateMode::Serialized,
      ..Default::default()
   };
   let (db, _temp) = create_test_db(Some(config)).await;

   let first = db.acquire_reader().await.unwrap();
   let blocked = tokio::time::timeout(Duration::from_millis(50), db.acquire_reader()).await;
   assert!(blocked.is_err(), "serialized read gate admits one reader");

   drop(first);
   let second = tokio::time::timeout(Duration::from_millis(200), db.acquire_reader()).await;
   assert!(second.is_ok());
}

#[tokio::test]
async fn test_reads_see_committed_writes() {
   let (db, _temp) = create_test_db(None).await;

   let mut writer = db.acquire_writer().await.unwrap();
   sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
      .execute(&mut *writer)
      .await
      .unwrap();
   sqlx::query("INSERT INTO t (name) VALUES (?)")
      .bind("Alice")
      .execute(&mut *writer)
      .await
      .unwrap();
   drop(writer);

   let reader = db.acquire_reader().await.unwrap();
   let row = sqlx::query("SELECT name FROM t WHERE id = 1")
      .fetch_one(reader.pool())
      .await
      .unwrap();
   assert_eq!(row.get::<String, _>("name"), "Alice");
}

#[tokio::test]
async fn test_in_memory_pools_share_database() {
   let db = SqliteDatabase::connect(":memory:", None).await.unwrap();
   assert!(db.is_in_memory());
   assert_eq!(db.location(), &DatabaseLocation::Memory);

   let mut writer = db.acquire_writer().await.unwrap();
   sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY)")
      .execute(&mut *writer)
      .await
      .unwrap();
   sqlx::query("INSERT INTO t (id) VALUES (7)")
      .execute(&mut *writer)
      .await
      .unwrap();
   drop(writer);

   let reader = db.acquire_reader().await.unwrap();
   let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t")
      .fetch_one(reader.pool())
      .await
      .unwrap();
   assert_eq!(count, 1);
   drop(reader);

   let info = db.file_info();
   assert!(info.in_memory);
   assert!(!info.exists);
}

#[derive(Default)]
struct Recorder(Mutex<Vec<GateActivity>>);

impl ActivityListener for Recorder {
   fn on_activity(&self, activity: GateActivity) {
      self.0.lock().unwrap().push(activity);
   }
}

#[tokio::test]
async fn test_activity_listener_sees_each_gate_change() {
   let temp_dir = TempDir::new().unwrap();
   let recorder = Arc::new(Recorder::default());
   let db = SqliteDatabase::connect_with_listener(
      temp_dir.path().join("activity.db"),
      None,
      Some(recorder.clone()),
   )
   .await
   .unwrap();

   drop(db.acquire_writer().await.unwrap());
   drop(db.acquire_reader().await.unwrap());

   let kinds: Vec<_> = recorder.0.lock().unwrap().iter().map(|a| a.kind).collect();
   assert_eq!(
      kinds,
      vec![
         GateActivityKind::WriteStarted,
         GateActivityKind::WriteEnded,
         GateActivityKind::ReadStarted,
         GateActivityKind::ReadEnded,
      ]
   );
}

#[tokio::test]
async fn test_closed_database_rejects_gates() {
   let (db, _temp) = create_test_db(None).await;
   db.close().await.unwrap();

   assert!(matches!(
      db.acquire_writer().await.err(),
      Some(Error::DatabaseClosed)
   ));
   assert!(matches!(
      db.acquire_reader().await.err(),
      Some(Error::DatabaseClosed)
   ));

   // Closing twice is fine
   db.close().await.unwrap();
}

#[tokio::test]
async fn test_remove_deletes_all_files() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("remove.db");
   let db = SqliteDatabase::connect(path.clone(), Some(fast_delete_config()))
      .await
      .unwrap();

   let mut writer = db.acquire_writer().await.unwrap();
   sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY)")
      .execute(&mut *writer)
      .await
      .unwrap();
   drop(writer);

   assert!(db.file_info().exists);

   db.remove().await.unwrap();

   for file in database_files(&path) {
      assert!(!file.exists(), "{} should be gone", file.display());
   }
}

#[tokio::test]
async fn test_remove_in_memory_fails() {
   let db = SqliteDatabase::connect(":memory:", None).await.unwrap();
   let err = Arc::clone(&db).remove().await.unwrap_err();
   assert!(matches!(err, Error::InMemoryDatabase));

   // Nothing was closed
   assert!(!db.is_closed());
}
