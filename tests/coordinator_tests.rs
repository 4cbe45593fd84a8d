use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlite_access_coordinator::{
   AuthorizationProfile, ConnectionState, Coordinator, CoordinatorConfig, CoordinatorEvent, Entity,
   EntityDescriptor, EntityId, Error, HealthStatus, Operation, Relationship, Statement,
   StreamEvent,
};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Owner {
   id: EntityId,
   name: String,
}

static OWNER: EntityDescriptor = EntityDescriptor {
   kind: "owner",
   table: "owners",
   id_column: "id",
   columns: &["name"],
   create_sql: "CREATE TABLE owners (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
   relationships: &[],
};

impl Entity for Owner {
   fn descriptor() -> &'static EntityDescriptor {
      &OWNER
   }
   fn id(&self) -> EntityId {
      self.id
   }
   fn set_id(&mut self, id: EntityId) {
      self.id = id;
   }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Account {
   id: EntityId,
   owner_id: EntityId,
   balance: i64,
}

static ACCOUNT: EntityDescriptor = EntityDescriptor {
   kind: "account",
   table: "accounts",
   id_column: "id",
   columns: &["owner_id", "balance"],
   create_sql: "CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner_id INTEGER NOT NULL REFERENCES owners(id), balance INTEGER NOT NULL)",
   relationships: &[Relationship {
      column: "owner_id",
      references: "owner",
   }],
};

impl Entity for Account {
   fn descriptor() -> &'static EntityDescriptor {
      &ACCOUNT
   }
   fn id(&self) -> EntityId {
      self.id
   }
   fn set_id(&mut self, id: EntityId) {
      self.id = id;
   }
}

fn account(owner_id: EntityId, balance: i64) -> Account {
   Account {
      id: 0,
      owner_id,
      balance,
   }
}

fn fast_config() -> CoordinatorConfig {
   CoordinatorConfig {
      delete_backoff_ms: 5,
      handle_release_delay_ms: 5,
      ..Default::default()
   }
}

fn build(path: &Path, config: CoordinatorConfig) -> Coordinator {
   Coordinator::builder(path)
      // Registered out of order on purpose; creation order follows relationships
      .register::<Account>()
      .register::<Owner>()
      .config(config)
      .build()
      .expect("Failed to build coordinator")
}

async fn create_test_coordinator() -> (Coordinator, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let coordinator = build(&temp_dir.path().join("test.db"), fast_config());
   coordinator.create().await.expect("Failed to create database");

   (coordinator, temp_dir)
}

async fn seed_owner(coordinator: &Coordinator) -> EntityId {
   let mut owner = Owner {
      id: 0,
      name: "ada".into(),
   };
   coordinator.insert(&mut owner).await.unwrap()
}

#[tokio::test]
async fn test_entity_crud_round() {
   let (coordinator, _temp) = create_test_coordinator().await;
   let owner_id = seed_owner(&coordinator).await;

   let mut first = account(owner_id, 100);
   let id = coordinator.insert(&mut first).await.unwrap();
   assert_eq!(first.id, id);
   assert!(id > 0);

   first.balance = 150;
   assert!(coordinator.update(&first).await.unwrap());
   assert_eq!(coordinator.get::<Account>(id).await.unwrap(), Some(first.clone()));

   let mut second = account(owner_id, 5);
   let second_id = coordinator.upsert(&mut second).await.unwrap();
   second.balance = 6;
   assert_eq!(coordinator.upsert(&mut second).await.unwrap(), second_id);

   let related: Vec<Account> = coordinator.find_related("owner", owner_id).await.unwrap();
   assert_eq!(related, vec![first.clone(), second.clone()]);
   assert_eq!(coordinator.count::<Account>().await.unwrap(), 2);

   assert!(coordinator.delete::<Account>(second_id).await.unwrap());
   assert!(!coordinator.delete::<Account>(second_id).await.unwrap());
   assert_eq!(coordinator.get_all::<Account>().await.unwrap(), vec![first]);
   assert_eq!(coordinator.cached_statement_count(), 2);

   let ghost = Account {
      id: 999,
      ..account(owner_id, 0)
   };
   assert!(!coordinator.update(&ghost).await.unwrap());
   assert!(matches!(
      coordinator.update(&account(owner_id, 0)).await,
      Err(Error::MissingIdentity { kind }) if kind == "account"
   ));
}

#[tokio::test]
async fn test_raw_sql_uses_kind_for_authorization() {
   let (coordinator, _temp) = create_test_coordinator().await;
   let owner_id = seed_owner(&coordinator).await;

   let result = coordinator
      .execute_sql(
         "account",
         "INSERT INTO accounts (owner_id, balance) VALUES (?, ?), (?, ?)",
         vec![json!(owner_id), json!(10), json!(owner_id), json!(20)],
      )
      .await
      .unwrap();
   assert_eq!(result.rows_affected, 2);

   let rows = coordinator
      .query_sql(
         "account",
         "SELECT sum(balance) AS total FROM accounts WHERE owner_id = ?",
         vec![json!(owner_id)],
      )
      .await
      .unwrap();
   assert_eq!(rows[0]["total"], json!(30));
}

#[tokio::test]
async fn test_authorization_is_deterministic() {
   let temp_dir = TempDir::new().unwrap();
   let config = CoordinatorConfig::from_json(
      r#"{
         "authorization": {
            "policy": "custom",
            "kinds": { "owner": { "can_read": true, "can_create": true } },
            "fallback": { "can_read": true }
         }
      }"#,
   )
   .unwrap();
   let coordinator = build(&temp_dir.path().join("authz.db"), config);

   let gate = coordinator.authorization();
   for kind in ["owner", "account", "unregistered"] {
      for operation in [Operation::Create, Operation::Read, Operation::Update, Operation::Delete] {
         let first = gate.decide(kind, operation);
         assert!((0..10).all(|_| gate.decide(kind, operation) == first));
      }
   }
   assert!(gate.decide("owner", Operation::Create));
   assert!(!gate.decide("account", Operation::Create));
   assert!(gate.decide("account", Operation::Read));
}

#[tokio::test]
async fn test_denial_never_contends_for_the_write_gate() {
   let temp_dir = TempDir::new().unwrap();
   let coordinator = build(
      &temp_dir.path().join("denied.db"),
      CoordinatorConfig {
         authorization: AuthorizationProfile::ReadOnly,
         ..fast_config()
      },
   );
   coordinator.create().await.unwrap();

   let held = coordinator.acquire_writer().await.unwrap();

   let started = Instant::now();
   let err = coordinator.insert(&mut account(1, 1)).await.unwrap_err();
   assert!(started.elapsed() < Duration::from_secs(1));
   assert!(matches!(
      err,
      Error::Unauthorized { ref kind, operation: Operation::Create } if kind == "account"
   ));
   assert_eq!(err.error_code(), "UNAUTHORIZED");

   let err = coordinator
      .run_in_transaction_for(&["owner", "account"], |_unit| {
         Box::pin(async move { Ok::<_, Error>(()) })
      })
      .await
      .unwrap_err();
   assert!(matches!(err, Error::Unauthorized { .. }));

   drop(held);
   assert_eq!(coordinator.count::<Account>().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_never_overlap() {
   let (coordinator, _temp) = create_test_coordinator().await;
   let coordinator = Arc::new(coordinator);
   let owner_id = seed_owner(&coordinator).await;

   let inside = Arc::new(AtomicUsize::new(0));
   let max_inside = Arc::new(AtomicUsize::new(0));

   let writers = (0..8).map(|i| {
      let coordinator = Arc::clone(&coordinator);
      let inside = Arc::clone(&inside);
      let max_inside = Arc::clone(&max_inside);

      async move {
         coordinator
            .run_in_transaction(move |unit| {
               Box::pin(async move {
                  let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                  max_inside.fetch_max(now, Ordering::SeqCst);

                  unit.insert(&mut account(owner_id, i)).await?;
                  tokio::time::sleep(Duration::from_millis(10)).await;

                  inside.fetch_sub(1, Ordering::SeqCst);
                  Ok::<_, Error>(())
               })
            })
            .await
      }
   });

   for result in futures::future::join_all(writers).await {
      result.unwrap();
   }

   assert_eq!(max_inside.load(Ordering::SeqCst), 1);
   assert_eq!(coordinator.count::<Account>().await.unwrap(), 8);
}

#[tokio::test]
async fn test_create_then_connect_reports_wal_pragmas() {
   let (coordinator, _temp) = create_test_coordinator().await;
   coordinator.connect().await.unwrap();

   assert!(coordinator.is_connected());
   let pragmas = coordinator.concurrency_pragmas().await.unwrap();
   assert_eq!(pragmas.get("journal_mode").map(String::as_str), Some("wal"));
   assert_eq!(pragmas.get("busy_timeout").map(String::as_str), Some("5000"));
}

#[tokio::test]
async fn test_reconnect_keeps_wal() {
   let (coordinator, _temp) = create_test_coordinator().await;
   let owner_id = seed_owner(&coordinator).await;

   coordinator.disconnect().await.unwrap();
   assert_eq!(coordinator.state(), ConnectionState::Disconnected);
   assert_eq!(coordinator.cached_statement_count(), 0);
   coordinator.connect().await.unwrap();

   let pragmas = coordinator.concurrency_pragmas().await.unwrap();
   assert_eq!(pragmas.get("journal_mode").map(String::as_str), Some("wal"));
   assert_eq!(pragmas.get("busy_timeout").map(String::as_str), Some("5000"));
   assert!(coordinator.get::<Owner>(owner_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_create_keeps_existing_data() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("existing.db");

   let coordinator = build(&path, fast_config());
   coordinator.create().await.unwrap();
   let owner_id = seed_owner(&coordinator).await;
   coordinator.dispose().await.unwrap();

   let coordinator = build(&path, fast_config());
   coordinator.create().await.unwrap();
   assert!(coordinator.get::<Owner>(owner_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_current_removes_every_file() {
   let (coordinator, temp) = create_test_coordinator().await;
   let path = temp.path().join("test.db");
   seed_owner(&coordinator).await;
   assert!(coordinator.file_info().wal_exists);

   coordinator.delete_current().await.unwrap();

   for suffix in ["", "-wal", "-shm", "-journal"] {
      let file = temp.path().join(format!("test.db{suffix}"));
      assert!(!file.exists(), "{} still exists", file.display());
   }
   assert!(!path.exists());
   assert_eq!(coordinator.state(), ConnectionState::Disconnected);
   assert!(!coordinator.file_info().exists);

   // The coordinator can start over on the same path
   coordinator.create().await.unwrap();
   assert_eq!(coordinator.count::<Owner>().await.unwrap(), 0);
}

#[tokio::test]
async fn test_delete_memory_database_returns_error() {
   let coordinator = Coordinator::builder(":memory:").build().unwrap();
   coordinator.create().await.unwrap();

   let err = coordinator.delete_current().await.unwrap_err();
   assert!(matches!(err, Error::InMemoryDatabase));
   assert!(coordinator.is_connected());
}

#[tokio::test]
async fn test_failed_unit_of_work_rolls_back() {
   let (coordinator, _temp) = create_test_coordinator().await;
   let owner_id = seed_owner(&coordinator).await;
   coordinator.insert(&mut account(owner_id, 1)).await.unwrap();

   let err = coordinator
      .run_in_transaction(move |unit| {
         Box::pin(async move {
            unit.insert(&mut account(owner_id, 2)).await?;
            unit.insert(&mut account(owner_id, 3)).await?;
            // Own writes are visible inside the transaction
            assert_eq!(unit.count::<Account>().await?, 3);
            Err::<(), _>(Error::Aborted("changed my mind".into()))
         })
      })
      .await
      .unwrap_err();

   assert!(matches!(err, Error::Aborted(ref reason) if reason == "changed my mind"));
   assert_eq!(coordinator.count::<Account>().await.unwrap(), 1);
}

#[tokio::test]
async fn test_panicking_unit_of_work_rolls_back() {
   let (coordinator, _temp) = create_test_coordinator().await;
   let owner_id = seed_owner(&coordinator).await;

   let outcome = AssertUnwindSafe(coordinator.run_in_transaction(move |unit| {
      Box::pin(async move {
         let id = unit.insert(&mut account(owner_id, 2)).await?;
         if id > 0 {
            panic!("unit of work blew up");
         }
         Ok::<_, Error>(())
      })
   }))
   .catch_unwind()
   .await;

   assert!(outcome.is_err());
   assert_eq!(coordinator.count::<Account>().await.unwrap(), 0);
   // The writer went back to the gate
   assert!(coordinator.acquire_writer_timeout(Duration::ZERO).await.is_ok());
}

#[tokio::test]
async fn test_cancelled_unit_of_work_leaves_writer_clean() {
   let (coordinator, temp) = create_test_coordinator().await;
   let owner_id = seed_owner(&coordinator).await;

   let cancelled = tokio::time::timeout(
      Duration::from_millis(50),
      coordinator.run_in_transaction(move |unit| {
         Box::pin(async move {
            unit.insert(&mut account(owner_id, 7)).await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Error>(())
         })
      }),
   )
   .await;
   assert!(cancelled.is_err());

   // A plain write on the same connection commits on its own
   let kept = coordinator.insert(&mut account(owner_id, 8)).await.unwrap();

   let count = coordinator
      .run_in_transaction(|unit| Box::pin(async move { unit.count::<Account>().await }))
      .await
      .unwrap();
   assert_eq!(count, 1);

   coordinator.disconnect().await.unwrap();
   let reopened = build(&temp.path().join("test.db"), fast_config());
   reopened.connect().await.unwrap();

   let accounts: Vec<Account> = reopened.get_all().await.unwrap();
   assert_eq!(accounts.len(), 1);
   assert_eq!(accounts[0].id, kept);
   assert_eq!(accounts[0].balance, 8);
}

#[tokio::test]
async fn test_failed_rollback_reports_both_errors() {
   let (coordinator, _temp) = create_test_coordinator().await;
   let owner_id = seed_owner(&coordinator).await;

   let err = coordinator
      .run_in_transaction(move |unit| {
         Box::pin(async move {
            unit.insert(&mut account(owner_id, 9)).await?;
            // Ends the transaction underneath the unit of work
            unit.execute_sql("account", "COMMIT", vec![]).await?;
            Err::<(), _>(Error::Aborted("gave up after committing".into()))
         })
      })
      .await
      .unwrap_err();

   match &err {
      Error::TransactionRollbackFailed {
         transaction_error,
         rollback_error,
      } => {
         assert!(transaction_error.contains("gave up after committing"));
         assert!(rollback_error.contains("no transaction is active"));
      }
      other => panic!("expected a rollback failure, got {other:?}"),
   }
   assert_eq!(err.error_code(), "TRANSACTION_ROLLBACK_FAILED");

   // The writer connection was replaced, so transactions work again
   let count = coordinator
      .run_in_transaction(|unit| Box::pin(async move { unit.count::<Account>().await }))
      .await
      .unwrap();
   assert_eq!(count, 1);
   assert!(coordinator.is_connected());
}

#[tokio::test]
async fn test_batch_is_atomic() {
   let (coordinator, _temp) = create_test_coordinator().await;
   let owner_id = seed_owner(&coordinator).await;

   let results = coordinator
      .execute_batch(
         "account",
         vec![
            Statement::new(
               "INSERT INTO accounts (owner_id, balance) VALUES (?, ?)",
               vec![json!(owner_id), json!(1)],
            ),
            ("UPDATE accounts SET balance = balance + 1", vec![]).into(),
         ],
      )
      .await
      .unwrap();
   assert_eq!(results[0].rows_affected, 1);
   assert_eq!(results[1].rows_affected, 1);

   let err = coordinator
      .execute_batch(
         "account",
         vec![
            Statement::new(
               "INSERT INTO accounts (owner_id, balance) VALUES (?, ?)",
               vec![json!(owner_id), json!(1)],
            ),
            Statement::new("INSERT INTO nowhere VALUES (1)", vec![]),
         ],
      )
      .await
      .unwrap_err();
   assert!(err.error_code().starts_with("SQLITE_"));
   assert_eq!(coordinator.count::<Account>().await.unwrap(), 1);
}

#[tokio::test]
async fn test_health_check_on_never_connected_coordinator() {
   let temp_dir = TempDir::new().unwrap();
   let coordinator = build(&temp_dir.path().join("never.db"), fast_config());

   let result = coordinator.health_check().await;
   assert_eq!(result.status, HealthStatus::Unhealthy);
   assert!(result.description.contains("disconnected"));
   assert!(!temp_dir.path().join("never.db").exists());
}

#[tokio::test]
async fn test_zero_timeout_writer_fails_fast_while_held() {
   let (coordinator, _temp) = create_test_coordinator().await;
   let held = coordinator.acquire_writer().await.unwrap();
   assert_eq!(coordinator.active_writers(), 1);
   assert!(format!("{held:?}").starts_with("WriteGuard"));

   let started = Instant::now();
   let err = coordinator
      .acquire_writer_timeout(Duration::ZERO)
      .await
      .unwrap_err();

   assert!(started.elapsed() < Duration::from_millis(100));
   assert!(matches!(err, Error::LockTimeout(timeout) if timeout.is_zero()));
   assert_eq!(err.error_code(), "LOCK_TIMEOUT");

   drop(held);
   assert_eq!(coordinator.active_writers(), 0);
}

#[tokio::test]
async fn test_write_timeout_applies_to_entity_writes() {
   let temp_dir = TempDir::new().unwrap();
   let coordinator = build(
      &temp_dir.path().join("timeout.db"),
      CoordinatorConfig {
         write_timeout_ms: 50,
         ..fast_config()
      },
   );
   coordinator.create().await.unwrap();
   let owner_id = seed_owner(&coordinator).await;

   let held = coordinator.acquire_writer().await.unwrap();
   let err = coordinator
      .insert(&mut account(owner_id, 1))
      .await
      .unwrap_err();
   assert!(matches!(err, Error::LockTimeout(_)));

   drop(held);
   assert_eq!(coordinator.count::<Account>().await.unwrap(), 0);
}

#[tokio::test]
async fn test_damaged_file_moves_to_corrupted() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("damaged.db");
   std::fs::write(&path, "this is not a database file ".repeat(256)).unwrap();

   let coordinator = build(&path, fast_config());
   let err = coordinator.connect().await.unwrap_err();

   assert!(err.is_corruption(), "unexpected error: {err}");
   assert_eq!(coordinator.state(), ConnectionState::Corrupted);

   let health = coordinator.health_check().await;
   assert_eq!(health.status, HealthStatus::Unhealthy);
   assert!(health.description.contains("corrupted"));

   // Deleting clears the damage and a fresh create works
   coordinator.delete_current().await.unwrap();
   coordinator.create().await.unwrap();
   assert!(coordinator.is_connected());
}

#[tokio::test]
async fn test_state_changes_stream_and_subscribers() {
   let temp_dir = TempDir::new().unwrap();
   let coordinator = build(&temp_dir.path().join("events.db"), fast_config());

   let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
   let id = {
      let seen = Arc::clone(&seen);
      coordinator.subscribe(move |event| {
         if let CoordinatorEvent::StateChanged { from, to } = event {
            seen.lock().push((*from, *to));
         }
      })
   };
   let mut changes = coordinator.state_changes();
   let mut all = coordinator.events();

   coordinator.create().await.unwrap();

   assert_eq!(
      changes.next().await,
      Some(StreamEvent::Event(CoordinatorEvent::StateChanged {
         from: ConnectionState::Disconnected,
         to: ConnectionState::Connecting,
      }))
   );
   assert_eq!(
      changes.next().await,
      Some(StreamEvent::Event(CoordinatorEvent::StateChanged {
         from: ConnectionState::Connecting,
         to: ConnectionState::Connected,
      }))
   );

   // Schema setup went through the write gate after the connection opened
   let mut gate_events = 0;
   while let Some(Some(event)) = all.next().now_or_never() {
      if matches!(event, StreamEvent::Event(CoordinatorEvent::Gate(_))) {
         gate_events += 1;
      }
   }
   assert!(gate_events > 0);

   assert!(coordinator.unsubscribe(id));
   coordinator.disconnect().await.unwrap();

   assert_eq!(
      *seen.lock(),
      vec![
         (ConnectionState::Disconnected, ConnectionState::Connecting),
         (ConnectionState::Connecting, ConnectionState::Connected),
      ]
   );
}
