//! End-to-end connection brokering: one provider owns the store, clients
//! call through it, and leadership migrates without losing calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use tabsql::{
    AttachState, BlockStore, FileKind, Hub, LockManager, MemoryBackend, ServiceHandler,
    SharedService, StoreOptions, TabsqlError,
};

/// A provider-side connection: executes "insert" calls against the block
/// store it owns, appending each statement as a record.
struct Connection {
    store: BlockStore,
}

impl Connection {
    async fn open(backend: MemoryBackend) -> Self {
        let store = BlockStore::new(Arc::new(backend), StoreOptions::default());
        store.open("app.db", FileKind::MainDb, true).await.unwrap();
        Self { store }
    }
}

#[async_trait]
impl ServiceHandler for Connection {
    async fn invoke(&self, method: &str, args: Value) -> Result<Value, String> {
        // A provider that took over from a predecessor must not trust its
        // cached view of the file.
        self.store
            .refresh_metadata("app.db")
            .await
            .map_err(|e| e.to_string())?;
        match method {
            "insert" => {
                let stmt = args
                    .as_array()
                    .and_then(|a| a.first())
                    .and_then(Value::as_str)
                    .ok_or("insert expects one string argument")?;
                let record = format!("{stmt}\n");
                let offset = self
                    .store
                    .file_size("app.db")
                    .await
                    .map_err(|e| e.to_string())?;
                self.store
                    .write_range("app.db", offset, record.as_bytes())
                    .await
                    .map_err(|e| e.to_string())?;
                self.store.flush("app.db").await.map_err(|e| e.to_string())?;
                Ok(json!({ "rows_affected": 1 }))
            }
            "dump" => {
                let size = self
                    .store
                    .file_size("app.db")
                    .await
                    .map_err(|e| e.to_string())?;
                let mut buf = vec![0u8; usize::try_from(size).unwrap()];
                self.store
                    .read_range("app.db", &mut buf, 0)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!(String::from_utf8_lossy(&buf)))
            }
            other => Err(format!("unknown method: {other}")),
        }
    }
}

/// A connection that accepts calls but never answers them, standing in for
/// a context that dies mid-request.
struct WedgedConnection;

#[async_trait]
impl ServiceHandler for WedgedConnection {
    async fn invoke(&self, _method: &str, _args: Value) -> Result<Value, String> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

#[tokio::test(start_paused = true)]
async fn clients_share_one_connection() {
    let hub = Hub::new();
    let locks = LockManager::new();
    let backend = MemoryBackend::new();

    let provider = SharedService::connect("db", hub.clone(), locks.clone()).await;
    provider.activate(Arc::new(Connection::open(backend).await));

    let client_a = SharedService::connect("db", hub.clone(), locks.clone()).await;
    let client_b = SharedService::connect("db", hub, locks).await;

    client_a
        .call("insert", json!(["INSERT INTO notes VALUES ('a')"]))
        .await
        .unwrap();
    client_b
        .call("insert", json!(["INSERT INTO notes VALUES ('b')"]))
        .await
        .unwrap();

    // Both writes landed on the single shared connection.
    let dump = client_a.call("dump", json!([])).await.unwrap();
    let text = dump.as_str().unwrap();
    assert!(text.contains("('a')"));
    assert!(text.contains("('b')"));
}

#[tokio::test(start_paused = true)]
async fn provider_death_mid_call_resolves_exactly_once() {
    let hub = Hub::new();
    let locks = LockManager::new();
    let backend = MemoryBackend::new();

    // The first provider accepts the call and then goes silent.
    let provider1 = SharedService::connect("db", hub.clone(), locks.clone()).await;
    provider1.activate(Arc::new(WedgedConnection));

    let client = Arc::new(SharedService::connect("db", hub.clone(), locks.clone()).await);
    // Wait until attached so the call is definitely sent to provider 1.
    for _ in 0..200 {
        if client.attach_state() == AttachState::Attached {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(client.attach_state(), AttachState::Attached);

    let c = Arc::clone(&client);
    let call = tokio::spawn(async move {
        c.call("insert", json!(["INSERT INTO notes VALUES ('x')"]))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!call.is_finished(), "call must be pending on the wedged provider");

    // The provider's context is torn down before it ever responds.
    drop(provider1);

    // A second context wins the election within the retry window.
    let provider2 = SharedService::connect("db", hub.clone(), locks.clone()).await;
    provider2.activate(Arc::new(Connection::open(backend.clone()).await));

    // The pending call is retransmitted and resolves successfully, exactly
    // once.
    let result = call.await.unwrap().unwrap();
    assert_eq!(result, json!({ "rows_affected": 1 }));

    // The write happened exactly once on the new provider's connection.
    let dump = client.call("dump", json!([])).await.unwrap();
    let text = dump.as_str().unwrap().to_owned();
    assert_eq!(text.matches("('x')").count(), 1, "duplicate or lost insert");
}

#[tokio::test(start_paused = true)]
async fn client_without_provider_gets_clear_error() {
    let hub = Hub::new();
    let locks = LockManager::new();

    let client = SharedService::connect("db", hub, locks).await;
    let err = client.call("insert", json!(["row"])).await.unwrap_err();
    assert!(matches!(err, TabsqlError::NoProvider));
}

#[tokio::test(start_paused = true)]
async fn graceful_handover_keeps_service_available() {
    let hub = Hub::new();
    let locks = LockManager::new();
    let backend = MemoryBackend::new();

    let provider1 = SharedService::connect("db", hub.clone(), locks.clone()).await;
    provider1.activate(Arc::new(Connection::open(backend.clone()).await));

    let provider2 = SharedService::connect("db", hub.clone(), locks.clone()).await;
    provider2.activate(Arc::new(Connection::open(backend.clone()).await));

    let client = SharedService::connect("db", hub, locks).await;
    client.call("insert", json!(["first"])).await.unwrap();

    provider1.deactivate();

    // The service stays reachable through the successor; transient no
    // provider windows are retryable.
    let mut delivered = false;
    for _ in 0..50 {
        match client.call("insert", json!(["second"])).await {
            Ok(_) => {
                delivered = true;
                break;
            }
            Err(err) if err.is_transient() || matches!(err, TabsqlError::NoProvider) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(err) => panic!("unexpected error during handover: {err}"),
        }
    }
    assert!(delivered, "handover never completed");

    let dump = client.call("dump", json!([])).await.unwrap();
    let text = dump.as_str().unwrap();
    // Both providers share the backend, so both inserts are durable.
    assert!(text.contains("first"));
    assert!(text.contains("second"));
}
