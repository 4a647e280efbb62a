//! Shared service: exactly one context owns the live connection; everyone
//! else calls through it.
//!
//! Leadership is an exclusive named lock held for the provider's lifetime —
//! when the provider deactivates or dies, the lock manager elects the next
//! waiter automatically. Announcements and port requests travel over the
//! hub's broadcast channel; live port ends travel through the hub relay.
//! Every client call is nonce-tracked so responses can arrive out of order
//! and so still-pending calls survive a provider migration by being resent
//! to the new provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use tabsql_error::{Result, TabsqlError};
use tabsql_locks::{LockManager, LockMode};

use crate::hub::{ClientPort, Hub, PortDelivery, port_pair};
use crate::messages::{BrokerMessage, RpcRequest, RpcResponse, random_id};

/// How many times a caller polls for a provider port before giving up.
const PORT_WAIT_RETRIES: u32 = 10;

/// Delay between provider-port polls.
const PORT_WAIT_DELAY: Duration = Duration::from_millis(50);

/// How long one attach attempt waits for its port delivery.
const ATTACH_TIMEOUT: Duration = Duration::from_millis(250);

/// Delay before retrying a handoff whose receiving context was torn down.
const HANDOFF_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Client-side attachment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    /// No provider observed yet.
    Unattached,
    /// Provider announced; handshaking for a port.
    AwaitingProvider,
    /// Port installed; calls flow.
    Attached,
    /// The attached provider was superseded or disappeared.
    ProviderLost,
}

/// The object a provider exposes over the relay: arbitrary method calls on
/// the single shared connection.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Invoke `method` with `args`, returning a value or an error message
    /// that is relayed verbatim to the caller.
    async fn invoke(&self, method: &str, args: Value) -> std::result::Result<Value, String>;
}

struct PendingCall {
    method: String,
    args: Value,
    reply: oneshot::Sender<std::result::Result<Value, String>>,
}

struct ClientShared {
    service: String,
    client_id: String,
    hub: Hub,
    pending: Mutex<HashMap<String, PendingCall>>,
    port: Mutex<Option<mpsc::Sender<RpcRequest>>>,
    state: Mutex<AttachState>,
    provider_id: Mutex<Option<String>>,
    change_counter: AtomicU64,
    relay_rx: tokio::sync::Mutex<mpsc::Receiver<PortDelivery>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    close: CancellationToken,
}

impl ClientShared {
    fn state(&self) -> AttachState {
        *self.state.lock().expect("attach state poisoned")
    }

    fn set_state(&self, state: AttachState) {
        *self.state.lock().expect("attach state poisoned") = state;
    }

    /// Handshake with the announced provider for a dedicated port.
    ///
    /// Loops until a port tagged with our nonce arrives, the attempt is
    /// superseded by a newer provider announcement, or the service closes.
    async fn provider_change(self: Arc<Self>, counter: u64) {
        let mut relay_rx = tokio::select! {
            () = self.close.cancelled() => return,
            guard = self.relay_rx.lock() => guard,
        };
        self.set_state(AttachState::AwaitingProvider);

        loop {
            if self.change_counter.load(Ordering::SeqCst) != counter || self.close.is_cancelled()
            {
                return;
            }

            let nonce = random_id();
            self.hub.publish(BrokerMessage::Request {
                service: self.service.clone(),
                client_id: self.client_id.clone(),
                nonce: nonce.clone(),
            });

            let delivery = tokio::select! {
                () = self.close.cancelled() => return,
                d = tokio::time::timeout(ATTACH_TIMEOUT, relay_rx.recv()) => d,
            };

            match delivery {
                Ok(Some(delivery)) if delivery.nonce == nonce => {
                    // Only install if no newer provider superseded us while
                    // the port was in flight.
                    if self.change_counter.load(Ordering::SeqCst) == counter {
                        self.install_port(delivery.port).await;
                    }
                    return;
                }
                Ok(Some(_stale)) => {
                    debug!(service = %self.service, "discarding stale port delivery");
                }
                Ok(None) => return,
                Err(_) => {
                    // No provider answered this attempt; ask again.
                }
            }
        }
    }

    async fn install_port(self: &Arc<Self>, port: ClientPort) {
        let ClientPort {
            requests,
            mut responses,
        } = port;
        *self.port.lock().expect("port slot poisoned") = Some(requests.clone());

        // Pump responses into the pending table. Out-of-order completion is
        // fine; the nonce pairs each response with its call.
        let me = Arc::clone(self);
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = me.close.cancelled() => break,
                    resp = responses.recv() => match resp {
                        Some(resp) => {
                            let pending = me
                                .pending
                                .lock()
                                .expect("pending table poisoned")
                                .remove(&resp.nonce);
                            match pending {
                                Some(call) => drop(call.reply.send(resp.result)),
                                None => {
                                    debug!(nonce = %resp.nonce, "response for unknown call ignored");
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        if let Some(old) = self
            .pump
            .lock()
            .expect("pump slot poisoned")
            .replace(pump)
        {
            old.abort();
        }
        self.set_state(AttachState::Attached);

        // Resend every still-pending call so no caller-visible request is
        // silently dropped by the migration.
        let resend: Vec<RpcRequest> = self
            .pending
            .lock()
            .expect("pending table poisoned")
            .iter()
            .map(|(nonce, call)| RpcRequest {
                nonce: nonce.clone(),
                method: call.method.clone(),
                args: call.args.clone(),
            })
            .collect();
        for req in resend {
            if requests.send(req).await.is_err() {
                // The new provider vanished already; the next announcement
                // will trigger another resend.
                break;
            }
        }
    }
}

/// One context's handle on a named shared service: client machinery always,
/// provider machinery after [`SharedService::activate`].
pub struct SharedService {
    shared: Arc<ClientShared>,
    locks: LockManager,
    listener: JoinHandle<()>,
    deactivate: Mutex<Option<CancellationToken>>,
    // Held for the lifetime of this context; other contexts observe our
    // death by acquiring it.
    _lifetime: tabsql_locks::LockGuard,
}

impl SharedService {
    /// Join `service` as a client: announce presence, track providers, and
    /// prepare the call proxy.
    pub async fn connect(service: &str, hub: Hub, locks: LockManager) -> Self {
        let client_id = random_id();
        let lifetime = locks.request(&client_id, LockMode::Exclusive).await;
        let relay_rx = hub.register_relay(&client_id);

        let shared = Arc::new(ClientShared {
            service: service.to_owned(),
            client_id,
            hub: hub.clone(),
            pending: Mutex::new(HashMap::new()),
            port: Mutex::new(None),
            state: Mutex::new(AttachState::Unattached),
            provider_id: Mutex::new(None),
            change_counter: AtomicU64::new(0),
            relay_rx: tokio::sync::Mutex::new(relay_rx),
            pump: Mutex::new(None),
            close: CancellationToken::new(),
        });

        let mut rx = hub.subscribe();
        let me = Arc::clone(&shared);
        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = me.close.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(BrokerMessage::Provider { service, provider_id })
                            if service == me.service =>
                        {
                            me.clone().on_provider_announced(provider_id);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "client lagged behind the broadcast channel");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        // Ask any already-active provider to announce itself.
        hub.publish(BrokerMessage::Client {
            service: service.to_owned(),
        });

        Self {
            shared,
            locks,
            listener,
            deactivate: Mutex::new(None),
            _lifetime: lifetime,
        }
    }

    /// This context's identity.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Current client-side attachment state.
    #[must_use]
    pub fn attach_state(&self) -> AttachState {
        self.shared.state()
    }

    /// Identity of the provider this client last attached to.
    #[must_use]
    pub fn provider_id(&self) -> Option<String> {
        self.shared
            .provider_id
            .lock()
            .expect("provider id poisoned")
            .clone()
    }

    /// Call `method` on the shared connection, wherever it lives.
    ///
    /// Concurrent calls may resolve out of order; each caller receives
    /// exactly one resolution even across provider migrations.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value> {
        if self.shared.close.is_cancelled() {
            return Err(TabsqlError::ServiceClosed);
        }

        let nonce = random_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending table poisoned")
            .insert(
                nonce.clone(),
                PendingCall {
                    method: method.to_owned(),
                    args: args.clone(),
                    reply: reply_tx,
                },
            );

        match self.provider_port().await {
            Ok(port) => {
                // A send failure means the provider died mid-handoff; keep
                // the pending entry — the migration path resends it.
                drop(
                    port.send(RpcRequest {
                        nonce: nonce.clone(),
                        method: method.to_owned(),
                        args,
                    })
                    .await,
                );
            }
            Err(err) => {
                self.shared
                    .pending
                    .lock()
                    .expect("pending table poisoned")
                    .remove(&nonce);
                return Err(err);
            }
        }

        match reply_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(detail)) => Err(TabsqlError::RemoteCall { detail }),
            Err(_) => Err(TabsqlError::ServiceClosed),
        }
    }

    /// Wait for a usable provider port, bounded: a client must fail fast
    /// with a clear error rather than hang when no provider ever shows up.
    async fn provider_port(&self) -> Result<mpsc::Sender<RpcRequest>> {
        for _ in 0..PORT_WAIT_RETRIES {
            if let Some(port) = self
                .shared
                .port
                .lock()
                .expect("port slot poisoned")
                .clone()
            {
                if !port.is_closed() {
                    return Ok(port);
                }
            }
            tokio::select! {
                () = self.shared.close.cancelled() => return Err(TabsqlError::ServiceClosed),
                () = tokio::time::sleep(PORT_WAIT_DELAY) => {}
            }
        }
        warn!(service = %self.shared.service, "no provider port after bounded retries");
        Err(TabsqlError::NoProvider)
    }

    /// Compete for leadership of this service.
    ///
    /// Returns immediately; when (if ever) the leadership lock is granted,
    /// this context becomes the provider and serves `handler` until
    /// [`Self::deactivate`] or teardown.
    pub fn activate(&self, handler: Arc<dyn ServiceHandler>) {
        let mut slot = self.deactivate.lock().expect("deactivate slot poisoned");
        if slot.is_some() {
            return;
        }
        let token = self.shared.close.child_token();
        *slot = Some(token.clone());

        tokio::spawn(provider_task(
            self.shared.hub.clone(),
            self.locks.clone(),
            self.shared.service.clone(),
            self.shared.client_id.clone(),
            handler,
            token,
        ));
    }

    /// Step down as provider (or withdraw from the election). The next
    /// waiting context is granted leadership automatically.
    pub fn deactivate(&self) {
        if let Some(token) = self
            .deactivate
            .lock()
            .expect("deactivate slot poisoned")
            .take()
        {
            token.cancel();
        }
    }

    /// Tear down this handle: reject outstanding calls, give up leadership,
    /// stop all background tasks.
    pub fn close(&self) {
        let rejected: Vec<PendingCall> = self
            .shared
            .pending
            .lock()
            .expect("pending table poisoned")
            .drain()
            .map(|(_, call)| call)
            .collect();
        // Dropping the reply senders resolves every waiter with a closed
        // error.
        drop(rejected);

        self.deactivate();
        self.shared.close.cancel();
        if let Some(pump) = self
            .shared
            .pump
            .lock()
            .expect("pump slot poisoned")
            .take()
        {
            pump.abort();
        }
        self.shared.hub.unregister_relay(&self.shared.client_id);
        self.listener.abort();
    }
}

impl ClientShared {
    /// React to a provider announcement on the client side.
    fn on_provider_announced(self: Arc<Self>, provider_id: String) {
        let changed = {
            let mut known = self.provider_id.lock().expect("provider id poisoned");
            if known.as_deref() == Some(provider_id.as_str()) {
                false
            } else {
                *known = Some(provider_id.clone());
                true
            }
        };
        if !changed {
            return;
        }
        debug!(service = %self.service, provider = %provider_id, "provider changed");

        // Discard the old channel; anything it says from now on is void.
        if self.state() == AttachState::Attached {
            self.set_state(AttachState::ProviderLost);
        }
        *self.port.lock().expect("port slot poisoned") = None;
        if let Some(old) = self.pump.lock().expect("pump slot poisoned").take() {
            old.abort();
        }

        let counter = self.change_counter.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(self.provider_change(counter));
    }
}

impl Drop for SharedService {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SharedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedService")
            .field("service", &self.shared.service)
            .field("client_id", &self.shared.client_id)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Provider side
// ---------------------------------------------------------------------------

async fn provider_task(
    hub: Hub,
    locks: LockManager,
    service: String,
    provider_id: String,
    handler: Arc<dyn ServiceHandler>,
    token: CancellationToken,
) {
    // Leader election: whoever holds this lock is the provider. The lock is
    // only released on deactivation or context teardown, at which point the
    // next waiter is elected automatically.
    let lock_name = format!("shared-service-{service}");
    let leadership = tokio::select! {
        () = token.cancelled() => return,
        guard = locks.request(&lock_name, LockMode::Exclusive) => guard,
    };
    debug!(service = %service, provider = %provider_id, "became provider");

    // Subscribe before announcing so our own clients' requests are seen.
    let mut rx = hub.subscribe();
    hub.publish(BrokerMessage::Provider {
        service: service.clone(),
        provider_id: provider_id.clone(),
    });

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            msg = rx.recv() => match msg {
                Ok(BrokerMessage::Client { service: s }) if s == service => {
                    // Late joiners discover us without waiting for an
                    // election.
                    hub.publish(BrokerMessage::Provider {
                        service: service.clone(),
                        provider_id: provider_id.clone(),
                    });
                }
                Ok(BrokerMessage::Request { service: s, client_id, nonce }) if s == service => {
                    serve_request(&hub, &locks, &handler, &token, client_id, nonce).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "provider lagged behind the broadcast channel");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    drop(leadership);
    debug!(service = %service, provider = %provider_id, "provider stepped down");
}

/// Build a dedicated channel pair for a client and hand over its end.
async fn serve_request(
    hub: &Hub,
    locks: &LockManager,
    handler: &Arc<dyn ServiceHandler>,
    token: &CancellationToken,
    client_id: String,
    nonce: String,
) {
    let (client_port, req_rx, resp_tx) = port_pair();
    tokio::spawn(port_server(
        Arc::clone(handler),
        req_rx,
        resp_tx,
        locks.clone(),
        client_id.clone(),
        token.child_token(),
    ));

    let delivery = PortDelivery {
        nonce,
        port: client_port,
    };
    match hub.deliver_port(&client_id, delivery).await {
        Ok(()) => {}
        Err(returned) => {
            // Expected during tab-close races: the receiving context was
            // torn down mid-handoff. Retry once after a short delay.
            warn!(client = %client_id, "port handoff failed; retrying");
            tokio::time::sleep(HANDOFF_RETRY_DELAY).await;
            if hub.deliver_port(&client_id, returned).await.is_err() {
                error!(client = %client_id, "port handoff failed twice; giving up");
            }
        }
    }
}

/// Serve one client's dedicated port until the client or provider goes away.
async fn port_server(
    handler: Arc<dyn ServiceHandler>,
    mut req_rx: mpsc::Receiver<RpcRequest>,
    resp_tx: mpsc::Sender<RpcResponse>,
    locks: LockManager,
    client_id: String,
    token: CancellationToken,
) {
    // The client holds an exclusive lock named by its id for its lifetime.
    // Being granted that lock means the client is gone: reap the port.
    let reaper = locks.request(&client_id, LockMode::Exclusive);
    tokio::pin!(reaper);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _guard = &mut reaper => {
                debug!(client = %client_id, "client context ended; closing port");
                break;
            }
            req = req_rx.recv() => match req {
                None => break,
                Some(req) => {
                    let handler = Arc::clone(&handler);
                    let resp_tx = resp_tx.clone();
                    let token = token.clone();
                    // Calls run concurrently; responses complete in whatever
                    // order the handler finishes them.
                    tokio::spawn(async move {
                        tokio::select! {
                            () = token.cancelled() => {}
                            result = handler.invoke(&req.method, req.args.clone()) => {
                                drop(
                                    resp_tx
                                        .send(RpcResponse { nonce: req.nonce, result })
                                        .await,
                                );
                            }
                        }
                    });
                }
            }
        }
    }
}
