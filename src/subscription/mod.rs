//! Bridges downstream GraphQL subscriptions into per-instance event channels.
//!
//! The bridge owns a registry of at most one connection per instance id. Each connection
//! runs in its own task, handles frames strictly in arrival order and publishes
//! [`BridgeEvent`]s on a broadcast channel that HTTP handlers subscribe to.

pub mod protocol;
pub mod transport;

use crate::upstream::{validate_relative_path, ProxyError};
use crate::validator::{validate, AddressPolicy};
use futures::{SinkExt, StreamExt};
use protocol::{IncomingFrame, OutgoingFrame, SYSTEM_STATS_ID, SYSTEM_STATS_QUERY};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

pub use transport::{
    Connector, SubscriptionTarget, SubscriptionTransportError, Transport, WsConnector,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Subscribed,
    Closing,
    Closed,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SubscriptionFault {
    /// `error` / `connection_error` frame payload from the downstream server.
    Graphql(Value),
    Transport(SubscriptionTransportError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum BridgeEvent {
    Stats(Value),
    Error(SubscriptionFault),
    Closed,
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub endpoint_path: String,
    pub connect_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            endpoint_path: "/graphql".to_string(),
            connect_timeout: Duration::from_secs(10),
            event_buffer: 64,
        }
    }
}

/// Read-only view of a registered connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandleSnapshot {
    pub instance_id: String,
    pub connection_id: Uuid,
    pub target_url: String,
    pub state: ConnectionState,
    pub transport_open: bool,
    pub active_subscription_ids: BTreeSet<String>,
}

#[derive(Debug)]
struct SubscriptionHandle {
    connection_id: Uuid,
    target: SubscriptionTarget,
    state: ConnectionState,
    transport_open: bool,
    active_subscription_ids: BTreeSet<String>,
    // Dropping or firing this ends the connection task without events.
    shutdown: Option<oneshot::Sender<()>>,
}

impl SubscriptionHandle {
    fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

struct Shared {
    handles: Mutex<HashMap<String, SubscriptionHandle>>,
    channels: Mutex<HashMap<String, broadcast::Sender<BridgeEvent>>>,
    options: BridgeOptions,
    connector: Arc<dyn Connector>,
}

#[derive(Clone)]
pub struct SubscriptionBridge {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SubscriptionBridge {
    pub fn new(options: BridgeOptions) -> Result<Self, ProxyError> {
        Self::with_connector(options, Arc::new(WsConnector))
    }

    pub fn with_connector(
        options: BridgeOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ProxyError> {
        validate_relative_path(&options.endpoint_path)?;
        Ok(Self {
            shared: Arc::new(Shared {
                handles: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                options,
                connector,
            }),
        })
    }

    /// Replaces any connection for `instance_id` with a new one to `url`.
    ///
    /// Only an invalid URL is reported here, before the existing connection is touched.
    /// Connect and protocol failures arrive later as events. Must be called from within
    /// a Tokio runtime.
    pub fn subscribe(
        &self,
        instance_id: &str,
        url: &str,
        api_key: Option<&str>,
    ) -> Result<(), ProxyError> {
        let base = validate(url, AddressPolicy::AllowPrivate)?;
        let target = SubscriptionTarget {
            url: format!("{}{}", base.websocket_base(), self.shared.options.endpoint_path),
            api_key: api_key.map(str::to_string),
        };

        let connection_id = Uuid::new_v4();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let previous = lock(&self.shared.handles).insert(
            instance_id.to_string(),
            SubscriptionHandle {
                connection_id,
                target: target.clone(),
                state: ConnectionState::Connecting,
                transport_open: false,
                active_subscription_ids: BTreeSet::new(),
                shutdown: Some(shutdown_tx),
            },
        );
        if let Some(previous) = previous {
            tracing::info!(instance = instance_id, "replacing existing subscription");
            previous.stop();
        }

        tracing::info!(instance = instance_id, url = %target.url, "subscribing");
        tokio::spawn(run_connection(
            self.shared.clone(),
            instance_id.to_string(),
            connection_id,
            target,
            shutdown_rx,
        ));
        Ok(())
    }

    /// Stops every active subscription id, closes the transport and forgets the handle.
    /// Unknown ids are a no-op. Emits no events.
    pub fn unsubscribe(&self, instance_id: &str) {
        let removed = lock(&self.shared.handles).remove(instance_id);
        if let Some(handle) = removed {
            tracing::info!(instance = instance_id, "unsubscribed");
            handle.stop();
        }
    }

    pub fn unsubscribe_all(&self) {
        let drained: Vec<(String, SubscriptionHandle)> =
            lock(&self.shared.handles).drain().collect();
        for (instance_id, handle) in drained {
            tracing::info!(instance = %instance_id, "unsubscribed");
            handle.stop();
        }
    }

    pub fn is_connected(&self, instance_id: &str) -> bool {
        lock(&self.shared.handles)
            .get(instance_id)
            .map(|handle| handle.transport_open)
            .unwrap_or(false)
    }

    pub fn state(&self, instance_id: &str) -> Option<ConnectionState> {
        lock(&self.shared.handles)
            .get(instance_id)
            .map(|handle| handle.state)
    }

    pub fn snapshot(&self, instance_id: &str) -> Option<HandleSnapshot> {
        lock(&self.shared.handles)
            .get(instance_id)
            .map(|handle| HandleSnapshot {
                instance_id: instance_id.to_string(),
                connection_id: handle.connection_id,
                target_url: handle.target.url.clone(),
                state: handle.state,
                transport_open: handle.transport_open,
                active_subscription_ids: handle.active_subscription_ids.clone(),
            })
    }

    pub fn active_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.shared.handles).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Receiver for one instance's events. The channel outlives reconnects.
    pub fn events(&self, instance_id: &str) -> broadcast::Receiver<BridgeEvent> {
        self.shared.sender(instance_id).subscribe()
    }
}

impl Shared {
    fn sender(&self, instance_id: &str) -> broadcast::Sender<BridgeEvent> {
        lock(&self.channels)
            .entry(instance_id.to_string())
            .or_insert_with(|| broadcast::channel(self.options.event_buffer.max(1)).0)
            .clone()
    }

    fn emit(&self, instance_id: &str, event: BridgeEvent) {
        let sender = lock(&self.channels).get(instance_id).cloned();
        if let Some(sender) = sender {
            // No receivers is fine; events are not buffered for late listeners.
            let _ = sender.send(event);
        }
    }

    fn is_current(&self, instance_id: &str, connection_id: Uuid) -> bool {
        lock(&self.handles)
            .get(instance_id)
            .map(|handle| handle.connection_id == connection_id)
            .unwrap_or(false)
    }

    fn update(&self, instance_id: &str, connection_id: Uuid, f: impl FnOnce(&mut SubscriptionHandle)) {
        if let Some(handle) = lock(&self.handles).get_mut(instance_id) {
            if handle.connection_id == connection_id {
                f(handle);
            }
        }
    }

    /// Removes the handle only if it still belongs to `connection_id`.
    fn remove_if_current(&self, instance_id: &str, connection_id: Uuid) -> bool {
        let mut handles = lock(&self.handles);
        match handles.get(instance_id) {
            Some(handle) if handle.connection_id == connection_id => {
                handles.remove(instance_id);
                true
            }
            _ => false,
        }
    }

    /// Terminal path for connections that ended on their own.
    fn finish(&self, instance_id: &str, connection_id: Uuid, error: Option<SubscriptionTransportError>) {
        if !self.remove_if_current(instance_id, connection_id) {
            return;
        }
        match error {
            Some(err) => {
                tracing::warn!(instance = instance_id, error = %err, state = ?ConnectionState::Errored, "subscription transport failed");
                self.emit(
                    instance_id,
                    BridgeEvent::Error(SubscriptionFault::Transport(err)),
                );
            }
            None => {
                tracing::info!(instance = instance_id, state = ?ConnectionState::Closed, "subscription closed by peer");
            }
        }
        self.emit(instance_id, BridgeEvent::Closed);
    }
}

/// Per-connection protocol state, independent of the socket.
#[derive(Debug)]
struct Session {
    state: ConnectionState,
    active: BTreeSet<String>,
}

#[derive(Debug, Default, PartialEq)]
struct Reaction {
    reply: Option<OutgoingFrame>,
    event: Option<BridgeEvent>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            active: BTreeSet::new(),
        }
    }

    fn on_frame(&mut self, instance_id: &str, frame: IncomingFrame) -> Reaction {
        match frame.kind.as_str() {
            "connection_ack" => {
                if self.state != ConnectionState::Connecting {
                    tracing::debug!(instance = instance_id, "duplicate connection_ack ignored");
                    return Reaction::default();
                }
                self.state = ConnectionState::Open;
                tracing::info!(instance = instance_id, "connection acknowledged");
                self.state = ConnectionState::Subscribed;
                self.active.insert(SYSTEM_STATS_ID.to_string());
                Reaction {
                    reply: Some(OutgoingFrame::start(SYSTEM_STATS_ID, SYSTEM_STATS_QUERY)),
                    event: None,
                }
            }
            "data" | "next" => {
                if self.state != ConnectionState::Subscribed {
                    tracing::warn!(instance = instance_id, "data frame before subscription dropped");
                    return Reaction::default();
                }
                match frame.data() {
                    Some(data) => Reaction {
                        reply: None,
                        event: Some(BridgeEvent::Stats(data.clone())),
                    },
                    None => {
                        tracing::debug!(instance = instance_id, "data frame without payload.data");
                        Reaction::default()
                    }
                }
            }
            "error" | "connection_error" => Reaction {
                reply: None,
                event: Some(BridgeEvent::Error(SubscriptionFault::Graphql(
                    frame.payload.unwrap_or(Value::Null),
                ))),
            },
            "complete" => {
                if let Some(id) = &frame.id {
                    self.active.remove(id);
                }
                tracing::info!(instance = instance_id, id = ?frame.id, "subscription complete");
                Reaction::default()
            }
            "ka" => Reaction::default(),
            other => {
                tracing::debug!(instance = instance_id, frame_type = other, "unhandled frame type");
                Reaction::default()
            }
        }
    }
}

async fn send_frame(
    sink: &mut transport::FrameSink,
    frame: &OutgoingFrame,
) -> Result<(), SubscriptionTransportError> {
    sink.send(Message::text(frame.to_text()))
        .await
        .map_err(|err| SubscriptionTransportError::Socket {
            detail: err.to_string(),
        })
}

async fn run_connection(
    shared: Arc<Shared>,
    instance_id: String,
    connection_id: Uuid,
    target: SubscriptionTarget,
    mut shutdown: oneshot::Receiver<()>,
) {
    let connect_timeout = shared.options.connect_timeout;
    let connect = tokio::time::timeout(connect_timeout, shared.connector.connect(&target));

    let transport = tokio::select! {
        biased;
        _ = &mut shutdown => {
            tracing::debug!(instance = %instance_id, "cancelled while connecting");
            return;
        }
        result = connect => match result {
            Ok(Ok(transport)) => transport,
            Ok(Err(err)) => {
                shared.finish(&instance_id, connection_id, Some(err));
                return;
            }
            Err(_) => {
                let err = SubscriptionTransportError::ConnectTimeout {
                    timeout_ms: connect_timeout.as_millis() as u64,
                };
                shared.finish(&instance_id, connection_id, Some(err));
                return;
            }
        }
    };

    let Transport { mut sink, mut stream } = transport;
    shared.update(&instance_id, connection_id, |handle| handle.transport_open = true);
    tracing::info!(instance = %instance_id, url = %target.url, "websocket connected");

    if let Err(err) = send_frame(&mut sink, &OutgoingFrame::connection_init()).await {
        shared.finish(&instance_id, connection_id, Some(err));
        return;
    }

    let mut session = Session::new();
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                session.state = ConnectionState::Closing;
                let teardown = async {
                    for id in &session.active {
                        let _ = send_frame(&mut sink, &OutgoingFrame::stop(id)).await;
                    }
                    let _ = sink.close().await;
                };
                if tokio::time::timeout(connect_timeout, teardown).await.is_err() {
                    tracing::warn!(instance = %instance_id, "transport close timed out; dropping it");
                } else {
                    tracing::debug!(instance = %instance_id, "transport closed on request");
                }
                return;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!(instance = %instance_id, frame = %text.as_str(), "frame received");
                    let frame = match IncomingFrame::parse(text.as_str()) {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::warn!(instance = %instance_id, error = %err, "dropping unparseable frame");
                            continue;
                        }
                    };
                    let reaction = session.on_frame(&instance_id, frame);
                    if let Some(reply) = reaction.reply {
                        if let Err(err) = send_frame(&mut sink, &reply).await {
                            shared.finish(&instance_id, connection_id, Some(err));
                            return;
                        }
                    }
                    let state = session.state;
                    let active = session.active.clone();
                    shared.update(&instance_id, connection_id, |handle| {
                        handle.state = state;
                        handle.active_subscription_ids = active;
                    });
                    if let Some(event) = reaction.event {
                        if shared.is_current(&instance_id, connection_id) {
                            shared.emit(&instance_id, event);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    shared.finish(&instance_id, connection_id, None);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let err = SubscriptionTransportError::Socket { detail: err.to_string() };
                    shared.finish(&instance_id, connection_id, Some(err));
                    return;
                }
            }
        }
    }
}
