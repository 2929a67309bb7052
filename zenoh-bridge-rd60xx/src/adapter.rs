//! Bus adapter: zenoh session handling, inbound control topics, and the
//! outbound publish loop.
//!
//! Inbound samples are translated into typed requests and handed to the
//! registry/dispatcher; malformed payloads are logged and dropped, never
//! propagated. Outbound traffic is a single mpsc stream of [`BusEvent`]s
//! drained onto the bus, so device tasks publish without holding a bus
//! handle.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::ZenohConfig;
use crate::dispatcher::Command;
use crate::keyexpr;
use crate::messages::{BusEvent, StateGetRequest, StateSetRequest, StatePayload};
use crate::registry::Registry;

/// Connect to Zenoh using the provided configuration.
pub async fn connect(config: &ZenohConfig) -> Result<zenoh::Session> {
    let mut zenoh_config = zenoh::Config::default();

    let mode_str = match config.mode.as_str() {
        "client" | "peer" | "router" => format!("\"{}\"", config.mode),
        other => anyhow::bail!(
            "Invalid Zenoh mode: '{}'. Expected 'client', 'peer', or 'router'",
            other
        ),
    };
    zenoh_config
        .insert_json5("mode", &mode_str)
        .map_err(|e| anyhow::anyhow!("Failed to set mode: {}", e))?;

    if !config.connect.is_empty() {
        let endpoints_json = serde_json::to_string(&config.connect)?;
        zenoh_config
            .insert_json5("connect/endpoints", &endpoints_json)
            .map_err(|e| anyhow::anyhow!("Failed to set connect endpoints: {}", e))?;
    }

    if !config.listen.is_empty() {
        let endpoints_json = serde_json::to_string(&config.listen)?;
        zenoh_config
            .insert_json5("listen/endpoints", &endpoints_json)
            .map_err(|e| anyhow::anyhow!("Failed to set listen endpoints: {}", e))?;
    }

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Connecting to Zenoh"
    );

    let session = zenoh::open(zenoh_config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open Zenoh session: {}", e))?;

    tracing::info!(zid = %session.zid(), "Connected to Zenoh");

    Ok(session)
}

/// Translates inbound control samples into registry/dispatcher calls.
///
/// Holds no bus handle itself, so the message handling is testable without a
/// zenoh session; [`run_inbound`] feeds it.
pub struct InboundHandler {
    prefix: String,
    registry: Arc<Registry>,
    events: mpsc::Sender<BusEvent>,
}

impl InboundHandler {
    pub fn new(prefix: String, registry: Arc<Registry>, events: mpsc::Sender<BusEvent>) -> Self {
        Self {
            prefix,
            registry,
            events,
        }
    }

    /// `psu/list/get`: publish the current device list. Any payload counts
    /// as a request.
    pub async fn handle_list_get(&self) {
        debug!("device list requested");
        let _ = self.events.send(BusEvent::List(self.registry.list())).await;
    }

    /// `psu/{identity}/state/get`: publish cached connectivity state, or
    /// force an immediate read when `{"query": true}` and the unit is
    /// connected. The on-demand path bypasses the poll scheduler entirely.
    pub async fn handle_state_get(&self, key: &str, payload: &[u8]) {
        let Some(identity) = keyexpr::identity_from_key(&self.prefix, key) else {
            return;
        };
        let identity = identity.to_string();

        let request = if payload.is_empty() {
            StateGetRequest::default()
        } else {
            match serde_json::from_slice::<StateGetRequest>(payload) {
                Ok(request) => request,
                Err(err) => {
                    warn!(%identity, %err, "dropping malformed state/get payload");
                    return;
                }
            }
        };

        debug!(%identity, query = request.query, "state requested");

        if request.query {
            if let Some(dispatcher) = self.registry.dispatcher(&identity) {
                let registry = self.registry.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    match dispatcher.read_telemetry().await {
                        Ok(snapshot) => {
                            registry.update_snapshot(&identity, snapshot.clone());
                            let period = registry.stored_period(&identity);
                            let _ = events
                                .send(BusEvent::State {
                                    identity,
                                    payload: StatePayload::full(period, snapshot),
                                })
                                .await;
                        }
                        Err(err) => {
                            warn!(%identity, %err, "on-demand query failed");
                            let connected =
                                registry.get(&identity).is_some_and(|view| view.connected);
                            let period = registry.stored_period(&identity);
                            let _ = events
                                .send(BusEvent::State {
                                    identity,
                                    payload: StatePayload::connectivity(connected, period),
                                })
                                .await;
                        }
                    }
                });
                return;
            }
            // Disconnected identity: fall through to the cached answer; no
            // wire traffic is possible.
        }

        let view = self.registry.get(&identity);
        let connected = view.as_ref().is_some_and(|v| v.connected);
        let period = view.map(|v| v.period).unwrap_or(0.0);
        let _ = self
            .events
            .send(BusEvent::State {
                identity,
                payload: StatePayload::connectivity(connected, period),
            })
            .await;
    }

    /// `psu/{identity}/state/set`: apply the present fields. The period is
    /// handled locally; everything else becomes one dispatcher command on
    /// the device's queue.
    pub async fn handle_state_set(&self, key: &str, payload: &[u8]) {
        let Some(identity) = keyexpr::identity_from_key(&self.prefix, key) else {
            return;
        };
        let identity = identity.to_string();

        let request = match serde_json::from_slice::<StateSetRequest>(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(%identity, %err, "dropping malformed state/set payload");
                return;
            }
        };

        if let Some(period) = request.period {
            if self.registry.set_period(&identity, period) {
                debug!(%identity, period, "poll period updated");
            } else {
                debug!(%identity, "period update for unknown identity dropped");
            }
        }

        if request.set.is_empty() {
            return;
        }
        let Some(dispatcher) = self.registry.dispatcher(&identity) else {
            debug!(%identity, "state write for disconnected identity dropped");
            return;
        };
        debug!(%identity, set = ?request.set, "state write");
        tokio::spawn(async move {
            // Resolution is logged, not published: the next poll or query
            // reflects the applied state.
            if let Err(err) = dispatcher.submit(Command::ApplySet(request.set)).await {
                warn!(%identity, %err, "state write failed");
            }
        });
    }
}

/// Subscribe to the control topics and dispatch inbound samples until the
/// session errors.
pub async fn run_inbound(session: zenoh::Session, handler: InboundHandler) -> Result<()> {
    let list_get = session
        .declare_subscriber(keyexpr::list_get_key(&handler.prefix))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to subscribe to list/get: {}", e))?;
    let state_get = session
        .declare_subscriber(keyexpr::state_get_wildcard(&handler.prefix))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to subscribe to state/get: {}", e))?;
    let state_set = session
        .declare_subscriber(keyexpr::state_set_wildcard(&handler.prefix))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to subscribe to state/set: {}", e))?;

    info!(prefix = %handler.prefix, "Bus adapter subscribed");

    loop {
        tokio::select! {
            sample = list_get.recv_async() => {
                let _sample = sample.map_err(|e| anyhow::anyhow!("{}", e))?;
                handler.handle_list_get().await;
            }
            sample = state_get.recv_async() => {
                let sample = sample.map_err(|e| anyhow::anyhow!("{}", e))?;
                let payload = sample.payload().to_bytes();
                handler
                    .handle_state_get(sample.key_expr().as_str(), &payload)
                    .await;
            }
            sample = state_set.recv_async() => {
                let sample = sample.map_err(|e| anyhow::anyhow!("{}", e))?;
                let payload = sample.payload().to_bytes();
                handler
                    .handle_state_set(sample.key_expr().as_str(), &payload)
                    .await;
            }
        }
    }
}

/// Drain publish events onto the bus. Publishing is fire-and-forget:
/// failures are logged and never propagate back to device tasks.
pub async fn run_outbound(
    session: zenoh::Session,
    prefix: String,
    mut events: mpsc::Receiver<BusEvent>,
) {
    while let Some(event) = events.recv().await {
        let (key, encoded) = match &event {
            BusEvent::List(entries) => (keyexpr::list_key(&prefix), serde_json::to_vec(entries)),
            BusEvent::State { identity, payload } => (
                keyexpr::state_key(&prefix, identity),
                serde_json::to_vec(payload),
            ),
        };

        match encoded {
            Ok(bytes) => {
                if let Err(err) = session.put(&key, bytes).await {
                    warn!(%key, %err, "publish failed");
                } else {
                    trace!(%key, "published");
                }
            }
            Err(err) => {
                warn!(%key, %err, "failed to encode bus payload");
            }
        }
    }
}
