//! Per-device poll scheduler.
//!
//! One task per live registry entry. Each tick submits a full telemetry read
//! through the dispatcher, so automatic polling and on-demand queries share
//! the same one-in-flight queue. The cadence comes from a watch channel fed
//! by the registry: period changes take effect immediately, 0 parks the task
//! until polling is re-enabled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::dispatcher::DispatcherHandle;
use crate::error::CommandError;
use crate::messages::{BusEvent, StatePayload};
use crate::registry::Registry;

pub struct Poller {
    identity: String,
    registry: Arc<Registry>,
    dispatcher: DispatcherHandle,
    events: mpsc::Sender<BusEvent>,
    period_rx: watch::Receiver<f64>,
}

impl Poller {
    pub fn new(
        identity: String,
        registry: Arc<Registry>,
        dispatcher: DispatcherHandle,
        events: mpsc::Sender<BusEvent>,
        period_rx: watch::Receiver<f64>,
    ) -> Self {
        Self {
            identity,
            registry,
            dispatcher,
            events,
            period_rx,
        }
    }

    /// Run until the session dies or the period channel is dropped.
    pub async fn run(self) {
        let mut period_rx = self.period_rx.clone();
        loop {
            let period = *period_rx.borrow_and_update();
            if period <= 0.0 {
                // Polling disabled; park until the configuration changes.
                if period_rx.changed().await.is_err() {
                    break;
                }
                continue;
            }

            tokio::select! {
                changed = period_rx.changed() => {
                    // Restart the wait with the new cadence; the first tick
                    // fires one full period after the change.
                    if changed.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(Duration::from_secs_f64(period)) => {
                    if !self.poll_once().await {
                        break;
                    }
                }
            }
        }
    }

    /// One tick: read, store, publish. Returns false when the session is
    /// gone and the task should end.
    async fn poll_once(&self) -> bool {
        match self.dispatcher.read_telemetry().await {
            Ok(snapshot) => {
                self.registry
                    .update_snapshot(&self.identity, snapshot.clone());
                let period = self.registry.stored_period(&self.identity);
                let _ = self
                    .events
                    .send(BusEvent::State {
                        identity: self.identity.clone(),
                        payload: StatePayload::full(period, snapshot),
                    })
                    .await;
                true
            }
            Err(CommandError::SessionClosed) => false,
            Err(err) => {
                // Failed polls report connectivity only, never stale data.
                warn!(identity = %self.identity, %err, "poll failed");
                let period = self.registry.stored_period(&self.identity);
                let _ = self
                    .events
                    .send(BusEvent::State {
                        identity: self.identity.clone(),
                        payload: StatePayload::connectivity(true, period),
                    })
                    .await;
                true
            }
        }
    }
}
