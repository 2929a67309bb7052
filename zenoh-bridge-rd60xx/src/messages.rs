//! Bus payload types and outbound publish events.

use rd60xx_proto::{Snapshot, StateSet};
use serde::{Deserialize, Serialize};

/// One row of the `psu/list` publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    pub identity: String,
    pub name: String,
    pub model: u16,
    pub serial_no: u32,
}

/// Payload of a `psu/{identity}/state` publish.
///
/// A successful poll or query carries the full snapshot flattened next to the
/// connectivity fields; failures and disconnects carry connectivity only,
/// never stale telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatePayload {
    pub connected: bool,
    pub period: f64,
    #[serde(flatten)]
    pub snapshot: Option<Snapshot>,
}

impl StatePayload {
    /// Connectivity-only payload.
    pub fn connectivity(connected: bool, period: f64) -> Self {
        Self {
            connected,
            period,
            snapshot: None,
        }
    }

    /// Full payload for a fresh snapshot.
    pub fn full(period: f64, snapshot: Snapshot) -> Self {
        Self {
            connected: true,
            period,
            snapshot: Some(snapshot),
        }
    }
}

/// Inbound `state/get` request body. An absent or empty payload means
/// "report cached connectivity state".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateGetRequest {
    #[serde(default)]
    pub query: bool,
}

/// Inbound `state/set` request body. Only present fields are applied;
/// unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateSetRequest {
    pub period: Option<f64>,

    #[serde(flatten)]
    pub set: StateSet,
}

/// Outbound publish event, drained onto the bus by the adapter.
#[derive(Debug, Clone)]
pub enum BusEvent {
    List(Vec<ListEntry>),
    State {
        identity: String,
        payload: StatePayload,
    },
}
