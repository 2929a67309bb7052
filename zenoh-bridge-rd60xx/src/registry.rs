//! Session registry: the single shared mutable resource in the bridge.
//!
//! Keyed by device identity. An entry is created when a unit first
//! identifies and kept across disconnects, so the configured display name
//! and poll period survive reconnects; only the live-session half is
//! detached when the transport dies. All operations take the lock briefly
//! and hand out owned copies, never live views.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

use rd60xx_proto::Snapshot;

use crate::dispatcher::DispatcherHandle;
use crate::messages::ListEntry;

/// Smallest accepted poll period when non-zero, in seconds.
pub const MIN_PERIOD_SECS: f64 = 0.1;

const UNNAMED: &str = "Unnamed";

struct Live {
    generation: u64,
    dispatcher: DispatcherHandle,
    period_tx: watch::Sender<f64>,
    poll_task: AbortHandle,
    worker_task: AbortHandle,
}

struct Entry {
    name: String,
    model: u16,
    serial_no: u32,
    period: f64,
    snapshot: Option<Snapshot>,
    generation: u64,
    live: Option<Live>,
}

/// Point-in-time copy of one entry.
#[derive(Debug, Clone)]
pub struct EntryView {
    pub identity: String,
    pub name: String,
    pub model: u16,
    pub serial_no: u32,
    pub connected: bool,
    pub period: f64,
    pub snapshot: Option<Snapshot>,
}

/// Identity-keyed map of known PSUs.
pub struct Registry {
    names: HashMap<String, String>,
    default_period: f64,
    inner: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    /// `names` is the static identity→display-name map from configuration;
    /// `default_period` seeds the poll period of units seen for the first
    /// time.
    pub fn new(names: HashMap<String, String>, default_period: f64) -> Self {
        Self {
            names,
            default_period,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Configured display name for an identity, or "Unnamed".
    pub fn display_name(&self, identity: &str) -> String {
        self.names
            .get(identity)
            .cloned()
            .unwrap_or_else(|| UNNAMED.to_string())
    }

    /// Poll period currently associated with `identity`: the persisted value
    /// for known units, the configured default otherwise.
    pub fn stored_period(&self, identity: &str) -> f64 {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .get(identity)
            .map(|entry| entry.period)
            .unwrap_or(self.default_period)
    }

    /// Attach a live session, creating the entry on first sight.
    ///
    /// An identity keys at most one live session: any previous session under
    /// the same identity has its tasks aborted and is replaced. Returns the
    /// attach generation, which [`Registry::detach_if`] checks on teardown.
    #[allow(clippy::too_many_arguments)]
    pub fn attach(
        &self,
        identity: &str,
        model: u16,
        serial_no: u32,
        dispatcher: DispatcherHandle,
        period_tx: watch::Sender<f64>,
        poll_task: AbortHandle,
        worker_task: AbortHandle,
    ) -> u64 {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let entry = inner.entry(identity.to_string()).or_insert_with(|| Entry {
            name: self.display_name(identity),
            model,
            serial_no,
            period: self.default_period,
            snapshot: None,
            generation: 0,
            live: None,
        });

        if let Some(old) = entry.live.take() {
            debug!(%identity, "replacing live session");
            old.poll_task.abort();
            old.worker_task.abort();
        }

        entry.model = model;
        entry.serial_no = serial_no;
        // Telemetry never carries over from an earlier connection; the first
        // read of the new session repopulates it.
        entry.snapshot = None;
        entry.generation += 1;
        entry.live = Some(Live {
            generation: entry.generation,
            dispatcher,
            period_tx,
            poll_task,
            worker_task,
        });
        entry.generation
    }

    /// Detach the live session if `generation` still matches, aborting its
    /// poll task. The entry itself persists: the last snapshot is retained
    /// (stale, flagged by `connected=false`), period and name are kept.
    /// Returns whether a detach happened.
    pub fn detach_if(&self, identity: &str, generation: u64) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(entry) = inner.get_mut(identity) else {
            return false;
        };
        if !entry
            .live
            .as_ref()
            .is_some_and(|live| live.generation == generation)
        {
            return false;
        }
        if let Some(live) = entry.live.take() {
            live.poll_task.abort();
        }
        true
    }

    /// Replace the stored telemetry snapshot.
    pub fn update_snapshot(&self, identity: &str, snapshot: Snapshot) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(entry) = inner.get_mut(identity) {
            entry.snapshot = Some(snapshot);
        }
    }

    /// Update the poll period for a known identity, notifying a live poll
    /// task. Non-zero values are clamped up to [`MIN_PERIOD_SECS`]. Returns
    /// false for identities never seen.
    pub fn set_period(&self, identity: &str, period: f64) -> bool {
        if !period.is_finite() || period < 0.0 {
            return false;
        }
        let period = if period > 0.0 {
            period.max(MIN_PERIOD_SECS)
        } else {
            0.0
        };

        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(entry) = inner.get_mut(identity) else {
            return false;
        };
        entry.period = period;
        if let Some(live) = &entry.live {
            let _ = live.period_tx.send(period);
        }
        true
    }

    /// Copy of one entry.
    pub fn get(&self, identity: &str) -> Option<EntryView> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.get(identity).map(|entry| EntryView {
            identity: identity.to_string(),
            name: entry.name.clone(),
            model: entry.model,
            serial_no: entry.serial_no,
            connected: entry.live.is_some(),
            period: entry.period,
            snapshot: entry.snapshot.clone(),
        })
    }

    /// Submission handle for a connected identity.
    pub fn dispatcher(&self, identity: &str) -> Option<DispatcherHandle> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .get(identity)?
            .live
            .as_ref()
            .map(|live| live.dispatcher.clone())
    }

    /// List of currently connected units, sorted by identity.
    pub fn list(&self) -> Vec<ListEntry> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut entries: Vec<ListEntry> = inner
            .iter()
            .filter(|(_, entry)| entry.live.is_some())
            .map(|(identity, entry)| ListEntry {
                identity: identity.clone(),
                name: entry.name.clone(),
                model: entry.model,
                serial_no: entry.serial_no,
            })
            .collect();
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        entries
    }

    /// Abort every live session's tasks (process shutdown).
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        for entry in inner.values_mut() {
            if let Some(live) = entry.live.take() {
                live.poll_task.abort();
                live.worker_task.abort();
            }
        }
    }
}
