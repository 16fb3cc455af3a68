//! Per-server slot arena.
//!
//! One slot per server id holds the server's current phase, whether a tick
//! owns it, when its last tick started and that tick's report. A tick owns a
//! slot through a [`SlotGuard`]; dropping the guard releases the slot and
//! returns it to [`ServerPhase::Idle`] whatever path the tick took.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use super::report::TickReport;

/// Where a server's tick currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerPhase {
    #[default]
    Idle,
    Connecting,
    Listing,
    Draining,
    Committing,
}

#[derive(Debug, Default)]
struct Slot {
    phase: ServerPhase,
    busy: bool,
    last_started: Option<Instant>,
    last_report: Option<TickReport>,
}

/// Slots keyed by server id.
#[derive(Debug, Default)]
pub struct SlotArena {
    slots: Mutex<HashMap<String, Slot>>,
}

impl SlotArena {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim a server's slot, or `None` if a tick already owns it.
    pub fn try_acquire(self: &Arc<Self>, server_id: &str) -> Option<SlotGuard> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(server_id.to_string()).or_default();
        if slot.busy {
            return None;
        }
        slot.busy = true;
        slot.last_started = Some(Instant::now());
        let busy = slots.values().filter(|s| s.busy).count();
        drop(slots);

        gauge!("scheduler_slots_busy").set(busy as f64);
        Some(SlotGuard {
            arena: Arc::clone(self),
            server_id: server_id.to_string(),
        })
    }

    /// Whether `interval` has elapsed since the server's last start. Servers
    /// never started are due.
    pub fn is_due(&self, server_id: &str, interval: Duration, now: Instant) -> bool {
        match self.slots.lock().get(server_id).and_then(|s| s.last_started) {
            Some(started) => now.saturating_duration_since(started) >= interval,
            None => true,
        }
    }

    pub fn phase(&self, server_id: &str) -> ServerPhase {
        self.slots
            .lock()
            .get(server_id)
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    pub fn is_busy(&self, server_id: &str) -> bool {
        self.slots.lock().get(server_id).is_some_and(|s| s.busy)
    }

    pub fn last_report(&self, server_id: &str) -> Option<TickReport> {
        self.slots
            .lock()
            .get(server_id)
            .and_then(|s| s.last_report.clone())
    }

    fn update(&self, server_id: &str, f: impl FnOnce(&mut Slot)) {
        if let Some(slot) = self.slots.lock().get_mut(server_id) {
            f(slot);
        }
    }
}

/// Ownership of one server's slot for the duration of a tick.
#[derive(Debug)]
pub struct SlotGuard {
    arena: Arc<SlotArena>,
    server_id: String,
}

impl SlotGuard {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn set_phase(&self, phase: ServerPhase) {
        tracing::debug!("Server {} -> {:?}", self.server_id, phase);
        self.arena.update(&self.server_id, |slot| slot.phase = phase);
    }

    /// Record the tick's report; the slot is released when the guard drops.
    pub fn finish(&self, report: TickReport) {
        self.arena
            .update(&self.server_id, |slot| slot.last_report = Some(report));
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slots = self.arena.slots.lock();
        if let Some(slot) = slots.get_mut(&self.server_id) {
            slot.busy = false;
            slot.phase = ServerPhase::Idle;
        }
        let busy = slots.values().filter(|s| s.busy).count();
        drop(slots);
        gauge!("scheduler_slots_busy").set(busy as f64);
    }
}
