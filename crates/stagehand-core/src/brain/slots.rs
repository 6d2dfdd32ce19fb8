//! Activation slot accounting.
//!
//! A unit takes a slot when an acquire-tagged phase is launched for it and
//! gives it back when its release-tagged phase completes, or when the unit
//! stops for any other reason. The remote system enforces the real limit; this
//! only keeps us under it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Per-process record of which units hold an activation slot.
#[derive(Debug)]
pub struct ActivationSlots {
    capacity: usize,
    holders: Mutex<HashSet<String>>,
}

impl ActivationSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            holders: Mutex::new(HashSet::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.holders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn held(&self) -> usize {
        self.lock().len()
    }

    pub fn is_held_by(&self, unit_id: &str) -> bool {
        self.lock().contains(unit_id)
    }

    /// Take a slot for `unit_id`, or return `None` if the ceiling is reached.
    ///
    /// A unit already holding a slot gets a guard over the slot it has, so a
    /// retried acquire phase never takes a second one.
    pub fn try_acquire(self: &Arc<Self>, unit_id: &str) -> Option<SlotGuard> {
        let mut holders = self.lock();
        if !holders.contains(unit_id) {
            if holders.len() >= self.capacity {
                return None;
            }
            holders.insert(unit_id.to_string());
            tracing::debug!(unit_id, held = holders.len(), capacity = self.capacity, "activation slot acquired");
        }
        Some(SlotGuard {
            slots: Arc::clone(self),
            unit_id: unit_id.to_string(),
            armed: true,
        })
    }

    /// Give back `unit_id`'s slot. Returns `false` if it held none, so a
    /// second release is a no-op.
    pub fn release(&self, unit_id: &str) -> bool {
        let mut holders = self.lock();
        let released = holders.remove(unit_id);
        if released {
            tracing::debug!(unit_id, held = holders.len(), "activation slot released");
        }
        released
    }

    /// Re-register holders found in persisted unit state after a restart.
    ///
    /// May exceed capacity if the store says so; new acquisitions then wait
    /// until enough slots are released.
    pub fn restore<I, S>(&self, unit_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut holders = self.lock();
        holders.extend(unit_ids.into_iter().map(Into::into));
    }
}

/// Releases the unit's slot on drop unless [`keep`](SlotGuard::keep) was
/// called.
///
/// Launches hold the guard while the acquire phase runs. A clean completion
/// keeps the slot (the unit holds it until its release phase); a panic,
/// timeout, or failure drops the guard and frees it.
#[derive(Debug)]
pub struct SlotGuard {
    slots: Arc<ActivationSlots>,
    unit_id: String,
    armed: bool,
}

impl SlotGuard {
    /// Keep the slot held past this guard.
    pub fn keep(mut self) {
        self.armed = false;
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.slots.release(&self.unit_id);
        }
    }
}
