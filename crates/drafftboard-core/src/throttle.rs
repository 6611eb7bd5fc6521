//! Leading and trailing rate limiter keyed by publish target.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Slot {
    last_fire: Instant,
    pending: bool,
}

/// Rate limiter with a separate window per key.
///
/// The first request in a window fires immediately. Requests arriving while
/// the window is open are coalesced into a single trailing fire, reported by
/// [`Throttle::due`] once the interval has elapsed. Callers read the current
/// state at fire time, so the trailing fire always carries the latest value.
#[derive(Debug)]
pub struct Throttle<K> {
    interval: Duration,
    slots: HashMap<K, Slot>,
}

impl<K: Eq + Hash + Clone> Throttle<K> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            slots: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Ask to fire for `key`. Returns true when the caller should fire now;
    /// otherwise a trailing fire is scheduled.
    pub fn request(&mut self, key: K, now: Instant) -> bool {
        match self.slots.get_mut(&key) {
            Some(slot) if now.duration_since(slot.last_fire) < self.interval => {
                slot.pending = true;
                false
            }
            Some(slot) => {
                slot.last_fire = now;
                slot.pending = false;
                true
            }
            None => {
                self.slots.insert(
                    key,
                    Slot {
                        last_fire: now,
                        pending: false,
                    },
                );
                true
            }
        }
    }

    /// Keys whose trailing fire is due at `now`. Their windows restart at `now`.
    pub fn due(&mut self, now: Instant) -> Vec<K> {
        let interval = self.interval;
        let mut fired = Vec::new();
        self.slots.retain(|key, slot| {
            let elapsed = now.duration_since(slot.last_fire) >= interval;
            if slot.pending && elapsed {
                slot.pending = false;
                slot.last_fire = now;
                fired.push(key.clone());
                true
            } else {
                // Idle slots with a closed window carry no state worth keeping.
                slot.pending || !elapsed
            }
        });
        fired
    }

    /// Drop a scheduled trailing fire. Returns whether one was pending.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.slots.get_mut(key) {
            Some(slot) => std::mem::replace(&mut slot.pending, false),
            None => false,
        }
    }

    /// Take every scheduled trailing fire regardless of timing.
    pub fn take_pending(&mut self) -> Vec<K> {
        let keys: Vec<K> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.pending)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.cancel(key);
        }
        keys
    }

    pub fn has_pending(&self) -> bool {
        self.slots.values().any(|slot| slot.pending)
    }

    /// Earliest instant at which a trailing fire becomes due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter(|slot| slot.pending)
            .map(|slot| slot.last_fire + self.interval)
            .min()
    }
}
