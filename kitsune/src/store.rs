//! Per-entity runtime scratch state
//!
//! Converters keep small pieces of state between messages: debounce timers, the last seen
//! value of a counter, whether a button is currently held. That state outlives the device
//! objects it belongs to and is only ever dropped explicitly.

use std::collections::HashMap;

use compact_str::CompactString;
use kitsune_common::{DeviceId, Entity, EntityKey};
use serde_json::Value;
use tokio::task::{AbortHandle, JoinHandle};

/// A cancellable scheduled action
#[derive(Debug)]
pub struct TimerHandle(AbortHandle);

impl TimerHandle {
    pub fn new(handle: AbortHandle) -> Self {
        Self(handle)
    }

    pub fn cancel(&self) {
        self.0.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl<T> From<JoinHandle<T>> for TimerHandle {
    fn from(handle: JoinHandle<T>) -> Self {
        Self(handle.abort_handle())
    }
}

#[derive(Debug)]
pub enum Stored {
    Value(Value),
    Timer(TimerHandle),
}

impl Stored {
    fn release(&self) {
        if let Stored::Timer(timer) = self {
            timer.cancel();
        }
    }
}

/// Entity key → (state key → value)
///
/// No internal locking; callers serialize access (the dispatcher does so per entity).
#[derive(Debug, Default)]
pub struct EntityStateStore {
    slots: HashMap<EntityKey, HashMap<CompactString, Stored>>,
}

impl EntityStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, entity: &Entity, key: &str) -> bool {
        self.slots
            .get(&entity.key())
            .is_some_and(|slot| slot.contains_key(key))
    }

    /// Cached value under `key`; timers are not values and read as absent
    pub fn get(&self, entity: &Entity, key: &str) -> Option<&Value> {
        match self.slots.get(&entity.key())?.get(key)? {
            Stored::Value(value) => Some(value),
            Stored::Timer(_) => None,
        }
    }

    pub fn get_or(&self, entity: &Entity, key: &str, default: Value) -> Value {
        self.get(entity, key).cloned().unwrap_or(default)
    }

    pub fn timer(&self, entity: &Entity, key: &str) -> Option<&TimerHandle> {
        match self.slots.get(&entity.key())?.get(key)? {
            Stored::Timer(timer) => Some(timer),
            Stored::Value(_) => None,
        }
    }

    pub fn put(&mut self, entity: &Entity, key: &str, value: impl Into<Value>) {
        self.insert(entity, key, Stored::Value(value.into()));
    }

    /// Stores a timer, cancelling whatever timer was armed under the same key.
    ///
    /// Returns whether a predecessor was replaced.
    pub fn arm_timer(&mut self, entity: &Entity, key: &str, timer: TimerHandle) -> bool {
        self.insert(entity, key, Stored::Timer(timer))
    }

    pub fn clear(&mut self, entity: &Entity, key: &str) {
        let entity_key = entity.key();
        let Some(slot) = self.slots.get_mut(&entity_key) else {
            return;
        };

        if let Some(stored) = slot.remove(key) {
            stored.release();
        }

        if slot.is_empty() {
            self.slots.remove(&entity_key);
        }
    }

    pub fn clear_entity(&mut self, entity: &Entity) {
        if let Some(slot) = self.slots.remove(&entity.key()) {
            slot.values().for_each(Stored::release);
        }
    }

    /// Drops the slots of a device and of every one of its endpoints
    pub fn clear_device(&mut self, device: &DeviceId) {
        self.slots.retain(|key, slot| {
            let owned = matches!(key, EntityKey::Device(d) | EntityKey::Endpoint(d, _) if d == device);
            if owned {
                slot.values().for_each(Stored::release);
            }
            !owned
        });
    }

    pub fn clear_all(&mut self) {
        for slot in self.slots.values() {
            slot.values().for_each(Stored::release);
        }

        self.slots.clear();
    }

    /// Cancels and forgets every armed timer, keeping cached values. Returns how many were
    /// still pending.
    pub fn stop_all(&mut self) -> usize {
        let mut pending = 0;

        for slot in self.slots.values_mut() {
            slot.retain(|_, stored| match stored {
                Stored::Timer(timer) => {
                    if !timer.is_finished() {
                        pending += 1;
                    }
                    timer.cancel();
                    false
                }
                Stored::Value(_) => true,
            });
        }

        self.slots.retain(|_, slot| !slot.is_empty());

        pending
    }

    /// Number of entities holding any state
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn insert(&mut self, entity: &Entity, key: &str, stored: Stored) -> bool {
        let previous = self
            .slots
            .entry(entity.key())
            .or_default()
            .insert(key.into(), stored);

        match previous {
            Some(previous) => {
                previous.release();
                true
            }
            None => false,
        }
    }
}
