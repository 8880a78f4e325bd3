//! Recorded-topology store.
//!
//! One coarse mutex guards all four collections: cascade rules need
//! composite reads and writes, and topology mutations are rare next to
//! message flow, which never touches this store. Nothing here performs
//! I/O while holding the lock; the recovery walker iterates snapshots.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::domain::{
    BindingDestinationKind, RecordedBinding, RecordedConsumer, RecordedExchange, RecordedQueue,
};

#[derive(Default)]
struct Entities {
    exchanges: HashMap<String, RecordedExchange>,
    queues: HashMap<String, RecordedQueue>,
    bindings: HashSet<RecordedBinding>,
    consumers: HashMap<String, RecordedConsumer>,
}

/// Owned copy of the recorded topology, safe to iterate without the lock.
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    pub exchanges: Vec<RecordedExchange>,
    pub queues: Vec<RecordedQueue>,
    pub bindings: Vec<RecordedBinding>,
    pub consumers: Vec<RecordedConsumer>,
}

/// Thread-safe mirror of every declaration made on the broker.
#[derive(Default)]
pub struct TopologyRegistry {
    entities: Mutex<Entities>,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an exchange declaration. Last writer wins.
    pub fn record_exchange(&self, exchange: RecordedExchange) {
        let mut e = self.entities.lock();
        e.exchanges.insert(exchange.name.clone(), exchange);
    }

    /// Record a queue declaration. Last writer wins.
    pub fn record_queue(&self, queue: RecordedQueue) {
        let mut e = self.entities.lock();
        e.queues.insert(queue.name.clone(), queue);
    }

    /// Record a binding. Duplicates are no-ops; returns whether inserted.
    pub fn record_binding(&self, binding: RecordedBinding) -> bool {
        self.entities.lock().bindings.insert(binding)
    }

    /// Record a consumer unless the tag is already taken, matching broker
    /// behavior for duplicate tags. Returns whether inserted.
    pub fn record_consumer(&self, consumer: RecordedConsumer) -> bool {
        let mut e = self.entities.lock();
        if e.consumers.contains_key(&consumer.tag) {
            return false;
        }
        e.consumers.insert(consumer.tag.clone(), consumer);
        true
    }

    /// Remove an exchange and its incident bindings, cascading auto-delete
    /// evaluation onto each removed binding's source.
    pub fn delete_exchange(&self, name: &str) {
        let mut e = self.entities.lock();
        e.exchanges.remove(name);
        Self::drop_bindings_into(&mut e, name, BindingDestinationKind::Exchange);
    }

    /// Remove a queue and its incident bindings, cascading auto-delete
    /// evaluation onto each removed binding's source.
    pub fn delete_queue(&self, name: &str) {
        let mut e = self.entities.lock();
        e.queues.remove(name);
        Self::drop_bindings_into(&mut e, name, BindingDestinationKind::Queue);
    }

    /// Remove one binding. Unbinding alone triggers no cascade.
    pub fn delete_binding(&self, binding: &RecordedBinding) -> bool {
        self.entities.lock().bindings.remove(binding)
    }

    /// Remove a consumer, returning its record when present.
    pub fn delete_consumer(&self, tag: &str) -> Option<RecordedConsumer> {
        self.entities.lock().consumers.remove(tag)
    }

    /// Remove `name` if it is auto-delete and no recorded binding uses it
    /// as a source. Returns whether it was removed.
    pub fn maybe_delete_auto_delete_exchange(&self, name: &str) -> bool {
        let mut e = self.entities.lock();
        Self::maybe_drop_auto_delete_exchange(&mut e, name)
    }

    /// Remove `name` if it is auto-delete and no recorded consumer
    /// references it. Returns whether it was removed.
    pub fn maybe_delete_auto_delete_queue(&self, name: &str) -> bool {
        let mut e = self.entities.lock();
        if e.consumers.values().any(|c| c.queue == name) {
            return false;
        }
        let auto_delete = e.queues.get(name).is_some_and(|q| q.spec.auto_delete);
        if auto_delete {
            e.queues.remove(name);
        }
        auto_delete
    }

    /// Re-key a queue after the broker assigned it a new name.
    ///
    /// One critical section rewrites binding destinations, rewrites
    /// consumer queue references, drops the old entry when the queue was
    /// server-named, and records the queue under its new name. No observer
    /// can see the rename half-applied.
    pub fn rename_queue(&self, old: &str, new: &str) {
        let mut e = self.entities.lock();

        let rewritten: Vec<RecordedBinding> = e
            .bindings
            .iter()
            .filter(|b| b.destination_kind == BindingDestinationKind::Queue && b.destination == old)
            .cloned()
            .collect();
        for binding in rewritten {
            e.bindings.remove(&binding);
            let mut renamed = binding;
            renamed.destination = new.to_string();
            e.bindings.insert(renamed);
        }

        for consumer in e.consumers.values_mut().filter(|c| c.queue == old) {
            consumer.queue = new.to_string();
        }

        if let Some(queue) = e.queues.get(old).cloned() {
            if queue.server_named {
                e.queues.remove(old);
            }
            let mut renamed = queue;
            renamed.name = new.to_string();
            e.queues.insert(new.to_string(), renamed);
        }
    }

    /// Re-key a consumer after the broker issued a different tag.
    pub fn rename_consumer(&self, old: &str, new: &str) {
        let mut e = self.entities.lock();
        if let Some(mut consumer) = e.consumers.remove(old) {
            consumer.tag = new.to_string();
            e.consumers.insert(new.to_string(), consumer);
        }
    }

    /// Drop every consumer owned by `channel`, returning the removed
    /// records so the caller can evaluate queue auto-delete.
    pub fn remove_channel_consumers(&self, channel: u16) -> Vec<RecordedConsumer> {
        let mut e = self.entities.lock();
        let tags: Vec<String> = e
            .consumers
            .values()
            .filter(|c| c.channel == channel)
            .map(|c| c.tag.clone())
            .collect();
        tags.iter()
            .filter_map(|tag| e.consumers.remove(tag))
            .collect()
    }

    /// Owned copies of all four collections.
    pub fn snapshot(&self) -> TopologySnapshot {
        let e = self.entities.lock();
        TopologySnapshot {
            exchanges: e.exchanges.values().cloned().collect(),
            queues: e.queues.values().cloned().collect(),
            bindings: e.bindings.iter().cloned().collect(),
            consumers: e.consumers.values().cloned().collect(),
        }
    }

    pub fn exchange_count(&self) -> usize {
        self.entities.lock().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.entities.lock().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.entities.lock().bindings.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.entities.lock().consumers.len()
    }

    pub fn contains_queue(&self, name: &str) -> bool {
        self.entities.lock().queues.contains_key(name)
    }

    pub fn contains_exchange(&self, name: &str) -> bool {
        self.entities.lock().exchanges.contains_key(name)
    }

    fn drop_bindings_into(e: &mut Entities, destination: &str, kind: BindingDestinationKind) {
        let incident: Vec<RecordedBinding> = e
            .bindings
            .iter()
            .filter(|b| b.destination_kind == kind && b.destination == destination)
            .cloned()
            .collect();
        for binding in incident {
            e.bindings.remove(&binding);
            Self::maybe_drop_auto_delete_exchange(e, &binding.source);
        }
    }

    fn maybe_drop_auto_delete_exchange(e: &mut Entities, name: &str) -> bool {
        if e.bindings.iter().any(|b| b.source == name) {
            return false;
        }
        let auto_delete = e.exchanges.get(name).is_some_and(|x| x.spec.auto_delete);
        if auto_delete {
            e.exchanges.remove(name);
        }
        auto_delete
    }
}
