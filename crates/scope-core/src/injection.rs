//! InjectionContext — the per-scope store of lazily produced instances.
//!
//! Production discipline: every key owns a slot with its own production
//! lock. The first caller for a key runs the producer while holding that
//! slot's lock; concurrent callers for the same key wait and then observe
//! the stored instance. The producer therefore runs at most once per key
//! (unless it fails, in which case nothing is stored and a later call
//! retries). The map lock is only held to look up or create a slot, so a
//! producer may itself produce other keys of the same context. A producer
//! that asks for its own key on the same thread gets
//! [`ScopeError::CyclicProduction`] instead of waiting on itself.

use std::any::{Any, type_name};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ScopeError;
use crate::key::Key;

/// A produced, type-erased scoped instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

type Encoder = fn(&Instance) -> Option<Value>;

#[derive(Default)]
struct Slot {
    /// Held for the duration of a producer call.
    produce: Mutex<()>,
    /// Thread currently running the producer.
    producer: Mutex<Option<ThreadId>>,
    value: RwLock<Option<Stored>>,
}

/// Marks a slot as being produced by the current thread until dropped.
struct Producing<'a> {
    slot: &'a Slot,
}

impl<'a> Producing<'a> {
    fn enter(slot: &'a Slot) -> Self {
        *slot.producer.lock() = Some(thread::current().id());
        Self { slot }
    }
}

impl Drop for Producing<'_> {
    fn drop(&mut self) {
        *self.slot.producer.lock() = None;
    }
}

#[derive(Clone)]
struct Stored {
    instance: Instance,
    /// Present only for entries produced through `produce_transportable`.
    encoder: Option<Encoder>,
}

/// Thread-safe map from [`Key`] to at most one lazily produced instance.
pub struct InjectionContext {
    owner: String,
    slots: Mutex<HashMap<Key, Arc<Slot>>>,
    /// Transported values not yet claimed by a producer call.
    seeds: Mutex<HashMap<String, Value>>,
    closed: AtomicBool,
}

impl InjectionContext {
    /// Create an empty context. `owner` names it in errors and logs.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            slots: Mutex::new(HashMap::new()),
            seeds: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a context seeded with the transportable entries of `snapshot`.
    ///
    /// Seeded values are decoded lazily, on the first
    /// [`produce_transportable`](Self::produce_transportable) call for their key.
    pub fn restore(owner: impl Into<String>, snapshot: ContextSnapshot) -> Self {
        let context = Self::new(owner);
        *context.seeds.lock() = snapshot.entries.into_iter().collect();
        context
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Return the instance stored for `key`, producing and storing it first if absent.
    pub fn produce_if_absent(
        &self,
        key: &Key,
        producer: impl FnOnce() -> Instance,
    ) -> Result<Instance, ScopeError> {
        self.store(key, None, || Ok::<_, Infallible>(producer()))
    }

    /// Like [`produce_if_absent`](Self::produce_if_absent) with a fallible producer.
    /// A failed producer stores nothing.
    pub fn try_produce_if_absent<E: fmt::Display>(
        &self,
        key: &Key,
        producer: impl FnOnce() -> Result<Instance, E>,
    ) -> Result<Instance, ScopeError> {
        self.store(key, None, producer)
    }

    /// Typed form of [`produce_if_absent`](Self::produce_if_absent).
    pub fn produce<T: Send + Sync + 'static>(
        &self,
        key: &Key,
        producer: impl FnOnce() -> T,
    ) -> Result<Arc<T>, ScopeError> {
        check_type::<T>(key)?;
        let instance = self.store(key, None, || Ok::<_, Infallible>(Arc::new(producer()) as Instance))?;
        downcast(key, instance)
    }

    /// Typed form of [`try_produce_if_absent`](Self::try_produce_if_absent).
    pub fn try_produce<T: Send + Sync + 'static, E: fmt::Display>(
        &self,
        key: &Key,
        producer: impl FnOnce() -> Result<T, E>,
    ) -> Result<Arc<T>, ScopeError> {
        check_type::<T>(key)?;
        let instance = self.store(key, None, || producer().map(|v| Arc::new(v) as Instance))?;
        downcast(key, instance)
    }

    /// Produce an entry that survives [`snapshot`](Self::snapshot).
    ///
    /// If this context was restored from a snapshot holding a value for
    /// `key`, that value is decoded instead of calling `producer`.
    pub fn produce_transportable<T>(&self, key: &Key, producer: impl FnOnce() -> T) -> Result<Arc<T>, ScopeError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        check_type::<T>(key)?;
        let instance = self.store(key, Some(encode::<T> as Encoder), || {
            let value = self.take_seed::<T>(key).unwrap_or_else(producer);
            Ok::<_, Infallible>(Arc::new(value) as Instance)
        })?;
        downcast(key, instance)
    }

    /// Typed facade: the key is `T`, optionally qualified.
    pub fn get_or_produce<T: Send + Sync + 'static>(
        &self,
        qualifier: Option<&str>,
        producer: impl FnOnce() -> T,
    ) -> Result<Arc<T>, ScopeError> {
        self.produce(&typed_key::<T>(qualifier), producer)
    }

    /// Typed facade over [`produce_transportable`](Self::produce_transportable).
    pub fn get_or_produce_transportable<T>(
        &self,
        qualifier: Option<&str>,
        producer: impl FnOnce() -> T,
    ) -> Result<Arc<T>, ScopeError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.produce_transportable(&typed_key::<T>(qualifier), producer)
    }

    /// The instance stored for `key`, without producing one.
    pub fn get(&self, key: &Key) -> Option<Instance> {
        let slot = self.slots.lock().get(key).cloned()?;
        let stored = slot.value.read();
        stored.as_ref().map(|s| s.instance.clone())
    }

    /// Number of stored instances.
    pub fn len(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots.lock().values().cloned().collect();
        slots.iter().filter(|s| s.value.read().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize the transportable entries. Entries that were not produced
    /// as transportable, or whose value fails to serialize, are dropped.
    pub fn snapshot(&self) -> ContextSnapshot {
        let slots: Vec<(Key, Arc<Slot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();

        // Unclaimed seeds are still transportable as-is
        let mut entries: BTreeMap<String, Value> = self.seeds.lock().clone().into_iter().collect();

        for (key, slot) in slots {
            let Some(stored) = slot.value.read().clone() else {
                continue;
            };
            match stored.encoder.and_then(|encode| encode(&stored.instance)) {
                Some(value) => {
                    entries.insert(key.wire_name(), value);
                }
                None => debug!(key = %key, owner = %self.owner, "entry not transportable, dropped from snapshot"),
            }
        }

        ContextSnapshot { entries }
    }

    /// Dispose of the context. Stored instances are released and further
    /// production fails with [`ScopeError::ContextClosed`].
    /// Returns `false` if the context was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let slots = std::mem::take(&mut *self.slots.lock());
        self.seeds.lock().clear();
        debug!(owner = %self.owner, entries = slots.len(), "injection context closed");
        drop(slots);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ── Internal ──────────────────────────────────────────────────────────

    fn slot(&self, key: &Key) -> Result<Arc<Slot>, ScopeError> {
        if self.is_closed() {
            return Err(ScopeError::closed(&self.owner));
        }
        let mut slots = self.slots.lock();
        Ok(slots.entry(key.clone()).or_default().clone())
    }

    fn store<E: fmt::Display>(
        &self,
        key: &Key,
        encoder: Option<Encoder>,
        producer: impl FnOnce() -> Result<Instance, E>,
    ) -> Result<Instance, ScopeError> {
        let slot = self.slot(key)?;

        if let Some(stored) = slot.value.read().as_ref() {
            return Ok(stored.instance.clone());
        }

        if *slot.producer.lock() == Some(thread::current().id()) {
            return Err(ScopeError::CyclicProduction { key: key.to_string() });
        }

        let _lock = slot.produce.lock();
        let _producing = Producing::enter(&slot);

        // Another caller may have won while we waited for the lock
        if let Some(stored) = slot.value.read().as_ref() {
            return Ok(stored.instance.clone());
        }
        if self.is_closed() {
            return Err(ScopeError::closed(&self.owner));
        }

        let instance = producer().map_err(|e| ScopeError::Producer {
            key: key.to_string(),
            message: e.to_string(),
        })?;

        *slot.value.write() = Some(Stored {
            instance: instance.clone(),
            encoder,
        });
        Ok(instance)
    }

    fn take_seed<T: DeserializeOwned>(&self, key: &Key) -> Option<T> {
        let value = self.seeds.lock().remove(&key.wire_name())?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(key = %key, owner = %self.owner, "discarding undecodable transported value: {e}");
                None
            }
        }
    }
}

impl fmt::Debug for InjectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectionContext")
            .field("owner", &self.owner)
            .field("entries", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn typed_key<T: 'static>(qualifier: Option<&str>) -> Key {
    match qualifier {
        Some(q) => Key::qualified::<T>(q.to_string()),
        None => Key::of::<T>(),
    }
}

fn check_type<T: 'static>(key: &Key) -> Result<(), ScopeError> {
    if key.is_type::<T>() {
        Ok(())
    } else {
        Err(ScopeError::TypeMismatch {
            key: key.to_string(),
            requested: type_name::<T>(),
        })
    }
}

fn downcast<T: Send + Sync + 'static>(key: &Key, instance: Instance) -> Result<Arc<T>, ScopeError> {
    instance.downcast::<T>().map_err(|_| ScopeError::TypeMismatch {
        key: key.to_string(),
        requested: type_name::<T>(),
    })
}

fn encode<T: Serialize + 'static>(instance: &Instance) -> Option<Value> {
    let value = (**instance).downcast_ref::<T>()?;
    serde_json::to_value(value).ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Transportable entries of an [`InjectionContext`], keyed by [`Key::wire_name`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub entries: BTreeMap<String, Value>,
}

impl ContextSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries.get(&key.wire_name())
    }
}
