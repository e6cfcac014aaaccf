//! Keyed cache of reusable network clients.
//!
//! # Design
//! Each key owns a [`Slot`] with two locks: an async creation gate, held while
//! the factory runs so concurrent callers for the same key wait for the first
//! one instead of creating their own client, and a short-lived entry lock for
//! ref-counting and eviction. The slot table itself is only locked to look a
//! slot up; no lock is ever held across keys, so unrelated keys never contend.
//!
//! Callers hold a [`Lease`]. Dropping it releases the reference; an entry with
//! no references is evicted once it has been idle for the configured window.
//! Entries are always torn down through the disposer captured at creation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{Disposer, ProvidedClient};
use crate::config::PoolConfig;
use crate::error::CallError;

/// A pooled network client. Clones share the same underlying client.
#[derive(Clone)]
pub struct ClientHandle {
    id: u64,
    client: reqwest::Client,
}

impl ClientHandle {
    /// Identifies the creation this handle came from.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClientHandle {}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle").field("id", &self.id).finish()
    }
}

struct PooledEntry {
    handle: ClientHandle,
    ref_count: usize,
    last_used_at: Instant,
    disposer: Option<Disposer>,
}

impl PooledEntry {
    fn dispose(self) {
        if let Some(disposer) = self.disposer {
            disposer();
        }
    }
}

struct Slot {
    key: String,
    create: tokio::sync::Mutex<()>,
    entry: Mutex<Option<PooledEntry>>,
}

impl Slot {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            create: tokio::sync::Mutex::new(()),
            entry: Mutex::new(None),
        }
    }

    fn entry(&self) -> MutexGuard<'_, Option<PooledEntry>> {
        // A panicking disposer must not wedge the key forever.
        self.entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_lease(self: &Arc<Self>) -> Option<Lease> {
        let mut entry = self.entry();
        let entry = entry.as_mut()?;
        entry.ref_count += 1;
        entry.last_used_at = Instant::now();
        Some(Lease {
            slot: self.clone(),
            handle: entry.handle.clone(),
        })
    }

    fn release(&self, id: u64) {
        let mut entry = self.entry();
        if let Some(entry) = entry.as_mut().filter(|e| e.handle.id == id) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.last_used_at = Instant::now();
        }
    }

    /// Remove the entry if it is unreferenced and idle for at least `idle`.
    fn take_if_idle(&self, idle: Duration, now: Instant) -> Option<PooledEntry> {
        let mut entry = self.entry();
        let evict = entry
            .as_ref()
            .is_some_and(|e| e.ref_count == 0 && now.saturating_duration_since(e.last_used_at) >= idle);
        if evict {
            entry.take()
        } else {
            None
        }
    }
}

/// A reference to a pooled client. Dropping it releases the reference.
pub struct Lease {
    slot: Arc<Slot>,
    handle: ClientHandle,
}

impl Lease {
    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    pub fn key(&self) -> &str {
        &self.slot.key
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.slot.release(self.handle.id);
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.slot.key)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Snapshot of one pooled entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStats {
    pub key: String,
    pub handle_id: u64,
    pub ref_count: usize,
}

/// Keyed client cache with idle eviction.
pub struct ConnectionPool {
    config: PoolConfig,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    last_sweep: Mutex<Instant>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        self.slots()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Slot::new(key)))
            .clone()
    }

    fn existing_slot(&self, key: &str) -> Option<Arc<Slot>> {
        self.slots().get(key).cloned()
    }

    /// Lease the client cached under `key`, creating it with `factory` if
    /// there is none. At most one creation runs per key at a time; callers
    /// arriving meanwhile wait and then share the created client.
    pub async fn acquire<F>(&self, key: &str, factory: F) -> Result<Lease, CallError>
    where
        F: FnOnce() -> Result<ProvidedClient, CallError>,
    {
        self.sweep_if_due();

        let slot = self.slot(key);
        if let Some(lease) = slot.try_lease() {
            return Ok(lease);
        }

        let gate = slot.create.lock().await;
        if let Some(lease) = slot.try_lease() {
            return Ok(lease);
        }

        let provided = factory().map_err(|err| match err {
            CallError::ConnectionAcquisition { reason, .. } => CallError::ConnectionAcquisition {
                key: key.to_string(),
                reason,
            },
            other => CallError::ConnectionAcquisition {
                key: key.to_string(),
                reason: other.to_string(),
            },
        })?;
        let handle = ClientHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            client: provided.client,
        };
        tracing::debug!(key, handle_id = handle.id, "created pooled client");

        *slot.entry() = Some(PooledEntry {
            handle: handle.clone(),
            ref_count: 1,
            last_used_at: Instant::now(),
            disposer: provided.disposer,
        });
        drop(gate);
        Ok(Lease { slot, handle })
    }

    /// Drop one reference to the entry under `key`.
    ///
    /// Leases call this on drop; it is only needed for references obtained
    /// without a lease.
    pub fn release(&self, key: &str) {
        if let Some(slot) = self.existing_slot(key) {
            let mut entry = slot.entry();
            if let Some(entry) = entry.as_mut() {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.last_used_at = Instant::now();
            }
        }
    }

    /// Dispose the entry under `key` now, whatever its idle state or
    /// reference count. Outstanding leases stay usable but no longer count.
    /// Returns `true` if an entry was disposed.
    pub fn force_release(&self, key: &str) -> bool {
        let Some(slot) = self.existing_slot(key) else {
            return false;
        };
        let taken = slot.entry().take();
        drop(slot);
        self.prune_empty_slots();
        match taken {
            Some(entry) => {
                tracing::debug!(key, handle_id = entry.handle.id, "force-releasing pooled client");
                entry.dispose();
                true
            }
            None => false,
        }
    }

    /// Drop slots that hold no entry and that no lease or pending acquire
    /// still references.
    fn prune_empty_slots(&self) {
        self.slots()
            .retain(|_, slot| Arc::strong_count(slot) > 1 || slot.entry().is_some());
    }

    /// Evict every entry idle for longer than the configured window.
    /// Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let idle = self.config.idle_timeout();
        let slots: Vec<Arc<Slot>> = self.slots().values().cloned().collect();
        let mut evicted = 0;
        for slot in slots {
            if let Some(entry) = slot.take_if_idle(idle, now) {
                tracing::debug!(key = %slot.key, handle_id = entry.handle.id, "evicting idle client");
                entry.dispose();
                evicted += 1;
            }
        }
        self.prune_empty_slots();
        *self.last_sweep.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = now;
        evicted
    }

    fn sweep_if_due(&self) {
        let due = {
            let last = self.last_sweep.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            last.elapsed() >= self.config.sweep_interval()
        };
        if due {
            self.sweep();
        }
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.sweep();
                    }
                }
            }
        })
    }

    /// Dispose every entry. Outstanding leases stay usable.
    pub fn shutdown(&self) {
        let slots: Vec<Arc<Slot>> = self.slots().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let taken = slot.entry().take();
            if let Some(entry) = taken {
                entry.dispose();
            }
        }
        tracing::debug!("connection pool shut down");
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots().len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.stats().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Vec<EntryStats> {
        let slots: Vec<Arc<Slot>> = self.slots().values().cloned().collect();
        let mut stats: Vec<EntryStats> = slots
            .iter()
            .filter_map(|slot| {
                slot.entry().as_ref().map(|e| EntryStats {
                    key: slot.key.clone(),
                    handle_id: e.handle.id,
                    ref_count: e.ref_count,
                })
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("entries", &self.stats())
            .finish()
    }
}
