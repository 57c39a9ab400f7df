//! Keyed table of established tunnels.
//!
//! The table lock is only held to find or insert a per-key slot; creating a
//! tunnel happens under that slot's own async lock, so concurrent callers for
//! one key share a single dial while other keys proceed independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connector::WorkerConnector;
use super::{EstablishedTunnel, TunnelTimeouts};
use crate::error::{Error, Result};

const MIN_JANITOR_INTERVAL: Duration = Duration::from_millis(100);

/// Registry timing.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Worker read deadline (sub-stream open acknowledgements)
    pub read_timeout: Duration,
    /// Worker write deadline
    pub write_timeout: Duration,
    /// Tunnels untouched for this long are closed and removed
    pub link_idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(120),
            link_idle_timeout: Duration::from_secs(120),
        }
    }
}

impl RegistryConfig {
    /// Half of the smallest timeout, never below 100ms.
    pub fn janitor_interval(&self) -> Duration {
        let smallest = self
            .read_timeout
            .min(self.write_timeout)
            .min(self.link_idle_timeout);
        (smallest / 2).max(MIN_JANITOR_INTERVAL)
    }

    fn tunnel_timeouts(&self) -> TunnelTimeouts {
        TunnelTimeouts {
            read: self.read_timeout,
            write: self.write_timeout,
        }
    }
}

type TunnelSlot = AsyncMutex<Option<Arc<EstablishedTunnel>>>;

/// Live tunnels by key.
pub struct TunnelRegistry {
    slots: Mutex<HashMap<String, Arc<TunnelSlot>>>,
    connector: Arc<dyn WorkerConnector>,
    config: RegistryConfig,
    cancel: CancellationToken,
    created: AtomicU64,
    evicted: AtomicU64,
}

impl TunnelRegistry {
    /// Create an empty registry dialing through `connector`.
    pub fn new(connector: Arc<dyn WorkerConnector>, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            connector,
            config,
            cancel: CancellationToken::new(),
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        })
    }

    /// Registry timing.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return the live tunnel for `key`, dialing the worker if there is none.
    ///
    /// A tunnel that is closed, or already idle past the link timeout, is
    /// replaced. A failed dial leaves no entry behind.
    pub async fn get_or_create(self: &Arc<Self>, key: &str) -> Result<Arc<EstablishedTunnel>> {
        loop {
            let slot = {
                let mut slots = self.slots.lock();
                Arc::clone(
                    slots
                        .entry(key.to_string())
                        .or_insert_with(|| Arc::new(AsyncMutex::new(None))),
                )
            };

            let mut guard = slot.lock().await;

            // The janitor may have dropped this slot while we waited
            if !self.holds_slot(key, &slot) {
                continue;
            }

            if let Some(tunnel) = guard.as_ref() {
                if tunnel.try_acquire(self.config.link_idle_timeout) {
                    return Ok(Arc::clone(tunnel));
                }
                tracing::debug!("replacing stale tunnel {} for {}", tunnel.id(), key);
                tunnel.close();
                *guard = None;
            }

            let io = match self.connector.connect(key).await {
                Ok(io) => io,
                Err(e) => {
                    self.remove_slot_if(key, &slot);
                    return Err(e);
                }
            };

            let tunnel = EstablishedTunnel::spawn(key, io, self.config.tunnel_timeouts());
            if self.cancel.is_cancelled() {
                // Shut down while dialing; nothing would ever close it
                tunnel.close();
                return Err(Error::TunnelClosed);
            }
            self.created.fetch_add(1, Ordering::Relaxed);
            self.watch(&tunnel);
            *guard = Some(Arc::clone(&tunnel));
            return Ok(tunnel);
        }
    }

    /// Close and forget the tunnel for `key`.
    ///
    /// Waits for a dial in flight on the key and removes the tunnel it
    /// produced. Returns true when a tunnel was removed.
    pub async fn remove(&self, key: &str) -> bool {
        let slot = match self.slots.lock().get(key) {
            Some(slot) => Arc::clone(slot),
            None => return false,
        };

        let mut guard = slot.lock().await;
        if !self.holds_slot(key, &slot) {
            return false;
        }
        let removed = guard.take();
        drop(guard);
        self.remove_slot_if(key, &slot);

        match removed {
            Some(tunnel) => {
                tunnel.close();
                tracing::debug!("removed tunnel {} for {}", tunnel.id(), key);
                true
            }
            None => false,
        }
    }

    /// Close `tunnel` and forget it if it is still the entry for `key`.
    ///
    /// An entry holding a different tunnel is left alone. A slot whose lock
    /// is held stays in the table: its holder sees the tunnel closed and
    /// replaces it. Returns true when the entry was removed here.
    pub fn remove_if(&self, key: &str, tunnel: &Arc<EstablishedTunnel>) -> bool {
        tunnel.close();

        let Some(slot) = self.slots.lock().get(key).cloned() else {
            return false;
        };
        let Ok(mut guard) = slot.try_lock() else {
            return false;
        };
        if !guard.as_ref().map_or(false, |t| Arc::ptr_eq(t, tunnel)) {
            return false;
        }
        guard.take();
        drop(guard);
        self.remove_slot_if(key, &slot);
        tracing::debug!("removed failed tunnel {} for {}", tunnel.id(), key);
        true
    }

    /// Whether `key` currently has an entry.
    pub fn contains(&self, key: &str) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tunnels created since startup.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Tunnels evicted for idleness since startup.
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Evict idle and closed tunnels; returns how many were idle.
    ///
    /// Slots that are locked (a tunnel being created or acquired) are left
    /// alone until the next pass.
    pub fn sweep(&self) -> usize {
        let idle = self.config.link_idle_timeout;
        let mut expired = Vec::new();

        self.slots.lock().retain(|_, slot| {
            let mut guard = match slot.try_lock() {
                Ok(guard) => guard,
                Err(_) => return true,
            };
            let expire = match guard.as_ref() {
                None => return false,
                Some(t) if t.is_closed() => return false,
                Some(t) => t.expire_if_idle(idle),
            };
            if expire {
                expired.extend(guard.take());
            }
            !expire
        });

        for tunnel in &expired {
            tunnel.close();
            tracing::debug!(
                "evicted idle tunnel {} for {}",
                tunnel.id(),
                tunnel.key()
            );
        }
        self.evicted
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Start the background janitor. It stops on [`shutdown`](Self::shutdown)
    /// or when the registry is dropped.
    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.config.janitor_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let n = registry.sweep();
                if n > 0 {
                    tracing::debug!("Cleaned up {} idle tunnels", n);
                }
            }
        })
    }

    /// Close every tunnel and stop the janitor.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let slots: Vec<_> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Ok(mut guard) = slot.try_lock() {
                if let Some(t) = guard.take() {
                    t.close();
                }
            }
        }
    }

    fn holds_slot(&self, key: &str, slot: &Arc<TunnelSlot>) -> bool {
        self.slots
            .lock()
            .get(key)
            .map_or(false, |s| Arc::ptr_eq(s, slot))
    }

    fn remove_slot_if(&self, key: &str, slot: &Arc<TunnelSlot>) {
        let mut slots = self.slots.lock();
        if slots.get(key).map_or(false, |s| Arc::ptr_eq(s, slot)) {
            slots.remove(key);
        }
    }

    /// Drop the entry as soon as the worker connection goes away.
    fn watch(self: &Arc<Self>, tunnel: &Arc<EstablishedTunnel>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let watched = Arc::downgrade(tunnel);
        let key = tunnel.key().to_string();
        let cancel = tunnel.cancel.clone();

        tokio::spawn(async move {
            cancel.cancelled().await;
            let (Some(registry), Some(tunnel)) = (registry.upgrade(), watched.upgrade()) else {
                return;
            };
            let slot = match registry.slots.lock().get(&key) {
                Some(slot) => Arc::clone(slot),
                None => return,
            };
            let same = match slot.try_lock() {
                Ok(guard) => guard.as_ref().map_or(false, |t| Arc::ptr_eq(t, &tunnel)),
                // Whoever holds the slot will see the tunnel is closed
                Err(_) => false,
            };
            if same {
                registry.remove_slot_if(&key, &slot);
                tracing::debug!("dropped closed tunnel {} for {}", tunnel.id(), key);
            }
        });
    }
}

impl Drop for TunnelRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
