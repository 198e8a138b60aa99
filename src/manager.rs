//! Connection manager.
//!
//! Owns the connection store, enforces the connection ceiling and runs the
//! periodic health sweep.
//!
//! ## Health Hysteresis
//!
//! Every connection carries a status, `ACTIVE(2) > TIMEOUT(1) > CLOSE(0)`.
//! Each sweep probes activity recency: a failed probe steps the status down,
//! a successful one steps it back up (never above `ACTIVE`). Once the status
//! drops below `CLOSE` the next sweep evicts the connection. A client that
//! misses a single probe therefore survives as long as it recovers before
//! its margin runs out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ManagerConfig;
use crate::connection::{CloseReason, ConnStat, Connection};
use crate::error::{ConfigError, ManagerError};
use crate::hook::ConnHook;
use crate::id::generate_conn_id;
use crate::message::Message;
use crate::store::{DashStore, Store};

/// Attempts at drawing an id that is not already live.
const MAX_ID_ATTEMPTS: usize = 8;

/// Outcome of one health sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Probes that passed.
    pub healthy: usize,
    /// Probes that failed and lowered the status.
    pub degraded: usize,
    /// Connections removed because their status was below `CLOSE`.
    pub evicted: usize,
}

/// Tracks every live connection.
pub struct ConnManager {
    store: Box<dyn Store<Arc<Connection>>>,
    /// Fast-path counter kept in step with the store.
    count: AtomicUsize,
    config: ManagerConfig,
    hook: RwLock<Option<Arc<dyn ConnHook>>>,
}

impl ConnManager {
    /// Create a manager backed by a [`DashStore`].
    pub fn new(config: ManagerConfig) -> Result<Self, ConfigError> {
        Self::with_store(Box::new(DashStore::new()), None, config)
    }

    pub fn with_store(
        store: Box<dyn Store<Arc<Connection>>>,
        hook: Option<Arc<dyn ConnHook>>,
        config: ManagerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            max_connections = config.max_connections,
            exploration_cycle = config.exploration_cycle,
            detection_timeout = config.detection_timeout,
            "Initializing connection manager"
        );
        Ok(Self {
            store,
            count: AtomicUsize::new(0),
            config,
            hook: RwLock::new(hook),
        })
    }

    /// Register a connection.
    pub fn add_conn(&self, conn: Arc<Connection>) -> Result<(), ManagerError> {
        let max = self.config.max_connections;
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if max > 0 && n >= max {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .map_err(|_| ManagerError::MaxConnections(max))?;

        let conn_id = conn.conn_id();
        if !self.store.try_insert(conn_id, conn) {
            self.release_slot();
            return Err(ManagerError::IdInUse(conn_id));
        }
        trace!(conn_id, count = self.conn_count(), "Connection added");
        Ok(())
    }

    /// Remove a connection and close it with `reason`.
    ///
    /// The connection is closed even if it was no longer in the store.
    /// Returns whether an entry was removed.
    pub fn remove_conn(&self, conn: &Connection, reason: CloseReason) -> bool {
        let conn_id = conn.conn_id();
        let removed = self.store.del(conn_id).is_some();
        if removed {
            self.release_slot();
            trace!(conn_id, count = self.conn_count(), "Connection removed");
        } else {
            debug!(conn_id, "Connection was not registered");
        }
        conn.close(reason);
        removed
    }

    /// Look up a live connection.
    pub fn find_conn(&self, conn_id: i32) -> Result<Arc<Connection>, ManagerError> {
        let conn = self
            .store
            .get(conn_id)
            .ok_or(ManagerError::NotFound(conn_id))?;
        if conn.is_closed() {
            return Err(ManagerError::InvalidConnection(conn_id));
        }
        Ok(conn)
    }

    pub fn contains(&self, conn_id: i32) -> bool {
        self.store.exists(conn_id)
    }

    /// Draw a connection id that is not currently live.
    ///
    /// If every attempt collides the last draw is returned and registration
    /// will fail with [`ManagerError::IdInUse`].
    pub fn allocate_conn_id(&self) -> i32 {
        let mut conn_id = generate_conn_id();
        for _ in 1..MAX_ID_ATTEMPTS {
            if !self.contains(conn_id) {
                break;
            }
            warn!(conn_id, "Connection id collision, regenerating");
            conn_id = generate_conn_id();
        }
        conn_id
    }

    /// Snapshot of every registered connection.
    pub fn all_conns(&self) -> Vec<Arc<Connection>> {
        let mut conns = Vec::with_capacity(self.conn_count());
        self.store.range(&mut |_, conn| {
            conns.push(Arc::clone(conn));
            true
        });
        conns
    }

    pub fn conn_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Enqueue a copy of `msg` on every live connection without waiting.
    ///
    /// Connections whose queue is full or closed are skipped. Returns the
    /// number of connections the message was queued on.
    pub fn broadcast(&self, msg: &Message) -> usize {
        let mut delivered = 0;
        for conn in self.all_conns() {
            match conn.try_send_message(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(conn_id = conn.conn_id(), error = %e, "Broadcast skipped"),
            }
        }
        delivered
    }

    pub fn hook(&self) -> Option<Arc<dyn ConnHook>> {
        self.hook.read().clone()
    }

    /// Swap the lifecycle hook. Callbacks already running keep the old one.
    pub fn set_hook(&self, hook: Option<Arc<dyn ConnHook>>) {
        *self.hook.write() = hook;
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Timeout option in seconds by name; unknown names return 0.
    pub fn timeout_option(&self, name: &str) -> u64 {
        self.config.timeout_option(name)
    }

    pub fn read_buffer(&self) -> usize {
        self.config.read_buffer
    }

    pub fn write_buffer(&self) -> usize {
        self.config.write_buffer
    }

    pub fn max_frame_size(&self) -> usize {
        self.config.max_frame_size
    }

    /// Probe every connection once and evict those below `CLOSE`.
    pub fn sweep(&self) -> SweepReport {
        let detection_timeout = self.config.timeout("detection_timeout");
        let mut report = SweepReport::default();
        let mut evict = Vec::new();

        self.store.range(&mut |conn_id, conn| {
            if conn.stat().is_evictable() {
                evict.push(Arc::clone(conn));
                return true;
            }
            if conn.check_health(detection_timeout) {
                conn.update_stat(ConnStat::recover);
                report.healthy += 1;
            } else {
                let stat = conn.update_stat(ConnStat::decay);
                debug!(conn_id, stat = stat.0, "Health probe failed");
                report.degraded += 1;
            }
            true
        });

        // Removal happens outside `range`, which must not mutate the store.
        for conn in evict {
            debug!(conn_id = conn.conn_id(), "Evicting unhealthy connection");
            self.remove_conn(&conn, CloseReason::Evicted);
            report.evicted += 1;
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `exploration_cycle` until cancelled.
    pub async fn check_healths(&self, cancel: CancellationToken) {
        let period = self.config.timeout("exploration_cycle");
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Health sweep stopped");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.sweep();
                    if report.evicted > 0 || report.degraded > 0 {
                        info!(
                            healthy = report.healthy,
                            degraded = report.degraded,
                            evicted = report.evicted,
                            "Health sweep"
                        );
                    }
                }
            }
        }
    }

    fn release_slot(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}
