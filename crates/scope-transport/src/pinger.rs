//! Pinger — periodic liveness probing of open connections.
//!
//! Every round sends each registered connection a ping with a fresh random
//! payload. In [`PingerMode::ExpectPongs`] a probe still unanswered at the
//! next round, or one that could not be sent, counts as a failure; a
//! matching pong resets the count. A connection that reaches the failure
//! limit is removed and closed with code 1002, once.
//! [`PingerMode::KeepAlive`] only sends the probes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::{CloseReason, ConnectionId, Message, RawConnection};

/// Close reason sent to connections that stopped answering probes.
pub const DEAD_CONNECTION_REASON: &str = "too many failed pings";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingerMode {
    /// Count unanswered and unsendable probes; close dead connections.
    ExpectPongs,
    /// Send probes to keep intermediaries from idling the socket out.
    KeepAlive,
}

/// Pinger configuration.
#[derive(Debug, Clone)]
pub struct PingerConfig {
    /// Time between probe rounds
    pub interval: Duration,
    /// Consecutive failures after which a connection is closed
    pub failure_limit: u32,
    pub mode: PingerMode,
}

impl Default for PingerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(55),
            failure_limit: 4,
            mode: PingerMode::ExpectPongs,
        }
    }
}

/// Receives probe outcomes for one connection.
pub trait PingObserver: Send + Sync {
    /// A pong matching the outstanding probe arrived after `round_trip`.
    fn on_pong(&self, _connection: ConnectionId, _round_trip: Duration) {}

    /// The connection reached the failure limit and was closed.
    fn on_dead(&self, _connection: ConnectionId) {}
}

struct Probe {
    payload: Bytes,
    sent_at: Instant,
}

struct PingEntry {
    connection: Arc<dyn RawConnection>,
    observer: Option<Arc<dyn PingObserver>>,
    outstanding: Option<Probe>,
    failures: u32,
}

struct PingerInner {
    config: PingerConfig,
    entries: Mutex<HashMap<ConnectionId, PingEntry>>,
    stopped: AtomicBool,
    stop: Notify,
    rounds_in_flight: AtomicUsize,
    idle: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a pinger. Clones share the same registrations and loop.
#[derive(Clone)]
pub struct Pinger {
    inner: Arc<PingerInner>,
}

impl Pinger {
    /// A pinger that only probes when [`probe_round`](Self::probe_round) is called.
    pub fn new(config: PingerConfig) -> Self {
        Self {
            inner: Arc::new(PingerInner {
                config,
                entries: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                stop: Notify::new(),
                rounds_in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// A pinger probing every `config.interval` on the current runtime.
    pub fn start(config: PingerConfig) -> Self {
        let pinger = Self::new(config);
        let looping = pinger.clone();
        let handle = tokio::spawn(async move { looping.run().await });
        *pinger.inner.task.lock() = Some(handle);
        info!(
            interval = ?pinger.inner.config.interval,
            failure_limit = pinger.inner.config.failure_limit,
            mode = ?pinger.inner.config.mode,
            "pinger started"
        );
        pinger
    }

    pub fn config(&self) -> &PingerConfig {
        &self.inner.config
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.inner.config.interval,
            self.inner.config.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let stop = self.inner.stop.notified();
            tokio::pin!(stop);
            stop.as_mut().enable();
            if self.is_stopped() {
                break;
            }
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    self.probe_round();
                }
            }
        }
        debug!("pinger loop exited");
    }

    /// Start probing `connection`. Adding a connection again replaces its
    /// observer and keeps its failure count. Returns `false` once stopped.
    pub fn add_connection(&self, connection: Arc<dyn RawConnection>, observer: Option<Arc<dyn PingObserver>>) -> bool {
        if self.is_stopped() {
            warn!(connection = %connection.id(), "pinger stopped, connection not added");
            return false;
        }
        let id = connection.id();
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.observer = observer;
                entry.connection = connection;
            }
            None => {
                entries.insert(
                    id,
                    PingEntry {
                        connection,
                        observer,
                        outstanding: None,
                        failures: 0,
                    },
                );
            }
        }
        true
    }

    /// Stop probing `id`. Returns `false` if it was not registered.
    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        self.inner.entries.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.entries.lock().contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Consecutive failures recorded for `id`.
    pub fn failures(&self, id: ConnectionId) -> Option<u32> {
        self.inner.entries.lock().get(&id).map(|entry| entry.failures)
    }

    /// Handle a pong from `id`. Returns `true` if it answered the
    /// outstanding probe.
    pub fn on_pong(&self, id: ConnectionId, payload: &[u8]) -> bool {
        let answered = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(&id) else {
                return false;
            };
            match &entry.outstanding {
                Some(probe) if probe.payload.as_ref() == payload => {
                    let round_trip = probe.sent_at.elapsed();
                    entry.outstanding = None;
                    entry.failures = 0;
                    Some((entry.observer.clone(), round_trip))
                }
                _ => None,
            }
        };

        match answered {
            Some((observer, round_trip)) => {
                if let Some(observer) = observer {
                    observer.on_pong(id, round_trip);
                }
                true
            }
            None => false,
        }
    }

    /// Send one probe to every registered connection. Returns the ids of
    /// connections closed in this round.
    pub fn probe_round(&self) -> Vec<ConnectionId> {
        let _round = RoundPermit::acquire(&self.inner);
        let expect_pongs = self.inner.config.mode == PingerMode::ExpectPongs;
        let limit = self.inner.config.failure_limit;

        let mut dead = Vec::new();
        let mut probes = Vec::new();
        {
            let mut entries = self.inner.entries.lock();
            for (id, entry) in entries.iter_mut() {
                if expect_pongs && entry.outstanding.take().is_some() {
                    entry.failures += 1;
                }
                if expect_pongs && entry.failures >= limit {
                    dead.push(*id);
                    continue;
                }
                let payload = Bytes::copy_from_slice(&rand::random::<[u8; 8]>());
                entry.outstanding = Some(Probe {
                    payload: payload.clone(),
                    sent_at: Instant::now(),
                });
                probes.push((*id, entry.connection.clone(), payload));
            }
        }

        for (id, connection, payload) in probes {
            if let Err(e) = connection.send(Message::Ping(payload)) {
                debug!(connection = %id, "ping send failed: {e}");
                if expect_pongs && self.record_send_failure(id) {
                    dead.push(id);
                }
            }
        }

        let removed: Vec<PingEntry> = {
            let mut entries = self.inner.entries.lock();
            dead.iter().filter_map(|id| entries.remove(id)).collect()
        };

        removed
            .into_iter()
            .map(|entry| {
                let id = entry.connection.id();
                warn!(connection = %id, failures = entry.failures, "closing unresponsive connection");
                if let Err(e) = entry.connection.close(CloseReason::protocol_error(DEAD_CONNECTION_REASON)) {
                    debug!(connection = %id, "close of dead connection failed: {e}");
                }
                if let Some(observer) = entry.observer {
                    observer.on_dead(id);
                }
                id
            })
            .collect()
    }

    /// Count a failed send. Returns `true` if the connection reached the limit.
    fn record_send_failure(&self, id: ConnectionId) -> bool {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return false;
        };
        entry.outstanding = None;
        entry.failures += 1;
        entry.failures >= self.inner.config.failure_limit
    }

    /// Stop scheduling rounds. Returns the connections still registered,
    /// which are no longer probed.
    pub fn stop(&self) -> Vec<ConnectionId> {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            self.inner.stop.notify_waiters();
            info!("pinger stopping");
        }
        let drained = std::mem::take(&mut *self.inner.entries.lock());
        drained.into_keys().collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Wait for the probe loop to exit and any running round to finish.
    /// Returns `false` on timeout.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let task = self.inner.task.lock().take();
        let finished = async {
            if let Some(task) = task {
                let _ = task.await;
            }
            loop {
                let idle = self.inner.idle.notified();
                tokio::pin!(idle);
                idle.as_mut().enable();
                if self.inner.rounds_in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                idle.await;
            }
        };
        tokio::time::timeout(timeout, finished).await.is_ok()
    }
}

impl fmt::Debug for Pinger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pinger")
            .field("config", &self.inner.config)
            .field("connections", &self.connection_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct RoundPermit(Arc<PingerInner>);

impl RoundPermit {
    fn acquire(inner: &Arc<PingerInner>) -> Self {
        inner.rounds_in_flight.fetch_add(1, Ordering::SeqCst);
        Self(inner.clone())
    }
}

impl Drop for RoundPermit {
    fn drop(&mut self) {
        if self.0.rounds_in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
