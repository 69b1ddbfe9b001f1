//! Pooled connection channels.
//!
//! The engine only depends on the [`ConnectionPool`] and [`Channel`] traits.
//! [`ChannelPool`] is a bounded, blocking implementation over
//! [`Connector`]s that hosts can use directly or replace with their own.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::PoolError;
use crate::settings::PoolConfig;

/// One pooled handle to an external system.
///
/// A channel is owned by exactly one call between reservation and release.
/// Implementations use interior mutability since the engine shares the
/// handle between the context and the procedure bindings.
pub trait Channel: Send + Sync + fmt::Debug {
    /// Id of the connection this channel belongs to.
    fn connection(&self) -> &str;

    /// Whether the channel can still be used. Invalid channels are closed
    /// instead of being returned to the pool.
    fn is_valid(&self) -> bool {
        true
    }

    /// Make the work done through the channel permanent.
    fn commit(&self) -> Result<(), PoolError>;

    /// Discard the work done through the channel.
    fn rollback(&self) -> Result<(), PoolError>;

    /// Close the underlying handle.
    fn close(&self) -> Result<(), PoolError>;

    /// Access to the concrete channel type for procedures.
    fn as_any(&self) -> &dyn Any;
}

/// Source of channels reserved by the interceptor chain.
pub trait ConnectionPool: Send + Sync + fmt::Debug {
    /// Reserve a channel for exclusive use. May block until one is free.
    fn reserve(&self, connection: &str) -> Result<Arc<dyn Channel>, PoolError>;

    /// Commit or roll back a reserved channel and hand it back.
    fn release(&self, channel: Arc<dyn Channel>, commit: bool) -> Result<(), PoolError>;

    /// Per-connection channel counts and health.
    fn status(&self) -> Vec<ConnectionStatus>;

    /// Close channels idle for at least `max_idle_ms` as of `now`.
    ///
    /// Returns the number of channels closed.
    fn evict_idle(&self, now: i64, max_idle_ms: i64) -> usize;
}

/// Opens new channels for one kind of connection.
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a fresh channel for `connection`.
    fn open(&self, connection: &str) -> Result<Arc<dyn Channel>, PoolError>;
}

/// Point-in-time state of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Connection id.
    pub connection: String,
    /// Channels currently open, idle or in use.
    pub open: usize,
    /// Channels currently reserved.
    pub used: usize,
    /// Unix timestamp in milliseconds of the last reservation or release.
    pub last_used: i64,
    /// Most recent open, commit or rollback failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A channel reserved for a call, together with the pool it returns to.
pub struct Reservation {
    channel: Arc<dyn Channel>,
    pool: Arc<dyn ConnectionPool>,
    reserved_at: i64,
}

impl Reservation {
    /// Wrap a freshly reserved channel.
    pub fn new(channel: Arc<dyn Channel>, pool: Arc<dyn ConnectionPool>, reserved_at: i64) -> Self {
        Self {
            channel,
            pool,
            reserved_at,
        }
    }

    /// Id of the reserved connection.
    pub fn connection(&self) -> &str {
        self.channel.connection()
    }

    /// The reserved channel.
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Unix timestamp in milliseconds the channel was reserved at.
    pub fn reserved_at(&self) -> i64 {
        self.reserved_at
    }

    /// Commit or roll back the channel and return it to its pool.
    pub fn release(self, commit: bool) -> Result<(), PoolError> {
        self.pool.release(self.channel, commit)
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("connection", &self.connection())
            .field("reserved_at", &self.reserved_at)
            .finish()
    }
}

struct IdleChannel {
    channel: Arc<dyn Channel>,
    since: i64,
}

#[derive(Default)]
struct SlotState {
    idle: Vec<IdleChannel>,
    open: usize,
    used: usize,
    last_used: i64,
    last_error: Option<String>,
}

/// Channels of one connection.
struct ConnectionSlot {
    connector: RwLock<Arc<dyn Connector>>,
    state: Mutex<SlotState>,
    available: Condvar,
}

impl ConnectionSlot {
    fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector: RwLock::new(connector),
            state: Mutex::new(SlotState::default()),
            available: Condvar::new(),
        }
    }
}

/// Close a channel that is leaving the pool, logging failures.
fn discard(state: &mut MutexGuard<'_, SlotState>, channel: Arc<dyn Channel>) {
    state.open = state.open.saturating_sub(1);
    MutexGuard::unlocked(state, || {
        if let Err(err) = channel.close() {
            warn!(connection = channel.connection(), error = %err, "failed to close channel");
        }
    });
}

/// A bounded pool of reusable channels per connection.
///
/// Reservations reuse the most recently released idle channel, open a new
/// one while fewer than `max_open` exist, and otherwise wait up to the
/// reserve timeout for a release before failing with
/// [`PoolError::Exhausted`]. Waiters are woken one per release.
///
/// # Example
///
/// ```rust,ignore
/// let pool = ChannelPool::builder()
///     .max_open(4)
///     .connection("db", Arc::new(MyConnector::new(url)))
///     .build();
/// let channel = pool.reserve("db")?;
/// pool.release(channel, true)?;
/// ```
pub struct ChannelPool {
    clock: Arc<dyn Clock>,
    max_open: usize,
    reserve_timeout: Duration,
    connections: RwLock<BTreeMap<String, Arc<ConnectionSlot>>>,
}

impl ChannelPool {
    /// Create a builder for configuring the pool.
    pub fn builder() -> ChannelPoolBuilder {
        ChannelPoolBuilder::new()
    }

    /// Register a connection, replacing any previous connector for the id.
    ///
    /// A replaced connection keeps its counts. Its idle channels are closed;
    /// channels still reserved return to the pool as usual.
    pub fn add_connection(&self, id: impl Into<String>, connector: Arc<dyn Connector>) {
        let id = id.into();
        let slot = {
            let mut connections = self.connections.write();
            match connections.get(&id) {
                Some(slot) => slot.clone(),
                None => {
                    connections.insert(id, Arc::new(ConnectionSlot::new(connector)));
                    return;
                }
            }
        };

        *slot.connector.write() = connector;
        let mut state = slot.state.lock();
        let idle = std::mem::take(&mut state.idle);
        debug!(connection = %id, closed = idle.len(), "replaced connector");
        for entry in idle {
            discard(&mut state, entry.channel);
        }
        slot.available.notify_all();
    }

    /// Ids of all registered connections.
    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }

    fn slot(&self, connection: &str) -> Result<Arc<ConnectionSlot>, PoolError> {
        self.connections
            .read()
            .get(connection)
            .cloned()
            .ok_or_else(|| PoolError::UnknownConnection(connection.to_string()))
    }
}

impl ConnectionPool for ChannelPool {
    fn reserve(&self, connection: &str) -> Result<Arc<dyn Channel>, PoolError> {
        let slot = self.slot(connection)?;
        // A timeout too large to represent waits without a deadline.
        let deadline = Instant::now().checked_add(self.reserve_timeout);
        let mut state = slot.state.lock();

        loop {
            while let Some(idle) = state.idle.pop() {
                if idle.channel.is_valid() {
                    state.used += 1;
                    state.last_used = self.clock.now_millis();
                    return Ok(idle.channel);
                }
                debug!(connection, "discarding invalid idle channel");
                discard(&mut state, idle.channel);
            }

            if state.open < self.max_open {
                state.open += 1;
                state.used += 1;
                let connector = slot.connector.read().clone();
                let opened = MutexGuard::unlocked(&mut state, || connector.open(connection));
                return match opened {
                    Ok(channel) => {
                        debug!(connection, open = state.open, "opened channel");
                        state.last_used = self.clock.now_millis();
                        Ok(channel)
                    }
                    Err(err) => {
                        state.open -= 1;
                        state.used -= 1;
                        state.last_error = Some(err.to_string());
                        slot.available.notify_one();
                        Err(err)
                    }
                };
            }

            match deadline {
                Some(deadline) => {
                    if slot.available.wait_until(&mut state, deadline).timed_out() {
                        return Err(PoolError::Exhausted(connection.to_string()));
                    }
                }
                None => slot.available.wait(&mut state),
            }
        }
    }

    fn release(&self, channel: Arc<dyn Channel>, commit: bool) -> Result<(), PoolError> {
        let slot = self.slot(channel.connection())?;
        let result = if commit {
            channel.commit()
        } else {
            channel.rollback()
        };

        let now = self.clock.now_millis();
        let mut state = slot.state.lock();
        state.used = state.used.saturating_sub(1);
        state.last_used = now;
        match &result {
            Ok(()) if channel.is_valid() => state.idle.push(IdleChannel {
                channel,
                since: now,
            }),
            _ => {
                if let Err(err) = &result {
                    state.last_error = Some(err.to_string());
                }
                discard(&mut state, channel);
            }
        }
        slot.available.notify_one();
        result
    }

    fn status(&self) -> Vec<ConnectionStatus> {
        self.connections
            .read()
            .iter()
            .map(|(id, slot)| {
                let state = slot.state.lock();
                ConnectionStatus {
                    connection: id.clone(),
                    open: state.open,
                    used: state.used,
                    last_used: state.last_used,
                    last_error: state.last_error.clone(),
                }
            })
            .collect()
    }

    fn evict_idle(&self, now: i64, max_idle_ms: i64) -> usize {
        let slots: Vec<_> = self.connections.read().values().cloned().collect();
        let mut evicted = 0;
        for slot in slots {
            let mut state = slot.state.lock();
            let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|idle| now - idle.since >= max_idle_ms);
            state.idle = kept;
            evicted += expired.len();
            for idle in expired {
                discard(&mut state, idle.channel);
            }
        }
        evicted
    }
}

impl fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPool")
            .field("max_open", &self.max_open)
            .field("reserve_timeout", &self.reserve_timeout)
            .field("connections", &self.connection_ids())
            .finish()
    }
}

/// Builder for a [`ChannelPool`].
#[derive(Default)]
pub struct ChannelPoolBuilder {
    clock: Option<Arc<dyn Clock>>,
    max_open: Option<usize>,
    reserve_timeout: Option<Duration>,
    connections: Vec<(String, Arc<dyn Connector>)>,
}

impl ChannelPoolBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take limits from a pool configuration.
    pub fn config(mut self, config: &PoolConfig) -> Self {
        self.max_open = Some(config.max_open);
        self.reserve_timeout = Some(config.reserve_timeout());
        self
    }

    /// Set the clock used for idle tracking. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the maximum number of open channels per connection.
    pub fn max_open(mut self, max_open: usize) -> Self {
        self.max_open = Some(max_open);
        self
    }

    /// Set how long a reservation waits for a free channel.
    pub fn reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = Some(timeout);
        self
    }

    /// Register a connection.
    pub fn connection(mut self, id: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.connections.push((id.into(), connector));
        self
    }

    /// Build the pool.
    pub fn build(self) -> ChannelPool {
        let defaults = PoolConfig::default();
        let connections = self
            .connections
            .into_iter()
            .map(|(id, connector)| (id, Arc::new(ConnectionSlot::new(connector))))
            .collect();
        ChannelPool {
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            max_open: self.max_open.unwrap_or(defaults.max_open).max(1),
            reserve_timeout: self
                .reserve_timeout
                .unwrap_or_else(|| defaults.reserve_timeout()),
            connections: RwLock::new(connections),
        }
    }
}
