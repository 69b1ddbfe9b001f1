//! The engine facade tying pool, chain, statistics and scheduler together.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::context::Context;
use crate::error::{CallError, ChainError};
use crate::interceptor::{Chain, Interceptor};
use crate::maintenance::{eviction_task, rollover_task};
use crate::pool::{ChannelPool, ConnectionPool, ConnectionStatus, Connector};
use crate::procedure::{Args, Procedure};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::settings::EngineConfig;
use crate::telemetry::{UsageInterceptor, UsageRegistry};

/// Id of the root context installed by the engine.
pub const ROOT_CONTEXT: &str = "root";

/// Executes procedures and runs background maintenance.
///
/// # Example
///
/// ```rust,ignore
/// let engine = Engine::builder()
///     .config(EngineConfig::load(Some(Path::new("callframe.toml")))?)
///     .connection("db", Arc::new(PgConnector::new(url)))
///     .build()?;
///
/// let _maintenance = engine.start();
/// let orders = engine.execute(&list_orders, &Args::new())?;
/// ```
#[derive(Debug)]
pub struct Engine {
    chain: Chain,
    pool: Arc<dyn ConnectionPool>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    usage: Option<Arc<UsageRegistry>>,
    scheduler: Scheduler,
}

impl Engine {
    /// Create a builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Run `procedure` in a fresh call context below the thread's active one.
    ///
    /// Channels are committed when the procedure succeeds and rolled back
    /// otherwise; none stay reserved after this returns.
    pub fn execute(&self, procedure: &dyn Procedure, args: &Args) -> Result<Value, CallError> {
        let cx = Context::scope(format!("call:{}", procedure.name()));
        self.chain.execute(&cx, procedure, args)
    }

    /// Start the scheduler worker and register the maintenance tasks.
    ///
    /// Must be called within a tokio runtime. Returns `None` when the worker
    /// is already running.
    pub fn start(&self) -> Option<SchedulerHandle> {
        let handle = self.scheduler.start()?;

        if let Some(usage) = &self.usage {
            let task = rollover_task(usage.clone(), self.clock.clone());
            let interval = self.config.scheduler.rollover_interval();
            self.scheduler.schedule(&task, interval, Some(interval));
        }

        let max_idle_ms = i64::try_from(self.config.pool.max_idle_ms).unwrap_or(i64::MAX);
        let task = eviction_task(self.pool.clone(), self.clock.clone(), max_idle_ms);
        let interval = self.config.pool.eviction_interval();
        self.scheduler.schedule(&task, interval, Some(interval));

        info!(tasks = ?self.scheduler.tasks(), "engine maintenance started");
        Some(handle)
    }

    /// The interceptor chain.
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// The connection pool.
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// The scheduler running maintenance. Hosts may add their own tasks.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Usage statistics, unless tracking was disabled.
    pub fn usage(&self) -> Option<&Arc<UsageRegistry>> {
        self.usage.as_ref()
    }

    /// Status of every pooled connection.
    pub fn connections(&self) -> Vec<ConnectionStatus> {
        self.pool.status()
    }
}

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    pool: Option<Arc<dyn ConnectionPool>>,
    connections: Vec<(String, Arc<dyn Connector>)>,
    clock: Option<Arc<dyn Clock>>,
    config: EngineConfig,
    interceptors: Vec<Arc<dyn Interceptor>>,
    scheduler: Option<Scheduler>,
    track_usage: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            pool: None,
            connections: Vec::new(),
            clock: None,
            config: EngineConfig::default(),
            interceptors: Vec::new(),
            scheduler: None,
            track_usage: true,
        }
    }
}

impl EngineBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing pool instead of a [`ChannelPool`] built from the
    /// configuration.
    pub fn pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Register a connection with the built-in pool.
    pub fn connection(mut self, id: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.connections.push((id.into(), connector));
        self
    }

    /// Set the clock. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Add an interceptor. Interceptors run in the order they are added,
    /// inside usage tracking.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Share a scheduler with other components.
    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Enable or disable usage statistics. Enabled by default.
    pub fn track_usage(mut self, enabled: bool) -> Self {
        self.track_usage = enabled;
        self
    }

    /// Build the engine and install a root context if none exists.
    pub fn build(self) -> Result<Engine, ChainError> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let pool = match self.pool {
            Some(pool) => {
                if !self.connections.is_empty() {
                    warn!(
                        connections = self.connections.len(),
                        "connections ignored because a custom pool was supplied"
                    );
                }
                pool
            }
            None => {
                let builder = self
                    .connections
                    .into_iter()
                    .fold(ChannelPool::builder(), |builder, (id, connector)| {
                        builder.connection(id, connector)
                    });
                Arc::new(builder.config(&self.config.pool).clock(clock.clone()).build())
            }
        };

        let usage = self.track_usage.then(|| Arc::new(UsageRegistry::new()));

        let mut chain = Chain::builder(pool.clone()).clock(clock.clone());
        if let Some(usage) = &usage {
            chain = chain.usage(usage.clone()).interceptor(Arc::new(
                UsageInterceptor::with_clock(usage.clone(), clock.clone()),
            ));
        }
        let chain = self
            .interceptors
            .into_iter()
            .fold(chain, |chain, interceptor| chain.interceptor(interceptor))
            .build()?;

        Context::ensure_root(ROOT_CONTEXT);

        Ok(Engine {
            chain,
            pool,
            clock,
            config: self.config,
            usage,
            scheduler: self.scheduler.unwrap_or_default(),
        })
    }
}
