//! # callframe-engine
//!
//! Request-execution engine for pluggable application servers.
//!
//! Every procedure call runs in its own [`Context`], a thread-scoped child
//! of whatever context the calling thread has active. An interceptor
//! [`Chain`] wraps the call in three stages: channels for every connection the
//! procedure binds are reserved from a [`ConnectionPool`], the procedure is
//! invoked, and the channels are released again, committed on success and
//! rolled back on failure. A single [`Scheduler`] worker rolls usage
//! statistics forward and evicts idle channels in the background.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use callframe_engine::{Args, Binding, Engine, FnProcedure};
//! use serde_json::json;
//!
//! let engine = Engine::builder().build().unwrap();
//!
//! let add = FnProcedure::new("add", |_cx, bindings| {
//!     let a = bindings.require("a")?.as_i64().unwrap_or(0);
//!     let b = bindings.require("b")?.as_i64().unwrap_or(0);
//!     Ok(json!(a + b))
//! })
//! .bind(Binding::argument("a", None))
//! .bind(Binding::argument("b", Some(json!(1))));
//!
//! let mut args = Args::new();
//! args.insert("a".to_string(), json!(41));
//! assert_eq!(engine.execute(&add, &args).unwrap(), json!(42));
//! ```
//!
//! ## Logging
//!
//! The engine logs through [`tracing`]; install a subscriber in the host to
//! see context misuse, release failures and maintenance activity.

mod clock;
mod context;
mod engine;
mod error;
mod interceptor;
mod maintenance;
mod pool;
mod procedure;
mod scheduler;
mod settings;
mod telemetry;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{Context, ContextGuard, ENVIRONMENT, STORAGE, USER};
pub use engine::{Engine, EngineBuilder, ROOT_CONTEXT};
pub use error::{CallError, ChainError, ConfigError, PoolError, ProcedureError};
pub use interceptor::{Chain, ChainBuilder, Interceptor, Next};
pub use maintenance::{eviction_task, rollover_task, EVICTION_TASK, ROLLOVER_TASK};
pub use pool::{
    Channel, ChannelPool, ChannelPoolBuilder, ConnectionPool, ConnectionStatus, Connector,
    Reservation,
};
pub use procedure::{
    Args, Binding, BindingKind, BindingValue, Bindings, FnProcedure, Procedure, Resolved,
};
pub use scheduler::{ScheduledTask, Scheduler, SchedulerHandle};
pub use settings::{EngineConfig, PoolConfig, SchedulerConfig, ENV_PREFIX};
pub use telemetry::{connection_key, procedure_key, UsageInterceptor, UsageRegistry};

// Re-export types for convenience
pub use callframe_types::{
    AverageWindow, MovingAverage, MovingSum, RecordError, SumWindow, UsageStats, DAY_MILLIS,
    HOUR_MILLIS,
};
