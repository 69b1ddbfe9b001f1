//! Error types for the call pipeline.

use thiserror::Error;

/// Errors raised by a connection pool or one of its channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Every channel of the connection is in use and none became free in time.
    #[error("connection '{0}' has no free channel")]
    Exhausted(String),

    /// No connection with this id is known to the pool.
    #[error("unknown connection '{0}'")]
    UnknownConnection(String),

    /// The connection could not open a usable channel.
    #[error("connection '{connection}' is invalid: {reason}")]
    InvalidConnection {
        /// Connection id.
        connection: String,
        /// Why the connection is unusable.
        reason: String,
    },

    /// A commit, rollback or close on an open channel failed.
    #[error("channel on '{connection}' failed: {reason}")]
    Channel {
        /// Connection id.
        connection: String,
        /// Failure reported by the channel.
        reason: String,
    },
}

/// Errors raised by a procedure while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcedureError {
    /// A declared argument had neither a call-time value nor a default.
    #[error("missing argument '{0}'")]
    MissingArgument(String),

    /// A binding value was not usable.
    #[error("invalid binding '{name}': {reason}")]
    Invalid {
        /// Binding name.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The procedure body failed.
    #[error("{0}")]
    Failed(String),
}

impl ProcedureError {
    /// Shorthand for [`ProcedureError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        ProcedureError::Failed(message.into())
    }
}

/// Errors surfaced to the caller of a procedure.
#[derive(Debug, Error)]
pub enum CallError {
    /// A connection required by the procedure could not be reserved.
    ///
    /// The call did not run and every channel reserved in the same pass has
    /// been rolled back.
    #[error("reservation for '{procedure}' failed: {source}")]
    Reservation {
        /// Procedure being reserved for.
        procedure: String,
        /// Pool failure.
        #[source]
        source: PoolError,
    },

    /// The procedure ran and failed. Its channels have been rolled back.
    #[error("procedure '{procedure}' failed: {source}")]
    Procedure {
        /// Failing procedure.
        procedure: String,
        /// Procedure failure.
        #[source]
        source: ProcedureError,
    },

    /// Procedure bindings refer back to a procedure already being reserved.
    #[error("procedure '{procedure}' binds itself recursively")]
    Recursion {
        /// Procedure found twice on the binding path.
        procedure: String,
    },
}

impl CallError {
    /// Name of the procedure the error belongs to.
    pub fn procedure(&self) -> &str {
        match self {
            CallError::Reservation { procedure, .. }
            | CallError::Procedure { procedure, .. }
            | CallError::Recursion { procedure } => procedure,
        }
    }
}

/// Errors raised while assembling an interceptor chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// An interceptor reported an empty name.
    #[error("interceptor at position {0} has an empty name")]
    EmptyName(usize),

    /// Two interceptors share a name.
    #[error("interceptor '{0}' is registered twice")]
    Duplicate(String),
}

/// Errors raised while loading engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or a value had the wrong type.
    #[error("invalid configuration: {0}")]
    Load(#[from] config::ConfigError),
}
