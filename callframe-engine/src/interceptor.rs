//! The Reserve → Call → Release pipeline wrapped around every call.
//!
//! A [`Chain`] is an ordered list of [`Interceptor`]s in front of a fixed
//! terminal stage that does the real work: reserving channels from the pool,
//! resolving bindings and invoking the procedure, and releasing channels.
//! Each interceptor may override any stage; the default implementation of
//! every stage forwards to the next one. An override receives the rest of the
//! chain as a single-use [`Next`] and either forwards through it or handles
//! the stage completely.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::context::Context;
use crate::error::{CallError, ChainError};
use crate::pool::{ConnectionPool, Reservation};
use crate::procedure::{Args, BindingValue, Bindings, Procedure};
use crate::telemetry::{connection_key, UsageRegistry};

/// A pipeline stage around procedure calls.
///
/// # Example
///
/// ```rust
/// use callframe_engine::{Args, CallError, Context, Interceptor, Next, Procedure};
/// use serde_json::Value;
///
/// struct Audit;
///
/// impl Interceptor for Audit {
///     fn name(&self) -> &str {
///         "audit"
///     }
///
///     fn call(
///         &self,
///         cx: &Context,
///         procedure: &dyn Procedure,
///         args: &Args,
///         next: Next<'_>,
///     ) -> Result<Value, CallError> {
///         println!("calling {}", procedure.name());
///         next.call(cx, procedure, args)
///     }
/// }
/// ```
pub trait Interceptor: Send + Sync {
    /// Unique name within a chain.
    fn name(&self) -> &str;

    /// Reserve the channels `procedure` needs.
    fn reserve(
        &self,
        cx: &Context,
        procedure: &dyn Procedure,
        next: Next<'_>,
    ) -> Result<(), CallError> {
        next.reserve(cx, procedure)
    }

    /// Invoke `procedure` with call-time arguments.
    fn call(
        &self,
        cx: &Context,
        procedure: &dyn Procedure,
        args: &Args,
        next: Next<'_>,
    ) -> Result<Value, CallError> {
        next.call(cx, procedure, args)
    }

    /// Release every channel reserved by `cx`.
    fn release_all(&self, cx: &Context, commit: bool, next: Next<'_>) {
        next.release_all(cx, commit)
    }
}

/// The remainder of a chain after the current interceptor.
#[must_use = "a stage that is not fully handled must be forwarded"]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    terminal: &'a Terminal,
}

impl<'a> Next<'a> {
    /// Forward the reserve stage.
    pub fn reserve(self, cx: &Context, procedure: &dyn Procedure) -> Result<(), CallError> {
        match self.rest.split_first() {
            Some((head, rest)) => head.reserve(cx, procedure, self.advance(rest)),
            None => self.terminal.reserve(cx, procedure),
        }
    }

    /// Forward the call stage.
    pub fn call(
        self,
        cx: &Context,
        procedure: &dyn Procedure,
        args: &Args,
    ) -> Result<Value, CallError> {
        match self.rest.split_first() {
            Some((head, rest)) => head.call(cx, procedure, args, self.advance(rest)),
            None => self.terminal.call(cx, procedure, args),
        }
    }

    /// Forward the release stage.
    pub fn release_all(self, cx: &Context, commit: bool) {
        match self.rest.split_first() {
            Some((head, rest)) => head.release_all(cx, commit, self.advance(rest)),
            None => self.terminal.release_all(cx, commit),
        }
    }

    fn advance(&self, rest: &'a [Arc<dyn Interceptor>]) -> Next<'a> {
        Next {
            rest,
            terminal: self.terminal,
        }
    }
}

/// The stage at the end of every chain.
#[derive(Debug)]
pub(crate) struct Terminal {
    pool: Arc<dyn ConnectionPool>,
    clock: Arc<dyn Clock>,
    usage: Option<Arc<UsageRegistry>>,
}

impl Terminal {
    fn reserve(&self, cx: &Context, procedure: &dyn Procedure) -> Result<(), CallError> {
        let mut needed = Vec::new();
        collect_connections(procedure, cx, &mut Vec::new(), &mut needed)?;

        let mut reserved = Vec::with_capacity(needed.len());
        for connection in needed {
            match self.pool.reserve(&connection) {
                Ok(channel) => {
                    debug!(procedure = procedure.name(), %connection, "reserved channel");
                    let now = self.clock.now_millis();
                    reserved.push(Reservation::new(channel, self.pool.clone(), now));
                }
                Err(source) => {
                    warn!(
                        procedure = procedure.name(),
                        %connection,
                        error = %source,
                        rolled_back = reserved.len(),
                        "reservation failed"
                    );
                    if let Some(usage) = &self.usage {
                        let error = source.to_string();
                        let now = self.clock.now_millis();
                        usage.record(&connection_key(&connection), now, 0, Some(&error));
                    }
                    self.release(reserved, false);
                    return Err(CallError::Reservation {
                        procedure: procedure.name().to_string(),
                        source,
                    });
                }
            }
        }

        cx.add_reservations(reserved);
        Ok(())
    }

    fn call(
        &self,
        cx: &Context,
        procedure: &dyn Procedure,
        args: &Args,
    ) -> Result<Value, CallError> {
        let failed = |source| CallError::Procedure {
            procedure: procedure.name().to_string(),
            source,
        };
        let bindings = Bindings::resolve(procedure, cx, args).map_err(failed)?;
        procedure.invoke(cx, &bindings).map_err(failed)
    }

    fn release_all(&self, cx: &Context, commit: bool) {
        let reservations = cx.take_reservations();
        if reservations.is_empty() {
            debug!(context = cx.id(), "nothing to release");
            return;
        }
        self.release(reservations, commit);
    }

    /// Release every reservation, logging failures without stopping.
    fn release(&self, reservations: Vec<Reservation>, commit: bool) {
        for reservation in reservations {
            let connection = reservation.connection().to_string();
            let reserved_at = reservation.reserved_at();
            let result = reservation.release(commit);
            let now = self.clock.now_millis();

            let error = match result {
                Ok(()) => {
                    debug!(%connection, commit, "released channel");
                    None
                }
                Err(err) => {
                    warn!(%connection, commit, error = %err, "failed to release channel");
                    Some(err.to_string())
                }
            };
            if let Some(usage) = &self.usage {
                let key = connection_key(&connection);
                usage.record(&key, now, now - reserved_at, error.as_deref());
            }
        }
    }
}

/// Collect the connections `procedure` and its nested procedures bind that
/// are not yet reserved by `cx` or its ancestors.
fn collect_connections(
    procedure: &dyn Procedure,
    cx: &Context,
    path: &mut Vec<String>,
    needed: &mut Vec<String>,
) -> Result<(), CallError> {
    if path.iter().any(|name| name == procedure.name()) {
        return Err(CallError::Recursion {
            procedure: procedure.name().to_string(),
        });
    }
    path.push(procedure.name().to_string());

    for binding in procedure.bindings() {
        match binding.value() {
            BindingValue::Connection(connection) => {
                if !needed.contains(connection) && cx.channel(connection).is_none() {
                    needed.push(connection.clone());
                }
            }
            BindingValue::Procedure(nested) => {
                collect_connections(nested.as_ref(), cx, path, needed)?;
            }
            BindingValue::Data(_) | BindingValue::Argument(_) => {}
        }
    }

    path.pop();
    Ok(())
}

/// An ordered interceptor pipeline ending in the terminal stage.
///
/// The first interceptor added is the outermost. A chain is assembled once at
/// startup and shared by all calls.
pub struct Chain {
    interceptors: Vec<Arc<dyn Interceptor>>,
    terminal: Terminal,
}

impl Chain {
    /// Create a builder for a chain over `pool`.
    pub fn builder(pool: Arc<dyn ConnectionPool>) -> ChainBuilder {
        ChainBuilder::new(pool)
    }

    fn head(&self) -> Next<'_> {
        Next {
            rest: &self.interceptors,
            terminal: &self.terminal,
        }
    }

    /// Names of the interceptors, outermost first.
    pub fn interceptor_names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run the reserve stage.
    ///
    /// On failure no channel reserved by this pass remains checked out.
    pub fn reserve(&self, cx: &Context, procedure: &dyn Procedure) -> Result<(), CallError> {
        self.head().reserve(cx, procedure)
    }

    /// Run the call stage.
    pub fn call(
        &self,
        cx: &Context,
        procedure: &dyn Procedure,
        args: &Args,
    ) -> Result<Value, CallError> {
        self.head().call(cx, procedure, args)
    }

    /// Run the release stage. Never fails; a no-op when nothing is reserved.
    pub fn release_all(&self, cx: &Context, commit: bool) {
        self.head().release_all(cx, commit);

        let leftover = cx.reserved_connections();
        if !leftover.is_empty() {
            warn!(
                context = cx.id(),
                ?leftover,
                "release stage did not reach the pool; releasing directly"
            );
            self.terminal.release_all(cx, commit);
        }
    }

    /// Reserve, call and release for one call in `cx`.
    ///
    /// Release always runs exactly once and commits only when the call
    /// succeeded.
    pub fn execute(
        &self,
        cx: &Context,
        procedure: &dyn Procedure,
        args: &Args,
    ) -> Result<Value, CallError> {
        if let Err(err) = self.reserve(cx, procedure) {
            self.release_all(cx, false);
            return Err(err);
        }
        let result = self.call(cx, procedure, args);
        self.release_all(cx, result.is_ok());
        result
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("interceptors", &self.interceptor_names())
            .field("terminal", &self.terminal)
            .finish()
    }
}

/// Builder for a [`Chain`].
pub struct ChainBuilder {
    pool: Arc<dyn ConnectionPool>,
    clock: Option<Arc<dyn Clock>>,
    usage: Option<Arc<UsageRegistry>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl ChainBuilder {
    /// Create a builder over `pool`.
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            pool,
            clock: None,
            usage: None,
            interceptors: Vec::new(),
        }
    }

    /// Set the clock used for reservation timestamps. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Record per-connection usage in `registry`.
    pub fn usage(mut self, registry: Arc<UsageRegistry>) -> Self {
        self.usage = Some(registry);
        self
    }

    /// Append an interceptor inside the ones already added.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Build the chain, rejecting unnamed or duplicate interceptors.
    pub fn build(self) -> Result<Chain, ChainError> {
        let mut seen = HashSet::new();
        for (position, interceptor) in self.interceptors.iter().enumerate() {
            let name = interceptor.name();
            if name.is_empty() {
                return Err(ChainError::EmptyName(position));
            }
            if !seen.insert(name) {
                return Err(ChainError::Duplicate(name.to_string()));
            }
        }

        Ok(Chain {
            interceptors: self.interceptors,
            terminal: Terminal {
                pool: self.pool,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                usage: self.usage,
            },
        })
    }
}
