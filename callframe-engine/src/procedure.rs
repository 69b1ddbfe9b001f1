//! Procedures and their resource bindings.
//!
//! A procedure declares an ordered list of bindings. Before it runs, each
//! binding is resolved against the call context and the call-time arguments:
//! data and argument bindings become values, connection bindings become the
//! channel reserved for the call, procedure bindings stay invokable.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::context::Context;
use crate::error::ProcedureError;
use crate::pool::Channel;

/// Call-time arguments by name.
pub type Args = BTreeMap<String, Value>;

/// An invokable unit with declared resource bindings.
pub trait Procedure: Send + Sync {
    /// Unique procedure name.
    fn name(&self) -> &str;

    /// Declared bindings, in declaration order.
    fn bindings(&self) -> &[Binding];

    /// Run the procedure with its resolved bindings.
    fn invoke(&self, cx: &Context, bindings: &Bindings) -> Result<Value, ProcedureError>;
}

impl fmt::Debug for dyn Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("name", &self.name())
            .finish()
    }
}

/// What a binding refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// A constant value.
    Data,
    /// A pooled connection, by id.
    Connection,
    /// Another procedure.
    Procedure,
    /// A call-time argument, optionally defaulted.
    Argument,
}

/// Declared value of a binding.
#[derive(Debug, Clone)]
pub enum BindingValue {
    /// Constant value, replaceable by a call-time argument of the same name.
    Data(Value),
    /// Connection id to reserve a channel from.
    Connection(String),
    /// Nested procedure the body may call.
    Procedure(Arc<dyn Procedure>),
    /// Argument with an optional default.
    Argument(Option<Value>),
}

/// A named binding declared by a procedure.
#[derive(Debug, Clone)]
pub struct Binding {
    name: String,
    value: BindingValue,
}

impl Binding {
    /// Bind a constant value.
    pub fn data(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: BindingValue::Data(value.into()),
        }
    }

    /// Bind a connection by id.
    pub fn connection(name: impl Into<String>, connection: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: BindingValue::Connection(connection.into()),
        }
    }

    /// Bind a nested procedure.
    pub fn procedure(name: impl Into<String>, procedure: Arc<dyn Procedure>) -> Self {
        Self {
            name: name.into(),
            value: BindingValue::Procedure(procedure),
        }
    }

    /// Declare an argument, with a default used when the caller omits it.
    pub fn argument(name: impl Into<String>, default: Option<Value>) -> Self {
        Self {
            name: name.into(),
            value: BindingValue::Argument(default),
        }
    }

    /// Binding name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binding kind.
    pub fn kind(&self) -> BindingKind {
        match self.value {
            BindingValue::Data(_) => BindingKind::Data,
            BindingValue::Connection(_) => BindingKind::Connection,
            BindingValue::Procedure(_) => BindingKind::Procedure,
            BindingValue::Argument(_) => BindingKind::Argument,
        }
    }

    /// Declared value.
    pub fn value(&self) -> &BindingValue {
        &self.value
    }
}

/// A binding after resolution.
#[derive(Debug, Clone)]
pub enum Resolved {
    /// Data, argument or pass-through value.
    Value(Value),
    /// Channel reserved for the call.
    Channel(Arc<dyn Channel>),
    /// Nested procedure.
    Procedure(Arc<dyn Procedure>),
}

/// Resolved bindings handed to [`Procedure::invoke`].
///
/// Call-time arguments take precedence over declared data and argument
/// values; arguments the procedure does not declare are passed through as
/// plain values.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entries: Vec<(String, Resolved)>,
}

impl Bindings {
    /// Resolve the bindings of `procedure` for a call in `cx`.
    ///
    /// Connection bindings resolve to the channel reserved for the call by
    /// `cx` or one of its ancestors.
    pub fn resolve(
        procedure: &dyn Procedure,
        cx: &Context,
        args: &Args,
    ) -> Result<Self, ProcedureError> {
        let declared = procedure.bindings();
        let mut entries = Vec::with_capacity(declared.len() + args.len());

        for binding in declared {
            let name = binding.name();
            let resolved = match binding.value() {
                BindingValue::Data(value) => {
                    Resolved::Value(args.get(name).unwrap_or(value).clone())
                }
                BindingValue::Argument(default) => match args.get(name).or(default.as_ref()) {
                    Some(value) => Resolved::Value(value.clone()),
                    None => return Err(ProcedureError::MissingArgument(name.to_string())),
                },
                BindingValue::Connection(connection) => {
                    if args.contains_key(name) {
                        return Err(overridden(name));
                    }
                    let channel = cx.channel(connection).ok_or_else(|| ProcedureError::Invalid {
                        name: name.to_string(),
                        reason: format!("connection '{connection}' is not reserved"),
                    })?;
                    Resolved::Channel(channel)
                }
                BindingValue::Procedure(nested) => {
                    if args.contains_key(name) {
                        return Err(overridden(name));
                    }
                    Resolved::Procedure(nested.clone())
                }
            };
            entries.push((name.to_string(), resolved));
        }

        for (name, value) in args {
            if !declared.iter().any(|binding| binding.name() == name) {
                entries.push((name.clone(), Resolved::Value(value.clone())));
            }
        }

        Ok(Self { entries })
    }

    /// Resolved binding by name.
    pub fn get(&self, name: &str) -> Option<&Resolved> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, resolved)| resolved)
    }

    /// Binding names in resolution order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Value binding by name.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.get(name)? {
            Resolved::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Value binding by name, failing with [`ProcedureError::MissingArgument`].
    pub fn require(&self, name: &str) -> Result<&Value, ProcedureError> {
        self.value(name)
            .ok_or_else(|| ProcedureError::MissingArgument(name.to_string()))
    }

    /// Channel binding by name.
    pub fn channel(&self, name: &str) -> Option<&Arc<dyn Channel>> {
        match self.get(name)? {
            Resolved::Channel(channel) => Some(channel),
            _ => None,
        }
    }

    /// Channel binding downcast to its concrete type.
    pub fn channel_as<T: 'static>(&self, name: &str) -> Option<&T> {
        self.channel(name)?.as_any().downcast_ref::<T>()
    }

    /// Procedure binding by name.
    pub fn procedure(&self, name: &str) -> Option<&Arc<dyn Procedure>> {
        match self.get(name)? {
            Resolved::Procedure(procedure) => Some(procedure),
            _ => None,
        }
    }

    /// Invoke a nested procedure binding in the same context.
    ///
    /// The nested procedure uses the channels reserved for the outer call.
    pub fn call(&self, name: &str, cx: &Context, args: &Args) -> Result<Value, ProcedureError> {
        let procedure = self.procedure(name).ok_or_else(|| ProcedureError::Invalid {
            name: name.to_string(),
            reason: "not a procedure binding".to_string(),
        })?;
        let bindings = Bindings::resolve(procedure.as_ref(), cx, args)?;
        procedure.invoke(cx, &bindings)
    }
}

fn overridden(name: &str) -> ProcedureError {
    ProcedureError::Invalid {
        name: name.to_string(),
        reason: "cannot be replaced by a call-time argument".to_string(),
    }
}

/// A procedure backed by a closure.
///
/// ```rust
/// use std::sync::Arc;
/// use callframe_engine::{Binding, FnProcedure, Procedure};
/// use serde_json::json;
///
/// let greet = FnProcedure::new("greet", |_cx, bindings| {
///     let name = bindings.require("name")?;
///     Ok(json!(format!("hello {}", name.as_str().unwrap_or("?"))))
/// })
/// .bind(Binding::argument("name", Some(json!("world"))));
///
/// let greet: Arc<dyn Procedure> = Arc::new(greet);
/// assert_eq!(greet.bindings().len(), 1);
/// ```
pub struct FnProcedure<F> {
    name: String,
    bindings: Vec<Binding>,
    body: F,
}

impl<F> FnProcedure<F>
where
    F: Fn(&Context, &Bindings) -> Result<Value, ProcedureError> + Send + Sync,
{
    /// Create a procedure without bindings.
    pub fn new(name: impl Into<String>, body: F) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
            body,
        }
    }

    /// Declare a binding.
    pub fn bind(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }
}

impl<F> Procedure for FnProcedure<F>
where
    F: Fn(&Context, &Bindings) -> Result<Value, ProcedureError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    fn invoke(&self, cx: &Context, bindings: &Bindings) -> Result<Value, ProcedureError> {
        (self.body)(cx, bindings)
    }
}

impl<F> fmt::Debug for FnProcedure<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProcedure")
            .field("name", &self.name)
            .field("bindings", &self.bindings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ChannelPool, ConnectionPool, Reservation};
    use crate::testing::{isolated, FakeChannel, FakeConnector};
    use serde_json::json;

    fn echo() -> FnProcedure<impl Fn(&Context, &Bindings) -> Result<Value, ProcedureError> + Send + Sync>
    {
        FnProcedure::new("echo", |_cx: &Context, bindings: &Bindings| {
            Ok(json!(bindings.names().collect::<Vec<_>>()))
        })
    }

    fn args(pairs: &[(&str, Value)]) -> Args {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn arguments_override_declared_values() {
        let _lock = isolated();
        let cx = Context::open("root");
        let procedure = echo()
            .bind(Binding::data("limit", 10))
            .bind(Binding::argument("page", Some(json!(1))))
            .bind(Binding::argument("sort", Some(json!("asc"))));

        let bindings =
            Bindings::resolve(&procedure, &cx, &args(&[("limit", json!(50)), ("page", json!(3))]))
                .unwrap();

        assert_eq!(bindings.value("limit"), Some(&json!(50)));
        assert_eq!(bindings.value("page"), Some(&json!(3)));
        assert_eq!(bindings.value("sort"), Some(&json!("asc")));
        cx.close();
    }

    #[test]
    fn undeclared_arguments_are_passed_through() {
        let _lock = isolated();
        let cx = Context::open("root");
        let procedure = echo().bind(Binding::data("limit", 10));

        let bindings =
            Bindings::resolve(&procedure, &cx, &args(&[("trace", json!(true))])).unwrap();
        assert_eq!(bindings.names().collect::<Vec<_>>(), vec!["limit", "trace"]);
        assert_eq!(bindings.value("trace"), Some(&json!(true)));
        cx.close();
    }

    #[test]
    fn missing_argument_without_default_fails() {
        let _lock = isolated();
        let cx = Context::open("root");
        let procedure = echo().bind(Binding::argument("id", None));

        let err = Bindings::resolve(&procedure, &cx, &Args::new()).unwrap_err();
        assert_eq!(err, ProcedureError::MissingArgument("id".to_string()));
        cx.close();
    }

    #[test]
    fn connection_binding_needs_a_reservation() {
        let _lock = isolated();
        let cx = Context::open("root");
        let procedure = echo().bind(Binding::connection("db", "main"));

        let err = Bindings::resolve(&procedure, &cx, &Args::new()).unwrap_err();
        assert!(matches!(err, ProcedureError::Invalid { ref name, .. } if name == "db"));

        let pool: Arc<dyn ConnectionPool> = Arc::new(
            ChannelPool::builder()
                .connection("main", Arc::new(FakeConnector::default()))
                .build(),
        );
        let channel = pool.reserve("main").unwrap();
        cx.add_reservations(vec![Reservation::new(channel, pool.clone(), 0)]);

        let bindings = Bindings::resolve(&procedure, &cx, &Args::new()).unwrap();
        assert_eq!(bindings.channel_as::<FakeChannel>("db").unwrap().serial(), 1);

        let err = Bindings::resolve(&procedure, &cx, &args(&[("db", json!("other"))])).unwrap_err();
        assert!(matches!(err, ProcedureError::Invalid { .. }));
        cx.close();
    }

    #[test]
    fn nested_procedure_is_callable() {
        let _lock = isolated();
        let cx = Context::open("root");
        let double: Arc<dyn Procedure> = Arc::new(
            FnProcedure::new("double", |_cx: &Context, bindings: &Bindings| {
                let n = bindings.require("n")?.as_i64().unwrap_or(0);
                Ok(json!(n * 2))
            })
            .bind(Binding::argument("n", None)),
        );
        let outer = FnProcedure::new("outer", |cx: &Context, bindings: &Bindings| {
            bindings.call("double", cx, &args(&[("n", json!(21))]))
        })
        .bind(Binding::procedure("double", double));

        let bindings = Bindings::resolve(&outer, &cx, &Args::new()).unwrap();
        assert_eq!(outer.invoke(&cx, &bindings).unwrap(), json!(42));

        let err = bindings.call("missing", &cx, &Args::new()).unwrap_err();
        assert!(matches!(err, ProcedureError::Invalid { .. }));
        cx.close();
    }

    #[test]
    fn binding_kinds() {
        let nested: Arc<dyn Procedure> = Arc::new(echo());
        assert_eq!(Binding::data("a", 1).kind(), BindingKind::Data);
        assert_eq!(Binding::connection("b", "db").kind(), BindingKind::Connection);
        assert_eq!(Binding::procedure("c", nested).kind(), BindingKind::Procedure);
        assert_eq!(Binding::argument("d", None).kind(), BindingKind::Argument);
    }
}
