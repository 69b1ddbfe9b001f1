//! Per-procedure and per-connection usage statistics.

use std::collections::BTreeMap;
use std::sync::Arc;

use callframe_types::UsageStats;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::context::Context;
use crate::error::CallError;
use crate::interceptor::{Interceptor, Next};
use crate::procedure::{Args, Procedure};

/// Registry key of a procedure's statistics.
pub fn procedure_key(name: &str) -> String {
    format!("procedure:{name}")
}

/// Registry key of a connection's statistics.
pub fn connection_key(id: &str) -> String {
    format!("connection:{id}")
}

/// Thread-safe usage statistics by key.
#[derive(Debug, Default)]
pub struct UsageRegistry {
    entries: RwLock<BTreeMap<String, Arc<Mutex<UsageStats>>>>,
}

impl UsageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str, now: i64) -> Arc<Mutex<UsageStats>> {
        // Fast path
        {
            let entries = self.entries.read();
            if let Some(stats) = entries.get(key) {
                return stats.clone();
            }
        }

        // Slow path
        let mut entries = self.entries.write();
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UsageStats::new(now))))
            .clone()
    }

    /// Record one use of `key` at `now`, failed if `error` is set.
    pub fn record(&self, key: &str, now: i64, duration_ms: i64, error: Option<&str>) {
        self.entry(key, now)
            .lock()
            .record(now, duration_ms as f64, error);
    }

    /// Roll every entry forward to `now`. Returns the number of entries.
    pub fn roll_forward(&self, now: i64) -> usize {
        let entries = self.entries.read();
        for stats in entries.values() {
            stats.lock().move_to(now);
        }
        entries.len()
    }

    /// Statistics of one key.
    pub fn get(&self, key: &str) -> Option<UsageStats> {
        self.entries.read().get(key).map(|stats| stats.lock().clone())
    }

    /// Forget a key. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Snapshot of all statistics, sorted by key.
    pub fn collect(&self) -> BTreeMap<String, UsageStats> {
        self.entries
            .read()
            .iter()
            .map(|(key, stats)| (key.clone(), stats.lock().clone()))
            .collect()
    }
}

/// Records call count, failures and duration of every procedure call.
#[derive(Debug)]
pub struct UsageInterceptor {
    registry: Arc<UsageRegistry>,
    clock: Arc<dyn Clock>,
}

impl UsageInterceptor {
    /// Name the interceptor registers under.
    pub const NAME: &'static str = "usage";

    /// Record into `registry` using the system clock.
    pub fn new(registry: Arc<UsageRegistry>) -> Self {
        Self::with_clock(registry, Arc::new(SystemClock))
    }

    /// Record into `registry` using `clock`.
    pub fn with_clock(registry: Arc<UsageRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, clock }
    }
}

impl Interceptor for UsageInterceptor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn call(
        &self,
        cx: &Context,
        procedure: &dyn Procedure,
        args: &Args,
        next: Next<'_>,
    ) -> Result<Value, CallError> {
        let started = self.clock.now_millis();
        let result = next.call(cx, procedure, args);
        let now = self.clock.now_millis();

        let error = result.as_ref().err().map(ToString::to_string);
        self.registry.record(
            &procedure_key(procedure.name()),
            now,
            now - started,
            error.as_deref(),
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ProcedureError;
    use crate::interceptor::Chain;
    use crate::pool::ChannelPool;
    use crate::procedure::{Bindings, FnProcedure};
    use crate::testing::isolated;
    use callframe_types::{AverageWindow, SumWindow, HOUR_MILLIS};
    use serde_json::json;

    #[test]
    fn record_creates_and_updates_entries() {
        let registry = UsageRegistry::new();
        registry.record("procedure:a", 1_000, 20, None);
        registry.record("procedure:a", 2_000, 40, Some("boom"));

        let stats = registry.get("procedure:a").unwrap();
        assert_eq!(stats.calls.current(SumWindow::Hour), 2.0);
        assert_eq!(stats.failures.current(SumWindow::Hour), 1.0);
        assert_eq!(stats.last_used, 2_000);
        assert_eq!(stats.last_error.as_deref(), Some("boom"));
        assert!(registry.get("procedure:b").is_none());
    }

    #[test]
    fn roll_forward_moves_every_entry() {
        let registry = UsageRegistry::new();
        registry.record("a", 0, 1, None);
        registry.record("b", 0, 1, None);

        assert_eq!(registry.roll_forward(HOUR_MILLIS), 2);
        for stats in registry.collect().values() {
            assert_eq!(stats.calls.current(SumWindow::Hour), 0.0);
            assert_eq!(stats.calls.previous(SumWindow::Hour), 1.0);
        }
    }

    #[test]
    fn collect_is_sorted_and_remove_forgets() {
        let registry = UsageRegistry::new();
        registry.record(&procedure_key("z"), 0, 1, None);
        registry.record(&connection_key("db"), 0, 1, None);

        let keys: Vec<_> = registry.collect().into_keys().collect();
        assert_eq!(keys, vec!["connection:db", "procedure:z"]);

        assert!(registry.remove("procedure:z"));
        assert!(!registry.remove("procedure:z"));
        assert_eq!(registry.collect().len(), 1);
    }

    #[test]
    fn interceptor_times_calls() {
        let _lock = isolated();
        let clock = Arc::new(ManualClock::new(HOUR_MILLIS));
        let registry = Arc::new(UsageRegistry::new());
        let pool = Arc::new(ChannelPool::builder().build());
        let chain = Chain::builder(pool)
            .interceptor(Arc::new(UsageInterceptor::with_clock(
                registry.clone(),
                clock.clone(),
            )))
            .build()
            .unwrap();

        let ticking = clock.clone();
        let slow = FnProcedure::new("slow", move |_cx: &Context, bindings: &Bindings| {
            ticking.advance(30);
            match bindings.value("fail") {
                Some(_) => Err(ProcedureError::failed("asked to fail")),
                None => Ok(json!(1)),
            }
        });

        let cx = Context::open("call");
        chain.execute(&cx, &slow, &Args::new()).unwrap();
        let mut args = Args::new();
        args.insert("fail".to_string(), json!(true));
        chain.execute(&cx, &slow, &args).unwrap_err();
        cx.close();

        let stats = registry.get("procedure:slow").unwrap();
        assert_eq!(stats.calls.current(SumWindow::Hour), 2.0);
        assert_eq!(stats.failures.current(SumWindow::Hour), 1.0);
        assert!((stats.duration.value_for(AverageWindow::Short) - 5.7).abs() < 1e-9);
        assert!(stats.last_error.as_deref().unwrap().contains("asked to fail"));
        assert_eq!(stats.last_used, HOUR_MILLIS + 60);
    }
}
