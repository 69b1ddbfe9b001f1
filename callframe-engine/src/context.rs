//! Hierarchical, thread-scoped call contexts.
//!
//! Every thread has at most one active context. Opening a context makes it a
//! child of the thread's active context (or of the process-wide root) and
//! activates it; closing it reactivates the parent. Attribute lookups walk
//! up the parent chain, writes always land in the context they are made on.
//!
//! The root is shared by all threads and lives in a single atomically
//! swappable slot, so a host can replace it (for example after reloading its
//! configuration) while contexts opened under the old root keep it as their
//! parent until they close.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::pool::{Channel, Reservation};

/// Attribute key of the host environment.
pub const ENVIRONMENT: &str = "environment";

/// Attribute key of the storage handle.
pub const STORAGE: &str = "storage";

/// Attribute key of the calling principal.
pub const USER: &str = "user";

type Attribute = Arc<dyn Any + Send + Sync>;

static ROOT: ArcSwapOption<Context> = ArcSwapOption::const_empty();

thread_local! {
    static ACTIVE: RefCell<Option<Arc<Context>>> = const { RefCell::new(None) };
}

/// A scope of ambient execution state.
///
/// # Example
///
/// ```rust
/// use callframe_engine::Context;
///
/// let root = Context::open("root");
/// root.set("region", "eu-west".to_string());
///
/// let call = Context::open("call");
/// assert_eq!(call.get::<String>("region").as_deref().map(String::as_str), Some("eu-west"));
///
/// call.set("region", "us-east".to_string());
/// assert_eq!(root.get::<String>("region").as_deref().map(String::as_str), Some("eu-west"));
///
/// call.close();
/// root.close();
/// ```
pub struct Context {
    id: String,
    parent: RwLock<Option<Arc<Context>>>,
    attributes: RwLock<HashMap<String, Attribute>>,
    reservations: Mutex<Vec<Reservation>>,
    /// `None` for the shared root.
    owner: Option<ThreadId>,
    closed: AtomicBool,
}

impl Context {
    fn new(id: String, parent: Option<Arc<Context>>, owner: Option<ThreadId>) -> Self {
        Self {
            id,
            parent: RwLock::new(parent),
            attributes: RwLock::new(HashMap::new()),
            reservations: Mutex::new(Vec::new()),
            owner,
            closed: AtomicBool::new(false),
        }
    }

    /// Open a context below the calling thread's active context and make it
    /// the active one.
    ///
    /// When there is neither an active context nor a root, the new context
    /// becomes the shared root instead.
    pub fn open(id: impl Into<String>) -> Arc<Context> {
        let id = id.into();
        if let Some(parent) = Self::active() {
            return Self::open_child(id, parent);
        }

        let root = Arc::new(Self::new(id.clone(), None, None));
        let previous = ROOT.compare_and_swap(&None::<Arc<Context>>, Some(root.clone()));
        match &*previous {
            None => {
                debug!(context = %root.id, "opened root context");
                root
            }
            // Another thread installed a root first.
            Some(existing) => Self::open_child(id, existing.clone()),
        }
    }

    fn open_child(id: String, parent: Arc<Context>) -> Arc<Context> {
        let context = Arc::new(Self::new(id, Some(parent), Some(thread::current().id())));
        ACTIVE.with(|active| *active.borrow_mut() = Some(context.clone()));
        debug!(context = %context.id, "opened context");
        context
    }

    /// Open a context that is closed when the returned guard is dropped.
    pub fn scope(id: impl Into<String>) -> ContextGuard {
        ContextGuard {
            context: Self::open(id),
        }
    }

    /// The calling thread's active context, falling back to the root.
    pub fn active() -> Option<Arc<Context>> {
        ACTIVE
            .with(|active| active.borrow().clone())
            .or_else(|| ROOT.load_full())
    }

    /// The shared root context, if one is installed.
    pub fn root() -> Option<Arc<Context>> {
        ROOT.load_full()
    }

    /// Replace the shared root, returning the previous one.
    ///
    /// Contexts already open keep their parent; only contexts opened after
    /// the swap see the new root. The new root must have been created as a
    /// root (see [`Context::new_root`]).
    pub fn set_root(root: Option<Arc<Context>>) -> Option<Arc<Context>> {
        ROOT.swap(root)
    }

    /// Create a detached root context for [`Context::set_root`].
    pub fn new_root(id: impl Into<String>) -> Arc<Context> {
        Arc::new(Self::new(id.into(), None, None))
    }

    /// The shared root, installing a fresh one named `id` if there is none.
    pub fn ensure_root(id: impl Into<String>) -> Arc<Context> {
        let fresh = Self::new_root(id);
        let previous = ROOT.compare_and_swap(&None::<Arc<Context>>, Some(fresh.clone()));
        match &*previous {
            Some(existing) => existing.clone(),
            None => fresh,
        }
    }

    /// Diagnostic label.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parent context, or `None` for a root or a closed context.
    pub fn parent(&self) -> Option<Arc<Context>> {
        self.parent.read().clone()
    }

    /// Whether this is a root shared between threads.
    pub fn is_shared(&self) -> bool {
        self.owner.is_none()
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the context and reactivate its parent on this thread.
    ///
    /// Must be called on the thread that opened the context while it is that
    /// thread's active context; other calls are logged and ignored. Closing
    /// twice is a no-op.
    /// Channels still reserved by the context are rolled back.
    pub fn close(&self) {
        if let Some(owner) = self.owner {
            if owner != thread::current().id() {
                warn!(context = %self.id, "context closed from a thread that does not own it");
                return;
            }
        }
        if self.is_closed() {
            return;
        }
        if !self.is_shared() && !self.is_active() {
            warn!(context = %self.id, "context closed while not active; ignoring");
            return;
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let parent = self.parent.write().take();
        if self.is_shared() {
            let current = ROOT.load_full();
            if current.as_ref().is_some_and(|root| std::ptr::eq(Arc::as_ptr(root), self)) {
                ROOT.compare_and_swap(&current, None::<Arc<Context>>);
            }
        } else {
            let restored = parent.filter(|parent| !parent.is_shared());
            ACTIVE.with(|active| *active.borrow_mut() = restored);
        }

        self.attributes.write().clear();
        let leftover = std::mem::take(&mut *self.reservations.lock());
        if !leftover.is_empty() {
            warn!(
                context = %self.id,
                channels = leftover.len(),
                "context closed with reserved channels; rolling back"
            );
            for reservation in leftover {
                let connection = reservation.connection().to_string();
                if let Err(err) = reservation.release(false) {
                    warn!(context = %self.id, %connection, error = %err, "rollback failed");
                }
            }
        }
        debug!(context = %self.id, "closed context");
    }

    fn is_active(&self) -> bool {
        ACTIVE.with(|active| {
            active
                .borrow()
                .as_ref()
                .is_some_and(|context| std::ptr::eq(Arc::as_ptr(context), self))
        })
    }

    fn lookup(&self, key: &str) -> Option<Attribute> {
        if let Some(value) = self.attributes.read().get(key) {
            return Some(value.clone());
        }
        let parent = self.parent.read().clone();
        parent.and_then(|parent| parent.lookup(key))
    }

    /// Whether the key is set here or on an ancestor.
    pub fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Value of the nearest binding of `key`, if it has type `T`.
    ///
    /// A missing key and a value of another type both yield `None`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.lookup(key)?.downcast::<T>().ok()
    }

    /// Set a value on this context, shadowing any ancestor value.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attributes.write().insert(key.into(), Arc::new(value));
    }

    /// Remove a value from this context. Ancestors are not affected.
    pub fn remove(&self, key: &str) -> bool {
        self.attributes.write().remove(key).is_some()
    }

    /// Value of `key` if visible with type `T`, otherwise `init()` stored on
    /// this context.
    pub fn get_or_set<T, F>(&self, key: &str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(value) = self.get::<T>(key) {
            return value;
        }
        let mut attributes = self.attributes.write();
        if let Some(value) = attributes
            .get(key)
            .and_then(|value| value.clone().downcast::<T>().ok())
        {
            return value;
        }
        let value = Arc::new(init());
        attributes.insert(key.to_string(), value.clone());
        value
    }

    /// The host environment stored under [`ENVIRONMENT`].
    pub fn environment<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get(ENVIRONMENT)
    }

    /// The storage handle stored under [`STORAGE`].
    pub fn storage<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get(STORAGE)
    }

    /// The calling principal stored under [`USER`].
    pub fn user<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.get(USER)
    }

    /// Channel reserved for `connection` by this context or an ancestor.
    pub fn channel(&self, connection: &str) -> Option<Arc<dyn Channel>> {
        let local = self
            .reservations
            .lock()
            .iter()
            .find(|r| r.connection() == connection)
            .map(|r| r.channel().clone());
        if local.is_some() {
            return local;
        }
        let parent = self.parent.read().clone();
        parent.and_then(|parent| parent.channel(connection))
    }

    /// Connections reserved by this context itself.
    pub fn reserved_connections(&self) -> Vec<String> {
        self.reservations
            .lock()
            .iter()
            .map(|r| r.connection().to_string())
            .collect()
    }

    pub(crate) fn add_reservations(&self, reservations: Vec<Reservation>) {
        self.reservations.lock().extend(reservations);
    }

    pub(crate) fn take_reservations(&self) -> Vec<Reservation> {
        std::mem::take(&mut *self.reservations.lock())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("shared", &self.is_shared())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Guard that closes its context when dropped.
///
/// Must be dropped on the thread that created it.
#[derive(Debug)]
pub struct ContextGuard {
    context: Arc<Context>,
}

impl ContextGuard {
    /// The guarded context.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }
}

impl Deref for ContextGuard {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.context
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.context.close();
    }
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    ROOT.store(None);
    ACTIVE.with(|active| *active.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::isolated;

    fn text(context: &Context, key: &str) -> Option<String> {
        context.get::<String>(key).map(|value| value.as_ref().clone())
    }

    #[test]
    fn first_context_becomes_shared_root() {
        let _lock = isolated();

        let root = Context::open("root");
        assert!(root.is_shared());
        assert!(root.parent().is_none());
        assert!(Arc::ptr_eq(&Context::root().unwrap(), &root));
        assert!(Arc::ptr_eq(&Context::active().unwrap(), &root));

        root.close();
        assert!(Context::root().is_none());
    }

    #[test]
    fn child_becomes_active_and_close_restores_parent() {
        let _lock = isolated();
        let root = Context::open("root");

        let outer = Context::open("outer");
        assert!(!outer.is_shared());
        assert!(Arc::ptr_eq(&outer.parent().unwrap(), &root));
        assert!(Arc::ptr_eq(&Context::active().unwrap(), &outer));

        let inner = Context::open("inner");
        assert!(Arc::ptr_eq(&Context::active().unwrap(), &inner));

        inner.close();
        assert!(Arc::ptr_eq(&Context::active().unwrap(), &outer));
        outer.close();
        assert!(Arc::ptr_eq(&Context::active().unwrap(), &root));
        root.close();
    }

    #[test]
    fn lookup_recurses_and_writes_stay_local() {
        let _lock = isolated();
        let root = Context::open("root");
        root.set("tenant", "acme".to_string());

        let child = Context::open("child");
        assert!(child.has("tenant"));
        assert_eq!(text(&child, "tenant").as_deref(), Some("acme"));

        child.set("tenant", "globex".to_string());
        assert_eq!(text(&child, "tenant").as_deref(), Some("globex"));
        assert_eq!(text(&root, "tenant").as_deref(), Some("acme"));

        assert!(child.remove("tenant"));
        assert_eq!(text(&child, "tenant").as_deref(), Some("acme"));
        assert!(!child.remove("tenant"));

        child.close();
        root.close();
    }

    #[test]
    fn siblings_are_isolated() {
        let _lock = isolated();
        let root = Context::open("root");

        let first = Context::open("first");
        first.set("scratch", 1u32);
        first.close();

        let second = Context::open("second");
        assert!(!second.has("scratch"));
        second.close();

        // Sibling on another thread, concurrently with an open context here.
        let here = Context::open("here");
        here.set("scratch", 2u32);
        let seen_elsewhere = thread::spawn(|| {
            let there = Context::open("there");
            let seen = there.has("scratch");
            there.close();
            seen
        })
        .join()
        .unwrap();
        assert!(!seen_elsewhere);
        here.close();
        root.close();
    }

    #[test]
    fn get_with_wrong_type_is_absent() {
        let _lock = isolated();
        let root = Context::open("root");
        root.set("count", 3u64);

        assert_eq!(root.get::<u64>("count").as_deref(), Some(&3));
        assert!(root.get::<String>("count").is_none());
        assert!(root.get::<u64>("missing").is_none());
        root.close();
    }

    #[test]
    fn get_or_set_initializes_once() {
        let _lock = isolated();
        let root = Context::open("root");
        let child = Context::open("child");

        let first = child.get_or_set("cache", || vec![1, 2, 3]);
        let second = child.get_or_set("cache", || Vec::<i32>::new());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!root.has("cache"));

        root.set("shared", 7u8);
        let inherited = child.get_or_set("shared", || 0u8);
        assert_eq!(*inherited, 7);

        child.close();
        root.close();
    }

    #[test]
    fn well_known_accessors() {
        let _lock = isolated();
        let root = Context::open("root");
        root.set(USER, "alice".to_string());
        root.set(STORAGE, 42usize);

        let child = Context::open("child");
        assert_eq!(child.user::<String>().as_deref().map(String::as_str), Some("alice"));
        assert_eq!(child.storage::<usize>().as_deref(), Some(&42));
        assert!(child.environment::<String>().is_none());
        child.close();
        root.close();
    }

    #[test]
    fn close_is_idempotent() {
        let _lock = isolated();
        let root = Context::open("root");
        let child = Context::open("child");
        child.set("k", 1u8);

        child.close();
        child.close();
        assert!(child.is_closed());
        assert!(!child.has("k"));
        assert!(child.parent().is_none());
        assert!(Arc::ptr_eq(&Context::active().unwrap(), &root));
        root.close();
    }

    #[test]
    fn close_from_other_thread_is_ignored() {
        let _lock = isolated();
        let root = Context::open("root");
        let child = Context::open("child");

        let remote = child.clone();
        thread::spawn(move || remote.close()).join().unwrap();

        assert!(!child.is_closed());
        assert!(Arc::ptr_eq(&Context::active().unwrap(), &child));
        child.close();
        root.close();
    }

    #[test]
    fn out_of_order_close_keeps_the_tree_intact() {
        let _lock = isolated();
        let root = Context::open("root");
        let outer = Context::open("outer");
        let inner = Context::open("inner");

        outer.close();
        assert!(!outer.is_closed());
        assert!(Arc::ptr_eq(&inner.parent().unwrap(), &outer));

        inner.close();
        assert!(Arc::ptr_eq(&Context::active().unwrap(), &outer));
        outer.close();
        assert!(Arc::ptr_eq(&Context::active().unwrap(), &root));

        root.set("k", 1i32);
        let next = Context::open("next");
        assert_eq!(next.get::<i32>("k").as_deref(), Some(&1));
        next.close();
        root.close();
    }

    #[test]
    fn scope_guard_closes_on_drop() {
        let _lock = isolated();
        let root = Context::open("root");
        {
            let guard = Context::scope("scoped");
            guard.set("x", 1i32);
            assert!(Arc::ptr_eq(&Context::active().unwrap(), guard.context()));
        }
        assert!(Arc::ptr_eq(&Context::active().unwrap(), &root));
        root.close();
    }

    #[test]
    fn swapping_root_leaves_open_contexts_alone() {
        let _lock = isolated();
        let old_root = Context::open("old");
        old_root.set("version", 1u32);
        let child = Context::open("child");

        let new_root = Context::new_root("new");
        new_root.set("version", 2u32);
        let previous = Context::set_root(Some(new_root.clone()));
        assert!(Arc::ptr_eq(&previous.unwrap(), &old_root));

        assert_eq!(child.get::<u32>("version").as_deref(), Some(&1));
        let grandchild = Context::open("grandchild");
        assert_eq!(grandchild.get::<u32>("version").as_deref(), Some(&1));
        grandchild.close();

        child.close();
        let fresh = Context::open("fresh");
        assert_eq!(fresh.get::<u32>("version").as_deref(), Some(&2));
        fresh.close();

        // Closing the replaced root does not clear the new one.
        old_root.close();
        assert!(Arc::ptr_eq(&Context::root().unwrap(), &new_root));
        new_root.close();
        assert!(Context::root().is_none());
    }

    #[test]
    fn close_rolls_back_leftover_reservations() {
        use crate::pool::{ChannelPool, ConnectionPool};
        use crate::testing::FakeConnector;

        let _lock = isolated();
        let connector = Arc::new(FakeConnector::default());
        let pool: Arc<dyn ConnectionPool> = Arc::new(
            ChannelPool::builder()
                .connection("db", connector.clone())
                .build(),
        );
        let root = Context::open("root");
        let child = Context::open("child");

        let channel = pool.reserve("db").unwrap();
        child.add_reservations(vec![Reservation::new(channel, pool.clone(), 0)]);
        assert_eq!(child.reserved_connections(), vec!["db".to_string()]);
        assert!(child.channel("db").is_some());

        child.close();
        assert_eq!(connector.channels()[0].rollbacks(), 1);
        assert_eq!(pool.status()[0].used, 0);
        root.close();
    }
}
