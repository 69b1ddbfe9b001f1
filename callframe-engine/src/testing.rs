//! In-memory channels, connectors and helpers shared by unit tests.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::context;
use crate::error::PoolError;
use crate::pool::{Channel, Connector};

static CONTEXT_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Serialize tests that touch the process-wide root context and start them
/// from a clean slate.
pub(crate) fn isolated() -> MutexGuard<'static, ()> {
    let guard = CONTEXT_LOCK.lock();
    context::reset_for_tests();
    guard
}

#[derive(Debug)]
pub(crate) struct FakeChannel {
    connection: String,
    serial: usize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    closed: AtomicBool,
    valid: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

impl FakeChannel {
    pub(crate) fn new(connection: &str, serial: usize) -> Self {
        Self {
            connection: connection.to_string(),
            serial,
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            fail_commit: AtomicBool::new(false),
            fail_rollback: AtomicBool::new(false),
        }
    }

    pub(crate) fn serial(&self) -> usize {
        self.serial
    }

    pub(crate) fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    pub(crate) fn fail_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_rollback(&self) {
        self.fail_rollback.store(true, Ordering::SeqCst);
    }

    fn failure(&self, what: &str) -> PoolError {
        PoolError::Channel {
            connection: self.connection.clone(),
            reason: format!("{what} failed"),
        }
    }
}

impl Channel for FakeChannel {
    fn connection(&self) -> &str {
        &self.connection
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst) && !self.is_closed()
    }

    fn commit(&self) -> Result<(), PoolError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(self.failure("commit"));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self) -> Result<(), PoolError> {
        if self.fail_rollback.load(Ordering::SeqCst) {
            return Err(self.failure("rollback"));
        }
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), PoolError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeConnector {
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    fail_next: Mutex<Option<String>>,
}

impl FakeConnector {
    pub(crate) fn opened(&self) -> usize {
        self.channels.lock().len()
    }

    pub(crate) fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().clone()
    }

    pub(crate) fn fail_next_open(&self, reason: &str) {
        *self.fail_next.lock() = Some(reason.to_string());
    }
}

impl Connector for FakeConnector {
    fn open(&self, connection: &str) -> Result<Arc<dyn Channel>, PoolError> {
        if let Some(reason) = self.fail_next.lock().take() {
            return Err(PoolError::InvalidConnection {
                connection: connection.to_string(),
                reason,
            });
        }
        let mut channels = self.channels.lock();
        let channel = Arc::new(FakeChannel::new(connection, channels.len() + 1));
        channels.push(channel.clone());
        Ok(channel)
    }
}
