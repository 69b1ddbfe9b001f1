//! Background maintenance run by the scheduler.

use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::pool::ConnectionPool;
use crate::scheduler::ScheduledTask;
use crate::telemetry::UsageRegistry;

/// Id of the task rolling usage statistics forward.
pub const ROLLOVER_TASK: &str = "usage-rollover";

/// Id of the task closing idle channels.
pub const EVICTION_TASK: &str = "channel-eviction";

/// Task rolling every usage statistic forward to the current time.
pub fn rollover_task(usage: Arc<UsageRegistry>, clock: Arc<dyn Clock>) -> Arc<ScheduledTask> {
    ScheduledTask::new(ROLLOVER_TASK, move || {
        let rolled = usage.roll_forward(clock.now_millis());
        debug!(entries = rolled, "rolled usage statistics forward");
    })
}

/// Task closing channels idle for at least `max_idle_ms`.
pub fn eviction_task(
    pool: Arc<dyn ConnectionPool>,
    clock: Arc<dyn Clock>,
    max_idle_ms: i64,
) -> Arc<ScheduledTask> {
    ScheduledTask::new(EVICTION_TASK, move || {
        let evicted = pool.evict_idle(clock.now_millis(), max_idle_ms);
        if evicted > 0 {
            info!(evicted, "evicted idle channels");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pool::ChannelPool;
    use crate::scheduler::Scheduler;
    use crate::testing::FakeConnector;
    use callframe_types::{SumWindow, HOUR_MILLIS};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn rollover_moves_usage_forward() {
        let clock = Arc::new(ManualClock::new(0));
        let usage = Arc::new(UsageRegistry::new());
        usage.record("procedure:p", 0, 5, None);

        let scheduler = Scheduler::new();
        let handle = scheduler.start().unwrap();
        let task = rollover_task(usage.clone(), clock.clone());
        assert_eq!(task.id(), ROLLOVER_TASK);
        scheduler.schedule(&task, Duration::from_secs(1), Some(Duration::from_secs(60)));

        clock.set(HOUR_MILLIS);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let stats = usage.get("procedure:p").unwrap();
        assert_eq!(stats.calls.current(SumWindow::Hour), 0.0);
        assert_eq!(stats.calls.previous(SumWindow::Hour), 1.0);
        handle.shutdown().await;
    }

    #[test]
    fn eviction_closes_idle_channels() {
        let clock = Arc::new(ManualClock::new(0));
        let connector = Arc::new(FakeConnector::default());
        let pool = Arc::new(
            ChannelPool::builder()
                .clock(clock.clone())
                .connection("db", connector.clone())
                .build(),
        );
        let channel = pool.reserve("db").unwrap();
        pool.release(channel, true).unwrap();

        let task = eviction_task(pool.clone(), clock.clone(), 1_000);
        assert_eq!(task.id(), EVICTION_TASK);

        let scheduler = Scheduler::new();
        scheduler.schedule(&task, Duration::ZERO, None);
        clock.set(500);
        scheduler.run_due();
        assert_eq!(pool.status()[0].open, 1);

        scheduler.schedule(&task, Duration::ZERO, None);
        clock.set(1_000);
        scheduler.run_due();
        assert_eq!(pool.status()[0].open, 0);
        assert!(connector.channels()[0].is_closed());
    }
}
