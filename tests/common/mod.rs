#![allow(dead_code)]

use std::{ops::Deref, time::Duration};

use sluice::{broker::Broker, config::Config, db::queue::QueueStatistics};
use tempfile::TempDir;

pub struct TmpBroker {
    broker: Broker,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpBroker {
    type Target = Broker;

    fn deref(&self) -> &Self::Target {
        &self.broker
    }
}

pub async fn setup() -> TmpBroker {
    let path = tempfile::tempdir().unwrap();

    TmpBroker {
        broker: Broker::connect_with(Config {
            db_path: Some(path.path().join("sluice.db").to_string_lossy().to_string()),
            lock_duration_ms: Some(1_000),
            poll_interval_ms: Some(20),
            stalled_interval_ms: Some(50),
            ..Default::default()
        })
        .await
        .unwrap(),
        tmpdir: path,
    }
}

/// Polls the counts of `queue` until `done` holds, panicking after five seconds.
pub async fn wait_for(
    broker: &Broker,
    queue: &str,
    done: impl Fn(&QueueStatistics) -> bool,
) -> QueueStatistics {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    loop {
        let counts = broker.counts(queue).await.unwrap();
        if done(&counts) {
            return counts;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting on {queue}: {counts:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Counts `waiting` jobs of `queue`, delayed ones included.
pub fn pending(counts: &QueueStatistics) -> i64 {
    counts.waiting + counts.delayed + counts.active
}

/// Makes every insert into `queue` fail.
pub async fn reject_inserts(broker: &Broker, queue: &str) {
    sqlx::query(&format!(
        "
        CREATE TRIGGER reject_{queue} BEFORE INSERT ON jobs
        WHEN NEW.queue = (SELECT id FROM queues WHERE name = '{queue}')
        BEGIN
            SELECT RAISE(ABORT, 'insert rejected');
        END
        "
    ))
    .execute(broker.db())
    .await
    .unwrap();
}
