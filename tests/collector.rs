mod common;

use std::time::Duration;

use common::{pending, setup, wait_for};
use sluice::{
    collector::{collector, COLLECTED_EVENTS},
    message::{JobOptions, JobState},
    payloads::{collect_token_ids, BatchTokenPayload, TokenPayload},
    queue::DeliveryPolicy,
    worker::WorkerEvent,
};

fn token_ids(payload: &serde_json::Value) -> Vec<String> {
    let batch: BatchTokenPayload = serde_json::from_value(payload.clone()).unwrap();
    let mut ids = batch.token_ids;
    ids.sort();
    ids
}

#[tokio::test]
async fn test_flushes_when_buffer_is_full() {
    let broker = setup().await;
    let input = broker.queue::<TokenPayload>("Collector").await.unwrap();
    let output = broker.queue::<BatchTokenPayload>("Batch").await.unwrap();

    let handle = collector()
        .input(input.clone())
        .output(output)
        .aggregate(collect_token_ids)
        .buffer_size(3)
        .flush_interval(Duration::from_secs(60))
        .spawn();

    for token in ["1-a", "1-b", "1-c"] {
        input
            .add("TokenUpdated", &TokenPayload::new(token), JobOptions::default())
            .await
            .unwrap();
    }

    wait_for(&broker, "Batch", |counts| counts.waiting == 1).await;
    wait_for(&broker, "Collector", |counts| pending(counts) == 0).await;

    let batch = broker.jobs("Batch", JobState::Waiting, 10).await.unwrap();
    assert_eq!(batch[0].name, COLLECTED_EVENTS);
    assert_eq!(token_ids(&batch[0].payload), vec!["1-a", "1-b", "1-c"]);

    handle.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_flushes_partial_batch_after_interval() {
    let broker = setup().await;
    let input = broker.queue::<TokenPayload>("Collector").await.unwrap();
    let output = broker.queue::<BatchTokenPayload>("Batch").await.unwrap();

    let handle = collector()
        .input(input.clone())
        .output(output)
        .aggregate(collect_token_ids)
        .buffer_size(100)
        .flush_interval(Duration::from_millis(300))
        .spawn();

    for token in ["1-a", "1-b"] {
        input
            .add("TokenUpdated", &TokenPayload::new(token), JobOptions::default())
            .await
            .unwrap();
    }

    // Buffered jobs stay active until their batch is flushed.
    let counts = wait_for(&broker, "Collector", |counts| counts.active == 2).await;
    assert_eq!(counts.waiting, 0);
    assert_eq!(broker.counts("Batch").await.unwrap().waiting, 0);

    wait_for(&broker, "Batch", |counts| counts.waiting == 1).await;
    wait_for(&broker, "Collector", |counts| pending(counts) == 0).await;

    let batch = broker.jobs("Batch", JobState::Waiting, 10).await.unwrap();
    assert_eq!(token_ids(&batch[0].payload), vec!["1-a", "1-b"]);

    handle.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_timer_after_size_flush_does_not_emit_twice() {
    let broker = setup().await;
    let input = broker.queue::<TokenPayload>("Collector").await.unwrap();
    let output = broker.queue::<BatchTokenPayload>("Batch").await.unwrap();

    let handle = collector()
        .input(input.clone())
        .output(output)
        .aggregate(collect_token_ids)
        .buffer_size(2)
        .flush_interval(Duration::from_millis(200))
        .spawn();

    for token in ["1-a", "1-b"] {
        input
            .add("TokenUpdated", &TokenPayload::new(token), JobOptions::default())
            .await
            .unwrap();
    }

    wait_for(&broker, "Batch", |counts| counts.waiting == 1).await;

    // Outlive the flush timer of the batch that was already emitted.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let batches = broker.jobs("Batch", JobState::Waiting, 10).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(token_ids(&batches[0].payload), vec!["1-a", "1-b"]);

    handle.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_aggregation_failure_rejects_whole_batch() {
    let broker = setup().await;
    let input = broker
        .queue::<TokenPayload>("Collector")
        .await
        .unwrap()
        .with_policy(DeliveryPolicy {
            max_attempts: 1,
            ..Default::default()
        });
    let output = broker.queue::<BatchTokenPayload>("Batch").await.unwrap();

    let handle = collector()
        .input(input.clone())
        .output(output)
        .aggregate(|_: Vec<TokenPayload>| -> eyre::Result<BatchTokenPayload> {
            eyre::bail!("aggregate exploded")
        })
        .buffer_size(2)
        .flush_interval(Duration::from_secs(60))
        .spawn();

    for token in ["1-a", "1-b"] {
        input
            .add("TokenUpdated", &TokenPayload::new(token), JobOptions::default())
            .await
            .unwrap();
    }

    let counts = wait_for(&broker, "Collector", |counts| counts.failed == 2).await;
    assert_eq!(pending(&counts), 0);
    assert_eq!(pending(&broker.counts("Batch").await.unwrap()), 0);

    let failed = broker.jobs("Collector", JobState::Failed, 10).await.unwrap();
    assert!(failed.iter().all(|job| job
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("aggregate exploded"))));

    handle.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_size_flush_opens_fresh_batch() {
    let broker = setup().await;
    let input = broker.queue::<TokenPayload>("Collector").await.unwrap();
    let output = broker.queue::<BatchTokenPayload>("Batch").await.unwrap();

    let tokens = ["1-a", "1-b", "1-c", "1-d", "1-e"];
    for token in tokens {
        input
            .add("TokenUpdated", &TokenPayload::new(token), JobOptions::default())
            .await
            .unwrap();
    }

    let handle = collector()
        .input(input.clone())
        .output(output)
        .aggregate(collect_token_ids)
        .buffer_size(2)
        .flush_interval(Duration::from_millis(300))
        .spawn();

    // Two full batches, then the leftover one on the timer.
    wait_for(&broker, "Batch", |counts| counts.waiting == 3).await;
    wait_for(&broker, "Collector", |counts| pending(counts) == 0).await;

    let batches = broker.jobs("Batch", JobState::Waiting, 10).await.unwrap();
    let mut sizes: Vec<usize> = batches
        .iter()
        .map(|batch| token_ids(&batch.payload).len())
        .collect();
    sizes.sort();
    assert_eq!(sizes, vec![1, 2, 2]);

    let mut all: Vec<String> = batches
        .iter()
        .flat_map(|batch| token_ids(&batch.payload))
        .collect();
    all.sort();
    assert_eq!(all, tokens);

    handle.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_buffered_jobs_outlive_lock_duration() {
    let broker = setup().await;
    let input = broker.queue::<TokenPayload>("Collector").await.unwrap();
    let output = broker.queue::<BatchTokenPayload>("Batch").await.unwrap();

    // Flushing takes more than twice the one second lock.
    let handle = collector()
        .input(input.clone())
        .output(output)
        .aggregate(collect_token_ids)
        .buffer_size(10)
        .flush_interval(Duration::from_millis(2_500))
        .spawn();
    let mut events = handle.subscribe();

    for token in ["1-a", "1-b"] {
        input
            .add("TokenUpdated", &TokenPayload::new(token), JobOptions::default())
            .await
            .unwrap();
    }

    wait_for(&broker, "Batch", |counts| counts.waiting == 1).await;
    wait_for(&broker, "Collector", |counts| pending(counts) == 0).await;

    let batches = broker.jobs("Batch", JobState::Waiting, 10).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(token_ids(&batches[0].payload), vec!["1-a", "1-b"]);

    let mut stalls = 0;
    let mut completed = 0;
    while completed < 2 {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            WorkerEvent::Stalled { .. } => stalls += 1,
            WorkerEvent::Completed { .. } => completed += 1,
            _ => {}
        }
    }
    assert_eq!(stalls, 0);

    handle.shutdown(Duration::from_secs(1)).await;
}
