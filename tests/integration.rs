use std::{ops::Deref, sync::Arc, time::Duration};

use futures_util::future::join_all;
use leasemq::{
    AddOptions, Config, DeadLetter, ManualClock, MemoryStore, Queue, QueueStats, SqliteStore,
};
use tempfile::TempDir;

struct TmpQueue {
    queue: Queue<SqliteStore>,
    clock: ManualClock,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpQueue {
    type Target = Queue<SqliteStore>;

    fn deref(&self) -> &Self::Target {
        &self.queue
    }
}

async fn connect(tmpdir: &TempDir) -> Arc<SqliteStore> {
    let config = Config {
        db_path: Some(tmpdir.path().join("leasemq.db").to_string_lossy().to_string()),
        ..Config::default()
    };

    Arc::new(SqliteStore::connect_with(&config).await.unwrap())
}

async fn setup(visibility: Duration) -> TmpQueue {
    let tmpdir = tempfile::tempdir().unwrap();
    let store = connect(&tmpdir).await;
    let clock = ManualClock::default();

    let queue = Queue::builder()
        .store(store)
        .name("testing")
        .visibility(visibility)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    queue.create_indexes().await.unwrap();

    TmpQueue {
        queue,
        clock,
        tmpdir,
    }
}

#[tokio::test]
async fn test_end_to_end_sqlite() {
    let queue = setup(Duration::from_secs(30)).await;

    queue.add("Hello, World!").await.unwrap();

    let message = queue.get::<String>().await.unwrap().unwrap();
    assert_eq!(message.payload, "Hello, World!");
    assert_eq!(message.tries, 1);
    assert!(!message.id.is_empty());
    assert!(!message.ack.is_empty());

    queue.ack(&message.ack).await.unwrap();
    assert!(queue.get::<String>().await.unwrap().is_none());

    assert_eq!(queue.total().await.unwrap(), 1);
    assert_eq!(queue.done().await.unwrap(), 1);
    assert_eq!(queue.size().await.unwrap(), 0);

    // Acknowledging twice is refused.
    assert!(queue.ack(&message.ack).await.unwrap_err().is_unidentified_ack());
}

#[tokio::test]
async fn test_lease_expiry_reclaims_sqlite() {
    let queue = setup(Duration::from_secs(5)).await;
    queue.add(&serde_json::json!({ "job": 42 })).await.unwrap();

    let first = queue.get::<serde_json::Value>().await.unwrap().unwrap();
    assert!(queue.get::<serde_json::Value>().await.unwrap().is_none());

    // Still held one millisecond before the deadline.
    queue.clock.advance(Duration::from_millis(4999));
    assert!(queue.get::<serde_json::Value>().await.unwrap().is_none());

    queue.clock.advance(Duration::from_millis(1));

    let second = queue.get::<serde_json::Value>().await.unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.tries, 2);
    assert_eq!(second.payload["job"], 42);

    assert!(queue.ping(&first.ack).await.unwrap_err().is_unidentified_ack());
    queue.ping(&second.ack).await.unwrap();
    queue.ack(&second.ack).await.unwrap();
}

#[tokio::test]
async fn test_batch_add_sqlite() {
    let queue = setup(Duration::from_secs(30)).await;

    let ids = queue.add_many(&[1u32, 2, 3]).await.unwrap();
    assert_eq!(ids.len(), 3);

    let mut seen = Vec::new();
    while let Some(message) = queue.get::<u32>().await.unwrap() {
        seen.push((message.id, message.payload));
    }

    assert_eq!(
        seen,
        ids.into_iter().zip([1, 2, 3]).collect::<Vec<_>>()
    );
    assert_eq!(queue.in_flight().await.unwrap(), 3);
}

#[tokio::test]
async fn test_queues_share_one_database() {
    let tmpdir = tempfile::tempdir().unwrap();
    let store = connect(&tmpdir).await;
    let clock = ManualClock::default();

    let dead = Queue::builder()
        .store(store.clone())
        .name("dead")
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let queue = Queue::builder()
        .store(store.clone())
        .name("source")
        .visibility(Duration::from_secs(5))
        .dead_queue(dead)
        .max_retries(2)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    queue.create_indexes().await.unwrap();

    queue.add("poison").await.unwrap();
    for _ in 0..2 {
        queue.get::<String>().await.unwrap().unwrap();
        clock.advance(Duration::from_secs(6));
    }

    assert!(queue.get::<String>().await.unwrap().is_none());

    let dead = queue.dead_queue().unwrap();
    assert_eq!(dead.size().await.unwrap(), 1);
    assert_eq!(
        queue.stats().await.unwrap(),
        QueueStats {
            total: 1,
            size: 0,
            in_flight: 0,
            done: 1,
        }
    );

    let letter = dead.get::<DeadLetter<String>>().await.unwrap().unwrap();
    assert_eq!(letter.payload.payload, "poison");
    assert_eq!(letter.payload.tries, 3);

    assert_eq!(queue.clean().await.unwrap(), 1);
    assert_eq!(dead.total().await.unwrap(), 1);
}

#[tokio::test]
async fn test_delay_sqlite() {
    let tmpdir = tempfile::tempdir().unwrap();
    let store = connect(&tmpdir).await;
    let clock = ManualClock::default();

    let queue = Queue::builder()
        .store(store)
        .name("delayed")
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();

    queue
        .add_with("soon", AddOptions::builder().delay(Duration::from_secs(5)).build())
        .await
        .unwrap();
    assert!(queue.get::<String>().await.unwrap().is_none());

    clock.advance(Duration::from_secs(5));
    assert_eq!(queue.get::<String>().await.unwrap().unwrap().payload, "soon");
}

async fn race<S: leasemq::Store>(queue: Queue<S>, consumers: usize) -> usize {
    let handles = (0..consumers).map(|_| {
        let queue = queue.clone();
        tokio::spawn(async move { queue.get::<String>().await.unwrap() })
    });

    join_all(handles)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .filter(Option::is_some)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_gets_claim_once_memory() {
    let queue = Queue::builder()
        .store(Arc::new(MemoryStore::new()))
        .name("contended")
        .build()
        .unwrap();
    queue.create_indexes().await.unwrap();
    queue.add("only one").await.unwrap();

    assert_eq!(race(queue.clone(), 16).await, 1);
    assert_eq!(queue.in_flight().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_gets_claim_once_sqlite() {
    let queue = setup(Duration::from_secs(30)).await;
    queue.add("only one").await.unwrap();

    assert_eq!(race(queue.queue.clone(), 16).await, 1);
    assert_eq!(queue.in_flight().await.unwrap(), 1);
}
