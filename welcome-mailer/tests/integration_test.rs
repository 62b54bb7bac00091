//! Integration tests for the consumption loop, run against the in-memory source.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Instant};
use welcome_mailer::{
    Checkpoint, Consumer, ConsumerConfig, DeadLetter, DeadLetterError, DeadLetterSink, FailureStage,
    JournalDedupTable, MailTransport, MemoryOffsetStore, MemorySource, Notifier, NotifyError,
    Offset, OffsetStore, OffsetStoreError, Outcome, Partition, Record, WelcomeError, WelcomeNotice,
    DEFAULT_RETENTION,
};

const MAX_ATTEMPTS: u32 = 3;

#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<(), NotifyError>>>,
    attempts: AtomicUsize,
    sent: Mutex<Vec<WelcomeNotice>>,
}

impl ScriptedTransport {
    fn with_script(script: Vec<Result<(), NotifyError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    fn sent(&self) -> Vec<WelcomeNotice> {
        self.sent.lock().unwrap().clone()
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    async fn deliver(&self, notice: &WelcomeNotice) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if next.is_ok() {
            self.sent.lock().unwrap().push(notice.clone());
        }
        next
    }
}

/// Transport that holds every delivery until the test opens the gate.
struct GatedTransport {
    gate: Semaphore,
    entered: AtomicUsize,
    sent: Mutex<Vec<WelcomeNotice>>,
}

impl GatedTransport {
    fn closed() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            entered: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    fn sent(&self) -> Vec<WelcomeNotice> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for GatedTransport {
    async fn deliver(&self, notice: &WelcomeNotice) -> Result<(), NotifyError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await.unwrap().forget();
        self.sent.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

#[derive(Default)]
struct CollectingSink {
    letters: Mutex<Vec<DeadLetter>>,
    failures: AtomicU32,
}

impl CollectingSink {
    fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for CollectingSink {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeadLetterError::Io(std::io::Error::other("disk full")));
        }
        self.letters.lock().unwrap().push(letter.clone());
        Ok(())
    }
}

/// Memory store whose commits can be made to fail, and whose startup load can be broken.
#[derive(Default)]
struct FlakyOffsetStore {
    inner: MemoryOffsetStore,
    failing_commits: AtomicU32,
    commit_calls: AtomicUsize,
    unavailable: bool,
}

#[async_trait]
impl OffsetStore for FlakyOffsetStore {
    async fn load(&self, partition: Partition) -> Result<Option<Offset>, OffsetStoreError> {
        self.inner.load(partition).await
    }

    async fn load_all(&self) -> Result<Checkpoint, OffsetStoreError> {
        if self.unavailable {
            return Err(OffsetStoreError::Unavailable("volume not mounted".to_string()));
        }
        self.inner.load_all().await
    }

    async fn commit(&self, partition: Partition, offset: Offset) -> Result<(), OffsetStoreError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(OffsetStoreError::Unavailable("fsync failed".to_string()));
        }
        self.inner.commit(partition, offset).await
    }
}

fn config() -> ConsumerConfig {
    ConsumerConfig::new()
        .with_max_attempts(MAX_ATTEMPTS)
        .with_initial_backoff(Duration::from_millis(1))
        .with_max_backoff(Duration::from_millis(4))
        .with_poll_timeout(Duration::from_millis(20))
}

fn consumer(
    source: Arc<MemorySource>,
    offsets: Arc<dyn OffsetStore>,
    transport: Arc<dyn MailTransport>,
    dedup: Arc<JournalDedupTable>,
    sink: Arc<CollectingSink>,
) -> Arc<Consumer> {
    consumer_with_config(source, offsets, transport, dedup, sink, config())
}

fn consumer_with_config(
    source: Arc<MemorySource>,
    offsets: Arc<dyn OffsetStore>,
    transport: Arc<dyn MailTransport>,
    dedup: Arc<JournalDedupTable>,
    sink: Arc<CollectingSink>,
    config: ConsumerConfig,
) -> Arc<Consumer> {
    Arc::new(Consumer::new(
        source,
        offsets,
        Notifier::new(transport, dedup),
        sink,
        config,
    ))
}

fn spawn_run(consumer: &Arc<Consumer>) -> tokio::task::JoinHandle<welcome_mailer::Result<()>> {
    let consumer = Arc::clone(consumer);
    tokio::spawn(async move { consumer.run().await })
}

fn in_memory_dedup() -> Arc<JournalDedupTable> {
    Arc::new(JournalDedupTable::in_memory(DEFAULT_RETENTION))
}

fn signup(firstname: &str, email: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "firstname": firstname, "email": email })).unwrap()
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

async fn stop(consumer: &Consumer, running: tokio::task::JoinHandle<welcome_mailer::Result<()>>) {
    consumer.shutdown_handle().shutdown();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("consumer did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_signup_gets_welcome_notice() {
    let transport = ScriptedTransport::with_script(vec![]);
    let offsets = Arc::new(MemoryOffsetStore::new());
    let sink = Arc::new(CollectingSink::default());
    let consumer = consumer(
        Arc::new(MemorySource::new("signups")),
        offsets.clone(),
        transport.clone(),
        in_memory_dedup(),
        sink.clone(),
    );

    let record = Record::new("signups", 0, 0, signup("Ada", "ada@x.com"));
    assert_eq!(consumer.process(&record).await, Outcome::Delivered);

    assert_eq!(
        transport.sent(),
        vec![WelcomeNotice {
            to: "ada@x.com".to_string(),
            subject: "Welcome to NewCompany".to_string(),
            body: "Hello Ada, we are so glad you joined us here at NewCompany".to_string(),
        }]
    );
    assert_eq!(offsets.load(0).await.unwrap(), Some(0));
    assert!(sink.letters().is_empty());
}

#[tokio::test]
async fn test_missing_fields_go_to_dead_letter_without_notify() {
    let transport = ScriptedTransport::with_script(vec![]);
    let offsets = Arc::new(MemoryOffsetStore::new());
    let sink = Arc::new(CollectingSink::default());
    let consumer = consumer(
        Arc::new(MemorySource::new("signups")),
        offsets.clone(),
        transport.clone(),
        in_memory_dedup(),
        sink.clone(),
    );

    for (offset, payload) in [b"{}".to_vec(), b"not valid json".to_vec()].into_iter().enumerate() {
        let record = Record::new("signups", 0, offset as Offset, payload);
        assert_eq!(
            consumer.process(&record).await,
            Outcome::DeadLettered(FailureStage::Decode)
        );
    }

    assert_eq!(transport.attempts(), 0);
    let letters = sink.letters();
    assert_eq!(letters.len(), 2);
    assert_eq!(letters[0].payload, "{}");
    assert_eq!(letters[0].reason, "Missing required field 'firstname'");
    assert_eq!(offsets.load(0).await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_transient_failures_below_budget_are_retried() {
    let transport = ScriptedTransport::with_script(vec![
        Err(NotifyError::Transient("smtp busy".to_string())),
        Err(NotifyError::Transient("smtp busy".to_string())),
    ]);
    let offsets = Arc::new(MemoryOffsetStore::new());
    let sink = Arc::new(CollectingSink::default());
    let consumer = consumer(
        Arc::new(MemorySource::new("signups")),
        offsets.clone(),
        transport.clone(),
        in_memory_dedup(),
        sink.clone(),
    );

    let record = Record::new("signups", 1, 4, signup("Grace", "grace@navy.mil"));
    assert_eq!(consumer.process(&record).await, Outcome::Delivered);
    assert_eq!(transport.attempts(), 3);
    assert_eq!(transport.sent().len(), 1);
    assert_eq!(offsets.load(1).await.unwrap(), Some(4));
    assert!(sink.letters().is_empty());
}

#[tokio::test]
async fn test_transient_failures_exhausting_budget_dead_letter_and_commit() {
    let transport = ScriptedTransport::with_script(
        (0..MAX_ATTEMPTS)
            .map(|_| Err(NotifyError::Transient("smtp down".to_string())))
            .collect(),
    );
    let offsets = Arc::new(MemoryOffsetStore::new());
    let sink = Arc::new(CollectingSink::default());
    let consumer = consumer(
        Arc::new(MemorySource::new("signups")),
        offsets.clone(),
        transport.clone(),
        in_memory_dedup(),
        sink.clone(),
    );

    let record = Record::new("signups", 0, 8, signup("Alan", "alan@bletchley.uk"));
    assert_eq!(
        consumer.process(&record).await,
        Outcome::DeadLettered(FailureStage::RetriesExhausted)
    );
    assert_eq!(transport.attempts(), MAX_ATTEMPTS as usize);
    assert!(transport.sent().is_empty());
    assert_eq!(offsets.load(0).await.unwrap(), Some(8));

    let letters = sink.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].stage, FailureStage::RetriesExhausted);
    assert_eq!(letters[0].offset, 8);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let transport = ScriptedTransport::with_script(vec![Err(NotifyError::Permanent(
        "mailbox does not exist".to_string(),
    ))]);
    let sink = Arc::new(CollectingSink::default());
    let consumer = consumer(
        Arc::new(MemorySource::new("signups")),
        Arc::new(MemoryOffsetStore::new()),
        transport.clone(),
        in_memory_dedup(),
        sink.clone(),
    );

    let record = Record::new("signups", 0, 0, signup("Ada", "ada@x.com"));
    assert_eq!(
        consumer.process(&record).await,
        Outcome::DeadLettered(FailureStage::Rejected)
    );
    assert_eq!(transport.attempts(), 1);

    // A malformed recipient never reaches the transport at all.
    let record = Record::new("signups", 0, 1, signup("Ada", "not-an-address"));
    assert_eq!(
        consumer.process(&record).await,
        Outcome::DeadLettered(FailureStage::Rejected)
    );
    assert_eq!(transport.attempts(), 1);
    assert_eq!(sink.letters().len(), 2);
}

#[tokio::test]
async fn test_replay_after_crash_does_not_resend() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("delivered.jsonl");
    let transport = ScriptedTransport::with_script(vec![]);

    // First run: the notice goes out but the offset never gets committed.
    {
        let source = Arc::new(MemorySource::new("signups"));
        source.append(0, signup("Ada", "ada@x.com")).await;
        let offsets = Arc::new(FlakyOffsetStore {
            failing_commits: AtomicU32::new(u32::MAX),
            ..FlakyOffsetStore::default()
        });
        let dedup = Arc::new(JournalDedupTable::open(&journal, DEFAULT_RETENTION).await.unwrap());
        let consumer = consumer(
            source,
            offsets.clone(),
            transport.clone(),
            dedup,
            Arc::new(CollectingSink::default()),
        );

        let running = spawn_run(&consumer);
        // Two full passes over the record: first delivery and one redelivery.
        wait_until("a redelivered commit attempt", || {
            let calls = offsets.commit_calls.load(Ordering::SeqCst);
            async move { calls >= 2 * MAX_ATTEMPTS as usize }
        })
        .await;
        stop(&consumer, running).await;

        assert_eq!(offsets.load(0).await.unwrap(), None);
    }
    assert_eq!(transport.sent().len(), 1);

    // Restart: same log, a healthy offset store, the dedup journal reloaded from disk.
    let source = Arc::new(MemorySource::new("signups"));
    source.append(0, signup("Ada", "ada@x.com")).await;
    let offsets = Arc::new(MemoryOffsetStore::new());
    let dedup = Arc::new(JournalDedupTable::open(&journal, DEFAULT_RETENTION).await.unwrap());
    let consumer = consumer(
        source,
        offsets.clone(),
        transport.clone(),
        dedup,
        Arc::new(CollectingSink::default()),
    );

    let running = spawn_run(&consumer);
    wait_until("the replayed record to commit", || {
        let offsets = Arc::clone(&offsets);
        async move { offsets.load(0).await.unwrap() == Some(0) }
    })
    .await;
    stop(&consumer, running).await;

    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn test_offset_store_unavailable_at_startup_is_fatal() {
    let consumer = consumer(
        Arc::new(MemorySource::new("signups")),
        Arc::new(FlakyOffsetStore {
            unavailable: true,
            ..FlakyOffsetStore::default()
        }),
        ScriptedTransport::with_script(vec![]),
        in_memory_dedup(),
        Arc::new(CollectingSink::default()),
    );

    let result = tokio::time::timeout(Duration::from_secs(5), consumer.run())
        .await
        .expect("startup failure should be immediate");
    assert!(matches!(result, Err(WelcomeError::OffsetStore(_))));
}

#[tokio::test]
async fn test_resumes_after_checkpoint_across_partitions() {
    let source = Arc::new(MemorySource::new("signups").with_max_batch(2));
    for i in 0..3 {
        source.append(0, signup(&format!("p0-{i}"), "p0@x.com")).await;
        source.append(1, signup(&format!("p1-{i}"), "p1@x.com")).await;
    }
    source.append(2, b"{}".to_vec()).await;

    let mut checkpoint = Checkpoint::new();
    checkpoint.record(0, 1);
    let offsets = Arc::new(MemoryOffsetStore::with_checkpoint(checkpoint));
    let transport = ScriptedTransport::with_script(vec![]);
    let sink = Arc::new(CollectingSink::default());
    let consumer = consumer(
        source,
        offsets.clone(),
        transport.clone(),
        in_memory_dedup(),
        sink.clone(),
    );

    let running = spawn_run(&consumer);
    wait_until("all partitions to commit", || {
        let offsets = Arc::clone(&offsets);
        async move {
            let checkpoint = offsets.load_all().await.unwrap();
            checkpoint.get(0) == Some(2) && checkpoint.get(1) == Some(2) && checkpoint.get(2) == Some(0)
        }
    })
    .await;
    stop(&consumer, running).await;

    let mut bodies: Vec<_> = transport.sent().into_iter().map(|n| n.body).collect();
    bodies.sort();
    assert_eq!(
        bodies,
        vec![
            "Hello p0-2, we are so glad you joined us here at NewCompany",
            "Hello p1-0, we are so glad you joined us here at NewCompany",
            "Hello p1-1, we are so glad you joined us here at NewCompany",
            "Hello p1-2, we are so glad you joined us here at NewCompany",
        ]
    );
    assert_eq!(sink.letters().len(), 1);
    assert_eq!(sink.letters()[0].partition, 2);
}

#[tokio::test]
async fn test_poll_failures_are_retried() {
    let source = Arc::new(MemorySource::new("signups"));
    source.append(0, signup("Ada", "ada@x.com")).await;
    source.fail_next_polls(3).await;
    let offsets = Arc::new(MemoryOffsetStore::new());
    let transport = ScriptedTransport::with_script(vec![]);
    let consumer = consumer(
        source,
        offsets.clone(),
        transport.clone(),
        in_memory_dedup(),
        Arc::new(CollectingSink::default()),
    );

    let running = spawn_run(&consumer);
    wait_until("the record to commit", || {
        let offsets = Arc::clone(&offsets);
        async move { offsets.load(0).await.unwrap() == Some(0) }
    })
    .await;
    stop(&consumer, running).await;

    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn test_dead_letter_outage_defers_and_redelivers() {
    let source = Arc::new(MemorySource::new("signups"));
    source.append(0, b"{}".to_vec()).await;
    source.append(0, signup("Ada", "ada@x.com")).await;
    let offsets = Arc::new(MemoryOffsetStore::new());
    let transport = ScriptedTransport::with_script(vec![]);
    // Enough failures to exhaust one full pass of retries.
    let sink = Arc::new(CollectingSink {
        failures: AtomicU32::new(MAX_ATTEMPTS),
        ..CollectingSink::default()
    });
    let consumer = consumer(
        source,
        offsets.clone(),
        transport.clone(),
        in_memory_dedup(),
        sink.clone(),
    );

    let running = spawn_run(&consumer);
    wait_until("both records to commit", || {
        let offsets = Arc::clone(&offsets);
        async move { offsets.load(0).await.unwrap() == Some(1) }
    })
    .await;
    stop(&consumer, running).await;

    let letters = sink.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].offset, 0);
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn test_shutdown_stops_idle_consumer() {
    let consumer = consumer(
        Arc::new(MemorySource::new("signups")),
        Arc::new(MemoryOffsetStore::new()),
        ScriptedTransport::with_script(vec![]),
        in_memory_dedup(),
        Arc::new(CollectingSink::default()),
    );

    let running = spawn_run(&consumer);
    sleep(Duration::from_millis(50)).await;
    stop(&consumer, running).await;
}

#[tokio::test]
async fn test_shutdown_during_backoff_defers_record() {
    let source = Arc::new(MemorySource::new("signups"));
    source.append(0, signup("Ada", "ada@x.com")).await;
    source.append(0, signup("Grace", "grace@navy.mil")).await;
    let offsets = Arc::new(MemoryOffsetStore::new());
    let transport = ScriptedTransport::with_script(vec![Err(NotifyError::Transient(
        "smtp busy".to_string(),
    ))]);
    let sink = Arc::new(CollectingSink::default());
    let consumer = consumer_with_config(
        source,
        offsets.clone(),
        transport.clone(),
        in_memory_dedup(),
        sink.clone(),
        config()
            .with_initial_backoff(Duration::from_secs(60))
            .with_max_backoff(Duration::from_secs(60)),
    );

    let running = spawn_run(&consumer);
    wait_until("the first delivery attempt", || {
        let attempts = transport.attempts();
        async move { attempts == 1 }
    })
    .await;
    stop(&consumer, running).await;

    assert_eq!(transport.attempts(), 1);
    assert!(transport.sent().is_empty());
    assert_eq!(offsets.load(0).await.unwrap(), None);
    assert!(sink.letters().is_empty());
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_record_finish() {
    let source = Arc::new(MemorySource::new("signups"));
    source.append(0, signup("Ada", "ada@x.com")).await;
    source.append(0, signup("Grace", "grace@navy.mil")).await;
    let offsets = Arc::new(MemoryOffsetStore::new());
    let transport = GatedTransport::closed();
    let sink = Arc::new(CollectingSink::default());
    let consumer = consumer(
        source,
        offsets.clone(),
        transport.clone(),
        in_memory_dedup(),
        sink.clone(),
    );

    let running = spawn_run(&consumer);
    wait_until("the first delivery to start", || {
        let entered = transport.entered();
        async move { entered == 1 }
    })
    .await;

    consumer.shutdown_handle().shutdown();
    transport.open();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("consumer did not stop")
        .unwrap()
        .unwrap();

    // The record being mailed completes and commits; the next one never starts.
    assert_eq!(transport.entered(), 1);
    assert_eq!(transport.sent().len(), 1);
    assert_eq!(offsets.load(0).await.unwrap(), Some(0));
    assert!(sink.letters().is_empty());
}

#[tokio::test]
async fn test_shared_idempotency_key_across_partitions_sends_once() {
    let payload = serde_json::to_vec(&serde_json::json!({
        "firstname": "Ada",
        "email": "ada@x.com",
        "idempotency_key": "signup-7f3a",
    }))
    .unwrap();
    let source = Arc::new(MemorySource::new("signups"));
    source.append(0, payload.clone()).await;
    source.append(1, payload).await;
    let offsets = Arc::new(MemoryOffsetStore::new());
    let transport = GatedTransport::closed();
    let sink = Arc::new(CollectingSink::default());
    // Enough budget for the second partition to wait out the first one's delivery.
    let consumer = consumer_with_config(
        source,
        offsets.clone(),
        transport.clone(),
        in_memory_dedup(),
        sink.clone(),
        config().with_max_attempts(200),
    );

    let running = spawn_run(&consumer);
    wait_until("the first delivery to start", || {
        let entered = transport.entered();
        async move { entered == 1 }
    })
    .await;
    // Let the other partition bounce off the in-flight claim a few times.
    sleep(Duration::from_millis(30)).await;
    transport.open();

    wait_until("both partitions to commit", || {
        let offsets = Arc::clone(&offsets);
        async move {
            let checkpoint = offsets.load_all().await.unwrap();
            checkpoint.get(0) == Some(0) && checkpoint.get(1) == Some(0)
        }
    })
    .await;
    stop(&consumer, running).await;

    assert_eq!(transport.entered(), 1);
    assert_eq!(transport.sent().len(), 1);
    assert!(sink.letters().is_empty());
}
