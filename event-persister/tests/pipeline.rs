use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use event_persister::experiments::ExperimentResolver;
use event_persister::linker::Linker;
use event_persister::persister::Persister;
use event_persister::pump::RateLimitedPump;
use event_persister::retry::scanner::{RetryScanner, ScanReport};
use event_persister::retry::RetryStore;
use event_persister::test_utils::{
    evaluation_envelope, evaluation_event, experiment, goal_envelope, goal_event,
    random_string, user_evaluation, AckLog, MemoryEvaluationSource, MemorySink, Settlement,
    StaticExperimentSource, VecMessageSource,
};
use event_persister::windower::{Batch, BatchProcessor, BatchWindower};
use event_persister::writer::Writer;
use persister_common::event::{DEFAULT_TAG, DEFAULT_VARIATION_ID};
use persister_common::experiment::ExperimentStatus;
use persister_common::health::HealthRegistry;
use persister_common::lock::RedisLock;
use persister_common::redis::MockRedisClient;
use persister_common::retry::RetryPolicy;
use persister_common::time::FixedTime;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const NOW: i64 = 1_700_000_000;
const DAY: i64 = 24 * 60 * 60;
const ENV: &str = "env";

struct Pipeline {
    log: AckLog,
    experiments: Arc<StaticExperimentSource>,
    evaluations: Arc<MemoryEvaluationSource>,
    evaluation_sink: Arc<MemorySink>,
    goal_sink: Arc<MemorySink>,
    redis: MockRedisClient,
    time: FixedTime,
    retries: Arc<RetryStore>,
    persister: Arc<Persister>,
}

impl Pipeline {
    fn new(batch_size: usize) -> Self {
        let time = FixedTime::new(NOW);
        let redis = MockRedisClient::new();
        let experiments = Arc::new(StaticExperimentSource::new());
        let evaluations = Arc::new(MemoryEvaluationSource::new());
        let evaluation_sink = Arc::new(MemorySink::new());
        let goal_sink = Arc::new(MemorySink::new());

        let resolver = Arc::new(ExperimentResolver::new(
            experiments.clone(),
            Duration::from_millis(1),
            Arc::new(time.clone()),
        ));
        let retries = Arc::new(RetryStore::new(
            Arc::new(redis.clone()),
            RetryPolicy::new(2, Duration::from_secs(60)),
            Duration::from_secs(DAY as u64),
            Arc::new(time.clone()),
        ));
        let persister = Arc::new(Persister::new(
            resolver,
            Linker::new(evaluations.clone()),
            Writer::new("evaluations", evaluation_sink.clone(), batch_size),
            Writer::new("goals", goal_sink.clone(), batch_size),
            retries.clone(),
        ));

        Self {
            log: AckLog::default(),
            experiments,
            evaluations,
            evaluation_sink,
            goal_sink,
            redis,
            time,
            retries,
            persister,
        }
    }

    /// A batch of messages whose transport id is also their event id.
    fn batch(&self, messages: Vec<(&str, Vec<u8>)>) -> Batch {
        messages
            .into_iter()
            .map(|(id, data)| (id.to_owned(), self.log.message(id, Some(id), data)))
            .collect()
    }

    async fn process(&self, messages: Vec<(&str, Vec<u8>)>) {
        self.persister.process(self.batch(messages)).await;
    }

    fn scanner(&self) -> RetryScanner {
        let registry = HealthRegistry::new("liveness");
        RetryScanner::new(
            self.retries.clone(),
            Arc::new(RedisLock::new(
                Arc::new(self.redis.clone()),
                Duration::from_secs(48),
            )),
            self.persister.clone(),
            Duration::from_secs(1),
            10,
            registry.register("retry-scanner".to_owned(), ::time::Duration::seconds(30)),
        )
    }

    async fn scan(&self) -> ScanReport {
        self.scanner()
            .scan(&CancellationToken::new())
            .await
            .expect("scan failed")
    }
}

#[tokio::test]
async fn test_goal_is_attributed_to_the_evaluated_variation() {
    let p = Pipeline::new(10);
    p.experiments
        .insert(ENV, experiment("e1", "f1", 1, &["g1"], 1000, 2000));
    p.evaluations
        .insert(ENV, "u1", user_evaluation("f1", 1, "vB", 1200));

    p.process(vec![("m1", goal_envelope(ENV, &goal_event("g1", "u1", 1500)))])
        .await;

    assert_eq!(p.log.settlements_of("m1"), vec![Settlement::Ack]);
    let rows = p.goal_sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "m1");
    assert_eq!(rows[0].variation_id, "vB");
    assert_eq!(rows[0].goal_id.as_deref(), Some("g1"));
    assert_eq!(rows[0].timestamp, 1500 * 1_000_000);
    assert!(p.redis.keys().is_empty());
}

#[tokio::test]
async fn test_goal_fans_out_to_every_tracking_experiment() {
    let p = Pipeline::new(10);
    for (id, feature) in [("e1", "f1"), ("e2", "f2"), ("e3", "f3")] {
        p.experiments
            .insert(ENV, experiment(id, feature, 1, &["g1"], 1000, 2000));
        p.evaluations
            .insert(ENV, "u1", user_evaluation(feature, 1, "vA", 1100));
    }

    p.process(vec![("m1", goal_envelope(ENV, &goal_event("g1", "u1", 1500)))])
        .await;

    assert_eq!(p.log.settlements_of("m1"), vec![Settlement::Ack]);
    let rows = p.goal_sink.rows();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| row.id == "m1"));
    let features: HashSet<_> = rows.iter().map(|row| row.feature_id.as_str()).collect();
    assert_eq!(features, HashSet::from(["f1", "f2", "f3"]));
}

#[tokio::test]
async fn test_evaluation_is_written_with_defaults() {
    let p = Pipeline::new(10);
    p.experiments
        .insert(ENV, experiment("e1", "f1", 1, &["g1"], 1000, 2000));
    let mut event = evaluation_event("f1", 1, "u1", "", 1500);
    event.tag = String::new();

    p.process(vec![("m1", evaluation_envelope(ENV, &event))])
        .await;

    assert_eq!(p.log.settlements_of("m1"), vec![Settlement::Ack]);
    let rows = p.evaluation_sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].tag, DEFAULT_TAG);
    assert_eq!(rows[0].variation_id, DEFAULT_VARIATION_ID);
    assert_eq!(rows[0].user_id, "u1");
    assert!(p.goal_sink.rows().is_empty());
}

#[tokio::test]
async fn test_unlinkable_events_are_acked_without_rows() {
    let p = Pipeline::new(10);
    p.experiments
        .insert(ENV, experiment("e1", "f1", 1, &["g1"], 1000, 2000));

    p.process(vec![
        // No experiment on this feature version.
        ("m1", evaluation_envelope(ENV, &evaluation_event("f1", 2, "u1", "vA", 1500))),
        ("m2", evaluation_envelope(ENV, &evaluation_event("f1", 1, "u1", "vA", 2500))),
        ("m3", evaluation_envelope(ENV, &evaluation_event("f1", 1, "u1", "vA", 500))),
        // No experiment tracks this goal.
        ("m4", goal_envelope(ENV, &goal_event("g2", "u1", 1500))),
        ("m5", b"not json".to_vec()),
    ])
    .await;

    for id in ["m1", "m2", "m3", "m4", "m5"] {
        assert_eq!(p.log.settlements_of(id), vec![Settlement::Ack], "{id}");
    }
    assert!(p.evaluation_sink.rows().is_empty());
    assert!(p.goal_sink.rows().is_empty());
    assert!(p.redis.keys().is_empty());
}

#[tokio::test]
async fn test_recently_stopped_experiment_still_links() {
    let p = Pipeline::new(10);
    let mut recent = experiment("e1", "f1", 1, &["g1"], NOW - 3 * DAY, NOW - DAY);
    recent.status = ExperimentStatus::Stopped;
    let mut old = experiment("e2", "f2", 1, &["g1"], NOW - 10 * DAY, NOW - 5 * DAY);
    old.status = ExperimentStatus::Stopped;
    p.experiments.insert(ENV, recent);
    p.experiments.insert(ENV, old);

    p.process(vec![
        ("m1", evaluation_envelope(ENV, &evaluation_event("f1", 1, "u1", "vA", NOW - 2 * DAY))),
        ("m2", evaluation_envelope(ENV, &evaluation_event("f2", 1, "u1", "vA", NOW - 6 * DAY))),
    ])
    .await;

    assert_eq!(p.log.count(Settlement::Ack), 2);
    let rows = p.evaluation_sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "m1");
}

#[tokio::test]
async fn test_resolver_failure_nacks_the_environment() {
    let p = Pipeline::new(10);
    p.experiments.set_failing(true);

    p.process(vec![
        ("m1", evaluation_envelope(ENV, &evaluation_event("f1", 1, "u1", "vA", 1500))),
        ("m2", goal_envelope(ENV, &goal_event("g1", "u1", 1500))),
    ])
    .await;

    assert_eq!(p.log.settlements_of("m1"), vec![Settlement::Nack]);
    assert_eq!(p.log.settlements_of("m2"), vec![Settlement::Nack]);
    assert!(p.evaluation_sink.rows().is_empty());
}

#[tokio::test]
async fn test_evaluation_outage_nacks_goals() {
    let p = Pipeline::new(10);
    p.experiments
        .insert(ENV, experiment("e1", "f1", 1, &["g1"], 1000, 2000));
    p.evaluations.set_failing(true);

    p.process(vec![
        ("m1", goal_envelope(ENV, &goal_event("g1", "u1", 1500))),
        ("m2", evaluation_envelope(ENV, &evaluation_event("f1", 1, "u1", "vA", 1500))),
    ])
    .await;

    assert_eq!(p.log.settlements_of("m1"), vec![Settlement::Nack]);
    assert_eq!(p.log.settlements_of("m2"), vec![Settlement::Ack]);
    assert!(p.redis.keys().is_empty());
}

#[tokio::test]
async fn test_failed_chunk_nacks_only_its_events() {
    let p = Pipeline::new(10);
    p.experiments
        .insert(ENV, experiment("e1", "f1", 1, &["g1"], 1000, 2000));
    p.evaluation_sink.fail_chunks([1]);

    let ids: Vec<String> = (0..15).map(|_| random_string("m-", 12)).collect();
    let messages = ids
        .iter()
        .map(|id| {
            let event = evaluation_event("f1", 1, id, "vA", 1500);
            (id.as_str(), evaluation_envelope(ENV, &event))
        })
        .collect();
    p.process(messages).await;

    let written: HashSet<String> = p
        .evaluation_sink
        .rows()
        .into_iter()
        .map(|row| row.id)
        .collect();
    assert_eq!(written.len(), 10);
    assert_eq!(p.evaluation_sink.chunk_sizes(), vec![10]);
    assert_eq!(p.log.count(Settlement::Ack), 10);
    assert_eq!(p.log.count(Settlement::Nack), 5);
    for id in &ids {
        let expected = if written.contains(id) {
            Settlement::Ack
        } else {
            Settlement::Nack
        };
        assert_eq!(p.log.settlements_of(id), vec![expected], "{id}");
    }
}

#[tokio::test]
async fn test_unreachable_warehouse_nacks_everything() {
    let p = Pipeline::new(10);
    p.experiments
        .insert(ENV, experiment("e1", "f1", 1, &["g1"], 1000, 2000));
    p.evaluation_sink.set_failing(true);

    p.process(vec![
        ("m1", evaluation_envelope(ENV, &evaluation_event("f1", 1, "u1", "vA", 1500))),
        ("m2", evaluation_envelope(ENV, &evaluation_event("f1", 1, "u2", "vA", 1600))),
    ])
    .await;

    assert_eq!(p.log.count(Settlement::Nack), 2);
    assert_eq!(p.log.count(Settlement::Ack), 0);
}

#[tokio::test]
async fn test_deferred_goal_is_linked_by_a_later_scan() {
    let p = Pipeline::new(10);
    p.experiments
        .insert(ENV, experiment("e1", "f1", 1, &["g1"], 1000, 2000));
    let goal = goal_event("g1", "u1", 1500);

    p.process(vec![("m1", goal_envelope(ENV, &goal))]).await;

    assert_eq!(p.log.settlements_of("m1"), vec![Settlement::Ack]);
    assert!(p.goal_sink.rows().is_empty());
    assert_eq!(p.redis.keys(), vec!["env:goal_retry:m1"]);

    // A redelivery leaves the schedule alone.
    p.time.advance(30);
    let log = AckLog::default();
    p.persister
        .process(Batch::from([(
            "m1".to_owned(),
            log.message("t2", Some("m1"), goal_envelope(ENV, &goal)),
        )]))
        .await;
    assert_eq!(log.settlements_of("t2"), vec![Settlement::Ack]);
    let descriptor = p.retries.get("env:goal_retry:m1").await.unwrap().unwrap();
    assert_eq!(descriptor.first_retry_at, NOW);
    assert_eq!(descriptor.retry_at, NOW + 60);

    // Still missing: the attempt reschedules with backoff.
    p.time.set(NOW + 60);
    assert_eq!(p.scan().await, ScanReport { seen: 1, attempted: 1 });
    let descriptor = p.retries.get("env:goal_retry:m1").await.unwrap().unwrap();
    assert_eq!(descriptor.retry_count, 1);
    assert_eq!(descriptor.retry_at, NOW + 60 + 120);

    p.evaluations
        .insert(ENV, "u1", user_evaluation("f1", 1, "vB", 1200));
    p.time.set(descriptor.retry_at);
    assert_eq!(p.scan().await, ScanReport { seen: 1, attempted: 1 });

    let rows = p.goal_sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "m1");
    assert_eq!(rows[0].variation_id, "vB");
    assert!(p.redis.keys().is_empty());
}

#[tokio::test]
async fn test_partially_linked_goal_is_salvaged_when_retries_run_out() {
    let p = Pipeline::new(10);
    p.experiments
        .insert(ENV, experiment("e1", "f1", 1, &["g1"], 1000, 2000));
    p.experiments
        .insert(ENV, experiment("e2", "f2", 1, &["g1"], 1000, 2000));
    p.evaluations
        .insert(ENV, "u1", user_evaluation("f1", 1, "vA", 1100));

    p.process(vec![("m1", goal_envelope(ENV, &goal_event("g1", "u1", 1500)))])
        .await;
    assert_eq!(p.log.settlements_of("m1"), vec![Settlement::Ack]);
    assert!(p.goal_sink.rows().is_empty());

    p.time.advance(DAY);
    p.scan().await;

    let rows = p.goal_sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].feature_id, "f1");
    assert!(p.redis.keys().is_empty());
}

#[tokio::test]
async fn test_unavailable_retry_store_nacks_deferred_goal() {
    let p = Pipeline::new(10);
    p.experiments
        .insert(ENV, experiment("e1", "f1", 1, &["g1"], 1000, 2000));
    p.redis.set_failing(true);

    p.process(vec![("m1", goal_envelope(ENV, &goal_event("g1", "u1", 1500)))])
        .await;

    assert_eq!(p.log.settlements_of("m1"), vec![Settlement::Nack]);
}

#[tokio::test]
async fn test_duplicates_are_written_once_through_the_windower() {
    let p = Pipeline::new(10);
    p.experiments
        .insert(ENV, experiment("e1", "f1", 1, &["g1"], 1000, 2000));
    let event = evaluation_event("f1", 1, "u1", "vA", 1500);
    let other = evaluation_event("f1", 1, "u2", "vA", 1600);

    let source = Arc::new(VecMessageSource::new(vec![
        p.log.message("t1", Some("m1"), evaluation_envelope(ENV, &event)),
        p.log.message("t2", Some("m1"), evaluation_envelope(ENV, &event)),
        p.log.message("t3", Some("m2"), evaluation_envelope(ENV, &other)),
    ]));
    let (sender, receiver) = mpsc::channel(16);
    let registry = HealthRegistry::new("liveness");
    let windower = BatchWindower::new(
        "windower-0",
        Arc::new(Mutex::new(receiver)),
        p.persister.clone(),
        100,
        Duration::from_secs(60),
        Duration::from_secs(5),
        registry.register("windower-0".to_owned(), ::time::Duration::seconds(90)),
    );
    let shutdown = CancellationToken::new();
    let windower = tokio::spawn(windower.run(shutdown.clone()));

    let pump = RateLimitedPump::new(source, NonZeroU32::new(1000).unwrap(), sender);
    pump.run(shutdown.clone()).await.expect("pump failed");

    tokio::time::timeout(Duration::from_secs(5), windower)
        .await
        .expect("windower did not stop")
        .expect("windower panicked");

    let mut written: Vec<String> = p
        .evaluation_sink
        .rows()
        .into_iter()
        .map(|row| row.id)
        .collect();
    written.sort();
    assert_eq!(written, vec!["m1", "m2"]);
    for transport_id in ["t1", "t2", "t3"] {
        assert_eq!(
            p.log.settlements_of(transport_id),
            vec![Settlement::Ack],
            "{transport_id}"
        );
    }
}
