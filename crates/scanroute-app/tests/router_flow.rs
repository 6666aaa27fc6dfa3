use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use scanroute_app::{Router, RouterParts, RouterSettings};
use scanroute_core::{
    Candidate, CandidateChoice, ConfidenceTier, ResolutionTarget, ScanJob, ScanStage,
};
use scanroute_events::{Event, EventBus};
use scanroute_pipeline::{RetryPolicy, StabilityDetector, StabilitySettings};
use scanroute_store::{StagingQueue, StateStore};
use scanroute_telemetry::Metrics;
use scanroute_test_support::{FakeDirectory, FakeStorage, ScriptedPrompt, fixtures};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const STORAGE_ROOT: &str = "/Store/orders";

struct Harness {
    temp: TempDir,
    router: Arc<Router>,
    store: StateStore,
    directory: Arc<FakeDirectory>,
    storage: Arc<FakeStorage>,
    prompt: Arc<ScriptedPrompt>,
    events: EventBus,
    metrics: Metrics,
    cancel: CancellationToken,
}

impl Harness {
    fn new(retry: RetryPolicy) -> Result<Self> {
        let temp = TempDir::new()?;
        std::fs::create_dir_all(temp.path().join("scans"))?;
        let store = StateStore::open(temp.path().join("state"))?;
        let directory = Arc::new(FakeDirectory::default());
        let storage = Arc::new(FakeStorage::default());
        let prompt = Arc::new(ScriptedPrompt::default());
        let events = EventBus::new();
        let metrics = Metrics::new()?;
        let cancel = CancellationToken::new();
        let router = Router::new(
            RouterParts {
                store: store.clone(),
                directory: directory.clone(),
                storage: storage.clone(),
                prompt: prompt.clone(),
                events: events.clone(),
                metrics: metrics.clone(),
            },
            RouterSettings {
                storage_root: STORAGE_ROOT.to_string(),
                defer_keyword: "stage".to_string(),
                auto_tag: true,
                max_parallel: 2,
                retry,
            },
            cancel.clone(),
        );
        Ok(Self {
            temp,
            router,
            store,
            directory,
            storage,
            prompt,
            events,
            metrics,
            cancel,
        })
    }

    fn scans(&self) -> PathBuf {
        self.temp.path().join("scans")
    }

    fn detector(&self) -> StabilityDetector {
        StabilityDetector::new(
            self.scans(),
            1,
            StabilitySettings::default(),
            self.store.clone(),
        )
    }

    /// Feed `samples` detector passes two seconds apart into the router.
    async fn sample(
        &self,
        detector: &mut StabilityDetector,
        start: DateTime<Utc>,
        from: i64,
        samples: i64,
    ) -> Result<()> {
        for tick in from..from + samples {
            let now = start + chrono::Duration::seconds(tick * 2);
            for event in detector.sample_once(now) {
                self.router.handle_event(event).await?;
            }
        }
        Ok(())
    }

    fn job(&self, source_path: &Path) -> Result<ScanJob> {
        self.store
            .get(source_path)?
            .ok_or_else(|| anyhow!("no record for {}", source_path.display()))
    }

    fn event_kinds(&self) -> Vec<&'static str> {
        self.events
            .backlog_since(0)
            .into_iter()
            .map(|envelope| envelope.event.kind())
            .collect()
    }
}

fn jeff_order() -> Candidate {
    Candidate {
        order_id: "gid://order/100".into(),
        order_number: "100".into(),
        label: "#100 Jeff Example <jeff@example.com>".into(),
        customer_email: "jeff@example.com".into(),
        customer_id: Some("cust-1".into()),
        customer_root: None,
        confidence: ConfidenceTier::Exact,
    }
}

fn jeff_target() -> ResolutionTarget {
    jeff_order().into_target(format!("{STORAGE_ROOT}/jeff@example.com"))
}

async fn seed_job(
    store: &StateStore,
    source_path: &Path,
    stage: ScanStage,
    rolls: &[&str],
    completed: &[&str],
) -> Result<ScanJob> {
    let mut job = ScanJob::detected(source_path, Utc::now());
    job.stage = stage;
    job.rolls = rolls.iter().map(ToString::to_string).collect();
    let folder = job.folder_name();
    job.loose_roll = rolls
        .iter()
        .find(|roll| **roll == folder)
        .map(ToString::to_string);
    job.resolution = Some(jeff_target());
    for roll in completed {
        job.mark_roll_complete(roll, &format!("/done/{roll}"));
    }
    if !store.create(&job).await? {
        bail!("record already existed");
    }
    Ok(job)
}

#[tokio::test]
async fn roll42_flows_from_detection_to_annotation() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let scan = fixtures::write_scan(&harness.scans(), "roll42", 10)?;
    harness.directory.add_order(jeff_order());
    harness.prompt.push_term("jeff@example.com");
    harness.prompt.push_choice(CandidateChoice::Selected(0));

    let mut detector = harness.detector();
    let start = Utc::now();
    harness.sample(&mut detector, start, 0, 6).await?;
    assert_eq!(harness.job(&scan)?.stage, ScanStage::Stable);
    assert_eq!(harness.router.queued(), vec![scan.clone()]);

    assert!(harness.router.resolve_next().await?);
    harness.router.drain_uploads().await;

    let job = harness.job(&scan)?;
    assert_eq!(job.stage, ScanStage::Annotated);
    assert_eq!(job.rolls, vec!["roll42".to_string()]);
    assert_eq!(job.attempts, 1);
    assert_eq!(
        harness
            .storage
            .files_under("/Store/orders/jeff@example.com/100/roll42/photos")
            .len(),
        10
    );

    let annotations = harness.directory.annotations();
    assert_eq!(annotations.len(), 1);
    assert_eq!(annotations[0].0, "gid://order/100");
    assert_eq!(annotations[0].1.len(), 1);
    assert_eq!(harness.directory.tags(), vec!["gid://order/100".to_string()]);
    assert_eq!(
        harness.directory.customer_roots(),
        vec![(
            "cust-1".to_string(),
            "https://share.test/Store/orders/jeff@example.com".to_string()
        )]
    );
    assert_eq!(job.roll_links.len(), 1);

    let kinds = harness.event_kinds();
    for expected in [
        "scan_detected",
        "resolution_requested",
        "roll_uploaded",
        "scan_annotated",
    ] {
        assert!(kinds.contains(&expected), "missing {expected} in {kinds:?}");
    }
    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.scans_detected_total, 1);
    assert_eq!(snapshot.files_uploaded_total, 10);
    assert_eq!(snapshot.active_uploads, 0);
    assert!(
        harness
            .prompt
            .statuses()
            .iter()
            .any(|status| status == "roll42 uploaded to order #100")
    );
    Ok(())
}

#[tokio::test]
async fn loose_frames_beside_a_same_named_roll_are_uploaded() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let scan = fixtures::write_scan(&harness.scans(), "0042", 2)?;
    fixtures::write_roll_scan(&harness.scans(), "0042", &[("0042", 3)])?;
    harness.directory.add_order(jeff_order());
    harness.prompt.push_term("#100");
    harness.prompt.push_choice(CandidateChoice::Selected(0));

    let mut detector = harness.detector();
    harness.sample(&mut detector, Utc::now(), 0, 6).await?;
    assert!(harness.router.resolve_next().await?);
    harness.router.drain_uploads().await;

    let job = harness.job(&scan)?;
    assert_eq!(job.stage, ScanStage::Annotated);
    assert_eq!(job.rolls, vec!["0042-loose".to_string(), "0042".to_string()]);
    assert_eq!(job.completed_rolls.len(), 2);
    let order_root = "/Store/orders/jeff@example.com/100";
    assert_eq!(
        harness
            .storage
            .files_under(&format!("{order_root}/0042-loose/photos"))
            .len(),
        2
    );
    assert_eq!(
        harness
            .storage
            .files_under(&format!("{order_root}/0042/photos"))
            .len(),
        3
    );
    assert_eq!(harness.metrics.snapshot().files_uploaded_total, 5);
    Ok(())
}

#[tokio::test]
async fn settled_scans_are_never_detected_twice() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let scan = fixtures::write_scan(&harness.scans(), "roll7", 3)?;
    let mut detector = harness.detector();
    let start = Utc::now();
    harness.sample(&mut detector, start, 0, 10).await?;
    assert_eq!(harness.job(&scan)?.stage, ScanStage::Stable);

    let mut fresh = harness.detector();
    harness.sample(&mut fresh, start, 10, 10).await?;
    assert_eq!(harness.metrics.snapshot().scans_detected_total, 1);
    assert_eq!(harness.router.queued(), vec![scan]);
    let stable_events = harness
        .events
        .backlog_since(0)
        .into_iter()
        .filter(|envelope| {
            matches!(
                envelope.event,
                Event::StageChanged {
                    stage: ScanStage::Stable,
                    ..
                }
            )
        })
        .count();
    assert_eq!(stable_events, 1);
    Ok(())
}

#[tokio::test]
async fn change_before_resolution_restarts_stabilizing() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let scan = fixtures::write_scan(&harness.scans(), "roll8", 2)?;
    let mut detector = harness.detector();
    let start = Utc::now();
    harness.sample(&mut detector, start, 0, 6).await?;
    assert_eq!(harness.job(&scan)?.stage, ScanStage::Stable);

    fixtures::add_frame(&scan, 3)?;
    harness.sample(&mut detector, start, 6, 1).await?;
    assert_eq!(harness.job(&scan)?.stage, ScanStage::Stabilizing);
    assert!(harness.router.queued().is_empty());
    assert!(!harness.router.resolve_next().await?);

    harness.sample(&mut detector, start, 7, 6).await?;
    let job = harness.job(&scan)?;
    assert_eq!(job.stage, ScanStage::Stable);
    assert_eq!(job.snapshot.map(|snapshot| snapshot.file_count), Some(3));
    Ok(())
}

#[tokio::test]
async fn change_after_upload_is_flagged_not_restarted() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let scan = fixtures::write_scan(&harness.scans(), "roll9", 2)?;
    harness.directory.add_order(jeff_order());
    harness.prompt.push_term("#100");
    harness.prompt.push_choice(CandidateChoice::Selected(0));

    let mut detector = harness.detector();
    let start = Utc::now();
    harness.sample(&mut detector, start, 0, 6).await?;
    harness.router.resolve_next().await?;
    harness.router.drain_uploads().await;
    assert_eq!(harness.job(&scan)?.stage, ScanStage::Annotated);

    fixtures::add_frame(&scan, 3)?;
    harness.sample(&mut detector, start, 6, 3).await?;
    let job = harness.job(&scan)?;
    assert_eq!(job.stage, ScanStage::Annotated);
    assert!(job.changed_after_upload);
    assert!(harness.event_kinds().contains(&"change_flagged"));
    Ok(())
}

#[tokio::test]
async fn crash_recovery_uploads_only_the_missing_roll() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let scan =
        fixtures::write_roll_scan(&harness.scans(), "order-100", &[("r1", 2), ("r2", 2), ("r3", 2)])?;
    seed_job(
        &harness.store,
        &scan,
        ScanStage::Uploading,
        &["r1", "r2", "r3"],
        &["r1", "r2"],
    )
    .await?;

    harness.router.recover().await?;
    harness.router.drain_uploads().await;

    let puts = harness.storage.put_paths();
    assert_eq!(puts.len(), 2);
    assert!(
        puts.iter()
            .all(|path| path.starts_with("/Store/orders/jeff@example.com/100/r3/photos/"))
    );
    let job = harness.job(&scan)?;
    assert_eq!(job.stage, ScanStage::Annotated);
    assert_eq!(job.completed_rolls.len(), 3);
    Ok(())
}

#[tokio::test]
async fn recovery_never_runs_two_uploads_for_one_scan() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    harness.storage.set_put_delay(Duration::from_millis(20));
    let scan = fixtures::write_scan(&harness.scans(), "busy", 4)?;
    seed_job(&harness.store, &scan, ScanStage::Uploading, &["busy"], &[]).await?;

    harness.router.recover().await?;
    harness.router.recover().await?;
    harness.router.recover().await?;
    harness.router.drain_uploads().await;

    assert_eq!(harness.storage.put_calls(), 4);
    assert_eq!(harness.job(&scan)?.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn staging_round_trip_resumes_after_reassignment() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let scan = fixtures::write_scan(&harness.scans(), "later", 3)?;
    harness.prompt.push_term("  Stage ");

    let mut detector = harness.detector();
    harness.sample(&mut detector, Utc::now(), 0, 6).await?;
    assert!(harness.router.resolve_next().await?);

    let staging = StagingQueue::new(harness.store.clone());
    let staged = staging.list()?;
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].stage, ScanStage::Staged);
    assert!(staged[0].resolution.is_none());
    assert_eq!(harness.directory.search_calls(), 0);
    assert_eq!(harness.metrics.snapshot().staged_jobs, 1);

    let resolved = staging.resolve(&scan, jeff_target()).await?;
    assert_eq!(resolved.stage, ScanStage::AwaitingResolution);
    assert_eq!(resolved.resolution, Some(jeff_target()));
    assert!(staging.list()?.is_empty());

    harness.router.recover().await?;
    harness.router.drain_uploads().await;
    let job = harness.job(&scan)?;
    assert_eq!(job.stage, ScanStage::Annotated);
    assert_eq!(
        harness
            .storage
            .files_under("/Store/orders/jeff@example.com/100/later/photos")
            .len(),
        3
    );
    assert_eq!(harness.metrics.snapshot().staged_jobs, 0);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_mark_the_job_failed() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    harness.storage.fail_puts(u32::MAX);
    let scan = fixtures::write_scan(&harness.scans(), "flaky", 2)?;
    seed_job(&harness.store, &scan, ScanStage::Uploading, &["flaky"], &[]).await?;

    harness.router.recover().await?;
    harness.router.drain_uploads().await;

    let job = harness.job(&scan)?;
    assert_eq!(job.stage, ScanStage::Failed);
    assert_eq!(harness.storage.put_calls(), 3);
    let message = job.last_error.context("failure recorded")?;
    assert!(message.contains("retry attempts exhausted"), "{message}");
    assert!(harness.event_kinds().contains(&"upload_failed"));

    // Failed jobs wait for a manual requeue.
    harness.router.recover().await?;
    harness.router.drain_uploads().await;
    assert_eq!(harness.storage.put_calls(), 3);

    harness.storage.fail_puts(0);
    harness.store.requeue(&scan).await?;
    harness.router.recover().await?;
    harness.router.drain_uploads().await;
    let job = harness.job(&scan)?;
    assert_eq!(job.stage, ScanStage::Annotated);
    assert_eq!(job.attempts, 2);
    Ok(())
}

#[tokio::test]
async fn vanished_source_fails_without_stopping_the_router() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let gone = harness.scans().join("gone");
    seed_job(&harness.store, &gone, ScanStage::Uploading, &["gone"], &[]).await?;
    let kept = fixtures::write_scan(&harness.scans(), "kept", 1)?;
    seed_job(&harness.store, &kept, ScanStage::Uploading, &["kept"], &[]).await?;

    harness.router.recover().await?;
    harness.router.drain_uploads().await;

    let failed = harness.job(&gone)?;
    assert_eq!(failed.stage, ScanStage::Failed);
    assert!(
        failed
            .last_error
            .is_some_and(|message| message.contains("filesystem changed"))
    );
    assert_eq!(harness.job(&kept)?.stage, ScanStage::Annotated);
    Ok(())
}

#[tokio::test]
async fn unavailable_directory_is_reported_and_search_continues() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let scan = fixtures::write_scan(&harness.scans(), "retry-search", 1)?;
    harness.directory.add_order(jeff_order());
    harness.directory.fail_searches(1);
    harness.prompt.push_term("jeff@example.com");
    harness.prompt.push_term("nobody@example.com");
    harness.prompt.push_term("jeff@example.com");
    harness.prompt.push_choice(CandidateChoice::SearchAgain);
    harness.prompt.push_term("jeff@example.com");
    harness.prompt.push_choice(CandidateChoice::Selected(0));

    let mut detector = harness.detector();
    harness.sample(&mut detector, Utc::now(), 0, 6).await?;
    harness.router.resolve_next().await?;
    harness.router.drain_uploads().await;

    assert_eq!(harness.job(&scan)?.stage, ScanStage::Annotated);
    assert_eq!(harness.directory.search_calls(), 4);
    assert_eq!(harness.prompt.presented(), vec![1, 1]);
    let statuses = harness.prompt.statuses();
    assert!(statuses.iter().any(|s| s.starts_with("order search unavailable")));
    assert!(statuses.iter().any(|s| s == "no orders matched \"nobody@example.com\""));
    let health: Vec<_> = harness
        .events
        .backlog_since(0)
        .into_iter()
        .filter_map(|envelope| match envelope.event {
            Event::HealthChanged { degraded } => Some(degraded),
            _ => None,
        })
        .collect();
    assert_eq!(health, vec![vec!["order_directory".to_string()], Vec::new()]);
    Ok(())
}

#[tokio::test]
async fn skipped_prompt_leaves_scan_waiting_for_the_next_sweep() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let scan = fixtures::write_scan(&harness.scans(), "waiting", 1)?;
    let mut detector = harness.detector();
    harness.sample(&mut detector, Utc::now(), 0, 6).await?;

    assert!(harness.router.resolve_next().await?);
    assert_eq!(harness.job(&scan)?.stage, ScanStage::AwaitingResolution);
    assert!(harness.router.queued().is_empty());

    harness.router.recover().await?;
    assert_eq!(harness.router.queued(), vec![scan.clone()]);
    assert_eq!(harness.prompt.prompted(), vec![scan]);
    Ok(())
}

#[tokio::test]
async fn resolution_presents_earliest_detected_first() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let early = harness.scans().join("early");
    let late = harness.scans().join("late");
    let now = Utc::now();
    for (path, detected_at) in [(&late, now), (&early, now - chrono::Duration::minutes(5))] {
        let job = ScanJob::detected(path.as_path(), detected_at);
        harness.store.create(&job).await?;
        harness.store.transition(path, ScanStage::Stable).await?;
    }

    harness.router.recover().await?;
    assert_eq!(harness.router.queued(), vec![early.clone(), late.clone()]);
    harness.router.resolve_next().await?;
    harness.router.resolve_next().await?;
    assert_eq!(harness.prompt.prompted(), vec![early, late]);
    Ok(())
}

#[tokio::test]
async fn cancelled_upload_stays_uploading_with_partial_progress() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let scan = fixtures::write_roll_scan(&harness.scans(), "stop", &[("r1", 1), ("r2", 1)])?;
    seed_job(&harness.store, &scan, ScanStage::Uploading, &["r1", "r2"], &[]).await?;
    harness.cancel.cancel();

    harness.router.recover().await?;
    harness.router.drain_uploads().await;

    let job = harness.job(&scan)?;
    assert_eq!(job.stage, ScanStage::Uploading);
    assert!(job.last_error.is_none());
    assert_eq!(harness.storage.put_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn run_loop_stops_when_the_detector_hangs_up() -> Result<()> {
    let harness = Harness::new(RetryPolicy::immediate(3))?;
    let (sender, receiver) = tokio::sync::mpsc::channel(4);
    drop(sender);
    tokio::time::timeout(
        Duration::from_secs(5),
        Arc::clone(&harness.router).run(receiver, Duration::from_secs(30)),
    )
    .await??;
    assert!(harness.cancel.is_cancelled());
    Ok(())
}
