//! Router that drives scans from detector signals through resolution, upload
//! and order annotation. Every stage change is persisted before the side
//! effect it guards, so restarts re-derive outstanding work from the store.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use scanroute_config::RouterConfig;
use scanroute_core::{
    Candidate, CandidateChoice, OperatorPrompt, OrderDirectory, PipelineError, RemoteStorage,
    ResolutionTarget, RollLink, ScanJob, ScanStage,
};
use scanroute_events::{Event, EventBus};
use scanroute_pipeline::{
    DetectorEvent, MatchOutcome, Matcher, RetryPolicy, Uploader, destination_folder, scan_fs,
};
use scanroute_store::{StagingQueue, StateStore, StoreError};
use scanroute_telemetry::{Metrics, with_scan_context};
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};

const ORDER_DIRECTORY_COMPONENT: &str = "order_directory";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tunables the router needs from configuration.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Remote folder under which customer roots are created.
    pub storage_root: String,
    /// Reserved search term that defers a scan to the staging queue.
    pub defer_keyword: String,
    /// Tag annotated orders for downstream automation.
    pub auto_tag: bool,
    /// Upper bound on concurrently uploading jobs.
    pub max_parallel: usize,
    /// Retry policy applied to remote storage calls.
    pub retry: RetryPolicy,
}

impl RouterSettings {
    /// Derive router settings from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            storage_root: config.storage.root.clone(),
            defer_keyword: config.orders.defer_keyword.clone(),
            auto_tag: config.orders.auto_tag,
            max_parallel: config.upload.max_parallel,
            retry: RetryPolicy::new(
                config.upload.max_attempts,
                config.upload.base_delay,
                config.upload.max_delay,
            ),
        }
    }
}

/// Collaborators and shared services wired into the router.
pub struct RouterParts {
    /// Durable scan records.
    pub store: StateStore,
    /// Order system used for search and annotation.
    pub directory: Arc<dyn OrderDirectory>,
    /// Remote store receiving the scan files.
    pub storage: Arc<dyn RemoteStorage>,
    /// Operator conversation.
    pub prompt: Arc<dyn OperatorPrompt>,
    /// Domain event bus.
    pub events: EventBus,
    /// Metrics registry.
    pub metrics: Metrics,
}

type PathSet = Arc<Mutex<HashSet<PathBuf>>>;

/// Paths with an active resolution conversation or upload.
#[derive(Clone, Default)]
struct InFlight(PathSet);

impl InFlight {
    fn claim(&self, source_path: &Path) -> Option<Claim> {
        let inserted = lock(&self.0).insert(source_path.to_path_buf());
        inserted.then(|| Claim {
            paths: Arc::clone(&self.0),
            path: source_path.to_path_buf(),
        })
    }

    fn contains(&self, source_path: &Path) -> bool {
        lock(&self.0).contains(source_path)
    }
}

/// Exclusive hold on one `source_path`, released on drop.
struct Claim {
    paths: PathSet,
    path: PathBuf,
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock(&self.paths).remove(&self.path);
    }
}

/// Scans waiting for the operator, earliest detected first.
#[derive(Default)]
struct ResolutionQueue {
    entries: Mutex<BTreeSet<(DateTime<Utc>, PathBuf)>>,
    ready: Notify,
}

impl ResolutionQueue {
    fn push(&self, detected_at: DateTime<Utc>, source_path: PathBuf) {
        {
            let mut entries = lock(&self.entries);
            if entries.iter().any(|(_, queued)| *queued == source_path) {
                return;
            }
            entries.insert((detected_at, source_path));
        }
        self.ready.notify_one();
    }

    fn remove(&self, source_path: &Path) {
        lock(&self.entries).retain(|(_, queued)| queued != source_path);
    }

    fn pop(&self) -> Option<PathBuf> {
        lock(&self.entries).pop_first().map(|(_, path)| path)
    }

    fn snapshot(&self) -> Vec<PathBuf> {
        lock(&self.entries)
            .iter()
            .map(|(_, path)| path.clone())
            .collect()
    }
}

/// Drives each scan through the pipeline state machine.
pub struct Router {
    store: StateStore,
    staging: StagingQueue,
    matcher: Matcher,
    uploader: Uploader,
    directory: Arc<dyn OrderDirectory>,
    storage: Arc<dyn RemoteStorage>,
    prompt: Arc<dyn OperatorPrompt>,
    events: EventBus,
    metrics: Metrics,
    settings: RouterSettings,
    in_flight: InFlight,
    queue: ResolutionQueue,
    upload_slots: Semaphore,
    uploads: Mutex<JoinSet<()>>,
    directory_degraded: AtomicBool,
    cancel: CancellationToken,
}

impl Router {
    /// Build a router; `cancel` stops uploads and the run loop.
    #[must_use]
    pub fn new(parts: RouterParts, settings: RouterSettings, cancel: CancellationToken) -> Arc<Self> {
        let RouterParts {
            store,
            directory,
            storage,
            prompt,
            events,
            metrics,
        } = parts;
        let matcher = Matcher::new(Arc::clone(&directory), &settings.defer_keyword);
        let uploader = Uploader::new(Arc::clone(&storage), settings.retry.clone(), metrics.clone());
        Arc::new(Self {
            staging: StagingQueue::new(store.clone()),
            store,
            matcher,
            uploader,
            directory,
            storage,
            prompt,
            events,
            metrics,
            upload_slots: Semaphore::new(settings.max_parallel.max(1)),
            settings,
            in_flight: InFlight::default(),
            queue: ResolutionQueue::default(),
            uploads: Mutex::new(JoinSet::new()),
            directory_degraded: AtomicBool::new(false),
            cancel,
        })
    }

    /// State store backing the router.
    #[must_use]
    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    /// Scans waiting for a resolution conversation, in presentation order.
    #[must_use]
    pub fn queued(&self) -> Vec<PathBuf> {
        self.queue.snapshot()
    }

    /// Apply a detector signal to the state store.
    ///
    /// Signals about records that moved on since the sample was taken are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read or written.
    pub async fn handle_event(&self, event: DetectorEvent) -> AppResult<()> {
        let source_path = event.source_path().to_path_buf();
        match self.apply_detector_event(event).await {
            Err(err) if err.is_stale() => {
                debug!(
                    source_path = %source_path.display(),
                    error = %err,
                    "stale detector signal ignored"
                );
                Ok(())
            }
            other => other,
        }
    }

    async fn apply_detector_event(&self, event: DetectorEvent) -> AppResult<()> {
        match event {
            DetectorEvent::Observed { source_path, at } => {
                let job = ScanJob::detected(source_path, at);
                let created = self
                    .store
                    .create(&job)
                    .await
                    .map_err(|err| AppError::store("record.create", err))?;
                if created {
                    self.metrics.inc_scan_detected();
                    self.publish(Event::ScanDetected {
                        source_path: job.path_label(),
                    });
                    self.record_stage(&job);
                }
            }
            DetectorEvent::Unsettled {
                source_path,
                changed_at,
            } => {
                let job = self
                    .store
                    .transition_with(&source_path, ScanStage::Stabilizing, move |job| {
                        job.last_changed_at = changed_at;
                    })
                    .await
                    .map_err(|err| AppError::store("detector.unsettled", err))?;
                self.record_stage(&job);
            }
            DetectorEvent::Stable {
                source_path,
                snapshot,
                layout,
                changed_at,
            } => {
                let job = self
                    .store
                    .transition_with(&source_path, ScanStage::Stable, move |job| {
                        job.snapshot = Some(snapshot);
                        job.apply_layout(layout);
                        job.last_changed_at = changed_at;
                    })
                    .await
                    .map_err(|err| AppError::store("detector.stable", err))?;
                self.record_stage(&job);
                self.queue.push(job.detected_at, job.source_path.clone());
            }
            DetectorEvent::Modified { source_path, at } => {
                self.queue.remove(&source_path);
                let job = self
                    .store
                    .transition_with(&source_path, ScanStage::Stabilizing, move |job| {
                        job.last_changed_at = at;
                    })
                    .await
                    .map_err(|err| AppError::store("detector.modified", err))?;
                self.record_stage(&job);
            }
            DetectorEvent::ChangedAfterUpload { source_path } => {
                let job = self
                    .store
                    .modify(&source_path, |job| {
                        job.changed_after_upload = true;
                        Ok(())
                    })
                    .await
                    .map_err(|err| AppError::store("detector.flag_change", err))?;
                self.publish(Event::ChangeFlagged {
                    source_path: job.path_label(),
                });
            }
        }
        Ok(())
    }

    /// Re-derive outstanding work from the state store.
    ///
    /// Uploads resume skipping completed rolls, reassigned staging entries
    /// start uploading, unresolved scans re-enter the resolution queue and
    /// uploaded scans retry annotation. Paths already in flight are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be listed.
    pub async fn recover(self: &Arc<Self>) -> AppResult<()> {
        let jobs = self
            .store
            .list()
            .map_err(|err| AppError::store("recover.list", err))?;
        for job in jobs {
            if self.in_flight.contains(&job.source_path) {
                continue;
            }
            match job.stage {
                ScanStage::Uploading | ScanStage::Uploaded => {
                    if let Some(claim) = self.in_flight.claim(&job.source_path) {
                        debug!(
                            source_path = %job.source_path.display(),
                            stage = job.stage.as_str(),
                            "resuming scan"
                        );
                        self.spawn_job(claim);
                    }
                }
                ScanStage::AwaitingResolution if job.resolution.is_some() => {
                    let Some(claim) = self.in_flight.claim(&job.source_path) else {
                        continue;
                    };
                    info!(
                        source_path = %job.source_path.display(),
                        "reassigned scan picked up for upload"
                    );
                    match self.begin_upload(claim, None).await {
                        Err(err) if err.is_stale() => {}
                        other => other?,
                    }
                }
                ScanStage::Stable | ScanStage::AwaitingResolution => {
                    self.queue.push(job.detected_at, job.source_path.clone());
                }
                _ => {}
            }
        }
        self.refresh_staged_gauge();
        Ok(())
    }

    /// Hold the resolution conversation for the earliest-detected queued scan.
    ///
    /// Returns `false` when nothing was queued.
    ///
    /// # Errors
    ///
    /// Returns an error when the store or the operator prompt fails.
    pub async fn resolve_next(self: &Arc<Self>) -> AppResult<bool> {
        let Some(source_path) = self.queue.pop() else {
            return Ok(false);
        };
        let Some(claim) = self.in_flight.claim(&source_path) else {
            debug!(
                source_path = %source_path.display(),
                "scan already in flight; coalesced"
            );
            return Ok(true);
        };
        match self.converse(claim).await {
            Err(err) if err.is_stale() => {
                debug!(
                    source_path = %source_path.display(),
                    error = %err,
                    "scan moved on before resolution"
                );
                Ok(true)
            }
            Err(err) => Err(err),
            Ok(()) => Ok(true),
        }
    }

    async fn converse(self: &Arc<Self>, claim: Claim) -> AppResult<()> {
        let mut job = self.load(&claim.path)?;
        match job.stage {
            ScanStage::Stable => {
                job = self
                    .store
                    .transition(&claim.path, ScanStage::AwaitingResolution)
                    .await
                    .map_err(|err| AppError::store("resolution.begin", err))?;
                self.record_stage(&job);
                self.publish(Event::ResolutionRequested {
                    source_path: job.path_label(),
                });
            }
            ScanStage::AwaitingResolution if job.resolution.is_none() => {}
            _ => return Ok(()),
        }

        loop {
            let Some(term) = self
                .prompt
                .prompt_search_term(&job)
                .await
                .map_err(|err| AppError::pipeline("prompt.search_term", err))?
            else {
                info!(
                    source_path = %job.source_path.display(),
                    "no search term given; scan keeps waiting"
                );
                return Ok(());
            };

            let outcome = match self.matcher.search(&term).await {
                Ok(outcome) => {
                    self.set_directory_degraded(false);
                    outcome
                }
                Err(
                    err @ (PipelineError::RemoteUnavailable { .. }
                    | PipelineError::TransientNetwork { .. }),
                ) => {
                    self.set_directory_degraded(true);
                    warn!(error = %err, detail = %err.detail(), "order search failed");
                    self.prompt
                        .report_status(&format!("order search unavailable: {}", err.detail()))
                        .await;
                    continue;
                }
                Err(err) => return Err(AppError::pipeline("matcher.search", err)),
            };

            let candidates = match outcome {
                MatchOutcome::Deferred => return self.defer(&job).await,
                MatchOutcome::Candidates(candidates) if candidates.is_empty() => {
                    self.prompt
                        .report_status(&format!("no orders matched \"{}\"", term.trim()))
                        .await;
                    continue;
                }
                MatchOutcome::Candidates(candidates) => candidates,
            };

            let choice = self
                .prompt
                .present_candidates(&job, &candidates)
                .await
                .map_err(|err| AppError::pipeline("prompt.candidates", err))?;
            match choice {
                CandidateChoice::Selected(index) => {
                    let Some(candidate) = candidates.into_iter().nth(index) else {
                        self.prompt.report_status("selection out of range").await;
                        continue;
                    };
                    let target = self.build_target(candidate).await;
                    info!(
                        source_path = %job.source_path.display(),
                        order_number = %target.order_number,
                        customer_root = %target.customer_root,
                        "scan resolved"
                    );
                    return self.begin_upload(claim, Some(target)).await;
                }
                CandidateChoice::Deferred => return self.defer(&job).await,
                CandidateChoice::SearchAgain => {}
            }
        }
    }

    async fn defer(&self, job: &ScanJob) -> AppResult<()> {
        let staged = self
            .staging
            .enqueue(job)
            .await
            .map_err(|err| AppError::store("staging.enqueue", err))?;
        self.record_stage(&staged);
        self.publish(Event::ScanStaged {
            source_path: staged.path_label(),
        });
        self.refresh_staged_gauge();
        self.prompt
            .report_status(&format!("{} staged for later resolution", staged.folder_name()))
            .await;
        Ok(())
    }

    /// Resolution target for the chosen candidate, creating the customer root
    /// when the candidate has none saved.
    async fn build_target(&self, candidate: Candidate) -> ResolutionTarget {
        if let Some(root) = candidate.customer_root.clone() {
            return candidate.into_target(root);
        }
        let root = format!(
            "{}/{}",
            self.settings.storage_root.trim_end_matches('/'),
            candidate.customer_email
        );
        match self.storage.create_shared_link(&root).await {
            Ok(url) => {
                info!(customer_root = %root, "customer root created");
                if let Some(customer_id) = candidate.customer_id.as_deref()
                    && let Err(err) = self.directory.record_customer_root(customer_id, &url).await
                {
                    warn!(
                        customer_id,
                        error = %err,
                        detail = %err.detail(),
                        "failed to record customer root"
                    );
                }
            }
            Err(err) => warn!(
                customer_root = %root,
                error = %err,
                detail = %err.detail(),
                "failed to create customer root link"
            ),
        }
        candidate.into_target(root)
    }

    async fn begin_upload(
        self: &Arc<Self>,
        claim: Claim,
        resolution: Option<ResolutionTarget>,
    ) -> AppResult<()> {
        let job = self
            .store
            .transition_with(&claim.path, ScanStage::Uploading, move |job| {
                if let Some(target) = resolution {
                    job.resolution = Some(target);
                }
                job.last_error = None;
            })
            .await
            .map_err(|err| AppError::store("upload.begin", err))?;
        self.record_stage(&job);
        self.spawn_job(claim);
        Ok(())
    }

    fn spawn_job(self: &Arc<Self>, claim: Claim) {
        let router = Arc::clone(self);
        let label = claim.path.display().to_string();
        let mut uploads = lock(&self.uploads);
        reap_finished(&mut uploads);
        uploads.spawn(with_scan_context(label, async move {
            router.drive_job(claim).await;
        }));
    }

    async fn drive_job(self: Arc<Self>, claim: Claim) {
        match self.upload_and_annotate(&claim.path).await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => info!(
                source_path = %claim.path.display(),
                "upload interrupted; completed rolls are kept for the next pass"
            ),
            Err(err) => self.record_failure(&claim.path, &err).await,
        }
    }

    async fn upload_and_annotate(&self, source_path: &Path) -> AppResult<()> {
        let mut job = self.load(source_path)?;
        if job.stage == ScanStage::Uploading {
            job = self.upload_rolls(job).await?;
        }
        if job.stage == ScanStage::Uploaded
            && let Err(err) = self.annotate(job).await
        {
            warn!(
                source_path = %source_path.display(),
                error = %err,
                detail = %err.detail(),
                "order annotation failed; retrying on the next sweep"
            );
        }
        Ok(())
    }

    async fn upload_rolls(&self, job: ScanJob) -> AppResult<ScanJob> {
        let target = job.resolution.clone().ok_or_else(|| AppError::MissingState {
            field: "resolution",
            source_path: job.source_path.clone(),
        })?;
        let _permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(cancelled("upload.queue")),
            permit = self.upload_slots.acquire() => {
                permit.map_err(|_| cancelled("upload.queue"))?
            }
        };
        self.metrics.upload_started();
        let result = self.transfer_rolls(job, &target).await;
        self.metrics.upload_finished();
        result
    }

    async fn transfer_rolls(&self, job: ScanJob, target: &ResolutionTarget) -> AppResult<ScanJob> {
        let source_path = job.source_path.clone();
        let fresh_layout = if job.completed_rolls.is_empty() {
            let layout = scan_fs::roll_layout(&source_path).map_err(|source| {
                AppError::pipeline(
                    "upload.layout",
                    PipelineError::FilesystemRace {
                        operation: "upload.roll_layout",
                        path: source_path.clone(),
                        source,
                    },
                )
            })?;
            Some(layout)
        } else {
            None
        };
        let mut job = self
            .store
            .modify(&source_path, move |job| {
                job.attempts += 1;
                if let Some(layout) = fresh_layout {
                    job.apply_layout(layout);
                }
                Ok(())
            })
            .await
            .map_err(|err| AppError::store("upload.start", err))?;
        info!(
            source_path = %source_path.display(),
            attempt = job.attempts,
            rolls = job.rolls.len(),
            pending = job.pending_rolls().len(),
            "upload pass started"
        );

        for roll_id in job.pending_rolls() {
            let receipt = self
                .uploader
                .upload_roll(&job, &roll_id, target, &self.cancel)
                .await
                .map_err(|err| AppError::pipeline("upload.roll", err))?;
            job = self
                .store
                .modify(&source_path, |job| {
                    job.mark_roll_complete(&receipt.roll_id, &receipt.destination);
                    Ok(())
                })
                .await
                .map_err(|err| AppError::store("upload.record_roll", err))?;
            self.publish(Event::RollUploaded {
                source_path: job.path_label(),
                roll_id: receipt.roll_id,
                destination: receipt.destination,
                files_sent: receipt.files_sent,
                files_skipped: receipt.files_skipped,
            });
        }

        let job = self
            .store
            .transition(&source_path, ScanStage::Uploaded)
            .await
            .map_err(|err| AppError::store("upload.finish", err))?;
        self.record_stage(&job);
        Ok(job)
    }

    async fn annotate(&self, job: ScanJob) -> AppResult<()> {
        let target = job.resolution.clone().ok_or_else(|| AppError::MissingState {
            field: "resolution",
            source_path: job.source_path.clone(),
        })?;
        let mut links = Vec::with_capacity(job.rolls.len());
        for roll_id in &job.rolls {
            let destination = job
                .destinations
                .get(roll_id)
                .cloned()
                .unwrap_or_else(|| destination_folder(&target, roll_id));
            let url = self
                .storage
                .create_shared_link(&destination)
                .await
                .map_err(|err| AppError::pipeline("annotate.link", err))?;
            links.push(RollLink {
                roll_id: roll_id.clone(),
                destination,
                url,
            });
        }

        self.directory
            .annotate(&target.order_id, &links)
            .await
            .map_err(|err| AppError::pipeline("annotate.order", err))?;
        if self.settings.auto_tag
            && let Err(err) = self.directory.tag_for_automation(&target.order_id).await
        {
            warn!(
                order_id = %target.order_id,
                error = %err,
                detail = %err.detail(),
                "failed to tag order for automation"
            );
        }

        let job = self
            .store
            .transition_with(&job.source_path, ScanStage::Annotated, move |job| {
                job.roll_links = links;
            })
            .await
            .map_err(|err| AppError::store("annotate.finish", err))?;
        self.record_stage(&job);
        self.publish(Event::ScanAnnotated {
            source_path: job.path_label(),
            order_number: target.order_number.clone(),
        });
        info!(
            source_path = %job.source_path.display(),
            order_number = %target.order_number,
            "order annotated"
        );
        self.prompt
            .report_status(&format!(
                "{} uploaded to order #{}",
                job.folder_name(),
                target.order_number.trim_start_matches('#')
            ))
            .await;
        Ok(())
    }

    async fn record_failure(&self, source_path: &Path, err: &AppError) {
        let message = err.detail();
        warn!(
            source_path = %source_path.display(),
            error = %err,
            detail = %message,
            "upload failed"
        );
        let recorded = self
            .store
            .transition_with(source_path, ScanStage::Failed, {
                let message = message.clone();
                move |job| job.last_error = Some(message)
            })
            .await;
        match recorded {
            Ok(job) => {
                self.record_stage(&job);
                self.publish(Event::UploadFailed {
                    source_path: job.path_label(),
                    message: message.clone(),
                });
                self.prompt
                    .report_status(&format!("upload of {} failed: {message}", job.folder_name()))
                    .await;
            }
            Err(store_err) => warn!(
                source_path = %source_path.display(),
                error = %store_err,
                "failed to record upload failure"
            ),
        }
    }

    /// Recover outstanding work, then consume detector signals until cancelled
    /// or the detector hangs up. Re-runs recovery every `sweep`.
    ///
    /// # Errors
    ///
    /// Returns an error when the initial recovery cannot list the store.
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<DetectorEvent>,
        sweep: Duration,
    ) -> AppResult<()> {
        self.recover().await?;
        let resolver = tokio::spawn(Arc::clone(&self).resolution_loop());
        let mut ticker = tokio::time::interval(sweep);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        info!(sweep_secs = sweep.as_secs(), "router started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                signal = signals.recv() => {
                    let Some(signal) = signal else { break };
                    if let Err(err) = self.handle_event(signal).await {
                        warn!(error = %err, detail = %err.detail(), "detector signal not applied");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.recover().await {
                        warn!(error = %err, detail = %err.detail(), "recovery sweep failed");
                    }
                }
            }
        }

        self.cancel.cancel();
        if let Err(err) = resolver.await {
            warn!(error = %err, "resolution task join failed");
        }
        self.drain_uploads().await;
        info!("router stopped");
        Ok(())
    }

    async fn resolution_loop(self: Arc<Self>) {
        loop {
            let step = tokio::select! {
                () = self.cancel.cancelled() => break,
                step = self.resolve_next() => step,
            };
            match step {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    warn!(error = %err, detail = %err.detail(), "resolution conversation failed");
                    continue;
                }
            }
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = self.queue.ready.notified() => {}
            }
        }
    }

    /// Wait until every spawned upload task has finished.
    pub async fn drain_uploads(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *lock(&self.uploads));
            if tasks.is_empty() {
                break;
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    warn!(error = %err, "upload task join failed");
                }
            }
        }
    }

    fn load(&self, source_path: &Path) -> AppResult<ScanJob> {
        self.store
            .get(source_path)
            .map_err(|err| AppError::store("record.get", err))?
            .ok_or_else(|| {
                AppError::store(
                    "record.get",
                    StoreError::NotFound {
                        source_path: source_path.to_path_buf(),
                    },
                )
            })
    }

    fn record_stage(&self, job: &ScanJob) {
        self.metrics.inc_stage_transition(job.stage.as_str());
        self.publish(Event::StageChanged {
            source_path: job.path_label(),
            stage: job.stage,
        });
    }

    fn publish(&self, event: Event) {
        let kind = event.kind();
        self.metrics.inc_event(kind);
        if let Err(err) = self.events.publish(event) {
            debug!(error = %err, event_kind = kind, "event bus closed; event dropped");
        }
    }

    fn refresh_staged_gauge(&self) {
        match self.staging.list() {
            Ok(staged) => self
                .metrics
                .set_staged_jobs(i64::try_from(staged.len()).unwrap_or(i64::MAX)),
            Err(err) => warn!(error = %err, "failed to count staged scans"),
        }
    }

    fn set_directory_degraded(&self, degraded: bool) {
        if self.directory_degraded.swap(degraded, Ordering::SeqCst) == degraded {
            return;
        }
        let components = if degraded {
            vec![ORDER_DIRECTORY_COMPONENT.to_string()]
        } else {
            Vec::new()
        };
        self.publish(Event::HealthChanged {
            degraded: components,
        });
    }
}

/// Drop finished upload tasks so a long-running watcher does not accumulate them.
fn reap_finished(tasks: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while let Some(joined) = tasks.try_join_next() {
        if let Err(err) = joined {
            warn!(error = %err, "upload task join failed");
        }
        reaped += 1;
    }
    reaped
}

const fn cancelled(operation: &'static str) -> AppError {
    AppError::Pipeline {
        operation,
        source: PipelineError::Cancelled { operation },
    }
}
