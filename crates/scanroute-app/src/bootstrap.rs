use std::sync::Arc;

use scanroute_config::RouterConfig;
use scanroute_core::{OperatorPrompt, OrderDirectory, RemoteStorage};
use scanroute_events::EventBus;
use scanroute_pipeline::{StabilityDetector, StabilitySettings};
use scanroute_store::StateStore;
use scanroute_telemetry::{GlobalContextGuard, LogFormat, LoggingConfig, Metrics};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::activity::ActivityLog;
use crate::adapters::{CatalogOrderDirectory, LocalMirrorStorage, TerminalPrompt};
use crate::error::{AppError, AppResult};
use crate::orchestrator::{Router, RouterParts, RouterSettings};

/// Capacity of the detector to router channel.
const SIGNAL_CAPACITY: usize = 256;

/// Dependencies required to run the watcher.
pub struct BootstrapDependencies {
    config: RouterConfig,
    store: StateStore,
    events: EventBus,
    metrics: Metrics,
    directory: Arc<dyn OrderDirectory>,
    storage: Arc<dyn RemoteStorage>,
    prompt: Arc<dyn OperatorPrompt>,
}

impl BootstrapDependencies {
    /// Construct production dependencies from the environment (and `.env`).
    ///
    /// # Errors
    ///
    /// Returns an error when configuration is missing or invalid, or the state
    /// directory cannot be opened.
    pub fn from_env() -> AppResult<Self> {
        let config = RouterConfig::from_env().map_err(|err| AppError::config("config.from_env", err))?;
        Self::from_config(config)
    }

    /// Wire the bundled adapters for an already loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the state directory or metrics registry cannot be created.
    pub fn from_config(config: RouterConfig) -> AppResult<Self> {
        let store = StateStore::open(&config.state.dir)
            .map_err(|err| AppError::store("state_store.open", err))?;
        let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
        let directory: Arc<dyn OrderDirectory> = Arc::new(CatalogOrderDirectory::new(
            &config.orders.catalog,
            config.orders.lab_name.clone(),
        ));
        let storage: Arc<dyn RemoteStorage> =
            Arc::new(LocalMirrorStorage::new(&config.storage.mirror_dir));
        let prompt: Arc<dyn OperatorPrompt> =
            Arc::new(TerminalPrompt::new(config.orders.defer_keyword.clone()));
        Ok(Self::with_collaborators(config, store, metrics, directory, storage, prompt))
    }

    /// Assemble dependencies from explicit collaborators.
    #[must_use]
    pub fn with_collaborators(
        config: RouterConfig,
        store: StateStore,
        metrics: Metrics,
        directory: Arc<dyn OrderDirectory>,
        storage: Arc<dyn RemoteStorage>,
        prompt: Arc<dyn OperatorPrompt>,
    ) -> Self {
        Self {
            config,
            store,
            events: EventBus::new(),
            metrics,
            directory,
            storage,
            prompt,
        }
    }

    /// Event bus shared with the router.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }
}

/// Entry point for the watcher boot sequence.
///
/// # Errors
///
/// Returns an error if dependency construction, logging setup or the router fails.
pub async fn run_app() -> AppResult<()> {
    let dependencies = BootstrapDependencies::from_env()?;
    let logging = LoggingConfig {
        level: &dependencies.config.telemetry.log_level,
        format: LogFormat::from_setting(dependencies.config.telemetry.log_format.as_deref()),
        build_sha: option_env!("SCANROUTE_BUILD_SHA").unwrap_or("dev"),
    };
    scanroute_telemetry::init_logging(&logging)
        .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    let _context = GlobalContextGuard::new("watch");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(err) => warn!(error = %err, "failed to listen for shutdown signal"),
        }
        shutdown.cancel();
    });

    Box::pin(run_app_with(dependencies, cancel)).await
}

/// Boot sequence over injected dependencies; returns once `cancel` fires.
///
/// # Errors
///
/// Returns an error if the router cannot recover state or a task fails to join.
pub async fn run_app_with(
    dependencies: BootstrapDependencies,
    cancel: CancellationToken,
) -> AppResult<()> {
    let BootstrapDependencies {
        config,
        store,
        events,
        metrics,
        directory,
        storage,
        prompt,
    } = dependencies;

    info!(
        watch_root = %config.watch.root.display(),
        scan_depth = config.watch.scan_depth,
        state_dir = %config.state.dir.display(),
        storage_root = %config.storage.root,
        "scan router starting"
    );

    let settings = StabilitySettings {
        poll_interval: config.watch.poll_interval,
        settle: config.watch.settle,
        stable_samples: config.watch.stable_samples,
    };
    let detector = StabilityDetector::new(
        config.watch.root.clone(),
        config.watch.scan_depth,
        settings,
        store.clone(),
    );
    let activity_stop = CancellationToken::new();
    let activity = ActivityLog::new(&config.state.dir, metrics.clone());
    let activity_task = tokio::spawn(activity.run(
        events.clone(),
        events.subscribe(),
        activity_stop.clone(),
    ));
    let router = Router::new(
        RouterParts {
            store,
            directory,
            storage,
            prompt,
            events: events.clone(),
            metrics: metrics.clone(),
        },
        RouterSettings::from_config(&config),
        cancel.clone(),
    );

    let (sender, receiver) = mpsc::channel(SIGNAL_CAPACITY);
    let detector_task = tokio::spawn(detector.run(sender, cancel.clone()));
    let outcome = router.run(receiver, config.watch.recovery_sweep).await;

    cancel.cancel();
    detector_task
        .await
        .map_err(|source| AppError::Join {
            task: "stability_detector",
            source,
        })?;
    events.close();
    activity_stop.cancel();
    activity_task.await.map_err(|source| AppError::Join {
        task: "activity_log",
        source,
    })?;

    let snapshot = metrics.snapshot();
    info!(
        scans_detected = snapshot.scans_detected_total,
        files_uploaded = snapshot.files_uploaded_total,
        files_skipped = snapshot.files_skipped_total,
        upload_retries = snapshot.upload_retries_total,
        staged = snapshot.staged_jobs,
        "scan router stopped"
    );
    outcome
}
