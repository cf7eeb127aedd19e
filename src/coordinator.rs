use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::{GeocodeCache, SqliteGeocodeCache};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::footprint::FootprintGenerator;
use crate::ingestion::VenueRecord;
use crate::job::{new_job_id, JobId, JobSnapshot, JobState, JobStatus, RecordError};
use crate::output::{Feature, FeatureCollectionWriter};
use crate::providers::build_providers;
use crate::resolver::{BatchResolver, BatchThrottle, GeocodeResolver, ResolveError, ResolverSettings};
use crate::telemetry::TelemetryClient;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub concurrency: usize,
    pub outage_threshold: usize,
    pub throttle_batch_size: usize,
    pub throttle_pause: Duration,
    pub output_dir: PathBuf,
    pub emit_kml: bool,
}

impl CoordinatorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency.max(1),
            outage_threshold: config.outage_threshold.max(1),
            throttle_batch_size: config.throttle_batch_size.max(1),
            throttle_pause: Duration::from_millis(config.throttle_pause_ms),
            output_dir: config.output_dir.clone(),
            emit_kml: config.emit_kml,
        }
    }
}

struct JobHandle {
    state: Mutex<JobState>,
    cancel_requested: AtomicBool,
    updates: watch::Sender<JobSnapshot>,
}

impl JobHandle {
    fn new(state: JobState) -> Self {
        let (updates, _) = watch::channel(state.snapshot());
        Self {
            state: Mutex::new(state),
            cancel_requested: AtomicBool::new(false),
            updates,
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        self.state.lock().snapshot()
    }

    fn update(&self, apply: impl FnOnce(&mut JobState)) -> JobSnapshot {
        let snapshot = {
            let mut state = self.state.lock();
            apply(&mut state);
            state.snapshot()
        };
        self.updates.send_replace(snapshot.clone());
        snapshot
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

/// Owns every job of this process, keyed by id. Jobs are independent:
/// each has its own state lock, cancel flag and batch throttle.
#[derive(Clone)]
pub struct BatchJobCoordinator {
    resolver: GeocodeResolver,
    footprints: FootprintGenerator,
    settings: CoordinatorSettings,
    jobs: Arc<Mutex<HashMap<JobId, Arc<JobHandle>>>>,
    telemetry: Option<TelemetryClient>,
}

impl BatchJobCoordinator {
    pub fn new(
        resolver: GeocodeResolver,
        footprints: FootprintGenerator,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            resolver,
            footprints,
            settings,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryClient) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// SQLite cache under `data_dir`, providers in configured order, job
    /// telemetry next to the cache.
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let cache: Arc<dyn GeocodeCache> = Arc::new(SqliteGeocodeCache::open(
            &config.data_dir,
            &config.cache_file_name,
        )?);
        let providers = build_providers(config)?;
        let telemetry = TelemetryClient::new(&config.data_dir, config)?;
        let resolver = GeocodeResolver::with_telemetry(
            cache,
            providers,
            ResolverSettings::from_config(config),
            telemetry.clone(),
        );
        info!(
            providers = ?resolver.provider_order(),
            qps = resolver.rate_limit_qps(),
            "geocode resolver ready"
        );
        Ok(Self::new(
            resolver,
            FootprintGenerator::from_config(config)?,
            CoordinatorSettings::from_config(config),
        )
        .with_telemetry(telemetry))
    }

    pub fn resolver(&self) -> &GeocodeResolver {
        &self.resolver
    }

    /// Registers the job and spawns it on the current tokio runtime; returns
    /// without waiting for any record.
    pub fn submit(&self, records: Vec<VenueRecord>) -> JobId {
        let job_id = new_job_id();
        let handle = Arc::new(JobHandle::new(JobState::new(job_id.clone(), records.len())));
        self.jobs.lock().insert(job_id.clone(), Arc::clone(&handle));
        info!(job_id = %job_id, total = records.len(), "job submitted");
        if let Some(telemetry) = &self.telemetry {
            telemetry.job_submitted(&job_id, records.len());
        }

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run_job(handle, records).await;
        });
        job_id
    }

    pub fn status(&self, job_id: &str) -> AppResult<JobSnapshot> {
        Ok(self.handle(job_id)?.snapshot())
    }

    /// Returns `true` when this call requested cancellation; `false` when the
    /// job already finished or was already cancelled.
    pub fn cancel(&self, job_id: &str) -> AppResult<bool> {
        let handle = self.handle(job_id)?;
        if handle.state.lock().status.is_terminal() {
            return Ok(false);
        }
        let newly = !handle.cancel_requested.swap(true, Ordering::SeqCst);
        if newly {
            info!(job_id, "cancellation requested");
        }
        Ok(newly)
    }

    pub fn subscribe(&self, job_id: &str) -> AppResult<watch::Receiver<JobSnapshot>> {
        Ok(self.handle(job_id)?.updates.subscribe())
    }

    pub async fn wait(&self, job_id: &str) -> AppResult<JobSnapshot> {
        let handle = self.handle(job_id)?;
        let mut updates = handle.updates.subscribe();
        loop {
            {
                let snapshot = updates.borrow_and_update();
                if snapshot.status.is_terminal() {
                    return Ok(snapshot.clone());
                }
            }
            if updates.changed().await.is_err() {
                return Ok(handle.snapshot());
            }
        }
    }

    fn handle(&self, job_id: &str) -> AppResult<Arc<JobHandle>> {
        self.jobs
            .lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| AppError::UnknownJob(job_id.to_string()))
    }

    async fn run_job(&self, handle: Arc<JobHandle>, records: Vec<VenueRecord>) {
        let snapshot = handle.update(|state| state.status = JobStatus::Running);
        let job_id = snapshot.job_id;
        info!(job_id = %job_id, total = snapshot.total_count, "job running");

        let batch = BatchResolver::new(
            self.resolver.clone(),
            BatchThrottle::new(self.settings.throttle_batch_size, self.settings.throttle_pause),
        );
        let halted = Arc::new(AtomicBool::new(false));
        let mut slots: Vec<Option<Vec<Feature>>> = vec![None; records.len()];
        let mut consecutive_outages = 0_usize;
        let mut failure: Option<String> = None;

        let mut outcomes = stream::iter(records.into_iter().enumerate())
            .map(|(index, record)| {
                let batch = batch.clone();
                let footprints = self.footprints.clone();
                let handle = Arc::clone(&handle);
                let halted = Arc::clone(&halted);
                async move {
                    // Cancellation and halts only take effect at record boundaries.
                    if handle.is_cancelled() || halted.load(Ordering::SeqCst) {
                        return (index, RecordOutcome::Skipped);
                    }
                    (index, process_record(&batch, &footprints, &record).await)
                }
            })
            .buffer_unordered(self.settings.concurrency);

        // Drained to the end so in-flight lookups finish; skipped records are no-ops.
        while let Some((index, outcome)) = outcomes.next().await {
            match outcome {
                RecordOutcome::Skipped => continue,
                RecordOutcome::Succeeded(features) => {
                    consecutive_outages = 0;
                    slots[index] = Some(features);
                    handle.update(JobState::record_success);
                }
                RecordOutcome::Failed { error, outage } => {
                    warn!(
                        job_id = %job_id,
                        record_id = %error.record_id,
                        kind = ?error.kind,
                        message = %error.message,
                        "record failed"
                    );
                    consecutive_outages = if outage { consecutive_outages + 1 } else { 0 };
                    handle.update(|state| state.record_failure(error));
                    if consecutive_outages >= self.settings.outage_threshold && failure.is_none() {
                        failure = Some(format!(
                            "providers unreachable for {consecutive_outages} consecutive records"
                        ));
                        halted.store(true, Ordering::SeqCst);
                    }
                }
                RecordOutcome::Systemic(reason) => {
                    if failure.is_none() {
                        failure = Some(reason);
                    }
                    halted.store(true, Ordering::SeqCst);
                }
            }
        }
        drop(outcomes);

        let features = slots.into_iter().flatten().flatten().collect::<Vec<_>>();
        let (processed_count, succeeded_count, total_count) = {
            let state = handle.state.lock();
            (state.processed_count, state.succeeded_count, state.total_count)
        };
        let mut status = if failure.is_some() {
            JobStatus::Failed
        } else if handle.is_cancelled() && processed_count < total_count {
            JobStatus::Cancelled
        } else {
            JobStatus::from_counts(processed_count, succeeded_count)
        };

        let mut output = None;
        if status != JobStatus::Failed {
            let writer =
                FeatureCollectionWriter::for_job(&self.settings.output_dir, &job_id, self.settings.emit_kml);
            match writer.finalize(features) {
                Ok(written) => output = Some(written),
                Err(err) => {
                    status = JobStatus::Failed;
                    failure = Some(format!("failed to write output: {err}"));
                }
            }
        }

        // Waiters are woken only after the terminal telemetry event is queued.
        let snapshot = {
            let mut state = handle.state.lock();
            state.output = output;
            state.failure = failure;
            state.finish(status);
            state.snapshot()
        };
        match &snapshot.failure {
            Some(reason) => error!(job_id = %job_id, %reason, "job failed"),
            None => info!(
                job_id = %job_id,
                status = ?snapshot.status,
                processed = snapshot.processed_count,
                succeeded = snapshot.succeeded_count,
                "job finished"
            ),
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.job_finished(&snapshot);
        }
        handle.updates.send_replace(snapshot);
    }
}

enum RecordOutcome {
    Skipped,
    Succeeded(Vec<Feature>),
    Failed { error: RecordError, outage: bool },
    Systemic(String),
}

async fn process_record(
    batch: &BatchResolver,
    footprints: &FootprintGenerator,
    record: &VenueRecord,
) -> RecordOutcome {
    let address = match record.validate() {
        Ok(address) => address,
        Err(err) => {
            return RecordOutcome::Failed {
                error: RecordError::validation(&record.id, &err),
                outage: false,
            }
        }
    };

    let resolution = match batch.resolve_batch_entry(&address).await {
        Ok(resolution) => resolution,
        Err(err @ (ResolveError::Cache(_) | ResolveError::NoProviders)) => {
            return RecordOutcome::Systemic(err.to_string());
        }
        Err(err) => {
            return RecordOutcome::Failed {
                outage: err.is_transport_outage(),
                error: RecordError::resolution(&record.id, &err),
            }
        }
    };
    debug!(record_id = %record.id, source = ?resolution.source, "record resolved");

    match footprints.footprints(&resolution.coordinate) {
        Ok(polygons) => RecordOutcome::Succeeded(
            polygons
                .iter()
                .map(|(kind, polygon)| {
                    Feature::footprint(record, &address, &resolution.coordinate, *kind, polygon)
                })
                .collect(),
        ),
        Err(err) => RecordOutcome::Failed {
            error: RecordError::geometry(&record.id, err.to_string()),
            outage: false,
        },
    }
}
