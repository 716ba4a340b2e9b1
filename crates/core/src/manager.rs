//! Scan job orchestration.
//!
//! [`ScanManager`] owns the job registry. Every transition of a job goes
//! through the registry lock, which also makes "is anything active?" plus
//! "insert the new job" one atomic step. Each started job runs on its own
//! task: build the command, run `czkawka_cli`, relay its stderr as progress,
//! then normalize and persist the outcome.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::build_args;
use crate::config::ManagerConfig;
use crate::db::SqliteScanStore;
use crate::error::{Error, Result};
use crate::models::{ScanJob, ScanRequest, ScanResults, ScanStatus, ScanType};
use crate::normalize::{normalize, RawOutput};
use crate::relay::{ProgressRelay, ProgressSubscription};
use crate::runner::{ProcessExit, ProcessHandle, ProcessRunner};

pub const INTERRUPTED_ERROR: &str = "scan interrupted by a server restart";

static FILES_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*files?\b").expect("valid files regex"));

/// Cloneable handle to the orchestrator.
#[derive(Clone)]
pub struct ScanManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ManagerConfig,
    store: SqliteScanStore,
    relay: ProgressRelay,
    runner: ProcessRunner,
    registry: Mutex<HashMap<String, JobEntry>>,
}

struct JobEntry {
    job: ScanJob,
    process: Option<ProcessHandle>,
}

enum Outcome {
    Completed(ScanResults),
    Failed(String),
    /// The job left `running` elsewhere (cancelled) and must not be touched.
    Skipped,
}

impl fmt::Debug for ScanManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracked = self.inner.registry.try_lock().ok().map(|jobs| jobs.len());
        f.debug_struct("ScanManager")
            .field("czkawka_bin", &self.inner.config.czkawka_bin)
            .field("tracked_scans", &tracked)
            .finish()
    }
}

impl ScanManager {
    /// Loads every persisted scan into the registry.
    ///
    /// Records left `pending` or `running` by a previous process have no live
    /// subprocess any more; they are marked failed with [`INTERRUPTED_ERROR`].
    pub fn open(config: ManagerConfig, store: SqliteScanStore) -> Result<Self> {
        let mut jobs = HashMap::new();
        for mut job in store.load_all()? {
            if !job.status.is_terminal() {
                warn!(scan_id = %job.id, status = job.status.as_str(), "reconciling orphaned scan");
                let now = Utc::now();
                job.status = ScanStatus::Failed;
                job.error = Some(INTERRUPTED_ERROR.to_string());
                job.completed_at = Some(now);
                if let Some(started) = job.started_at {
                    job.progress.elapsed_seconds = elapsed_seconds(started, now);
                }
                store.save(&job)?;
            }
            jobs.insert(job.id.clone(), JobEntry { job, process: None });
        }
        info!(scans = jobs.len(), "scan history loaded");

        Ok(Self {
            inner: Arc::new(ManagerInner {
                relay: ProgressRelay::new(config.heartbeat_interval),
                runner: ProcessRunner::new(config.cancel_grace),
                config,
                store,
                registry: Mutex::new(jobs),
            }),
        })
    }

    /// Registers a pending scan and starts it in the background.
    ///
    /// Fails with [`Error::Conflict`] while another scan is pending or running.
    pub async fn start_scan(&self, request: ScanRequest) -> Result<ScanJob> {
        request.validate()?;

        let job = {
            let mut jobs = self.inner.registry.lock().await;
            if let Some(active) = jobs.values().find(|entry| !entry.job.status.is_terminal()) {
                return Err(Error::Conflict(format!(
                    "scan {} is already {}; wait for it or cancel it first",
                    active.job.id,
                    active.job.status.as_str()
                )));
            }
            let job = ScanJob::pending(Uuid::new_v4().simple().to_string(), request);
            self.inner.store.save(&job)?;
            self.inner.relay.open(&job.id);
            jobs.insert(
                job.id.clone(),
                JobEntry {
                    job: job.clone(),
                    process: None,
                },
            );
            job
        };
        info!(scan_id = %job.id, scan_type = job.scan_type.as_str(), "scan queued");

        let manager = self.clone();
        let scan_id = job.id.clone();
        tokio::spawn(async move { manager.supervise(scan_id).await });

        Ok(job)
    }

    pub async fn get_scan(&self, scan_id: &str) -> Result<ScanJob> {
        let jobs = self.inner.registry.lock().await;
        jobs.get(scan_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| not_found(scan_id))
    }

    /// All tracked scans, most recently created first.
    pub async fn list_scans(&self) -> Vec<ScanJob> {
        let jobs = self.inner.registry.lock().await;
        let mut list: Vec<ScanJob> = jobs.values().map(|entry| entry.job.clone()).collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Cancels a pending or running scan; terminal scans are returned unchanged.
    ///
    /// A live subprocess is terminated (SIGTERM, then kill after the grace
    /// period) before this returns.
    pub async fn cancel_scan(&self, scan_id: &str) -> Result<ScanJob> {
        let (job, process) = {
            let mut jobs = self.inner.registry.lock().await;
            let entry = jobs.get_mut(scan_id).ok_or_else(|| not_found(scan_id))?;
            if entry.job.status.is_terminal() {
                debug!(scan_id, status = entry.job.status.as_str(), "cancel on finished scan ignored");
                return Ok(entry.job.clone());
            }

            let now = Utc::now();
            entry.job.status = ScanStatus::Cancelled;
            entry.job.completed_at = Some(now);
            if let Some(started) = entry.job.started_at {
                entry.job.progress.elapsed_seconds = elapsed_seconds(started, now);
            }
            if let Err(err) = self.inner.store.save(&entry.job) {
                error!(scan_id, error = %err, "failed to persist cancelled scan");
            }
            self.inner.relay.finish(scan_id, ScanStatus::Cancelled);
            (entry.job.clone(), entry.process.take())
        };

        if let Some(process) = process {
            process.terminate().await;
        }
        info!(scan_id, "scan cancelled");
        Ok(job)
    }

    pub async fn subscribe_progress(&self, scan_id: &str) -> Result<ProgressSubscription> {
        let jobs = self.inner.registry.lock().await;
        let entry = jobs.get(scan_id).ok_or_else(|| not_found(scan_id))?;
        let terminal = Some(entry.job.status).filter(|status| status.is_terminal());
        let subscription = self.inner.relay.subscribe(scan_id, terminal);
        debug!(scan_id, subscribers = self.inner.relay.subscriber_count(scan_id), "progress subscriber joined");
        Ok(subscription)
    }

    pub fn unsubscribe_progress(&self, subscription: ProgressSubscription) {
        let scan_id = subscription.scan_id().to_string();
        drop(subscription);
        debug!(
            scan_id = %scan_id,
            subscribers = self.inner.relay.subscriber_count(&scan_id),
            "progress subscriber left"
        );
    }

    fn results_path(&self, scan_id: &str) -> PathBuf {
        self.inner
            .config
            .results_dir
            .join(format!("czkawka-web-{scan_id}.json"))
    }

    /// Runs the job on a child task so that even a panic ends in a terminal state.
    async fn supervise(self, scan_id: String) {
        let worker = {
            let manager = self.clone();
            let scan_id = scan_id.clone();
            tokio::spawn(async move { manager.execute(&scan_id).await })
        };
        let outcome = match worker.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => Outcome::Failed(err.to_string()),
            Err(err) => Outcome::Failed(format!("scan task aborted: {err}")),
        };
        self.finalize(&scan_id, outcome).await;
    }

    async fn execute(&self, scan_id: &str) -> Result<Outcome> {
        let job = {
            let mut jobs = self.inner.registry.lock().await;
            let Some(entry) = jobs.get_mut(scan_id) else {
                return Ok(Outcome::Skipped);
            };
            if entry.job.status != ScanStatus::Pending {
                // Cancelled before the task got to run; no process is spawned.
                return Ok(Outcome::Skipped);
            }
            entry.job.status = ScanStatus::Running;
            entry.job.started_at = Some(Utc::now());
            self.inner.store.save(&entry.job)?;
            entry.job.clone()
        };
        info!(scan_id, scan_type = job.scan_type.as_str(), "scan running");

        let started = Instant::now();
        let results_file = self.results_path(scan_id);
        let args = build_args(&job, &results_file);
        let mut process = self.inner.runner.spawn(&self.inner.config.czkawka_bin, &args)?;

        let registered = {
            let mut jobs = self.inner.registry.lock().await;
            match jobs.get_mut(scan_id) {
                Some(entry) if entry.job.status == ScanStatus::Running => {
                    entry.process = Some(process.handle());
                    true
                }
                _ => false,
            }
        };
        if !registered {
            process.handle().terminate().await;
            return Ok(Outcome::Skipped);
        }

        while let Some(line) = process.next_stderr_line().await {
            self.record_progress(scan_id, line, started.elapsed()).await;
        }
        let exit = process.wait().await?;

        if self.status_of(scan_id).await != Some(ScanStatus::Running) {
            return Ok(Outcome::Skipped);
        }
        judge_outcome(job.scan_type, &results_file, exit).await
    }

    async fn record_progress(&self, scan_id: &str, line: String, elapsed: Duration) {
        let mut jobs = self.inner.registry.lock().await;
        let Some(entry) = jobs.get_mut(scan_id) else {
            return;
        };
        if entry.job.status != ScanStatus::Running {
            return;
        }
        let progress = &mut entry.job.progress;
        if let Some(count) = FILES_COUNT
            .captures(&line)
            .and_then(|caps| caps[1].parse::<u64>().ok())
        {
            progress.files_processed = count;
        }
        progress.current_stage = line;
        progress.elapsed_seconds = round_tenths(elapsed.as_secs_f64());
        debug!(scan_id, stage = %progress.current_stage, files = progress.files_processed, "scan progress");
        self.inner.relay.publish(scan_id, progress);
    }

    async fn status_of(&self, scan_id: &str) -> Option<ScanStatus> {
        let jobs = self.inner.registry.lock().await;
        jobs.get(scan_id).map(|entry| entry.job.status)
    }

    async fn finalize(&self, scan_id: &str, outcome: Outcome) {
        {
            let mut jobs = self.inner.registry.lock().await;
            if let Some(entry) = jobs.get_mut(scan_id) {
                entry.process = None;
                if !entry.job.status.is_terminal() {
                    let now = Utc::now();
                    match outcome {
                        Outcome::Completed(results) => {
                            entry.job.set_results(results);
                            entry.job.status = ScanStatus::Completed;
                        }
                        Outcome::Failed(message) => {
                            error!(scan_id, error = %message, "scan failed");
                            entry.job.status = ScanStatus::Failed;
                            entry.job.error = Some(message);
                        }
                        Outcome::Skipped => {
                            entry.job.status = ScanStatus::Failed;
                            entry.job.error = Some("scan stopped unexpectedly".to_string());
                        }
                    }
                    entry.job.completed_at = Some(now);
                    if let Some(started) = entry.job.started_at {
                        entry.job.progress.elapsed_seconds = elapsed_seconds(started, now);
                    }
                    if let Err(err) = self.inner.store.save(&entry.job) {
                        error!(scan_id, error = %err, "failed to persist finished scan");
                    }
                    self.inner.relay.finish(scan_id, entry.job.status);
                    info!(
                        scan_id,
                        status = entry.job.status.as_str(),
                        findings = entry.job.findings_count,
                        total_size = entry.job.total_size,
                        "scan finished"
                    );
                }
            }
        }
        remove_results_file(&self.results_path(scan_id)).await;
    }
}

/// A results file means the tool finished, whatever its exit code says.
async fn judge_outcome(scan_type: ScanType, results_file: &Path, exit: ProcessExit) -> Result<Outcome> {
    match tokio::fs::read(results_file).await {
        Ok(bytes) => {
            let raw = match RawOutput::parse(&String::from_utf8_lossy(&bytes)) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(path = %results_file.display(), error = %err, "unparsable results file, treating as empty");
                    RawOutput::Absent
                }
            };
            if exit.code != Some(0) {
                debug!(code = ?exit.code, "results file present, ignoring exit code");
            }
            return Ok(Outcome::Completed(normalize(scan_type, raw)));
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    Ok(match exit.code {
        Some(0) => Outcome::Completed(normalize(
            scan_type,
            RawOutput::from_stdout(&exit.stdout, scan_type),
        )),
        Some(code) => Outcome::Failed(format!("czkawka_cli exited with code {code}")),
        None => Outcome::Failed("czkawka_cli was terminated by a signal".to_string()),
    })
}

async fn remove_results_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed results file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove results file"),
    }
}

fn not_found(scan_id: &str) -> Error {
    Error::NotFound(format!("scan {scan_id}"))
}

fn elapsed_seconds(started: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let millis = (now - started).num_milliseconds().max(0);
    round_tenths(millis as f64 / 1000.0)
}

fn round_tenths(secs: f64) -> f64 {
    (secs * 10.0).round() / 10.0
}
