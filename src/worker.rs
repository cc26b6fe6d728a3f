use crate::auth::{authenticate, AuthBudget, AuthOutcome, Credentials};
use crate::browser::{memory_pressure, PageError, ProfileService, ProfileSession};
use crate::filter::{partition, TickQueues};
use crate::lock::LockManager;
use crate::notify::Notifier;
use crate::outcome::{AttemptOutcome, FailureKind, Intent};
use crate::rows::{ProfileDirectory, TaskLayout, TaskRow};
use crate::settings::{KeeperConfig, SettingsStore, TickSettings};
use crate::sheets::{SheetTransport, SheetsClient};
use crate::timefmt;
use crate::workflow::{self, MembershipState, WorkflowTuning};
use crate::writer::ResultWriter;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use futures::{stream, StreamExt};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Runs one attempt against one row. The worker loop only sees this seam;
/// tests substitute a scripted runner for the browser-backed one.
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    async fn run(
        &self,
        row: &TaskRow,
        profile_id: &str,
        intent: Intent,
        settings: &TickSettings,
        today: NaiveDate,
    ) -> AttemptOutcome;

    /// Fresh-session verification for a row found already in its target
    /// state. At most one re-check per attempt, outside the retry cap.
    async fn recheck(
        &self,
        row: &TaskRow,
        profile_id: &str,
        intent: Intent,
        settings: &TickSettings,
        today: NaiveDate,
    ) -> AttemptOutcome;

    /// Login-mode probe: authenticate and report, touch nothing.
    async fn login(&self, row: &TaskRow, profile_id: &str) -> AuthOutcome;
}

/// Browser-backed runner: one profile session per call, torn down on
/// every exit path.
pub struct BrowserRunner {
    service: ProfileService,
    auth_budget: AuthBudget,
    memory_ceiling_mb: u64,
}

impl BrowserRunner {
    pub fn new(service: ProfileService, memory_ceiling_mb: u64) -> Self {
        Self {
            service,
            auth_budget: AuthBudget::default(),
            memory_ceiling_mb,
        }
    }

    fn page_outcome(err: PageError) -> AttemptOutcome {
        match err {
            PageError::SessionLost(d) => AttemptOutcome::failed(FailureKind::SessionLost, d),
            PageError::Browser(d) => AttemptOutcome::failed(FailureKind::BrowserError, d),
        }
    }
}

#[async_trait]
impl AttemptRunner for BrowserRunner {
    async fn run(
        &self,
        row: &TaskRow,
        profile_id: &str,
        intent: Intent,
        settings: &TickSettings,
        today: NaiveDate,
    ) -> AttemptOutcome {
        if memory_pressure(self.memory_ceiling_mb) {
            tracing::warn!("memory ceiling reached; this attempt should be the last before recycle");
        }
        let session = match ProfileSession::open(&self.service, profile_id).await {
            Ok(s) => s,
            Err(err) => return Self::page_outcome(err),
        };
        let tuning = WorkflowTuning::with_samples(settings.max_retries);
        let outcome = workflow::run_attempt(
            session.page(),
            row,
            intent,
            &self.auth_budget,
            &tuning,
            today,
        )
        .await;
        session.close(&self.service).await;
        outcome
    }

    async fn recheck(
        &self,
        row: &TaskRow,
        profile_id: &str,
        intent: Intent,
        settings: &TickSettings,
        today: NaiveDate,
    ) -> AttemptOutcome {
        let session = match ProfileSession::open(&self.service, profile_id).await {
            Ok(s) => s,
            Err(err) => return Self::page_outcome(err),
        };
        let creds = Credentials {
            email: &row.email,
            password: &row.password,
            recovery_email: &row.recovery_email,
            totp_secret: &row.totp_secret,
        };
        let tuning = WorkflowTuning::with_samples(settings.max_retries);

        let outcome = match authenticate(session.page(), creds, &self.auth_budget).await {
            AuthOutcome::Failed { kind, detail } => AttemptOutcome::Failed { kind, detail },
            AuthOutcome::LoggedIn { .. } => {
                match workflow::detect_state(session.page(), &tuning, today).await {
                    Err(err) => Self::page_outcome(err),
                    Ok(detection) => {
                        let target = match intent {
                            Intent::Pause => MembershipState::Paused,
                            Intent::Resume => MembershipState::Active,
                        };
                        if detection.state == target {
                            AttemptOutcome::Success {
                                intent,
                                next_billing: detection.billing,
                                rechecked: true,
                            }
                        } else {
                            AttemptOutcome::failed(
                                FailureKind::StateUncertain,
                                "re-check disagreed with first read",
                            )
                        }
                    }
                }
            }
        };
        session.close(&self.service).await;
        outcome
    }

    async fn login(&self, row: &TaskRow, profile_id: &str) -> AuthOutcome {
        let session = match ProfileSession::open(&self.service, profile_id).await {
            Ok(s) => s,
            Err(err) => {
                let (kind, detail) = match err {
                    PageError::SessionLost(d) => (FailureKind::SessionLost, d),
                    PageError::Browser(d) => (FailureKind::BrowserError, d),
                };
                return AuthOutcome::Failed { kind, detail };
            }
        };
        let creds = Credentials {
            email: &row.email,
            password: &row.password,
            recovery_email: &row.recovery_email,
            totp_secret: &row.totp_secret,
        };
        let outcome = authenticate(session.page(), creds, &self.auth_budget).await;
        session.close(&self.service).await;
        outcome
    }
}

#[derive(Debug, Default)]
struct AtomicTickStats {
    eligible: AtomicUsize,
    claimed: AtomicUsize,
    lock_skipped: AtomicUsize,
    profile_skipped: AtomicUsize,
    succeeded: AtomicUsize,
    retried: AtomicUsize,
    terminal: AtomicUsize,
    payment_pending: AtomicUsize,
    gave_up: AtomicUsize,
    panicked: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub eligible: usize,
    pub claimed: usize,
    pub lock_skipped: usize,
    pub profile_skipped: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub terminal: usize,
    pub payment_pending: usize,
    pub gave_up: usize,
    pub panicked: usize,
}

impl AtomicTickStats {
    fn snapshot(&self) -> TickStats {
        TickStats {
            eligible: self.eligible.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            lock_skipped: self.lock_skipped.load(Ordering::Relaxed),
            profile_skipped: self.profile_skipped.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            terminal: self.terminal.load(Ordering::Relaxed),
            payment_pending: self.payment_pending.load(Ordering::Relaxed),
            gave_up: self.gave_up.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowJob {
    Attempt(Intent),
    /// Payment retries exhausted their horizon; commit the terminal
    /// result without opening a browser.
    PaymentGiveUp,
}

/// The outermost driver: tick -> settings -> rows -> filter -> for each
/// due row { lock, run, write, unlock } -> sleep.
pub struct Worker<T, R> {
    cfg: Arc<KeeperConfig>,
    client: Arc<SheetsClient<T>>,
    settings_store: SettingsStore,
    writer: Arc<ResultWriter>,
    notifier: Arc<Notifier>,
    runner: Arc<R>,
    shutdown: watch::Receiver<bool>,
    slot_counter: Arc<AtomicUsize>,
}

fn now_in(zone: Tz) -> DateTime<Tz> {
    chrono::Utc::now().with_timezone(&zone)
}

impl<T, R> Worker<T, R>
where
    T: SheetTransport + 'static,
    R: AttemptRunner + 'static,
{
    pub fn new(
        cfg: Arc<KeeperConfig>,
        client: Arc<SheetsClient<T>>,
        runner: Arc<R>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let settings_store = SettingsStore::new(cfg.config_tab.clone());
        let writer = Arc::new(ResultWriter::new(cfg.task_tab.clone()));
        let notifier = Arc::new(Notifier::new(cfg.webhook_url.clone()));
        Self {
            cfg,
            client,
            settings_store,
            writer,
            notifier,
            runner,
            shutdown,
            slot_counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn run(&mut self) -> eyre::Result<()> {
        loop {
            if *self.shutdown.borrow() {
                tracing::info!("shutdown requested; exiting loop");
                break;
            }

            let interval = match self.run_tick().await {
                Ok((stats, interval)) => {
                    tracing::info!(?stats, "tick complete");
                    interval
                }
                Err(err) => {
                    tracing::warn!(error = %err, "tick failed; will retry next interval");
                    TickSettings::default().tick_interval
                }
            };

            if self.cfg.once {
                break;
            }

            // Interruptible sleep: a shutdown signal ends the wait early.
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        Ok(())
    }

    pub async fn run_tick(&mut self) -> eyre::Result<(TickStats, std::time::Duration)> {
        let settings = self.settings_store.load(self.client.as_ref()).await;
        let interval = settings.tick_interval;

        let task_data = self
            .client
            .read_records(&self.cfg.task_tab)
            .await
            .map_err(|e| eyre::eyre!("task tab read failed: {e}"))?;
        let layout = Arc::new(TaskLayout::from_headers(&task_data.headers)?);
        let rows: Vec<TaskRow> = task_data
            .records
            .iter()
            .map(|rec| TaskRow::from_record(rec, self.cfg.zone))
            .collect();

        let mapping_data = self
            .client
            .read_records(&self.cfg.mapping_tab)
            .await
            .map_err(|e| eyre::eyre!("mapping tab read failed: {e}"))?;
        let directory = Arc::new(ProfileDirectory::from_records(&mapping_data.records));

        let now = now_in(self.cfg.zone);
        let queues = partition(rows, now, &settings, self.cfg.zone);

        let stats = Arc::new(AtomicTickStats::default());
        if queues.is_empty() {
            tracing::debug!(profiles = directory.len(), "no rows eligible this tick");
            return Ok((stats.snapshot(), interval));
        }
        let jobs = order_jobs(queues);
        stats.eligible.store(jobs.len(), Ordering::Relaxed);

        if self.cfg.dry_run {
            for (row, job) in &jobs {
                tracing::info!(row = row.row, email = %row.email, ?job, "DRY RUN: would process");
            }
            return Ok((stats.snapshot(), interval));
        }

        // Payment-retry rows run first (time-sensitive, cheap to give up
        // on), then resumes (a missed resume is a visible service
        // interruption), then pauses. Within the stream a bounded pool
        // may overlap attempts; the in-flight set keeps two slots off the
        // same browser profile.
        let in_flight: Arc<Mutex<BTreeSet<String>>> = Arc::new(Mutex::new(BTreeSet::new()));
        let settings = Arc::new(settings);

        stream::iter(jobs)
            .for_each_concurrent(self.cfg.pool_size, |(row, job)| {
                let cfg = self.cfg.clone();
                let client = self.client.clone();
                let writer = self.writer.clone();
                let notifier = self.notifier.clone();
                let runner = self.runner.clone();
                let layout = layout.clone();
                let directory = directory.clone();
                let settings = settings.clone();
                let stats = stats.clone();
                let in_flight = in_flight.clone();
                let shutdown = self.shutdown.clone();
                let slot = self.slot_counter.fetch_add(1, Ordering::Relaxed) % cfg.pool_size;

                async move {
                    if *shutdown.borrow() {
                        return;
                    }

                    let profile_id = directory
                        .lookup(&row.email)
                        .map(|m| m.profile_id.clone());

                    if let Some(id) = &profile_id {
                        let mut guard = in_flight.lock().await;
                        if !guard.insert(id.clone()) {
                            stats.profile_skipped.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                row = row.row,
                                profile = %id,
                                "profile already in flight; skipping row this tick"
                            );
                            return;
                        }
                    }

                    // Panic containment: one row's failure never takes
                    // the loop down. The spawned task owns its data.
                    let row_number = row.row;
                    let task = tokio::spawn(process_one(
                        cfg.clone(),
                        client.clone(),
                        writer,
                        notifier,
                        runner,
                        layout.clone(),
                        settings,
                        stats.clone(),
                        row,
                        job,
                        profile_id.clone(),
                        slot,
                    ));
                    if let Err(err) = task.await {
                        if err.is_panic() {
                            stats.panicked.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(error = %err, "row attempt panicked; continuing");
                            // Best-effort release of whatever the dead
                            // task may have claimed; TTL covers the rest.
                            let lock = LockManager::new(
                                cfg.task_tab.clone(),
                                cfg.slot_worker_id(slot),
                                cfg.zone,
                            );
                            lock.release(&client, &layout, row_number).await;
                        }
                    }

                    if let Some(id) = &profile_id {
                        in_flight.lock().await.remove(id);
                    }
                }
            })
            .await;

        Ok((stats.snapshot(), interval))
    }
}

fn order_jobs(queues: TickQueues) -> Vec<(TaskRow, RowJob)> {
    let TickQueues {
        payment_retry,
        resume,
        pause,
        payment_expired,
    } = queues;

    let mut jobs = Vec::new();
    for row in payment_expired {
        jobs.push((row, RowJob::PaymentGiveUp));
    }
    for row in payment_retry {
        jobs.push((row, RowJob::Attempt(Intent::Pause)));
    }
    for row in resume {
        jobs.push((row, RowJob::Attempt(Intent::Resume)));
    }
    for row in pause {
        jobs.push((row, RowJob::Attempt(Intent::Pause)));
    }
    jobs
}

#[allow(clippy::too_many_arguments)]
async fn process_one<T: SheetTransport, R: AttemptRunner>(
    cfg: Arc<KeeperConfig>,
    client: Arc<SheetsClient<T>>,
    writer: Arc<ResultWriter>,
    notifier: Arc<Notifier>,
    runner: Arc<R>,
    layout: Arc<TaskLayout>,
    settings: Arc<TickSettings>,
    stats: Arc<AtomicTickStats>,
    row: TaskRow,
    job: RowJob,
    profile_id: Option<String>,
    slot: usize,
) {
    let lock = LockManager::new(
        cfg.task_tab.clone(),
        cfg.slot_worker_id(slot),
        cfg.zone,
    );
    let now = now_in(cfg.zone);

    match lock
        .claim(&client, &layout, row.row, settings.lock_ttl, now)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            stats.lock_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        Err(err) => {
            stats.lock_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(row = row.row, error = %err, "lock claim errored; skipping row");
            return;
        }
    }
    stats.claimed.fetch_add(1, Ordering::Relaxed);

    let today = now.date_naive();
    let outcome = match job {
        RowJob::PaymentGiveUp => AttemptOutcome::failed(FailureKind::PaymentDelayExceeded, ""),
        RowJob::Attempt(intent) => match &profile_id {
            None => AttemptOutcome::failed(
                FailureKind::BrowserError,
                format!("no profile mapping for {}", row.email),
            ),
            Some(id) if cfg.login_mode => {
                let result = runner.login(&row, id).await;
                commit_login_probe(&client, &cfg, &layout, &lock, &row, result, now).await;
                return;
            }
            Some(id) => {
                let first = runner.run(&row, id, intent, &settings, today).await;
                match first {
                    AttemptOutcome::AlreadyInTarget { intent } => {
                        tracing::info!(
                            row = row.row,
                            intent = intent.verb(),
                            "row already in target state; verifying with a fresh session"
                        );
                        runner.recheck(&row, id, intent, &settings, today).await
                    }
                    other => other,
                }
            }
        },
    };

    match &outcome {
        AttemptOutcome::Success { .. } => stats.succeeded.fetch_add(1, Ordering::Relaxed),
        AttemptOutcome::PaymentPending => stats.payment_pending.fetch_add(1, Ordering::Relaxed),
        AttemptOutcome::Failed { kind, .. } => match kind {
            FailureKind::PaymentDelayExceeded => stats.gave_up.fetch_add(1, Ordering::Relaxed),
            k if k.class() == crate::outcome::FailureClass::Terminal => {
                stats.terminal.fetch_add(1, Ordering::Relaxed)
            }
            _ => stats.retried.fetch_add(1, Ordering::Relaxed),
        },
        AttemptOutcome::AlreadyInTarget { .. } => stats.retried.fetch_add(1, Ordering::Relaxed),
    };

    // The commit batch clears the lock cell; an explicit release only
    // happens when the commit itself could not be written.
    let commit_now = now_in(cfg.zone);
    if let Err(err) = writer
        .commit(
            &client, &layout, &row, &outcome, &settings, &notifier, commit_now,
        )
        .await
    {
        tracing::warn!(row = row.row, error = %err, "result commit failed; releasing lock");
        lock.release(&client, &layout, row.row).await;
    }
}

/// Login-mode result: only the result text and the lock cell change.
async fn commit_login_probe<T: SheetTransport>(
    client: &SheetsClient<T>,
    cfg: &KeeperConfig,
    layout: &TaskLayout,
    lock: &LockManager,
    row: &TaskRow,
    result: AuthOutcome,
    now: DateTime<Tz>,
) {
    let stamp = timefmt::short_stamp(&now);
    let text = match result {
        AuthOutcome::LoggedIn { premium: true } => format!("login ok (premium) {stamp}"),
        AuthOutcome::LoggedIn { premium: false } => format!("login ok {stamp}"),
        AuthOutcome::Failed { kind, detail } => {
            format!("login failed: {} {stamp}: {detail}", kind.tag())
        }
    };
    let updates = vec![
        (
            layout.a1(crate::rows::Field::ResultText, row.row),
            text,
        ),
        (layout.a1(crate::rows::Field::LockValue, row.row), String::new()),
    ];
    if let Err(err) = client.write_batch(&cfg.task_tab, &updates).await {
        tracing::warn!(row = row.row, error = %err, "login probe commit failed");
        lock.release(client, layout, row.row).await;
    }
}
