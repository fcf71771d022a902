use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::batch::{Batch, MAX_BATCH_SIZE, RequestOptions, batches};
use crate::error::SubmitError;
use crate::progress::ProgressStore;
use crate::scrobble::ScrobbleCandidate;
use crate::service::{BatchReport, Credentials, Outcome, Transport, classify, redacted};

const SCROBBLE_METHOD: &str = "track.scrobble";

/// Clock and sleep, the only suspension point of a run.
pub trait Timer {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimer;

impl Timer for SystemTimer {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<T: Timer + ?Sized> Timer for &mut T {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn sleep(&mut self, duration: Duration) {
        (**self).sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive failures tolerated before holding until UTC midnight.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            max: Duration::from_secs(300),
            max_retries: 6,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given number of consecutive failures (starting at 1).
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub failures: u32,
    pub held: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fatal {
    Authentication { code: u32, message: String },
    Rejected { code: Option<u32>, message: String },
    Exhausted { attempts: u32, message: String },
}

impl From<Fatal> for SubmitError {
    fn from(fatal: Fatal) -> Self {
        match fatal {
            Fatal::Authentication { code, message } => SubmitError::Authentication { code, message },
            Fatal::Rejected { code, message } => SubmitError::Rejected { code, message },
            Fatal::Exhausted { attempts, message } => {
                SubmitError::RetriesExhausted { attempts, message }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Sending,
    Backoff { failures: u32 },
    MidnightHold,
    Checkpointed,
    Fatal(Fatal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: EngineState,
    pub retry: RetryState,
    pub delay: Option<Duration>,
}

/// Next state after a reply to the batch currently being sent.
pub fn transition(
    policy: &BackoffPolicy,
    retry: RetryState,
    outcome: &Outcome,
    now: DateTime<Utc>,
) -> Transition {
    match outcome {
        Outcome::Accepted(_) => Transition {
            state: EngineState::Checkpointed,
            retry: RetryState::default(),
            delay: None,
        },
        Outcome::AuthFailed { code, message } => fatal(
            Fatal::Authentication {
                code: *code,
                message: message.clone(),
            },
            retry,
        ),
        Outcome::Rejected { code, message } => fatal(
            Fatal::Rejected {
                code: *code,
                message: message.clone(),
            },
            retry,
        ),
        Outcome::RateLimited {
            retry_after,
            message,
        } => retry_later(policy, retry, *retry_after, message, now),
        Outcome::Recoverable { message } => retry_later(policy, retry, None, message, now),
    }
}

fn fatal(fatal: Fatal, retry: RetryState) -> Transition {
    Transition {
        state: EngineState::Fatal(fatal),
        retry,
        delay: None,
    }
}

fn retry_later(
    policy: &BackoffPolicy,
    retry: RetryState,
    retry_after: Option<Duration>,
    message: &str,
    now: DateTime<Utc>,
) -> Transition {
    let failures = retry.failures.saturating_add(1);
    if retry.held {
        return fatal(
            Fatal::Exhausted {
                attempts: failures,
                message: message.to_string(),
            },
            RetryState { failures, ..retry },
        );
    }
    if failures > policy.max_retries {
        return Transition {
            state: EngineState::MidnightHold,
            retry: RetryState {
                failures,
                held: true,
            },
            delay: Some(until_next_utc_midnight(now)),
        };
    }
    Transition {
        state: EngineState::Backoff { failures },
        retry: RetryState {
            failures,
            held: false,
        },
        delay: Some(retry_after.unwrap_or_else(|| policy.delay(failures))),
    }
}

/// The service resets its daily counters at UTC midnight.
pub fn until_next_utc_midnight(now: DateTime<Utc>) -> Duration {
    let next = now
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc());
    next.and_then(|next| (next - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub policy: BackoffPolicy,
    pub batch_size: usize,
    /// Pause between consecutive batches.
    pub pause: Duration,
    pub request: RequestOptions,
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: BackoffPolicy::default(),
            batch_size: MAX_BATCH_SIZE,
            pause: Duration::from_millis(500),
            request: RequestOptions::default(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub batches: usize,
    pub submitted: usize,
    pub accepted: u64,
    /// Ignored scrobbles per service reason code.
    pub ignored: BTreeMap<u32, usize>,
    pub offset: usize,
    pub dry_run: bool,
}

impl RunReport {
    pub fn ignored_total(&self) -> usize {
        self.ignored.values().sum()
    }

    fn record(&mut self, batch: &Batch<'_>, report: &BatchReport) {
        self.batches += 1;
        self.submitted += batch.items.len();
        self.accepted += u64::from(report.accepted);
        for ignored in &report.ignored {
            *self.ignored.entry(ignored.code).or_default() += 1;
        }
        self.offset = batch.end();
    }
}

/// Sends batches one at a time, backing off on rate limits and recording
/// progress only after the service acknowledged a batch.
pub struct SubmissionEngine<T, C> {
    credentials: Credentials,
    transport: T,
    timer: C,
    config: EngineConfig,
    progress: Option<ProgressStore>,
    state: EngineState,
}

impl<T: Transport, C: Timer> SubmissionEngine<T, C> {
    pub fn new(credentials: Credentials, transport: T, timer: C, config: EngineConfig) -> Self {
        Self {
            credentials,
            transport,
            timer,
            config,
            progress: None,
            state: EngineState::Idle,
        }
    }

    pub fn with_progress(mut self, progress: ProgressStore) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn run(&mut self, candidates: &[ScrobbleCandidate]) -> Result<RunReport, SubmitError> {
        let total = candidates.len();
        let mut offset = self.progress.as_ref().map_or(0, ProgressStore::load);
        if offset > total {
            warn!("Stored offset {offset} exceeds {total} candidates, nothing left to resume");
            offset = total;
        }
        if offset > 0 {
            info!("Resuming after {offset} of {total} scrobbles");
        }
        let mut report = RunReport {
            offset,
            dry_run: self.config.dry_run,
            ..RunReport::default()
        };

        for (index, batch) in batches(candidates, offset, self.config.batch_size).enumerate() {
            if index > 0 && !self.config.dry_run && !self.config.pause.is_zero() {
                self.timer.sleep(self.config.pause);
            }
            let params = self
                .credentials
                .sign_request(SCROBBLE_METHOD, batch.params(self.config.request));
            debug!("Request params: {:?}", redacted(&params));

            if self.config.dry_run {
                info!(
                    "Would submit scrobbles {}-{} of {total}",
                    batch.start + 1,
                    batch.end()
                );
                report.record(&batch, &BatchReport::default());
                continue;
            }

            info!(
                "Submitting scrobbles {}-{} of {total}",
                batch.start + 1,
                batch.end()
            );
            let batch_report = self.submit(&params, batch.items.len())?;
            self.checkpoint(&batch)?;
            for ignored in &batch_report.ignored {
                if let Some(candidate) = batch.items.get(ignored.index) {
                    warn!(
                        "Ignored {} - {} (code {}): {}",
                        candidate.record.artist,
                        candidate.record.track,
                        ignored.code,
                        ignored.message
                    );
                }
            }
            report.record(&batch, &batch_report);
            self.set_state(EngineState::Idle);
        }
        Ok(report)
    }

    fn submit(
        &mut self,
        params: &[(String, String)],
        submitted: usize,
    ) -> Result<BatchReport, SubmitError> {
        let mut retry = RetryState::default();
        loop {
            self.set_state(EngineState::Sending);
            let outcome = match self.transport.post(params) {
                Ok(reply) => classify(&reply, submitted, self.timer.now()),
                Err(err) => Outcome::Recoverable {
                    message: format!("{err:#}"),
                },
            };
            let step = transition(&self.config.policy, retry, &outcome, self.timer.now());
            match (step.state, outcome) {
                (EngineState::Checkpointed, Outcome::Accepted(report)) => return Ok(report),
                (EngineState::Fatal(fatal), _) => {
                    self.set_state(EngineState::Fatal(fatal.clone()));
                    return Err(fatal.into());
                }
                (state, outcome) => {
                    let delay = step.delay.unwrap_or_default();
                    match &state {
                        EngineState::MidnightHold => warn!(
                            "{}; holding until UTC midnight ({}s)",
                            outcome.message(),
                            delay.as_secs()
                        ),
                        _ => warn!(
                            "{}; retrying in {}s (attempt {})",
                            outcome.message(),
                            delay.as_secs(),
                            step.retry.failures + 1
                        ),
                    }
                    self.set_state(state);
                    retry = step.retry;
                    self.timer.sleep(delay);
                }
            }
        }
    }

    fn checkpoint(&mut self, batch: &Batch<'_>) -> Result<(), SubmitError> {
        if let Some(progress) = &self.progress {
            progress
                .save(batch.end(), batch.last_timestamp().unwrap_or_default())
                .map_err(SubmitError::Checkpoint)?;
        }
        self.set_state(EngineState::Checkpointed);
        Ok(())
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            debug!("Engine state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}
