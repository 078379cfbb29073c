//! External-call adapter
//!
//! The interpreter never talks to remote executors directly. Every remote
//! step goes through an [`Adapter`], which applies the configured timeout and
//! retry policy, honours cancellation between attempts, and journals the
//! final outcome so a replayed run receives the recorded result instead of
//! repeating the call. The adapter also owns the durable wait primitive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::{ErrorSummary, JournalError, JournalResult, StepError};
use super::instance::{BlockId, BlockResult, InstanceId, RunOutcome, WorkflowDefinition};
use super::journal::{Journal, JournalEntry};

/// Remote executors invoked by an interpreter instance.
///
/// Implementations perform the actual remote work (HTTP, queues, ...); the
/// adapter wraps every call with timeouts, retries, and journaling.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Fetch the block definition of an instance
    async fn fetch_definition(
        &self,
        instance_id: &InstanceId,
    ) -> Result<WorkflowDefinition, StepError>;

    /// Execute one block
    async fn execute_block(
        &self,
        instance_id: &InstanceId,
        block: BlockId,
    ) -> Result<BlockResult, StepError>;

    /// Announce that a run started
    async fn notify_started(
        &self,
        instance_id: &InstanceId,
        at: DateTime<Utc>,
    ) -> Result<(), StepError>;

    /// Announce that a run paused
    async fn notify_paused(
        &self,
        instance_id: &InstanceId,
        at: DateTime<Utc>,
        payload: Option<&Value>,
    ) -> Result<(), StepError>;

    /// Announce that a run resumed
    async fn notify_resumed(
        &self,
        _instance_id: &InstanceId,
        _at: DateTime<Utc>,
        _payload: Option<&Value>,
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// Announce that a run ended, with its result or error summary
    async fn notify_ended(
        &self,
        instance_id: &InstanceId,
        at: DateTime<Utc>,
        result: Option<&Value>,
        error: Option<&ErrorSummary>,
    ) -> Result<(), StepError>;
}

/// Exponential backoff retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first; 0 means unlimited
    pub maximum_attempts: u32,
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Multiplier applied to the delay after each retry
    pub backoff_coefficient: f64,
    /// Upper bound on the delay
    pub maximum_interval: Duration,
}

impl RetryPolicy {
    /// Policy with the given attempt budget and default backoff
    pub fn with_attempts(maximum_attempts: u32) -> Self {
        Self {
            maximum_attempts,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);
        // An overflowing or infinite product saturates at the cap
        Duration::try_from_secs_f64(self.initial_interval.as_secs_f64() * factor)
            .map_or(self.maximum_interval, |delay| delay.min(self.maximum_interval))
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.maximum_attempts != 0 && attempts >= self.maximum_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
        }
    }
}

/// Options for one kind of remote call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOptions {
    /// Timeout applied to each attempt
    pub start_to_close_timeout: Duration,
    /// Retry policy
    pub retry: RetryPolicy,
    /// Whether run cancellation abandons the call
    pub cancellable: bool,
}

impl StepOptions {
    /// Cancellable options with the given timeout and attempt budget
    pub fn new(start_to_close_timeout: Duration, maximum_attempts: u32) -> Self {
        Self {
            start_to_close_timeout,
            retry: RetryPolicy::with_attempts(maximum_attempts),
            cancellable: true,
        }
    }

    /// Make the call immune to run cancellation
    pub fn not_cancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }

    /// Replace the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Call options per remote step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterOptions {
    /// Definition fetch
    pub definition: StepOptions,
    /// Block execution
    pub block: StepOptions,
    /// Run-started notification
    pub started: StepOptions,
    /// Paused/resumed notifications
    pub notification: StepOptions,
    /// Run-ended notification
    pub ended: StepOptions,
}

impl AdapterOptions {
    /// The same options for every call; the ended notification stays non-cancellable
    pub fn uniform(step: StepOptions) -> Self {
        Self {
            definition: step.clone(),
            block: step.clone(),
            started: step.clone(),
            notification: step.clone(),
            ended: step.not_cancellable(),
        }
    }
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            definition: StepOptions::new(Duration::from_secs(120), 3),
            block: StepOptions::new(Duration::from_secs(120), 3),
            started: StepOptions::new(Duration::from_secs(30), 3),
            notification: StepOptions::new(Duration::from_secs(10), 3),
            ended: StepOptions::new(Duration::from_secs(10), 3).not_cancellable(),
        }
    }
}

/// Result of a durable wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate became true
    Satisfied,
    /// The timeout elapsed first
    TimedOut,
    /// The run was canceled first
    Canceled,
}

/// Pause marker as seen by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseMark {
    /// When the pause began (recorded time on replay)
    pub at: DateTime<Utc>,
    /// Whether the marker came from history rather than being recorded now
    pub replayed: bool,
}

/// Boundary through which one instance reaches its remote executors and durable waits
pub struct Adapter {
    instance_id: InstanceId,
    executor: Arc<dyn StepExecutor>,
    journal: Arc<Journal>,
    cancellation: CancellationToken,
    options: AdapterOptions,
}

impl Adapter {
    /// Create an adapter for one instance
    pub fn new(
        instance_id: InstanceId,
        executor: Arc<dyn StepExecutor>,
        journal: Arc<Journal>,
        cancellation: CancellationToken,
        options: AdapterOptions,
    ) -> Self {
        Self {
            instance_id,
            executor,
            journal,
            cancellation,
            options,
        }
    }

    /// Instance this adapter serves
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Cancellation token of the run
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Journal backing this instance
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Returns true while history is being replayed
    pub fn is_replaying(&self) -> bool {
        self.journal.is_replaying()
    }

    /// Fetch the definition (journaled)
    pub async fn fetch_definition(&self) -> Result<WorkflowDefinition, StepError> {
        let executor = self.executor.clone();
        let id = self.instance_id.clone();
        self.journaled("fetch-definition", &self.options.definition, move || {
            let executor = executor.clone();
            let id = id.clone();
            async move { executor.fetch_definition(&id).await }
        })
        .await
    }

    /// Execute one block (journaled)
    pub async fn execute_block(&self, block: BlockId) -> Result<BlockResult, StepError> {
        let executor = self.executor.clone();
        let id = self.instance_id.clone();
        self.journaled("execute-block", &self.options.block, move || {
            let executor = executor.clone();
            let id = id.clone();
            async move { executor.execute_block(&id, block).await }
        })
        .await
    }

    /// Send the run-started notification (journaled)
    pub async fn notify_started(&self) -> Result<(), StepError> {
        let executor = self.executor.clone();
        let id = self.instance_id.clone();
        let at = Utc::now();
        self.journaled("notify-started", &self.options.started, move || {
            let executor = executor.clone();
            let id = id.clone();
            async move { executor.notify_started(&id, at).await }
        })
        .await
    }

    /// Send the run-ended notification (journaled)
    pub async fn notify_ended(
        &self,
        result: Option<Value>,
        error: Option<ErrorSummary>,
    ) -> Result<(), StepError> {
        let executor = self.executor.clone();
        let id = self.instance_id.clone();
        let at = Utc::now();
        self.journaled("notify-ended", &self.options.ended, move || {
            let executor = executor.clone();
            let id = id.clone();
            let result = result.clone();
            let error = error.clone();
            async move {
                executor
                    .notify_ended(&id, at, result.as_ref(), error.as_ref())
                    .await
            }
        })
        .await
    }

    /// Send the paused notification.
    ///
    /// Not journaled: it is only issued when a pause is recorded live.
    pub async fn notify_paused(&self, payload: Option<Value>) -> Result<(), StepError> {
        let executor = self.executor.clone();
        let id = self.instance_id.clone();
        let at = Utc::now();
        self.with_retry("notify-paused", &self.options.notification, move || {
            let executor = executor.clone();
            let id = id.clone();
            let payload = payload.clone();
            async move { executor.notify_paused(&id, at, payload.as_ref()).await }
        })
        .await
    }

    /// Send the resumed notification (not journaled, like `notify_paused`)
    pub async fn notify_resumed(&self, payload: Option<Value>) -> Result<(), StepError> {
        let executor = self.executor.clone();
        let id = self.instance_id.clone();
        let at = Utc::now();
        self.with_retry("notify-resumed", &self.options.notification, move || {
            let executor = executor.clone();
            let id = id.clone();
            let payload = payload.clone();
            async move { executor.notify_resumed(&id, at, payload.as_ref()).await }
        })
        .await
    }

    /// Wait until `predicate` holds for the watched value, the timeout elapses,
    /// or the run is canceled. Holds no lock while suspended.
    pub async fn durable_wait<T, P>(
        &self,
        mut signal: watch::Receiver<T>,
        predicate: P,
        timeout: Duration,
    ) -> WaitOutcome
    where
        P: FnMut(&T) -> bool,
    {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => WaitOutcome::Canceled,
            waited = tokio::time::timeout(timeout, signal.wait_for(predicate)) => match waited {
                Ok(Ok(_)) => WaitOutcome::Satisfied,
                // The sender lives as long as the gate; a closed channel means teardown.
                Ok(Err(_)) => WaitOutcome::Canceled,
                Err(_) => WaitOutcome::TimedOut,
            },
        }
    }

    /// Record the run request, or confirm it against history
    pub fn mark_started(&self, input: Option<Value>) -> JournalResult<()> {
        let replayed = self.journal.replay_next("started", |entry| {
            matches!(entry, JournalEntry::Started { instance_id, .. } if *instance_id == self.instance_id)
        })?;
        if replayed.is_none() {
            self.journal.append(JournalEntry::Started {
                instance_id: self.instance_id.clone(),
                input,
                at: Utc::now(),
            })?;
        }
        Ok(())
    }

    /// Record a pause, or recognise the replayed one
    pub fn mark_paused(&self, payload: Option<Value>) -> JournalResult<PauseMark> {
        match self
            .journal
            .replay_next("paused", |entry| matches!(entry, JournalEntry::Paused { .. }))?
        {
            Some(JournalEntry::Paused { at, .. }) => Ok(PauseMark { at, replayed: true }),
            _ => {
                let at = Utc::now();
                self.journal.append(JournalEntry::Paused { payload, at })?;
                Ok(PauseMark { at, replayed: false })
            }
        }
    }

    /// Consume a replayed resume marker, if history holds one next
    pub fn replayed_resume(&self) -> Option<Option<Value>> {
        match self
            .journal
            .replay_if(|entry| matches!(entry, JournalEntry::Resumed { .. }))
        {
            Some(JournalEntry::Resumed { payload, .. }) => Some(payload),
            _ => None,
        }
    }

    /// Record an accepted resume
    pub fn mark_resumed(&self, payload: Option<Value>) -> JournalResult<()> {
        self.journal.append(JournalEntry::Resumed {
            payload,
            at: Utc::now(),
        })
    }

    /// Record the terminal outcome unless history already holds it
    pub fn mark_finished(&self, outcome: &RunOutcome) -> JournalResult<()> {
        let replayed = self
            .journal
            .replay_next("finished", |entry| matches!(entry, JournalEntry::Finished { .. }))?;
        if replayed.is_none() {
            self.journal.append(JournalEntry::Finished {
                outcome: outcome.clone(),
                at: Utc::now(),
            })?;
        }
        Ok(())
    }

    /// Run a call through the journal: replay the recorded outcome or execute and record
    async fn journaled<T, F, Fut>(
        &self,
        step: &'static str,
        options: &StepOptions,
        call: F,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let expected = format!("call {step}");
        let recorded = self
            .journal
            .replay_next(&expected, |entry| {
                matches!(entry, JournalEntry::Call { step: recorded, .. } if recorded == step)
            })
            .map_err(journal_failure)?;

        if let Some(JournalEntry::Call { outcome, .. }) = recorded {
            tracing::debug!(instance_id = %self.instance_id, step, "replaying recorded outcome");
            return match outcome {
                Ok(value) => serde_json::from_value(value).map_err(|e| {
                    StepError::non_retryable(format!("recorded {step} outcome is unreadable: {e}"))
                }),
                Err(error) => Err(error),
            };
        }

        let outcome = self.with_retry(step, options, call).await;
        if matches!(outcome, Err(StepError::Canceled)) {
            return outcome;
        }

        let recorded = match &outcome {
            Ok(value) => serde_json::to_value(value)
                .map(Ok)
                .map_err(|e| StepError::non_retryable(format!("{step} outcome is not serializable: {e}")))?,
            Err(error) => Err(error.clone()),
        };
        self.journal
            .append(JournalEntry::Call {
                step: step.to_string(),
                outcome: recorded,
            })
            .map_err(journal_failure)?;

        outcome
    }

    /// Execute a call with per-attempt timeout, retry, and cancellation checks
    async fn with_retry<T, F, Fut>(
        &self,
        step: &'static str,
        options: &StepOptions,
        mut call: F,
    ) -> Result<T, StepError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if options.cancellable && self.cancellation.is_cancelled() {
                return Err(StepError::Canceled);
            }

            let outcome = match tokio::time::timeout(options.start_to_close_timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StepError::TimedOut {
                    timeout: options.start_to_close_timeout,
                }),
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_retryable() => return Err(error),
                Err(error) => error,
            };

            if options.retry.exhausted(attempt) {
                tracing::warn!(instance_id = %self.instance_id, step, attempt, %error, "retry budget exhausted");
                return Err(StepError::Exhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = options.retry.delay_for(attempt);
            tracing::warn!(instance_id = %self.instance_id, step, attempt, ?delay, %error, "remote call failed, retrying");

            if options.cancellable {
                tokio::select! {
                    _ = self.cancellation.cancelled() => return Err(StepError::Canceled),
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn journal_failure(error: JournalError) -> StepError {
    StepError::non_retryable(format!("journal failure: {error}"))
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("instance_id", &self.instance_id)
            .field("journal", &self.journal)
            .field("canceled", &self.cancellation.is_cancelled())
            .finish()
    }
}
