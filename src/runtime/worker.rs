//! Instance host
//!
//! The worker starts interpreter instances on the tokio runtime, keeps a
//! handle per instance so queries, resumes, and cancellations can be routed
//! by id, and after a restart brings unfinished instances back by replaying
//! their journals.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::RuntimeConfig;
use super::adapter::{Adapter, StepExecutor};
use super::error::{InterpreterError, WorkerError};
use super::event::EventBus;
use super::instance::{InstanceId, InstanceStatus, ResumeAck, RunOutcome, RunParameters};
use super::interpreter::Interpreter;
use super::journal::{Journal, JournalEntry};
use super::storage::{self, Storage};

/// Caller-facing handle to one running (or finished) instance
#[derive(Clone)]
pub struct InstanceHandle {
    interpreter: Arc<Interpreter>,
    cancellation: CancellationToken,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

impl InstanceHandle {
    /// Identifier of the instance
    pub fn instance_id(&self) -> &InstanceId {
        self.interpreter.instance_id()
    }

    /// Whether the instance is suspended at a pause-point
    pub fn is_paused(&self) -> bool {
        self.interpreter.is_paused()
    }

    /// Current lifecycle state
    pub fn status(&self) -> InstanceStatus {
        self.interpreter.status()
    }

    /// Receiver observing lifecycle transitions
    pub fn watch_status(&self) -> watch::Receiver<InstanceStatus> {
        self.interpreter.watch_status()
    }

    /// Event bus of the instance, for additional observers
    pub fn bus(&self) -> &Arc<EventBus> {
        self.interpreter.bus()
    }

    /// Resume the instance with a JSON object payload
    pub async fn resume(&self, payload: Option<Value>) -> Result<ResumeAck, InterpreterError> {
        self.interpreter.resume(payload).await
    }

    /// Request cancellation; observed at the next suspension point
    pub fn cancel(&self) {
        tracing::info!(instance_id = %self.instance_id(), "cancellation requested");
        self.cancellation.cancel();
    }

    /// Terminal outcome, if the instance has finished
    pub fn try_result(&self) -> Option<RunOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the terminal outcome
    pub async fn result(&self) -> Result<RunOutcome, WorkerError> {
        let mut outcome = self.outcome.clone();
        match outcome.wait_for(Option::is_some).await {
            Ok(settled) => settled
                .clone()
                .ok_or_else(|| WorkerError::Aborted(self.instance_id().clone())),
            Err(_) => Err(WorkerError::Aborted(self.instance_id().clone())),
        }
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("instance_id", self.instance_id())
            .field("status", &self.status())
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// Hosts interpreter instances for one executor
pub struct Worker {
    config: RuntimeConfig,
    storage: Storage,
    executor: Arc<dyn StepExecutor>,
    instances: RwLock<HashMap<InstanceId, InstanceHandle>>,
}

impl Worker {
    /// Create a worker with the given configuration
    pub fn new(config: RuntimeConfig, executor: Arc<dyn StepExecutor>) -> anyhow::Result<Self> {
        let storage = Storage::new(config.root.clone());
        if config.durable {
            storage.create_dir_all(&storage.journal_dir())?;
        }

        Ok(Self {
            config,
            storage,
            executor,
            instances: RwLock::new(HashMap::new()),
        })
    }

    /// Initialize storage directories and write the configuration
    pub fn init(config: RuntimeConfig) -> anyhow::Result<()> {
        storage::init_storage(&config.root)?;
        storage::write_config(&config)?;
        Ok(())
    }

    /// Load a worker from an initialized storage root
    pub fn load(root: PathBuf, executor: Arc<dyn StepExecutor>) -> anyhow::Result<Self> {
        let config = storage::load_config(&root)?;
        Self::new(config, executor)
    }

    /// Current configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Storage manager
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Start a new instance.
    ///
    /// Fails if the id is already hosted or already has a journal; use
    /// [`Worker::recover`] to continue an existing history.
    pub fn start(&self, params: RunParameters) -> Result<InstanceHandle, WorkerError> {
        let instance_id = params.instance_id;
        if self.instances.read().contains_key(&instance_id) {
            return Err(WorkerError::AlreadyExists(instance_id));
        }

        let journal = self.open_journal(&instance_id)?;
        if !journal.entries().is_empty() {
            return Err(WorkerError::AlreadyExists(instance_id));
        }

        tracing::info!(%instance_id, durable = self.config.durable, "starting instance");
        self.spawn(instance_id, journal, params.input)
    }

    /// Continue every unfinished instance found in the journal directory
    pub fn recover(&self) -> Result<Vec<InstanceHandle>, WorkerError> {
        if !self.config.durable {
            return Ok(Vec::new());
        }

        let mut recovered = Vec::new();
        for instance_id in self.storage.list_journals()? {
            if self.instances.read().contains_key(&instance_id) {
                continue;
            }

            let journal = self.open_journal(&instance_id)?;
            if journal.is_finished() {
                continue;
            }

            let input = journal.entries().into_iter().find_map(|entry| match entry {
                JournalEntry::Started { input, .. } => Some(input),
                _ => None,
            });
            let Some(input) = input else {
                tracing::warn!(%instance_id, "journal has no start record, skipping");
                continue;
            };

            tracing::info!(%instance_id, entries = journal.entries().len(), "recovering instance");
            recovered.push(self.spawn(instance_id, journal, input)?);
        }

        Ok(recovered)
    }

    /// Handle of a hosted instance
    pub fn handle(&self, instance_id: &InstanceId) -> Option<InstanceHandle> {
        self.instances.read().get(instance_id).cloned()
    }

    /// Identifiers of every hosted instance
    pub fn instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.instances.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether a hosted instance is paused
    pub fn is_paused(&self, instance_id: &InstanceId) -> Result<bool, WorkerError> {
        Ok(self.lookup(instance_id)?.is_paused())
    }

    /// Resume a hosted instance
    pub async fn resume(
        &self,
        instance_id: &InstanceId,
        payload: Option<Value>,
    ) -> Result<ResumeAck, WorkerError> {
        let handle = self.lookup(instance_id)?;
        Ok(handle.resume(payload).await?)
    }

    /// Cancel a hosted instance
    pub fn cancel(&self, instance_id: &InstanceId) -> Result<(), WorkerError> {
        self.lookup(instance_id)?.cancel();
        Ok(())
    }

    fn lookup(&self, instance_id: &InstanceId) -> Result<InstanceHandle, WorkerError> {
        self.handle(instance_id)
            .ok_or_else(|| WorkerError::NotFound(instance_id.clone()))
    }

    fn open_journal(&self, instance_id: &InstanceId) -> Result<Journal, WorkerError> {
        if self.config.durable {
            Ok(Journal::open(self.storage.journal_path(instance_id))?)
        } else {
            Ok(Journal::in_memory())
        }
    }

    fn spawn(
        &self,
        instance_id: InstanceId,
        journal: Journal,
        input: Option<Value>,
    ) -> Result<InstanceHandle, WorkerError> {
        let cancellation = CancellationToken::new();
        let adapter = Arc::new(Adapter::new(
            instance_id.clone(),
            self.executor.clone(),
            Arc::new(journal),
            cancellation.clone(),
            self.config.adapter.clone(),
        ));
        let interpreter = Arc::new(Interpreter::new(adapter, self.config.pause_timeout));
        let (settled, outcome) = watch::channel(None);

        let handle = InstanceHandle {
            interpreter: interpreter.clone(),
            cancellation,
            outcome,
        };

        {
            let mut instances = self.instances.write();
            if instances.contains_key(&instance_id) {
                return Err(WorkerError::AlreadyExists(instance_id));
            }
            instances.insert(instance_id, handle.clone());
        }

        tokio::spawn(async move {
            let outcome = interpreter.execute(input).await;
            settled.send_replace(Some(outcome));
        });

        Ok(handle)
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("root", &self.config.root)
            .field("durable", &self.config.durable)
            .field("instances", &self.instances.read().len())
            .finish()
    }
}
