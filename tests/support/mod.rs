//! Scripted executor shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pausable::runtime::{
    AdapterOptions, BlockId, BlockResult, ErrorSummary, InstanceHandle, InstanceId,
    InstanceStatus, RetryPolicy, RuntimeConfig, StepError, StepExecutor, StepOptions,
    WorkflowDefinition,
};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Executor that records every call it receives
pub struct Scripted {
    pub definition: WorkflowDefinition,
    pub definition_failures: AtomicU32,
    pub hanging_blocks: HashSet<BlockId>,
    pub calls: Mutex<Vec<String>>,
    pub ended: Mutex<Vec<(Option<Value>, Option<ErrorSummary>)>>,
}

impl Scripted {
    pub fn new(blocks: impl IntoIterator<Item = u64>, pauses: impl IntoIterator<Item = u64>) -> Self {
        Self {
            definition: WorkflowDefinition::new(blocks, pauses),
            definition_failures: AtomicU32::new(0),
            hanging_blocks: HashSet::new(),
            calls: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
        }
    }

    /// Fail the definition fetch this many times before answering
    pub fn failing_definition(self, failures: u32) -> Self {
        self.definition_failures.store(failures, Ordering::SeqCst);
        self
    }

    /// Never return from this block
    pub fn hanging_on(mut self, block: u64) -> Self {
        self.hanging_blocks.insert(BlockId(block));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == call).count()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl StepExecutor for Scripted {
    async fn fetch_definition(&self, _instance_id: &InstanceId) -> Result<WorkflowDefinition, StepError> {
        self.record("fetch");
        let remaining = self.definition_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.definition_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StepError::failed("definition service unavailable"));
        }
        Ok(self.definition.clone())
    }

    async fn execute_block(&self, _instance_id: &InstanceId, block: BlockId) -> Result<BlockResult, StepError> {
        self.record(format!("block {block}"));
        if self.hanging_blocks.contains(&block) {
            std::future::pending::<()>().await;
        }
        Ok(json!({ "block": block.0 }))
    }

    async fn notify_started(&self, _instance_id: &InstanceId, _at: DateTime<Utc>) -> Result<(), StepError> {
        self.record("started");
        Ok(())
    }

    async fn notify_paused(
        &self,
        _instance_id: &InstanceId,
        _at: DateTime<Utc>,
        _payload: Option<&Value>,
    ) -> Result<(), StepError> {
        self.record("paused");
        Ok(())
    }

    async fn notify_resumed(
        &self,
        _instance_id: &InstanceId,
        _at: DateTime<Utc>,
        _payload: Option<&Value>,
    ) -> Result<(), StepError> {
        self.record("resumed");
        Ok(())
    }

    async fn notify_ended(
        &self,
        _instance_id: &InstanceId,
        _at: DateTime<Utc>,
        result: Option<&Value>,
        error: Option<&ErrorSummary>,
    ) -> Result<(), StepError> {
        self.record("ended");
        self.ended.lock().push((result.cloned(), error.cloned()));
        Ok(())
    }
}

/// Configuration with fast retries rooted at `root`
pub fn config(root: &Path, durable: bool, pause_timeout: Duration) -> RuntimeConfig {
    let retry = RetryPolicy {
        maximum_attempts: 3,
        initial_interval: Duration::from_millis(1),
        backoff_coefficient: 2.0,
        maximum_interval: Duration::from_millis(10),
    };
    let step = StepOptions::new(Duration::from_secs(5), 3).with_retry(retry);

    RuntimeConfig {
        root: root.to_path_buf(),
        durable,
        pause_timeout,
        adapter: AdapterOptions::uniform(step),
        debug: false,
    }
}

/// Wait until the instance reaches `status`
pub async fn wait_for(handle: &InstanceHandle, status: InstanceStatus) {
    let mut rx = handle.watch_status();
    rx.wait_for(|s| *s == status).await.unwrap();
}

/// Poll `condition` until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
