//! In-memory [`StreamSource`] driven by a fixed script per partition.
//!
//! Each partition starts opened and runs its steps in order on its own task, which gives the same
//! guarantees a real source does: strictly sequential callbacks within a partition and concurrency
//! across partitions. Checkpoints are kept in memory.

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::stream::{
    BatchOutcome, CloseReason, Message, PartitionContext, PartitionProcessor, ProcessorHandle, StreamSource,
};
use crate::util::error::{CheckpointError, PartitionError, SubscriptionError};

#[derive(Debug)]
pub enum MemoryStep {
    Batch(Vec<Message>),
    /// Reports a transport error for the partition.
    Error(String),
    Close(CloseReason),
    /// Reassigns a previously closed partition.
    Open,
}

struct MemoryState {
    subscribed: AtomicBool,
    fail_checkpoints: AtomicBool,
    committed: Mutex<HashMap<String, i64>>,
    checkpoint_requests: Mutex<Vec<(String, i64)>>,
    outcomes: Mutex<Vec<(String, BatchOutcome)>>,
    // scripts that haven't run to their end yet
    remaining: watch::Sender<usize>,
}

pub struct MemorySource {
    stream_name: String,
    groups: Vec<String>,
    owner: Uuid,
    scripts: Mutex<Vec<(String, Vec<MemoryStep>)>>,
    state: Arc<MemoryState>,
}

impl MemorySource {
    pub fn new(stream_name: impl Into<String>) -> Self {
        let (remaining, _) = watch::channel(0);
        MemorySource {
            stream_name: stream_name.into(),
            groups: Vec::new(),
            owner: Uuid::new_v4(),
            scripts: Mutex::new(Vec::new()),
            state: Arc::new(MemoryState {
                subscribed: AtomicBool::new(false),
                fail_checkpoints: AtomicBool::new(false),
                committed: Mutex::new(HashMap::new()),
                checkpoint_requests: Mutex::new(Vec::new()),
                outcomes: Mutex::new(Vec::new()),
                remaining,
            }),
        }
    }

    /// Only accept these consumer groups, any group is accepted when none are given.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn with_partition(self, partition_id: impl Into<String>, steps: Vec<MemoryStep>) -> Self {
        self.scripts.lock().push((partition_id.into(), steps));
        self.state.remaining.send_modify(|remaining| *remaining += 1);
        self
    }

    pub fn fail_checkpoints(&self, fail: bool) {
        self.state.fail_checkpoints.store(fail, Ordering::SeqCst);
    }

    /// Last committed offset of a partition.
    pub fn committed(&self, partition_id: &str) -> Option<i64> {
        self.state.committed.lock().get(partition_id).copied()
    }

    /// Every checkpoint request in arrival order, including rejected ones.
    pub fn checkpoint_requests(&self) -> Vec<(String, i64)> {
        self.state.checkpoint_requests.lock().clone()
    }

    pub fn outcomes(&self) -> Vec<(String, BatchOutcome)> {
        self.state.outcomes.lock().clone()
    }

    /// Waits until every partition script ran to its end.
    pub async fn delivered(&self) {
        let mut remaining = self.state.remaining.subscribe();
        // the sender lives as long as the state, this can't fail
        let _ = remaining.wait_for(|remaining| *remaining == 0).await;
    }
}

#[async_trait]
impl StreamSource for MemorySource {
    async fn subscribe(
        &self,
        stream_name: &str,
        group_id: &str,
        processor: Arc<dyn PartitionProcessor>,
    ) -> Result<Box<dyn ProcessorHandle>, SubscriptionError> {
        if stream_name != self.stream_name {
            return Err(SubscriptionError::UnknownStream(stream_name.to_string()));
        }
        if !self.groups.is_empty() && !self.groups.iter().any(|group| group == group_id) {
            return Err(SubscriptionError::UnknownGroup {
                stream: stream_name.to_string(),
                group: group_id.to_string(),
            });
        }
        if self.state.subscribed.swap(true, Ordering::SeqCst) {
            return Err(SubscriptionError::AlreadyStarted);
        }

        let token = CancellationToken::new();
        let scripts = mem::take(&mut *self.scripts.lock());
        let tasks: Vec<JoinHandle<()>> = scripts
            .into_iter()
            .map(|(partition_id, steps)| {
                let context = PartitionContext::new(stream_name, group_id, partition_id, self.owner);
                tokio::spawn(run_script(
                    context,
                    steps,
                    processor.clone(),
                    self.state.clone(),
                    token.clone(),
                ))
            })
            .collect();

        Ok(Box::new(MemoryHandle {
            token,
            tasks: Mutex::new(tasks),
            state: self.state.clone(),
        }))
    }

    async fn checkpoint(&self, context: &PartitionContext, offset: i64) -> Result<(), CheckpointError> {
        self.state
            .checkpoint_requests
            .lock()
            .push((context.partition_id.clone(), offset));

        if !self.state.subscribed.load(Ordering::SeqCst) {
            return Err(CheckpointError::NotSubscribed);
        }
        if self.state.fail_checkpoints.load(Ordering::SeqCst) {
            return Err(CheckpointError::Rejected("checkpoint store unavailable".to_string()));
        }

        self.state.committed.lock().insert(context.partition_id.clone(), offset);
        Ok(())
    }
}

async fn run_script(
    context: PartitionContext,
    steps: Vec<MemoryStep>,
    processor: Arc<dyn PartitionProcessor>,
    state: Arc<MemoryState>,
    token: CancellationToken,
) {
    processor.on_partition_opened(&context).await;
    let mut open = true;

    for step in steps {
        if token.is_cancelled() {
            break;
        }

        match step {
            MemoryStep::Batch(batch) if open => {
                let outcome = processor.on_messages(&context, batch).await;
                state.outcomes.lock().push((context.partition_id.clone(), outcome));
            }
            MemoryStep::Batch(batch) => {
                debug!("Skipping {} messages for closed partition {}", batch.len(), context);
            }
            MemoryStep::Error(message) => {
                processor.on_error(&context, PartitionError::Transport(message)).await;
            }
            MemoryStep::Close(reason) => {
                if open {
                    processor.on_partition_closed(&context, reason).await;
                    open = false;
                }
            }
            MemoryStep::Open => {
                if !open {
                    processor.on_partition_opened(&context).await;
                    open = true;
                }
            }
        }

        // let other partitions interleave, like a real source would
        tokio::task::yield_now().await;
    }

    state.remaining.send_modify(|remaining| *remaining = remaining.saturating_sub(1));

    token.cancelled().await;
    if open {
        processor.on_partition_closed(&context, CloseReason::Shutdown).await;
    }
}

struct MemoryHandle {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    state: Arc<MemoryState>,
}

#[async_trait]
impl ProcessorHandle for MemoryHandle {
    async fn unregister(&self) {
        self.token.cancel();
        let tasks = mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Partition script task failed: {}", e);
            }
        }
        self.state.subscribed.store(false, Ordering::SeqCst);
    }
}
