//! Bounded summarization queue and its background worker.
//!
//! Tasks wait in a FIFO with a maximum depth. A single worker wakes on a
//! fixed interval, takes the highest-priority task that is not already in
//! progress, summarizes it, and removes it whether or not summarization
//! succeeded. With asynchronous mode off, submissions run inline instead.
//!
//! Clearing the service drops queued tasks and starts a new generation; a
//! summary finished for an older generation is discarded.

use crate::context::manager::ContextManager;
use crate::context::summarizer::Summarizer;
use chrono::{DateTime, Utc};
use parley_core::error::ContextError;
use parley_core::message::{Summary, new_id};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One pending summarization.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryTask {
    pub id: String,
    pub message_ids: Vec<String>,
    /// Higher runs first
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub in_progress: bool,
}

impl SummaryTask {
    pub fn new(message_ids: Vec<String>, priority: u8) -> Self {
        Self {
            id: new_id(),
            message_ids,
            priority,
            created_at: Utc::now(),
            in_progress: false,
        }
    }
}

/// FIFO of summarization tasks with a depth limit.
pub struct SummaryQueue {
    tasks: Mutex<VecDeque<SummaryTask>>,
    max_depth: usize,
}

impl SummaryQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            max_depth,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SummaryTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a task. Fails when the queue is at its maximum depth.
    pub fn enqueue(&self, task: SummaryTask) -> Result<(), ContextError> {
        let mut tasks = self.lock();
        if tasks.len() >= self.max_depth {
            return Err(ContextError::QueueFull {
                max_depth: self.max_depth,
            });
        }
        debug!(task = %task.id, messages = task.message_ids.len(), "Queued summary task");
        tasks.push_back(task);
        Ok(())
    }

    /// Mark the highest-priority idle task in progress and return a copy.
    /// Equal priorities run in arrival order.
    pub fn take_next(&self) -> Option<SummaryTask> {
        let mut tasks = self.lock();
        let mut best: Option<usize> = None;
        for (i, task) in tasks.iter().enumerate() {
            if task.in_progress {
                continue;
            }
            if best.is_none_or(|b| task.priority > tasks[b].priority) {
                best = Some(i);
            }
        }
        let task = tasks.get_mut(best?)?;
        task.in_progress = true;
        Some(task.clone())
    }

    /// Remove a task by ID.
    pub fn complete(&self, task_id: &str) {
        self.lock().retain(|t| t.id != task_id);
    }

    /// Every message ID referenced by a queued or running task.
    pub fn pending_message_ids(&self) -> HashSet<String> {
        self.lock()
            .iter()
            .flat_map(|t| t.message_ids.iter().cloned())
            .collect()
    }

    /// Drop every task, running or not.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

struct Shared {
    queue: SummaryQueue,
    summarizer: Summarizer,
    manager: Arc<ContextManager>,
    /// Held while a turn is in flight; summaries wait for it
    turn_gate: Option<Arc<tokio::sync::Mutex<()>>>,
    generation: AtomicU64,
}

impl Shared {
    /// Summarize the messages a task names and store the result.
    async fn run(&self, message_ids: &[String]) -> Result<Option<Summary>, ContextError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let messages = self.manager.messages_by_ids(message_ids);
        if messages.is_empty() {
            return Ok(None);
        }
        let summary = self.summarizer.summarize(&messages).await?;
        let _turn = match &self.turn_gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(summary = %summary.id, "Conversation was cleared, discarding summary");
            return Ok(None);
        }
        self.manager.add_summary(summary).map(Some)
    }

    async fn run_next(&self) {
        let Some(task) = self.queue.take_next() else {
            return;
        };
        match self.run(&task.message_ids).await {
            Ok(Some(summary)) => {
                info!(task = %task.id, summary = %summary.id, "Summary added");
            }
            Ok(None) => debug!(task = %task.id, "Summary task had no messages left"),
            Err(e) => warn!(task = %task.id, error = %e, "Summary task failed"),
        }
        self.queue.complete(&task.id);
    }
}

/// Front-end for summarization: queue, optional worker, inline fallback.
pub struct SummaryService {
    shared: Arc<Shared>,
    async_mode: bool,
    poll_interval: Duration,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SummaryService {
    pub fn new(
        summarizer: Summarizer,
        manager: Arc<ContextManager>,
        max_depth: usize,
        async_mode: bool,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: SummaryQueue::new(max_depth),
                summarizer,
                manager,
                turn_gate: None,
                generation: AtomicU64::new(0),
            }),
            async_mode,
            poll_interval,
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Builder: make background summaries wait for the turn lock before
    /// they are stored. Must be called before [`start`](Self::start).
    pub fn with_turn_gate(mut self, gate: Arc<tokio::sync::Mutex<()>>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.turn_gate = Some(gate);
        }
        self
    }

    pub fn is_async(&self) -> bool {
        self.async_mode
    }

    /// Spawn the background worker. Does nothing in inline mode or when
    /// already running.
    pub fn start(&self) {
        if !self.async_mode {
            return;
        }
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.clone();
        let period = self.poll_interval.max(Duration::from_millis(1));
        *worker = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(poll_interval_ms = period.as_millis() as u64, "Summary worker started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // Shutdown drops a summary still in flight
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = shared.run_next() => {}
                }
            }
            info!("Summary worker stopped");
        }));
    }

    /// Queue a summary of `message_ids`, or run it now in inline mode.
    pub async fn submit(&self, message_ids: Vec<String>, priority: u8) -> Result<(), ContextError> {
        if message_ids.is_empty() {
            return Err(ContextError::EmptySummaryInput);
        }
        if self.async_mode {
            return self.shared.queue.enqueue(SummaryTask::new(message_ids, priority));
        }
        // Inline runs inside the caller's turn, so no gate
        let messages = self.shared.manager.messages_by_ids(&message_ids);
        if messages.is_empty() {
            return Ok(());
        }
        let summary = self.shared.summarizer.summarize(&messages).await?;
        self.shared.manager.add_summary(summary)?;
        Ok(())
    }

    /// Drop queued tasks and discard any summary still being produced.
    pub fn clear(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.queue.clear();
        debug!("Summary queue cleared");
    }

    /// Process one queued task now. Used by tests and by hosts that drive
    /// the queue themselves.
    pub async fn run_pending(&self) {
        self.shared.run_next().await;
    }

    /// Message IDs already waiting to be summarized.
    pub fn pending_message_ids(&self) -> HashSet<String> {
        self.shared.queue.pending_message_ids()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stop the worker and wait for it to finish its current tick.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Summary worker ended abnormally");
            }
        }
    }
}

impl Drop for SummaryService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
