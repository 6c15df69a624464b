//! Scheduling Loop
//!
//! The single owner of the job table. Every mutation (enqueue, step update,
//! cancel, completion) arrives as a [`Command`] on one channel, so reentrant
//! enqueues from running jobs only ever wait on a reply, never on a lock.
//!
//! Ordering rules:
//! - within a scope, at most one job runs; the next one is the queued job
//!   with the lowest `(priority, enqueue sequence)`
//! - across scopes, free worker slots go to the lowest `(priority, sequence)`
//!   head among idle scopes

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use story_pipeline_core::{ProgressLevel, ProgressSink};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::JobContext;
use super::{DispatchError, EnqueueOutcome, TaskDispatcher};
use crate::models::job::{JobOutcome, JobSnapshot, JobStatus};
use crate::models::settings::DispatcherSettings;

/// Boxed future returned by job work
pub type JobFuture = Pin<Box<dyn Future<Output = JobOutcome> + Send + 'static>>;

/// Boxed job work
pub type JobWork = Box<dyn FnOnce(JobContext) -> JobFuture + Send + 'static>;

/// A job ready to be inserted into the table
pub(crate) struct PendingJob {
    pub snapshot: JobSnapshot,
    pub work: JobWork,
}

pub(crate) enum Command {
    Enqueue {
        job: PendingJob,
        reply: oneshot::Sender<Result<EnqueueOutcome, DispatchError>>,
    },
    UpdateStep {
        run_id: String,
        current: u32,
        max: u32,
        description: Option<String>,
    },
    Cancel {
        run_id: String,
        reply: oneshot::Sender<bool>,
    },
    ActiveJobs {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    Status {
        run_id: String,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
    Watch {
        run_id: String,
        reply: oneshot::Sender<Option<watch::Receiver<JobSnapshot>>>,
    },
    Finished {
        run_id: String,
        outcome: JobOutcome,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct JobEntry {
    snapshot: JobSnapshot,
    seq: u64,
    work: Option<JobWork>,
    cancel: CancellationToken,
    watch: watch::Sender<JobSnapshot>,
}

impl JobEntry {
    fn publish(&self) {
        self.watch.send_replace(self.snapshot.clone());
    }
}

type QueueKey = Reverse<(i32, u64, String)>;

pub(crate) struct Scheduler {
    settings: DispatcherSettings,
    progress: Arc<dyn ProgressSink>,
    commands: mpsc::WeakUnboundedSender<Command>,
    registry: Arc<super::OperationRegistry>,
    /// Queued and running jobs
    jobs: HashMap<String, JobEntry>,
    /// Queued run ids per scope
    queues: HashMap<String, BinaryHeap<QueueKey>>,
    busy_scopes: HashSet<String>,
    running: usize,
    /// Active dedup keys -> run id
    dedup: HashMap<String, String>,
    /// Finished jobs, oldest first
    history: VecDeque<String>,
    finished: HashMap<String, JobSnapshot>,
    seq: u64,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    shutting_down: bool,
}

impl Scheduler {
    pub(crate) fn new(
        settings: DispatcherSettings,
        progress: Arc<dyn ProgressSink>,
        commands: mpsc::WeakUnboundedSender<Command>,
        registry: Arc<super::OperationRegistry>,
    ) -> Self {
        Self {
            settings,
            progress,
            commands,
            registry,
            jobs: HashMap::new(),
            queues: HashMap::new(),
            busy_scopes: HashSet::new(),
            running: 0,
            dedup: HashMap::new(),
            history: VecDeque::new(),
            finished: HashMap::new(),
            seq: 0,
            shutdown_waiters: Vec::new(),
            shutting_down: false,
        }
    }

    /// Process commands until every handle is dropped or shutdown completes.
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!(
            max_concurrency = self.settings.max_concurrency,
            "task dispatcher started"
        );

        while let Some(command) = rx.recv().await {
            self.handle(command);
            // Drain whatever else is pending so priorities are compared
            // across everything enqueued in the same burst.
            while let Ok(command) = rx.try_recv() {
                self.handle(command);
            }

            if self.shutting_down {
                if self.running == 0 {
                    for waiter in self.shutdown_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                    break;
                }
            } else {
                self.dispatch();
            }
        }

        info!("task dispatcher stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { job, reply } => {
                let result = self.enqueue(job);
                let _ = reply.send(result);
            }
            Command::UpdateStep {
                run_id,
                current,
                max,
                description,
            } => self.update_step(&run_id, current, max, description),
            Command::Cancel { run_id, reply } => {
                let cancelled = self.cancel(&run_id);
                let _ = reply.send(cancelled);
            }
            Command::ActiveJobs { reply } => {
                let mut active: Vec<(u64, JobSnapshot)> = self
                    .jobs
                    .values()
                    .map(|e| (e.seq, e.snapshot.clone()))
                    .collect();
                active.sort_by_key(|(seq, _)| *seq);
                let _ = reply.send(active.into_iter().map(|(_, s)| s).collect());
            }
            Command::Status { run_id, reply } => {
                let snapshot = self
                    .jobs
                    .get(&run_id)
                    .map(|e| e.snapshot.clone())
                    .or_else(|| self.finished.get(&run_id).cloned());
                let _ = reply.send(snapshot);
            }
            Command::Watch { run_id, reply } => {
                let receiver = match self.jobs.get(&run_id) {
                    Some(entry) => Some(entry.watch.subscribe()),
                    None => self
                        .finished
                        .get(&run_id)
                        .map(|snapshot| watch::channel(snapshot.clone()).1),
                };
                let _ = reply.send(receiver);
            }
            Command::Finished { run_id, outcome } => self.finish(&run_id, outcome),
            Command::Shutdown { reply } => self.begin_shutdown(reply),
        }
    }

    fn enqueue(&mut self, job: PendingJob) -> Result<EnqueueOutcome, DispatchError> {
        if self.shutting_down {
            return Err(DispatchError::DispatcherClosed);
        }

        let PendingJob { snapshot, work } = job;
        let run_id = snapshot.run_id.clone();

        if self.jobs.contains_key(&run_id) || self.finished.contains_key(&run_id) {
            return Err(DispatchError::DuplicateRunId(run_id));
        }

        if let Some(key) = &snapshot.dedup_key {
            if let Some(existing) = self.dedup.get(key) {
                debug!(
                    run_id = %run_id,
                    existing = %existing,
                    dedup_key = %key,
                    "suppressed duplicate enqueue"
                );
                return Ok(EnqueueOutcome::Suppressed {
                    existing_run_id: existing.clone(),
                });
            }
            self.dedup.insert(key.clone(), run_id.clone());
        }

        self.seq += 1;
        let seq = self.seq;
        self.queues
            .entry(snapshot.scope.clone())
            .or_default()
            .push(Reverse((snapshot.priority, seq, run_id.clone())));

        info!(
            run_id = %run_id,
            operation = %snapshot.operation,
            scope = %snapshot.scope,
            priority = snapshot.priority,
            "job queued"
        );
        self.progress
            .append(&run_id, &format!("Queued {}", snapshot.operation), ProgressLevel::Info);

        let (watch, _) = watch::channel(snapshot.clone());
        self.jobs.insert(
            run_id.clone(),
            JobEntry {
                snapshot,
                seq,
                work: Some(work),
                cancel: CancellationToken::new(),
                watch,
            },
        );

        Ok(EnqueueOutcome::Enqueued { run_id })
    }

    fn update_step(&mut self, run_id: &str, current: u32, max: u32, description: Option<String>) {
        let Some(entry) = self.jobs.get_mut(run_id) else {
            debug!(run_id = %run_id, "step update for unknown or finished job ignored");
            return;
        };
        entry.snapshot.current_step = current;
        entry.snapshot.max_step = max;
        entry.snapshot.step_description = description;
        entry.publish();
        self.progress.broadcast_step_progress(
            run_id,
            current,
            max,
            entry.snapshot.step_description.as_deref(),
        );
    }

    fn cancel(&mut self, run_id: &str) -> bool {
        let Some(entry) = self.jobs.get(run_id) else {
            return false;
        };
        match entry.snapshot.status {
            JobStatus::Queued => {
                info!(run_id = %run_id, "cancelled queued job");
                self.complete(run_id, JobOutcome::Cancelled);
                true
            }
            JobStatus::Running => {
                info!(run_id = %run_id, "cancellation requested for running job");
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn finish(&mut self, run_id: &str, outcome: JobOutcome) {
        let Some(entry) = self.jobs.get(run_id) else {
            warn!(run_id = %run_id, "completion for unknown job");
            return;
        };
        let scope = entry.snapshot.scope.clone();
        let outcome = match outcome {
            JobOutcome::Failed { .. } if entry.cancel.is_cancelled() => JobOutcome::Cancelled,
            other => other,
        };
        self.running = self.running.saturating_sub(1);
        self.busy_scopes.remove(&scope);
        self.complete(run_id, outcome);
    }

    /// Move a job to its terminal status and into history.
    fn complete(&mut self, run_id: &str, outcome: JobOutcome) {
        let Some(mut entry) = self.jobs.remove(run_id) else {
            return;
        };

        if let Some(key) = &entry.snapshot.dedup_key {
            if self.dedup.get(key).map(String::as_str) == Some(run_id) {
                self.dedup.remove(key);
            }
        }

        let status = outcome.status();
        entry.snapshot.status = status;
        entry.snapshot.message = outcome.message().map(str::to_string);
        entry.snapshot.finished_at = Some(Utc::now());
        entry.publish();

        match &outcome {
            JobOutcome::Completed { message } => {
                info!(run_id = %run_id, message = ?message, "job completed");
                if let Some(message) = message {
                    self.progress.append(run_id, message, ProgressLevel::Info);
                }
            }
            JobOutcome::Failed { message } => {
                warn!(run_id = %run_id, error = %message, "job failed");
                self.progress.append(run_id, message, ProgressLevel::Error);
            }
            JobOutcome::Cancelled => {
                info!(run_id = %run_id, "job cancelled");
            }
        }
        self.progress.broadcast_completion(run_id, status.as_str());

        self.history.push_back(run_id.to_string());
        self.finished.insert(run_id.to_string(), entry.snapshot);
        while self.history.len() > self.settings.history_limit {
            if let Some(evicted) = self.history.pop_front() {
                self.finished.remove(&evicted);
            }
        }
    }

    /// Start queued jobs while worker slots and idle scopes allow.
    fn dispatch(&mut self) {
        while self.running < self.settings.max_concurrency {
            let Some(run_id) = self.next_runnable() else {
                break;
            };
            self.start(&run_id);
        }
    }

    /// Pop the best queued job among idle scopes.
    fn next_runnable(&mut self) -> Option<String> {
        loop {
            let mut best: Option<(i32, u64, String)> = None;
            for (scope, queue) in &self.queues {
                if self.busy_scopes.contains(scope) {
                    continue;
                }
                if let Some(Reverse((priority, seq, _))) = queue.peek() {
                    let better = match &best {
                        Some((p, s, _)) => (*priority, *seq) < (*p, *s),
                        None => true,
                    };
                    if better {
                        best = Some((*priority, *seq, scope.clone()));
                    }
                }
            }

            let (_, _, scope) = best?;
            let queue = self.queues.get_mut(&scope)?;
            let Reverse((_, _, run_id)) = queue.pop()?;
            if queue.is_empty() {
                self.queues.remove(&scope);
            }

            // Jobs cancelled while queued are already gone from the table.
            if self.jobs.contains_key(&run_id) {
                return Some(run_id);
            }
        }
    }

    fn start(&mut self, run_id: &str) {
        let Some(commands) = self.commands.upgrade() else {
            // Every handle is gone; the job was already popped from its queue.
            warn!(run_id = %run_id, "no dispatcher handles left; job not started");
            self.complete(run_id, JobOutcome::Cancelled);
            return;
        };
        let Some(entry) = self.jobs.get_mut(run_id) else {
            return;
        };
        let Some(work) = entry.work.take() else {
            return;
        };

        entry.snapshot.status = JobStatus::Running;
        entry.snapshot.started_at = Some(Utc::now());
        entry.publish();

        self.running += 1;
        self.busy_scopes.insert(entry.snapshot.scope.clone());

        info!(
            run_id = %run_id,
            operation = %entry.snapshot.operation,
            scope = %entry.snapshot.scope,
            "job started"
        );
        self.progress
            .append(run_id, &format!("Started {}", entry.snapshot.operation), ProgressLevel::Info);
        self.progress.broadcast_step_progress(
            run_id,
            entry.snapshot.current_step,
            entry.snapshot.max_step,
            entry.snapshot.step_description.as_deref(),
        );

        let handle = TaskDispatcher::from_parts(commands.clone(), self.registry.clone());
        let ctx = JobContext::new(
            run_id.to_string(),
            entry.snapshot.operation.clone(),
            entry.snapshot.scope.clone(),
            Arc::new(entry.snapshot.metadata.clone()),
            entry.cancel.clone(),
            self.progress.clone(),
            handle,
        );
        let run_id = run_id.to_string();

        tokio::spawn(async move {
            // Build and run the work inside its own task so a panic, even one
            // raised before the future exists, surfaces as a JoinError.
            let outcome = match tokio::spawn(async move { work(ctx).await }).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => JobOutcome::Cancelled,
                Err(e) => JobOutcome::failed(format!("job panicked: {}", e)),
            };
            let _ = commands.send(Command::Finished { run_id, outcome });
        });
    }

    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        if !self.shutting_down {
            info!(
                running = self.running,
                queued = self.jobs.len().saturating_sub(self.running),
                "task dispatcher shutting down"
            );
            self.shutting_down = true;

            let queued: Vec<String> = self
                .jobs
                .iter()
                .filter(|(_, e)| e.snapshot.status == JobStatus::Queued)
                .map(|(id, _)| id.clone())
                .collect();
            for run_id in queued {
                self.complete(&run_id, JobOutcome::Cancelled);
            }
            self.queues.clear();

            for entry in self.jobs.values() {
                entry.cancel.cancel();
            }
        }
        self.shutdown_waiters.push(reply);
    }
}
