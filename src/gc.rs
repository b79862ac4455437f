//! Replica garbage collection.
//!
//! A single cooperative task queue, drained by one thread (or stepped
//! manually in tests). Tasks do one bounded unit of work per step and ask
//! to run again rather than looping, so a large backlog never starves the
//! queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::{SegmentId, ServerId};
use crate::index::ReplicaIndex;

/// What a task wants after one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStep {
    Done,
    Again,
}

pub trait GcTask: Send {
    fn perform(&mut self) -> TaskStep;
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Box<dyn GcTask>>,
    stopped: bool,
}

/// FIFO of cooperative tasks. Single-threaded by construction: only one
/// drainer runs `perform_task`, so tasks need no locks among themselves.
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, task: Box<dyn GcTask>) {
        let mut state = self.lock();
        state.tasks.push_back(task);
        drop(state);
        self.available.notify_one();
    }

    pub fn outstanding_tasks(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Run one task for one step. Returns false when the queue was empty.
    pub fn perform_task(&self) -> bool {
        let task = self.lock().tasks.pop_front();
        let Some(mut task) = task else {
            return false;
        };
        if task.perform() == TaskStep::Again {
            self.schedule(task);
        }
        true
    }

    /// Drain until [`TaskQueue::stop`]. Intended for a dedicated thread.
    pub fn run_until_stopped(&self) {
        loop {
            let mut state = self.lock();
            while state.tasks.is_empty() && !state.stopped {
                state = self
                    .available
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
            if state.stopped {
                return;
            }
            let Some(mut task) = state.tasks.pop_front() else {
                continue;
            };
            drop(state);
            if task.perform() == TaskStep::Again {
                self.schedule(task);
            }
        }
    }

    pub fn stop(&self) {
        self.lock().stopped = true;
        self.available.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The master is gone from the cluster; the cluster has recovered
    /// without this replica.
    #[error("master is no longer in the cluster")]
    ServerGone,
    #[error("probe failed: {reason}")]
    Transient { reason: String },
}

/// Outstanding is-replica-needed request. Consuming it may block until the
/// response arrives.
pub trait ReplicaNeededProbe: Send {
    fn result(self: Box<Self>) -> Result<bool, ProbeError>;
}

/// Seam to the master-side RPC surface; transport lives outside this crate.
pub trait MasterClient: Send + Sync {
    fn begin_is_replica_needed(
        &self,
        master: ServerId,
        segment_id: SegmentId,
    ) -> Box<dyn ReplicaNeededProbe>;
}

/// Closure-backed client, mainly for tests and embedding shims.
pub struct ProbeFn<F>(pub F);

struct ReadyProbe(Result<bool, ProbeError>);

impl ReplicaNeededProbe for ReadyProbe {
    fn result(self: Box<Self>) -> Result<bool, ProbeError> {
        self.0
    }
}

impl<F> MasterClient for ProbeFn<F>
where
    F: Fn(ServerId, SegmentId) -> Result<bool, ProbeError> + Send + Sync,
{
    fn begin_is_replica_needed(
        &self,
        master: ServerId,
        segment_id: SegmentId,
    ) -> Box<dyn ReplicaNeededProbe> {
        Box::new(ReadyProbe((self.0)(master, segment_id)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    Up,
    Crashed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerEvent {
    Added,
    Crashed,
    Removed,
}

/// Mirror of the coordinator's server list, fed by membership updates.
///
/// The status map answers GC's liveness questions; the change channel lets
/// the service turn removals into down-server tasks.
#[derive(Clone)]
pub struct ServerTracker {
    servers: Arc<Mutex<HashMap<ServerId, ServerStatus>>>,
    tx: Sender<(ServerId, TrackerEvent)>,
    rx: Receiver<(ServerId, TrackerEvent)>,
}

impl Default for ServerTracker {
    fn default() -> Self {
        let (tx, rx) = unbounded();
        Self {
            servers: Arc::new(Mutex::new(HashMap::new())),
            tx,
            rx,
        }
    }
}

impl ServerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_change(&self, server: ServerId, event: TrackerEvent) {
        {
            let mut servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
            match event {
                TrackerEvent::Added => {
                    servers.insert(server, ServerStatus::Up);
                }
                TrackerEvent::Crashed => {
                    servers.insert(server, ServerStatus::Crashed);
                }
                TrackerEvent::Removed => {
                    servers.remove(&server);
                }
            }
        }
        let _ = self.tx.send((server, event));
    }

    /// None once the server has been removed (or was never seen).
    pub fn status_of(&self, server: ServerId) -> Option<ServerStatus> {
        self.servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&server)
            .copied()
    }

    pub fn drain_changes(&self) -> Vec<(ServerId, TrackerEvent)> {
        self.rx.try_iter().collect()
    }
}

/// Frees every replica of a server the coordinator has removed, one replica
/// per step so long backlogs yield the queue.
pub struct DownServerGcTask {
    enabled: Arc<AtomicBool>,
    index: ReplicaIndex,
    master: ServerId,
}

impl DownServerGcTask {
    pub fn new(enabled: Arc<AtomicBool>, index: ReplicaIndex, master: ServerId) -> Self {
        Self {
            enabled,
            index,
            master,
        }
    }
}

impl GcTask for DownServerGcTask {
    fn perform(&mut self) -> TaskStep {
        if !self.enabled.load(Ordering::Relaxed) {
            return TaskStep::Done;
        }
        match self.index.remove_first_of(self.master) {
            Some(replica) => {
                info!(
                    master = %self.master,
                    segment_id = %replica.segment_id,
                    "freeing replica of removed server"
                );
                replica.free();
                TaskStep::Again
            }
            None => TaskStep::Done,
        }
    }
}

/// Probes the master for each replica revived from storage at restart, and
/// frees the ones the master no longer needs.
///
/// At most one probe is outstanding at a time: a step either sends the next
/// probe or consumes the previous response.
pub struct FoundOnStorageGcTask {
    enabled: Arc<AtomicBool>,
    index: ReplicaIndex,
    tracker: ServerTracker,
    master_client: Arc<dyn MasterClient>,
    master: ServerId,
    segment_ids: VecDeque<SegmentId>,
    probe: Option<Box<dyn ReplicaNeededProbe>>,
}

impl FoundOnStorageGcTask {
    pub fn new(
        enabled: Arc<AtomicBool>,
        index: ReplicaIndex,
        tracker: ServerTracker,
        master_client: Arc<dyn MasterClient>,
        master: ServerId,
        segment_ids: Vec<SegmentId>,
    ) -> Self {
        Self {
            enabled,
            index,
            tracker,
            master_client,
            master,
            segment_ids: segment_ids.into(),
            probe: None,
        }
    }

    fn free_front(&mut self, segment_id: SegmentId) {
        if let Some(replica) = self.index.remove(self.master, segment_id) {
            replica.free();
        }
        self.segment_ids.pop_front();
    }
}

impl GcTask for FoundOnStorageGcTask {
    fn perform(&mut self) -> TaskStep {
        if !self.enabled.load(Ordering::Relaxed) {
            return TaskStep::Done;
        }
        let Some(&segment_id) = self.segment_ids.front() else {
            return TaskStep::Done;
        };

        if self.index.get(self.master, segment_id).is_none() {
            // Freed by some other path already; nothing left to decide.
            self.probe = None;
            self.segment_ids.pop_front();
            return TaskStep::Again;
        }

        if let Some(probe) = self.probe.take() {
            match probe.result() {
                Ok(false) => {
                    info!(
                        master = %self.master,
                        segment_id = %segment_id,
                        "master has recovered from lost replica; freeing replica"
                    );
                    self.free_front(segment_id);
                }
                Ok(true) => {
                    info!(
                        master = %self.master,
                        segment_id = %segment_id,
                        "master has not recovered from lost replica; retaining replica, \
                         will probe again later"
                    );
                    self.segment_ids.rotate_left(1);
                }
                Err(ProbeError::ServerGone) => {
                    info!(
                        master = %self.master,
                        segment_id = %segment_id,
                        "master gone from cluster; freeing replica"
                    );
                    self.free_front(segment_id);
                }
                Err(err) => {
                    warn!(
                        master = %self.master,
                        segment_id = %segment_id,
                        %err,
                        "replica-needed probe failed; will retry"
                    );
                }
            }
            return TaskStep::Again;
        }

        match self.tracker.status_of(self.master) {
            None => {
                // Removed from the server list entirely: the cluster has
                // recovered from this master's failure without the replica.
                info!(
                    master = %self.master,
                    segment_id = %segment_id,
                    "master marked down; cluster has recovered from its failure; freeing replica"
                );
                self.free_front(segment_id);
            }
            Some(ServerStatus::Crashed) => {
                debug!(
                    master = %self.master,
                    segment_id = %segment_id,
                    "master marked crashed; waiting for cluster to recover from its failure \
                     before freeing replica"
                );
            }
            Some(ServerStatus::Up) => {
                self.probe = Some(
                    self.master_client
                        .begin_is_replica_needed(self.master, segment_id),
                );
            }
        }
        TaskStep::Again
    }
}
