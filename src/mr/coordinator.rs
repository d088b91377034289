use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Instant};
use tonic::{transport::Server, Request, Response, Status};
use tracing::{debug, info, warn};

use crate::mr::config::CoordinatorConfig;
use crate::mr::rpc::mr_types::{
    coordinator_server::{Coordinator, CoordinatorServer},
    AskForTaskReply, AskForTaskRequest, PingReply, PingRequest, RegisterReply, RegisterRequest,
    ReportFinishedTaskReply, ReportFinishedTaskRequest, RpcResult, StatusCode, Task, TaskType,
};
use crate::mr::rpc::Assignment;
use crate::mr::worker::intermediate_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    Mapping,
    Reducing,
    Done,
}

impl Default for WorkloadPhase {
    fn default() -> Self {
        WorkloadPhase::Mapping
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    InProgress { worker_id: u64, assigned_at: Instant },
    Completed,
}

#[derive(Debug)]
struct TaskEntry {
    task: Task,
    state: TaskState,
}

impl TaskEntry {
    fn idle(task: Task) -> Self {
        TaskEntry {
            task,
            state: TaskState::Idle,
        }
    }
}

#[derive(Debug)]
struct WorkerRecord {
    last_seen: Instant,
}

/// What a `ReportFinishedTask` did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Completed,
    /// Accepted without a state change.
    Ignored(String),
    NotFound,
}

/// Task registry for one job. Map tasks carry ids `0..M`, reduce tasks
/// `M..M+R`; reduce tasks only exist once every map task has completed.
#[derive(Debug, Default)]
pub struct MRCoordinator {
    num_map_tasks: u32,
    num_reduce_tasks: u32,

    map_tasks: Vec<TaskEntry>,
    reduce_tasks: Vec<TaskEntry>,

    completed_map_tasks: u32,
    completed_reduce_tasks: u32,

    workload_phase: WorkloadPhase,

    workers: HashMap<u64, WorkerRecord>,
    next_worker_id: u64,
}

impl MRCoordinator {
    pub fn new(files: Vec<String>, n_reduce: u32) -> Self {
        let mut coordinator = MRCoordinator {
            num_map_tasks: files.len() as u32,
            num_reduce_tasks: n_reduce,
            map_tasks: Self::gen_map_tasks(files, n_reduce),
            next_worker_id: 1,
            ..Default::default()
        };
        // with no inputs the map phase is already over
        coordinator.maybe_advance();
        coordinator
    }

    fn gen_map_tasks(files: Vec<String>, n_reduce: u32) -> Vec<TaskEntry> {
        files
            .into_iter()
            .enumerate()
            .map(|(i, f)| {
                TaskEntry::idle(Task {
                    id: i as u32,
                    task_type: TaskType::Map as i32,
                    inputs: vec![f],
                    n_reduce,
                    partition: 0,
                })
            })
            .collect()
    }

    fn gen_reduce_tasks(num_map: u32, n_reduce: u32) -> Vec<TaskEntry> {
        (0..n_reduce)
            .map(|p| {
                TaskEntry::idle(Task {
                    id: num_map + p,
                    task_type: TaskType::Reduce as i32,
                    inputs: (0..num_map).map(|m| intermediate_name(m, p)).collect(),
                    n_reduce,
                    partition: p,
                })
            })
            .collect()
    }

    pub fn phase(&self) -> WorkloadPhase {
        self.workload_phase
    }

    pub fn done(&self) -> bool {
        self.workload_phase == WorkloadPhase::Done
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn last_seen(&self, worker_id: u64) -> Option<Instant> {
        self.workers.get(&worker_id).map(|w| w.last_seen)
    }

    pub fn task_state(&self, task_id: u32) -> Option<TaskState> {
        self.task(task_id).map(|e| e.state)
    }

    fn task(&self, task_id: u32) -> Option<&TaskEntry> {
        if task_id < self.num_map_tasks {
            self.map_tasks.get(task_id as usize)
        } else {
            self.reduce_tasks.get((task_id - self.num_map_tasks) as usize)
        }
    }

    fn task_mut(&mut self, task_id: u32) -> Option<&mut TaskEntry> {
        if task_id < self.num_map_tasks {
            self.map_tasks.get_mut(task_id as usize)
        } else {
            self.reduce_tasks
                .get_mut((task_id - self.num_map_tasks) as usize)
        }
    }

    fn current_tasks_mut(&mut self) -> Option<&mut Vec<TaskEntry>> {
        match self.workload_phase {
            WorkloadPhase::Mapping => Some(&mut self.map_tasks),
            WorkloadPhase::Reducing => Some(&mut self.reduce_tasks),
            WorkloadPhase::Done => None,
        }
    }

    fn touch(&mut self, worker_id: u64, now: Instant) {
        if let Some(w) = self.workers.get_mut(&worker_id) {
            w.last_seen = now;
        }
    }

    pub fn register_worker(&mut self, now: Instant) -> u64 {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        self.workers.insert(id, WorkerRecord { last_seen: now });
        id
    }

    /// Returns false for a worker id this coordinator never issued.
    pub fn ping(&mut self, worker_id: u64, now: Instant) -> bool {
        match self.workers.get_mut(&worker_id) {
            Some(w) => {
                w.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Hands out the oldest idle task of the current phase, if any.
    pub fn assign_task(&mut self, worker_id: u64, now: Instant) -> Assignment {
        self.touch(worker_id, now);
        let tasks = match self.current_tasks_mut() {
            Some(tasks) => tasks,
            None => return Assignment::JobDone,
        };
        match tasks.iter_mut().find(|e| e.state == TaskState::Idle) {
            Some(entry) => {
                entry.state = TaskState::InProgress {
                    worker_id,
                    assigned_at: now,
                };
                Assignment::Task(entry.task.clone())
            }
            None => Assignment::NoTaskYet,
        }
    }

    /// Only the worker currently holding a task can complete it; every other
    /// report is accepted and leaves the registry untouched.
    pub fn report_finished(&mut self, worker_id: u64, task_id: u32, now: Instant) -> ReportOutcome {
        self.touch(worker_id, now);
        let entry = match self.task_mut(task_id) {
            Some(entry) => entry,
            None => return ReportOutcome::NotFound,
        };
        let task_type = entry.task.task_type;
        let state = entry.state;
        match state {
            TaskState::Completed => return ReportOutcome::Ignored("already completed".to_string()),
            TaskState::Idle => return ReportOutcome::Ignored("task is not in progress".to_string()),
            TaskState::InProgress { worker_id: holder, .. } if holder != worker_id => {
                return ReportOutcome::Ignored(format!("task was reassigned to worker {}", holder));
            }
            TaskState::InProgress { .. } => entry.state = TaskState::Completed,
        }

        if task_type == TaskType::Map as i32 {
            self.completed_map_tasks += 1;
        } else {
            self.completed_reduce_tasks += 1;
        }
        self.maybe_advance();
        ReportOutcome::Completed
    }

    fn maybe_advance(&mut self) {
        if self.workload_phase == WorkloadPhase::Mapping
            && self.completed_map_tasks == self.num_map_tasks
        {
            info!("REDUCING...");
            self.reduce_tasks = Self::gen_reduce_tasks(self.num_map_tasks, self.num_reduce_tasks);
            self.workload_phase = WorkloadPhase::Reducing;
        }
        if self.workload_phase == WorkloadPhase::Reducing
            && self.completed_reduce_tasks == self.num_reduce_tasks
        {
            info!("COMPLETE");
            self.workload_phase = WorkloadPhase::Done;
        }
    }

    /// Returns every in-progress task older than `timeout` to the idle pool
    /// and yields their ids.
    pub fn reset_timeout_tasks(&mut self, now: Instant, timeout: Duration) -> Vec<u32> {
        let tasks = match self.current_tasks_mut() {
            Some(tasks) => tasks,
            None => return vec![],
        };
        let mut reset = vec![];
        for entry in tasks.iter_mut() {
            if let TaskState::InProgress { assigned_at, .. } = entry.state {
                if now.saturating_duration_since(assigned_at) > timeout {
                    entry.state = TaskState::Idle;
                    reset.push(entry.task.id);
                }
            }
        }
        reset
    }
}

/// The tonic service: one registry behind one lock, shared with the fault
/// monitor.
#[derive(Debug, Clone)]
pub struct MutexMRCoordinator {
    locked_coordinator: Arc<Mutex<MRCoordinator>>,
    job_done: Arc<Notify>,
}

impl MutexMRCoordinator {
    pub fn new(files: Vec<String>, n_reduce: u32) -> Self {
        MutexMRCoordinator {
            locked_coordinator: Arc::new(Mutex::new(MRCoordinator::new(files, n_reduce))),
            job_done: Arc::new(Notify::new()),
        }
    }

    pub async fn done(&self) -> bool {
        self.locked_coordinator.lock().await.done()
    }

    pub async fn phase(&self) -> WorkloadPhase {
        self.locked_coordinator.lock().await.phase()
    }

    /// Resolves once the last reduce task has been reported.
    pub async fn wait_done(&self) {
        loop {
            if self.done().await {
                return;
            }
            self.job_done.notified().await;
        }
    }

    async fn reset_timeout_tasks(
        crdnt_cpy: Arc<Mutex<MRCoordinator>>,
        sweep_interval: Duration,
        timeout: Duration,
    ) {
        info!("start the running tasks checker...");
        let mut ticker = time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let mut coordinator = crdnt_cpy.lock().await;
            if coordinator.done() {
                return;
            }
            for task_id in coordinator.reset_timeout_tasks(Instant::now(), timeout) {
                warn!(task_id, "running task timed out, returning it to the idle pool");
            }
        }
    }

    /// Starts the fault monitor and serves until the job is done and the
    /// shutdown grace period has passed.
    pub async fn serve(self, config: CoordinatorConfig) -> Result<()> {
        config.validate()?;
        let crdnt_cpy = self.locked_coordinator.clone();
        let monitor = tokio::spawn(Self::reset_timeout_tasks(
            crdnt_cpy,
            config.sweep_interval,
            config.task_timeout,
        ));
        let shutdown = self.shutdown_signal(config.shutdown_grace);

        info!(addr = %config.addr, n_reduce = config.n_reduce, "MAPPING...");
        Server::builder()
            .add_service(CoordinatorServer::new(self))
            .serve_with_shutdown(config.addr, shutdown)
            .await?;
        monitor.abort();
        Ok(())
    }

    fn shutdown_signal(&self, grace: Duration) -> impl Future<Output = ()> {
        let coordinator = self.clone();
        async move {
            coordinator.wait_done().await;
            info!("job complete, shutting down in {:?}", grace);
            time::sleep(grace).await;
        }
    }

    pub async fn run(files: Vec<String>, config: CoordinatorConfig) -> Result<()> {
        config.validate()?;
        Self::new(files, config.n_reduce).serve(config).await
    }
}

#[tonic::async_trait]
impl Coordinator for MutexMRCoordinator {
    async fn register(
        &self,
        _request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterReply>, Status> {
        let mut coordinator = self.locked_coordinator.lock().await;
        let worker_id = coordinator.register_worker(Instant::now());
        info!(worker_id, "registered worker");
        Ok(Response::new(RegisterReply {
            worker_id,
            result: Some(RpcResult::success()),
        }))
    }

    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingReply>, Status> {
        let worker_id = request.into_inner().worker_id;
        let mut coordinator = self.locked_coordinator.lock().await;
        let result = if coordinator.ping(worker_id, Instant::now()) {
            RpcResult::success()
        } else {
            debug!(worker_id, "ping from unknown worker");
            RpcResult::with(StatusCode::NotFound, format!("unknown worker {}", worker_id))
        };
        Ok(Response::new(PingReply {
            result: Some(result),
        }))
    }

    async fn ask_for_task(
        &self,
        request: Request<AskForTaskRequest>,
    ) -> Result<Response<AskForTaskReply>, Status> {
        let worker_id = request.into_inner().worker_id;
        let mut coordinator = self.locked_coordinator.lock().await;
        let reply = match coordinator.assign_task(worker_id, Instant::now()) {
            Assignment::Task(task) => {
                info!(worker_id, task_id = task.id, task_type = ?TaskType::from_i32(task.task_type), "assigned task");
                AskForTaskReply {
                    task: Some(task),
                    result: Some(RpcResult::success()),
                }
            }
            Assignment::NoTaskYet => AskForTaskReply {
                task: None,
                result: Some(RpcResult::with(StatusCode::NoTaskYet, "no idle task")),
            },
            Assignment::JobDone => AskForTaskReply {
                task: None,
                result: Some(RpcResult::with(StatusCode::JobDone, "job finished")),
            },
        };
        Ok(Response::new(reply))
    }

    async fn report_finished_task(
        &self,
        request: Request<ReportFinishedTaskRequest>,
    ) -> Result<Response<ReportFinishedTaskReply>, Status> {
        let req_inner = request.into_inner();
        let (worker_id, task_id) = (req_inner.worker_id, req_inner.task_id);
        let mut coordinator = self.locked_coordinator.lock().await;
        let result = match coordinator.report_finished(worker_id, task_id, Instant::now()) {
            ReportOutcome::Completed => {
                info!(worker_id, task_id, "task has completed");
                if coordinator.done() {
                    self.job_done.notify_one();
                }
                RpcResult::success()
            }
            ReportOutcome::Ignored(reason) => {
                info!(worker_id, task_id, %reason, "ignoring report");
                RpcResult::with(StatusCode::Success, reason)
            }
            ReportOutcome::NotFound => {
                warn!(worker_id, task_id, "report for unknown task");
                RpcResult::with(StatusCode::NotFound, format!("unknown task {}", task_id))
            }
        };
        Ok(Response::new(ReportFinishedTaskReply {
            result: Some(result),
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    fn files(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("pg-{}.txt", i)).collect()
    }

    fn take(c: &mut MRCoordinator, worker_id: u64, now: Instant) -> Task {
        match c.assign_task(worker_id, now) {
            Assignment::Task(t) => t,
            other => panic!("expected a task, got {:?}", other),
        }
    }

    fn finish_maps(c: &mut MRCoordinator, n: usize, now: Instant) {
        for _ in 0..n {
            let t = take(c, 1, now);
            assert_eq!(c.report_finished(1, t.id, now), ReportOutcome::Completed);
        }
    }

    #[test]
    fn test_register_issues_distinct_ids() {
        let mut c = MRCoordinator::new(files(1), 1);
        let now = Instant::now();
        let ids: HashSet<u64> = (0..50).map(|_| c.register_worker(now)).collect();
        assert_eq!(ids.len(), 50);
        assert_eq!(c.num_workers(), 50);
    }

    #[test]
    fn test_ping_refreshes_last_seen() {
        let mut c = MRCoordinator::new(files(1), 1);
        let t0 = Instant::now();
        let id = c.register_worker(t0);
        let t1 = t0 + Duration::from_secs(3);
        assert!(c.ping(id, t1));
        assert_eq!(c.last_seen(id), Some(t1));
        assert!(!c.ping(id + 100, t1));
    }

    #[test]
    fn test_map_tasks_are_fifo() {
        let mut c = MRCoordinator::new(files(3), 2);
        let now = Instant::now();
        let ids: Vec<u32> = (0..3).map(|_| take(&mut c, 1, now).id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(c.assign_task(1, now), Assignment::NoTaskYet);

        let t = c.map_tasks[1].task.clone();
        assert_eq!(t.inputs, vec!["pg-1.txt".to_string()]);
        assert_eq!(t.n_reduce, 2);
    }

    #[test]
    fn test_no_reduce_task_while_mapping() {
        let mut c = MRCoordinator::new(files(2), 3);
        let now = Instant::now();
        let first = take(&mut c, 1, now);
        let _second = take(&mut c, 2, now);
        assert_eq!(c.report_finished(1, first.id, now), ReportOutcome::Completed);
        assert_eq!(c.phase(), WorkloadPhase::Mapping);
        assert_eq!(c.assign_task(3, now), Assignment::NoTaskYet);
        // a reduce id is unknown until the reduce phase begins
        assert_eq!(c.report_finished(1, 2, now), ReportOutcome::NotFound);
    }

    #[test]
    fn test_phase_advances_to_reduce_then_done() {
        let mut c = MRCoordinator::new(files(2), 2);
        let now = Instant::now();
        finish_maps(&mut c, 2, now);
        assert_eq!(c.phase(), WorkloadPhase::Reducing);

        let r0 = take(&mut c, 1, now);
        let r1 = take(&mut c, 2, now);
        assert_eq!(r0.task_type, TaskType::Reduce as i32);
        assert_eq!((r0.id, r0.partition), (2, 0));
        assert_eq!((r1.id, r1.partition), (3, 1));
        assert_eq!(r1.inputs, vec!["mr-0-1".to_string(), "mr-1-1".to_string()]);

        assert_eq!(c.report_finished(1, r0.id, now), ReportOutcome::Completed);
        assert!(!c.done());
        assert_eq!(c.report_finished(2, r1.id, now), ReportOutcome::Completed);
        assert!(c.done());
        assert_eq!(c.assign_task(1, now), Assignment::JobDone);
    }

    #[test]
    fn test_no_inputs_skips_map_phase() {
        let mut c = MRCoordinator::new(vec![], 2);
        assert_eq!(c.phase(), WorkloadPhase::Reducing);
        let t = take(&mut c, 1, Instant::now());
        assert!(t.inputs.is_empty());
    }

    #[test]
    fn test_report_is_idempotent() {
        let mut c = MRCoordinator::new(files(2), 1);
        let now = Instant::now();
        let t = take(&mut c, 7, now);
        assert_eq!(c.report_finished(7, t.id, now), ReportOutcome::Completed);
        assert!(matches!(c.report_finished(7, t.id, now), ReportOutcome::Ignored(_)));
        assert_eq!(c.task_state(t.id), Some(TaskState::Completed));
        assert_eq!(c.completed_map_tasks, 1);
        assert_eq!(c.phase(), WorkloadPhase::Mapping);
    }

    #[test]
    fn test_unknown_task_is_not_found() {
        let mut c = MRCoordinator::new(files(1), 1);
        assert_eq!(c.report_finished(1, 99, Instant::now()), ReportOutcome::NotFound);
    }

    #[test]
    fn test_timeout_returns_task_to_idle() {
        let mut c = MRCoordinator::new(files(2), 1);
        let t0 = Instant::now();
        let timeout = Duration::from_secs(10);
        let t = take(&mut c, 1, t0);

        assert!(c.reset_timeout_tasks(t0 + Duration::from_secs(5), timeout).is_empty());
        assert_eq!(c.reset_timeout_tasks(t0 + Duration::from_secs(11), timeout), vec![t.id]);
        assert_eq!(c.task_state(t.id), Some(TaskState::Idle));

        // the late holder cannot complete a task it no longer owns
        assert!(matches!(c.report_finished(1, t.id, t0), ReportOutcome::Ignored(_)));
        assert_eq!(c.task_state(t.id), Some(TaskState::Idle));
    }

    #[test]
    fn test_straggler_report_does_not_revert_completion() {
        let mut c = MRCoordinator::new(files(1), 1);
        let t0 = Instant::now();
        let timeout = Duration::from_secs(10);
        let t = take(&mut c, 1, t0);
        let later = t0 + Duration::from_secs(20);
        c.reset_timeout_tasks(later, timeout);

        let again = take(&mut c, 2, later);
        assert_eq!(again.id, t.id);
        // straggler reports while the new holder is still working
        assert!(matches!(c.report_finished(1, t.id, later), ReportOutcome::Ignored(_)));
        assert_eq!(
            c.task_state(t.id),
            Some(TaskState::InProgress {
                worker_id: 2,
                assigned_at: later
            })
        );
        assert_eq!(c.report_finished(2, t.id, later), ReportOutcome::Completed);
        assert!(matches!(c.report_finished(1, t.id, later), ReportOutcome::Ignored(_)));
        assert_eq!(c.task_state(t.id), Some(TaskState::Completed));
        assert_eq!(c.phase(), WorkloadPhase::Reducing);
    }

    #[test]
    fn test_completed_map_report_during_reduce_is_noop() {
        let mut c = MRCoordinator::new(files(1), 1);
        let now = Instant::now();
        finish_maps(&mut c, 1, now);
        assert!(matches!(c.report_finished(1, 0, now), ReportOutcome::Ignored(_)));
        assert_eq!(c.phase(), WorkloadPhase::Reducing);
        assert_eq!(c.completed_map_tasks, 1);
    }

    #[test]
    fn test_sweep_after_done_is_noop() {
        let mut c = MRCoordinator::new(files(1), 1);
        let now = Instant::now();
        finish_maps(&mut c, 1, now);
        let r = take(&mut c, 1, now);
        c.report_finished(1, r.id, now);
        assert!(c
            .reset_timeout_tasks(now + Duration::from_secs(100), Duration::from_secs(1))
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_asks_never_share_a_task() {
        let coordinator = MutexMRCoordinator::new(files(8), 2);
        let mut handles = vec![];
        for worker_id in 0..32u64 {
            let c = coordinator.clone();
            handles.push(tokio::spawn(async move {
                let reply = c
                    .ask_for_task(Request::new(AskForTaskRequest { worker_id }))
                    .await
                    .unwrap()
                    .into_inner();
                reply.task.map(|t| t.id)
            }));
        }
        let mut ids = vec![];
        for h in handles {
            if let Some(id) = h.await.unwrap() {
                ids.push(id);
            }
        }
        let unique: HashSet<u32> = ids.iter().copied().collect();
        assert_eq!(ids.len(), 8);
        assert_eq!(unique.len(), 8);
    }

    #[tokio::test]
    async fn test_service_reports_and_finishes() {
        let coordinator = MutexMRCoordinator::new(files(1), 1);
        let worker_id = coordinator
            .register(Request::new(RegisterRequest {}))
            .await
            .unwrap()
            .into_inner()
            .worker_id;

        for _ in 0..2 {
            let task = coordinator
                .ask_for_task(Request::new(AskForTaskRequest { worker_id }))
                .await
                .unwrap()
                .into_inner()
                .task
                .unwrap();
            let reply = coordinator
                .report_finished_task(Request::new(ReportFinishedTaskRequest {
                    worker_id,
                    task_id: task.id,
                }))
                .await
                .unwrap()
                .into_inner();
            assert_eq!(reply.result.unwrap().status(), StatusCode::Success);
        }
        assert!(coordinator.done().await);
        coordinator.wait_done().await;

        let reply = coordinator
            .ask_for_task(Request::new(AskForTaskRequest { worker_id }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.result.unwrap().status(), StatusCode::JobDone);

        let reply = coordinator
            .report_finished_task(Request::new(ReportFinishedTaskRequest {
                worker_id,
                task_id: 42,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.result.unwrap().status(), StatusCode::NotFound);
    }
}
