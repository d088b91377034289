use std::fs;
use std::hash::Hasher;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::mr::app::{Application, MapFunc, ReduceFunc};
use crate::mr::config::WorkerConfig;
use crate::mr::rpc::mr_types::{Task, TaskType};
use crate::mr::rpc::{Assignment, CoordinatorGateway, RpcError};
use crate::util::retry::{retry, Backoff};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Intermediate file written by map task `map_id` for reduce `partition`.
pub fn intermediate_name(map_id: u32, partition: u32) -> String {
    format!("mr-{}-{}", map_id, partition)
}

/// Final output of reduce `partition`.
pub fn output_name(partition: u32) -> String {
    format!("mr-out-{}", partition)
}

/// FNV-1a of the key bytes, masked to 31 bits.
pub fn ihash(key: &str) -> u32 {
    let mut fnv_hasher = FnvHasher::default();
    fnv_hasher.write(key.as_bytes());
    (fnv_hasher.finish() & 0x7fff_ffff) as u32
}

pub fn partition_of(key: &str, n_reduce: u32) -> u32 {
    ihash(key) % n_reduce
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("registration failed: {0}")]
    Registration(#[source] RpcError),

    #[error("malformed task {task_id}: {reason}")]
    MalformedTask { task_id: u32, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad record data in {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("task execution aborted: {0}")]
    Aborted(String),
}

impl WorkerError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        WorkerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Fatal errors end the worker process; everything else leaves the task
    /// to the coordinator's timeout.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::Registration(_) | WorkerError::MalformedTask { .. }
        )
    }
}

/// Writes a file under `dir` so that `name` only ever shows complete
/// contents: the data goes to a private temp file which is then renamed.
fn publish<F>(dir: &Path, name: &str, write: F) -> Result<PathBuf, WorkerError>
where
    F: FnOnce(&mut BufWriter<&fs::File>) -> Result<(), WorkerError>,
{
    let final_path = dir.join(name);
    let tmp = tempfile::Builder::new()
        .prefix(".mr-tmp-")
        .tempfile_in(dir)
        .map_err(|e| WorkerError::io(dir, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        write(&mut writer)?;
        writer.flush().map_err(|e| WorkerError::io(tmp.path(), e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| WorkerError::io(tmp.path(), e))?;
    tmp.persist(&final_path)
        .map_err(|e| WorkerError::io(&final_path, e.error))?;
    Ok(final_path)
}

fn malformed(task: &Task, reason: impl Into<String>) -> WorkerError {
    WorkerError::MalformedTask {
        task_id: task.id,
        reason: reason.into(),
    }
}

/// Runs the map function over the task's single input and publishes one
/// intermediate file per reduce partition, empty ones included.
pub fn execute_map(task: &Task, work_dir: &Path, mapfunc: MapFunc) -> Result<Vec<PathBuf>, WorkerError> {
    if task.inputs.len() != 1 {
        return Err(malformed(
            task,
            format!("map task needs exactly one input, got {}", task.inputs.len()),
        ));
    }
    if task.n_reduce == 0 {
        return Err(malformed(task, "map task with zero reduce partitions"));
    }

    let inp_file = &task.inputs[0];
    let content = fs::read_to_string(inp_file).map_err(|e| WorkerError::io(Path::new(inp_file), e))?;
    let intermediate = mapfunc(inp_file, &content);

    let mut buckets: Vec<Vec<KeyValue>> = vec![vec![]; task.n_reduce as usize];
    for kv in intermediate {
        buckets[partition_of(&kv.key, task.n_reduce) as usize].push(kv);
    }

    let mut written = Vec::with_capacity(buckets.len());
    for (partition, bucket) in buckets.iter().enumerate() {
        let name = intermediate_name(task.id, partition as u32);
        let path = publish(work_dir, &name, |w| {
            serde_json::to_writer(w, bucket).map_err(|e| WorkerError::Encode {
                path: PathBuf::from(&name),
                source: e,
            })
        })?;
        debug!(task_id = task.id, path = %path.display(), records = bucket.len(), "wrote intermediate file");
        written.push(path);
    }
    Ok(written)
}

fn read_intermediate(path: &Path) -> Result<Vec<KeyValue>, WorkerError> {
    let data = fs::read(path).map_err(|e| WorkerError::io(path, e))?;
    serde_json::from_slice(&data).map_err(|e| WorkerError::Encode {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Merges every intermediate file of the task's partition and publishes the
/// reduced values, one `key value` line per key in key order.
pub fn execute_reduce(task: &Task, work_dir: &Path, reducefunc: ReduceFunc) -> Result<PathBuf, WorkerError> {
    let mut intermediate = vec![];
    for inp in &task.inputs {
        intermediate.extend(read_intermediate(&work_dir.join(inp))?);
    }
    // sort lexicographically
    intermediate.sort_by(|a, b| a.key.cmp(&b.key));

    publish(work_dir, &output_name(task.partition), |w| {
        collapse(w, &intermediate, reducefunc).map_err(|e| WorkerError::io(Path::new(&output_name(task.partition)), e))
    })
}

/// Feeds every run of equal keys in the sorted `intermediate` to the reduce
/// function and writes one `key value` line per run.
pub fn collapse<W: Write>(of: &mut W, intermediate: &[KeyValue], reducefunc: ReduceFunc) -> std::io::Result<()> {
    let mut i = 0;
    let len = intermediate.len();
    while i < len {
        let mut j = i;
        while j < len && intermediate[j].key == intermediate[i].key {
            j += 1;
        }
        let vals: Vec<String> = intermediate[i..j].iter().map(|kv| kv.value.clone()).collect();
        let result = reducefunc(&intermediate[i].key, &vals);
        writeln!(of, "{} {}", intermediate[i].key, result)?;
        i = j;
    }
    Ok(())
}

/// Dispatches on the task type.
pub fn execute(task: &Task, work_dir: &Path, app: &Application) -> Result<(), WorkerError> {
    match TaskType::from_i32(task.task_type) {
        Some(TaskType::Map) => execute_map(task, work_dir, app.map).map(|_| ()),
        Some(TaskType::Reduce) => execute_reduce(task, work_dir, app.reduce).map(|_| ()),
        None => Err(malformed(task, format!("unknown task type {}", task.task_type))),
    }
}

/// A worker process: registers, then pulls, runs and reports tasks until the
/// coordinator says the job is finished.
#[derive(Debug)]
pub struct Worker {
    config: WorkerConfig,
    gateway: CoordinatorGateway,
    app: Application,
}

impl Worker {
    pub fn new(config: WorkerConfig, app: Application) -> Self {
        let gateway = CoordinatorGateway::new(config.endpoint.clone(), config.rpc_timeout);
        Worker {
            config,
            gateway,
            app,
        }
    }

    async fn register(&self) -> Result<u64, WorkerError> {
        let backoff = Backoff::fixed(self.config.register_attempts, Duration::from_millis(500));
        retry(backoff, "register", RpcError::is_transport, || self.gateway.register())
            .await
            .map_err(WorkerError::Registration)
    }

    pub async fn run(self) -> Result<(), WorkerError> {
        let worker_id = self.register().await?;
        info!(worker_id, app = self.app.name(), "registered successfully");

        let pinger = tokio::spawn(ping_loop(
            self.gateway.clone(),
            worker_id,
            self.config.ping_interval,
        ));
        let res = self.pull_loop(worker_id).await;
        pinger.abort();
        res
    }

    async fn pull_loop(&self, worker_id: u64) -> Result<(), WorkerError> {
        let mut missed = 0u32;
        loop {
            let reply = self.gateway.ask_for_task(worker_id).await;
            if unreachable_limit_hit(&mut missed, &reply, self.config.max_missed_polls) {
                warn!(worker_id, missed, "coordinator unreachable, assuming the job is over");
                return Ok(());
            }
            match reply {
                Ok(Assignment::Task(task)) => {
                    self.handle_task(worker_id, task).await?;
                    continue;
                }
                Ok(Assignment::NoTaskYet) => debug!("no task available yet"),
                Ok(Assignment::JobDone) => {
                    info!(worker_id, "job finished, stop pulling");
                    return Ok(());
                }
                Err(e) => warn!(worker_id, error = %e, "ask for task failed"),
            }
            time::sleep(self.config.poll_interval).await;
        }
    }

    async fn handle_task(&self, worker_id: u64, task: Task) -> Result<(), WorkerError> {
        let task_id = task.id;
        info!(worker_id, task_id, task_type = ?TaskType::from_i32(task.task_type), "handling task");

        let work_dir = self.config.work_dir.clone();
        let app = self.app.clone();
        let res = tokio::task::spawn_blocking(move || execute(&task, &work_dir, &app))
            .await
            .unwrap_or_else(|e| Err(WorkerError::Aborted(e.to_string())));

        match res {
            Ok(()) => {
                self.report(worker_id, task_id).await;
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!(worker_id, task_id, error = %e, "invariant violated");
                Err(e)
            }
            Err(e) => {
                warn!(worker_id, task_id, error = %e, "task failed, not reporting it");
                Ok(())
            }
        }
    }

    async fn report(&self, worker_id: u64, task_id: u32) {
        let backoff = Backoff::exponential(
            self.config.report_attempts,
            Duration::from_millis(100),
            Duration::from_secs(2),
        );
        let res = retry(backoff, "report", RpcError::is_transport, || {
            self.gateway.report_finished_task(worker_id, task_id)
        })
        .await;
        match res {
            Ok(()) => info!(worker_id, task_id, "reported task finished"),
            Err(e) => warn!(worker_id, task_id, error = %e, "report finished task failed"),
        }
    }
}

// Counts consecutive polls that never reached the coordinator. Any reply that
// did arrive, a rejection included, clears the count.
fn unreachable_limit_hit(missed: &mut u32, reply: &Result<Assignment, RpcError>, max: Option<u32>) -> bool {
    match reply {
        Err(e) if e.is_transport() => {
            *missed += 1;
            matches!(max, Some(max) if *missed >= max)
        }
        _ => {
            *missed = 0;
            false
        }
    }
}

async fn ping_loop(gateway: CoordinatorGateway, worker_id: u64, interval: Duration) {
    let backoff = Backoff::exponential(3, Duration::from_millis(50), interval);
    let mut ticker = time::interval(interval);
    loop {
        ticker.tick().await;
        let res = retry(backoff, "ping", RpcError::is_transport, || gateway.ping(worker_id)).await;
        if let Err(e) = res {
            warn!(worker_id, error = %e, "ping failed");
        }
    }
}
