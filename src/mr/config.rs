//! Runtime knobs for the coordinator and the workers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::net as netutil;

pub const TASK_TIMEOUT: Duration = Duration::from_secs(10);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const PING_INTERVAL: Duration = Duration::from_secs(1);
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the number of reduce partitions must be at least 1")]
    NoReducers,
    #[error("task timeout {timeout:?} must exceed the sweep interval {sweep:?}")]
    TimeoutTooShort { timeout: Duration, sweep: Duration },
    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub addr: SocketAddr,
    pub n_reduce: u32,
    /// How long a task may stay in progress before it is handed out again.
    pub task_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long to keep answering `JOB_DONE` after the last reduce completes.
    pub shutdown_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            addr: netutil::coordinator_addr(),
            n_reduce: 10,
            task_timeout: TASK_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_reduce == 0 {
            return Err(ConfigError::NoReducers);
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("sweep interval"));
        }
        if self.task_timeout <= self.sweep_interval {
            return Err(ConfigError::TimeoutTooShort {
                timeout: self.task_timeout,
                sweep: self.sweep_interval,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub endpoint: String,
    /// Where intermediate and final output files are published.
    pub work_dir: PathBuf,
    pub poll_interval: Duration,
    pub ping_interval: Duration,
    pub rpc_timeout: Duration,
    pub register_attempts: u32,
    pub report_attempts: u32,
    /// Consecutive unreachable polls after which the coordinator is assumed
    /// gone. `None` keeps polling forever.
    pub max_missed_polls: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            endpoint: netutil::endpoint_for(netutil::coordinator_addr()),
            work_dir: PathBuf::from("."),
            poll_interval: POLL_INTERVAL,
            ping_interval: PING_INTERVAL,
            rpc_timeout: RPC_TIMEOUT,
            register_attempts: 3,
            report_attempts: 4,
            max_missed_polls: Some(10),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("poll interval"));
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("ping interval"));
        }
        if self.rpc_timeout.is_zero() {
            return Err(ConfigError::ZeroInterval("rpc timeout"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(CoordinatorConfig::default().validate(), Ok(()));
        assert_eq!(WorkerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_deadline_exceeds_worker_cadence() {
        let c = CoordinatorConfig::default();
        let w = WorkerConfig::default();
        assert!(c.task_timeout > w.poll_interval);
        assert!(c.task_timeout >= w.ping_interval * 10);
    }

    #[test]
    fn test_rejects_bad_coordinator_config() {
        let mut c = CoordinatorConfig::default();
        c.n_reduce = 0;
        assert_eq!(c.validate(), Err(ConfigError::NoReducers));

        let mut c = CoordinatorConfig::default();
        c.task_timeout = c.sweep_interval;
        assert!(matches!(c.validate(), Err(ConfigError::TimeoutTooShort { .. })));
    }

    #[test]
    fn test_rejects_zero_worker_intervals() {
        let mut w = WorkerConfig::default();
        w.rpc_timeout = Duration::ZERO;
        assert_eq!(w.validate(), Err(ConfigError::ZeroInterval("rpc timeout")));

        let mut w = WorkerConfig::default();
        w.poll_interval = Duration::ZERO;
        assert_eq!(w.validate(), Err(ConfigError::ZeroInterval("poll interval")));
    }
}
