use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use mapreduce_ft::mr::app::Application;
use mapreduce_ft::mr::config::WorkerConfig;
use mapreduce_ft::mr::worker::Worker;
use mapreduce_ft::util::log;
use tracing::error;

/// Pulls tasks from the coordinator and runs them until the job is done.
#[derive(Parser, Debug)]
#[command(name = "mrworker")]
struct Args {
    /// Built-in application name (`wc`) or path to a plugin library.
    app: String,

    /// Coordinator endpoint, e.g. http://127.0.0.1:50051.
    #[arg(long, env = "MR_ENDPOINT")]
    endpoint: Option<String>,

    /// Directory for intermediate and output files.
    #[arg(long, env = "MR_WORK_DIR", default_value = ".")]
    work_dir: PathBuf,

    #[arg(long, env = "MR_POLL_INTERVAL_MS", default_value_t = 1_000)]
    poll_interval_ms: u64,

    #[arg(long, env = "MR_PING_INTERVAL_MS", default_value_t = 1_000)]
    ping_interval_ms: u64,

    /// Give up after this many unreachable polls in a row (0 never gives up).
    #[arg(long, env = "MR_MAX_MISSED_POLLS", default_value_t = 10)]
    max_missed_polls: u32,
}

#[tokio::main]
async fn main() {
    log::init();
    let args = Args::parse();

    let app = match Application::from_arg(&args.app) {
        Ok(app) => app,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let mut config = WorkerConfig {
        work_dir: args.work_dir,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        ping_interval: Duration::from_millis(args.ping_interval_ms),
        max_missed_polls: Some(args.max_missed_polls).filter(|n| *n > 0),
        ..Default::default()
    };
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    if let Err(e) = Worker::new(config, app).run().await {
        error!("worker exiting: {}", e);
        std::process::exit(1);
    }
}
