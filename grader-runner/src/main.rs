//! Grader Runner
//!
//! Grades submissions, or generates their feedback, from the command line.
//!
//! Architecture:
//! - Configuration: loaded from the environment and validated up front
//! - Repositories: git gateway and a JSON file of submissions
//! - Backend: local converter process or Kubernetes pod
//! - Service: queues one job per submission on the worker pool
//!
//! The runner queues every requested submission, drains the queue and
//! exits. Ctrl-C cancels whatever is still running.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grader_core::domain::job::JobKind;
use grader_core::domain::submission::SubmissionId;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use grader_runner::backend::pod::{DataVolume, ImageTable, KubePodApi, PodTemplate};
use grader_runner::backend::{ContainerPodBackend, ExecutionBackend, LocalSubprocessBackend};
use grader_runner::config::{BackendKind, Config};
use grader_runner::context::JobContext;
use grader_runner::executor::TaskExecutor;
use grader_runner::repository::{GitGateway, JsonFileStore};
use grader_runner::service::GradingService;

#[derive(Parser)]
#[command(name = "grader-runner")]
#[command(about = "Automatic grading and feedback job runner", long_about = None)]
struct Cli {
    /// JSON file holding the submissions
    #[arg(long, env = "GRADER_STORE")]
    store: PathBuf,

    /// Seconds to wait for queued jobs before cancelling the rest
    #[arg(long, env = "GRADER_DRAIN_TIMEOUT", default_value_t = 3600)]
    drain_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade submissions
    Grade {
        /// Submission IDs
        #[arg(required = true)]
        ids: Vec<SubmissionId>,
    },
    /// Generate feedback for graded submissions
    Feedback {
        /// Submission IDs
        #[arg(required = true)]
        ids: Vec<SubmissionId>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grader_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(
        "Loaded configuration: backend={:?}, concurrency={}, input={}, output={}",
        config.backend,
        config.concurrency,
        config.input_dir.display(),
        config.output_dir.display()
    );

    let backend = build_backend(&config).await?;
    let store = Arc::new(JsonFileStore::open(&cli.store)?);
    let gateway = Arc::new(GitGateway::new(&config.git_root, &config.git_executable));
    let ctx = JobContext::new(
        store,
        gateway,
        backend,
        config.input_dir.clone(),
        config.output_dir.clone(),
    )
    .with_retry(config.retry_policy());

    let executor = Arc::new(TaskExecutor::new(config.executor_config())?);
    let service = GradingService::new(executor.clone(), Arc::new(ctx));
    executor.start();

    let (kind, ids) = match cli.command {
        Commands::Grade { ids } => (JobKind::Autograde, ids),
        Commands::Feedback { ids } => (JobKind::Feedback, ids),
    };
    for id in ids {
        let queued = match kind {
            JobKind::Autograde => service.grade(id),
            JobKind::Feedback => service.generate_feedback(id),
        };
        if let Err(e) = queued {
            warn!("Skipping {} of submission {}: {}", kind, id, e);
        }
    }

    // Cancelling shares the workers' signals, so it also ends the drain below
    let interrupt = {
        let executor = executor.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling running jobs");
                executor.cancel_all().await;
            }
        })
    };

    executor
        .stop(Duration::from_secs(cli.drain_timeout))
        .await;
    interrupt.abort();

    if executor.queue_len() > 0 {
        warn!("{} jobs were not started", executor.queue_len());
    }
    info!("Runner finished");
    Ok(())
}

/// Builds the execution backend selected by the configuration
async fn build_backend(config: &Config) -> Result<Arc<dyn ExecutionBackend>> {
    match config.backend {
        BackendKind::Subprocess => Ok(Arc::new(LocalSubprocessBackend::new(
            &config.convert_executable,
        )?)),
        BackendKind::Pod => {
            let kube = &config.kube;
            let api = KubePodApi::connect(&kube.namespace, kube.context.as_deref())
                .await
                .context("Failed to connect to Kubernetes")?;

            let images = match &kube.image_config {
                Some(path) => ImageTable::load(path)?,
                None => ImageTable::default(),
            }
            .with_fallback(kube.default_image.clone());

            let template = PodTemplate {
                namespace: kube.namespace.clone(),
                converter: config.convert_executable.clone(),
                volume: kube
                    .volume_claim
                    .clone()
                    .map(DataVolume::Claim)
                    .unwrap_or(DataVolume::HostPath),
                data_dir: kube.data_dir.clone(),
                mount_path: kube.mount_path.clone(),
            };

            Ok(Arc::new(ContainerPodBackend::new(
                Arc::new(api),
                images,
                template,
                kube.poll_interval,
            )))
        }
    }
}
