use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobsched::config::Config;
use jobsched::scheduling::{
    ConstraintEvaluator, InMemoryJobStore, InternalStopReason, Job, JobInfo, JobKey, JobRunner,
    ScheduleQuotaTracker, Scheduler, SchedulerHandle, SchedulerService, StopReason, WorkType,
};

#[derive(Parser)]
#[command(name = "jobsched")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deferred-work job scheduler core (standalone harness)")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Schedule a few sample jobs against the echo runner on startup
    #[arg(long)]
    demo: bool,
}

/// Runner for the standalone harness: accepts every job, logs it, and
/// reports completion a few seconds later through the service handle.
struct EchoRunner {
    started: tokio::sync::mpsc::UnboundedSender<JobKey>,
}

impl JobRunner for EchoRunner {
    fn start(&mut self, job: &Job, work_type: WorkType) -> bool {
        info!(
            "echo runner starting {} ({}) as {}",
            job.key(),
            job.source_package,
            work_type
        );
        self.started.send(job.key()).is_ok()
    }

    fn cancel(
        &mut self,
        job: &Job,
        reason: StopReason,
        internal_reason: InternalStopReason,
        debug_reason: &str,
    ) {
        info!(
            "echo runner cancelling {}: {} / {} ({})",
            job.key(),
            reason,
            internal_reason,
            debug_reason
        );
        let _ = self.started.send(job.key());
    }
}

/// Constraint evaluator for the harness: only the timing window applies
struct WindowConstraints;

impl ConstraintEvaluator for WindowConstraints {
    fn is_ready(&self, job: &Job, now_ms: i64) -> bool {
        now_ms >= job.earliest_run_time_ms
    }

    fn prepare(&mut self, _job: &Job) {}

    fn unprepare(&mut self, _job: &Job) {}
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!("jobsched={}", cli.log_level))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        warn!(
            "config file {} not found, using defaults",
            cli.config.display()
        );
        Config::default()
    };
    let settings = config.to_settings()?;
    info!(
        "loaded configuration ({} work type configs)",
        settings.work_type_configs.len()
    );

    let (finished_tx, mut finished_rx) = tokio::sync::mpsc::unbounded_channel();
    let quota = ScheduleQuotaTracker::new(
        settings.enable_api_quotas,
        settings.aq_schedule_count,
        settings.aq_schedule_window_ms,
    );
    let scheduler = Scheduler::new(
        settings,
        Box::new(InMemoryJobStore::new()),
        Box::new(EchoRunner {
            started: finished_tx,
        }),
        Box::new(WindowConstraints),
        Box::new(quota),
    );
    let (service, handle) = SchedulerService::new(scheduler);

    // Feed runner completions back as finished events, as a real runner
    // binding would.
    let completion_handle = handle.clone();
    tokio::spawn(async move {
        while let Some(key) = finished_rx.recv().await {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            completion_handle.job_finished(key, false);
        }
    });

    let token = tokio_util::sync::CancellationToken::new();
    let service_token = token.clone();
    let service_task = tokio::spawn(async move { service.run(service_token).await });

    if cli.demo {
        schedule_demo_jobs(&handle).await;
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    if let Ok(stats) = handle.stats().await {
        info!("final stats: {}", serde_json::to_string_pretty(&stats)?);
    }
    token.cancel();
    service_task.await??;
    Ok(())
}

async fn schedule_demo_jobs(handle: &SchedulerHandle) {
    for job_id in 0..3 {
        let mut info = JobInfo::new(job_id, "com.example.demo/.DemoService");
        info.expedited = job_id == 0;
        match handle
            .schedule(info, 10_000 + job_id, "com.example.demo", 0, None)
            .await
        {
            Ok(()) => info!("scheduled demo job {}", job_id),
            Err(e) => warn!("demo job {} rejected: {}", job_id, e),
        }
    }
}
