// Dashboard binary entry point
// Command-line front door to the job control plane: live views and bulk actions

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use common::bulk::{ActionLabels, BulkOperationController};
use common::client::{
    CleanupStale, ControlPlaneClient, ExecutionListSource, ExecutionResultsSource, JobListSource,
    StaticCredentials, TerminateJob,
};
use common::config::Settings;
use common::errors::{Alert, AlertLevel};
use common::filter::{self, FilterSet, JobField, Predicate, SortSpec};
use common::live_view::{Fetcher, LiveView};
use common::models::{Execution, ExecutionStats, Job, JobStatus, RunStatus};
use common::selection::{reduce, SelectionAction, SelectionState};
use common::{rollup, telemetry};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "dashboard", about = "Job execution dashboard for the control plane")]
struct Cli {
    /// Directory holding default.toml and local.toml
    #[arg(long, default_value = "config")]
    config: PathBuf,

    /// Bearer token; overrides control_plane.api_token
    #[arg(long, env = "DASHBOARD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List jobs, optionally filtered and sorted
    Jobs(JobQuery),
    /// Follow a resource and print it whenever it changes
    Watch {
        #[command(subcommand)]
        target: WatchTarget,
    },
    /// Show the branch/action tree of one execution
    Results { job_id: i64, execution_number: u64 },
    /// List the executions of a job
    Executions { job_id: i64 },
    /// Force-terminate running jobs
    Terminate {
        /// Job identifiers (serial or id)
        #[arg(required = true)]
        jobs: Vec<String>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Clean up stale executions on the control plane
    CleanupStale,
    /// Show the control plane safety health report
    Health,
    /// Start an execution of a job
    Execute {
        job_id: i64,
        /// Restrict the run to these targets
        #[arg(long = "target")]
        targets: Vec<String>,
    },
    /// Schedule a job for a specific time (RFC 3339)
    Schedule { job_id: i64, at: String },
}

#[derive(Debug, Subcommand)]
enum WatchTarget {
    Jobs(JobQuery),
    Executions { job_id: i64 },
    Results { job_id: i64, execution_number: u64 },
}

#[derive(Debug, Clone, clap::Args)]
struct JobQuery {
    /// Case-insensitive substring of the job name
    #[arg(long)]
    name: Option<String>,
    /// Only jobs with one of these statuses
    #[arg(long = "status")]
    statuses: Vec<String>,
    #[arg(long, value_enum)]
    sort: Option<SortField>,
    #[arg(long)]
    desc: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortField {
    Id,
    Name,
    Status,
    Scheduled,
    Created,
}

impl From<SortField> for JobField {
    fn from(field: SortField) -> Self {
        match field {
            SortField::Id => JobField::Id,
            SortField::Name => JobField::Name,
            SortField::Status => JobField::Status,
            SortField::Scheduled => JobField::ScheduledAt,
            SortField::Created => JobField::CreatedAt,
        }
    }
}

impl JobQuery {
    fn filters(&self) -> FilterSet<Job> {
        let mut filters = FilterSet::new();
        if let Some(name) = &self.name {
            filters.insert(JobField::Name, Predicate::Contains(name.clone()));
        }
        if !self.statuses.is_empty() {
            filters.insert(JobField::Status, Predicate::OneOf(self.statuses.clone()));
        }
        filters
    }

    fn sort(&self) -> Option<SortSpec<JobField>> {
        self.sort.map(|field| {
            if self.desc {
                SortSpec::descending(field.into())
            } else {
                SortSpec::ascending(field.into())
            }
        })
    }

    fn apply(&self, jobs: &[Job]) -> Vec<Job> {
        filter::apply(jobs, &self.filters(), self.sort())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from_path(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if cli.token.is_some() {
        settings.control_plane.api_token = cli.token.clone();
    }
    if let Err(e) = settings.validate() {
        bail!("Invalid configuration: {}", e);
    }

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(base_url = %settings.control_plane.base_url, "Configuration loaded");

    let credentials = Arc::new(StaticCredentials::new(
        settings.control_plane.api_token.clone(),
    ));
    let client = ControlPlaneClient::new(&settings.control_plane, credentials)
        .context("Failed to create control plane client")?;

    let result = run(cli.command, &settings, client).await;
    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    telemetry::shutdown_tracer();
    result
}

async fn run(command: Command, settings: &Settings, client: ControlPlaneClient) -> Result<()> {
    let fetch_timeout = settings.polling.fetch_timeout();
    match command {
        Command::Jobs(query) => {
            let jobs =
                fetch_once::<Vec<Job>, _>("jobs", JobListSource::new(client), fetch_timeout)
                    .await?;
            print_json(&query.apply(&jobs))
        }
        Command::Executions { job_id } => {
            let executions = fetch_once::<Vec<Execution>, _>(
                "executions",
                ExecutionListSource::new(client, job_id),
                fetch_timeout,
            )
            .await?;
            print_json(&executions)
        }
        Command::Results {
            job_id,
            execution_number,
        } => {
            let source = results_source(client, job_id, execution_number).await?;
            let execution = fetch_once::<Execution, _>("results", source, fetch_timeout).await?;
            print_json(&execution)
        }
        Command::Watch { target } => watch(target, settings, client).await,
        Command::Terminate { jobs, reason } => {
            let reason = reason.unwrap_or_else(|| settings.bulk.default_reason.clone());
            terminate(jobs, &reason, settings, client).await
        }
        Command::CleanupStale => {
            let controller = BulkOperationController::from_config(&settings.bulk);
            let action = CleanupStale::new(client);
            let result = controller
                .run_single("stale-executions", &action, "")
                .await?;
            print_alerts(&result.alerts(ActionLabels::CLEANUP_STALE));
            print_json(&result)
        }
        Command::Health => {
            let report = client
                .safety_health()
                .await
                .map_err(|e| surface(&e))?;
            if !report.is_healthy() {
                print_alerts(&[Alert::new(
                    AlertLevel::Warning,
                    format!("Control plane health: {}", report.health_status),
                )]);
            }
            print_json(&report)
        }
        Command::Execute { job_id, targets } => {
            let targets = (!targets.is_empty()).then_some(targets);
            let started = client
                .execute_job(job_id, targets.as_deref())
                .await
                .map_err(|e| surface(&e))?;
            print_json(&started)
        }
        Command::Schedule { job_id, at } => {
            let at: DateTime<Utc> = DateTime::parse_from_rfc3339(&at)
                .with_context(|| format!("Invalid RFC 3339 timestamp: {}", at))?
                .with_timezone(&Utc);
            let scheduled = client
                .schedule_job(job_id, at)
                .await
                .map_err(|e| surface(&e))?;
            print_json(&scheduled)
        }
    }
}

/// One user-initiated fetch through a live view, so errors surface as alerts
async fn fetch_once<T, F>(name: &'static str, source: F, fetch_timeout: Duration) -> Result<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: Fetcher<T> + 'static,
{
    let view = LiveView::new(name, Arc::new(source), fetch_timeout);
    if let Err(alert) = view.manual_refresh().await {
        print_alerts(&[alert.clone()]);
        bail!(alert.message);
    }
    view.current()
        .with_context(|| format!("No {} data received", name))
}

/// Find the recorded execution so its own status can anchor the rollup
async fn results_source(
    client: ControlPlaneClient,
    job_id: i64,
    execution_number: u64,
) -> Result<ExecutionResultsSource> {
    let executions = client
        .list_executions(job_id)
        .await
        .map_err(|e| surface(&e))?;
    let recorded = executions
        .into_iter()
        .find(|e| e.execution_number == execution_number)
        .unwrap_or_else(|| Execution {
            job_id,
            execution_number,
            status: RunStatus::Unknown,
            started_at: None,
            completed_at: None,
            branches: Vec::new(),
            stats: ExecutionStats::default(),
        });
    Ok(ExecutionResultsSource::new(client, recorded))
}

async fn watch(target: WatchTarget, settings: &Settings, client: ControlPlaneClient) -> Result<()> {
    let polling = &settings.polling;
    let timeout = polling.fetch_timeout();
    match target {
        WatchTarget::Jobs(query) => {
            let view = Arc::new(LiveView::<Vec<Job>>::new(
                "jobs",
                Arc::new(JobListSource::new(client)),
                timeout,
            ));
            follow(view, polling.jobs_interval_seconds, move |jobs: &Vec<Job>| {
                let jobs = query.apply(jobs);
                let running = jobs
                    .iter()
                    .filter(|job| rollup::job_overall_status(job, &[]) == JobStatus::Running)
                    .count();
                info!(jobs = jobs.len(), running = running, "Job list changed");
                print_json(&jobs)
            })
            .await
        }
        WatchTarget::Executions { job_id } => {
            let view = Arc::new(LiveView::<Vec<Execution>>::new(
                "executions",
                Arc::new(ExecutionListSource::new(client, job_id)),
                timeout,
            ));
            follow(view, polling.executions_interval_seconds, |executions| {
                print_json(executions)
            })
            .await
        }
        WatchTarget::Results {
            job_id,
            execution_number,
        } => {
            let source = results_source(client, job_id, execution_number).await?;
            let view = Arc::new(LiveView::<Execution>::new(
                "results",
                Arc::new(source),
                timeout,
            ));
            follow(view, polling.results_interval_seconds, |execution| {
                info!(
                    execution = %execution.execution_serial(),
                    status = %execution.status,
                    branches = execution.stats.branches,
                    actions = execution.stats.actions.total,
                    "Execution changed"
                );
                print_json(execution)
            })
            .await
        }
    }
}

/// Poll `view` every `interval_seconds`, printing each change until Ctrl+C
async fn follow<T, P>(view: Arc<LiveView<T>>, interval_seconds: u64, mut print: P) -> Result<()>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    P: FnMut(&T) -> Result<()>,
{
    if let Err(alert) = view.manual_refresh().await {
        print_alerts(&[alert]);
    }
    let mut updates = view.subscribe();
    if let Some(data) = updates.borrow_and_update().clone() {
        print(&data)?;
    }

    let scheduler = view.scheduler();
    scheduler.enable(Duration::from_secs(interval_seconds));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C signal, stopping");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let data = updates.borrow_and_update().clone();
                if let Some(data) = data {
                    print(&data)?;
                }
            }
        }
    }

    scheduler.disable();
    view.close();
    Ok(())
}

async fn terminate(
    items: Vec<String>,
    reason: &str,
    settings: &Settings,
    client: ControlPlaneClient,
) -> Result<()> {
    let fetch_timeout = settings.polling.fetch_timeout();
    let jobs_view = LiveView::<Vec<Job>>::new(
        "jobs",
        Arc::new(JobListSource::new(client.clone())),
        fetch_timeout,
    );
    if let Err(alert) = jobs_view.manual_refresh().await {
        print_alerts(&[alert.clone()]);
        bail!(alert.message);
    }
    let jobs = jobs_view.current().unwrap_or_default();

    let selection = reduce(&SelectionState::new(), SelectionAction::SelectAll(items));
    let controller = BulkOperationController::from_config(&settings.bulk);
    let action = TerminateJob::new(client);
    let refreshed = Notify::new();
    let refresher = || refreshed.notify_one();

    let (_, report) = controller
        .terminate_selection(&jobs, &selection, &action, reason, &refresher)
        .await?;

    print_alerts(&report.alerts());
    print_json(&report)?;

    refreshed.notified().await;
    if let Err(alert) = jobs_view.manual_refresh().await {
        print_alerts(&[alert]);
        return Ok(());
    }
    let still_running: Vec<String> = jobs_view
        .current()
        .unwrap_or_default()
        .iter()
        .filter(|job| job.is_terminable() && report.result.succeeded.contains(&job.identifier()))
        .map(Job::identifier)
        .collect();
    if !still_running.is_empty() {
        print_alerts(&[Alert::new(
            AlertLevel::Info,
            format!("Still running after termination: {}", still_running.join(", ")),
        )]);
    }
    Ok(())
}

fn surface(err: &common::errors::ClientError) -> anyhow::Error {
    let alert = Alert::from_client_error(err);
    print_alerts(&[alert]);
    anyhow::anyhow!(err.clone())
}

fn print_alerts(alerts: &[Alert]) {
    for alert in alerts {
        let level = match alert.level {
            AlertLevel::Success => "SUCCESS",
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Error => "ERROR",
        };
        eprintln!("[{}] {}", level, alert.message);
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
