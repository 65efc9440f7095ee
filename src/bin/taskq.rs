//! taskq CLI: operator interface to the task queue.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use taskq::config::Config;
use taskq::db::Db;
use taskq::engine::{ClaimOutcome, HttpNotifier, Reaper, Scheduler, Sweeper, deliver};
use taskq::model::{CreateResult, NewTask, Report, Status, TaskId};
use taskq::store::ListQuery;
use taskq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "taskq", about = "Distributed task queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reaper and retention sweeper until Ctrl-C
    Serve {
        /// Only sweep this queue (all queues by default)
        #[arg(long)]
        sweep_queue: Option<String>,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Submit a new task
    Create {
        /// Queue name
        #[arg(long, default_value = "default")]
        queue: String,
        /// Task name
        #[arg(long, default_value = "unnamed")]
        name: String,
        /// JSON payload
        #[arg(long)]
        data: Option<String>,
        /// URL to POST to when the task finishes
        #[arg(long)]
        callback: Option<String>,
        /// Failures tolerated before the task errors
        #[arg(long, default_value_t = 3)]
        max_retry: i32,
        /// Claim timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout: i64,
        /// Delay before the task becomes claimable, in seconds
        #[arg(long)]
        delay: Option<u64>,
    },
    /// List tasks on a queue
    List {
        /// Queue name
        #[arg(long, default_value = "default")]
        queue: String,
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Maximum tasks to show (1-100)
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a task
    Show { id: String },
    /// Claim the next due task on a queue
    Claim {
        #[arg(long, default_value = "default")]
        queue: String,
    },
    /// Report the outcome of a claimed task. Waits for the task's callback,
    /// if any, before exiting.
    Report {
        id: String,
        /// Claim token returned by `claim`
        #[arg(long)]
        token: String,
        /// Report failure instead of success
        #[arg(long)]
        failed: bool,
        /// JSON result
        #[arg(long)]
        result: Option<String>,
    },
    /// Delete a task in any status
    Delete { id: String },
    /// Purge done tasks older than the retention window
    Cleanup {
        /// Only purge this queue
        #[arg(long)]
        queue: Option<String>,
        /// Retention in days (configured value by default)
        #[arg(long)]
        days: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { sweep_queue } => cmd_serve(config, sweep_queue).await,
        Command::Task { action } => {
            let scheduler = scheduler(&config).await?;
            match action {
                TaskAction::Create {
                    queue,
                    name,
                    data,
                    callback,
                    max_retry,
                    timeout,
                    delay,
                } => {
                    let mut new = NewTask::new(queue, name)
                        .data(parse_json(data)?)
                        .max_retry(max_retry)
                        .timeout_secs(timeout);
                    if let Some(url) = callback {
                        new = new.callback(url);
                    }
                    if let Some(secs) = delay {
                        let delay = i64::try_from(secs)
                            .ok()
                            .and_then(chrono::Duration::try_seconds)
                            .ok_or_else(|| anyhow::anyhow!("delay out of range: {secs}"))?;
                        new = new.plan_at(chrono::Utc::now() + delay);
                    }
                    cmd_task_create(&scheduler, new).await
                }
                TaskAction::List {
                    queue,
                    status,
                    offset,
                    limit,
                } => cmd_task_list(&scheduler, queue, status, offset, limit).await,
                TaskAction::Show { id } => cmd_task_show(&scheduler, id).await,
                TaskAction::Claim { queue } => cmd_task_claim(&scheduler, queue).await,
                TaskAction::Report {
                    id,
                    token,
                    failed,
                    result,
                } => {
                    let result = parse_json(result)?;
                    let report = if failed {
                        Report::Failure((!result.is_null()).then_some(result))
                    } else {
                        Report::Success(result)
                    };
                    let task = scheduler
                        .report(&TaskId::from(id.as_str()), &token.as_str().into(), report)
                        .await?;
                    println!(
                        "{}: {} (retried {}/{})",
                        task.id, task.status, task.retried, task.max_retry
                    );

                    let notifier = HttpNotifier::new(config.callback_timeout)?;
                    match deliver(&notifier, &task).await {
                        Ok(true) => println!("Callback delivered to {}", task.callback),
                        Ok(false) => {}
                        Err(e) => eprintln!("Callback not delivered: {e}"),
                    }
                    Ok(())
                }
                TaskAction::Delete { id } => {
                    if scheduler.delete_task(&TaskId::from(id.as_str())).await? {
                        println!("Deleted: {id}");
                    } else {
                        println!("No task {id}");
                    }
                    Ok(())
                }
                TaskAction::Cleanup { queue, days } => {
                    let retention = days
                        .map(|d| Duration::from_secs(d.saturating_mul(24 * 60 * 60)))
                        .unwrap_or_else(|| config.retention());
                    let purged = scheduler.cleanup(queue.as_deref(), retention).await?;
                    println!("Purged {purged} task(s)");
                    Ok(())
                }
            }
        }
    }
}

/// No background notifier here; `report` delivers its callback inline.
async fn scheduler(config: &Config) -> anyhow::Result<Scheduler> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    Ok(Scheduler::new(Arc::new(db))
        .with_claim_policy(config.claim_policy())
        .with_retry_policy(config.retry_policy()))
}

async fn cmd_serve(config: Config, sweep_queue: Option<String>) -> anyhow::Result<()> {
    let mut telemetry = TelemetryConfig::new("taskq");
    telemetry.endpoint = config.otel_endpoint.clone();
    telemetry.default_filter = config.log_level.clone();
    let _guard = init_telemetry(telemetry)?;

    let scheduler = scheduler(&config).await?;

    let reaper = Reaper::new(scheduler.clone(), config.reaper_interval);
    let mut sweeper =
        Sweeper::new(scheduler, config.sweep_interval).retention(config.retention());
    if let Some(queue) = sweep_queue {
        sweeper = sweeper.queue(queue);
    }

    let (r, s) = (reaper.clone(), sweeper.clone());
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        r.shutdown();
        s.shutdown();
    });

    tokio::try_join!(reaper.run(), sweeper.run())?;
    Ok(())
}

async fn cmd_task_create(scheduler: &Scheduler, new: NewTask) -> anyhow::Result<()> {
    match scheduler.create_task(new).await? {
        CreateResult::Created(id) => println!("Created: {id}"),
        CreateResult::Rejected(rejection) => anyhow::bail!("{rejection}"),
    }
    Ok(())
}

async fn cmd_task_list(
    scheduler: &Scheduler,
    queue: String,
    status: Option<String>,
    offset: i64,
    limit: i64,
) -> anyhow::Result<()> {
    let mut query = ListQuery::new(&queue).page(offset, limit);
    if let Some(s) = status {
        let status: Status = s
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?;
        query = query.status(status);
    }

    let tasks = scheduler.list_tasks(&query).await?;
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<50}  {:<16}  {:<10}  {:<7}  PLANNED",
        "ID", "NAME", "STATUS", "RETRIED"
    );
    println!("{}", "-".repeat(110));
    for task in &tasks {
        println!(
            "{:<50}  {:<16}  {:<10}  {:<7}  {}",
            task.id,
            truncate(&task.name, 16),
            task.status,
            format!("{}/{}", task.retried, task.max_retry),
            task.execution_plan_time.format("%Y-%m-%d %H:%M:%S")
        );
    }

    let counts = scheduler.counts(&queue).await?;
    println!(
        "\n{} shown; queue {queue}: {} pending, {} executing, {} done, {} error",
        tasks.len(),
        counts.pending,
        counts.executing,
        counts.done,
        counts.error
    );
    Ok(())
}

async fn cmd_task_show(scheduler: &Scheduler, id: String) -> anyhow::Result<()> {
    let task = scheduler.get_task(&TaskId::from(id.as_str())).await?;

    println!("ID:         {}", task.id);
    println!("Queue:      {}", task.queue);
    println!("Name:       {}", task.name);
    println!("Status:     {}", task.status);
    println!("Version:    {}", task.version);
    println!("Retried:    {}/{}", task.retried, task.max_retry);
    println!("Timeout:    {}s", task.timeout);
    if task.has_callback() {
        println!("Callback:   {}", task.callback);
    }
    println!("Created:    {}", task.creation_time);
    println!("Planned:    {}", task.execution_plan_time);
    if let Some(at) = task.execution_start_time {
        println!("Started:    {at}");
    }
    if let Some(at) = task.execution_expired_time {
        println!("Expires:    {at}");
    }
    if let Some(at) = task.execution_end_time {
        println!("Ended:      {at}");
    }
    if !task.execution_id.is_empty() {
        println!("Claim:      {}", task.execution_id);
    }
    println!("Data:       {}", serde_json::to_string_pretty(&task.task_data)?);
    if !task.task_result.is_null() {
        println!("Result:     {}", serde_json::to_string_pretty(&task.task_result)?);
    }
    Ok(())
}

async fn cmd_task_claim(scheduler: &Scheduler, queue: String) -> anyhow::Result<()> {
    match scheduler.claim(&queue).await? {
        ClaimOutcome::Claimed(task) => {
            println!("ID:         {}", task.id);
            println!("Token:      {}", task.token);
            println!("Name:       {}", task.name);
            println!("Expires:    {}", task.expires_at);
            println!("Data:       {}", serde_json::to_string_pretty(&task.task_data)?);
        }
        ClaimOutcome::Empty => println!("No task due on {queue}."),
        ClaimOutcome::Contended => println!("Queue {queue} is contended; try again."),
    }
    Ok(())
}

fn parse_json(raw: Option<String>) -> anyhow::Result<serde_json::Value> {
    Ok(match raw {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::Value::Null,
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
