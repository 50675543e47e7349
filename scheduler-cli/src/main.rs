//! Admin CLI for the scheduler ledger: register task definitions, backfill
//! shadow occurrences, and cut tasks over to active. One binary, one
//! subcommand per admin operation, JSON on stdout for scripting.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use scheduler_core::admin::{backfill_shadow, cutover, register_tasks, TaskDefinition};
use scheduler_core::ledger::TaskStatus;
use serde::Serialize;
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "scheduler-cli")]
#[command(about = "Admin surface over the scheduler ledger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert or update task rows from a definitions file (defaults to the built-in seed list).
    Register {
        definitions_file: Option<PathBuf>,
        #[arg(long)]
        overwrite: bool,
    },
    /// Run one enqueue pass restricted in effect to shadow tasks.
    Backfill {
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },
    /// Set one or more tasks' status to active.
    Cutover { task_names: Vec<String> },
}

#[derive(Serialize)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    registered: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shadow_task_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    occurrences_created: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    activated: Option<u64>,
}

fn output(resp: Response) {
    println!("{}", serde_json::to_string(&resp).unwrap());
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scheduler_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _ = dotenvy::dotenv();
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to database")?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Register {
            definitions_file,
            overwrite,
        } => cmd_register(definitions_file, overwrite, &pool).await,
        Commands::Backfill { now } => cmd_backfill(now, &pool).await,
        Commands::Cutover { task_names } => cmd_cutover(task_names, &pool).await,
    }
}

async fn cmd_register(
    definitions_file: Option<PathBuf>,
    overwrite: bool,
    pool: &PgPool,
) -> Result<ExitCode> {
    let definitions = match definitions_file {
        Some(path) => load_definitions(&path)?,
        None => builtin_seed_definitions(),
    };

    match register_tasks(&definitions, overwrite, Utc::now(), pool).await {
        Ok(report) => {
            output(Response {
                success: true,
                message: None,
                registered: Some(report.registered),
                skipped: Some(report.skipped),
                shadow_task_count: None,
                occurrences_created: None,
                activated: None,
            });
            Ok(ExitCode::from(0))
        }
        Err(e) => {
            output(Response {
                success: false,
                message: Some(e.to_string()),
                registered: None,
                skipped: None,
                shadow_task_count: None,
                occurrences_created: None,
                activated: None,
            });
            Ok(ExitCode::from(2))
        }
    }
}

async fn cmd_backfill(now: Option<DateTime<Utc>>, pool: &PgPool) -> Result<ExitCode> {
    let now = now.unwrap_or_else(Utc::now);
    match backfill_shadow(now, pool).await {
        Ok(report) => {
            output(Response {
                success: true,
                message: None,
                registered: None,
                skipped: None,
                shadow_task_count: Some(report.shadow_task_count),
                occurrences_created: Some(report.occurrences_created),
                activated: None,
            });
            Ok(ExitCode::from(0))
        }
        Err(e) => {
            output(Response {
                success: false,
                message: Some(e.to_string()),
                registered: None,
                skipped: None,
                shadow_task_count: None,
                occurrences_created: None,
                activated: None,
            });
            Ok(ExitCode::from(2))
        }
    }
}

async fn cmd_cutover(task_names: Vec<String>, pool: &PgPool) -> Result<ExitCode> {
    match cutover(&task_names, pool).await {
        Ok(report) if report.activated == 0 => {
            output(Response {
                success: false,
                message: Some("no tasks matched the given names".to_string()),
                registered: None,
                skipped: None,
                shadow_task_count: None,
                occurrences_created: None,
                activated: Some(0),
            });
            Ok(ExitCode::from(1))
        }
        Ok(report) => {
            output(Response {
                success: true,
                message: None,
                registered: None,
                skipped: None,
                shadow_task_count: None,
                occurrences_created: None,
                activated: Some(report.activated),
            });
            Ok(ExitCode::from(0))
        }
        Err(e) => {
            output(Response {
                success: false,
                message: Some(e.to_string()),
                registered: None,
                skipped: None,
                shadow_task_count: None,
                occurrences_created: None,
                activated: None,
            });
            Ok(ExitCode::from(2))
        }
    }
}

fn load_definitions(path: &PathBuf) -> Result<Vec<TaskDefinition>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read definitions file {}", path.display()))?;
    let parsed: Vec<RawDefinition> =
        serde_json::from_str(&raw).context("definitions file must be a JSON array")?;
    Ok(parsed.into_iter().map(RawDefinition::into_definition).collect())
}

#[derive(serde::Deserialize)]
struct RawDefinition {
    name: String,
    handler: String,
    schedule_expr: String,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    active: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl RawDefinition {
    fn into_definition(self) -> TaskDefinition {
        TaskDefinition {
            name: self.name,
            handler: self.handler,
            schedule_expr: self.schedule_expr,
            timezone: self.timezone,
            payload: self.payload,
            status: if self.active {
                TaskStatus::Active
            } else {
                TaskStatus::Shadow
            },
        }
    }
}

fn builtin_seed_definitions() -> Vec<TaskDefinition> {
    vec![
        TaskDefinition {
            name: "Mariners post-game summary".to_string(),
            handler: "mariners_post_game_summary".to_string(),
            schedule_expr: "*/2 * * * *".to_string(),
            timezone: "America/Los_Angeles".to_string(),
            payload: serde_json::json!({
                "league": "MLB",
                "team": "SEA",
                "game_id": "demo",
                "fail_once": false,
            }),
            status: TaskStatus::Shadow,
        },
        TaskDefinition {
            name: "Daily Discord haiku".to_string(),
            handler: "mariners_post_game_summary".to_string(),
            schedule_expr: "0 22 * * *".to_string(),
            timezone: "America/Los_Angeles".to_string(),
            payload: serde_json::json!({}),
            status: TaskStatus::Shadow,
        },
        TaskDefinition {
            name: "Fantasy weekly digest".to_string(),
            handler: "mariners_post_game_summary".to_string(),
            schedule_expr: "0 9 * * MON".to_string(),
            timezone: "America/Los_Angeles".to_string(),
            payload: serde_json::json!({ "league": "Yahoo" }),
            status: TaskStatus::Shadow,
        },
    ]
}
