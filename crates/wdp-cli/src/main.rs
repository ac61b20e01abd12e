// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use wdp_cli::commands::{self, SchemaKind, SubmitArgs};
use wdp_cli::format::{Formatter, OutputFormat};

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;
/// Exit code returned when a submitted job finishes in a non-success state.
const EXIT_JOB_FAILED: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "wdp", version, about = "Workflow Dispatch Pool CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Output format for job and event output.
    #[arg(long, value_enum, default_value_t = OutputFormatArg::Text)]
    format: OutputFormatArg,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a workflow JSON file and wait for it to finish.
    Submit {
        /// Path to a workflow JSON file (a mapping of node id to node object).
        workflow: PathBuf,

        /// Path to a pool configuration TOML file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Scheduling priority override.
        #[arg(long)]
        priority: Option<i64>,

        /// Maximum attempts override.
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Retry delay override, in milliseconds.
        #[arg(long)]
        retry_delay_ms: Option<u64>,

        /// Node ids whose outputs should be collected. Can be repeated.
        #[arg(long = "include-output")]
        include_outputs: Vec<String>,

        /// How long to wait for the job to finish, in seconds.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },

    /// Validate a workflow JSON file.
    Validate {
        /// Path to the workflow JSON file.
        workflow: PathBuf,
    },

    /// Load and validate a pool configuration file.
    ConfigCheck {
        /// Path to a pool configuration TOML file. Defaults to built-in defaults.
        config: Option<PathBuf>,
    },

    /// Print a JSON schema to stdout.
    Schema {
        /// Which schema to print.
        #[arg(value_enum)]
        kind: SchemaArg,
    },
}

/// Schema kind argument for the `schema` subcommand.
#[derive(Debug, Clone, ValueEnum)]
enum SchemaArg {
    /// `PoolConfig` schema.
    PoolConfig,
    /// `Job` schema.
    Job,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormatArg {
    Json,
    JsonPretty,
    Text,
    Compact,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(v: OutputFormatArg) -> Self {
        match v {
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::JsonPretty => OutputFormat::JsonPretty,
            OutputFormatArg::Text => OutputFormat::Text,
            OutputFormatArg::Compact => OutputFormat::Compact,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("wdp=debug")
    } else {
        EnvFilter::new("wdp=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let formatter = Formatter::new(cli.format.into());

    let result = match cli.command {
        Commands::Submit {
            workflow,
            config,
            priority,
            max_attempts,
            retry_delay_ms,
            include_outputs,
            timeout_secs,
        } => {
            cmd_submit(
                &formatter,
                &workflow,
                config.as_deref(),
                priority,
                max_attempts,
                retry_delay_ms,
                include_outputs,
                timeout_secs,
            )
            .await
        }
        Commands::Validate { workflow } => cmd_validate(&workflow),
        Commands::ConfigCheck { config } => cmd_config_check(config.as_deref()),
        Commands::Schema { kind } => cmd_schema(kind),
    };

    match result {
        Ok(()) => {}
        Err(e) if e.downcast_ref::<JobFailedError>().is_some() => {
            eprintln!("{}", formatter.format_error(&e.to_string()));
            std::process::exit(EXIT_JOB_FAILED);
        }
        Err(e) => {
            eprintln!("{}", formatter.format_error(&format!("{e:#}")));
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    }
}

/// Marker error so `main` can distinguish "job reached a terminal failure
/// state" from every other kind of CLI error.
#[derive(Debug)]
struct JobFailedError(String);

impl std::fmt::Display for JobFailedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for JobFailedError {}

#[allow(clippy::too_many_arguments)]
async fn cmd_submit(
    formatter: &Formatter,
    workflow_path: &std::path::Path,
    config_path: Option<&std::path::Path>,
    priority: Option<i64>,
    max_attempts: Option<u32>,
    retry_delay_ms: Option<u64>,
    include_outputs: Vec<String>,
    timeout_secs: u64,
) -> Result<()> {
    let workflow = commands::load_workflow_file(workflow_path)?;
    let pool_config = wdp_config::load_config(config_path)?;
    wdp_config::validate_config(&pool_config).context("pool configuration is invalid")?;

    let (job, events) = commands::submit_workflow(
        &pool_config,
        workflow,
        SubmitArgs {
            priority,
            max_attempts,
            retry_delay_ms,
            include_outputs,
            timeout: Duration::from_secs(timeout_secs),
        },
    )
    .await?;

    for ev in &events {
        eprintln!("{}", formatter.format_event(ev));
    }
    println!("{}", formatter.format_job(&job));

    if commands::is_failure(job.status) {
        return Err(JobFailedError(format!("job {} did not complete successfully", job.id)).into());
    }
    Ok(())
}

fn cmd_validate(workflow: &std::path::Path) -> Result<()> {
    commands::load_workflow_file(workflow)?;
    println!("valid");
    Ok(())
}

fn cmd_config_check(config: Option<&std::path::Path>) -> Result<()> {
    let diagnostics = commands::config_check(config)?;
    let has_error = diagnostics.iter().any(|d| d.starts_with("error:"));
    for d in &diagnostics {
        println!("{d}");
    }
    if has_error {
        anyhow::bail!("configuration has errors");
    }
    Ok(())
}

fn cmd_schema(kind: SchemaArg) -> Result<()> {
    let sk = match kind {
        SchemaArg::PoolConfig => SchemaKind::PoolConfig,
        SchemaArg::Job => SchemaKind::Job,
    };
    println!("{}", commands::schema_json(sk)?);
    Ok(())
}
