use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use barrage::cli::config::Config;
use barrage::cli::{runtime_threads, spawn_stdin_control};
use barrage::engine::Engine;
use barrage::stats::RunReport;

#[derive(Parser)]
#[command(name = "barrage")]
#[command(about = "Staged-concurrency HTTP load generator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a load test described by a config file
    Run {
        /// Path to the YAML or JSON run configuration
        config: PathBuf,
        /// Exit with 98 when a threshold has no samples
        #[arg(long)]
        strict: bool,
        /// Print the report as JSON instead of the summary
        #[arg(long)]
        json: bool,
        /// Also write the JSON report to this file
        #[arg(long)]
        export_json: Option<PathBuf>,
        /// Enable interactive control mode (pause, resume, ramp workers)
        #[arg(long, short = 'i')]
        interactive: bool,
    },
    /// Validate a config file without running it
    Validate {
        config: PathBuf,
    },
    /// Print the JSON Schema of the config file
    Schema {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            config,
            strict,
            json,
            export_json,
            interactive,
        } => {
            let code = run(&config, strict, json, export_json.as_deref(), interactive)?;
            std::process::exit(code);
        }
        Commands::Validate { config } => barrage::cli::validate::run_validate(&config),
        Commands::Schema { output } => {
            let schema = schemars::schema_for!(Config);
            let schema_json = serde_json::to_string_pretty(&schema)?;
            if let Some(out_path) = output {
                std::fs::write(&out_path, schema_json)?;
                println!("JSON Schema written to {:?}", out_path);
            } else {
                println!("{}", schema_json);
            }
            Ok(())
        }
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "barrage", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Load, run and report. Returns the process exit code.
fn run(config_path: &Path, strict: bool, json: bool, export_json: Option<&Path>, interactive: bool) -> Result<i32> {
    let config = Config::load(config_path)?;
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    let plan = config.to_plan(base)?.with_strict(strict || config.strict.unwrap_or(false));
    let scenario = config
        .scenario()?
        .context("config has no 'request' to run")?;

    let threads = runtime_threads(plan.schedule.peak_target());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;
    tracing::debug!(threads, "runtime ready");

    let strict = plan.strict;
    let engine = Engine::new(plan, Arc::new(scenario));
    let report: RunReport = runtime.block_on(async {
        let control = engine.control();
        let on_ctrl_c = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, draining workers");
                on_ctrl_c.stop();
            }
        });
        if interactive {
            spawn_stdin_control(control);
        }
        engine.run().await
    })?;
    // Stdin reader may still be blocked on a read.
    runtime.shutdown_background();

    if json {
        println!("{}", report.to_json());
    } else {
        report.print_summary();
    }
    if let Some(path) = export_json {
        std::fs::write(path, report.to_json())
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        println!("Report exported to {}", path.display());
    }
    Ok(report.exit_code(strict))
}
