//! lmtune CLI
//!
//! Commands:
//!   lmtune train    <config>               run a fine-tuning job to completion
//!   lmtune validate <config>               check config, dataset and freezing policy
//!   lmtune plot     <metrics.log> <out>    rebuild a loss plot from a metrics log
//!   lmtune summary  <output_dir>           show the summary and artifacts of a run

use anyhow::Result;
use clap::{Parser, Subcommand};
use lmtune_core::config::RunConfig;
use lmtune_core::driver::{RunArtifacts, RunDriver};
use lmtune_core::freeze;
use lmtune_core::metrics::plot;
use lmtune_core::model::{load_model, LanguageModel};
use lmtune_core::train::{PreparedRun, RunSummary};
use lmtune_core::HarnessError;
use log::warn;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "lmtune", version, about = "Fine-tuning harness for small language models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train with a YAML or JSON run config
    Train {
        config: PathBuf,
        /// Override `output.dir`
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Resume from a checkpoint directory
        #[arg(long)]
        resume_from: Option<PathBuf>,
        /// Override `training.max_steps`
        #[arg(long)]
        max_steps: Option<u64>,
    },
    /// Validate a config and its dataset without training
    Validate { config: PathBuf },
    /// Render `metrics.log` as an HTML loss plot
    Plot {
        metrics_log: PathBuf,
        out: PathBuf,
        #[arg(long, default_value = "training loss")]
        title: String,
    },
    /// Print `summary.json` and the artifacts of a finished run
    Summary { output_dir: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Train {
            config,
            output_dir,
            resume_from,
            max_steps,
        } => cmd_train(config, output_dir, resume_from, max_steps).await,
        Commands::Validate { config } => cmd_validate(config).await,
        Commands::Plot {
            metrics_log,
            out,
            title,
        } => cmd_plot(metrics_log, out, &title),
        Commands::Summary { output_dir } => cmd_summary(output_dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("  Error: {err:#}");
            let code = err
                .downcast_ref::<HarnessError>()
                .map(HarnessError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn cmd_train(
    path: PathBuf,
    output_dir: Option<PathBuf>,
    resume_from: Option<PathBuf>,
    max_steps: Option<u64>,
) -> Result<u8> {
    let mut config = RunConfig::load(&path)?;
    if let Some(dir) = output_dir {
        config.output.dir = dir;
    }
    if resume_from.is_some() {
        config.training.resume_from = resume_from;
    }
    if max_steps.is_some() {
        config.training.max_steps = max_steps;
    }

    let driver = Arc::new(RunDriver::new());
    let id = driver.start_run(config).await?;
    println!("  Run {id} started");

    let cancel_driver = driver.clone();
    let cancel_id = id.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing the current step");
            if let Err(e) = cancel_driver.cancel(&cancel_id).await {
                warn!("Could not cancel run {cancel_id}: {e}");
            }
        }
    });

    let summary = driver.wait(&id).await?;
    ctrl_c.abort();
    print_summary(&summary);
    Ok(summary.exit_code())
}

async fn cmd_validate(path: PathBuf) -> Result<u8> {
    let config = RunConfig::load(&path)?;
    let (prepared, plan) = tokio::task::spawn_blocking(move || {
        let prepared = PreparedRun::prepare(config)?;
        let model = load_model(&prepared.config.model, prepared.config.training.seed)?;
        let plan = freeze::plan(
            &model.parameter_groups(),
            &prepared.config.freeze,
            &prepared.config.adapter,
        )?;
        plan.ensure_trainable()?;
        Ok::<_, HarnessError>((prepared, plan))
    })
    .await??;

    let t = &prepared.config.training;
    println!("  Config OK: {}", path.display());
    println!("    objective:   {}", prepared.objective.name());
    println!("    model:       {}", prepared.config.model.id);
    println!("    examples:    train={} eval={}", prepared.train.len(), prepared.eval.len());
    println!("    total steps: {}", t.total_steps(prepared.train.len()));
    println!("    freezing:    {plan}");
    for decision in &plan.decisions {
        let mark = if decision.trainable { "train " } else { "frozen" };
        println!("      [{mark}] {} ({} params)", decision.name, decision.numel);
    }
    Ok(0)
}

fn cmd_plot(metrics_log: PathBuf, out: PathBuf, title: &str) -> Result<u8> {
    let records = plot::plot_from_log(&metrics_log, &out, title)?;
    println!("  Plotted {records} records -> {}", out.display());
    Ok(0)
}

fn cmd_summary(output_dir: PathBuf) -> Result<u8> {
    let summary = RunSummary::load(&output_dir)?;
    print_summary(&summary);
    let artifacts = RunArtifacts::scan(&output_dir)?;
    println!("  Artifacts:");
    for path in &artifacts.checkpoint_paths {
        println!("    checkpoint  {}", path.display());
    }
    if let Some(best) = &artifacts.best_checkpoint {
        println!("    best        {}", best.display());
    }
    for path in &artifacts.plot_paths {
        println!("    plot        {}", path.display());
    }
    Ok(summary.exit_code())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "\n  {:?}: {} | steps={} | epoch={}",
        summary.state, summary.stop_reason, summary.total_steps, summary.epoch
    );
    if let (Some(value), Some(step)) = (summary.best_metric, summary.best_step) {
        println!("  Best metric {value:.4} at step {step}");
    }
    for (name, value) in &summary.final_metrics {
        println!("    {name:<22} {value:.5}");
    }
    if let Some(err) = &summary.error {
        println!("  Failure [{}]: {}", err.kind, err.message);
    }
    if let Some(plot) = &summary.plot {
        println!("  Plot: {}", plot.display());
    }
}
