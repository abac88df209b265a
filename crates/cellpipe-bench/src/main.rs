//! cellpipe-bench: CLI tool for inspecting, validating, and timing pipelines.
//!
//! Loads a saved pipeline through the built-in module registry (plus any
//! preset plugins) and either runs it with per-module timing or reports on
//! its structure. Useful for:
//!
//! - Measuring which modules dominate a run
//! - Checking a pipeline before handing it to a batch cluster
//! - Inspecting the dependency graph and the measurement columns a
//!   pipeline will produce
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin cellpipe-bench -- [OPTIONS] <COMMAND>
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`); logs go to stderr.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod report;

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use cellpipe_pipeline::{
    ExecutionMode, GroupKey, LoadOptions, Measurements, MeasurementsStore, ModuleRegistry, Pipeline, PipelineEvent,
    RunOptions,
};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::report::{RunReport, multi_run_summary};

/// Pipeline inspection and timing for cellpipe.
#[derive(Parser)]
#[command(name = "cellpipe-bench", version)]
struct Cli {
    /// Directory of module preset plugins (`*.json`) to register.
    #[arg(long, global = true)]
    plugins: Option<PathBuf>,

    /// Fail on the first module that cannot be loaded instead of skipping it.
    #[arg(long, global = true)]
    strict: bool,

    /// Output as JSON instead of a human-readable report.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a pipeline and report per-module timing.
    Run(RunArgs),
    /// Print the module dependency graph.
    Graph {
        /// Saved pipeline file.
        pipeline: PathBuf,
    },
    /// Print the measurement columns the pipeline will produce.
    Columns {
        /// Saved pipeline file.
        pipeline: PathBuf,
        /// Only consider modules before this one-based module number.
        #[arg(long)]
        until: Option<usize>,
    },
    /// Check every module's settings.
    Validate {
        /// Saved pipeline file.
        pipeline: PathBuf,
    },
    /// Save a copy of the pipeline, optionally keeping only some modules.
    Copy {
        /// Saved pipeline file.
        pipeline: PathBuf,
        /// Destination file.
        output: PathBuf,
        /// One-based module numbers to keep (comma separated).
        #[arg(long, value_delimiter = ',')]
        modules: Vec<usize>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Saved pipeline file.
    pipeline: PathBuf,

    /// First image number to process.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    start: usize,

    /// Last image number to process.
    #[arg(long)]
    end: Option<usize>,

    /// Process only the group with this key value (`KEY=VALUE`, repeatable).
    #[arg(long = "group", value_parser = parse_key_value)]
    group: Vec<(String, String)>,

    /// Run module `run` hooks on a worker thread.
    #[arg(long)]
    background: bool,

    /// Test mode: image loaders provide only the first image set of the run.
    #[arg(long)]
    test_mode: bool,

    /// Keep running after a module fails instead of cancelling.
    #[arg(long)]
    keep_going: bool,

    /// Rewrite stored paths before running (`OLD=NEW`, repeatable).
    #[arg(long = "remap", value_parser = parse_key_value)]
    remap: Vec<(String, String)>,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Write the measurements of the last run to this JSON file.
    #[arg(long)]
    measurements: Option<PathBuf>,

    /// Full run options as a JSON string.
    ///
    /// When provided, `--start`, `--end`, `--group`, and `--background`
    /// are ignored. The JSON must be a valid `RunOptions` serialization.
    #[arg(long)]
    options_json: Option<String>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

/// Build [`RunOptions`] from CLI arguments.
///
/// If `--options-json` is provided, the JSON is parsed directly and the
/// individual flags are ignored.
fn options_from_args(args: &RunArgs) -> Result<RunOptions, String> {
    if let Some(ref json) = args.options_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --options-json: {e}"));
    }
    let grouping = (!args.group.is_empty()).then(|| args.group.iter().cloned().collect::<GroupKey>());
    Ok(RunOptions {
        image_set_start: args.start,
        image_set_end: args.end,
        grouping,
        execution: if args.background {
            ExecutionMode::Background
        } else {
            ExecutionMode::Foreground
        },
        honor_pause: false,
    })
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_registry(plugins: Option<&Path>) -> Result<ModuleRegistry, String> {
    let mut registry = cellpipe_modules::default_registry();
    if let Some(dir) = plugins {
        let count = registry
            .load_plugins(dir)
            .map_err(|e| format!("Error loading plugins from {}: {e}", dir.display()))?;
        info!(dir = %dir.display(), count, "plugins registered");
    }
    Ok(registry)
}

fn load_pipeline(registry: &Arc<ModuleRegistry>, path: &Path, strict: bool) -> Result<Pipeline, String> {
    let mut pipeline = Pipeline::new(Arc::clone(registry));
    pipeline.add_listener(|event| {
        if let PipelineEvent::LoadException(e) = event {
            warn!(module = ?e.module_name, error = %e.error, "module skipped");
            e.cancel_run = false;
        }
    });
    pipeline
        .load(path, LoadOptions { raise_on_error: strict })
        .map_err(|e| format!("Error loading {}: {e}", path.display()))?;
    Ok(pipeline)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| format!("Error serializing output: {e}"))?;
    println!("{json}");
    Ok(())
}

fn run_command(registry: &Arc<ModuleRegistry>, cli: &Cli, args: &RunArgs) -> Result<(), String> {
    let options = options_from_args(args)?;
    let mut pipeline = load_pipeline(registry, &args.pipeline, cli.strict)?;
    pipeline.set_test_mode(args.test_mode);
    if args.keep_going {
        pipeline.add_listener(|event| {
            if let PipelineEvent::RunException(e) = event {
                e.cancel_run = false;
            }
        });
    }
    for (from, to) in &args.remap {
        let rewrite = |path: &str| path.replacen(from.as_str(), to, 1);
        if !pipeline.prepare_to_create_batch(&rewrite) {
            return Err(format!("Path remapping {from}={to} was cancelled"));
        }
    }

    eprintln!("Pipeline: {} ({} modules)", args.pipeline.display(), pipeline.len());
    eprintln!("Options: {options:#?}");
    eprintln!("Runs: {}", args.runs);
    eprintln!();

    let mut reports = Vec::with_capacity(args.runs);
    let mut last_measurements = Measurements::new();
    for run in 0..args.runs {
        if args.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, args.runs);
        }
        let mut measurements = Measurements::new();
        let started = Instant::now();
        let mut statuses = Vec::new();
        let exit_status = {
            let mut running = pipeline.run_with_yield(&mut measurements, options.clone());
            for status in running.by_ref() {
                statuses.push(status.map_err(|e| format!("Pipeline error: {e}"))?);
            }
            running.exit_status()
        };
        let report = RunReport::from_statuses(&statuses, exit_status, started.elapsed());
        if cli.json {
            print_json(&report)?;
        } else {
            println!("{}", report.report());
        }
        reports.push(report);
        last_measurements = measurements;
    }

    if args.runs > 1 {
        println!("{}", multi_run_summary(&reports));
    }

    if let Some(ref path) = args.measurements {
        let file = File::create(path).map_err(|e| format!("Error creating {}: {e}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &last_measurements)
            .map_err(|e| format!("Error writing measurements to {}: {e}", path.display()))?;
        eprintln!(
            "Measurements written to {} ({} image sets)",
            path.display(),
            last_measurements.get_image_numbers().len()
        );
    }
    Ok(())
}

fn graph_command(pipeline: &Pipeline, json: bool) -> Result<(), String> {
    let graph = pipeline.get_dependency_graph();
    if json {
        return print_json(&graph);
    }
    for dependency in &graph {
        println!("{:>3} -> {:<3} {dependency}", dependency.source, dependency.destination);
    }
    Ok(())
}

fn columns_command(pipeline: &Pipeline, until: Option<usize>, json: bool) -> Result<(), String> {
    let columns = pipeline.get_measurement_columns(until);
    if json {
        return print_json(&columns);
    }
    println!("{:<16} {:<48} {:>12}", "Object", "Feature", "Type");
    println!("{}", "-".repeat(78));
    for column in &columns {
        let coltype = format!("{:?}", column.coltype);
        println!("{:<16} {:<48} {coltype:>12}", column.object_name, column.feature);
    }
    Ok(())
}

fn validate_command(pipeline: &Pipeline) -> Result<(), String> {
    pipeline.test_valid().map_err(|e| format!("Invalid pipeline: {e}"))?;
    println!("{} modules valid (settings hash {:032x})", pipeline.len(), pipeline.settings_hash());
    if pipeline.in_batch_mode() {
        println!("Pipeline is in batch mode");
    }
    Ok(())
}

fn copy_command(pipeline: &Pipeline, output: &Path, modules: &[usize]) -> Result<(), String> {
    let copy = pipeline.copy().map_err(|e| format!("Error copying pipeline: {e}"))?;
    let file = File::create(output).map_err(|e| format!("Error creating {}: {e}", output.display()))?;
    let keep = (!modules.is_empty()).then_some(modules);
    copy.savetxt(BufWriter::new(file), keep)
        .map_err(|e| format!("Error writing {}: {e}", output.display()))?;
    eprintln!("Pipeline written to {}", output.display());
    Ok(())
}

fn dispatch(cli: &Cli) -> Result<(), String> {
    let registry = Arc::new(build_registry(cli.plugins.as_deref())?);
    match &cli.command {
        Command::Run(args) => run_command(&registry, cli, args),
        Command::Graph { pipeline } => graph_command(&load_pipeline(&registry, pipeline, cli.strict)?, cli.json),
        Command::Columns { pipeline, until } => {
            columns_command(&load_pipeline(&registry, pipeline, cli.strict)?, *until, cli.json)
        }
        Command::Validate { pipeline } => validate_command(&load_pipeline(&registry, pipeline, cli.strict)?),
        Command::Copy {
            pipeline,
            output,
            modules,
        } => copy_command(&load_pipeline(&registry, pipeline, cli.strict)?, output, modules),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_mode_help_names_a_single_image_set_per_run() {
        let cli = Cli::command();
        let run = cli.find_subcommand("run").unwrap();
        let help = run
            .get_arguments()
            .find(|arg| arg.get_id() == "test_mode")
            .and_then(|arg| arg.get_help())
            .map(ToString::to_string)
            .unwrap();
        assert!(help.contains("first image set of the run"));
        assert!(!help.contains("each group"));
    }

    #[test]
    fn run_flags_build_options() {
        let cli = Cli::try_parse_from([
            "cellpipe-bench",
            "run",
            "analysis.cppipe",
            "--start",
            "2",
            "--group",
            "Plate=P1",
            "--background",
            "--test-mode",
        ])
        .unwrap();
        let Command::Run(args) = &cli.command else {
            unreachable!("parsed the run subcommand");
        };
        assert!(args.test_mode);
        let options = options_from_args(args).unwrap();
        assert_eq!(options.image_set_start, 2);
        assert_eq!(options.execution, ExecutionMode::Background);
        assert_eq!(
            options.grouping.unwrap().get("Plate").map(String::as_str),
            Some("P1")
        );
    }

    #[test]
    fn key_value_needs_a_key() {
        assert_eq!(parse_key_value("a=b=c").unwrap(), ("a".to_string(), "b=c".to_string()));
        assert!(parse_key_value("=x").is_err());
        assert!(parse_key_value("novalue").is_err());
    }
}
