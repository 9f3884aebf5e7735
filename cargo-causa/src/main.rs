//! Cargo subcommand for the causa causal profiler.
//!
//! ```bash
//! cargo causa run --bin myapp -- --app-flag
//! cargo causa report causa.log
//! cargo causa report causa.log --format json
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use anyhow::{bail, Context, Result};
use causa::analysis::{parse_log, Report};
use clap::{Parser, Subcommand, ValueEnum};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Parser, Debug)]
#[command(name = "cargo")]
#[command(bin_name = "cargo")]
struct Cargo {
    #[command(subcommand)]
    command: CargoCommand,
}

#[derive(Subcommand, Debug)]
enum CargoCommand {
    /// Causal profiler for Rust programs.
    Causa(CausaArgs),
}

#[derive(Parser, Debug)]
#[command(version, about)]
struct CausaArgs {
    #[command(subcommand)]
    command: CausaCommand,
}

#[derive(Subcommand, Debug)]
enum CausaCommand {
    /// Build a target with debug info and run it under the profiler.
    Run(RunArgs),
    /// Rank source lines by causal impact from a profile log.
    Report(ReportArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Binary target to build and run.
    #[arg(long)]
    bin: Option<String>,

    /// Example target to build and run.
    #[arg(long, conflicts_with = "bin")]
    example: Option<String>,

    #[arg(long)]
    release: bool,

    /// Profile log to append to.
    #[arg(long, short, default_value = causa::config::DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Inject this build of `libcausa.so` with `LD_PRELOAD` so pthread calls
    /// and all threads are profiled without code changes.
    #[arg(long, value_name = "LIBCAUSA")]
    preload: Option<PathBuf>,

    /// Objects whose lines may be selected (`MAIN` is the main executable,
    /// `%` matches anything). Repeatable.
    #[arg(long = "binary-scope", value_name = "PATTERN")]
    binary_scope: Vec<String>,

    /// Source files whose lines may be selected. Repeatable.
    #[arg(long = "source-scope", value_name = "PATTERN")]
    source_scope: Vec<String>,

    /// Throughput points to register before they are first visited. Repeatable.
    #[arg(long = "progress-point", value_name = "NAME")]
    progress_points: Vec<String>,

    /// Only ever select this line (`file:line`).
    #[arg(long)]
    fixed_line: Option<String>,

    /// Always use this virtual speedup, in percent.
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=100))]
    fixed_speedup: Option<u32>,

    /// Run a single experiment covering the whole execution.
    #[arg(long)]
    end_to_end: bool,

    /// Also speed up arrivals by a drawn share of every sample period.
    #[arg(long)]
    arrival_speedup: bool,

    /// CPU-time sampling period in microseconds.
    #[arg(long)]
    sample_period_us: Option<u64>,

    /// Print profiler diagnostics.
    #[arg(long, short)]
    verbose: bool,

    /// Arguments passed to the profiled program.
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
    Csv,
}

#[derive(Parser, Debug)]
struct ReportArgs {
    /// Profile log written by `cargo causa run`.
    #[arg(default_value = causa::config::DEFAULT_OUTPUT)]
    input: PathBuf,

    #[arg(long, short, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Minimum number of distinct speedups a line needs to be ranked.
    #[arg(long, default_value_t = 5)]
    min_points: usize,

    /// Number of most-sampled lines to list.
    #[arg(long, default_value_t = 10)]
    top: usize,
}

fn main() -> Result<()> {
    let Cargo {
        command: CargoCommand::Causa(causa),
    } = Cargo::parse();

    match causa.command {
        CausaCommand::Run(args) => run(&args),
        CausaCommand::Report(args) => report(&args),
    }
}

fn run(args: &RunArgs) -> Result<()> {
    let binary = build_target(args)?;
    eprintln!("Built: {}", binary.display());

    let mut cmd = Command::new(&binary);
    cmd.args(&args.args).envs(profiling_env(args));
    let status = cmd
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("failed to start {}", binary.display()))?;

    if !status.success() {
        eprintln!("{} exited with {}", binary.display(), status);
    }
    eprintln!(
        "Profile appended to {}; run `cargo causa report {}` to analyze it.",
        args.output.display(),
        args.output.display()
    );
    Ok(())
}

/// Environment that configures the profiler inside the target process.
fn profiling_env(args: &RunArgs) -> Vec<(&'static str, OsString)> {
    let mut env: Vec<(&'static str, OsString)> = vec![
        ("CAUSA_ENABLED", "1".into()),
        ("CAUSA_OUTPUT", args.output.clone().into_os_string()),
    ];
    let mut list = |key: &'static str, values: &[String]| {
        if !values.is_empty() {
            env.push((key, values.join("\t").into()));
        }
    };
    list("CAUSA_BINARY_SCOPE", &args.binary_scope);
    list("CAUSA_SOURCE_SCOPE", &args.source_scope);
    list("CAUSA_PROGRESS_POINTS", &args.progress_points);

    if let Some(line) = &args.fixed_line {
        env.push(("CAUSA_FIXED_LINE", line.into()));
    }
    if let Some(speedup) = args.fixed_speedup {
        env.push(("CAUSA_FIXED_SPEEDUP", speedup.to_string().into()));
    }
    if let Some(period) = args.sample_period_us {
        env.push(("CAUSA_SAMPLE_PERIOD_US", period.to_string().into()));
    }
    if args.end_to_end {
        env.push(("CAUSA_END_TO_END", "1".into()));
    }
    if args.arrival_speedup {
        env.push(("CAUSA_ARRIVAL_SPEEDUP", "1".into()));
    }
    if args.verbose {
        env.push(("CAUSA_VERBOSE", "1".into()));
    }
    if let Some(lib) = &args.preload {
        env.push(("LD_PRELOAD", lib.clone().into_os_string()));
    }
    env
}

/// Builds the requested target with full debug info and frame pointers.
fn build_target(args: &RunArgs) -> Result<PathBuf> {
    let mut cmd = Command::new("cargo");
    cmd.arg("build");
    if args.release {
        cmd.arg("--release");
    }
    if let Some(bin) = &args.bin {
        cmd.arg("--bin").arg(bin);
    } else if let Some(example) = &args.example {
        cmd.arg("--example").arg(example);
    }

    let rustflags = std::env::var("RUSTFLAGS").unwrap_or_default();
    cmd.env(
        "RUSTFLAGS",
        format!("{rustflags} -C debuginfo=2 -C force-frame-pointers=yes"),
    );

    let status = cmd.status().context("failed to run cargo build")?;
    if !status.success() {
        bail!("cargo build failed");
    }

    let metadata = cargo_metadata()?;
    let target_dir = metadata["target_directory"]
        .as_str()
        .map(PathBuf::from)
        .context("target_directory not found in cargo metadata")?;
    let name = match (&args.bin, &args.example) {
        (Some(bin), _) => bin.clone(),
        (None, Some(example)) => example.clone(),
        (None, None) => metadata["packages"][0]["name"]
            .as_str()
            .map(String::from)
            .context("package name not found in cargo metadata")?,
    };

    let binary = binary_path(&target_dir, args.release, args.example.is_some(), &name);
    if !binary.exists() {
        bail!("binary not found at {}", binary.display());
    }
    Ok(binary)
}

fn binary_path(target_dir: &Path, release: bool, example: bool, name: &str) -> PathBuf {
    let mut path = target_dir.join(if release { "release" } else { "debug" });
    if example {
        path.push("examples");
    }
    path.join(name)
}

fn cargo_metadata() -> Result<serde_json::Value> {
    let output = Command::new("cargo")
        .args(["metadata", "--format-version=1", "--no-deps"])
        .output()
        .context("failed to run cargo metadata")?;
    if !output.status.success() {
        bail!("cargo metadata failed");
    }
    serde_json::from_slice(&output.stdout).context("failed to parse cargo metadata")
}

fn report(args: &ReportArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let profile =
        parse_log(&text).with_context(|| format!("failed to parse {}", args.input.display()))?;
    let report = Report::new(&profile, args.min_points, args.top);

    match args.format {
        Format::Text => print!("{}", report.to_text()),
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Csv => print!("{}", report.to_csv()),
    }
    Ok(())
}
