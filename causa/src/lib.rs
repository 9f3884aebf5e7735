//! Causa: a causal profiler for Rust programs.
//!
//! Causal profiling answers "if I made this line faster, how much faster
//! would my program get?" rather than "where does my program spend time?".
//! While the program runs, causa picks one source line at a time and
//! virtually speeds it up: every time a thread is sampled executing the line,
//! every other thread is paused for a fraction of the sampling period. The
//! change in the rate at which progress points are reached tells you the
//! effect an actual speedup of that line would have.
//!
//! # Usage
//!
//! Mark progress points in your code with the [`progress!`] macro:
//!
//! ```ignore
//! fn process_request() {
//!     // ... do work ...
//!     causa::progress!("request_complete");
//! }
//! ```
//!
//! or add one at the end of a function with `#[profile]`:
//!
//! ```ignore
//! #[causa::profile]
//! fn process_request() {
//!     // ... do work ...
//! }
//! ```
//!
//! Then start the profiler from `main` and stop it before exiting:
//!
//! ```ignore
//! fn main() {
//!     causa::init().expect("failed to start causa");
//!     // ... your program ...
//!     causa::shutdown();
//! }
//! ```
//!
//! `cargo causa run` sets `CAUSA_ENABLED=1` and the other `CAUSA_*`
//! variables; `cargo causa report` turns the resulting log into a ranking.
//! Threads must be created with [`thread::spawn`] to be profiled, unless
//! the `preload` build is injected with `LD_PRELOAD`.

#[macro_use]
mod log;

pub mod analysis;
pub mod config;
pub mod experiment;
pub mod ffi;
pub mod loader;
pub mod per_thread;
#[cfg(feature = "preload")]
mod posix;
pub mod progress_point;
pub mod runner;
pub mod sampler;
pub mod source_map;
pub mod sync;
pub mod thread;
pub mod thread_table;
pub mod timer;

use crate::config::{Config, ConfigError};
use crate::experiment::Profiler;
use crate::loader::LoadError;
use crate::sampler::SamplerError;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use causa_macros::{latency, profile};
pub use thread::spawn;

/// Errors that prevent the profiler from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to load debug information: {0}")]
    Load(#[from] LoadError),
    #[error("failed to open {path}: {source}")]
    OutputOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to install the sample handler: {0}")]
    SignalHandler(#[source] SamplerError),
    #[error("failed to spawn the controller thread: {0}")]
    Controller(#[source] std::io::Error),
    #[error("the profiler is already running")]
    AlreadyInstalled,
}

static PROFILER: spin::Once<Arc<Profiler>> = spin::Once::new();

/// The process-wide profiler, once started.
#[must_use]
pub fn instance() -> Option<&'static Arc<Profiler>> {
    PROFILER.get()
}

/// Makes `profiler` the process-wide instance used by progress points,
/// signal handlers, and interposed calls.
///
/// # Errors
///
/// Returns [`StartupError::AlreadyInstalled`] if an instance already exists.
pub fn install(profiler: Arc<Profiler>) -> Result<&'static Arc<Profiler>, StartupError> {
    let mut fresh = false;
    let installed = PROFILER.call_once(|| {
        fresh = true;
        profiler
    });
    if fresh {
        Ok(installed)
    } else {
        Err(StartupError::AlreadyInstalled)
    }
}

/// Starts the profiler if `CAUSA_ENABLED=1`, reading the rest of the
/// configuration from the environment. Does nothing otherwise, or when the
/// profiler was already started by the preload constructor.
///
/// # Errors
///
/// Returns an error if profiling was requested but could not be started.
pub fn init() -> Result<(), StartupError> {
    if instance().is_none() && std::env::var("CAUSA_ENABLED").is_ok_and(|v| v == "1") {
        start(Config::from_env()?)?;
    }
    Ok(())
}

/// Loads debug information, installs the sample handler, profiles the
/// calling thread, and starts the experiment controller.
///
/// # Errors
///
/// Fails if debug information cannot be read, the profiler is already
/// running, or the handler, output log, or controller cannot be set up.
pub fn start(config: Config) -> Result<(), StartupError> {
    log::set_verbose(config.verbose);
    let source_map = loader::load(&config)?;
    info!("{} source lines in scope", source_map.len());

    let profiler = install(Arc::new(Profiler::new(&config, source_map)))?;
    sampler::install_handler().map_err(StartupError::SignalHandler)?;
    profiler.enable_signals();
    profiler.begin_sampling(None);
    profiler.start(&config)
}

/// Stops profiling the calling thread, ends the experiment loop, and waits
/// for the final log records. Safe to call more than once.
pub fn shutdown() {
    if let Some(profiler) = instance() {
        profiler.end_sampling();
        profiler.shutdown();
    }
}
