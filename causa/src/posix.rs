//! Interposition for programs run with `LD_PRELOAD=libcausa.so`.
//!
//! Loading the library starts the profiler from the `CAUSA_*` environment,
//! and process exit shuts it down. The submodules replace pthread and signal
//! functions with wrappers that keep delay accounting correct across
//! blocking calls and keep `SIGPROF` deliverable.

mod pthread;
mod real;
mod signal;

use crate::config::Config;

// Unit tests of the interposers must not start a profiler in the test binary.
#[cfg(not(test))]
#[used]
#[link_section = ".init_array"]
static START_ON_LOAD: extern "C" fn() = start_on_load;

extern "C" fn shutdown_at_exit() {
    crate::shutdown();
}

#[cfg_attr(test, allow(dead_code))]
extern "C" fn start_on_load() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => fatal!("{}", e),
    };
    if let Err(e) = crate::start(config) {
        fatal!("{}", e);
    }
    // SAFETY: registering a plain extern "C" function.
    if unsafe { libc::atexit(shutdown_at_exit) } != 0 {
        warning!("failed to register the exit handler; the log may be incomplete");
    }
}
