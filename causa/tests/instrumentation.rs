//! Instrumentation surfaces against an installed profiler: the macros, the
//! attributes, profiled threads, and the C API.

use causa::config::Config;
use causa::experiment::Profiler;
use causa::source_map::SourceMap;
use std::ffi::CString;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

fn profiler() -> &'static Arc<Profiler> {
    static INSTALLED: OnceLock<&'static Arc<Profiler>> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let p = Arc::new(Profiler::new(&Config::default(), SourceMap::default()));
        causa::install(p).unwrap()
    })
}

fn throughput(name: &str) -> u64 {
    profiler().progress().throughput(name).unwrap().count()
}

#[causa::profile("handled")]
fn handle(n: u32) -> u32 {
    if n == 0 {
        return 0;
    }
    n * 2
}

#[causa::profile]
fn unnamed() {}

#[causa::latency("request")]
fn serve() -> &'static str {
    "ok"
}

#[test]
fn profile_counts_every_return_path() {
    profiler();
    assert_eq!(handle(0), 0);
    assert_eq!(handle(4), 8);
    assert_eq!(throughput("handled"), 2);
}

#[test]
fn unnamed_points_use_the_function_path() {
    profiler();
    unnamed();
    assert_eq!(throughput(concat!(module_path!(), "::unnamed")), 1);
}

#[test]
fn latency_attribute_pairs_arrivals_and_departures() {
    profiler();
    for _ in 0..3 {
        assert_eq!(serve(), "ok");
    }
    let point = profiler().progress().latency("request").unwrap();
    assert_eq!(point.begin_count(), 3);
    assert_eq!(point.end_count(), 3);
}

#[test]
fn macros_count_visits() {
    profiler();
    for _ in 0..5 {
        causa::progress!("loop");
    }
    {
        causa::scope!("section");
        causa::begin!("manual");
    }
    causa::end!("manual");

    assert_eq!(throughput("loop"), 5);
    let section = profiler().progress().latency("section").unwrap();
    assert_eq!((section.begin_count(), section.end_count()), (1, 1));
    let manual = profiler().progress().latency("manual").unwrap();
    assert_eq!((manual.begin_count(), manual.end_count()), (1, 1));
}

#[test]
fn c_api_shares_counters_with_rust_points() {
    profiler();
    let name = CString::new("from_c").unwrap();
    unsafe {
        causa::ffi::causa_progress(name.as_ptr());
        let counter = causa::ffi::causa_get_counter(causa::ffi::CAUSA_THROUGHPUT, name.as_ptr());
        assert!(!counter.is_null());
        (*counter).fetch_add(2, Ordering::Relaxed);
        causa::ffi::causa_begin(name.as_ptr());
    }
    assert_eq!(throughput("from_c"), 3);
    assert_eq!(profiler().progress().latency("from_c").unwrap().begin_count(), 1);
}

#[test]
fn profiled_threads_register_while_running() {
    let p = profiler();
    let handle = causa::spawn(move || {
        let tid = causa::sampler::current_tid();
        (tid, p.current_state().is_some())
    });
    let (tid, registered) = handle.join().unwrap();
    assert!(registered);
    assert!(p.threads().find(u64::try_from(tid).unwrap()).is_none());
}

#[test]
fn second_install_is_rejected() {
    profiler();
    let other = Arc::new(Profiler::new(&Config::default(), SourceMap::default()));
    assert!(matches!(
        causa::install(other),
        Err(causa::StartupError::AlreadyInstalled)
    ));
}
