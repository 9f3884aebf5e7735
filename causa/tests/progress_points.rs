//! Progress point counting under concurrency.
//!
//! Visits are the profiler's only measure of progress, so no visit may be
//! lost or double counted no matter how many threads hit a point at once.

use causa::progress_point::ProgressRegistry;
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 8;
const VISITS: u64 = 100_000;

#[test]
fn concurrent_visits_are_exact() {
    let registry = Arc::new(ProgressRegistry::new(16));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                // every thread looks the point up itself
                let point = registry.throughput("ops").unwrap();
                barrier.wait();
                for _ in 0..VISITS {
                    point.visit(1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(registry.throughput("ops").unwrap().count(), THREADS as u64 * VISITS);
}

#[test]
fn concurrent_lookups_share_one_point() {
    let registry = Arc::new(ProgressRegistry::new(16));
    let points: Vec<_> = (0..THREADS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.latency("request").unwrap())
        })
        .map(|h| h.join().unwrap())
        .collect();

    assert!(points.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

#[test]
fn deltas_never_decrease_while_visits_continue() {
    let registry = Arc::new(ProgressRegistry::new(4));
    let point = registry.throughput("ticks").unwrap();
    let snapshot = registry.save();

    let writer = {
        let point = Arc::clone(&point);
        thread::spawn(move || {
            for _ in 0..VISITS {
                point.visit(1);
            }
        })
    };

    let mut last = 0;
    while !writer.is_finished() {
        let delta = snapshot.throughput[0].delta();
        assert!(delta >= last);
        last = delta;
    }
    writer.join().unwrap();
    assert_eq!(snapshot.throughput[0].delta(), VISITS);
}

#[test]
fn latency_in_flight_counts_pending_transactions() {
    let registry = ProgressRegistry::new(4);
    let point = registry.latency("queue").unwrap();
    point.visit_begin(3);
    point.visit_end(1);
    let saved = registry.save();

    point.visit_begin(10);
    point.visit_end(4);
    let latency = &saved.latency[0];
    assert_eq!(latency.begin_delta(), 10);
    assert_eq!(latency.end_delta(), 4);
    assert_eq!(latency.difference(), 8);
}

#[test]
fn full_registry_still_serves_existing_points() {
    let registry = ProgressRegistry::new(2);
    let a = registry.throughput("a").unwrap();
    registry.throughput("b").unwrap();

    assert!(registry.throughput("c").is_none());
    assert!(Arc::ptr_eq(&a, &registry.throughput("a").unwrap()));
}
