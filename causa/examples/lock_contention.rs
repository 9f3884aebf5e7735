//! Workers that serialize on one mutex.
//!
//! Each request does some private work and then updates shared state under a
//! lock. With enough workers the critical section is the bottleneck: the
//! causal profile ranks the lines inside `record` above the private work,
//! even though the private work takes more CPU time in total.
//!
//! Blocked time is credited through `causa::sync::intercept`; with
//! `cargo causa run --preload` the pthread interposers do this instead.
//!
//! ```bash
//! cargo causa run --example lock_contention --release -- 8
//! cargo causa report --format csv
//! ```

#![allow(clippy::print_stdout)]

use causa::sync::{intercept, SyncOp};
use std::hint::black_box;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const RUN_FOR: Duration = Duration::from_secs(20);

struct Stats {
    total: Mutex<u64>,
}

impl Stats {
    fn lock(&self) -> MutexGuard<'_, u64> {
        let guard = intercept(SyncOp::Lock, || self.total.lock(), |_| true);
        guard.unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record(&self, value: u64) {
        let mut total = self.lock();
        let mut v = *total;
        for _ in 0..2_000 {
            v = black_box(v.rotate_left(7) ^ value);
        }
        *total = v;
        intercept(SyncOp::Unlock, || drop(total), |_| true);
    }
}

fn private_work(seed: u64) -> u64 {
    (0..5_000).fold(seed, |acc, i| black_box(acc.wrapping_mul(31).wrapping_add(i)))
}

fn main() {
    if let Err(e) = causa::init() {
        eprintln!("causa: {e}");
    }

    let workers: u64 = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(4);
    let stats = Arc::new(Stats {
        total: Mutex::new(0),
    });

    let handles: Vec<_> = (0..workers)
        .map(|id| {
            let stats = Arc::clone(&stats);
            causa::spawn(move || {
                let start = Instant::now();
                let mut served = 0u64;
                while start.elapsed() < RUN_FOR {
                    stats.record(private_work(id + served));
                    causa::progress!("requests");
                    served += 1;
                }
                served
            })
        })
        .collect();

    let served: u64 = handles
        .into_iter()
        .map(|h| h.join().expect("worker panicked"))
        .sum();
    println!("{served} requests served by {workers} workers, total {}", stats.lock());

    causa::shutdown();
}
