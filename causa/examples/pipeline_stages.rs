//! A three-stage pipeline whose middle stage limits throughput.
//!
//! A time profile shows `transform` as the hottest code, which is true but
//! not the useful part. The causal profile shows that speeding up
//! `transform` raises `items` throughput almost one for one, while speeding
//! up `parse` or `serialize` does nothing.
//!
//! ```bash
//! cargo causa run --example pipeline_stages --release
//! cargo causa report
//! ```

#![allow(clippy::print_stdout)]

use std::hint::black_box;
use std::sync::mpsc::sync_channel;
use std::time::{Duration, Instant};

const RUN_FOR: Duration = Duration::from_secs(20);

fn parse(id: u64) -> Vec<u64> {
    (0..64).map(|i| id.wrapping_mul(31).wrapping_add(i)).collect()
}

fn transform(mut item: Vec<u64>) -> Vec<u64> {
    for _ in 0..2_000 {
        for v in &mut item {
            *v = v.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        }
    }
    item
}

#[causa::profile("items")]
fn serialize(item: &[u64]) -> u64 {
    item.iter().fold(0, |acc, v| acc ^ v)
}

fn main() {
    if let Err(e) = causa::init() {
        eprintln!("causa: {e}");
    }

    let (parsed_tx, parsed_rx) = sync_channel::<Vec<u64>>(16);
    let (done_tx, done_rx) = sync_channel::<Vec<u64>>(16);

    let parser = causa::spawn(move || {
        let start = Instant::now();
        let mut id = 0;
        while start.elapsed() < RUN_FOR {
            if parsed_tx.send(parse(id)).is_err() {
                break;
            }
            id += 1;
        }
    });

    let transformer = causa::spawn(move || {
        for item in parsed_rx {
            if done_tx.send(transform(item)).is_err() {
                break;
            }
        }
    });

    let mut checksum = 0;
    let mut count = 0u64;
    for item in done_rx {
        checksum ^= black_box(serialize(&item));
        count += 1;
    }

    parser.join().expect("parser panicked");
    transformer.join().expect("transformer panicked");
    println!("{count} items, checksum {checksum:x}");

    causa::shutdown();
}
