//! Throughput and latency of the command engine
//!
//! Drives a `KvClient` over an in-memory driver with simulated round-trip
//! latency, for several worker pool sizes, inline and executor delivery.

use dbqueue::{logging, ClientOptions, Executor, KvClient, MemoryKv, Result, ThreadExecutor};
use std::env;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const PRODUCERS: usize = 8;

#[derive(Debug)]
struct BenchmarkResults {
    operation: String,
    total_operations: usize,
    duration: Duration,
    ops_per_second: f64,
    avg_latency_ms: f64,
    p95_latency_ms: f64,
    p99_latency_ms: f64,
}

impl BenchmarkResults {
    fn new(operation: String, total_operations: usize, duration: Duration, latencies: &mut [Duration]) -> Self {
        latencies.sort();

        let ops_per_second = total_operations as f64 / duration.as_secs_f64();
        let avg_latency_ms = latencies.iter().map(|d| d.as_secs_f64() * 1000.0).sum::<f64>()
            / latencies.len().max(1) as f64;

        let percentile = |p: f64| {
            let index = (latencies.len() as f64 * p) as usize;
            latencies
                .get(index.min(latencies.len().saturating_sub(1)))
                .unwrap_or(&Duration::ZERO)
                .as_secs_f64()
                * 1000.0
        };
        let p95_latency_ms = percentile(0.95);
        let p99_latency_ms = percentile(0.99);

        Self {
            operation,
            total_operations,
            duration,
            ops_per_second,
            avg_latency_ms,
            p95_latency_ms,
            p99_latency_ms,
        }
    }

    fn print(&self) {
        println!("=== {} ===", self.operation);
        println!("Total operations: {}", self.total_operations);
        println!("Duration: {:.2}s", self.duration.as_secs_f64());
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
        println!("Average latency: {:.2}ms", self.avg_latency_ms);
        println!("P95 latency: {:.2}ms", self.p95_latency_ms);
        println!("P99 latency: {:.2}ms", self.p99_latency_ms);
        println!();
    }
}

/// Submit `operations` mixed commands from `PRODUCERS` threads and measure
/// submit-to-callback latency.
fn run(
    label: &str,
    workers: usize,
    operations: usize,
    latency: Duration,
    executor: Option<Arc<dyn Executor>>,
) -> Result<BenchmarkResults> {
    let options = ClientOptions {
        name: format!("bench-{}", workers),
        worker_count: workers,
        queue_capacity: 1000,
        ..ClientOptions::default()
    };
    let driver = Arc::new(MemoryKv::with_latency(latency));
    let client = KvClient::new(&options, driver, executor)?;

    let (tx, rx) = mpsc::channel::<Duration>();
    let start = Instant::now();

    let per_producer = operations / PRODUCERS;
    let mut producers = Vec::with_capacity(PRODUCERS);
    for producer in 0..PRODUCERS {
        let client = client.clone();
        let tx = tx.clone();
        producers.push(thread::spawn(move || -> Result<()> {
            for i in 0..per_producer {
                let key = format!("bench_key_{}", (producer * per_producer + i) % 1000);
                let submitted = Instant::now();
                let tx = tx.clone();
                // 70% reads, 30% writes
                if i % 10 < 7 {
                    client.get(key, move |_| {
                        let _ = tx.send(submitted.elapsed());
                    })?;
                } else {
                    client.set(key, format!("value_{}", i), None, move |_| {
                        let _ = tx.send(submitted.elapsed());
                    })?;
                }
            }
            Ok(())
        }));
    }
    drop(tx);

    for producer in producers {
        match producer.join() {
            Ok(result) => result?,
            Err(_) => eprintln!("producer thread panicked"),
        }
    }

    let mut latencies: Vec<Duration> = rx.iter().collect();
    let total_duration = start.elapsed();
    client.stop();

    Ok(BenchmarkResults::new(
        format!("{} ({} workers)", label, workers),
        latencies.len(),
        total_duration,
        &mut latencies,
    ))
}

fn main() -> Result<()> {
    logging::init_with("dbqueue=warn");

    let operations: usize = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(20_000);
    let latency = Duration::from_micros(200);

    println!("dbqueue engine benchmarks");
    println!("=========================");
    println!("Operations per run: {}", operations);
    println!("Simulated driver latency: {:?}", latency);
    println!();

    for workers in [1, 4, 10, 32] {
        run("Inline callbacks", workers, operations, latency, None)?.print();
    }

    let executor: Arc<dyn Executor> = Arc::new(ThreadExecutor::spawn("bench-executor")?);
    run("Executor callbacks", 10, operations, latency, Some(executor))?.print();

    Ok(())
}
