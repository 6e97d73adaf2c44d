mod router;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use hdrhistogram::Histogram;
use tokio::sync::Mutex;

use router::{GroupDirectory, Router, OP_DELETE, OP_READ};

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("keyvalue");
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Op code: 0=READ 1=WRITE 2=DELETE 3=MODIFY
    #[arg(short, long, default_value = "0")]
    op: u32,

    /// Key to read/write/delete
    #[arg(short, long)]
    key: String,

    /// Value for WRITE/MODIFY
    #[arg(short, long, default_value = "")]
    value: String,

    /// Comma separated peer addresses of the replication group
    #[arg(long, default_value = "http://127.0.0.1:4001")]
    conf: String,

    /// Name prefix of the replication groups
    #[arg(short, long, default_value = "replica")]
    group: String,

    /// Number of replication groups keys are sharded across
    #[arg(long, default_value = "1")]
    num_groups: u32,

    /// Timeout for each request in milliseconds
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    /// Number of concurrent dispatch tasks
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// Print log for each request
    #[arg(long)]
    log_each_request: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();

    // Process-wide quit signal, checked between retry iterations; in-flight
    // requests run out their timeout.
    let quit = Arc::new(AtomicBool::new(false));
    {
        let quit = quit.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("asked to quit");
            quit.store(true, Ordering::Relaxed);
        });
    }

    let peers: Vec<String> = args
        .conf
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    anyhow::ensure!(!peers.is_empty(), "--conf must list at least one peer");

    let directory = GroupDirectory::new(&args.group, args.num_groups);
    let router = Arc::new(Router::new(directory, peers, args.timeout_ms, quit));
    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));

    let mut handles = vec![];
    for _ in 0..args.concurrency {
        let router = router.clone();
        let histogram = histogram.clone();
        let op = args.op;
        let key = args.key.clone().into_bytes();
        let value = args.value.clone().into_bytes();
        let log_each_request = args.log_each_request;

        handles.push(tokio::spawn(async move {
            let start = Instant::now();
            match router.dispatch(op, &key, &value).await {
                Ok(result) => {
                    let elapsed = start.elapsed();
                    if op == OP_READ {
                        println!(
                            "read {} : {}",
                            String::from_utf8_lossy(&key),
                            String::from_utf8_lossy(&result)
                        );
                    } else if log_each_request {
                        let action = if op == OP_DELETE { "deleted" } else { "inserted" };
                        log::info!(
                            "{} {} in {} us",
                            action,
                            String::from_utf8_lossy(&key),
                            elapsed.as_micros()
                        );
                    }
                    let mut hist = histogram.lock().await;
                    let _ = hist.record(elapsed.as_micros() as u64);
                }
                Err(e) => eprintln!("request failed: {}", e),
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    let hist = histogram.lock().await;
    if !hist.is_empty() {
        println!("\nLatency Distribution (microseconds):");
        println!("p50: {}", hist.value_at_percentile(50.0));
        println!("p90: {}", hist.value_at_percentile(90.0));
        println!("p99: {}", hist.value_at_percentile(99.0));
    }

    Ok(())
}
