//! Example: two ranks exchanging messages over the ideal fabric.
//!
//! This example demonstrates in particular:
//!
//! * bench assembly with one application per rank,
//! * eager and rendezvous exchanges side by side,
//! * engine configuration,
//! * end-of-run statistics.
//!
//! ```text
//! ┌──────────────┐   send/recv    ┌──────────────┐
//! │ PingPong (0) │ ◄────────────► │ PingPong (1) │
//! └──────┬───────┘                └──────┬───────┘
//!        │ Engine                        │ Engine
//! ┌──────▼───────────────────────────────▼───────┐
//! │                    Fabric                    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Set `RUST_LOG=msgsim=trace` to follow the protocol steps.

use std::time::Duration;

use msgsim::config::EngineConfig;
use msgsim_util::bench::{BenchBuilder, ExecutionError};
use msgsim_util::fabric::FabricConfig;
use msgsim_util::helper_models::PingPong;

const ITERATIONS: usize = 100;
const THINK: Duration = Duration::from_micros(2);

fn run(len: u32) -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig {
        short_msg_length: 8192,
        ..EngineConfig::default()
    };
    let fabric = FabricConfig {
        latency: Duration::from_nanos(800),
        ..FabricConfig::default()
    };

    let mut bench = BenchBuilder::new()
        .with_config(config)
        .with_fabric(fabric)
        .add_app(PingPong::initiator(1, len, ITERATIONS).with_think_time(THINK))
        .add_app(PingPong::responder(0, len, ITERATIONS).with_think_time(THINK))
        .build()?;

    let report = match bench.run() {
        Ok(report) => report,
        Err(ExecutionError::Deadlock(nodes)) => {
            return Err(format!("ping-pong deadlocked on nodes {:?}", nodes).into())
        }
        Err(e) => return Err(e.into()),
    };

    let elapsed = report.end_time.duration_since(msgsim::time::MonotonicTime::EPOCH);
    let compute = THINK * (2 * ITERATIONS) as u32;
    let per_hop = elapsed.saturating_sub(compute) / (2 * ITERATIONS) as u32;
    println!(
        "{:>7} bytes: {:>4} round trips in {:?} ({:?} per one-way message)",
        len, ITERATIONS, elapsed, per_hop
    );
    for (rank, stats) in report.stats.iter().enumerate() {
        println!(
            "    rank {}: eager {}, rendezvous {}, interrupts {} (missed {})",
            rank, stats.eager_sends, stats.rendezvous_sends, stats.interrupts, stats.missed_interrupts
        );
    }

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    for len in [8, 1024, 8192, 65536] {
        run(len)?;
    }

    Ok(())
}
