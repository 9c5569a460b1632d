//! Replays a synthetic workload against an adapter that only sleeps.
//!
//! ```text
//! cargo run --example dummy [config.json]
//! RUST_LOG=pacer=debug cargo run --example dummy
//! ```
use std::time::Duration;

use pacer::{
    DriverConfig, DummyDb, Operation, Reporter, RunnerError, Scenario, WorkloadRunner,
    report::{JsonReporter, StdoutReporter, WorkloadReport},
};
use tracing_subscriber::EnvFilter;

/// Reads every 10ms; every fifth operation is an update that later reads depend on.
fn workload(count: u32) -> impl Iterator<Item = Operation> + Send + 'static {
    let mut last_update = None;
    (0..count).map(move |i| {
        let time_ms = i64::from(i) * 10;
        if i % 5 == 0 {
            last_update = Some(time_ms);
            Operation::at(1, time_ms)
        } else {
            let read = Operation::at(2 + i % 2, time_ms);
            match last_update {
                Some(update) => read.depends_on(update),
                None => read,
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match std::env::args().nth(1) {
        Some(path) => DriverConfig::from_path(path)?,
        None => DriverConfig::builder()
            .thread_count(4)
            .time_compression_ratio(0.5)
            .status_interval(Duration::from_secs(1))
            .build(),
    };

    let result = Scenario::builder()
        .name("dummy workload")
        .db(DummyDb::new(Duration::from_millis(3)))
        .operations(workload(500))
        .executor(WorkloadRunner::builder().config(config).build())
        .build()
        .run()
        .await;

    let snapshot = match result {
        Ok(snapshot) => snapshot,
        Err(RunnerError::Aborted { errors, partial }) => {
            eprintln!("workload aborted:\n{errors}");
            StdoutReporter.report(WorkloadReport::from(&*partial)).await?;
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    StdoutReporter.report(WorkloadReport::from(&snapshot)).await?;
    JsonReporter::new(std::io::stdout())
        .report(WorkloadReport::from(&snapshot))
        .await?;
    Ok(())
}
