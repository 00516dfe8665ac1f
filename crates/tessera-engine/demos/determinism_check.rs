//! Determinism check: run the reference scenario at several worker counts
//! and confirm every run lands on the same world digest.
//!
//! Run with: `cargo run -p tessera-engine --example determinism_check [config.json]`
//!
//! The optional argument is a JSON `ScenarioConfig`; missing fields take
//! their defaults (4096 entities, 120 ticks, seed 0xB01D5EED).

use anyhow::{bail, Context, Result};
use tessera_engine::logging::init_tracing;
use tessera_engine::scenario::{self, ScenarioConfig};

fn main() -> Result<()> {
    init_tracing("info");

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading scenario config {path}"))?;
            ScenarioConfig::from_json(&json)?
        }
        None => ScenarioConfig::default(),
    };

    let baseline = scenario::run(&config).context("baseline run")?;
    println!("{}", serde_json::to_string_pretty(&baseline)?);

    for workers in [1, 2, 8] {
        let outcome = scenario::run(&ScenarioConfig {
            worker_count: workers,
            ..config.clone()
        })
        .with_context(|| format!("run with {workers} workers"))?;
        if outcome.digest != baseline.digest {
            bail!(
                "digest mismatch with {workers} workers: {} vs baseline {}",
                outcome.digest,
                baseline.digest
            );
        }
        println!("{workers} workers: {}", outcome.digest);
    }
    println!("deterministic across worker counts");
    Ok(())
}
