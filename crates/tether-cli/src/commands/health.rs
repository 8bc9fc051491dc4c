//! Health command handler

use std::time::Duration;

use anyhow::Result;

use tether_core::{Config, HealthMonitor};

use crate::output::{Output, OutputFormat};

/// Probe the configured endpoints once and print their health
///
/// With `wait_ms`, also waits up to that long for the network to become
/// stable and reports whether it did.
pub async fn check(config: &Config, wait_ms: Option<u64>, output: &Output) -> Result<()> {
    let monitor = HealthMonitor::with_http(config.health.clone());

    let endpoints = monitor.probe_all().await;
    let stable = match wait_ms {
        Some(ms) => Some(monitor.wait_for_stability(Duration::from_millis(ms)).await),
        None => None,
    };
    let condition = monitor.network_condition();

    match (output.format, stable) {
        (OutputFormat::Json, Some(stable)) => {
            output.print_json(&serde_json::json!({
                "condition": condition,
                "stable": stable,
                "endpoints": endpoints,
            }))?;
        }
        _ => {
            output.print_endpoints(&monitor.endpoint_health(), condition)?;
            if let (OutputFormat::Human, Some(stable)) = (output.format, stable) {
                println!(
                    "Stability: {}",
                    if stable { "stable" } else { "not stable within wait" }
                );
            }
        }
    }

    monitor.destroy();
    Ok(())
}
