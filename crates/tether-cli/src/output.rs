//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use anyhow::{Context, Result};
use serde::Serialize;

use tether_core::{
    ClassifiedError, DiscoveryReport, DiscoveryResult, EndpointHealth, MessageEvent,
    NetworkCondition, StreamState,
};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
        println!("{}", json);
        Ok(())
    }

    /// Print the endpoint health table
    pub fn print_endpoints(&self, endpoints: &[EndpointHealth], condition: NetworkCondition) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                if endpoints.is_empty() {
                    println!("No endpoints configured.");
                } else {
                    for endpoint in endpoints {
                        let status = if endpoint.healthy { "✓" } else { "✗" };
                        let detail = endpoint
                            .error
                            .as_ref()
                            .map(|e| format!("  ({})", e))
                            .unwrap_or_default();
                        println!(
                            "{} {:<45} {:>6} ms{}",
                            status,
                            truncate(&endpoint.endpoint, 45),
                            endpoint.latency_ms,
                            detail
                        );
                    }
                    let healthy = endpoints.iter().filter(|e| e.healthy).count();
                    println!("\n{}/{} endpoint(s) healthy", healthy, endpoints.len());
                }
                println!("Network: {}", condition);
            }
            OutputFormat::Json => {
                self.print_json(&serde_json::json!({
                    "condition": condition,
                    "endpoints": endpoints,
                }))?;
            }
            OutputFormat::Quiet => {
                println!("{}", condition);
            }
        }
        Ok(())
    }

    /// Print one stream event as it happens (human mode only)
    pub fn stream_state(&self, state: &StreamState) {
        if self.format == OutputFormat::Human {
            println!(
                "[state]   {:<10} generation={} restarts={} errors={}",
                state.phase, state.stream_generation, state.restart_count, state.consecutive_errors
            );
        }
    }

    pub fn stream_error(&self, error: &ClassifiedError) {
        if self.format == OutputFormat::Human {
            println!("[error]   {}", error);
            if error.requires_cooldown() {
                println!("          cooldown engaged before the next attempt");
            }
            println!("          {}", error.recovery_hint());
        }
    }

    pub fn stream_message(&self, event: &MessageEvent) {
        if self.format == OutputFormat::Human {
            println!(
                "[message] {} {}: {}",
                truncate(&event.conversation_id, 12),
                event.sender_id,
                truncate_line(&event.content, 60)
            );
        }
    }

    /// Print a discovery result and report
    pub fn print_discovery(&self, result: &DiscoveryResult, report: &DiscoveryReport) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                println!("Discovery:");
                println!("  Found:     {} ({} direct, {} group)", result.total, result.direct_count, result.group_count);
                println!("  Listed:    {} before dedup", result.combined_count);
                println!("  Source:    {}", result.strategy_used);
                println!("  Network:   {}", result.network_condition);
                println!("  Rounds:    {}", report.rounds_attempted);
                if !report.attempts.is_empty() {
                    println!();
                    for attempt in &report.attempts {
                        let outcome = match &attempt.error {
                            Some(e) => format!("failed: {}", e),
                            None => format!("{} found", attempt.total),
                        };
                        println!(
                            "  #{} {:<22} {:>6} ms  {}",
                            attempt.round + 1,
                            attempt.strategy,
                            attempt.duration_ms,
                            outcome
                        );
                    }
                }
                println!();
                for recommendation in &report.recommendations {
                    println!("  - {}", recommendation);
                }
            }
            OutputFormat::Json => {
                self.print_json(&serde_json::json!({
                    "result": result,
                    "report": report,
                }))?;
            }
            OutputFormat::Quiet => {
                println!("{}", result.total);
            }
        }
        Ok(())
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Truncate to first line and max length
fn truncate_line(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    truncate(first_line, max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
    }

    #[test]
    fn test_truncate_line() {
        assert_eq!(truncate_line("single line", 20), "single line");
        assert_eq!(truncate_line("line one\nline two", 20), "line one");
    }
}
