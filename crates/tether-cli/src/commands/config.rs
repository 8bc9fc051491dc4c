//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use tether_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            output.print_json(&config)?;
        }
        OutputFormat::Quiet => {
            println!("{}", config_path.cloned().unwrap_or_else(Config::config_file_path).display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!(
                "  log_filter: {}",
                config.log_filter.as_deref().unwrap_or("(not set)")
            );
            println!();
            println!("[health]");
            if config.health.endpoints.is_empty() {
                println!("  endpoints:              (none)");
            }
            for endpoint in &config.health.endpoints {
                println!("  endpoint:               {}", endpoint);
            }
            println!("  probe_interval_ms:      {}", config.health.probe_interval_ms);
            println!("  probe_timeout_ms:       {}", config.health.probe_timeout_ms);
            println!("  max_stable_rtt_ms:      {}", config.health.max_stable_rtt_ms);
            println!();
            println!("[stream]");
            println!("  max_restarts:           {}", config.stream.max_restarts);
            println!("  recreate_threshold:     {}", config.stream.recreate_threshold);
            println!("  creation_timeout_ms:    {}", config.stream.creation_timeout_ms);
            println!("  race_cooldown_ms:       {}", config.stream.race_cooldown_ms);
            println!("  fatal_recovery_delay_ms: {}", config.stream.fatal_recovery_delay_ms);
            println!("  stale_timeout_ms:       {}", config.stream.stale_timeout_ms);
            println!();
            println!("[discovery]");
            println!("  max_attempts:           {}", config.discovery.max_attempts);
            println!("  base_delay_ms:          {}", config.discovery.base_delay_ms);
            println!("  max_delay_ms:           {}", config.discovery.max_delay_ms);
            println!("  interval_ms:            {}", config.discovery.interval_ms);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Print the config file path
pub fn path(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);

    if output.is_json() {
        output.print_json(&serde_json::json!({ "path": path, "exists": path.exists() }))?;
    } else {
        println!("{}", path.display());
    }
    Ok(())
}

/// Set a configuration value
///
/// Keys are dotted paths into the config (e.g. `stream.max_restarts`).
/// Values are parsed according to the type of the current value; lists
/// take comma-separated items.
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;
    let config = apply(config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(mut config: Config, key: &str, value: &str) -> Result<Config> {
    if key == "log_filter" {
        config.log_filter = if value.is_empty() || value == "none" {
            None
        } else {
            Some(value.to_string())
        };
        return Ok(config);
    }

    let mut doc = toml::Value::try_from(&config).context("Failed to serialize config")?;
    let slot = key
        .split('.')
        .try_fold(&mut doc, |node, part| node.get_mut(part))
        .filter(|slot| !slot.is_table());

    let Some(slot) = slot else {
        bail!(
            "Unknown configuration key: '{}'\n\
             Valid keys: log_filter, health.<field>, stream.<field>, discovery.<field> \
             (see `tether config show`)",
            key
        );
    };

    *slot = parse_like(slot, value)
        .with_context(|| format!("Invalid value for {}: '{}'", key, value))?;

    let updated: Config = doc.try_into().context("Invalid configuration")?;
    updated.validate()?;
    Ok(updated)
}

/// Parse `raw` into a value of the same TOML type as `current`
fn parse_like(current: &toml::Value, raw: &str) -> Result<toml::Value> {
    Ok(match current {
        toml::Value::Integer(_) => toml::Value::Integer(raw.parse()?),
        toml::Value::Float(_) => toml::Value::Float(raw.parse()?),
        toml::Value::Boolean(_) => toml::Value::Boolean(raw.parse()?),
        toml::Value::String(_) => toml::Value::String(raw.to_string()),
        toml::Value::Array(_) => toml::Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_string()))
                .collect(),
        ),
        other => bail!("cannot set a {} value", other.type_str()),
    })
}
