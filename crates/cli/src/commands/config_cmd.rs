//! `parley config`: configuration helpers.

use crate::load_config;
use parley_config::AppConfig;
use std::path::Path;

const REDACTED: &str = "********";

pub fn show(path: &Path) -> anyhow::Result<()> {
    let config = redacted(load_config(path)?);
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn print_default() {
    println!("{}", AppConfig::default_toml());
}

pub fn path(path: &Path) {
    println!("{}", path.display());
}

pub fn validate(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    println!("Config OK: {}", path.display());
    println!();
    println!("  Backend:      {} ({})", config.backend.kind, config.backend.model);
    match &config.summarizer.backend {
        Some(summarizer) => println!("  Summarizer:   {} ({})", summarizer.kind, summarizer.model),
        None => println!("  Summarizer:   same as backend"),
    }
    println!(
        "  Context:      {} tokens, {}",
        config.context.max_context_tokens,
        if config.context.hierarchical.enabled {
            "hierarchical"
        } else {
            "flat"
        }
    );
    println!(
        "  Tools:        {} (categories: {})",
        if config.tools.enabled { "on" } else { "off" },
        config.tools.enabled_categories.join(", ")
    );
    if config.persistence.enabled {
        println!("  Sessions:     {}", config.persistence.directory.display());
    } else {
        println!("  Sessions:     not saved");
    }

    if config.backend.api_key.is_none() && matches!(config.backend.kind.as_str(), "openai" | "anthropic") {
        println!();
        println!("  warning: no API key set (PARLEY_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY)");
    }
    Ok(())
}

/// Hide credentials before printing.
fn redacted(mut config: AppConfig) -> AppConfig {
    if config.backend.api_key.is_some() {
        config.backend.api_key = Some(REDACTED.into());
    }
    if let Some(summarizer) = config.summarizer.backend.as_mut() {
        if summarizer.api_key.is_some() {
            summarizer.api_key = Some(REDACTED.into());
        }
    }
    config
}
