pub mod config;
pub mod drivers;
pub mod logging;
pub mod sources;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use config::AppConfig;
use drivers::NormalizedSource;
use sources::{ResourceLoader, SourceConfigs, SourcesProvider, parse_from_bytes};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "sourcesync",
    version,
    about = "Pull collections from external sources into destinations"
)]
pub struct Cli {
    /// Log filter (e.g. `debug`, `sourcesync=trace`); defaults to RUST_LOG or `info`
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configured sources without building drivers
    Check {
        /// Path to the TOML configuration file
        #[arg(long, short)]
        config: PathBuf,

        /// Emit a JSON report on stdout
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

/// Outcome of checking one source declaration.
#[derive(Debug, Serialize)]
pub struct SourceReport {
    pub name: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized: Option<NormalizedSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub provider: Option<String>,
    pub sources: Vec<SourceReport>,
}

impl CheckReport {
    pub fn is_valid(&self) -> bool {
        self.sources.iter().all(|s| s.valid)
    }
}

/// Parse arguments, run the command and return the process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref());

    match cli.command {
        Commands::Check { config, json } => run_check(&config, json),
    }
}

fn run_check(path: &Path, json: bool) -> Result<i32> {
    let config = AppConfig::load(path)?;
    let report = check_config(&config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(if report.is_valid() { 0 } else { 1 })
}

/// Resolve the sources provider of `config` (fetching file/HTTP providers
/// once) and normalize every declared source.
pub fn check_config(config: &AppConfig) -> Result<CheckReport> {
    let Some(provider) = config.sources_provider()? else {
        return Ok(CheckReport {
            provider: None,
            sources: Vec::new(),
        });
    };
    let describe = provider.describe();
    let configs = resolve_sources(provider)
        .with_context(|| format!("loading sources from {describe}"))?;

    let mut names: Vec<&String> = configs.keys().collect();
    names.sort();
    let sources = names
        .into_iter()
        .map(|name| match configs[name].normalize(name) {
            Ok(normalized) => SourceReport {
                name: name.clone(),
                valid: true,
                normalized: Some(normalized),
                error: None,
            },
            Err(e) => SourceReport {
                name: name.clone(),
                valid: false,
                normalized: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    Ok(CheckReport {
        provider: Some(describe),
        sources,
    })
}

fn resolve_sources(provider: SourcesProvider) -> Result<SourceConfigs> {
    let payload = match provider {
        SourcesProvider::Static(configs) => return Ok(configs),
        SourcesProvider::InlineJson(json) => json.into_bytes(),
        SourcesProvider::File(path) => ResourceLoader::File(path).fetch()?,
        SourcesProvider::Http(url) => ResourceLoader::Http(url).fetch()?,
    };
    Ok(parse_from_bytes(&payload)?)
}

fn print_report(report: &CheckReport) {
    let Some(provider) = &report.provider else {
        println!("no sources configured");
        return;
    };
    println!("sources: {provider}");
    for source in &report.sources {
        match (&source.normalized, &source.error) {
            (Some(n), _) => {
                let collections: Vec<&str> = n.collections.iter().map(|c| c.name.as_str()).collect();
                println!(
                    "  {}: ok (type {}, collections [{}], destinations [{}])",
                    source.name,
                    n.source_type,
                    collections.join(", "),
                    n.destinations.join(", ")
                );
            }
            (None, Some(error)) => println!("  {}: invalid: {error}", source.name),
            (None, None) => println!("  {}: invalid", source.name),
        }
    }
}
