//! Cache inspection and maintenance

use super::{load_config, load_style, open_database};
use anyhow::Result;
use atelier_core::{AssetStatus, AssetType};
use atelier_gen::{AtelierConfig, StyleGuide};
use atelier_store::{AssetCache, AssetRecord};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum CacheCommands {
    /// List stored assets
    List {
        /// Filter by status (pending, processing, completed, failed, cached)
        #[arg(long)]
        status: Option<String>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Drop records whose image file has gone missing
    Verify,

    /// Register an existing image so matching requests hit the cache
    Import {
        /// Path to the image file
        path: String,

        /// Prompt the image answers
        #[arg(long)]
        prompt: String,

        /// Asset type (icon or cover)
        #[arg(long = "type", default_value = "icon")]
        asset_type: String,

        /// Style guide the prompt is resolved with
        #[arg(long)]
        style: Option<String>,
    },

    /// Check whether a prompt is already cached
    Lookup {
        prompt: String,

        /// Asset type (icon or cover)
        #[arg(long = "type", default_value = "icon")]
        asset_type: String,

        /// Style guide the prompt is resolved with
        #[arg(long)]
        style: Option<String>,
    },
}

pub fn run(cmd: CacheCommands) -> Result<()> {
    let config = load_config()?;
    match cmd {
        CacheCommands::List { status, json } => run_list(&config, status.as_deref(), json),
        CacheCommands::Verify => {
            let cache = open_cache(&config)?;
            let removed = cache.verify_all()?;
            println!("Cache verified: {} stale record(s) removed.", removed);
            Ok(())
        }
        CacheCommands::Import {
            path,
            prompt,
            asset_type,
            style,
        } => run_import(&config, &path, &prompt, &asset_type, style.as_deref()),
        CacheCommands::Lookup {
            prompt,
            asset_type,
            style,
        } => run_lookup(&config, &prompt, &asset_type, style.as_deref()),
    }
}

fn open_cache(config: &AtelierConfig) -> Result<AssetCache> {
    Ok(AssetCache::new(open_database(config)?, &config.storage.asset_dir))
}

fn resolved_prompt(style: Option<&StyleGuide>, prompt: &str) -> String {
    match style {
        Some(style) => style.enrich_prompt(prompt),
        None => prompt.to_string(),
    }
}

fn run_list(config: &AtelierConfig, status: Option<&str>, json: bool) -> Result<()> {
    let status: Option<AssetStatus> = status.map(str::parse::<AssetStatus>).transpose()?;
    let records = open_database(config)?.list_assets(status)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No assets stored.");
        return Ok(());
    }

    println!("{} asset(s):\n", records.len());
    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &AssetRecord) {
    println!(
        "  #{:<5} {:<6} {:<10} ${:<8.4} {}",
        record.id,
        record.asset_type,
        record.status,
        record.cost,
        record.file_path.as_deref().unwrap_or("-")
    );
    println!("         {}", record.prompt);
    if let Some(ref error) = record.error_message {
        println!("         error: {}", error);
    }
}

fn run_import(config: &AtelierConfig, path: &str, prompt: &str, asset_type: &str, style: Option<&str>) -> Result<()> {
    let asset_type: AssetType = asset_type.parse()?;
    let style = load_style(config, style)?;
    let prompt = resolved_prompt(style.as_ref(), prompt);

    let cache = open_cache(config)?;
    if let Some(existing) = cache.lookup(&prompt, asset_type)? {
        println!("Already cached as #{}.", existing.id);
        return Ok(());
    }

    let record = cache.register_existing(&prompt, asset_type, Path::new(path))?;
    println!("Imported {} as #{}", path, record.id);
    println!("  Hash: {}", record.prompt_hash);
    println!("  File: {}", record.file_path.as_deref().unwrap_or("-"));
    Ok(())
}

fn run_lookup(config: &AtelierConfig, prompt: &str, asset_type: &str, style: Option<&str>) -> Result<()> {
    let asset_type: AssetType = asset_type.parse()?;
    let style = load_style(config, style)?;
    let prompt = resolved_prompt(style.as_ref(), prompt);

    match open_cache(config)?.lookup(&prompt, asset_type)? {
        Some(record) => {
            println!("Cache hit:");
            print_record(&record);
        }
        None => println!("Not cached: {}", prompt),
    }
    Ok(())
}
