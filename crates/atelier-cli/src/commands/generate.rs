//! Single-asset generation

use super::{build_engine, finish_report, load_config, load_style};
use anyhow::Result;
use atelier_core::{AssetType, Priority};
use atelier_gen::provider::file_stem;
use atelier_gen::AssetRequest;

pub struct GenerateArgs {
    pub prompt: String,
    pub asset_type: String,
    pub name: Option<String>,
    pub priority: String,
    pub model: Option<String>,
    pub style: Option<String>,
    pub no_wait: bool,
}

pub fn run(args: GenerateArgs) -> Result<()> {
    let asset_type: AssetType = args.asset_type.parse()?;
    let priority: Priority = args.priority.parse()?;

    let config = load_config()?;
    let style = load_style(&config, args.style.as_deref())?;
    let engine = build_engine(config, style, args.no_wait)?;

    let id = match (args.name, args.model) {
        (None, None) => engine.enqueue_asset_request(&args.prompt, asset_type, priority),
        (name, model) => {
            let name = name.unwrap_or_else(|| file_stem(&args.prompt).chars().take(48).collect());
            let mut request = AssetRequest::new(&name, &args.prompt, asset_type).with_priority(priority);
            request.model = model;
            engine.enqueue(request)
        }
    };

    println!("Generating {} ({})", asset_type, id);
    println!("  Prompt: {}", engine.resolve_prompt(&args.prompt));

    let report = engine.run_queued()?;
    for entry in &report.entries {
        if let Some(ref path) = entry.file_path {
            println!("  File: {}", path);
        }
    }
    finish_report(&report, None)
}
