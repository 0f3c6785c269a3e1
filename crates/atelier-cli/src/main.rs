use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use atelier_contracts::history::ImageData;
use atelier_contracts::models::Provider;
use atelier_contracts::modes::WorkMode;
use atelier_contracts::store::KeyStore;
use atelier_engine::{prompt, EditSession};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Atelier photo-edit generation engine CLI")]
struct Cli {
    /// Path of the durable key store.
    #[arg(long, global = true, default_value = "atelier-keys.json")]
    store: PathBuf,
    /// Path of the append-only session event log.
    #[arg(long, global = true, default_value = "events.jsonl")]
    events: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage the per-provider API key pool.
    Keys(KeysArgs),
    /// List the cataloged models and their capabilities.
    Models,
    /// Render the instruction text a generation would send, without sending it.
    Prompt(PromptArgs),
    /// Run one generation attempt against the selected provider.
    Generate(GenerateArgs),
}

#[derive(Debug, Parser)]
struct KeysArgs {
    #[command(subcommand)]
    action: KeysAction,
}

#[derive(Debug, Subcommand)]
enum KeysAction {
    /// Validate and add one or more keys for a provider.
    Add {
        provider: String,
        keys: Vec<String>,
    },
    /// Show pooled keys (redacted) and the active pointer.
    List,
    /// Point the active key at an already-pooled key.
    Use {
        provider: String,
        key: String,
    },
    /// Remove a pooled key.
    Remove {
        provider: String,
        key: String,
    },
}

#[derive(Debug, Parser)]
struct PromptArgs {
    /// Work mode: portrait, restore, creative or composite.
    #[arg(long, default_value = "portrait")]
    mode: String,
    /// JSON object of settings fields to overlay on the mode defaults.
    #[arg(long)]
    settings: Option<String>,
    /// Free-form request text, used where the active workflow accepts one.
    #[arg(long, default_value = "")]
    hint: String,
    /// Render as if a painted mask were attached.
    #[arg(long)]
    masked: bool,
    /// Render as if a reference image were attached.
    #[arg(long)]
    reference: bool,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Base image to edit.
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = "portrait")]
    mode: String,
    /// JSON object of settings fields to overlay on the mode defaults.
    #[arg(long)]
    settings: Option<String>,
    #[arg(long, default_value = "")]
    hint: String,
    /// Background plate, composite mode only.
    #[arg(long)]
    background: Option<PathBuf>,
    /// Reference image, creative mode only.
    #[arg(long)]
    reference: Option<PathBuf>,
    /// Mask strokes as JSON: {"width", "height", "segments":
    /// [{"from": [x, y], "to": [x, y], "brush": px}]}. Creative mode only.
    #[arg(long)]
    strokes: Option<String>,
    /// Where the committed result is written.
    #[arg(long)]
    out: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let store = KeyStore::new(&cli.store);
    match cli.command {
        Command::Keys(args) => run_keys(store, &cli.events, args),
        Command::Models => run_models(store, &cli.events),
        Command::Prompt(args) => run_prompt(store, &cli.events, args),
        Command::Generate(args) => run_generate(store, &cli.events, args),
    }
}

fn run_keys(store: KeyStore, events: &Path, args: KeysArgs) -> Result<i32> {
    let mut session = EditSession::new(store, events)?;
    match args.action {
        KeysAction::Add { provider, keys } => {
            let provider = parse_provider(&provider)?;
            if keys.is_empty() {
                bail!("no keys given");
            }
            let report = session.add_keys(provider, keys)?;
            for key in &report.added {
                println!("added   {provider} {}", redact(key));
            }
            for key in &report.failed {
                println!("invalid {provider} {}", redact(key));
            }
            Ok(if report.added.is_empty() { 1 } else { 0 })
        }
        KeysAction::List => {
            let pool = session.pool();
            for provider in Provider::all() {
                for key in pool.keys_for(provider) {
                    let marker = pool
                        .active()
                        .filter(|active| active.provider == provider && active.key == *key)
                        .map(|_| "*")
                        .unwrap_or(" ");
                    println!("{marker} {provider} {}", redact(key));
                }
            }
            Ok(0)
        }
        KeysAction::Use { provider, key } => {
            let provider = parse_provider(&provider)?;
            session.set_active_key(provider, &key)?;
            println!("active key is now {provider} {}", redact(&key));
            Ok(0)
        }
        KeysAction::Remove { provider, key } => {
            let provider = parse_provider(&provider)?;
            if session.remove_key(provider, &key)? {
                println!("removed {provider} {}", redact(&key));
                Ok(0)
            } else {
                println!("no such key for {provider}");
                Ok(1)
            }
        }
    }
}

fn run_models(store: KeyStore, events: &Path) -> Result<i32> {
    let session = EditSession::new(store, events)?;
    for model in session.catalog().list() {
        println!(
            "{:<24} {:<8} [{}]",
            model.name,
            model.provider,
            model.capabilities.join(", ")
        );
    }
    Ok(0)
}

fn run_prompt(store: KeyStore, events: &Path, args: PromptArgs) -> Result<i32> {
    let mut session = EditSession::new(store, events)?;
    let mode = parse_mode(&args.mode)?;
    session.set_mode(mode);
    let patch = parse_settings_patch(args.settings.as_deref())?;
    let settings = session.update_settings(&patch)?;

    let mask = args
        .masked
        .then(|| {
            session
                .begin_masking(1024, 1024)
                .context("mask convention resolution failed")
        })
        .transpose()?;
    let instruction = prompt::compile(
        settings.engine().provider,
        &settings,
        &args.hint,
        mask,
        args.reference && mode == WorkMode::Creative,
    );
    println!("{instruction}");
    Ok(0)
}

fn run_generate(store: KeyStore, events: &Path, args: GenerateArgs) -> Result<i32> {
    let mut session = EditSession::new(store, events)?;
    let mode = parse_mode(&args.mode)?;
    session.set_mode(mode);
    let patch = parse_settings_patch(args.settings.as_deref())?;
    session.update_settings(&patch)?;

    session.load_image(read_image(&args.image)?)?;
    if let Some(path) = &args.background {
        if mode != WorkMode::Composite {
            bail!("--background only applies to composite mode");
        }
        session.set_background_image(Some(read_image(path)?));
    }
    if let Some(path) = &args.reference {
        if mode != WorkMode::Creative {
            bail!("--reference only applies to creative mode");
        }
        session.set_reference_image(Some(read_image(path)?));
    }
    if let Some(raw) = args.strokes.as_deref() {
        if mode != WorkMode::Creative {
            bail!("--strokes only applies to creative mode");
        }
        let plan = parse_stroke_plan(raw)?;
        session.begin_masking(plan.width, plan.height)?;
        for segment in &plan.segments {
            session.add_mask_stroke(segment.from, segment.to, segment.brush);
        }
    }

    session.generate(&args.hint, None)?;
    session.commit_result()?;
    let result = session
        .lineage()
        .current()
        .context("no committed result")?
        .clone();
    if let Some(parent) = args.out.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&args.out, &result.bytes)
        .with_context(|| format!("failed writing {}", args.out.display()))?;

    let settings = session.active_settings();
    let receipt = json!({
        "session_id": session.session_id(),
        "mode": mode.as_str(),
        "provider": settings.engine().provider.as_str(),
        "model": settings.engine().model,
        "mime": result.mime,
        "bytes": result.bytes.len(),
        "out": args.out.display().to_string(),
    });
    let receipt_path = args.out.with_extension("receipt.json");
    fs::write(&receipt_path, serde_json::to_string_pretty(&receipt)?)
        .with_context(|| format!("failed writing {}", receipt_path.display()))?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(0)
}

struct StrokePlan {
    width: u32,
    height: u32,
    segments: Vec<StrokeInput>,
}

struct StrokeInput {
    from: (f32, f32),
    to: (f32, f32),
    brush: f32,
}

fn parse_stroke_plan(raw: &str) -> Result<StrokePlan> {
    let value: Value = serde_json::from_str(raw).context("--strokes is not valid JSON")?;
    let width = value["width"]
        .as_u64()
        .context("--strokes needs a numeric 'width'")? as u32;
    let height = value["height"]
        .as_u64()
        .context("--strokes needs a numeric 'height'")? as u32;
    let segments = value["segments"]
        .as_array()
        .context("--strokes needs a 'segments' array")?
        .iter()
        .map(|segment| {
            Ok(StrokeInput {
                from: parse_point(&segment["from"])?,
                to: parse_point(&segment["to"])?,
                brush: segment["brush"].as_f64().unwrap_or(16.0) as f32,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(StrokePlan {
        width,
        height,
        segments,
    })
}

fn parse_point(value: &Value) -> Result<(f32, f32)> {
    let coords = value
        .as_array()
        .filter(|coords| coords.len() == 2)
        .context("stroke points must be [x, y] pairs")?;
    let x = coords[0].as_f64().context("stroke coordinates must be numbers")?;
    let y = coords[1].as_f64().context("stroke coordinates must be numbers")?;
    Ok((x as f32, y as f32))
}

fn parse_provider(raw: &str) -> Result<Provider> {
    raw.parse::<Provider>().map_err(|err| anyhow!(err))
}

fn parse_mode(raw: &str) -> Result<WorkMode> {
    raw.parse::<WorkMode>().map_err(|err| anyhow!(err))
}

fn parse_settings_patch(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    let value: Value = serde_json::from_str(raw).context("--settings is not valid JSON")?;
    value
        .as_object()
        .cloned()
        .context("--settings must be a JSON object")
}

// The mime type is sniffed from the bytes; file extensions are not trusted.
fn read_image(path: &Path) -> Result<ImageData> {
    let bytes =
        fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mime = image::guess_format(&bytes)
        .map(|format| format.to_mime_type())
        .with_context(|| format!("{} is not a recognized image format", path.display()))?;
    Ok(ImageData::new(bytes, mime))
}

fn redact(key: &str) -> String {
    if key.len() <= 8 {
        return "*".repeat(key.len());
    }
    format!("{}…{}", &key[..4], &key[key.len() - 4..])
}
