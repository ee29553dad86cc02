use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sprite_contracts::catalog::{Catalog, PromptTemplate, DEFAULT_FINAL_SIZE};
use sprite_engine::convert::ConverterKind;
use sprite_engine::providers::{build_provider, process_env, ProviderKind, ProviderOptions};
use sprite_engine::{
    BatchProgress, EngineConfig, ErrorPolicy, SpriteEngine, DEFAULT_ASPECT_RATIO,
    DEFAULT_IMAGE_SIZE, DEFAULT_MODEL,
};

#[derive(Debug, Parser)]
#[command(name = "sprite-gen", version, about = "Batch sprite icon generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate every catalog item into the output directory.
    Generate(GenerateArgs),
    /// Print catalog ids and labels.
    List(CatalogArgs),
    /// Print the full prompt sent for one item.
    Prompt(PromptArgs),
}

#[derive(Debug, Clone, Args)]
struct CatalogArgs {
    /// JSON catalog file; the built-in clothing set when omitted.
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Text file replacing the built-in style prompt.
    #[arg(long)]
    base_prompt: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_FINAL_SIZE)]
    final_size: u32,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[command(flatten)]
    catalog: CatalogArgs,
    #[arg(long, default_value = "outputs")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(long, value_enum, default_value_t = ProviderArg::Gemini)]
    provider: ProviderArg,
    #[arg(long, value_enum, default_value_t = ConverterArg::Sips)]
    converter: ConverterArg,
    #[arg(long, default_value = DEFAULT_IMAGE_SIZE)]
    image_size: String,
    #[arg(long, default_value = DEFAULT_ASPECT_RATIO)]
    aspect_ratio: String,
    /// Record failed items and keep going instead of stopping the batch.
    #[arg(long)]
    continue_on_error: bool,
    /// Seconds; no timeout unless set.
    #[arg(long)]
    request_timeout: Option<f64>,
    #[arg(long)]
    api_base: Option<String>,
}

#[derive(Debug, Parser)]
struct PromptArgs {
    #[command(flatten)]
    catalog: CatalogArgs,
    id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderArg {
    Gemini,
    Dryrun,
}

impl From<ProviderArg> for ProviderKind {
    fn from(value: ProviderArg) -> Self {
        match value {
            ProviderArg::Gemini => ProviderKind::Gemini,
            ProviderArg::Dryrun => ProviderKind::Dryrun,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConverterArg {
    Sips,
    Magick,
    Builtin,
}

impl From<ConverterArg> for ConverterKind {
    fn from(value: ConverterArg) -> Self {
        match value {
            ConverterArg::Sips => ConverterKind::Sips,
            ConverterArg::Magick => ConverterKind::Magick,
            ConverterArg::Builtin => ConverterKind::Builtin,
        }
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sprite-gen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => {
            run_generate(args, process_env, &mut io::stdout().lock(), &mut io::stderr().lock())
        }
        Command::List(args) => run_list(&args),
        Command::Prompt(args) => run_prompt(&args),
    }
}

fn run_generate(
    args: GenerateArgs,
    lookup_env: impl Fn(&str) -> Option<String>,
    out: &mut impl Write,
    err: &mut impl Write,
) -> Result<i32> {
    let catalog = load_catalog(&args.catalog)?;
    let template = load_template(&args.catalog)?;
    let output_dir = absolute_path(&args.out)?;
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create output dir {}", output_dir.display()))?;

    let request_timeout = parse_request_timeout(args.request_timeout)?;
    let options = ProviderOptions {
        api_base: args.api_base.clone(),
        request_timeout,
        dryrun_size: Some(args.catalog.final_size),
    };
    let provider = build_provider(args.provider.into(), &options, lookup_env)?;
    let converter = ConverterKind::from(args.converter).build();

    let config = EngineConfig {
        output_dir: output_dir.clone(),
        events_path: args.events.clone(),
        model: args.model.clone(),
        image_size: args.image_size.clone(),
        aspect_ratio: args.aspect_ratio.clone(),
        final_size: args.catalog.final_size,
        error_policy: if args.continue_on_error {
            ErrorPolicy::Continue
        } else {
            ErrorPolicy::Abort
        },
    };
    let mut engine = SpriteEngine::new(config, template, provider, converter)?;

    writeln!(out, "Model: {}", args.model)?;
    writeln!(out, "Output dir: {}", output_dir.display())?;

    let summary = engine.run(&catalog, |progress| {
        // Console write failures must not stop the batch.
        let _ = write_progress(progress, out, err);
    })?;

    writeln!(out, "\nDone. Generated {} images.", summary.saved())?;
    if summary.failed() > 0 {
        writeln!(
            err,
            "{} of {} items failed; details in {}",
            summary.failed(),
            summary.total_items,
            engine.summary_path().display()
        )?;
        return Ok(1);
    }
    Ok(0)
}

/// Seconds from `--request-timeout`; rejects values a `Duration` cannot hold.
fn parse_request_timeout(seconds: Option<f64>) -> Result<Option<Duration>> {
    let Some(seconds) = seconds else {
        return Ok(None);
    };
    if seconds.is_nan() || seconds <= 0.0 {
        bail!("--request-timeout must be positive (got {seconds})");
    }
    match Duration::try_from_secs_f64(seconds) {
        Ok(timeout) => Ok(Some(timeout)),
        Err(_) => bail!("--request-timeout {seconds} is out of range"),
    }
}

fn write_progress(
    progress: BatchProgress<'_>,
    out: &mut impl Write,
    err: &mut impl Write,
) -> io::Result<()> {
    match progress {
        BatchProgress::Started { item, .. } => {
            writeln!(out, "\nGenerating {}...", item.id)
        }
        BatchProgress::Saved { path, .. } => writeln!(out, "Saved: {}", path.display()),
        BatchProgress::Degraded {
            path,
            converter,
            reason,
            ..
        } => {
            writeln!(
                err,
                "warning: {converter} failed; keeping original output without resize/convert. ({reason})"
            )?;
            writeln!(out, "Saved: {}", path.display())
        }
        BatchProgress::Failed { item, error } => {
            writeln!(err, "Failed: {}: {error:#}", item.id)
        }
    }
}

fn run_list(args: &CatalogArgs) -> Result<i32> {
    let catalog = load_catalog(args)?;
    for item in catalog.iter() {
        println!("{}\t{}", item.id, item.label);
    }
    Ok(0)
}

fn run_prompt(args: &PromptArgs) -> Result<i32> {
    let catalog = load_catalog(&args.catalog)?;
    let template = load_template(&args.catalog)?;
    let Some(item) = catalog.get(&args.id) else {
        bail!(
            "unknown catalog item '{}' (available: {})",
            args.id,
            catalog.ids().join(", ")
        );
    };
    println!("{}", template.build(&item.label));
    Ok(0)
}

fn load_catalog(args: &CatalogArgs) -> Result<Catalog> {
    match args.catalog.as_deref() {
        Some(path) => Catalog::load(path),
        None => Catalog::builtin(),
    }
}

fn load_template(args: &CatalogArgs) -> Result<PromptTemplate> {
    if args.final_size == 0 {
        bail!("--final-size must be greater than zero");
    }
    match args.base_prompt.as_deref() {
        Some(path) => PromptTemplate::from_file(path, args.final_size),
        None => Ok(PromptTemplate::new(
            sprite_contracts::catalog::DEFAULT_BASE_PROMPT,
            args.final_size,
        )),
    }
}

fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(env::current_dir()
        .context("failed to resolve current directory")?
        .join(path))
}
