use anyhow::{Context, Result};
use ckpt_export::format::{human_bytes, human_number, shape};
use ckpt_export::progress::Progress;
use ckpt_export::{
    inspect, CandleLibrary, CheckpointSummary, ConversionReport, Converter, EnvConfig, ExportFormat,
    ModelLibrary,
};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ckpt-export")]
#[command(version)]
#[command(about = "Convert a model checkpoint into a deployment format", long_about = None)]
struct Cli {
    /// Checkpoint file (.safetensors, .pt/.pth/.ckpt, .npz, .gguf)
    #[arg(short, long, required_unless_present = "list_formats")]
    checkpoint: Option<PathBuf>,

    /// Export target, e.g. safetensors, gguf, npz
    #[arg(short, long, required_unless_present_any = ["list_formats", "inspect"])]
    format: Option<String>,

    /// Store floating point tensors as f16
    #[arg(long)]
    half: bool,

    /// Key of the sub-dictionary holding the weights in a PyTorch checkpoint
    #[arg(long)]
    pickle_key: Option<String>,

    /// Model name recorded in the artifact metadata
    #[arg(long)]
    name: Option<String>,

    /// List the checkpoint's tensors instead of exporting
    #[arg(long)]
    inspect: bool,

    /// Print machine readable output
    #[arg(long)]
    json: bool,

    /// Show the export formats and exit
    #[arg(long)]
    list_formats: bool,

    #[arg(short, long)]
    quiet: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(if cli.verbose { "info" } else { "warn" }),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli) {
        match e.downcast_ref::<ckpt_export::Error>() {
            Some(err) => {
                eprintln!("error[{}]: {}", err.kind(), err);
                process::exit(err.kind().exit_code());
            }
            None => {
                eprintln!("Error: {:#}", e);
                process::exit(1);
            }
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let library = CandleLibrary::new();

    if cli.list_formats {
        return list_formats(&library, cli.json);
    }

    let checkpoint = cli.checkpoint.as_deref().context("--checkpoint is required")?;
    let options = EnvConfig::from_env().options(cli.half, cli.pickle_key.clone(), cli.name.clone());
    let progress = Progress::new(!cli.quiet && !cli.json);

    if cli.inspect {
        progress.start(format!("Reading {}", checkpoint.display()));
        let summary = inspect(checkpoint, options.pickle_key.as_deref());
        progress.stop_and_clear();
        return print_summary(&summary?, cli.json);
    }

    let format = cli.format.as_deref().context("--format is required")?;
    let converter = Converter::new(library).with_options(options);

    progress.start(format!("Converting {} to {}", checkpoint.display(), format));
    let report = converter.convert(checkpoint, format);
    progress.stop_and_clear();

    print_report(&report?, cli.json)
}

fn list_formats<L: ModelLibrary>(library: &L, as_json: bool) -> Result<()> {
    let supported = library.supported_formats();
    if as_json {
        let formats: Vec<_> = ExportFormat::all()
            .iter()
            .map(|f| {
                json!({
                    "name": f.name(),
                    "extension": f.extension(),
                    "supported": supported.contains(f),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&formats)?);
        return Ok(());
    }

    println!("{:<14} {:<14} {}", "FORMAT", "EXTENSION", "SUPPORTED");
    for f in ExportFormat::all() {
        let mark = if supported.contains(f) { "yes" } else { "no" };
        println!("{:<14} {:<14} {}", f.name(), format!(".{}", f.extension()), mark);
    }
    Ok(())
}

fn print_report(report: &ConversionReport, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("{}", report.output_path.display());
    eprintln!(
        "Exported {} tensors ({} parameters) as {}: {} -> {}",
        report.tensor_count,
        human_number(report.parameter_count),
        report.format,
        human_bytes(report.source_size_bytes),
        human_bytes(report.output_size_bytes),
    );
    Ok(())
}

fn print_summary(summary: &CheckpointSummary, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("Checkpoint: {}", summary.path.display());
    println!("Kind:       {}", summary.kind);
    println!("Size:       {}", human_bytes(summary.size_bytes));
    println!(
        "Tensors:    {} ({} parameters)",
        summary.tensor_count,
        human_number(summary.parameter_count)
    );
    println!();
    println!("{:<48} {:<6} {}", "NAME", "DTYPE", "SHAPE");
    for t in &summary.tensors {
        println!("{:<48} {:<6} {}", t.name, t.dtype, shape(&t.shape));
    }
    Ok(())
}
