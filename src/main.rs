//! Thin CLI around the isomux library.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use isomux::{run, Codec, FragOptions, InputStream, MuxConfig, TrackConfig};

#[derive(Parser, Debug)]
#[command(
    name = "isomux",
    version,
    about = "Multiplex elementary streams into MP4"
)]
struct Args {
    /// Input streams as codec=path (codecs: avc, aac, ac3, ec3).
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Output file.
    #[arg(short, long)]
    output: PathBuf,

    /// Write fragmented output with default fragment options.
    #[arg(long)]
    fragment: bool,

    /// JSON job description overriding the default configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum fragment duration in milliseconds.
    #[arg(long)]
    frag_max_ms: Option<u32>,

    /// Minimum fragment duration in milliseconds.
    #[arg(long)]
    frag_min_ms: Option<u32>,
}

fn build_config(args: &Args) -> Result<MuxConfig, String> {
    let mut cfg: MuxConfig = match &args.config {
        Some(path) => {
            let file = File::open(path).map_err(|e| format!("open {}: {e}", path.display()))?;
            serde_json::from_reader(file).map_err(|e| format!("parse {}: {e}", path.display()))?
        }
        None => MuxConfig::default(),
    };

    if args.fragment && cfg.frag.is_none() {
        cfg.frag = Some(FragOptions::default());
    }
    if let Some(frag) = cfg.frag.as_mut() {
        if let Some(v) = args.frag_max_ms {
            frag.frag_max_ms = v;
        }
        if let Some(v) = args.frag_min_ms {
            frag.frag_min_ms = v;
        }
    }
    Ok(cfg)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = match build_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut inputs = Vec::new();
    for input in &args.inputs {
        let Some((codec_name, path)) = input.split_once('=') else {
            eprintln!("error: input must be codec=path, got {input}");
            return ExitCode::FAILURE;
        };
        let Some(codec) = Codec::parse(codec_name) else {
            eprintln!("error: unknown codec {codec_name}");
            return ExitCode::FAILURE;
        };
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("error: open {path}: {e}");
                return ExitCode::FAILURE;
            }
        };
        inputs.push(InputStream {
            codec,
            source: BufReader::new(file),
            track: TrackConfig::default(),
        });
    }

    let sink = match File::create(&args.output) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error: create {}: {e}", args.output.display());
            return ExitCode::FAILURE;
        }
    };

    match run(cfg, inputs, sink) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
