use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use sqy_core::{Decoder, ElementType, Encoder, HeaderPrefix, Layout, Pipeline};
use sqy_stages::{api, REGISTRY};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "sqy",
    about = "Pipeline compression for 8- and 16-bit N-D arrays",
    version
)]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a raw array file into a sqy stream
    Compress {
        /// Raw samples in host byte order, C order (last dimension fastest)
        input: PathBuf,
        /// Destination sqy stream
        output: PathBuf,
        /// Pipeline name, e.g. "bitswap1->lz4" or "quantiser->h264(qp=6)"
        #[arg(short, long, default_value = "bitswap1->lz4")]
        pipeline: String,
        /// Element type: u8 | u16
        #[arg(short = 't', long, default_value = "u16")]
        dtype: ElementType,
        /// Shape like 7x9x11 (default: one dimension spanning the file)
        #[arg(short, long, value_parser = parse_shape)]
        shape: Option<Shape>,
        /// Worker threads inside stages (output does not depend on this)
        #[arg(short = 'j', long, default_value_t = 1)]
        threads: usize,
    },
    /// Decompress a sqy stream back to raw samples
    Decompress {
        /// Source sqy stream
        input: PathBuf,
        /// Destination raw file
        output: PathBuf,
        #[arg(short = 'j', long, default_value_t = 1)]
        threads: usize,
    },
    /// Print header metadata of a sqy stream
    Inspect {
        /// sqy stream to inspect
        file: PathBuf,
    },
    /// Check whether a pipeline name is valid and print its size bound
    Check {
        pipeline: String,
        /// Input length in bytes for the bound
        #[arg(short, long)]
        length: Option<usize>,
    },
    /// List the registered stages
    Stages,
    /// Print the engine version
    Version,
}

// ── Helpers ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct Shape(Vec<usize>);

fn parse_shape(text: &str) -> Result<Shape, String> {
    text.split(['x', 'X', ','])
        .map(|d| {
            d.trim()
                .parse::<usize>()
                .map_err(|_| format!("bad dimension '{d}' in shape '{text}'"))
        })
        .collect::<Result<Vec<usize>, String>>()
        .map(Shape)
}

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(log::LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
        }
    }
    builder.init();
}

// ── Subcommand implementations ─────────────────────────────────────────────

fn run_compress(
    input: PathBuf,
    output: PathBuf,
    pipeline: &str,
    dtype: ElementType,
    shape: Option<Shape>,
    threads: usize,
) -> anyhow::Result<()> {
    let raw = std::fs::read(&input).with_context(|| format!("reading input file {:?}", input))?;
    let shape = shape.map_or_else(|| vec![raw.len() / dtype.width()], |Shape(dims)| dims);
    let layout = Layout::new(dtype, &shape)?;
    let encoder = Encoder::from_name(pipeline, &REGISTRY)?.with_threads(threads);
    if encoder.is_lossy() {
        log::warn!("pipeline '{}' is lossy, decoded data may differ from the input", encoder.pipeline());
    }

    let t0 = Instant::now();
    let stream = encoder
        .encode_to_vec(&raw, &layout)
        .with_context(|| format!("compressing {layout} with '{pipeline}'"))?;
    let elapsed = t0.elapsed();

    std::fs::write(&output, &stream).with_context(|| format!("writing output file {:?}", output))?;

    eprintln!("  pipeline    : {}", encoder.pipeline());
    eprintln!("  layout      : {}", layout);
    eprintln!("  raw size    : {}", human_bytes(raw.len() as u64));
    eprintln!("  compressed  : {}", human_bytes(stream.len() as u64));
    eprintln!("  ratio       : {:.2}x", raw.len() as f64 / stream.len().max(1) as f64);
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((raw.len() as f64 / elapsed.as_secs_f64().max(1e-9)) as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_decompress(input: PathBuf, output: PathBuf, threads: usize) -> anyhow::Result<()> {
    let stream = std::fs::read(&input).with_context(|| format!("reading input file {:?}", input))?;

    let t0 = Instant::now();
    let raw = Decoder::new(&REGISTRY)
        .with_threads(threads)
        .decode_to_vec(&stream)
        .with_context(|| format!("decoding {:?}", input))?;
    let elapsed = t0.elapsed();

    std::fs::write(&output, &raw).with_context(|| format!("creating output file {:?}", output))?;

    eprintln!("  pipeline    : {}", api::encoded_pipeline(&stream)?);
    eprintln!("  raw size    : {}", human_bytes(raw.len() as u64));
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((raw.len() as f64 / elapsed.as_secs_f64().max(1e-9)) as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_inspect(file: PathBuf) -> anyhow::Result<()> {
    let stream = std::fs::read(&file).with_context(|| format!("reading {:?}", file))?;
    let prefix = HeaderPrefix::peek(&stream)?;
    let header = Decoder::header(&stream)?;
    let layout = header.layout()?;

    println!("=== sqy stream: {:?} ===", file);
    println!();
    println!("  format version : {}", prefix.version);
    println!("  pipeline       : {}", header.pipeline);
    println!("  layout         : {}", layout);
    println!("  header size    : {}", human_bytes(prefix.header_len as u64));
    println!("  raw size       : {}", human_bytes(header.raw_size));
    println!("  payload        : {}", human_bytes(header.payload_size));
    println!("  file on disk   : {}", human_bytes(stream.len() as u64));
    println!("  ratio          : {:.2}x", header.raw_size as f64 / stream.len().max(1) as f64);
    println!("  checksum       : {:016x}", header.checksum);

    let pipeline = Pipeline::parse(&header.pipeline, &REGISTRY)?;
    println!();
    println!("  {:>4}  {:<28}  {:>12}  {:>10}", "#", "stage", "input", "sidecar");
    println!("  {}", "-".repeat(60));
    for (i, (stage, record)) in pipeline.stages().iter().zip(&header.stages).enumerate() {
        println!(
            "  {:>4}  {:<28}  {:>12}  {:>10}",
            i,
            stage.to_string(),
            human_bytes(record.input_len),
            human_bytes(record.sidecar.len() as u64)
        );
    }
    Ok(())
}

fn run_check(pipeline: &str, length: Option<usize>) -> anyhow::Result<()> {
    if !api::pipeline_possible(pipeline) {
        // parse again for the reason
        let err = Pipeline::parse(pipeline, &REGISTRY).err();
        anyhow::bail!(
            "pipeline '{}' is not possible: {}",
            pipeline,
            err.map(|e| e.to_string()).unwrap_or_default()
        );
    }
    let encoder = Encoder::from_name(pipeline, &REGISTRY)?;
    println!("  canonical   : {}", encoder.pipeline());
    println!("  stages      : {}", encoder.pipeline().len());
    println!("  lossy       : {}", encoder.is_lossy());
    if let Some(length) = length {
        println!(
            "  bound       : {} ({} bytes for {} input bytes)",
            human_bytes(encoder.max_encoded_size(length) as u64),
            encoder.max_encoded_size(length),
            length
        );
    }
    Ok(())
}

fn run_stages() {
    println!("  {:<18}  {:<10}  {:<16}  {:<6}  summary", "stage", "variants", "args", "lossy");
    println!("  {}", "-".repeat(90));
    for entry in REGISTRY.entries() {
        let variants: Vec<String> = entry.variants.iter().map(u32::to_string).collect();
        println!(
            "  {:<18}  {:<10}  {:<16}  {:<6}  {}",
            entry.name,
            variants.join(","),
            entry.args.join(","),
            if entry.lossy { "yes" } else { "no" },
            entry.summary
        );
    }
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Compress {
            input,
            output,
            pipeline,
            dtype,
            shape,
            threads,
        } => run_compress(input, output, &pipeline, dtype, shape, threads),
        Commands::Decompress {
            input,
            output,
            threads,
        } => run_decompress(input, output, threads),
        Commands::Inspect { file } => run_inspect(file),
        Commands::Check { pipeline, length } => run_check(&pipeline, length),
        Commands::Stages => {
            run_stages();
            Ok(())
        }
        Commands::Version => {
            println!("sqy {}", api::version());
            Ok(())
        }
    }
}
