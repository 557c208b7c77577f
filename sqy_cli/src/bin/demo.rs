//! sqy pipeline demo
//!
//! Generates a synthetic fluorescence-microscopy stack (dim background,
//! bright drifting nuclei, sensor noise), then runs it through a set of
//! pipelines sequentially and with four threads. For each pipeline it
//! reports the ratio, the encode/decode time and the largest reconstruction
//! error, and checks that the thread count did not change a single byte.

use std::time::{Duration, Instant};

use anyhow::{ensure, Result};

use sqy_stages::api;

// ── constants ──────────────────────────────────────────────────────────────

const SHAPE: [usize; 3] = [64, 256, 256];

const BACKGROUND: u16 = 110;

const PIPELINES: &[&str] = &[
    "lz4",
    "bitswap1->lz4",
    "diff->bitswap1->lz4",
    "zstd",
    "remove_background(threshold=120)->bitswap1->lz4",
    "flatten_to_neighborhood(threshold=120)->bitswap1->lz4",
    "remove_estimated_background->bitswap1->lz4",
    "quantiser->lz4",
    "quantiser->h264",
    "quantiser->h264(qp=12)",
    "quantiser->hevc",
];

// ── data generator ─────────────────────────────────────────────────────────

/// Deterministic stack: the same call always produces the same samples.
fn generate_stack() -> Vec<u16> {
    let [depth, height, width] = SHAPE;
    let nuclei: Vec<(f64, f64, f64, f64)> = (0..24)
        .map(|i| {
            let i = i as f64;
            let x = (i * 97.0) % width as f64;
            let y = (i * 61.0 + 13.0) % height as f64;
            let radius = 6.0 + (i * 7.0) % 9.0;
            let peak = 800.0 + (i * 331.0) % 2400.0;
            (x, y, radius, peak)
        })
        .collect();

    let mut rng = 0x5EED_1234_u64;
    let mut out = Vec::with_capacity(depth * height * width);
    for z in 0..depth {
        let drift = z as f64 * 0.75;
        for y in 0..height {
            for x in 0..width {
                let mut v = BACKGROUND as f64;
                for &(cx, cy, r, peak) in &nuclei {
                    let dx = x as f64 - cx - drift;
                    let dy = y as f64 - cy;
                    let d2 = dx * dx + dy * dy;
                    if d2 < 9.0 * r * r {
                        v += peak * (-d2 / (2.0 * r * r)).exp();
                    }
                }
                rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let noise = ((rng >> 58) as f64) - 32.0;
                out.push((v + noise * 0.5).clamp(0.0, 65535.0) as u16);
            }
        }
    }
    out
}

// ── formatting ─────────────────────────────────────────────────────────────

fn fmt_duration(d: Duration) -> String {
    let ms = d.as_secs_f64() * 1000.0;
    if ms < 1.0 {
        format!("{:.1} µs", ms * 1000.0)
    } else if ms < 1000.0 {
        format!("{ms:.1} ms")
    } else {
        format!("{:.2} s", d.as_secs_f64())
    }
}

fn section(title: &str) {
    println!("━━━ {title} {}", "━".repeat(70usize.saturating_sub(title.len() + 5)));
}

// ── pipeline run ───────────────────────────────────────────────────────────

struct Outcome {
    compressed: usize,
    encode: Duration,
    decode: Duration,
    max_error: u16,
    stream: Vec<u8>,
}

fn run_pipeline(name: &str, stack: &[u16], threads: usize) -> Result<Outcome> {
    let bound = api::max_compressed_length_for_shape::<u16>(name, &SHAPE)?;
    let mut dst = vec![0u8; bound];

    let t0 = Instant::now();
    let compressed = api::encode(name, stack, &SHAPE, &mut dst, threads)?;
    let encode = t0.elapsed();
    dst.truncate(compressed);

    let mut back = vec![0u16; api::decompressed_length(&dst)? / 2];
    let t1 = Instant::now();
    api::decode(&dst, &mut back, threads)?;
    let decode = t1.elapsed();

    let max_error = stack
        .iter()
        .zip(&back)
        .map(|(a, b)| a.abs_diff(*b))
        .max()
        .unwrap_or(0);
    Ok(Outcome {
        compressed,
        encode,
        decode,
        max_error,
        stream: dst,
    })
}

fn run() -> Result<()> {
    // ── banner ─────────────────────────────────────────────────────────────
    println!();
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║         sqy · pipeline compression for microscopy stacks         ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    section("0 · DATA GENERATION");
    let t0 = Instant::now();
    let stack = generate_stack();
    let raw_len = stack.len() * 2;
    println!(
        "  {}x{}x{} u16 stack, {:.1} MB, generated in {}",
        SHAPE[0],
        SHAPE[1],
        SHAPE[2],
        raw_len as f64 / (1024.0 * 1024.0),
        fmt_duration(t0.elapsed())
    );
    println!("  engine version {}", api::version());
    println!();

    section("1 · PIPELINES");
    println!(
        "  {:<50} {:>8} {:>11} {:>11} {:>11} {:>6}",
        "pipeline", "ratio", "enc x1", "enc x4", "dec x4", "err"
    );
    println!("  {}", "-".repeat(102));
    for &name in PIPELINES {
        let single = run_pipeline(name, &stack, 1)?;
        let multi = run_pipeline(name, &stack, 4)?;
        ensure!(
            single.stream == multi.stream,
            "'{name}' produced different bytes with 1 and 4 threads"
        );
        println!(
            "  {:<50} {:>7.2}x {:>11} {:>11} {:>11} {:>6}",
            name,
            raw_len as f64 / single.compressed as f64,
            fmt_duration(single.encode),
            fmt_duration(multi.encode),
            fmt_duration(multi.decode),
            multi.max_error
        );
    }
    println!();
    println!("  err = largest absolute difference after decode (0 means exact)");
    println!();
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
