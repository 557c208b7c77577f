//! Encode/decode throughput of representative pipelines on a synthetic
//! 16-bit volume, sequential and with four threads.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sqy_stages::api;

const SHAPE: [usize; 3] = [32, 256, 256];

const PIPELINES: &[&str] = &[
    "lz4",
    "bitswap1->lz4",
    "diff->bitswap1->lz4",
    "zstd",
    "quantiser->lz4",
    "quantiser->h264",
    "quantiser->hevc",
];

fn volume() -> Vec<u16> {
    let [d, h, w] = SHAPE;
    let mut rng = 0x5EED_u64;
    let mut out = Vec::with_capacity(d * h * w);
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let noise = (rng >> 59) as usize;
                let cell = if (x / 16 + y / 16 + z / 8) % 7 == 0 { 900 } else { 0 };
                out.push((120 + x / 2 + y / 3 + cell + noise) as u16);
            }
        }
    }
    out
}

fn bench_encode(c: &mut Criterion) {
    let data = volume();
    let mut group = c.benchmark_group("encode");
    group.measurement_time(Duration::from_secs(5));
    group.sample_size(10);
    group.throughput(Throughput::Bytes((data.len() * 2) as u64));
    for &name in PIPELINES {
        for threads in [1, 4] {
            group.bench_with_input(BenchmarkId::new(name, threads), &threads, |b, &threads| {
                b.iter(|| api::encode_to_vec(name, &data, &SHAPE, threads).unwrap())
            });
        }
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let data = volume();
    let mut group = c.benchmark_group("decode");
    group.measurement_time(Duration::from_secs(5));
    group.sample_size(10);
    group.throughput(Throughput::Bytes((data.len() * 2) as u64));
    for &name in PIPELINES {
        let stream = api::encode_to_vec(name, &data, &SHAPE, 4).unwrap();
        for threads in [1, 4] {
            group.bench_with_input(BenchmarkId::new(name, threads), &threads, |b, &threads| {
                b.iter(|| api::decode_to_vec::<u16>(&stream, threads).unwrap())
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
