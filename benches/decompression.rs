use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use oozlib::Decompressor;
use std::hint::black_box;
use std::time::Duration;

/// Build an uncompressed-block stream describing `size` output bytes.
fn uncompressed_stream(size: usize, pattern: &str) -> Vec<u8> {
    let data: Vec<u8> = match pattern {
        "text" => {
            let base = b"Lorem ipsum dolor sit amet, consectetur adipiscing elit. ";
            (0..size).map(|i| base[i % base.len()]).collect()
        }
        "binary" => (0..size).map(|i| ((i * 17 + 11) % 256) as u8).collect(),
        _ => panic!("unknown pattern: {}", pattern),
    };

    let mut src = Vec::new();
    for chunk in data.chunks(0x40000) {
        src.extend_from_slice(&[0x4C, 0x06]);
        src.extend_from_slice(chunk);
    }
    src
}

/// Build a stream of memset quanta describing `size` output bytes.
fn memset_stream(size: usize) -> Vec<u8> {
    let mut src = Vec::new();
    let mut produced = 0usize;
    while produced < size {
        if produced % 0x40000 == 0 {
            src.extend_from_slice(&[0x0C, 0x06]);
        }
        src.extend_from_slice(&[0x07, 0xFF, 0xFF, (produced >> 18) as u8]);
        produced += 0x40000.min(size - produced);
    }
    src
}

fn decompression_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("decompression_throughput");
    group.measurement_time(Duration::from_secs(5));

    for size in [0x10000usize, 0x100000] {
        for pattern in ["text", "binary"] {
            let src = uncompressed_stream(size, pattern);
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("uncompressed_{pattern}"), size),
                &src,
                |b, src| {
                    let mut dec = Decompressor::new();
                    let mut out = vec![0u8; size];
                    b.iter(|| {
                        dec.decompress_into(black_box(src), &mut out).unwrap();
                        black_box(&out);
                    });
                },
            );
        }

        let src = memset_stream(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("memset_quanta", size), &src, |b, src| {
            let mut dec = Decompressor::new();
            let mut out = vec![0u8; size];
            b.iter(|| {
                dec.decompress_into(black_box(src), &mut out).unwrap();
                black_box(&out);
            });
        });
    }

    group.finish();
}

fn decoder_reuse(c: &mut Criterion) {
    // scratch-arena reuse vs a fresh decoder per call
    let src = memset_stream(0x40000);
    let mut group = c.benchmark_group("decoder_reuse");
    group.throughput(Throughput::Bytes(0x40000));

    group.bench_function("reused", |b| {
        let mut dec = Decompressor::new();
        let mut out = vec![0u8; 0x40000];
        b.iter(|| dec.decompress_into(black_box(&src), &mut out).unwrap());
    });
    group.bench_function("fresh", |b| {
        let mut out = vec![0u8; 0x40000];
        b.iter(|| {
            let mut dec = Decompressor::new();
            dec.decompress_into(black_box(&src), &mut out).unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, decompression_throughput, decoder_reuse);
criterion_main!(benches);
