use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use parallel_gzip::{MemorySource, ParallelGzipReader, ReaderOptions, SharedSource};
use rand::prelude::*;
use std::io::{Read, Write};
use std::sync::Arc;

fn base64_data(length: usize) -> Vec<u8> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut rng = StdRng::seed_from_u64(42);
    (0..length)
        .map(|_| ALPHABET[rng.gen_range(0..64)])
        .collect()
}

fn bench_decode(c: &mut Criterion) {
    let data = base64_data(64 * 1024 * 1024);
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&data).unwrap();
    let compressed = Arc::new(encoder.finish().unwrap());

    let mut group = c.benchmark_group("gzip_decode");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.sample_size(10);

    for threads in [1usize, 4, 0 /* all cores */] {
        let label = if threads == 0 {
            "parallel_gzip_all_cores".to_string()
        } else {
            format!("parallel_gzip_{threads}_threads")
        };
        group.bench_function(&label, |b| {
            b.iter(|| {
                let source: SharedSource =
                    Arc::new(MemorySource::new(compressed.as_ref().clone()));
                let mut reader = ParallelGzipReader::new(
                    source,
                    ReaderOptions {
                        parallelization: threads,
                        ..ReaderOptions::default()
                    },
                )
                .unwrap();
                let mut buffer = [0u8; 128 * 1024];
                while reader.read(&mut buffer).unwrap() > 0 {}
            })
        });
    }

    group.bench_function("flate2_reference", |b| {
        b.iter(|| {
            let mut decoder = flate2::read::MultiGzDecoder::new(compressed.as_slice());
            let mut buffer = [0u8; 128 * 1024];
            while decoder.read(&mut buffer).unwrap() > 0 {}
        })
    });

    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
