#![no_main]

use libfuzzer_sys::fuzz_target;
use parallel_gzip::{MemorySource, ParallelGzipReader, ReaderOptions, SharedSource};
use std::io::Read;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() || data.len() > 10_000_000 {
        return;
    }

    let source: SharedSource = Arc::new(MemorySource::new(data.to_vec()));
    let mut reader = match ParallelGzipReader::new(
        source,
        ReaderOptions {
            parallelization: 2,
            chunk_size: 64 * 1024,
            ..ReaderOptions::default()
        },
    ) {
        Ok(reader) => reader,
        Err(_) => return, // Not gzip-shaped; that's fine.
    };

    // Must either produce output or error, never panic or loop forever.
    const MAX_OUTPUT: usize = 100_000_000;
    let mut total = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                if total > MAX_OUTPUT {
                    break;
                }
            }
            Err(_) => break, // Expected for corrupt input.
        }
    }
});
