#![no_main]

use libfuzzer_sys::fuzz_target;
use parallel_gzip::chunk::{decode_chunk, ChunkConfig};
use parallel_gzip::{FileKind, MemorySource, SharedSource};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() || data.len() > 1_000_000 {
        return;
    }

    let source: SharedSource = Arc::new(MemorySource::new(data.to_vec()));
    let config = ChunkConfig {
        target_decoded_size: 4 * 1024 * 1024,
        file_kind: FileKind::RawDeflate,
    };
    let cancel = AtomicBool::new(false);

    // Speculative decode from a handful of bit offsets; errors are the
    // normal case, panics are bugs.
    for offset in 0..16u64.min(data.len() as u64 * 8) {
        let _ = decode_chunk(&source, offset, None, None, None, &config, &cancel);
    }
});
