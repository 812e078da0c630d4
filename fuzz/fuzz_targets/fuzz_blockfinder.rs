#![no_main]

use libfuzzer_sys::fuzz_target;
use parallel_gzip::blockfinder::{BlockFinder, FinderChoice};
use parallel_gzip::{FileKind, MemorySource, SharedSource};
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() || data.len() > 10_000_000 {
        return;
    }

    for choice in [FinderChoice::Generic, FinderChoice::Pigz, FinderChoice::Bgzf] {
        let source: SharedSource = Arc::new(MemorySource::new(data.to_vec()));
        let mut finder = match BlockFinder::new(source, FileKind::Gzip, choice) {
            Ok(finder) => finder,
            Err(_) => continue,
        };

        let mut previous = None;
        let mut count = 0usize;
        while let Ok(Some(offset)) = finder.next() {
            // Candidates must be strictly increasing and within the data.
            if let Some(previous) = previous {
                assert!(offset > previous, "offsets not increasing");
            }
            assert!(offset <= data.len() as u64 * 8);
            previous = Some(offset);

            count += 1;
            if count > 10_000 {
                break;
            }
        }
    }
});
