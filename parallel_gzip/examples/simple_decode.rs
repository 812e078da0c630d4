//! Minimal example: decompress a gzip file to stdout.
//!
//! Usage: `cargo run --release --example simple_decode -- file.gz`

use parallel_gzip::{ParallelGzipReader, ReaderOptions};
use std::io::{Read, Write};

fn main() {
    let path = std::env::args()
        .nth(1)
        .expect("usage: simple_decode <file.gz>");

    let mut reader = ParallelGzipReader::open(&path, ReaderOptions::default())
        .expect("failed to open input");

    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let n = reader.read(&mut buffer).expect("decoding failed");
        if n == 0 {
            break;
        }
        stdout.write_all(&buffer[..n]).expect("write failed");
    }
}
