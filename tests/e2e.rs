use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;

const BIN_PATH: &str = "target/release/pgzcat";

fn compile_binary() {
    let status = Command::new("cargo")
        .arg("build")
        .arg("--release")
        .status()
        .expect("Failed to run cargo build");
    assert!(status.success(), "Cargo build failed");
}

fn generate_text(size: usize, seed: u64) -> Vec<u8> {
    // Simple deterministic pseudo-text, compressible but not trivial.
    let mut state = seed;
    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        data.extend_from_slice(format!("record {:016x} payload\n", state).as_bytes());
    }
    data.truncate(size);
    data
}

fn gzip_to_file(data: &[u8], path: &str) {
    let file = fs::File::create(path).unwrap();
    let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap();
}

#[test]
fn test_e2e_decompress_to_file() {
    compile_binary();
    let gz_file = "test_e2e_basic.txt.gz";
    let out_file = "test_e2e_basic.txt";

    let data = generate_text(3 * 1024 * 1024, 1);
    gzip_to_file(&data, gz_file);

    let status = Command::new(Path::new(BIN_PATH))
        .arg(gz_file)
        .arg("--output")
        .arg(out_file)
        .status()
        .expect("Failed to run pgzcat");
    assert!(status.success(), "pgzcat failed");

    let decompressed = fs::read(out_file).unwrap();
    assert_eq!(decompressed, data);

    let _ = fs::remove_file(gz_file);
    let _ = fs::remove_file(out_file);
}

#[test]
fn test_e2e_stdout_and_threads() {
    compile_binary();
    let gz_file = "test_e2e_stdout.txt.gz";

    let data = generate_text(2 * 1024 * 1024, 2);
    gzip_to_file(&data, gz_file);

    for threads in ["1", "4"] {
        let output = Command::new(Path::new(BIN_PATH))
            .arg(gz_file)
            .arg("--stdout")
            .arg("-P")
            .arg(threads)
            .output()
            .expect("Failed to run pgzcat");
        assert!(output.status.success(), "pgzcat -P {threads} failed");
        assert_eq!(output.stdout, data, "-P {threads} output mismatch");
    }

    let _ = fs::remove_file(gz_file);
}

#[test]
fn test_e2e_index_roundtrip() {
    compile_binary();
    let gz_file = "test_e2e_index.txt.gz";
    let index_file = "test_e2e_index.idx";

    let data = generate_text(4 * 1024 * 1024, 3);
    gzip_to_file(&data, gz_file);

    // First pass exports the index.
    let output = Command::new(Path::new(BIN_PATH))
        .arg(gz_file)
        .arg("--stdout")
        .arg("--chunk-size")
        .arg("256")
        .arg("--export-index")
        .arg(index_file)
        .output()
        .expect("Failed to run pgzcat");
    assert!(output.status.success());
    assert_eq!(output.stdout, data);
    assert!(fs::metadata(index_file).unwrap().len() > 0);

    // Second pass consumes it.
    let output = Command::new(Path::new(BIN_PATH))
        .arg(gz_file)
        .arg("--stdout")
        .arg("--import-index")
        .arg(index_file)
        .output()
        .expect("Failed to run pgzcat");
    assert!(output.status.success());
    assert_eq!(output.stdout, data);

    let _ = fs::remove_file(gz_file);
    let _ = fs::remove_file(index_file);
}

#[test]
fn test_e2e_corrupt_input_fails() {
    compile_binary();
    let gz_file = "test_e2e_corrupt.txt.gz";

    let data = generate_text(1024 * 1024, 4);
    gzip_to_file(&data, gz_file);
    let mut bytes = fs::read(gz_file).unwrap();
    let crc_offset = bytes.len() - 8;
    bytes[crc_offset] ^= 0xFF;
    fs::write(gz_file, &bytes).unwrap();

    let output = Command::new(Path::new(BIN_PATH))
        .arg(gz_file)
        .arg("--stdout")
        .output()
        .expect("Failed to run pgzcat");
    assert!(
        !output.status.success(),
        "corrupt CRC must fail the decompression"
    );

    let _ = fs::remove_file(gz_file);
}
