use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parallel_gzip::blockfinder::FinderChoice;
use parallel_gzip::{
    MemorySource, ParallelGzipReader, ReaderOptions, SharedSource, SinglePassSource,
};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod writer;
use writer::OutputWriter;

/// Parallel gzip / BGZF decompressor.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input file ("-" for stdin)
    input: PathBuf,

    /// Output file (defaults to the input with the .gz/.bgz suffix removed,
    /// or stdout when reading from stdin)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write decompressed data to stdout
    #[arg(short = 'c', long)]
    stdout: bool,

    /// Number of decoder threads (default: all cores)
    #[arg(short = 'P', long, default_value_t = 0)]
    threads: usize,

    /// Compressed chunk spacing in KiB
    #[arg(long, default_value_t = 4096)]
    chunk_size: u64,

    /// Skip CRC32 verification
    #[arg(long)]
    no_verify_crc: bool,

    /// Force the pigz flush-marker block finder
    #[arg(long)]
    pigz: bool,

    /// Treat the input as a headerless raw DEFLATE stream
    #[arg(long)]
    raw_deflate: bool,

    /// Print cache and prefetch statistics to stderr when done
    #[arg(long)]
    stats: bool,

    /// Write a seek-point index to this file after decompressing
    #[arg(long)]
    export_index: Option<PathBuf>,

    /// Load a seek-point index before decompressing
    #[arg(long)]
    import_index: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let from_stdin = args.input.as_os_str() == "-";
    let source: SharedSource = if from_stdin {
        Arc::new(SinglePassSource::new(std::io::stdin()))
    } else {
        Arc::new(MemorySource::map_file(&args.input).context("failed to mmap the input file")?)
    };

    let options = ReaderOptions {
        parallelization: args.threads,
        chunk_size: args.chunk_size * 1024,
        verify_crc: !args.no_verify_crc,
        keep_index_windows: args.export_index.is_some(),
        finder: if args.pigz {
            FinderChoice::Pigz
        } else {
            FinderChoice::Auto
        },
        ..ReaderOptions::default()
    };
    let mut reader = if args.raw_deflate {
        ParallelGzipReader::with_kind(source, parallel_gzip::FileKind::RawDeflate, options)
    } else {
        ParallelGzipReader::new(source, options)
    }
    .context("failed to open the compressed input")?;

    if let Some(path) = &args.import_index {
        let file = File::open(path).context("failed to open the index file")?;
        let index = parallel_gzip::index::read_index(std::io::BufReader::new(file))
            .context("failed to parse the index file")?;
        reader
            .import_index(index)
            .context("failed to apply the index")?;
    }

    let output_path = if args.stdout || from_stdin && args.output.is_none() {
        None
    } else if let Some(path) = args.output.clone() {
        Some(path)
    } else {
        Some(default_output_path(&args.input)?)
    };

    let raw_out: Box<dyn Write + Send> = match &output_path {
        Some(path) => Box::new(File::create(path).context("failed to create the output file")?),
        None => Box::new(std::io::stdout()),
    };
    let mut out = OutputWriter::new(BufWriter::with_capacity(4 * 1024 * 1024, raw_out));

    // The decoded size is unknown up front; show throughput instead of a
    // percentage.
    let progress = ProgressBar::new_spinner();
    progress.set_draw_target(if output_path.is_some() {
        ProgressDrawTarget::stderr_with_hz(5)
    } else {
        ProgressDrawTarget::hidden()
    });
    progress.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec})",
        )
        .unwrap(),
    );

    let mut buffer = vec![0u8; 4 * 1024 * 1024];
    loop {
        let n = reader.read(&mut buffer).context("decompression failed")?;
        if n == 0 {
            break;
        }
        out.write_all(&buffer[..n])
            .context("failed to write decompressed data")?;
        progress.inc(n as u64);
    }
    out.finish().context("failed to flush the output")?;
    progress.finish_and_clear();

    if let Some(path) = &args.export_index {
        let index = reader
            .export_index()
            .context("failed to build the seek index")?;
        let file = File::create(path).context("failed to create the index file")?;
        parallel_gzip::index::write_index(BufWriter::new(file), &index)
            .context("failed to write the index file")?;
    }

    if args.stats {
        eprintln!("{}", reader.statistics());
    }

    Ok(())
}

fn default_output_path(input: &Path) -> Result<PathBuf> {
    let name = input.to_string_lossy();
    for suffix in [".gz", ".bgz", ".bgzf", ".gzip"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            return Ok(PathBuf::from(stripped));
        }
    }
    bail!("cannot derive an output name from {name:?}; use --output or --stdout");
}
