//! Chunk fetcher / prefetcher: the orchestrator of parallel decoding.
//!
//! The fetcher owns the worker pool, the candidate offsets from the block
//! finder, the LRU cache of resolved chunks, the in-flight futures, and the
//! window chain. Chunks are *decoded* out of order by the pool (in marker
//! mode when their window is still unknown) but *resolved* strictly in
//! stream order, which is when they enter the block map and their end offset
//! confirms the successor's start.
//!
//! Speculation is self-correcting: a chunk's geometry (end offset, inner
//! boundaries) does not depend on its initial window, so a speculative
//! result is valid whenever it started on the confirmed offset chain; when
//! a confirmed end contradicts a candidate guess, the guessed work is
//! cancelled and the chain continues from the true offset.

use crate::blockfinder::{BlockFinder, FinderChoice};
use crate::blockmap::BlockMap;
use crate::cache::LruCache;
use crate::chunk::{decode_chunk, decode_chunk_with_zlib_wrapper, ChunkConfig, ChunkData};
use crate::error::{Error, Result};
use crate::gzip::FileKind;
use crate::source::SharedSource;
use crate::threadpool::{TaskFuture, ThreadPinning, ThreadPool};
use crate::window::{UsedWindowSymbols, Window, WindowMap};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const PRIORITY_ON_DEMAND: i32 = 10;
const PRIORITY_PREFETCH: i32 = 0;

/// Construction-time knobs of the fetcher.
#[derive(Clone)]
pub struct FetcherOptions {
    /// Worker thread count.
    pub parallelization: usize,
    /// Compressed spacing between chunk starts, in bytes.
    pub chunk_size: u64,
    /// Hard cap on a single chunk's decoded size; guards against degenerate
    /// compression ratios when the planned stop offset lies far out.
    pub max_decoded_chunk_size: u64,
    /// Worker-index -> logical-core pinning.
    pub pinning: ThreadPinning,
    /// Keep (sparsified) windows for every chunk instead of releasing them;
    /// required for index export.
    pub keep_windows: bool,
    pub finder: FinderChoice,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        let parallelization = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self {
            parallelization,
            chunk_size: 4 * 1024 * 1024,
            max_decoded_chunk_size: 256 * 1024 * 1024,
            pinning: ThreadPinning::new(),
            keep_windows: false,
            finder: FinderChoice::Auto,
        }
    }
}

/// Cache and prefetch accounting.
#[derive(Debug, Default, Clone, Copy)]
pub struct FetchStatistics {
    /// Chunk was already decoded (cache or completed prefetch).
    pub hits: u64,
    /// Chunk was in flight; the consumer waited on its future.
    pub prefetch_hits: u64,
    /// Chunk had to be decoded on demand.
    pub misses: u64,
    /// Prefetch tasks submitted.
    pub prefetched: u64,
    /// Prefetch tasks discarded (cancelled or failed speculation).
    pub wasted_prefetches: u64,
}

impl FetchStatistics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.prefetch_hits + self.misses;
        if total == 0 {
            return 1.0;
        }
        (self.hits + self.prefetch_hits) as f64 / total as f64
    }
}

impl fmt::Display for FetchStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cache hits                 : {}", self.hits)?;
        writeln!(f, "prefetch queue hits        : {}", self.prefetch_hits)?;
        writeln!(f, "misses                     : {}", self.misses)?;
        writeln!(f, "prefetched chunks          : {}", self.prefetched)?;
        writeln!(f, "wasted prefetches          : {}", self.wasted_prefetches)?;
        write!(f, "hit rate                   : {:.6}", self.hit_rate())
    }
}

/// Forward-sequential access detector sizing the prefetch depth.
struct FetchStrategy {
    last_accessed: Option<usize>,
    sequential_run: u32,
}

impl FetchStrategy {
    fn new() -> Self {
        Self {
            last_accessed: None,
            sequential_run: 0,
        }
    }

    /// Records an access; returns true when it broke a sequential run.
    fn record(&mut self, index: usize) -> bool {
        let sequential = match self.last_accessed {
            None => true,
            Some(last) => index == last || index == last + 1,
        };
        self.last_accessed = Some(index);
        if sequential {
            self.sequential_run = self.sequential_run.saturating_add(1);
            false
        } else {
            self.sequential_run = 0;
            true
        }
    }

    /// Prefetch depth: ramps up exponentially while access stays
    /// sequential, capped at double the pool size.
    fn depth(&self, parallelization: usize) -> usize {
        let cap = 2 * parallelization.max(1);
        if self.sequential_run == 0 {
            1
        } else {
            cap.min(1 << self.sequential_run.min(16))
        }
    }
}

struct InFlight {
    future: TaskFuture<Result<ChunkData>>,
    cancel: Arc<AtomicBool>,
    start_bits: u64,
}

pub struct ChunkFetcher {
    source: SharedSource,
    pool: ThreadPool,
    chunk_config: ChunkConfig,
    chunk_spacing_bits: u64,

    finder: BlockFinder,
    finder_exhausted: bool,
    /// Candidates pulled from the finder but not yet assigned to a chunk.
    pending_candidates: VecDeque<u64>,
    /// Candidates emitted by the finder are real block starts (BGZF), which
    /// also means gzip members are self-contained: no marker decoding ever.
    candidates_exact: bool,

    /// Chunk start offsets. `offsets[i]` is exact for `i <= resolved`;
    /// beyond that they are finder guesses.
    offsets: Vec<u64>,
    /// Chunks `[0, resolved)` are resolved and in the block map.
    resolved: usize,
    /// Decoded bytes covered by resolved chunks.
    next_decoded: u64,
    finished: bool,
    total_chunks: Option<usize>,

    cache: LruCache<usize, Arc<ChunkData>>,
    /// Completed speculative decodes awaiting resolution.
    speculative: HashMap<usize, ChunkData>,
    in_flight: HashMap<usize, InFlight>,
    windows: WindowMap,
    block_map: BlockMap,

    strategy: FetchStrategy,
    stats: FetchStatistics,
    keep_windows: bool,
}

impl ChunkFetcher {
    pub fn new(source: SharedSource, kind: FileKind, options: FetcherOptions) -> Result<Self> {
        let mut finder = BlockFinder::new(source.clone(), kind, options.finder)?;
        let first_offset = finder.next()?.ok_or(Error::UnexpectedEof)?;
        let candidates_exact = matches!(finder, BlockFinder::Bgzf(_));

        let cache_capacity = (2 * options.parallelization + 2).max(16);
        Ok(Self {
            source,
            pool: ThreadPool::new(options.parallelization, options.pinning.clone()),
            chunk_config: ChunkConfig {
                target_decoded_size: options.max_decoded_chunk_size,
                file_kind: kind,
            },
            chunk_spacing_bits: options.chunk_size * 8,
            finder,
            finder_exhausted: false,
            pending_candidates: VecDeque::new(),
            candidates_exact,
            offsets: vec![first_offset],
            resolved: 0,
            next_decoded: 0,
            finished: false,
            total_chunks: None,
            cache: LruCache::new(cache_capacity),
            speculative: HashMap::new(),
            in_flight: HashMap::new(),
            windows: WindowMap::new(),
            block_map: BlockMap::new(),
            strategy: FetchStrategy::new(),
            stats: FetchStatistics::default(),
            keep_windows: options.keep_windows,
        })
    }

    pub fn block_map(&self) -> &BlockMap {
        &self.block_map
    }

    pub fn windows(&self) -> &WindowMap {
        &self.windows
    }

    pub fn statistics(&self) -> FetchStatistics {
        self.stats
    }

    pub fn parallelization(&self) -> usize {
        self.pool.capacity().max(1)
    }

    /// Number of chunks, known once the stream end was reached.
    pub fn chunk_count(&self) -> Option<usize> {
        self.total_chunks
    }

    /// Fetches the resolved chunk with the given index, decoding and
    /// resolving everything up to it if necessary, then tops up prefetches.
    pub fn get(&mut self, index: usize) -> Result<Arc<ChunkData>> {
        if let Some(total) = self.total_chunks {
            if index >= total {
                return Err(Error::UnexpectedEof);
            }
        }

        if self.strategy.record(index) {
            self.cancel_irrelevant_prefetches(index);
        }
        self.harvest_completed();

        let chunk = if index < self.resolved {
            if let Some(chunk) = self.cache.get(&index) {
                self.stats.hits += 1;
                chunk.clone()
            } else {
                self.materialize_resolved(index)?
            }
        } else {
            while self.resolved <= index {
                self.resolve_next()?;
            }
            self.cache
                .get(&index)
                .cloned()
                .expect("chunk cached by resolve_next")
        };

        self.prefetch_from(index + 1);
        Ok(chunk)
    }

    /// The consumer finished reading everything before `decoded_offset`;
    /// windows that no successor can still need are released, and
    /// single-pass sources may drop old compressed bytes. Enough compressed
    /// history for `2 * parallelization + 1` chunks is retained so that
    /// out-of-order completion never reads a released range.
    pub fn set_consumed(&mut self, decoded_offset: u64) {
        if !self.keep_windows {
            // The frontier window (at `next_decoded`) must survive for the
            // next resolution.
            self.windows
                .release_before(decoded_offset.min(self.next_decoded));

            let keep_chunks = 2 * self.pool.capacity().max(1) + 1;
            let keep_from = self.resolved.saturating_sub(keep_chunks);
            if let Some(&offset) = self.offsets.get(keep_from) {
                self.source.release_before(offset / 8);
            }
        }
    }

    /// Seeds offsets, block map and windows from an imported index; chunks
    /// decode on demand afterwards, in any order.
    pub fn seed_from_index(
        &mut self,
        entries: Vec<(u64, u64, Option<Window>)>,
        end_bits: u64,
        total_decoded: u64,
    ) -> Result<()> {
        if self.resolved != 0 || entries.is_empty() {
            return Err(Error::InvalidFormat("index import on a used reader"));
        }
        self.offsets.clear();
        for (index, (bit_offset, decoded_offset, window)) in entries.into_iter().enumerate() {
            if index == 0 && decoded_offset != 0 {
                return Err(Error::InvalidFormat("index does not start at offset zero"));
            }
            self.offsets.push(bit_offset);
            self.block_map.push(bit_offset, decoded_offset);
            if let Some(window) = window {
                self.windows.insert(decoded_offset, Arc::new(window));
            } else if index != 0 {
                return Err(Error::InvalidFormat("index entry without window"));
            }
        }
        self.block_map.finalize(end_bits, total_decoded);
        self.offsets.push(end_bits);
        self.resolved = self.block_map.len();
        self.total_chunks = Some(self.block_map.len());
        self.next_decoded = total_decoded;
        self.finished = true;
        self.keep_windows = true;
        Ok(())
    }

    /// Resolves the frontier chunk `self.resolved`.
    fn resolve_next(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::UnexpectedEof);
        }
        let index = self.resolved;
        let start = self.offsets[index];
        let decoded_start = self.next_decoded;

        let window_arc = if index == 0 {
            None
        } else {
            self.windows.get(decoded_start)
        };
        let window_bytes: Vec<u8> = match &window_arc {
            Some(window) => window.bytes()?.into_owned(),
            None => Vec::new(),
        };

        let chunk = self.obtain_chunk(index, start, &window_bytes)?;
        debug_assert_eq!(chunk.start_bits, start);

        let used: Option<UsedWindowSymbols>;
        let chunk = if chunk.needs_resolution() {
            let (chunk, used_symbols) = chunk.resolve(&window_bytes)?;
            used = Some(used_symbols);
            chunk
        } else {
            // Committed decode resolved references inline; which window
            // positions it read was not tracked.
            used = None;
            chunk
        };

        // Stored windows are kept in compressed form; when the successor's
        // reads are known, unread positions are zeroed first, which makes
        // the compression nearly free.
        if self.keep_windows && index > 0 {
            if let Some(window) = &window_arc {
                let stored = match &used {
                    Some(used) => window.sparsified(used)?,
                    None => window.compressed()?,
                };
                self.windows.replace(decoded_start, Arc::new(stored));
            }
        }

        self.block_map.push(start, decoded_start);
        self.next_decoded = decoded_start + chunk.decoded_size();
        let successor_window =
            Window::at_end_of(&window_bytes, chunk.bytes().expect("resolved chunk"));
        self.windows
            .insert(self.next_decoded, Arc::new(successor_window));

        if chunk.ends_stream {
            self.finished = true;
            self.total_chunks = Some(index + 1);
            self.block_map.finalize(chunk.end_bits, self.next_decoded);
            self.drop_speculation_beyond(index);
        } else {
            self.confirm_successor_offset(index, chunk.end_bits);
        }

        self.resolved += 1;
        self.cache.insert(index, Arc::new(chunk));
        Ok(())
    }

    /// Gets the decoded (possibly unresolved) chunk for the frontier:
    /// completed prefetch, in-flight future, or on-demand decode.
    fn obtain_chunk(&mut self, index: usize, start: u64, window: &[u8]) -> Result<ChunkData> {
        if let Some(chunk) = self.speculative.remove(&index) {
            if chunk.start_bits == start {
                self.stats.hits += 1;
                return Ok(chunk);
            }
            self.stats.wasted_prefetches += 1;
        }

        if let Some(in_flight) = self.in_flight.remove(&index) {
            if in_flight.start_bits == start {
                match in_flight.future.wait() {
                    Ok(chunk) => {
                        self.stats.prefetch_hits += 1;
                        return Ok(chunk);
                    }
                    Err(error) if error == Error::Cancelled || error.is_speculation_failure() => {
                        self.stats.wasted_prefetches += 1;
                    }
                    Err(error) => return Err(error),
                }
            } else {
                in_flight.cancel.store(true, std::sync::atomic::Ordering::Relaxed);
                self.stats.wasted_prefetches += 1;
            }
        }

        self.stats.misses += 1;
        let stop = self.candidate_for(index + 1)?;
        self.decode_committed(start, stop, window)
    }

    /// Synchronous committed decode: the window is known, errors are real.
    fn decode_committed(
        &mut self,
        start: u64,
        stop: Option<u64>,
        window: &[u8],
    ) -> Result<ChunkData> {
        // Whole-member chunks with no history decode through the zlib
        // wrapper, which is faster than the marker-capable decoder.
        if self.candidates_exact && start % 8 == 0 && window.is_empty() {
            if let Some(stop) = stop.filter(|stop| stop % 8 == 0) {
                if let Ok(chunk) = decode_chunk_with_zlib_wrapper(&self.source, start, stop, None)
                {
                    return Ok(chunk);
                }
            }
        }

        let source = self.source.clone();
        let config = self.chunk_config.clone();
        let window = window.to_vec();
        let cancel = Arc::new(AtomicBool::new(false));
        let task_cancel = cancel.clone();
        self.pool
            .submit(PRIORITY_ON_DEMAND, move || {
                decode_chunk(
                    &source,
                    start,
                    stop,
                    Some(&window),
                    None,
                    &config,
                    &task_cancel,
                )
            })
            .wait()
    }

    /// Re-decodes an already-resolved chunk that fell out of the cache,
    /// chaining forward from the nearest chunk with a stored window.
    fn materialize_resolved(&mut self, index: usize) -> Result<Arc<ChunkData>> {
        self.stats.misses += 1;

        let mut first = index;
        let mut window_bytes: Vec<u8> = loop {
            if first == 0 {
                break Vec::new();
            }
            let entry = self.block_map.get(first).expect("resolved entry");
            if let Some(window) = self.windows.get(entry.decoded_offset) {
                break window.bytes()?.into_owned();
            }
            first -= 1;
        };

        for current in first..=index {
            let start = self.offsets[current];
            let stop = self.offsets.get(current + 1).copied();
            let chunk = self.decode_committed(start, stop, &window_bytes)?;
            window_bytes =
                Window::at_end_of(&window_bytes, chunk.bytes().expect("committed decode"))
                    .bytes()?
                    .into_owned();
            self.cache.insert(current, Arc::new(chunk));
        }

        Ok(self
            .cache
            .get(&index)
            .cloned()
            .expect("materialized chunk cached"))
    }

    /// Makes `offsets[index]` available as a guess if the finder still has
    /// candidates; returns it.
    fn candidate_for(&mut self, index: usize) -> Result<Option<u64>> {
        while self.offsets.len() <= index {
            let minimum = self.offsets.last().copied().unwrap_or(0) + self.chunk_spacing_bits;
            match self.next_candidate_at_least(minimum)? {
                Some(candidate) => self.offsets.push(candidate),
                None => return Ok(None),
            }
        }
        Ok(self.offsets.get(index).copied())
    }

    fn next_candidate_at_least(&mut self, minimum: u64) -> Result<Option<u64>> {
        loop {
            if let Some(&front) = self.pending_candidates.front() {
                self.pending_candidates.pop_front();
                if front >= minimum {
                    return Ok(Some(front));
                }
                continue;
            }
            if self.finder_exhausted {
                return Ok(None);
            }
            match self.finder.next()? {
                Some(candidate) => self.pending_candidates.push_back(candidate),
                None => self.finder_exhausted = true,
            }
        }
    }

    /// Reconciles the confirmed end of chunk `index` with the guessed start
    /// of its successor; on mismatch all dependent speculation is dropped.
    fn confirm_successor_offset(&mut self, index: usize, end_bits: u64) {
        let successor = index + 1;
        if let Some(&guess) = self.offsets.get(successor) {
            if guess == end_bits {
                return;
            }
            // Guessed offsets are still valid raw candidates; put them back
            // for later spacing decisions.
            for &stale in self.offsets[successor..].iter().rev() {
                if stale > end_bits {
                    self.pending_candidates.push_front(stale);
                }
            }
            self.offsets.truncate(successor);
            self.drop_speculation_beyond(index);
        }
        self.offsets.push(end_bits);
    }

    fn drop_speculation_beyond(&mut self, index: usize) {
        self.speculative.retain(|&key, _| key <= index);
        let stale: Vec<usize> = self
            .in_flight
            .keys()
            .copied()
            .filter(|&key| key > index)
            .collect();
        for key in stale {
            if let Some(in_flight) = self.in_flight.remove(&key) {
                in_flight
                    .cancel
                    .store(true, std::sync::atomic::Ordering::Relaxed);
                self.stats.wasted_prefetches += 1;
            }
        }
    }

    /// Cancels in-flight prefetches that a seek made irrelevant.
    fn cancel_irrelevant_prefetches(&mut self, index: usize) {
        let depth = self.strategy.depth(self.pool.capacity());
        let keep = index..index + depth + 1;
        let stale: Vec<usize> = self
            .in_flight
            .keys()
            .copied()
            .filter(|key| !keep.contains(key))
            .collect();
        for key in stale {
            if let Some(in_flight) = self.in_flight.remove(&key) {
                in_flight
                    .cancel
                    .store(true, std::sync::atomic::Ordering::Relaxed);
                self.stats.wasted_prefetches += 1;
            }
        }
    }

    /// Moves finished futures into the speculative store.
    fn harvest_completed(&mut self) {
        let keys: Vec<usize> = self.in_flight.keys().copied().collect();
        for key in keys {
            let done = self.in_flight.get(&key).and_then(|f| f.future.poll());
            if let Some(result) = done {
                self.in_flight.remove(&key);
                match result {
                    Ok(chunk) => {
                        self.speculative.insert(key, chunk);
                    }
                    Err(_) => {
                        // Failed or cancelled speculation; the committed
                        // path will retry if the chunk is ever needed.
                        self.stats.wasted_prefetches += 1;
                    }
                }
            }
        }
    }

    /// Tops up prefetch tasks ahead of the cursor, best effort.
    fn prefetch_from(&mut self, next_index: usize) {
        let depth = self.strategy.depth(self.pool.capacity());
        let max_in_flight = 2 * self.pool.capacity().max(1);

        for index in next_index..next_index + depth {
            if let Some(total) = self.total_chunks {
                if index >= total {
                    break;
                }
            }
            if self.in_flight.len() >= max_in_flight {
                break;
            }
            if index < self.resolved
                || self.cache.contains(&index)
                || self.speculative.contains_key(&index)
                || self.in_flight.contains_key(&index)
            {
                continue;
            }
            // Backpressure: never hold more speculative output than the
            // cache could absorb.
            if self.speculative.len() >= self.cache.capacity() {
                break;
            }

            let (start, stop) = match self.candidate_for(index) {
                Ok(Some(start)) => match self.candidate_for(index + 1) {
                    Ok(stop) => (start, stop),
                    Err(_) => break,
                },
                _ => break,
            };

            let source = self.source.clone();
            let config = self.chunk_config.clone();
            let cancel = Arc::new(AtomicBool::new(false));
            let task_cancel = cancel.clone();
            // BGZF members are self-contained: decode with an empty window
            // and skip the marker machinery entirely.
            let independent = self.candidates_exact;
            let future = self.pool.submit(PRIORITY_PREFETCH, move || {
                let window: Option<&[u8]> = if independent { Some(&[]) } else { None };
                decode_chunk(&source, start, stop, window, None, &config, &task_cancel)
            });
            self.in_flight.insert(
                index,
                InFlight {
                    future,
                    cancel,
                    start_bits: start,
                },
            );
            self.stats.prefetched += 1;
        }
    }
}
