//! Chunked streaming over large byte or line sources.
//!
//! Reads a source in fixed-size chunks through a forward-only pass, folding
//! each chunk into a running accumulator so the full source is never
//! materialized. Peak memory is bounded by the chunk size, not the source
//! size, and the final aggregate is independent of the chunk size for any
//! associative fold. Pipeline stages (filter, transform) share the same
//! chunk-handler contract so they chain without buffering between stages.
//!
//! Network-fed sources reuse the resilience client: a collected
//! `Response::body` is `Bytes`, which feeds [`StreamingProcessor`] through
//! `bytes::Buf::reader()`.

use std::io::{BufRead, BufReader, Read};

use thiserror::Error;
use tracing::debug;

/// Streaming failures. A read error aborts the whole invocation; partial
/// aggregates are never returned.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("source read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk handler failed: {0}")]
    Handler(String),
}

/// Configuration for chunked processing.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Chunk size: bytes for [`process_bytes`](StreamingProcessor::process_bytes),
    /// lines for [`process_lines`](StreamingProcessor::process_lines).
    pub chunk_size: usize,

    /// Buffer size for underlying reads.
    pub buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            buffer_size: 8192,
        }
    }
}

/// Stateless orchestrator for bounded-memory consumption of large sources.
///
/// Per-invocation state (the open source handle and the accumulator) is
/// owned exclusively by the call; the processor itself can be shared freely.
pub struct StreamingProcessor {
    config: StreamConfig,
}

impl StreamingProcessor {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Fold over byte chunks of exactly `chunk_size` bytes (the final chunk
    /// may be shorter). The chunk buffer is reused across iterations.
    pub fn process_bytes<R, A, F>(&self, source: R, seed: A, mut fold: F) -> Result<A, StreamError>
    where
        R: Read,
        F: FnMut(A, &[u8]) -> Result<A, StreamError>,
    {
        let chunk_size = self.config.chunk_size.max(1);
        let mut reader = BufReader::with_capacity(self.config.buffer_size, source);
        let mut chunk = vec![0u8; chunk_size];
        let mut acc = seed;
        let mut chunks = 0u64;

        loop {
            let mut filled = 0;
            while filled < chunk_size {
                let n = reader.read(&mut chunk[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            acc = fold(acc, &chunk[..filled])?;
            chunks += 1;
            if filled < chunk_size {
                break;
            }
        }

        debug!(chunks = chunks, chunk_size = chunk_size, "byte stream complete");
        Ok(acc)
    }

    /// Fold over record chunks of `chunk_size` lines each. Line terminators
    /// are stripped; the final short chunk is still delivered.
    pub fn process_lines<R, A, F>(&self, source: R, seed: A, mut fold: F) -> Result<A, StreamError>
    where
        R: Read,
        F: FnMut(A, &[String]) -> Result<A, StreamError>,
    {
        let chunk_size = self.config.chunk_size.max(1);
        let reader = BufReader::with_capacity(self.config.buffer_size, source);
        let mut chunk: Vec<String> = Vec::with_capacity(chunk_size);
        let mut acc = seed;
        let mut chunks = 0u64;

        for line in reader.lines() {
            chunk.push(line?);
            if chunk.len() >= chunk_size {
                acc = fold(acc, &chunk)?;
                chunks += 1;
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            acc = fold(acc, &chunk)?;
            chunks += 1;
        }

        debug!(chunks = chunks, chunk_size = chunk_size, "line stream complete");
        Ok(acc)
    }
}

/// Wrap a line-chunk fold so only records matching `pred` reach it. The
/// retained records are passed through without buffering beyond the chunk.
pub fn filtered<A, P, F>(pred: P, mut fold: F) -> impl FnMut(A, &[String]) -> Result<A, StreamError>
where
    P: Fn(&str) -> bool,
    F: FnMut(A, &[String]) -> Result<A, StreamError>,
{
    move |acc, records| {
        let kept: Vec<String> = records
            .iter()
            .filter(|r| pred(r))
            .cloned()
            .collect();
        if kept.is_empty() {
            Ok(acc)
        } else {
            fold(acc, &kept)
        }
    }
}

/// Wrap a line-chunk fold so every record is transformed by `map` first.
pub fn mapped<A, M, F>(map: M, mut fold: F) -> impl FnMut(A, &[String]) -> Result<A, StreamError>
where
    M: Fn(&str) -> String,
    F: FnMut(A, &[String]) -> Result<A, StreamError>,
{
    move |acc, records| {
        let transformed: Vec<String> = records.iter().map(|r| map(r)).collect();
        fold(acc, &transformed)
    }
}
