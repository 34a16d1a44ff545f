//! Partitioned, chunked data readers.
//!
//! A data URI names a file or a directory of files. The concatenated byte
//! stream is split into `num_parts` contiguous ranges; part `i` reads every
//! line whose first byte falls inside its range, so parts cover the data
//! exactly once without coordination. A line straddling a boundary belongs
//! to the part where it starts.
//!
//! [`ChunkReader`] yields row blocks of roughly `chunk_size` bytes;
//! [`BatchReader`] yields fixed-row mini-batches with a shuffle buffer and
//! negative down-sampling for the stochastic optimizers.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

use widefm_core::FeaId;

use crate::error::{DataError, Result};
use crate::libfm::{parse_line, Example, LibfmOptions};
use crate::rowblock::{RowBlock, RowBlockBuilder};

/// Configuration of a partitioned reader.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// File or directory URI.
    pub uri: String,
    /// Data format; only `libfm` has a built-in parser.
    pub format: String,
    /// This reader's 0-based partition.
    pub part_index: usize,
    /// Total number of partitions.
    pub num_parts: usize,
    /// Approximate bytes per returned chunk.
    pub chunk_size: usize,
    /// Feature-ID ingest options.
    pub libfm: LibfmOptions,
}

impl ReaderConfig {
    /// A single-partition reader over `uri` with default options.
    pub fn whole(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            format: "libfm".into(),
            part_index: 0,
            num_parts: 1,
            chunk_size: 256 << 20,
            libfm: LibfmOptions::default(),
        }
    }
}

/// Per-file byte span assigned to one partition.
#[derive(Debug)]
struct FileSpan {
    path: PathBuf,
    begin: u64,
    end: u64,
}

/// Streams one partition of a URI as parsed examples and row blocks.
pub struct ChunkReader {
    spans: Vec<FileSpan>,
    next_span: usize,
    current: Option<SpanCursor>,
    chunk_size: usize,
    opts: LibfmOptions,
}

struct SpanCursor {
    reader: BufReader<File>,
    path: String,
    /// Byte offset (within the file) of the next line start.
    pos: u64,
    /// First byte past this partition's span.
    end: u64,
    lineno: usize,
    line: String,
}

/// Expands a URI into a sorted list of regular files.
fn expand_uri(uri: &str) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(uri).map_err(|e| DataError::io(uri, e))?;
    if meta.is_file() {
        return Ok(vec![PathBuf::from(uri)]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(uri)
        .map_err(|e| DataError::io(uri, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

impl ChunkReader {
    /// Opens one partition of the configured URI.
    pub fn new(config: &ReaderConfig) -> Result<Self> {
        if config.format != "libfm" {
            return Err(DataError::UnknownFormat(config.format.clone()));
        }
        let files = expand_uri(&config.uri)?;
        let sizes: Vec<u64> = files
            .iter()
            .map(|p| {
                std::fs::metadata(p)
                    .map(|m| m.len())
                    .map_err(|e| DataError::io(p.display().to_string(), e))
            })
            .collect::<Result<_>>()?;
        let total: u64 = sizes.iter().sum();
        let nparts = config.num_parts.max(1) as u64;
        let part = config.part_index as u64;
        let lo = total * part / nparts;
        let hi = total * (part + 1) / nparts;

        let mut spans = Vec::new();
        let mut file_begin = 0u64;
        for (path, len) in files.into_iter().zip(sizes) {
            let begin = lo.max(file_begin);
            let end = hi.min(file_begin + len);
            if begin < end {
                spans.push(FileSpan {
                    path,
                    begin: begin - file_begin,
                    end: end - file_begin,
                });
            }
            file_begin += len;
        }
        debug!(
            part = config.part_index,
            nparts = config.num_parts,
            files = spans.len(),
            bytes = hi - lo,
            "opened reader partition"
        );
        Ok(Self {
            spans,
            next_span: 0,
            current: None,
            chunk_size: config.chunk_size,
            opts: config.libfm,
        })
    }

    fn open_next_span(&mut self) -> Result<bool> {
        let Some(span) = self.spans.get(self.next_span) else {
            return Ok(false);
        };
        self.next_span += 1;
        let path = span.path.display().to_string();
        let mut file =
            File::open(&span.path).map_err(|e| DataError::io(path.clone(), e))?;
        file.seek(SeekFrom::Start(span.begin))
            .map_err(|e| DataError::io(path.clone(), e))?;
        let mut reader = BufReader::new(file);
        let mut pos = span.begin;
        if span.begin > 0 {
            // The line containing our first byte belongs to the previous
            // partition; skip to the next line start.
            let mut skipped = Vec::new();
            let n = reader
                .read_until(b'\n', &mut skipped)
                .map_err(|e| DataError::io(path.clone(), e))?;
            pos += n as u64;
        }
        self.current = Some(SpanCursor {
            reader,
            path,
            pos,
            end: span.end,
            lineno: 0,
            line: String::new(),
        });
        Ok(true)
    }

    /// Reads the next line of this partition; returns its byte length.
    fn next_line(&mut self) -> Result<Option<usize>> {
        loop {
            if self.current.is_none() && !self.open_next_span()? {
                return Ok(None);
            }
            let cur = self.current.as_mut().unwrap();
            if cur.pos >= cur.end {
                self.current = None;
                continue;
            }
            cur.line.clear();
            let n = cur
                .reader
                .read_line(&mut cur.line)
                .map_err(|e| DataError::io(cur.path.clone(), e))?;
            if n == 0 {
                self.current = None;
                continue;
            }
            cur.pos += n as u64;
            cur.lineno += 1;
            return Ok(Some(n));
        }
    }

    /// Parses the next example, skipping blank lines.
    ///
    /// Returns the example and the bytes consumed from the stream.
    pub fn next_example(&mut self) -> Result<Option<(Example, usize)>> {
        loop {
            let Some(n) = self.next_line()? else {
                return Ok(None);
            };
            let cur = self.current.as_ref().unwrap();
            match parse_line(&cur.line, &self.opts) {
                Ok(Some(ex)) => return Ok(Some((ex, n))),
                Ok(None) => continue,
                Err(message) => {
                    return Err(DataError::Parse {
                        path: cur.path.clone(),
                        line: cur.lineno,
                        message,
                    })
                }
            }
        }
    }

    /// Reads the next chunk of roughly `chunk_size` bytes as a row block.
    pub fn next_block(&mut self) -> Result<Option<RowBlock<FeaId>>> {
        let mut builder = RowBlockBuilder::new();
        let mut bytes = 0usize;
        while bytes < self.chunk_size {
            match self.next_example()? {
                Some((ex, n)) => {
                    builder.push_row(ex.label, ex.weight, &ex.entries);
                    bytes += n;
                }
                None => break,
            }
        }
        if builder.size() == 0 {
            Ok(None)
        } else {
            Ok(Some(builder.finish()))
        }
    }
}

/// Mini-batch reader with shuffling and negative down-sampling.
pub struct BatchReader {
    inner: ChunkReader,
    batch_size: usize,
    shuffle_rows: usize,
    neg_sampling: f32,
    buf: VecDeque<Example>,
    rng: StdRng,
    exhausted: bool,
}

impl BatchReader {
    /// Creates a batch reader over one partition.
    ///
    /// `shuffle` scales the shuffle buffer to `batch_size * shuffle` rows
    /// (0 disables shuffling). Negative examples are kept with probability
    /// `neg_sampling` and re-weighted by its inverse.
    pub fn new(
        config: &ReaderConfig,
        batch_size: usize,
        shuffle: usize,
        neg_sampling: f32,
        seed: u64,
    ) -> Result<Self> {
        Ok(Self {
            inner: ChunkReader::new(config)?,
            batch_size: batch_size.max(1),
            shuffle_rows: batch_size.max(1) * shuffle,
            neg_sampling,
            buf: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
            exhausted: false,
        })
    }

    fn fill(&mut self) -> Result<()> {
        let want = self.batch_size.max(self.shuffle_rows);
        while !self.exhausted && self.buf.len() < want {
            match self.inner.next_example()? {
                Some((mut ex, _)) => {
                    if self.neg_sampling < 1.0 && ex.label <= 0.0 {
                        if self.rng.gen::<f32>() >= self.neg_sampling {
                            continue;
                        }
                        ex.weight /= self.neg_sampling;
                    }
                    self.buf.push_back(ex);
                }
                None => self.exhausted = true,
            }
        }
        if self.shuffle_rows > 0 && !self.buf.is_empty() {
            self.buf.make_contiguous().shuffle(&mut self.rng);
        }
        Ok(())
    }

    /// Reads the next mini-batch, or `None` at end of partition.
    pub fn next_batch(&mut self) -> Result<Option<RowBlock<FeaId>>> {
        if self.buf.len() < self.batch_size {
            self.fill()?;
        }
        if self.buf.is_empty() {
            return Ok(None);
        }
        let n = self.batch_size.min(self.buf.len());
        let mut builder = RowBlockBuilder::new();
        for ex in self.buf.drain(..n) {
            builder.push_row(ex.label, ex.weight, &ex.entries);
        }
        Ok(Some(builder.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn raw_config(uri: &str, part: usize, nparts: usize) -> ReaderConfig {
        ReaderConfig {
            uri: uri.into(),
            format: "libfm".into(),
            part_index: part,
            num_parts: nparts,
            chunk_size: 1 << 20,
            libfm: LibfmOptions {
                reverse_feaid: false,
                fea_group_nbits: 0,
            },
        }
    }

    fn write_lines(n: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for i in 0..n {
            writeln!(f, "{} {}:1", if i % 2 == 0 { 1 } else { -1 }, i).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_partitions_cover_exactly_once() {
        let f = write_lines(97);
        let uri = f.path().display().to_string();
        let mut seen = Vec::new();
        for part in 0..4 {
            let mut reader = ChunkReader::new(&raw_config(&uri, part, 4)).unwrap();
            while let Some((ex, _)) = reader.next_example().unwrap() {
                seen.push(ex.entries[0].1);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..97).collect::<Vec<u64>>());
    }

    #[test]
    fn test_chunking_preserves_rows() {
        let f = write_lines(50);
        let uri = f.path().display().to_string();
        let mut config = raw_config(&uri, 0, 1);
        config.chunk_size = 64; // force several chunks
        let mut reader = ChunkReader::new(&config).unwrap();
        let mut rows = 0;
        let mut chunks = 0;
        while let Some(blk) = reader.next_block().unwrap() {
            blk.validate().unwrap();
            rows += blk.size();
            chunks += 1;
        }
        assert_eq!(rows, 50);
        assert!(chunks > 1);
    }

    #[test]
    fn test_batch_reader_fixed_rows() {
        let f = write_lines(23);
        let uri = f.path().display().to_string();
        let mut reader = BatchReader::new(&raw_config(&uri, 0, 1), 10, 0, 1.0, 0).unwrap();
        let sizes: Vec<usize> = std::iter::from_fn(|| {
            reader.next_batch().unwrap().map(|b| b.size())
        })
        .collect();
        assert_eq!(sizes, vec![10, 10, 3]);
    }

    #[test]
    fn test_shuffle_is_seeded() {
        let f = write_lines(40);
        let uri = f.path().display().to_string();
        let collect = |seed| {
            let mut r = BatchReader::new(&raw_config(&uri, 0, 1), 40, 2, 1.0, seed).unwrap();
            let blk = r.next_batch().unwrap().unwrap();
            blk.index.to_vec()
        };
        assert_eq!(collect(7), collect(7));
        assert_ne!(collect(7), collect(8));
    }

    #[test]
    fn test_negative_sampling_reweights() {
        let f = write_lines(400);
        let uri = f.path().display().to_string();
        let mut reader = BatchReader::new(&raw_config(&uri, 0, 1), 400, 0, 0.5, 3).unwrap();
        let blk = reader.next_batch().unwrap().unwrap();
        // Positives all kept; roughly half the negatives survive.
        let labels = blk.label.as_ref().unwrap();
        let npos = labels.iter().filter(|&&y| y > 0.0).count();
        let nneg = labels.len() - npos;
        assert_eq!(npos, 200);
        assert!(nneg > 40 && nneg < 160, "nneg = {}", nneg);
        let weights = blk.weight.as_ref().unwrap();
        for (i, &y) in labels.iter().enumerate() {
            if y <= 0.0 {
                assert_eq!(weights[i], 2.0);
            }
        }
    }

    #[test]
    fn test_directory_uri() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.libfm", "b.libfm"] {
            let mut f = File::create(dir.path().join(name)).unwrap();
            writeln!(f, "1 1:1").unwrap();
        }
        let uri = dir.path().display().to_string();
        let mut reader = ChunkReader::new(&raw_config(&uri, 0, 1)).unwrap();
        let mut rows = 0;
        while let Some((_, _)) = reader.next_example().unwrap() {
            rows += 1;
        }
        assert_eq!(rows, 2);
    }

    #[test]
    fn test_unknown_format_rejected() {
        let f = write_lines(1);
        let mut config = raw_config(&f.path().display().to_string(), 0, 1);
        config.format = "recordio".into();
        assert!(matches!(
            ChunkReader::new(&config),
            Err(DataError::UnknownFormat(_))
        ));
    }
}
