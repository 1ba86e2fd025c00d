//! # Chunked Extractor
//!
//! Streams one partition from a server-side cursor into a staged artifact:
//!
//! ```text
//! cursor -> ChunkBuffer -> StreamWriter -> [CountingWriter] -> EncodeWriter -> ArtifactSink
//!                                                                              |-> temp file
//!                                                                              |-> md5 (whole)
//!                                                                              `-> md5 (per part)
//! ```
//!
//! Memory is bounded by one chunk plus the encoder and writer buffers. The
//! temp file is owned by a `TempPath`, so every early return removes it.

use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::application::cancellation::CancellationSignal;
use crate::application::integrity::{ArtifactSink, CountingWriter, StagedArtifact};
use crate::compression::Compressor;
use crate::domain::chunk_buffer::ChunkBuffer;
use crate::domain::entities::{ColumnSchema, PartitionInfo};
use crate::domain::errors::{ArchiveError, Result, Stage};
use crate::format::{OutputFormat, StreamWriter};
use crate::ports::progress_port::ProgressObserver;
use crate::ports::row_source_port::{RowCursor, RowSource};

#[derive(Debug, Clone)]
pub struct ExtractorOptions {
    pub chunk_size: usize,
    pub compression_level: i32,
    pub temp_dir: PathBuf,
    /// Part size used for the multipart checksum; must match the uploader.
    pub part_size: u64,
}

pub struct ChunkedExtractor {
    source: Arc<dyn RowSource>,
    format: Arc<dyn OutputFormat>,
    compressor: Arc<dyn Compressor>,
    options: ExtractorOptions,
}

impl ChunkedExtractor {
    pub fn new(
        source: Arc<dyn RowSource>,
        format: Arc<dyn OutputFormat>,
        compressor: Arc<dyn Compressor>,
        options: ExtractorOptions,
    ) -> Self {
        Self {
            source,
            format,
            compressor,
            options,
        }
    }

    /// File extension of the artifacts this extractor produces, e.g. `jsonl.zst`.
    pub fn artifact_extension(&self) -> String {
        let compression_ext = if self.format.compresses_internally() {
            ""
        } else {
            self.compressor.extension()
        };
        if compression_ext.is_empty() {
            self.format.extension().to_string()
        } else {
            format!("{}.{}", self.format.extension(), compression_ext)
        }
    }

    pub fn content_type(&self) -> &'static str {
        self.format.mime_type()
    }

    /// Runs one full extraction attempt.
    ///
    /// On any error, including cancellation, the staged file is already gone
    /// when this returns.
    pub fn extract(
        &self,
        partition: &PartitionInfo,
        schema: &ColumnSchema,
        cancel: &CancellationSignal,
        progress: &dyn ProgressObserver,
    ) -> Result<StagedArtifact> {
        let id = partition.id();
        let started = Instant::now();

        std::fs::create_dir_all(&self.options.temp_dir)
            .map_err(|e| ArchiveError::from(e).in_partition(&id, Stage::Extract))?;
        let tmp = tempfile::Builder::new()
            .prefix("pg-archiver-")
            .suffix(&format!(".{}", self.artifact_extension()))
            .tempfile_in(&self.options.temp_dir)
            .map_err(|e| ArchiveError::from(e).in_partition(&id, Stage::Extract))?;
        let (file, path) = tmp.into_parts();
        debug!("{}: staging to {}", id, path.display());

        let mut sink = ArtifactSink::new(file, self.options.part_size);
        let (rows, uncompressed) = self.stream_into(&mut sink, partition, schema, cancel, progress)?;
        let digest = sink
            .finalize()
            .map_err(|e| e.in_partition(&id, Stage::Compress))?;

        info!(
            "{}: extracted {} rows ({} bytes raw, {} bytes staged) in {:.1}s",
            id,
            rows,
            uncompressed,
            digest.size,
            started.elapsed().as_secs_f32()
        );
        Ok(StagedArtifact::new(
            path,
            digest,
            self.options.part_size,
            uncompressed,
            rows,
        ))
    }

    fn stream_into(
        &self,
        sink: &mut ArtifactSink,
        partition: &PartitionInfo,
        schema: &ColumnSchema,
        cancel: &CancellationSignal,
        progress: &dyn ProgressObserver,
    ) -> Result<(u64, u64)> {
        let id = partition.id();
        let mut cursor = self
            .source
            .open_cursor(partition, schema)
            .map_err(|e| e.in_partition(&id, Stage::Extract))?;

        // No separate encode stage, so there is no uncompressed size to report.
        if self.format.compresses_internally() {
            let mut writer = self
                .format
                .new_writer(Box::new(&mut *sink), schema)
                .map_err(|e| e.in_partition(&id, Stage::Serialize))?;
            let rows = self.pump(cursor.as_mut(), writer.as_mut(), partition, cancel, progress)?;
            writer
                .close()
                .map_err(|e| e.in_partition(&id, Stage::Serialize))?;
            return Ok((rows, 0));
        }

        let mut encoder = self
            .compressor
            .new_writer(Box::new(&mut *sink), self.options.compression_level)
            .map_err(|e| e.in_partition(&id, Stage::Compress))?;
        let mut counting = CountingWriter::new(&mut encoder);
        let mut writer = self
            .format
            .new_writer(Box::new(&mut counting), schema)
            .map_err(|e| e.in_partition(&id, Stage::Serialize))?;
        let rows = self.pump(cursor.as_mut(), writer.as_mut(), partition, cancel, progress)?;
        writer
            .close()
            .map_err(|e| e.in_partition(&id, Stage::Serialize))?;
        let uncompressed = counting.count();
        encoder
            .finish()
            .map_err(|e| ArchiveError::from(e).in_partition(&id, Stage::Compress))?;
        Ok((rows, uncompressed))
    }

    /// Moves chunks from the cursor to the writer until the cursor is exhausted.
    fn pump(
        &self,
        cursor: &mut dyn RowCursor,
        writer: &mut dyn StreamWriter,
        partition: &PartitionInfo,
        cancel: &CancellationSignal,
        progress: &dyn ProgressObserver,
    ) -> Result<u64> {
        let id = partition.id();
        let mut buf = ChunkBuffer::with_capacity(self.options.chunk_size);
        let mut rows = 0u64;
        loop {
            cancel
                .check()
                .map_err(|e| e.in_partition(&id, Stage::Extract))?;
            buf.reset();
            let fetched = cursor
                .fetch_chunk(&mut buf)
                .map_err(|e| e.in_partition(&id, Stage::Extract))?;
            if fetched == 0 {
                break;
            }
            writer
                .write_chunk(buf.rows())
                .map_err(|e| e.in_partition(&id, Stage::Serialize))?;
            rows += fetched as u64;
            progress.on_chunk(partition, rows);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::compressor_for;
    use crate::format::{format_for, FormatOptions};
    use crate::ports::progress_port::NoopProgress;
    use crate::test_support::{sample_partition, sample_rows, sample_schema, ScriptedRowSource};
    use std::io::Read;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn extractor(source: Arc<ScriptedRowSource>, dir: &std::path::Path, format: &str, compression: &str) -> ChunkedExtractor {
        ChunkedExtractor::new(
            source,
            Arc::from(format_for(format, &FormatOptions::default()).unwrap()),
            Arc::from(compressor_for(compression, 0).unwrap()),
            ExtractorOptions {
                chunk_size: 4,
                compression_level: 3,
                temp_dir: dir.to_path_buf(),
                part_size: 1024,
            },
        )
    }

    fn files_in(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_extracts_and_compresses() {
        let dir = tempfile::tempdir().unwrap();
        let p = sample_partition(1);
        let source = Arc::new(ScriptedRowSource::new());
        source.set_rows(&p, sample_rows(10));

        let ex = extractor(source.clone(), dir.path(), "jsonl", "gzip");
        assert_eq!(ex.artifact_extension(), "jsonl.gz");
        let staged = ex
            .extract(&p, &sample_schema(), &CancellationSignal::new(), &NoopProgress)
            .unwrap();

        assert_eq!(staged.row_count, 10);
        let compressed = std::fs::read(staged.path()).unwrap();
        assert_eq!(compressed.len() as u64, staged.size);
        assert_eq!(staged.content_hash, crate::application::integrity::md5_hex(&compressed));

        let mut plain = String::new();
        flate2::read::GzDecoder::new(&compressed[..])
            .read_to_string(&mut plain)
            .unwrap();
        assert_eq!(plain.lines().count(), 10);
        assert_eq!(plain.len() as u64, staged.uncompressed_size);
        assert_eq!(source.opens(), 1);

        drop(staged);
        assert_eq!(files_in(dir.path()), 0);
    }

    #[test]
    fn test_parquet_bypasses_compressor() {
        let dir = tempfile::tempdir().unwrap();
        let p = sample_partition(2);
        let source = Arc::new(ScriptedRowSource::new());
        source.set_rows(&p, sample_rows(9));

        let ex = extractor(source, dir.path(), "parquet", "zstd");
        assert_eq!(ex.artifact_extension(), "parquet");
        let staged = ex
            .extract(&p, &sample_schema(), &CancellationSignal::new(), &NoopProgress)
            .unwrap();
        let data = std::fs::read(staged.path()).unwrap();
        assert_eq!(&data[..4], b"PAR1");
        assert_eq!(staged.size, data.len() as u64);
        assert_eq!(staged.uncompressed_size, 0);
    }

    #[test]
    fn test_mid_stream_failure_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = sample_partition(3);
        let source = Arc::new(ScriptedRowSource::new());
        source.set_rows(&p, sample_rows(20));
        source.fail_next_opens(1, 2, true);

        let ex = extractor(source, dir.path(), "csv", "zstd");
        let err = ex
            .extract(&p, &sample_schema(), &CancellationSignal::new(), &NoopProgress)
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.stage(), Some(Stage::Extract));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[test]
    fn test_cancellation_at_chunk_boundary() {
        struct CancelAfterFirstChunk(CancellationSignal, AtomicU64);
        impl ProgressObserver for CancelAfterFirstChunk {
            fn on_chunk(&self, _p: &PartitionInfo, rows: u64) {
                self.1.store(rows, Ordering::SeqCst);
                self.0.cancel();
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let p = sample_partition(4);
        let source = Arc::new(ScriptedRowSource::new());
        source.set_rows(&p, sample_rows(20));

        let cancel = CancellationSignal::new();
        let observer = CancelAfterFirstChunk(cancel.clone(), AtomicU64::new(0));
        let ex = extractor(source, dir.path(), "jsonl", "none");
        let err = ex.extract(&p, &sample_schema(), &cancel, &observer).unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(observer.1.load(Ordering::SeqCst), 4);
        assert_eq!(files_in(dir.path()), 0);
    }
}
